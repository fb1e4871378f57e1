pub mod constants;
pub mod em_types;
pub mod fragment_reader;
pub mod read_function;
pub mod write_function;
