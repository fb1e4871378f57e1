/// Any weight, responsibility or normalizing mass below this value is
/// treated as exactly zero.
pub const EPSILON: f64 = 1e-300_f64;

/// Only entries whose previous value is at least this large take part in
/// the relative-change convergence test.
pub const CHANGE_PRIOR_FLOOR: f64 = 1e-7_f64;

/// Relative change at or above which an entry is considered unconverged.
pub const STOP_CRITERIA: f64 = 1e-3_f64;

pub const MIN_ROUND: u32 = 20;
pub const MAX_ROUND: u32 = 10_000;

/// Effective lengths below this value are forced to zero.
pub const MIN_EFFECTIVE_LEN: f64 = 1.0_f64;

/// The model is relearned every round up to (and including) this one...
pub const RELEARN_WARMUP_ROUNDS: u32 = 20;
/// ... and on every round divisible by this value afterwards.
pub const RELEARN_PERIOD: u32 = 100;

/// Lower bound of the initial noise proportion.
pub const MIN_INIT_NOISE: f64 = 1e-8_f64;
