use clap::Parser;
use path_tools::WithAdditionalExtension;
use serde::Serialize;
use std::path::PathBuf;

use crate::util::constants;
use crate::util::em_types::ReadType;

#[derive(Debug, Clone, clap::ValueEnum, Serialize)]
pub enum SamplerOut {
    Uncompressed,
    Compressed,
}

fn parse_sampler_out_value(s: &str) -> anyhow::Result<SamplerOut> {
    match s.to_lowercase().as_str() {
        "raw" => Ok(SamplerOut::Uncompressed),
        "uncompressed" => Ok(SamplerOut::Uncompressed),
        "compressed" => Ok(SamplerOut::Compressed),
        "lz4" => Ok(SamplerOut::Compressed),
        x => anyhow::bail!(
            "Cannot parse {} as a valid option for the sampler output",
            x
        ),
    }
}

fn parse_read_type(arg: &str) -> anyhow::Result<ReadType> {
    match arg.to_lowercase().as_str() {
        "0" | "single" | "se" => Ok(ReadType::Single),
        "1" | "single-qual" | "se-qual" => Ok(ReadType::SingleQual),
        "2" | "paired" | "pe" => Ok(ReadType::Paired),
        "3" | "paired-qual" | "pe-qual" => Ok(ReadType::PairedQual),
        x => anyhow::bail!("Cannot parse {} as a valid read type", x),
    }
}

/// estimate transcript abundances from ambiguously aligned sequencing fragments
#[derive(Parser, Debug, Serialize)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// be quiet (i.e. don't output log messages that aren't at least warnings)
    #[arg(long, conflicts_with = "verbose")]
    pub quiet: bool,

    /// be verbose (i.e. output all non-developer logging messages)
    #[arg(long)]
    pub verbose: bool,

    /// read type of the sample: 0 (single-end), 1 (single-end with
    /// qualities), 2 (paired-end) or 3 (paired-end with qualities)
    #[arg(short = 'r', long, value_parser = parse_read_type)]
    pub read_type: ReadType,

    /// prefix of the reference files; `<REFERENCE>.ti` must exist
    #[arg(long)]
    pub reference: PathBuf,

    /// prefix of the sample files; `<SAMPLE>.cnt`, `<SAMPLE>.mparams`,
    /// `<SAMPLE>.dat` and `<SAMPLE>.frag` must exist
    #[arg(long)]
    pub sample: PathBuf,

    /// path to the alignment stream, if not `<SAMPLE>.dat`; it may be
    /// compressed
    #[arg(short, long)]
    pub alignments: Option<PathBuf>,

    /// prefix of the output files
    #[arg(short, long)]
    pub output: PathBuf,

    /// number of worker threads (and shards) used by the EM. This is
    /// capped at the number of alignable fragments.
    #[arg(short = 'j', long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub threads: u32,

    /// write the final per-fragment responsibilities for a downstream
    /// sampler. If <SAMPLER_OUT> is present, it must be one of
    /// `uncompressed` (default) or `compressed`, which will cause the
    /// output file to be lz4 compressed.
    #[arg(
        long,
        help_heading = "output",
        default_missing_value = "uncompressed",
        num_args = 0..=1,
        require_equals = true,
        value_parser = parse_sampler_out_value
    )]
    pub sampler_out: Option<SamplerOut>,

    /// minimum number of EM rounds
    #[arg(long, help_heading = "EM", default_value_t = constants::MIN_ROUND)]
    pub min_rounds: u32,

    /// maximum number of EM rounds
    #[arg(long, help_heading = "EM", default_value_t = constants::MAX_ROUND)]
    pub max_rounds: u32,

    /// relative change at or above which an entry is considered
    /// unconverged
    #[arg(long, help_heading = "EM", default_value_t = constants::STOP_CRITERIA)]
    pub stop_criteria: f64,

    /// seed the fragment length distribution from the uniquely aligned
    /// fragments before the first round
    #[arg(long, help_heading = "EM")]
    pub seed_from_unique: bool,
}

impl Args {
    pub fn alignments_path(&self) -> PathBuf {
        match &self.alignments {
            Some(p) => p.clone(),
            None => self.sample.with_additional_extension(".dat"),
        }
    }
}
