//! The conditional-probability model that scores fragments against
//! transcripts (and against the background noise bucket), together with
//! the per-shard accumulators through which it is relearned.

pub mod alignment_model;
pub mod length_dist;

use serde::Serialize;

use crate::model::length_dist::LengthDist;
use crate::util::em_types::{Fragment, Hit};

/// Parameters handed to the model at construction, as recorded in the
/// `.mparams` file of a sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelParams {
    /// read length bounds
    pub min_len: u32,
    pub max_len: u32,
    /// probability that a fragment is sequenced from the forward strand
    pub prob_f: f64,
    /// relearn the fragment length distribution during the EM
    pub estimate_fld: bool,
    /// number of read-start bins (kept for provenance)
    pub num_bins: u32,
    /// fragment length bounds for paired-end data
    pub mate_min_len: u32,
    pub mate_max_len: u32,
    /// initial fragment length mean and standard deviation; a
    /// non-positive sd selects a uniform initial distribution
    pub mean: f64,
    pub sd: f64,
    /// transcripts shorter than this cannot be aligned to at all
    pub seed_len: u32,
}

/// Per-shard sufficient statistics, filled during an E-step and merged
/// into the model after all shards have finished.
pub trait ModelUpdate: Send {
    fn clear(&mut self);
    fn update_noise(&mut self, frag: &Fragment, frac: f64);
    fn update(&mut self, frag: &Fragment, hit: &Hit, frac: f64);
}

pub trait ConditionalModel: Sync {
    type Update: ModelUpdate;

    fn new_update(&self) -> Self::Update;

    /// likelihood of `frag` under the background (noise) origin
    fn noise_con_prb(&self, frag: &Fragment) -> f64;

    /// likelihood of `frag` having originated at `hit`
    fn con_prb(&self, frag: &Fragment, hit: &Hit) -> f64;

    /// reset the aggregate statistics prior to a round of `collect` calls
    fn init_aggregate(&mut self);

    /// merge a shard's statistics; the order of calls does not matter
    fn collect(&mut self, update: &Self::Update);

    /// re-estimate the parameters from the merged statistics
    fn finish(&mut self);

    /// Seed the parameters from hits of fragments that align uniquely,
    /// before the first round. Returns the number of hits that were used.
    fn estimate_from_unique<'a, I: Iterator<Item = &'a Hit>>(&mut self, hits: I) -> usize;

    fn length_dist(&self) -> &LengthDist;

    /// weights (size M + 1) converting fragment-origin proportions into
    /// nucleotide-sampling proportions
    fn mappability_weights(&self) -> Vec<f64>;
}
