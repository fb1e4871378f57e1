use bio_types::strand::Strand;
use serde::Serialize;
use tracing::{info, trace};

use crate::model::length_dist::LengthDist;
use crate::model::{ConditionalModel, ModelParams, ModelUpdate};
use crate::util::constants::EPSILON;
use crate::util::em_types::{Fragment, Hit, ReadType, Transcripts};

const INIT_ERROR_RATE: f64 = 0.01_f64;
const MIN_ERROR_RATE: f64 = 1e-5_f64;
const MAX_ERROR_RATE: f64 = 0.5_f64;

/// Scores a fragment against a hit from the fragment length, the number
/// of available start positions, the strand and the mismatches of the
/// alignment. Quality-aware read types derive the per-base error rate from
/// the fragment's mean quality, the others learn one global rate.
#[derive(Debug, Clone)]
pub struct AlignmentModel {
    read_type: ReadType,
    prob_f: f64,
    seed_len: u32,
    estimate_fld: bool,
    fld: LengthDist,
    error_rate: f64,
    // total length of every transcript, indexed by transcript id
    tot_lens: Vec<u32>,
    agg: AlignmentModelUpdate,
}

/// The learned parameters of an [AlignmentModel]. `fld_pdf[i]` is the
/// probability of length `fld_min_len + i`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub read_type: ReadType,
    pub prob_f: f64,
    pub error_rate: f64,
    pub estimate_fld: bool,
    pub fld_min_len: u32,
    pub fld_max_len: u32,
    pub fld_pdf: Vec<f64>,
}

/// Responsibility-weighted fragment lengths and mismatch rates
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentModelUpdate {
    lb: u32,
    len_counts: Vec<f64>,
    mismatches: f64,
    bases: f64,
}

impl AlignmentModelUpdate {
    fn new(fld: &LengthDist) -> Self {
        Self {
            lb: fld.lb(),
            len_counts: vec![0.0_f64; fld.span() + 1],
            mismatches: 0.0_f64,
            bases: 0.0_f64,
        }
    }

    fn merge(&mut self, other: &Self) {
        for (a, b) in self.len_counts.iter_mut().zip(&other.len_counts) {
            *a += b;
        }
        self.mismatches += other.mismatches;
        self.bases += other.bases;
    }
}

impl ModelUpdate for AlignmentModelUpdate {
    fn clear(&mut self) {
        self.len_counts.fill(0.0_f64);
        self.mismatches = 0.0_f64;
        self.bases = 0.0_f64;
    }

    fn update_noise(&mut self, _frag: &Fragment, _frac: f64) {}

    fn update(&mut self, frag: &Fragment, hit: &Hit, frac: f64) {
        if hit.frag_len > self.lb {
            let i = (hit.frag_len - self.lb) as usize;
            if let Some(c) = self.len_counts.get_mut(i) {
                *c += frac;
            }
        }
        let len = frag.seq_len() as f64;
        self.mismatches += frac * (hit.mismatches as f64).min(len);
        self.bases += frac * len;
    }
}

impl AlignmentModel {
    pub fn new(
        read_type: ReadType,
        params: &ModelParams,
        txps: &Transcripts,
    ) -> anyhow::Result<Self> {
        let (lo, hi) = if read_type.is_paired() {
            (params.mate_min_len, params.mate_max_len)
        } else {
            (params.min_len, params.max_len)
        };
        if !(0.0..=1.0).contains(&params.prob_f) {
            anyhow::bail!(
                "the forward strand probability must be in [0, 1], but it was {}",
                params.prob_f
            );
        }
        let fld = if params.sd > 0.0 {
            LengthDist::normal(lo, hi, params.mean, params.sd)?
        } else {
            LengthDist::uniform(lo, hi)?
        };
        let mut tot_lens = Vec::with_capacity(txps.len() + 1);
        tot_lens.push(0);
        tot_lens.extend(txps.iter().map(|t| t.tot_len));

        let agg = AlignmentModelUpdate::new(&fld);
        Ok(Self {
            read_type,
            prob_f: params.prob_f,
            seed_len: params.seed_len,
            estimate_fld: params.estimate_fld,
            fld,
            error_rate: INIT_ERROR_RATE,
            tot_lens,
            agg,
        })
    }

    pub fn error_rate(&self) -> f64 {
        self.error_rate
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            read_type: self.read_type,
            prob_f: self.prob_f,
            error_rate: self.error_rate,
            estimate_fld: self.estimate_fld,
            fld_min_len: self.fld.lb() + 1,
            fld_max_len: self.fld.ub(),
            fld_pdf: self.fld.pdf()[1..].to_vec(),
        }
    }

    #[inline(always)]
    fn fragment_error_rate(&self, frag: &Fragment) -> f64 {
        match (self.read_type.has_quality(), frag.mean_qual) {
            (true, Some(q)) => 10_f64
                .powf(-(q as f64) / 10.0)
                .clamp(MIN_ERROR_RATE, MAX_ERROR_RATE),
            _ => self.error_rate,
        }
    }

    #[inline(always)]
    fn strand_prob(&self, strand: Strand) -> f64 {
        match strand {
            Strand::Forward => self.prob_f,
            Strand::Reverse => 1.0 - self.prob_f,
            Strand::Unknown => 0.5,
        }
    }
}

impl ConditionalModel for AlignmentModel {
    type Update = AlignmentModelUpdate;

    fn new_update(&self) -> Self::Update {
        AlignmentModelUpdate::new(&self.fld)
    }

    fn noise_con_prb(&self, frag: &Fragment) -> f64 {
        0.25_f64.powi(frag.seq_len() as i32) / self.fld.span() as f64
    }

    fn con_prb(&self, frag: &Fragment, hit: &Hit) -> f64 {
        let tlen = match self.tot_lens.get(hit.tid()) {
            Some(&l) if hit.tid > 0 => l,
            _ => return 0.0,
        };
        if hit.frag_len == 0 || hit.pos as u64 + hit.frag_len as u64 > tlen as u64 {
            return 0.0;
        }
        let len_prob = self.fld.prob(hit.frag_len);
        if len_prob <= 0.0 {
            return 0.0;
        }
        let start_prob = 1.0 / (tlen - hit.frag_len + 1) as f64;

        let e = self.fragment_error_rate(frag);
        let seq_len = frag.seq_len();
        let mm = hit.mismatches.min(seq_len);
        let seq_prob = (e / 3.0).powi(mm as i32) * (1.0 - e).powi((seq_len - mm) as i32);

        self.strand_prob(hit.strand) * len_prob * start_prob * seq_prob
    }

    fn init_aggregate(&mut self) {
        self.agg.clear();
    }

    fn collect(&mut self, update: &Self::Update) {
        self.agg.merge(update);
    }

    fn finish(&mut self) {
        if self.estimate_fld && self.fld.set_from_counts(&self.agg.len_counts) {
            trace!("relearned the fragment length distribution");
        }
        if !self.read_type.has_quality() && self.agg.bases >= EPSILON {
            self.error_rate =
                (self.agg.mismatches / self.agg.bases).clamp(MIN_ERROR_RATE, MAX_ERROR_RATE);
            trace!("relearned the sequencing error rate: {}", self.error_rate);
        }
    }

    fn estimate_from_unique<'a, I: Iterator<Item = &'a Hit>>(&mut self, hits: I) -> usize {
        if !self.estimate_fld {
            return 0;
        }
        let mut counts = vec![0.0_f64; self.fld.span() + 1];
        let mut used = 0_usize;
        for h in hits {
            if let Some(i) = self.fld.index_of(h.frag_len) {
                counts[i] += 1.0;
                used += 1;
            }
        }
        if self.fld.set_from_counts(&counts) {
            info!(
                "estimated the initial length distribution from {} uniquely aligned fragments.",
                used
            );
        }
        used
    }

    fn length_dist(&self) -> &LengthDist {
        &self.fld
    }

    fn mappability_weights(&self) -> Vec<f64> {
        let lb = self.fld.lb();
        let ub = self.fld.ub();
        let cdf = self.fld.cdf();
        let mut mw = Vec::with_capacity(self.tot_lens.len());
        mw.push(1.0_f64);
        for &tlen in &self.tot_lens[1..] {
            if tlen < self.seed_len || tlen <= lb {
                mw.push(0.0_f64);
            } else {
                mw.push(cdf[(tlen.min(ub) - lb) as usize]);
            }
        }
        mw
    }
}
