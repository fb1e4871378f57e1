use num_format::{Locale, ToFormattedString};
use rayon::iter::{IntoParallelRefMutIterator, ParallelIterator};
use serde::Serialize;
use tracing::{info, span, trace, warn};

use crate::effective_length::expected_effective_lengths;
use crate::model::ConditionalModel;
use crate::shard::{Shard, StepFlags};
use crate::util::constants::{CHANGE_PRIOR_FLOOR, EPSILON, MIN_EFFECTIVE_LEN, MIN_INIT_NOISE};
use crate::util::em_types::{
    CompatibilityStore, EmOptions, RunCounts, ShardSummary, Transcripts, shard_table,
};
use crate::util::fragment_reader::FragmentSource;

/// Everything the engine hands to the results writers.
#[derive(Debug, Clone)]
pub struct EmResult {
    /// fragment-origin proportions at convergence, before any correction
    pub theta_converged: Vec<f64>,
    /// final nucleotide-sampling proportions
    pub theta: Vec<f64>,
    /// expected effective length of every transcript (entry 0 unused)
    pub eel: Vec<f64>,
    /// expected number of fragments from each origin (entry 0 is noise)
    pub expected_counts: Vec<f64>,
    pub stats: EmStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmStats {
    pub rounds: u32,
    pub converged: bool,
    pub biggest_change: f64,
    pub num_unconverged: usize,
}

/// Largest relative change between `prior` and `curr` over the entries
/// whose prior value is at least `CHANGE_PRIOR_FLOOR`, and the number of
/// those entries whose change reaches `stop_criteria`.
pub fn relative_change(prior: &[f64], curr: &[f64], stop_criteria: f64) -> (f64, usize) {
    let mut biggest = 0.0_f64;
    let mut num_over = 0_usize;
    for (&p, &c) in prior.iter().zip(curr) {
        if p >= CHANGE_PRIOR_FLOOR {
            let change = (c - p).abs() / p;
            if change >= stop_criteria {
                num_over += 1;
            }
            biggest = biggest.max(change);
        }
    }
    (biggest, num_over)
}

/// The starting proportions: the observed fraction of unalignable
/// fragments for noise, and the remaining mass spread evenly over the
/// transcripts.
pub fn initial_theta(counts: &RunCounts, num_transcripts: usize) -> anyhow::Result<Vec<f64>> {
    if num_transcripts == 0 {
        anyhow::bail!("there are no transcripts to quantify");
    }
    if counts.n_tot <= counts.n2 {
        anyhow::bail!(
            "the total number of fragments ({}) must exceed the number of filtered fragments ({})",
            counts.n_tot,
            counts.n2
        );
    }
    let mut theta = vec![0.0_f64; num_transcripts + 1];
    theta[0] = (counts.n0 as f64 / (counts.n_tot - counts.n2) as f64).max(MIN_INIT_NOISE);
    let val = (1.0 - theta[0]) / num_transcripts as f64;
    theta[1..].fill(val);
    Ok(theta)
}

/// Zero the proportion of every transcript that cannot be sampled under
/// the fragment length model and renormalize, keeping the noise mass.
pub fn correct_for_effective_length(theta: &mut [f64], eel: &[f64]) -> anyhow::Result<()> {
    let mut txp_mass = 0.0_f64;
    for (t, &l) in theta[1..].iter_mut().zip(&eel[1..]) {
        if l < EPSILON {
            *t = 0.0;
        } else {
            txp_mass += *t;
        }
    }
    if txp_mass < EPSILON {
        anyhow::bail!(
            "No transcript with an expected effective length of at least {} retains any abundance!",
            MIN_EFFECTIVE_LEN
        );
    }
    let sum = theta[0] + txp_mass;
    theta.iter_mut().for_each(|t| *t /= sum);
    Ok(())
}

/// Turn fragment-origin proportions into nucleotide-sampling proportions
/// by dividing out the mappability weight of every entry; entries whose
/// weight is numerically zero are zeroed.
pub fn apply_mappability(theta: &mut [f64], mw: &[f64]) -> anyhow::Result<()> {
    assert_eq!(theta.len(), mw.len());
    let mut sum = 0.0_f64;
    for (t, &w) in theta.iter_mut().zip(mw) {
        *t = if w < EPSILON { 0.0 } else { *t / w };
        sum += *t;
    }
    if sum < EPSILON {
        anyhow::bail!("no mass remains after the mappability correction");
    }
    theta.iter_mut().for_each(|t| *t /= sum);
    Ok(())
}

/// Owns the proportion vector, the shards and the master model, and drives
/// the EM rounds.
pub struct EmEngine<M: ConditionalModel, S> {
    model: M,
    shards: Vec<Shard<S, M::Update>>,
    pool: rayon::ThreadPool,
    opts: EmOptions,
    run_counts: RunCounts,
    theta: Vec<f64>,
    countv: Vec<f64>,
    need_calc_con_prb: bool,
}

impl<M: ConditionalModel, S: FragmentSource> EmEngine<M, S> {
    /// Build one shard per compatibility store; `make_source` is called
    /// once per shard to open that shard's private fragment source.
    pub fn new<F>(
        model: M,
        stores: Vec<CompatibilityStore>,
        mut make_source: F,
        opts: EmOptions,
        run_counts: RunCounts,
        num_transcripts: usize,
    ) -> anyhow::Result<Self>
    where
        F: FnMut() -> anyhow::Result<S>,
    {
        if stores.is_empty() {
            anyhow::bail!("at least one shard is required");
        }
        let num_fragments: usize = stores.iter().map(|s| s.num_fragments()).sum();
        if num_fragments as u64 != run_counts.n1 {
            anyhow::bail!(
                "the shards hold {} fragments, but {} alignable fragments were counted",
                num_fragments,
                run_counts.n1
            );
        }
        let theta = initial_theta(&run_counts, num_transcripts)?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(stores.len())
            .build()?;

        let mut shards = Vec::with_capacity(stores.len());
        let mut first_fragment = 0_usize;
        for store in stores {
            let n = store.num_fragments();
            let update = model.new_update();
            shards.push(Shard::new(
                first_fragment,
                store,
                make_source()?,
                update,
                num_transcripts + 1,
            )?);
            first_fragment += n;
        }

        Ok(Self {
            model,
            shards,
            pool,
            opts,
            run_counts,
            theta,
            countv: vec![0.0_f64; num_transcripts + 1],
            need_calc_con_prb: true,
        })
    }

    pub fn theta(&self) -> &[f64] {
        &self.theta
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn shards(&self) -> &[Shard<S, M::Update>] {
        &self.shards
    }

    pub fn shard_summaries(&self) -> Vec<ShardSummary> {
        self.shards.iter().map(|s| s.summary()).collect()
    }

    /// Let the model seed its parameters from the uniquely aligned
    /// fragments.
    pub fn estimate_from_unique(&mut self) -> usize {
        let Self { model, shards, .. } = self;
        let unique_hits = shards
            .iter()
            .flat_map(|s| s.store().iter())
            .filter(|hits| hits.len() == 1)
            .flatten();
        let used = model.estimate_from_unique(unique_hits);
        self.need_calc_con_prb = true;
        used
    }

    /// Run the E-step of every shard in parallel and wait for all of them.
    fn run_e_step(&mut self, flags: StepFlags) -> anyhow::Result<()> {
        let model = &self.model;
        let theta = &self.theta;
        let shards = &mut self.shards;
        self.pool
            .install(|| shards.par_iter_mut().try_for_each(|s| s.e_step(model, theta, flags)))?;
        if flags.calc_con_prb {
            self.need_calc_con_prb = false;
        }
        let degenerate: usize = self.shards.iter().map(|s| s.num_degenerate()).sum();
        if degenerate > 0 {
            trace!("{} fragments could not be assigned in this pass", degenerate);
        }
        Ok(())
    }

    /// Sum the shard-local counts and add the fragments that failed to
    /// align at all to the noise entry. Returns the total mass.
    fn reduce_counts(&mut self) -> f64 {
        self.countv.fill(0.0_f64);
        for s in &self.shards {
            for (c, x) in self.countv.iter_mut().zip(s.counts()) {
                *c += x;
            }
        }
        self.countv[0] += self.run_counts.n0 as f64;
        self.countv.iter().sum()
    }

    /// Reduce the counts and re-estimate the proportions from them.
    fn m_step(&mut self) -> anyhow::Result<f64> {
        let sum = self.reduce_counts();
        if sum < EPSILON {
            anyhow::bail!("the total expected count is zero; there is no alignable evidence");
        }
        for (t, c) in self.theta.iter_mut().zip(&self.countv) {
            *t = c / sum;
        }
        Ok(sum)
    }

    /// Merge the accumulators of all shards into the master model and
    /// re-estimate its parameters; the scores are stale afterwards.
    fn relearn_model(&mut self) {
        self.model.init_aggregate();
        for s in &self.shards {
            self.model.collect(s.update());
        }
        self.model.finish();
        self.need_calc_con_prb = true;
    }

    /// Iterate E and M steps until the proportions converge or the round
    /// limit is reached.
    pub fn run(&mut self) -> anyhow::Result<EmStats> {
        let span = span!(tracing::Level::INFO, "em");
        let _guard = span.enter();

        info!("{}", shard_table(&self.shard_summaries()));

        let mut round = 0_u32;
        let mut prior = self.theta.clone();
        let (mut biggest, mut num_over);
        loop {
            round += 1;
            let update_model = self.opts.relearn_in_round(round);
            prior.copy_from_slice(&self.theta);

            self.run_e_step(StepFlags {
                calc_con_prb: self.need_calc_con_prb,
                update_model,
                calc_expected_weights: false,
            })?;
            let sum = self.m_step()?;
            if update_model {
                self.relearn_model();
            }

            (biggest, num_over) = relative_change(&prior, &self.theta, self.opts.stop_criteria);

            if round % 100 == 0 {
                info!(
                    "round {}; sum {}; biggest change {}; {} entries unconverged",
                    round.to_formatted_string(&Locale::en),
                    sum,
                    biggest,
                    num_over
                );
            } else {
                trace!(
                    "round {}; sum {}; biggest change {}; {} entries unconverged",
                    round, sum, biggest, num_over
                );
            }

            let keep_going = round < self.opts.min_rounds
                || (num_over > 0 && round < self.opts.max_rounds);
            if !keep_going {
                break;
            }
        }

        let converged = num_over == 0;
        if converged {
            info!("the EM converged after {} rounds.", round);
        } else {
            warn!(
                "reached {} rounds before meeting the convergence criteria; proceeding with the last estimates.",
                round
            );
        }
        Ok(EmStats {
            rounds: round,
            converged,
            biggest_change: biggest,
            num_unconverged: num_over,
        })
    }

    /// Apply the post-convergence corrections: effective lengths,
    /// renormalization, one final expected-weight pass and the mappability
    /// correction. Afterwards every stored score holds its final
    /// responsibility.
    pub fn finalize(&mut self, txps: &Transcripts, stats: EmStats) -> anyhow::Result<EmResult> {
        let theta_converged = self.theta.clone();

        let eel = expected_effective_lengths(self.model.length_dist(), txps)?;
        correct_for_effective_length(&mut self.theta, &eel)?;

        self.run_e_step(StepFlags {
            calc_con_prb: self.need_calc_con_prb,
            update_model: false,
            calc_expected_weights: true,
        })?;
        self.reduce_counts();

        let mw = self.model.mappability_weights();
        apply_mappability(&mut self.theta, &mw)?;

        Ok(EmResult {
            theta_converged,
            theta: self.theta.clone(),
            eel,
            expected_counts: self.countv.clone(),
            stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::tests::{TableModel, frag, hit};
    use crate::util::em_types::{Fragment, Hit, TranscriptInfo};
    use crate::util::fragment_reader::InMemoryFragments;
    use std::sync::Arc;

    fn counts(n0: u64, n1: u64) -> RunCounts {
        RunCounts {
            n0,
            n1,
            n2: 0,
            n_tot: n0 + n1,
        }
    }

    fn engine(
        model: TableModel,
        frags: &[(&str, Vec<Hit>)],
        num_shards: usize,
        n0: u64,
        m: usize,
        opts: EmOptions,
    ) -> EmEngine<TableModel, InMemoryFragments> {
        let all: Arc<Vec<Fragment>> = Arc::new(frags.iter().map(|(n, _)| frag(n)).collect());
        let per = frags.len().div_ceil(num_shards);
        let stores: Vec<CompatibilityStore> = frags
            .chunks(per)
            .map(|c| {
                let mut s = CompatibilityStore::new();
                for (_, h) in c {
                    s.push_fragment(h.clone());
                }
                s
            })
            .collect();
        EmEngine::new(
            model,
            stores,
            || Ok(InMemoryFragments::new(all.clone())),
            opts,
            counts(n0, frags.len() as u64),
            m,
        )
        .unwrap()
    }

    fn txps(lens: &[u32]) -> Transcripts {
        let v = lens
            .iter()
            .enumerate()
            .map(|(i, &l)| TranscriptInfo {
                transcript_id: format!("t{}", i + 1),
                gene_id: "g".to_string(),
                full_len: l,
                tot_len: l,
            })
            .collect();
        Transcripts::new(v, vec![1, lens.len() + 1])
    }

    fn mixed_dataset() -> (TableModel, Vec<(&'static str, Vec<Hit>)>) {
        let mut model = TableModel::new(3);
        let mut frags = vec![];
        let names = [
            "a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k", "l",
        ];
        for (i, n) in names.iter().enumerate() {
            let hits = match i % 4 {
                0 => vec![hit(1)],
                1 => vec![hit(1), hit(2)],
                2 => vec![hit(2), hit(3)],
                _ => vec![hit(1), hit(2), hit(3)],
            };
            for h in &hits {
                model = model.score(n, h.tid, 0.1 * (1 + (i + h.tid as usize) % 3) as f64);
            }
            model = model.noise(n, 1e-3);
            frags.push((*n, hits));
        }
        (model, frags)
    }

    fn sum(v: &[f64]) -> f64 {
        v.iter().sum()
    }

    #[test]
    fn initial_theta_uses_unaligned_fraction() {
        let t = initial_theta(&counts(25, 75), 3).unwrap();
        assert!((t[0] - 0.25).abs() < 1e-12);
        assert!((t[1] - 0.25).abs() < 1e-12);
        let t = initial_theta(&counts(0, 10), 2).unwrap();
        assert_eq!(t[0], MIN_INIT_NOISE);
        assert!(initial_theta(&counts(0, 0), 2).is_err());
        assert!(initial_theta(&counts(1, 1), 0).is_err());
    }

    #[test]
    fn relative_change_skips_tiny_priors() {
        let (b, n) = relative_change(&[1e-9, 0.5, 0.5], &[0.2, 0.5, 0.501], 1e-3);
        assert!((b - 2e-3).abs() < 1e-9);
        assert_eq!(n, 1);
        let (b, n) = relative_change(&[0.5, 0.5], &[0.5, 0.5], 1e-3);
        assert_eq!((b, n), (0.0, 0));
    }

    #[test]
    fn single_round_splits_evenly() {
        let model = TableModel::new(2).score("r", 1, 0.5).score("r", 2, 0.5);
        let opts = EmOptions::builder().min_rounds(1).max_rounds(1).build();
        let mut e = engine(model, &[("r", vec![hit(1), hit(2)])], 1, 0, 2, opts);
        e.theta = vec![0.1, 0.45, 0.45];
        e.run().unwrap();
        let t = e.theta();
        assert_eq!(t[0], 0.0);
        assert!((t[1] - 0.5).abs() < 1e-12);
        assert!((t[2] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn unaligned_fragments_are_noise() {
        let model = TableModel::new(1).noise("r", 0.9).score("r", 1, 0.1);
        let opts = EmOptions::builder().min_rounds(1).max_rounds(1).build();
        let mut e = engine(model, &[("r", vec![hit(1)])], 1, 2, 1, opts);
        e.theta = vec![0.5, 0.5];
        e.run().unwrap();
        // 0.9 from the fragment, plus the two unaligned ones, out of 3
        assert!((e.theta()[0] - 2.9 / 3.0).abs() < 1e-12);
        assert!((e.theta()[1] - 0.1 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn theta_stays_on_the_simplex() {
        let (model, frags) = mixed_dataset();
        let opts = EmOptions::builder().min_rounds(5).max_rounds(5).build();
        let mut e = engine(model, &frags, 3, 1, 3, opts);
        for _ in 0..5 {
            let round_opts = EmOptions::builder().min_rounds(1).max_rounds(1).build();
            e.opts = round_opts;
            e.run().unwrap();
            assert!((sum(e.theta()) - 1.0).abs() < 1e-9);
            assert!(e.theta().iter().all(|&t| (0.0..=1.0).contains(&t)));
        }
    }

    #[test]
    fn minimum_rounds_are_always_run() {
        // a single uniquely aligned fragment converges immediately
        let model = TableModel::new(1).score("r", 1, 1.0);
        let opts = EmOptions::builder().min_rounds(7).build();
        let mut e = engine(model, &[("r", vec![hit(1)])], 1, 0, 1, opts);
        let stats = e.run().unwrap();
        assert_eq!(stats.rounds, 7);
        assert!(stats.converged);
    }

    #[test]
    fn round_limit_stops_without_convergence() {
        let (model, frags) = mixed_dataset();
        let opts = EmOptions::builder()
            .min_rounds(1)
            .max_rounds(2)
            .stop_criteria(1e-12)
            .build();
        let mut e = engine(model, &frags, 2, 0, 3, opts);
        let stats = e.run().unwrap();
        assert_eq!(stats.rounds, 2);
        assert!(!stats.converged);
        assert!(stats.num_unconverged > 0);
    }

    #[test]
    fn sharding_does_not_change_the_result() {
        let run = |num_shards| {
            let (model, frags) = mixed_dataset();
            let opts = EmOptions::builder().min_rounds(50).max_rounds(50).build();
            let mut e = engine(model, &frags, num_shards, 1, 3, opts);
            // one worker per shard
            assert_eq!(e.pool.current_num_threads(), num_shards);
            e.run().unwrap();
            e.theta().to_vec()
        };
        let one = run(1);
        for num_shards in [2, 3, 4] {
            let many = run(num_shards);
            for (a, b) in one.iter().zip(&many) {
                assert!((a - b).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn converged_theta_is_a_near_fixed_point() {
        let (model, frags) = mixed_dataset();
        let opts = EmOptions::builder().build();
        let mut e = engine(model, &frags, 2, 1, 3, opts);
        let stats = e.run().unwrap();
        assert!(stats.converged);
        let before = e.theta().to_vec();
        e.opts = EmOptions::builder()
            .min_rounds(1)
            .max_rounds(1)
            .relearn_warmup(0)
            .relearn_period(0)
            .build();
        e.run().unwrap();
        let (_, num_over) = relative_change(&before, e.theta(), 1e-3);
        assert_eq!(num_over, 0);
    }

    #[test]
    fn relearning_merges_every_shard() {
        let (model, frags) = mixed_dataset();
        let opts = EmOptions::builder().min_rounds(3).max_rounds(3).build();
        let mut e = engine(model, &frags, 3, 0, 3, opts);
        e.run().unwrap();
        assert_eq!(e.model().finished, 3);
        assert_eq!(e.model().merged.len(), 3);
        // every fragment hands out a total responsibility of one
        assert!((sum(&e.model().merged) - frags.len() as f64).abs() < 1e-9);
    }

    #[test]
    fn unique_hits_are_offered_to_the_model() {
        let (model, frags) = mixed_dataset();
        let mut e = engine(model, &frags, 2, 0, 3, EmOptions::builder().build());
        assert_eq!(e.estimate_from_unique(), 3);
    }

    #[test]
    fn no_evidence_is_fatal() {
        let model = TableModel::new(1);
        let opts = EmOptions::builder().min_rounds(1).max_rounds(1).build();
        let mut e = engine(model, &[("r", vec![hit(1)])], 1, 0, 1, opts);
        assert!(e.run().is_err());
    }

    #[test]
    fn unsupported_transcripts_are_dropped() {
        let mut theta = vec![0.1, 0.3, 0.6];
        correct_for_effective_length(&mut theta, &[0.0, 0.0, 50.0]).unwrap();
        assert_eq!(theta[1], 0.0);
        assert!((theta[0] - 0.1 / 0.7).abs() < 1e-12);
        assert!((theta[2] - 0.6 / 0.7).abs() < 1e-12);

        let mut theta = vec![0.5, 0.5];
        assert!(correct_for_effective_length(&mut theta, &[0.0, 0.0]).is_err());
    }

    #[test]
    fn mappability_divides_out_weights() {
        let mut theta = vec![0.0, 0.4, 0.6];
        let mw = vec![1.0, 0.8, 1.0];
        // 0.4 / 0.8 = 0.5 before renormalization
        apply_mappability(&mut theta, &mw).unwrap();
        assert!((theta[1] - 0.5 / 1.1).abs() < 1e-12);
        assert!((theta[2] - 0.6 / 1.1).abs() < 1e-12);

        let mut theta = vec![0.2, 0.8];
        apply_mappability(&mut theta, &[1.0, 0.0]).unwrap();
        assert_eq!(theta, vec![1.0, 0.0]);
    }

    #[test]
    fn finalize_produces_expected_counts_and_weights() {
        let model = TableModel::new(2)
            .score("a", 1, 1.0)
            .score("b", 1, 1.0)
            .score("b", 2, 1.0)
            .score("c", 2, 1.0);
        let opts = EmOptions::builder().build();
        let frags = [
            ("a", vec![hit(1)]),
            ("b", vec![hit(1), hit(2)]),
            ("c", vec![hit(2)]),
        ];
        let mut e = engine(model, &frags, 2, 0, 2, opts);
        let stats = e.run().unwrap();
        let res = e.finalize(&txps(&[100, 100]), stats).unwrap();

        assert!((sum(&res.theta_converged) - 1.0).abs() < 1e-9);
        assert!((sum(&res.theta) - 1.0).abs() < 1e-9);
        assert!((sum(&res.expected_counts) - 3.0).abs() < 1e-9);
        assert!((res.expected_counts[1] - 1.5).abs() < 1e-6);
        assert!(res.eel[1] > 0.0);

        // the stored scores are responsibilities now
        for s in e.shards() {
            for hits in s.store().iter() {
                let total: f64 = hits.iter().map(|h| h.con_prb).sum();
                assert!((total - 1.0).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn short_transcript_loses_its_share() {
        let model = TableModel::new(2).score("a", 1, 1.0).score("b", 2, 1.0);
        let opts = EmOptions::builder().build();
        let frags = [("a", vec![hit(1)]), ("b", vec![hit(2)])];
        let mut e = engine(model, &frags, 1, 0, 2, opts);
        let stats = e.run().unwrap();
        // the fragment length support is 1..=10, so a 1 bp transcript has
        // an expected effective length of 0.1
        let res = e.finalize(&txps(&[1, 100]), stats).unwrap();
        assert_eq!(res.eel[1], 0.0);
        assert_eq!(res.theta[1], 0.0);
        assert!((res.theta[2] + res.theta[0] - 1.0).abs() < 1e-9);
        assert_eq!(res.expected_counts[1], 0.0);
    }
}
