use crate::model::{ConditionalModel, ModelUpdate};
use crate::util::constants::EPSILON;
use crate::util::em_types::{CompatibilityStore, ShardSummary};
use crate::util::fragment_reader::FragmentSource;

/// What an E-step pass should do besides computing responsibilities.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepFlags {
    /// (re)compute the conditional probabilities from the fragments
    pub calc_con_prb: bool,
    /// feed the responsibilities into the shard's model accumulator
    pub update_model: bool,
    /// overwrite the stored scores with the final responsibilities
    pub calc_expected_weights: bool,
}

/// One worker's statically assigned partition of the fragments, along with
/// all the scratch state the worker mutates during a pass. Nothing here is
/// shared with any other shard.
pub struct Shard<S, U> {
    first_fragment: usize,
    store: CompatibilityStore,
    // noise score (or responsibility) of every fragment
    noise_probs: Vec<f64>,
    source: S,
    update: U,
    counts: Vec<f64>,
    num_degenerate: usize,
    fracs: Vec<f64>,
}

impl<S: FragmentSource, U: ModelUpdate> Shard<S, U> {
    /// `num_entries` is the length of the proportion vector (M + 1)
    pub fn new(
        first_fragment: usize,
        store: CompatibilityStore,
        mut source: S,
        update: U,
        num_entries: usize,
    ) -> anyhow::Result<Self> {
        source.locate(first_fragment)?;
        let n = store.num_fragments();
        Ok(Self {
            first_fragment,
            store,
            noise_probs: vec![0.0_f64; n],
            source,
            update,
            counts: vec![0.0_f64; num_entries],
            num_degenerate: 0,
            fracs: Vec::new(),
        })
    }

    /// Compute the responsibilities of every fragment of this shard under
    /// the proportions `theta`, accumulating them into the shard's counts.
    pub fn e_step<M>(&mut self, model: &M, theta: &[f64], flags: StepFlags) -> anyhow::Result<()>
    where
        M: ConditionalModel<Update = U>,
    {
        let Self {
            store,
            noise_probs,
            source,
            update,
            counts,
            num_degenerate,
            fracs,
            ..
        } = self;
        assert_eq!(theta.len(), counts.len());

        let need_frags = flags.calc_con_prb || flags.update_model;
        if need_frags {
            source.reset()?;
        }
        if flags.update_model {
            update.clear();
        }
        counts.fill(0.0_f64);
        *num_degenerate = 0;

        for i in 0..store.num_fragments() {
            let frag = if need_frags {
                Some(source.next_fragment()?)
            } else {
                None
            };
            let hits = store.hits_for_mut(i);

            if flags.calc_con_prb {
                if let Some(f) = frag.as_ref() {
                    noise_probs[i] = model.noise_con_prb(f);
                    for h in hits.iter_mut() {
                        h.con_prb = model.con_prb(f, h);
                    }
                }
            }

            fracs.clear();
            let mut sum = 0.0_f64;
            let w = theta[0] * noise_probs[i];
            let w = if w < EPSILON { 0.0 } else { w };
            fracs.push(w);
            sum += w;
            for h in hits.iter() {
                let w = theta[h.tid()] * h.con_prb;
                let w = if w < EPSILON { 0.0 } else { w };
                fracs.push(w);
                sum += w;
            }

            if sum >= EPSILON {
                fracs[0] /= sum;
                counts[0] += fracs[0];
                if flags.update_model {
                    if let Some(f) = frag.as_ref() {
                        update.update_noise(f, fracs[0]);
                    }
                }
                if flags.calc_expected_weights {
                    noise_probs[i] = fracs[0];
                }
                for (h, frac) in hits.iter_mut().zip(fracs[1..].iter_mut()) {
                    *frac /= sum;
                    counts[h.tid()] += *frac;
                    if flags.update_model {
                        if let Some(f) = frag.as_ref() {
                            update.update(f, h, *frac);
                        }
                    }
                    if flags.calc_expected_weights {
                        h.con_prb = *frac;
                    }
                }
            } else {
                // the fragment cannot be assigned under the current
                // proportions; it contributes nothing this round.
                *num_degenerate += 1;
                if flags.calc_expected_weights {
                    noise_probs[i] = 0.0;
                    hits.iter_mut().for_each(|h| h.con_prb = 0.0);
                }
            }
        }
        Ok(())
    }

    pub fn counts(&self) -> &[f64] {
        &self.counts
    }

    pub fn update(&self) -> &U {
        &self.update
    }

    pub fn store(&self) -> &CompatibilityStore {
        &self.store
    }

    pub fn noise_probs(&self) -> &[f64] {
        &self.noise_probs
    }

    /// number of fragments that could not be assigned in the last pass
    pub fn num_degenerate(&self) -> usize {
        self.num_degenerate
    }

    pub fn summary(&self) -> ShardSummary {
        ShardSummary {
            first_fragment: self.first_fragment,
            num_fragments: self.store.num_fragments(),
            num_hits: self.store.num_hits(),
        }
    }
}
