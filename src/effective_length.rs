use tracing::{info, trace};

use crate::model::length_dist::LengthDist;
use crate::util::constants::MIN_EFFECTIVE_LEN;
use crate::util::em_types::Transcripts;

/// Compute, for every transcript, the expected number of positions at
/// which a fragment drawn from `dist` can start.
///
/// A fragment of length `l` has `tot_len - l + 1` valid starts, but never
/// more than `full_len` (starting inside an appended tail is not allowed).
/// With `clen[i] = sum_{j <= i} pdf[j] * (lb + j)`, the expectation over the
/// support intersected with `[1, tot_len]` has the closed form
///
/// `full_len * cdf[p1] + (cdf[p2] - cdf[p1]) * (tot_len + 1) - (clen[p2] - clen[p1])`
///
/// where `p1` and `p2` are the positions of `tot_len - full_len + 1` and
/// `tot_len` clamped to `[0, span]`. Results below the minimum effective
/// length are set to zero. Entry 0 (noise) is always zero.
pub fn expected_effective_lengths(
    dist: &LengthDist,
    txps: &Transcripts,
) -> anyhow::Result<Vec<f64>> {
    let lb = dist.lb() as i64;
    let ub = dist.ub() as i64;
    let span = dist.span();
    let pdf = dist.pdf();
    let cdf = dist.cdf();

    let mut clen = vec![0.0_f64; span + 1];
    for i in 1..=span {
        clen[i] = clen[i - 1] + pdf[i] * (lb + i as i64) as f64;
    }

    let clamp_pos = |x: i64| -> usize { (x.min(ub) - lb).max(0) as usize };

    let mut eel = vec![0.0_f64; txps.len() + 1];
    let mut num_zeroed = 0_usize;
    for (tid, t) in txps.iter().enumerate().map(|(i, t)| (i + 1, t)) {
        let tot_len = t.tot_len as i64;
        let full_len = t.full_len as i64;
        let pos1 = clamp_pos(tot_len - full_len + 1);
        let pos2 = clamp_pos(tot_len);

        if pos2 == 0 {
            num_zeroed += 1;
            continue;
        }

        let v = full_len as f64 * cdf[pos1]
            + ((cdf[pos2] - cdf[pos1]) * (tot_len + 1) as f64 - (clen[pos2] - clen[pos1]));
        if v < 0.0 {
            anyhow::bail!(
                "negative expected effective length ({}) for transcript {}; the fragment length distribution is inconsistent",
                v,
                t.transcript_id
            );
        }
        if v < MIN_EFFECTIVE_LEN {
            trace!(
                "transcript {} has effective length {} and cannot be sampled",
                t.transcript_id,
                v
            );
            num_zeroed += 1;
        } else {
            eel[tid] = v;
        }
    }
    info!(
        "{} of {} transcripts have an expected effective length below {}.",
        num_zeroed,
        txps.len(),
        MIN_EFFECTIVE_LEN
    );
    Ok(eel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::em_types::TranscriptInfo;

    fn txps(lens: &[(u32, u32)]) -> Transcripts {
        let v = lens
            .iter()
            .enumerate()
            .map(|(i, &(full_len, tot_len))| TranscriptInfo {
                transcript_id: format!("t{}", i + 1),
                gene_id: "g".to_string(),
                full_len,
                tot_len,
            })
            .collect();
        Transcripts::new(v, vec![1, lens.len() + 1])
    }

    // direct summation of (available starts) x pdf over the support
    fn brute_force(dist: &LengthDist, full_len: u32, tot_len: u32) -> f64 {
        let mut s = 0.0;
        for l in (dist.lb() + 1)..=dist.ub().min(tot_len) {
            let starts = (tot_len - l + 1).min(full_len) as f64;
            s += dist.prob(l) * starts;
        }
        s
    }

    #[test]
    fn closed_form_matches_summation() {
        let dist = LengthDist::normal(50, 400, 200.0, 40.0).unwrap();
        let t = txps(&[(1000, 1000), (300, 300), (180, 180), (500, 625)]);
        let eel = expected_effective_lengths(&dist, &t).unwrap();
        assert_eq!(eel[0], 0.0);
        for (tid, &(f, l)) in [(1000, 1000), (300, 300), (180, 180), (500, 625)]
            .iter()
            .enumerate()
        {
            let expected = brute_force(&dist, f, l);
            assert!(
                (eel[tid + 1] - expected).abs() < 1e-6 * expected.max(1.0),
                "transcript {}: {} vs {}",
                tid + 1,
                eel[tid + 1],
                expected
            );
        }
    }

    #[test]
    fn uniform_lengths_on_long_transcript() {
        // lengths 1..=4 equally likely on a 10 bp transcript:
        // (10 + 9 + 8 + 7) / 4
        let dist = LengthDist::uniform(1, 4).unwrap();
        let eel = expected_effective_lengths(&dist, &txps(&[(10, 10)])).unwrap();
        assert!((eel[1] - 8.5).abs() < 1e-12);
    }

    #[test]
    fn negative_effective_length_is_fatal() {
        // a 2 bp transcript under a distribution with negative mass on
        // length 1: 2 * cdf[1] = -2
        let dist = LengthDist::from_pdf_unchecked(0, vec![0.0, -1.0, 0.0, 0.0, 2.0]);
        let res = expected_effective_lengths(&dist, &txps(&[(2, 2)]));
        assert!(res.is_err());
        assert!(res.unwrap_err().to_string().contains("negative"));
    }

    #[test]
    fn too_short_transcripts_are_zeroed() {
        let dist = LengthDist::uniform(100, 200).unwrap();
        // shorter than any fragment, and one that fits only the shortest
        // fragment at a single position (expected starts ~0.01)
        let eel = expected_effective_lengths(&dist, &txps(&[(50, 50), (100, 100), (1000, 1000)]))
            .unwrap();
        assert_eq!(eel[1], 0.0);
        assert_eq!(eel[2], 0.0);
        assert!(eel[3] > 0.0);
    }
}
