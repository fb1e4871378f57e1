use statrs::distribution::{ContinuousCDF, Normal};
use tracing::warn;

use crate::util::constants::EPSILON;

/// A discretized length distribution over the lengths `lb + 1 ..= ub`.
///
/// Position `i` in [1, span] of the probability and cumulative arrays
/// stands for length `lb + i`; position 0 carries no mass, so `cdf[0]` is
/// always 0 and `cdf[span]` is 1 whenever the distribution has any mass.
#[derive(Debug, Clone, PartialEq)]
pub struct LengthDist {
    lb: u32,
    ub: u32,
    pdf: Vec<f64>,
    cdf: Vec<f64>,
}

impl LengthDist {
    fn with_bounds(min_len: u32, max_len: u32) -> anyhow::Result<Self> {
        if min_len == 0 || max_len < min_len {
            anyhow::bail!(
                "invalid length bounds [{}, {}]; need 1 <= min <= max",
                min_len,
                max_len
            );
        }
        let span = (max_len - min_len + 1) as usize;
        Ok(Self {
            lb: min_len - 1,
            ub: max_len,
            pdf: vec![0.0_f64; span + 1],
            cdf: vec![0.0_f64; span + 1],
        })
    }

    /// every length in [min_len, max_len] equally likely
    pub fn uniform(min_len: u32, max_len: u32) -> anyhow::Result<Self> {
        let mut d = Self::with_bounds(min_len, max_len)?;
        let p = 1.0 / d.span() as f64;
        d.pdf[1..].fill(p);
        d.rebuild_cdf();
        Ok(d)
    }

    /// a Normal(mean, sd) restricted to [min_len, max_len], with each
    /// length receiving the mass of the unit interval centered on it.
    pub fn normal(min_len: u32, max_len: u32, mean: f64, sd: f64) -> anyhow::Result<Self> {
        let normal = Normal::new(mean, sd)
            .map_err(|e| anyhow::anyhow!("invalid fragment length distribution: {}", e))?;
        let mut d = Self::with_bounds(min_len, max_len)?;
        for i in 1..=d.span() {
            let len = (d.lb as usize + i) as f64;
            d.pdf[i] = normal.cdf(len + 0.5) - normal.cdf(len - 0.5);
        }
        if !d.normalize() {
            warn!(
                "N({}, {}) has no mass within [{}, {}]; falling back to a uniform length distribution.",
                mean, sd, min_len, max_len
            );
            return Self::uniform(min_len, max_len);
        }
        Ok(d)
    }

    /// Replace the probabilities with the normalized `counts` (indexed like
    /// the probability array). Returns false, leaving the distribution
    /// untouched, when the counts carry no mass or any count is negative
    /// or not finite.
    pub fn set_from_counts(&mut self, counts: &[f64]) -> bool {
        assert_eq!(counts.len(), self.pdf.len());
        if counts.iter().any(|c| !c.is_finite() || *c < 0.0) {
            warn!("ignoring invalid length counts; keeping the current distribution");
            return false;
        }
        let total: f64 = counts[1..].iter().sum();
        if total < EPSILON {
            return false;
        }
        self.pdf[0] = 0.0;
        for (p, c) in self.pdf[1..].iter_mut().zip(&counts[1..]) {
            *p = c / total;
        }
        self.rebuild_cdf();
        true
    }

    /// A distribution over `lb + 1 ..= lb + pdf.len() - 1` taking `pdf` as
    /// given, without any validation.
    #[cfg(test)]
    pub(crate) fn from_pdf_unchecked(lb: u32, pdf: Vec<f64>) -> Self {
        let span = pdf.len() - 1;
        let mut d = Self {
            lb,
            ub: lb + span as u32,
            cdf: vec![0.0_f64; pdf.len()],
            pdf,
        };
        d.rebuild_cdf();
        d
    }

    fn normalize(&mut self) -> bool {
        let total: f64 = self.pdf[1..].iter().sum();
        if total < EPSILON {
            return false;
        }
        self.pdf.iter_mut().for_each(|p| *p /= total);
        self.rebuild_cdf();
        true
    }

    fn rebuild_cdf(&mut self) {
        self.cdf[0] = 0.0;
        for i in 1..self.pdf.len() {
            self.cdf[i] = self.cdf[i - 1] + self.pdf[i];
        }
    }

    /// exclusive lower bound
    pub fn lb(&self) -> u32 {
        self.lb
    }

    /// inclusive upper bound
    pub fn ub(&self) -> u32 {
        self.ub
    }

    pub fn span(&self) -> usize {
        (self.ub - self.lb) as usize
    }

    /// probability of length `len`; zero outside the support
    #[inline(always)]
    pub fn prob(&self, len: u32) -> f64 {
        if len <= self.lb || len > self.ub {
            0.0
        } else {
            self.pdf[(len - self.lb) as usize]
        }
    }

    /// index into the probability arrays for `len`, if it is in the support
    #[inline(always)]
    pub fn index_of(&self, len: u32) -> Option<usize> {
        if len <= self.lb || len > self.ub {
            None
        } else {
            Some((len - self.lb) as usize)
        }
    }

    pub fn pdf(&self) -> &[f64] {
        &self.pdf
    }

    pub fn cdf(&self) -> &[f64] {
        &self.cdf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_mass_is_spread_evenly() {
        let d = LengthDist::uniform(5, 8).unwrap();
        assert_eq!(d.lb(), 4);
        assert_eq!(d.ub(), 8);
        assert_eq!(d.span(), 4);
        assert_eq!(d.prob(4), 0.0);
        assert_eq!(d.prob(9), 0.0);
        assert!((d.prob(5) - 0.25).abs() < 1e-12);
        assert_eq!(d.cdf()[0], 0.0);
        assert!((d.cdf()[4] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn normal_is_truncated_and_renormalized() {
        let d = LengthDist::normal(100, 300, 200.0, 20.0).unwrap();
        assert!((d.cdf()[d.span()] - 1.0).abs() < 1e-9);
        assert!(d.prob(200) > d.prob(150));
        assert!(d.prob(150) > d.prob(120));
    }

    #[test]
    fn normal_without_support_mass_falls_back_to_uniform() {
        let d = LengthDist::normal(1, 10, 1e6, 1.0).unwrap();
        assert!((d.prob(3) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn empty_counts_leave_distribution_alone() {
        let mut d = LengthDist::uniform(1, 4).unwrap();
        let before = d.clone();
        assert!(!d.set_from_counts(&[0.0; 5]));
        assert_eq!(d, before);
        assert!(d.set_from_counts(&[0.0, 1.0, 0.0, 3.0, 0.0]));
        assert!((d.prob(3) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn negative_counts_are_rejected() {
        let mut d = LengthDist::uniform(1, 4).unwrap();
        let before = d.clone();
        assert!(!d.set_from_counts(&[0.0, -1.0, 0.0, 0.0, 2.0]));
        assert!(!d.set_from_counts(&[0.0, f64::NAN, 0.0, 0.0, 2.0]));
        assert_eq!(d, before);
        assert!(d.pdf().iter().all(|&p| p >= 0.0));
    }

    #[test]
    fn bad_bounds_are_rejected() {
        assert!(LengthDist::uniform(0, 10).is_err());
        assert!(LengthDist::uniform(10, 9).is_err());
    }
}
