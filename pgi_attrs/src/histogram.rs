//! Fixed-width elevation histogram and its cumulative-area-from-top curve.
//!
//! Bins start one interval below the lowest elevation and run up to (but not
//! including) one interval above the highest one. Every bin is half-open
//! except the last, which also holds values equal to its upper edge.

use ndarray::Array1;

use crate::{ElevationSample, GlacierError};

#[derive(Clone, Debug)]
pub struct ElevationHistogram {
    interval: i64,
    min_alt: i64,
    max_alt: i64,
    counts: Array1<u64>,
    cumulative_counts: Array1<u64>,
    cumulative: Array1<f64>,
    area_from_top: Array1<f64>,
    total: f64,
}

impl ElevationHistogram {
    pub fn build(sample: &ElevationSample, interval: i64) -> Result<Self, GlacierError> {
        if interval <= 0 {
            return Err(GlacierError::InvalidParameter(format!(
                "interval must be a positive integer, got {}",
                interval
            )));
        }
        let (lo, hi) = sample.bounds();
        let min_alt = lo - interval;
        let max_alt = hi + interval;

        let n_edges = ((max_alt - min_alt) + interval - 1) / interval;
        let n_bins = (n_edges - 1).max(1) as usize;

        let mut counts = Array1::<u64>::zeros(n_bins);
        for &z in sample.truncated() {
            let idx = (((z - min_alt) / interval) as usize).min(n_bins - 1);
            counts[idx] += 1;
        }

        let n = sample.len() as f64;
        let mut running = 0u64;
        let cumulative_counts: Array1<u64> = counts
            .iter()
            .map(|&c| {
                running += c;
                running
            })
            .collect();
        let cumulative = cumulative_counts.mapv(|k| k as f64 / n);
        let total = cumulative.iter().copied().fold(0.0, f64::max);
        let area_from_top = cumulative.mapv(|c| total - c);

        Ok(Self {
            interval,
            min_alt,
            max_alt,
            counts,
            cumulative_counts,
            cumulative,
            area_from_top,
            total,
        })
    }

    pub fn interval(&self) -> i64 {
        self.interval
    }

    pub fn min_alt(&self) -> i64 {
        self.min_alt
    }

    pub fn max_alt(&self) -> i64 {
        self.max_alt
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn lower_edge(&self, bin: usize) -> i64 {
        self.min_alt + bin as i64 * self.interval
    }

    /// Bin centre, `min_alt + interval/2 + bin * interval`.
    pub fn center(&self, bin: usize) -> f64 {
        self.lower_edge(bin) as f64 + self.interval as f64 / 2.0
    }

    pub fn counts(&self) -> &Array1<u64> {
        &self.counts
    }

    /// Fraction of the sample at or below each bin, bottom up.
    pub fn cumulative(&self) -> &Array1<f64> {
        &self.cumulative
    }

    pub fn cumulative_percent(&self) -> Array1<f64> {
        let n = self.sample_size() as f64;
        self.cumulative_counts.mapv(|k| (k * 100) as f64 / n)
    }

    /// Cumulative percentage cut to whole percent, in exact integer arithmetic.
    pub fn cumulative_percent_floor(&self) -> Array1<i64> {
        let n = self.sample_size().max(1);
        self.cumulative_counts.mapv(|k| (k * 100 / n) as i64)
    }

    fn sample_size(&self) -> u64 {
        self.cumulative_counts.iter().copied().max().unwrap_or(0)
    }

    /// Relative area lying above each bin.
    pub fn area_from_top(&self) -> &Array1<f64> {
        &self.area_from_top
    }

    pub fn total(&self) -> f64 {
        self.total
    }

    pub fn populated_bins(&self) -> usize {
        self.counts.iter().filter(|&&c| c > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(values: &[f64]) -> ElevationSample {
        ElevationSample::new(values.iter().copied()).unwrap()
    }

    #[test]
    fn three_cluster_sample_populates_three_bins() {
        let s = sample(&[1000.0, 1000.0, 1000.0, 1200.0, 1200.0, 1400.0]);
        let h = ElevationHistogram::build(&s, 20).unwrap();
        assert_eq!(h.min_alt(), 980);
        assert_eq!(h.max_alt(), 1420);
        assert_eq!(h.len(), 21);
        assert_eq!(h.populated_bins(), 3);

        let populated: Vec<(i64, u64)> = h
            .counts()
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(i, &c)| (h.lower_edge(i), c))
            .collect();
        // The top value equals the last edge and falls in the closed last bin.
        assert_eq!(populated, vec![(1000, 3), (1200, 2), (1380, 1)]);
    }

    #[test]
    fn area_from_top_is_non_increasing_and_starts_at_total() {
        let s = sample(&[
            812.0, 955.5, 1003.0, 1010.0, 1099.9, 1250.0, 1251.0, 1300.0, 1490.0, 1501.0,
        ]);
        for interval in [1, 7, 20, 50, 500] {
            let h = ElevationHistogram::build(&s, interval).unwrap();
            let a = h.area_from_top();
            assert!((a[0] - h.total()).abs() < 1e-12);
            assert!((h.total() - 1.0).abs() < 1e-12);
            for w in a.windows(2) {
                assert!(w[1] <= w[0] + 1e-12, "interval {} not monotone", interval);
            }
            assert!(a[a.len() - 1].abs() < 1e-12);
            assert_eq!(h.counts().sum(), s.len() as u64);
        }
    }

    #[test]
    fn single_value_gives_single_bin() {
        let h = ElevationHistogram::build(&sample(&[1000.0]), 20).unwrap();
        assert_eq!(h.len(), 1);
        assert_eq!(h.counts()[0], 1);
        assert_eq!(h.lower_edge(0), 980);
    }

    #[test]
    fn narrow_sample_populates_one_bin() {
        let h = ElevationHistogram::build(&sample(&[1000.0, 1005.0, 1010.0]), 20).unwrap();
        assert_eq!(h.populated_bins(), 1);
        assert_eq!(h.len(), 2);
    }

    #[test]
    fn whole_percentages_are_not_cut_short() {
        let mut values = vec![1000.0; 29];
        values.extend(std::iter::repeat(1300.0).take(21));
        let h = ElevationHistogram::build(&sample(&values), 20).unwrap();
        let pct = h.cumulative_percent_floor();
        assert_eq!(pct[0], 0);
        assert_eq!(pct[1], 58);
        assert_eq!(pct[pct.len() - 1], 100);
        assert_eq!(h.cumulative_percent()[1], 58.0);
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        let s = sample(&[1000.0]);
        assert!(ElevationHistogram::build(&s, 0).is_err());
        assert!(ElevationHistogram::build(&s, -20).is_err());
    }
}
