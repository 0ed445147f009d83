//! Hypsometric summary of a glacier surface.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{round_to, ElevationSample, SENTINEL};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct HypsometryResult {
    pub z_min: f64,
    pub z_max: f64,
    pub z_range: f64,
    pub z_mean: f64,
    pub z_median: f64,
    pub z_mid: f64,
    /// `(z_mean - z_min) / (z_max - z_min)`, [`SENTINEL`] for a flat sample.
    pub hypsometric_index: f64,
    /// Most frequent 1 m elevation.
    pub hypso_max: f64,
}

impl HypsometryResult {
    pub fn sentinel() -> Self {
        Self {
            z_min: SENTINEL,
            z_max: SENTINEL,
            z_range: SENTINEL,
            z_mean: SENTINEL,
            z_median: SENTINEL,
            z_mid: SENTINEL,
            hypsometric_index: SENTINEL,
            hypso_max: SENTINEL,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.z_max == self.z_min
    }
}

pub fn analyze_hypsometry(sample: &ElevationSample) -> HypsometryResult {
    let z = sample.truncated();
    let (lo, hi) = sample.bounds();
    let z_min = lo as f64;
    let z_max = hi as f64;
    let z_mean = z.iter().map(|&v| v as f64).sum::<f64>() / z.len() as f64;

    let hypsometric_index = if hi > lo {
        round_to((z_mean - z_min) / (z_max - z_min), 3)
    } else {
        SENTINEL
    };

    HypsometryResult {
        z_min,
        z_max,
        z_range: z_max - z_min,
        z_mean,
        z_median: median_of(z),
        z_mid: (z_min + z_max) / 2.0,
        hypsometric_index,
        hypso_max: mode_of(z) as f64,
    }
}

fn median_of(values: &[i64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] as f64 + sorted[mid] as f64) / 2.0
    } else {
        sorted[mid] as f64
    }
}

// Ties resolve to the lowest elevation.
fn mode_of(values: &[i64]) -> i64 {
    let mut counts: BTreeMap<i64, usize> = BTreeMap::new();
    for &v in values {
        *counts.entry(v).or_insert(0) += 1;
    }
    let mut best = (values[0], 0usize);
    for (&v, &c) in &counts {
        if c > best.1 {
            best = (v, c);
        }
    }
    best.0
}
