//! Equilibrium-line altitude estimators.
//!
//! All four methods read the same [`ElevationHistogram`]:
//!
//! * AAR and MGE (Kurowski) search the area-from-top curve for the bin whose
//!   area above is closest to, without exceeding, a fraction of the total.
//! * AA is the area-weighted mean bin altitude.
//! * AABR walks a reference altitude upwards until the ratio-weighted
//!   area-altitude balance turns non-positive.
//!
//! The calibration offsets applied on top of each raw estimate are named
//! constants selected through [`OffsetConvention`].

use serde::{Deserialize, Serialize};

use crate::histogram::ElevationHistogram;
use crate::{GlacierError, Params, SENTINEL};

/// Kurowski (median glacier elevation) area fraction.
pub const KUROWSKI_RATIO: f64 = 0.5;

/// Intervals added to the AAR and MGE bin centres under every convention.
pub const AAR_MGE_OFFSET_INTERVALS: i64 = 1;
/// Intervals added to the AA and AABR results by the 2023 legacy calibration.
pub const LEGACY_AA_AABR_OFFSET_INTERVALS: i64 = 1;
/// Intervals added to the AA and AABR results by the revised calibration.
pub const REVISED_AA_AABR_OFFSET_INTERVALS: i64 = 0;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OffsetConvention {
    Revised,
    Legacy,
}

impl Default for OffsetConvention {
    fn default() -> Self {
        OffsetConvention::Revised
    }
}

impl OffsetConvention {
    pub fn aar_mge_intervals(&self) -> i64 {
        AAR_MGE_OFFSET_INTERVALS
    }

    pub fn aa_aabr_intervals(&self) -> i64 {
        match self {
            OffsetConvention::Revised => REVISED_AA_AABR_OFFSET_INTERVALS,
            OffsetConvention::Legacy => LEGACY_AA_AABR_OFFSET_INTERVALS,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ElaMethod {
    Aar,
    Mge,
    Aa,
    Aabr,
}

impl ElaMethod {
    pub const ALL: [ElaMethod; 4] = [ElaMethod::Mge, ElaMethod::Aar, ElaMethod::Aa, ElaMethod::Aabr];

    pub fn id(&self) -> &'static str {
        match self {
            ElaMethod::Aar => "AAR",
            ElaMethod::Mge => "MGE",
            ElaMethod::Aa => "AA",
            ElaMethod::Aabr => "AABR",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ElaMethod::Aar => "Accumulation-area ratio: area above the ELA is a fixed share of the total.",
            ElaMethod::Mge => "Median glacier elevation (Kurowski): half of the area lies above the ELA.",
            ElaMethod::Aa => "Area-altitude: area-weighted mean altitude of the glacier surface.",
            ElaMethod::Aabr => {
                "Area-altitude balance ratio: ablation/accumulation gradients balance at the ELA."
            }
        }
    }
}

/// One ELA per method, [`SENTINEL`] where the method failed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ElaEstimates {
    pub mge: f64,
    pub aar: f64,
    pub aa: f64,
    pub aabr: f64,
}

impl ElaEstimates {
    pub fn sentinel() -> Self {
        Self {
            mge: SENTINEL,
            aar: SENTINEL,
            aa: SENTINEL,
            aabr: SENTINEL,
        }
    }

    pub fn get(&self, method: ElaMethod) -> f64 {
        match method {
            ElaMethod::Aar => self.aar,
            ElaMethod::Mge => self.mge,
            ElaMethod::Aa => self.aa,
            ElaMethod::Aabr => self.aabr,
        }
    }
}

/// Terminating state of the AABR reference-altitude walk.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AabrSearch {
    pub refinf: i64,
    pub iterations: usize,
    pub ela: f64,
}

/// AAR and MGE estimates, in that order.
pub fn ela_aar_mge(
    hist: &ElevationHistogram,
    aar_ratio: f64,
    convention: OffsetConvention,
) -> Result<(f64, f64), GlacierError> {
    if !(aar_ratio > 0.0 && aar_ratio < 1.0) {
        return Err(GlacierError::InvalidParameter(format!(
            "AAR ratio must lie in (0, 1), got {}",
            aar_ratio
        )));
    }
    let interval = hist.interval() as f64;
    let offset = (convention.aar_mge_intervals() * hist.interval()) as f64;

    let aar_bin = closest_bin_below(hist, hist.total() * aar_ratio)?;
    let mge_bin = closest_bin_below(hist, hist.total() * KUROWSKI_RATIO)?;

    let aar = hist.lower_edge(aar_bin) as f64 + interval / 2.0 + offset;
    let mge = hist.lower_edge(mge_bin) as f64 + interval / 2.0 + offset;
    Ok((aar, mge))
}

// Largest area-from-top value not above `target`; the lowest bin wins ties.
fn closest_bin_below(hist: &ElevationHistogram, target: f64) -> Result<usize, GlacierError> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &area) in hist.area_from_top().iter().enumerate() {
        if area > target {
            continue;
        }
        match best {
            Some((_, b)) if area <= b => {}
            _ => best = Some((i, area)),
        }
    }
    best.map(|(i, _)| i).ok_or(GlacierError::DegenerateRange)
}

// Bin-to-bin differences of the integer cumulative percentage.
fn area_steps(hist: &ElevationHistogram) -> Result<(Vec<i64>, i64), GlacierError> {
    if hist.len() < 2 {
        return Err(GlacierError::DegenerateRange);
    }
    let pct = hist.cumulative_percent_floor().to_vec();
    let total = pct.iter().copied().max().unwrap_or(0);
    if total <= 0 {
        return Err(GlacierError::DegenerateRange);
    }
    let steps = pct.windows(2).map(|w| w[1] - w[0]).collect();
    Ok((steps, total))
}

pub fn ela_aa(hist: &ElevationHistogram, convention: OffsetConvention) -> Result<f64, GlacierError> {
    let (steps, total) = area_steps(hist)?;
    let weighted: i64 = steps
        .iter()
        .enumerate()
        .map(|(i, &d)| d * hist.center(i).trunc() as i64)
        .sum();
    let offset = (convention.aa_aabr_intervals() * hist.interval()) as f64;
    Ok((weighted as f64 / total as f64).trunc() + offset)
}

/// Ratio-weighted area-altitude balance about `refinf`.
///
/// Contributions below `refinf` (negative) are scaled by `ratio`.
pub fn aabr_balance(
    hist: &ElevationHistogram,
    refinf: f64,
    ratio: f64,
) -> Result<f64, GlacierError> {
    check_aabr_ratio(ratio)?;
    let (steps, _) = area_steps(hist)?;
    Ok(balance_of(hist, &steps, refinf, ratio))
}

fn check_aabr_ratio(ratio: f64) -> Result<(), GlacierError> {
    if ratio.is_finite() && ratio > 0.0 {
        Ok(())
    } else {
        Err(GlacierError::InvalidParameter(format!(
            "AABR ratio must be positive, got {}",
            ratio
        )))
    }
}

fn balance_of(hist: &ElevationHistogram, steps: &[i64], refinf: f64, ratio: f64) -> f64 {
    steps
        .iter()
        .enumerate()
        .map(|(i, &d)| {
            let w = d as f64 * (hist.center(i) - refinf);
            if w < 0.0 {
                w * ratio
            } else {
                w
            }
        })
        .sum()
}

pub fn ela_aabr(
    hist: &ElevationHistogram,
    aabr_ratio: f64,
    convention: OffsetConvention,
) -> Result<AabrSearch, GlacierError> {
    check_aabr_ratio(aabr_ratio)?;
    let (steps, _) = area_steps(hist)?;
    walk_aabr(hist, &steps, aabr_ratio, convention, hist.len() + 1)
}

// Step `refinf` up one interval at a time until the balance turns non-positive.
fn walk_aabr(
    hist: &ElevationHistogram,
    steps: &[i64],
    aabr_ratio: f64,
    convention: OffsetConvention,
    max_steps: usize,
) -> Result<AabrSearch, GlacierError> {
    let interval = hist.interval();
    let mut refinf = hist.min_alt();
    let mut iterations = 0usize;
    while balance_of(hist, steps, refinf as f64, aabr_ratio) > 0.0 {
        if iterations >= max_steps {
            return Err(GlacierError::NonConvergence { iterations });
        }
        refinf += interval;
        iterations += 1;
    }

    let offset = (convention.aa_aabr_intervals() * interval) as f64;
    Ok(AabrSearch {
        refinf,
        iterations,
        ela: refinf as f64 - interval as f64 / 2.0 + offset,
    })
}

/// Run all four estimators; failed methods are left at [`SENTINEL`] and their
/// errors returned alongside.
pub fn estimate_all(
    hist: &ElevationHistogram,
    params: &Params,
) -> (ElaEstimates, Vec<GlacierError>) {
    let mut out = ElaEstimates::sentinel();
    let mut errors = Vec::new();

    match ela_aar_mge(hist, params.aar_ratio, params.offset_convention) {
        Ok((aar, mge)) => {
            out.aar = aar;
            out.mge = mge;
        }
        Err(e) => errors.push(e),
    }
    match ela_aa(hist, params.offset_convention) {
        Ok(aa) => out.aa = aa,
        Err(e) => errors.push(e),
    }
    match ela_aabr(hist, params.aabr_ratio, params.offset_convention) {
        Ok(search) => out.aabr = search.ela,
        Err(e) => errors.push(e),
    }
    (out, errors)
}
