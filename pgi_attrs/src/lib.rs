//! Equilibrium-line altitude and derived attributes for paleoglacier outlines.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub mod ela;
pub mod engine;
pub mod geometry;
pub mod histogram;
pub mod hypsometry;
pub mod raster;

pub use ela::{
    aabr_balance, ela_aa, ela_aabr, ela_aar_mge, estimate_all, AabrSearch, ElaEstimates,
    OffsetConvention,
};
pub use engine::{
    process_batch, process_outline, BatchOutput, BatchSummary, GlacierAttributeRecord,
    ThicknessStats,
};
pub use geometry::{coordinate_id, read_outlines_geojson, Outline};
pub use histogram::ElevationHistogram;
pub use hypsometry::{analyze_hypsometry, HypsometryResult};
pub use raster::{
    zonal_table, Grid, GridRasterService, Layer, RasterService, SurfaceRatio, TerrainSummary,
    ZonalStats,
};

/// Value written to every derived field that could not be computed.
pub const SENTINEL: f64 = -999.0;

#[derive(Error, Debug)]
pub enum GlacierError {
    #[error("no valid elevation cells inside the outline")]
    EmptySample,
    #[error("elevation range is degenerate (z_max == z_min)")]
    DegenerateRange,
    #[error("AABR search did not converge after {iterations} steps")]
    NonConvergence { iterations: usize },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("raster error: {0}")]
    Raster(String),
    #[error("geometry error: {0}")]
    Geometry(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl GlacierError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GlacierError::EmptySample => ErrorKind::EmptySample,
            GlacierError::DegenerateRange => ErrorKind::DegenerateRange,
            GlacierError::NonConvergence { .. } => ErrorKind::NonConvergence,
            GlacierError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            GlacierError::Raster(_) | GlacierError::Geometry(_) | GlacierError::Io(_) => {
                ErrorKind::Raster
            }
        }
    }
}

/// Failure category recorded on an attribute record.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    EmptySample,
    DegenerateRange,
    NonConvergence,
    InvalidParameter,
    Raster,
    Panicked,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::EmptySample => "empty_sample",
            ErrorKind::DegenerateRange => "degenerate_range",
            ErrorKind::NonConvergence => "non_convergence",
            ErrorKind::InvalidParameter => "invalid_parameter",
            ErrorKind::Raster => "raster",
            ErrorKind::Panicked => "panicked",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Params {
    /// Elevation bin width in meters.
    pub interval: i64,
    pub aar_ratio: f64,
    pub aabr_ratio: f64,
    pub offset_convention: OffsetConvention,
    /// Free-text reconstruction method copied onto every record.
    pub rec_method: String,
    /// Glacial stage label, only used as the PGI_ID prefix.
    pub glacial_stage: String,
    /// Outline coordinates are longitude/latitude degrees.
    pub geographic: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            interval: 20,
            aar_ratio: 0.58,
            aabr_ratio: 1.56,
            offset_convention: OffsetConvention::Revised,
            rec_method: String::new(),
            glacial_stage: "LGM".to_string(),
            geographic: false,
        }
    }
}

impl Params {
    /// Reject parameter sets that would invalidate every polygon of a run.
    pub fn validate(&self) -> Result<(), GlacierError> {
        if self.interval <= 0 {
            return Err(GlacierError::InvalidParameter(format!(
                "interval must be a positive integer, got {}",
                self.interval
            )));
        }
        if !(self.aar_ratio > 0.0 && self.aar_ratio < 1.0) {
            return Err(GlacierError::InvalidParameter(format!(
                "AAR ratio must lie in (0, 1), got {}",
                self.aar_ratio
            )));
        }
        if !(self.aabr_ratio.is_finite() && self.aabr_ratio > 0.0) {
            return Err(GlacierError::InvalidParameter(format!(
                "AABR ratio must be positive, got {}",
                self.aabr_ratio
            )));
        }
        Ok(())
    }

    pub fn params_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn params_hash_sha256(&self) -> Result<String, GlacierError> {
        let bytes =
            serde_json::to_vec(self).map_err(|e| GlacierError::InvalidParameter(e.to_string()))?;
        Ok(sha256_hex(&bytes))
    }
}

/// Elevations (m) of the raster cells covering one glacier outline.
///
/// Non-positive and non-finite values are dropped on construction, and an
/// empty result is rejected. The estimators work on the integer-truncated
/// copy, matching the reference datasets the ELA fields are compared against.
/// Serialized as the plain list of kept elevations; deserializing goes
/// through the same filtering.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "Vec<f64>", into = "Vec<f64>")]
pub struct ElevationSample {
    values: Vec<f64>,
    truncated: Vec<i64>,
}

impl ElevationSample {
    pub fn new<I>(values: I) -> Result<Self, GlacierError>
    where
        I: IntoIterator<Item = f64>,
    {
        let values: Vec<f64> = values
            .into_iter()
            .filter(|v| v.is_finite() && *v > 0.0)
            .collect();
        if values.is_empty() {
            return Err(GlacierError::EmptySample);
        }
        let truncated = values.iter().map(|v| v.trunc() as i64).collect();
        Ok(Self { values, truncated })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn truncated(&self) -> &[i64] {
        &self.truncated
    }

    /// Minimum and maximum of the truncated elevations.
    pub fn bounds(&self) -> (i64, i64) {
        let mut lo = i64::MAX;
        let mut hi = i64::MIN;
        for &v in &self.truncated {
            lo = lo.min(v);
            hi = hi.max(v);
        }
        (lo, hi)
    }
}

impl TryFrom<Vec<f64>> for ElevationSample {
    type Error = GlacierError;

    fn try_from(values: Vec<f64>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<ElevationSample> for Vec<f64> {
    fn from(sample: ElevationSample) -> Self {
        sample.values
    }
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    if !value.is_finite() || value == SENTINEL {
        return value;
    }
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        use std::fmt::Write;
        let _ = write!(&mut out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_are_valid() {
        let params = Params::default();
        assert!(params.validate().is_ok());
        assert_eq!(params.interval, 20);
        assert!((params.aar_ratio - 0.58).abs() < 1e-12);
        assert!((params.aabr_ratio - 1.56).abs() < 1e-12);
    }

    #[test]
    fn out_of_range_params_are_rejected() {
        let bad_interval = Params {
            interval: 0,
            ..Params::default()
        };
        assert!(matches!(
            bad_interval.validate(),
            Err(GlacierError::InvalidParameter(_))
        ));
        let bad_aar = Params {
            aar_ratio: 1.0,
            ..Params::default()
        };
        assert!(bad_aar.validate().is_err());
        let bad_aabr = Params {
            aabr_ratio: -1.56,
            ..Params::default()
        };
        assert!(bad_aabr.validate().is_err());
    }

    #[test]
    fn params_hash_tracks_content() {
        let a = Params::default();
        let b = Params {
            interval: 50,
            ..Params::default()
        };
        let ha = a.params_hash_sha256().unwrap();
        assert_eq!(ha.len(), 64);
        assert_eq!(ha, a.params_hash_sha256().unwrap());
        assert_ne!(ha, b.params_hash_sha256().unwrap());
    }

    #[test]
    fn partial_config_json_fills_defaults() {
        let params: Params = serde_json::from_str(r#"{"interval": 50}"#).unwrap();
        assert_eq!(params.interval, 50);
        assert_eq!(params.glacial_stage, "LGM");
        assert_eq!(params.offset_convention, OffsetConvention::Revised);
    }

    #[test]
    fn sample_drops_nodata_and_truncates() {
        let sample = ElevationSample::new(vec![1000.9, 0.0, -5.0, f64::NAN, 1201.2]).unwrap();
        assert_eq!(sample.len(), 2);
        assert_eq!(sample.truncated(), &[1000, 1201]);
        assert_eq!(sample.bounds(), (1000, 1201));
        assert!(matches!(
            ElevationSample::new(vec![0.0, -1.0]),
            Err(GlacierError::EmptySample)
        ));
    }

    #[test]
    fn sample_deserializes_through_filtering() {
        let sample: ElevationSample = serde_json::from_str("[1000.9, -5.0, 1201.2]").unwrap();
        assert_eq!(sample.truncated(), &[1000, 1201]);
        assert_eq!(serde_json::to_string(&sample).unwrap(), "[1000.9,1201.2]");

        assert!(serde_json::from_str::<ElevationSample>("[]").is_err());
        assert!(serde_json::from_str::<ElevationSample>("[-5.0, 0.0]").is_err());
        assert!(serde_json::from_str::<ElevationSample>(
            r#"{"values":[-5.0],"truncated":[9000]}"#
        )
        .is_err());
    }
}
