//! Per-outline attribute derivation and parallel batch processing.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ela::{estimate_all, ElaEstimates};
use crate::geometry::{coordinate_id, Outline};
use crate::histogram::ElevationHistogram;
use crate::hypsometry::{analyze_hypsometry, HypsometryResult};
use crate::raster::{Layer, RasterService};
use crate::{round_to, ErrorKind, GlacierError, Params, SENTINEL};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThicknessStats {
    pub mean: f64,
    pub std: f64,
    pub median: f64,
    pub max: f64,
}

impl ThicknessStats {
    pub fn sentinel() -> Self {
        Self {
            mean: SENTINEL,
            std: SENTINEL,
            median: SENTINEL,
            max: SENTINEL,
        }
    }
}

/// One output row per input outline.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GlacierAttributeRecord {
    /// 1-based position in the input.
    pub poly_id: usize,
    pub pgi_id: Option<String>,
    pub rec_method: String,
    pub glacial_stage: String,
    pub cen_x: f64,
    pub cen_y: f64,
    pub perimeter: f64,
    pub area_2d: f64,
    pub area_3d: f64,
    pub ratio_3d_2d: f64,
    pub hypsometry: HypsometryResult,
    pub mean_slope: f64,
    pub mean_aspect: f64,
    pub ela: ElaEstimates,
    pub thickness: ThicknessStats,
    pub volume_km3: f64,
    pub issues: Vec<ErrorKind>,
}

impl GlacierAttributeRecord {
    /// Record with every derived field at [`SENTINEL`].
    pub fn blank(poly_id: usize, params: &Params) -> Self {
        Self {
            poly_id,
            pgi_id: None,
            rec_method: params.rec_method.clone(),
            glacial_stage: params.glacial_stage.clone(),
            cen_x: SENTINEL,
            cen_y: SENTINEL,
            perimeter: SENTINEL,
            area_2d: SENTINEL,
            area_3d: SENTINEL,
            ratio_3d_2d: SENTINEL,
            hypsometry: HypsometryResult::sentinel(),
            mean_slope: SENTINEL,
            mean_aspect: SENTINEL,
            ela: ElaEstimates::sentinel(),
            thickness: ThicknessStats::sentinel(),
            volume_km3: SENTINEL,
            issues: Vec::new(),
        }
    }

    /// Blank record carrying the outline's geometry fields and identifier.
    pub fn from_outline(poly_id: usize, outline: &Outline, params: &Params) -> Self {
        let mut record = Self::blank(poly_id, params);
        let centroid = outline.centroid();
        if let Some([x, y]) = centroid {
            record.cen_x = x;
            record.cen_y = y;
        }
        record.perimeter = outline.perimeter();
        record.area_2d = outline.area();
        record.pgi_id = resolve_pgi_id(outline, centroid, params);
        record
    }

    fn note(&mut self, kind: ErrorKind) {
        if !self.issues.contains(&kind) {
            self.issues.push(kind);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.issues.is_empty()
    }

    /// `ok`, or the recorded issue kinds joined with `;`.
    pub fn status(&self) -> String {
        if self.issues.is_empty() {
            return "ok".to_string();
        }
        self.issues
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(";")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchSummary {
    pub polygons: usize,
    pub complete: usize,
    pub issue_counts: BTreeMap<ErrorKind, usize>,
    pub params: Params,
    pub params_hash: String,
    pub generated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchOutput {
    pub records: Vec<GlacierAttributeRecord>,
    pub summary: BatchSummary,
}

fn resolve_pgi_id(outline: &Outline, centroid: Option<[f64; 2]>, params: &Params) -> Option<String> {
    if let Some(id) = &outline.pgi_id {
        return Some(id.clone());
    }
    if params.geographic {
        if let Some([lon, lat]) = centroid {
            return Some(coordinate_id(&params.glacial_stage, lon, lat));
        }
    }
    outline
        .anchor_lonlat
        .map(|(lon, lat)| coordinate_id(&params.glacial_stage, lon, lat))
}

/// Derive every attribute of one outline. Failures never abort: they leave
/// the affected fields at [`SENTINEL`] and are listed in `issues`.
pub fn process_outline<S: RasterService>(
    service: &S,
    poly_id: usize,
    outline: &Outline,
    params: &Params,
) -> GlacierAttributeRecord {
    let mut record = GlacierAttributeRecord::from_outline(poly_id, outline, params);

    let ws = match service.acquire(outline) {
        Ok(ws) => ws,
        Err(err) => {
            warn!("polygon {}: cannot read raster cells: {}", poly_id, err);
            record.note(err.kind());
            return record;
        }
    };

    let sample = match service.extract_elevations(&ws) {
        Ok(sample) => sample,
        Err(err) => {
            warn!("polygon {}: {}", poly_id, err);
            record.note(err.kind());
            return record;
        }
    };

    match ElevationHistogram::build(&sample, params.interval) {
        Ok(hist) => {
            let (ela, errors) = estimate_all(&hist, params);
            record.ela = ela;
            for err in errors {
                match err {
                    GlacierError::NonConvergence { .. } => warn!("polygon {}: {}", poly_id, err),
                    _ => debug!("polygon {}: {}", poly_id, err),
                }
                record.note(err.kind());
            }
        }
        Err(err) => {
            warn!("polygon {}: {}", poly_id, err);
            record.note(err.kind());
        }
    }

    record.hypsometry = analyze_hypsometry(&sample);
    if record.hypsometry.is_degenerate() {
        debug!("polygon {}: {}", poly_id, GlacierError::DegenerateRange);
        record.note(ErrorKind::DegenerateRange);
    }

    match service.terrain(&ws) {
        Ok(terrain) => {
            record.mean_slope = round_to(terrain.mean_slope, 1);
            record.mean_aspect = round_to(terrain.mean_aspect, 1);
        }
        Err(err) => {
            warn!("polygon {}: terrain: {}", poly_id, err);
            record.note(err.kind());
        }
    }

    match service.surface_ratio(&ws).map(|sr| sr.ratio()) {
        Ok(Some(ratio)) => {
            record.ratio_3d_2d = round_to(ratio, 3);
            record.area_3d = record.area_2d * ratio;
        }
        Ok(None) => record.note(ErrorKind::EmptySample),
        Err(err) => {
            warn!("polygon {}: surface ratio: {}", poly_id, err);
            record.note(err.kind());
        }
    }

    if service.has_layer(Layer::Thickness) {
        match service.zonal_stats(&ws, Layer::Thickness) {
            Ok(stats) => {
                record.thickness = ThicknessStats {
                    mean: round_to(stats.mean, 1),
                    std: round_to(stats.std, 1),
                    median: round_to(stats.median, 1),
                    max: round_to(stats.max, 1),
                };
                record.volume_km3 = round_to(record.area_2d * stats.mean / 1e9, 4);
            }
            Err(err) => {
                warn!("polygon {}: thickness: {}", poly_id, err);
                record.note(err.kind());
            }
        }
    }

    drop(ws);
    record
}

/// Process every outline in parallel and return the records in input order.
///
/// Parameters are validated once up front; an invalid set rejects the whole
/// batch before any outline is touched.
pub fn process_batch<S: RasterService>(
    service: &S,
    outlines: &[Outline],
    params: &Params,
) -> Result<BatchOutput, GlacierError> {
    params.validate()?;
    let params_hash = params.params_hash_sha256()?;

    let mut records: Vec<(usize, GlacierAttributeRecord)> = outlines
        .par_iter()
        .enumerate()
        .map(|(idx, outline)| {
            let poly_id = idx + 1;
            let record = panic::catch_unwind(AssertUnwindSafe(|| {
                process_outline(service, poly_id, outline, params)
            }))
            .unwrap_or_else(|_| {
                warn!("polygon {}: processing panicked", poly_id);
                let mut record = panic::catch_unwind(AssertUnwindSafe(|| {
                    GlacierAttributeRecord::from_outline(poly_id, outline, params)
                }))
                .unwrap_or_else(|_| {
                    let mut bare = GlacierAttributeRecord::blank(poly_id, params);
                    bare.pgi_id = outline.pgi_id.clone();
                    bare
                });
                record.note(ErrorKind::Panicked);
                record
            });
            (idx, record)
        })
        .collect();

    records.sort_by_key(|(idx, _)| *idx);
    let records: Vec<GlacierAttributeRecord> = records.into_iter().map(|(_, r)| r).collect();

    let mut issue_counts: BTreeMap<ErrorKind, usize> = BTreeMap::new();
    for record in &records {
        for kind in &record.issues {
            *issue_counts.entry(*kind).or_insert(0) += 1;
        }
    }
    let complete = records.iter().filter(|r| r.is_complete()).count();
    info!(
        "Processed {} polygons ({} complete, {} with issues)",
        records.len(),
        complete,
        records.len() - complete
    );

    Ok(BatchOutput {
        summary: BatchSummary {
            polygons: records.len(),
            complete,
            issue_counts,
            params: params.clone(),
            params_hash,
            generated_at: Utc::now(),
        },
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{SurfaceRatio, TerrainSummary, ZonalStats};
    use crate::ElevationSample;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CLUSTERS: [f64; 6] = [1000.0, 1000.0, 1000.0, 1200.0, 1200.0, 1400.0];

    /// Serves elevations keyed on the outline's `PGI_ID`.
    struct MockService {
        acquired: AtomicUsize,
        with_thickness: bool,
    }

    impl MockService {
        fn new(with_thickness: bool) -> Self {
            Self {
                acquired: AtomicUsize::new(0),
                with_thickness,
            }
        }
    }

    impl RasterService for MockService {
        type Workspace = String;

        fn acquire(&self, outline: &Outline) -> Result<String, GlacierError> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(outline.pgi_id.clone().unwrap_or_default())
        }

        fn extract_elevations(&self, ws: &String) -> Result<ElevationSample, GlacierError> {
            match ws.as_str() {
                "EMPTY" => ElevationSample::new(Vec::new()),
                "FLAT" => ElevationSample::new(vec![1500.0, 1500.0]),
                "BOOM" => panic!("corrupt tile"),
                _ => ElevationSample::new(CLUSTERS),
            }
        }

        fn has_layer(&self, layer: Layer) -> bool {
            layer == Layer::Surface || self.with_thickness
        }

        fn zonal_stats(&self, _ws: &String, _layer: Layer) -> Result<ZonalStats, GlacierError> {
            ZonalStats::from_values(&[100.0, 120.0, 140.0]).ok_or(GlacierError::EmptySample)
        }

        fn surface_ratio(&self, _ws: &String) -> Result<SurfaceRatio, GlacierError> {
            Ok(SurfaceRatio {
                area_2d: 100.0,
                area_3d: 111.234_56,
            })
        }

        fn terrain(&self, _ws: &String) -> Result<TerrainSummary, GlacierError> {
            Ok(TerrainSummary {
                mean_slope: 12.34,
                mean_aspect: 181.06,
            })
        }
    }

    fn square(id: &str, x0: f64, size: f64) -> Outline {
        let mut outline = Outline::from_exterior(vec![
            [x0, 0.0],
            [x0 + size, 0.0],
            [x0 + size, size],
            [x0, size],
            [x0, 0.0],
        ]);
        outline.pgi_id = Some(id.to_string());
        outline
    }

    #[test]
    fn full_record_for_a_clean_outline() {
        let service = MockService::new(true);
        let record = process_outline(&service, 1, &square("G1", 0.0, 1000.0), &Params::default());

        assert!(record.is_complete(), "issues: {}", record.status());
        assert_eq!(record.pgi_id.as_deref(), Some("G1"));
        assert_eq!(record.area_2d, 1_000_000.0);
        assert_eq!(record.perimeter, 4000.0);
        assert_eq!((record.cen_x, record.cen_y), (500.0, 500.0));
        // A3D uses the unrounded ratio; only the stored ratio is rounded.
        assert_eq!(record.ratio_3d_2d, 1.112);
        assert!((record.area_3d - 1_112_345.6).abs() < 1e-3);
        assert_eq!(record.mean_slope, 12.3);
        assert_eq!(record.mean_aspect, 181.1);
        assert_eq!(record.ela.aar, 1030.0);
        assert_eq!(record.ela.mge, 1030.0);
        assert_ne!(record.ela.aa, SENTINEL);
        assert_ne!(record.ela.aabr, SENTINEL);
        assert_eq!(record.hypsometry.hypsometric_index, 0.333);
        assert_eq!(record.thickness.mean, 120.0);
        assert_eq!(record.thickness.max, 140.0);
        assert_eq!(record.volume_km3, 0.12);
        assert_eq!(record.status(), "ok");
    }

    #[test]
    fn thickness_fields_stay_sentinel_without_layer() {
        let service = MockService::new(false);
        let record = process_outline(&service, 1, &square("G1", 0.0, 10.0), &Params::default());
        assert!(record.is_complete());
        assert_eq!(record.thickness, ThicknessStats::sentinel());
        assert_eq!(record.volume_km3, SENTINEL);
    }

    #[test]
    fn flat_outline_records_degenerate_range() {
        let service = MockService::new(false);
        let record = process_outline(&service, 3, &square("FLAT", 0.0, 10.0), &Params::default());
        assert_eq!(record.issues, vec![ErrorKind::DegenerateRange]);
        assert_eq!(record.ela.aar, 1510.0);
        assert_eq!(record.ela.aa, SENTINEL);
        assert_eq!(record.ela.aabr, SENTINEL);
        assert_eq!(record.hypsometry.hypsometric_index, SENTINEL);
        assert_eq!(record.status(), "degenerate_range");
    }

    #[test]
    fn ten_thousand_outlines_with_one_empty_sample() {
        let outlines: Vec<Outline> = (1..=10_000)
            .map(|id| {
                let name = if id == 42 { "EMPTY".to_string() } else { format!("G{}", id) };
                square(&name, id as f64 * 10.0, 5.0)
            })
            .collect();
        let service = MockService::new(false);
        let out = process_batch(&service, &outlines, &Params::default()).unwrap();

        assert_eq!(out.records.len(), 10_000);
        for (i, record) in out.records.iter().enumerate() {
            assert_eq!(record.poly_id, i + 1);
        }
        let empty = &out.records[41];
        assert_eq!(empty.issues, vec![ErrorKind::EmptySample]);
        assert_eq!(empty.ela, ElaEstimates::sentinel());
        assert_eq!(empty.hypsometry, HypsometryResult::sentinel());
        assert_eq!(empty.area_2d, 25.0);
        assert_eq!(out.records[42].ela.aar, 1030.0);

        assert_eq!(out.summary.polygons, 10_000);
        assert_eq!(out.summary.complete, 9_999);
        assert_eq!(out.summary.issue_counts.get(&ErrorKind::EmptySample), Some(&1));
        assert_eq!(out.summary.params_hash.len(), 64);
    }

    #[test]
    fn panic_in_one_outline_is_isolated() {
        let outlines = vec![square("G1", 0.0, 5.0), square("BOOM", 10.0, 5.0), square("G3", 20.0, 5.0)];
        let service = MockService::new(false);
        let out = process_batch(&service, &outlines, &Params::default()).unwrap();
        assert_eq!(out.records.len(), 3);
        assert_eq!(out.records[1].issues, vec![ErrorKind::Panicked]);
        assert_eq!(out.records[1].pgi_id.as_deref(), Some("BOOM"));
        assert_eq!(out.records[1].area_2d, 25.0);
        assert_eq!(out.records[1].perimeter, 20.0);
        assert_eq!((out.records[1].cen_x, out.records[1].cen_y), (12.5, 2.5));
        assert_eq!(out.records[1].ela, ElaEstimates::sentinel());
        assert!(out.records[0].is_complete());
        assert!(out.records[2].is_complete());
        assert_eq!(out.summary.issue_counts.get(&ErrorKind::Panicked), Some(&1));
    }

    #[test]
    fn invalid_params_reject_batch_before_processing() {
        let service = MockService::new(false);
        let params = Params {
            aar_ratio: 1.5,
            ..Params::default()
        };
        let result = process_batch(&service, &[square("G1", 0.0, 5.0)], &params);
        assert!(matches!(result, Err(GlacierError::InvalidParameter(_))));
        assert_eq!(service.acquired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pgi_id_falls_back_to_coordinates() {
        let service = MockService::new(false);
        let mut params = Params {
            glacial_stage: "YD".to_string(),
            geographic: true,
            ..Params::default()
        };
        let mut outline = square("G1", -106.0, 0.5);
        outline.pgi_id = None;
        let record = process_outline(&service, 1, &outline, &params);
        assert_eq!(record.pgi_id.as_deref(), Some("PGI_YD_105.75W00.25N"));

        params.geographic = false;
        outline.anchor_lonlat = Some((86.9, 27.95));
        let record = process_outline(&service, 1, &outline, &params);
        assert_eq!(record.pgi_id.as_deref(), Some("PGI_YD_086.9E027.95N"));

        outline.anchor_lonlat = None;
        assert!(process_outline(&service, 1, &outline, &params).pgi_id.is_none());
    }
}
