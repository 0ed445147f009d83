//! Raster collaborator: grids, per-outline cell masks and zonal summaries.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use ndarray::Array2;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::Outline;
use crate::{ElevationSample, GlacierError, SENTINEL};

const DEFAULT_NODATA: f64 = -9999.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Surface,
    Thickness,
}

impl Layer {
    pub fn name(&self) -> &'static str {
        match self {
            Layer::Surface => "surface",
            Layer::Thickness => "thickness",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ZonalStats {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub range: f64,
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub median: f64,
}

impl ZonalStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted: Vec<OrderedFloat<f64>> = values.iter().copied().map(OrderedFloat).collect();
        sorted.sort_unstable();
        let n = sorted.len();
        let min = sorted[0].0;
        let max = sorted[n - 1].0;
        let mean = values.iter().sum::<f64>() / n as f64;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        let median = if n % 2 == 0 {
            (sorted[n / 2 - 1].0 + sorted[n / 2].0) / 2.0
        } else {
            sorted[n / 2].0
        };
        Some(Self {
            count: n,
            min,
            max,
            range: max - min,
            mean,
            std: var.sqrt(),
            median,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SurfaceRatio {
    pub area_2d: f64,
    pub area_3d: f64,
}

impl SurfaceRatio {
    pub fn ratio(&self) -> Option<f64> {
        if self.area_2d > 0.0 {
            Some(self.area_3d / self.area_2d)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TerrainSummary {
    /// Degrees.
    pub mean_slope: f64,
    /// Degrees clockwise from north; [`SENTINEL`] when every cell is flat.
    pub mean_aspect: f64,
}

/// Raster access used by the attribute engine.
///
/// `acquire` builds whatever per-outline state the service needs (a cell
/// mask for [`GridRasterService`]); the engine drops it once the outline is
/// done.
pub trait RasterService: Sync {
    type Workspace;

    fn acquire(&self, outline: &Outline) -> Result<Self::Workspace, GlacierError>;

    fn extract_elevations(&self, ws: &Self::Workspace) -> Result<ElevationSample, GlacierError>;

    fn has_layer(&self, layer: Layer) -> bool {
        layer == Layer::Surface
    }

    fn zonal_stats(&self, ws: &Self::Workspace, layer: Layer) -> Result<ZonalStats, GlacierError>;

    fn surface_ratio(&self, ws: &Self::Workspace) -> Result<SurfaceRatio, GlacierError>;

    fn terrain(&self, ws: &Self::Workspace) -> Result<TerrainSummary, GlacierError>;
}

/// Zonal statistics for every outline, keyed by 1-based polygon id.
/// Outlines without valid cells are left out.
pub fn zonal_table<S: RasterService>(
    service: &S,
    outlines: &[Outline],
    layer: Layer,
) -> Result<BTreeMap<usize, ZonalStats>, GlacierError> {
    let mut table = BTreeMap::new();
    for (i, outline) in outlines.iter().enumerate() {
        let ws = service.acquire(outline)?;
        match service.zonal_stats(&ws, layer) {
            Ok(stats) => {
                table.insert(i + 1, stats);
            }
            Err(GlacierError::EmptySample) => debug!("polygon {} has no {} cells", i + 1, layer.name()),
            Err(e) => return Err(e),
        }
    }
    Ok(table)
}

/// North-up regular grid. Nodata cells are stored as NaN.
#[derive(Clone, Debug)]
pub struct Grid {
    data: Array2<f64>,
    x_min: f64,
    y_max: f64,
    cellsize: f64,
}

impl Grid {
    /// `x_min`/`y_max` are the outer edges of the top-left cell.
    pub fn new(data: Array2<f64>, x_min: f64, y_max: f64, cellsize: f64) -> Result<Self, GlacierError> {
        if !(cellsize.is_finite() && cellsize > 0.0) {
            return Err(GlacierError::Raster(format!("invalid cell size {}", cellsize)));
        }
        if data.is_empty() {
            return Err(GlacierError::Raster("grid has no cells".into()));
        }
        Ok(Self {
            data,
            x_min,
            y_max,
            cellsize,
        })
    }

    pub fn read_ascii(path: &Path) -> Result<Self, GlacierError> {
        let text = fs::read_to_string(path)?;
        Self::parse_ascii(&text)
            .map_err(|e| GlacierError::Raster(format!("{}: {}", path.display(), e)))
    }

    /// Parse an ESRI ASCII grid (`ncols`, `nrows`, `xllcorner`/`xllcenter`,
    /// `yllcorner`/`yllcenter`, `cellsize`, optional `NODATA_value`).
    pub fn parse_ascii(text: &str) -> Result<Self, GlacierError> {
        let mut ncols: Option<usize> = None;
        let mut nrows: Option<usize> = None;
        let mut xll: Option<(f64, bool)> = None;
        let mut yll: Option<(f64, bool)> = None;
        let mut cellsize: Option<f64> = None;
        let mut nodata = DEFAULT_NODATA;

        let mut lines = text.lines().peekable();
        while let Some(&line) = lines.peek() {
            let mut parts = line.split_whitespace();
            let key = match parts.next() {
                Some(k) if k.chars().next().map_or(false, |c| c.is_ascii_alphabetic()) => {
                    k.to_ascii_lowercase()
                }
                Some(_) => break,
                None => {
                    lines.next();
                    continue;
                }
            };
            let value = parts
                .next()
                .ok_or_else(|| GlacierError::Raster(format!("header '{}' has no value", key)))?;
            let number = |v: &str| -> Result<f64, GlacierError> {
                v.parse::<f64>()
                    .map_err(|_| GlacierError::Raster(format!("bad value '{}' for {}", v, key)))
            };
            match key.as_str() {
                "ncols" => ncols = Some(number(value)? as usize),
                "nrows" => nrows = Some(number(value)? as usize),
                "xllcorner" => xll = Some((number(value)?, false)),
                "xllcenter" => xll = Some((number(value)?, true)),
                "yllcorner" => yll = Some((number(value)?, false)),
                "yllcenter" => yll = Some((number(value)?, true)),
                "cellsize" => cellsize = Some(number(value)?),
                "nodata_value" => nodata = number(value)?,
                other => return Err(GlacierError::Raster(format!("unknown header '{}'", other))),
            }
            lines.next();
        }

        let missing = |name: &str| GlacierError::Raster(format!("missing header '{}'", name));
        let ncols = ncols.ok_or_else(|| missing("ncols"))?;
        let nrows = nrows.ok_or_else(|| missing("nrows"))?;
        let cellsize = cellsize.ok_or_else(|| missing("cellsize"))?;
        let (xll, x_centered) = xll.ok_or_else(|| missing("xllcorner"))?;
        let (yll, y_centered) = yll.ok_or_else(|| missing("yllcorner"))?;

        let count = ncols.checked_mul(nrows).ok_or_else(|| {
            GlacierError::Raster(format!("grid size {} x {} overflows", nrows, ncols))
        })?;
        // Each cell needs at least two bytes of text, so never reserve more.
        let mut values = Vec::with_capacity(count.min(text.len() / 2 + 1));
        for line in lines {
            for token in line.split_whitespace() {
                let v: f64 = token
                    .parse()
                    .map_err(|_| GlacierError::Raster(format!("bad cell value '{}'", token)))?;
                values.push(if v == nodata { f64::NAN } else { v });
            }
        }
        if values.len() != count {
            return Err(GlacierError::Raster(format!(
                "expected {} cells ({} x {}), found {}",
                count,
                nrows,
                ncols,
                values.len()
            )));
        }
        let data = Array2::from_shape_vec((nrows, ncols), values)
            .map_err(|e| GlacierError::Raster(e.to_string()))?;

        let x_min = if x_centered { xll - cellsize / 2.0 } else { xll };
        let y_min = if y_centered { yll - cellsize / 2.0 } else { yll };
        Self::new(data, x_min, y_min + nrows as f64 * cellsize, cellsize)
    }

    pub fn nrows(&self) -> usize {
        self.data.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    pub fn cellsize(&self) -> f64 {
        self.cellsize
    }

    pub fn cell_area(&self) -> f64 {
        self.cellsize * self.cellsize
    }

    /// Valid value at a cell, `None` outside the grid or on nodata.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        self.data.get((row, col)).copied().filter(|v| v.is_finite())
    }

    pub fn cell_center(&self, row: usize, col: usize) -> [f64; 2] {
        [
            self.x_min + (col as f64 + 0.5) * self.cellsize,
            self.y_max - (row as f64 + 0.5) * self.cellsize,
        ]
    }

    /// Cells whose centre lies inside the outline.
    pub fn mask(&self, outline: &Outline) -> Vec<(usize, usize)> {
        let bbox = match outline.bbox() {
            Some(b) => b,
            None => return Vec::new(),
        };
        let clamp = |v: f64, n: usize| v.max(0.0).min(n as f64) as usize;
        let col_lo = clamp(((bbox.min_x - self.x_min) / self.cellsize).floor(), self.ncols());
        let col_hi = clamp(((bbox.max_x - self.x_min) / self.cellsize).ceil(), self.ncols());
        let row_lo = clamp(((self.y_max - bbox.max_y) / self.cellsize).floor(), self.nrows());
        let row_hi = clamp(((self.y_max - bbox.min_y) / self.cellsize).ceil(), self.nrows());

        let mut cells = Vec::new();
        for row in row_lo..row_hi {
            for col in col_lo..col_hi {
                let [x, y] = self.cell_center(row, col);
                if outline.contains(x, y) {
                    cells.push((row, col));
                }
            }
        }
        cells
    }

    /// Horn (3x3) surface gradients `(dz/dx, dz/dy)` with x east and y south.
    /// Missing neighbours take the centre value.
    pub fn horn_gradients(&self, row: usize, col: usize) -> Option<(f64, f64)> {
        let z = self.get(row, col)?;
        let at = |dr: isize, dc: isize| -> f64 {
            let r = row as isize + dr;
            let c = col as isize + dc;
            if r < 0 || c < 0 {
                return z;
            }
            self.get(r as usize, c as usize).unwrap_or(z)
        };
        let (a, b, c) = (at(-1, -1), at(-1, 0), at(-1, 1));
        let (d, f) = (at(0, -1), at(0, 1));
        let (g, h, i) = (at(1, -1), at(1, 0), at(1, 1));
        let dzdx = ((c + 2.0 * f + i) - (a + 2.0 * d + g)) / (8.0 * self.cellsize);
        let dzdy = ((g + 2.0 * h + i) - (a + 2.0 * b + c)) / (8.0 * self.cellsize);
        Some((dzdx, dzdy))
    }
}

/// Slope in degrees from Horn gradients.
pub fn slope_degrees(dzdx: f64, dzdy: f64) -> f64 {
    (dzdx * dzdx + dzdy * dzdy).sqrt().atan().to_degrees()
}

/// Downslope direction in degrees clockwise from north, `None` on flat cells.
pub fn aspect_degrees(dzdx: f64, dzdy: f64) -> Option<f64> {
    if dzdx == 0.0 && dzdy == 0.0 {
        return None;
    }
    let a = dzdy.atan2(-dzdx).to_degrees();
    Some(if a < 0.0 {
        90.0 - a
    } else if a > 90.0 {
        450.0 - a
    } else {
        90.0 - a
    })
}

/// Cell lists for one outline on each loaded grid.
#[derive(Debug, Default)]
pub struct GridMask {
    surface: Vec<(usize, usize)>,
    thickness: Vec<(usize, usize)>,
}

impl GridMask {
    pub fn surface_cells(&self) -> &[(usize, usize)] {
        &self.surface
    }
}

/// In-memory surface DEM plus an optional ice-thickness grid.
#[derive(Clone, Debug)]
pub struct GridRasterService {
    surface: Grid,
    thickness: Option<Grid>,
}

impl GridRasterService {
    pub fn new(surface: Grid, thickness: Option<Grid>) -> Self {
        Self { surface, thickness }
    }

    fn grid(&self, layer: Layer) -> Option<&Grid> {
        match layer {
            Layer::Surface => Some(&self.surface),
            Layer::Thickness => self.thickness.as_ref(),
        }
    }
}

impl RasterService for GridRasterService {
    type Workspace = GridMask;

    fn acquire(&self, outline: &Outline) -> Result<GridMask, GlacierError> {
        Ok(GridMask {
            surface: self.surface.mask(outline),
            thickness: self
                .thickness
                .as_ref()
                .map(|g| g.mask(outline))
                .unwrap_or_default(),
        })
    }

    fn extract_elevations(&self, ws: &GridMask) -> Result<ElevationSample, GlacierError> {
        ElevationSample::new(ws.surface.iter().filter_map(|&(r, c)| self.surface.get(r, c)))
    }

    fn has_layer(&self, layer: Layer) -> bool {
        self.grid(layer).is_some()
    }

    fn zonal_stats(&self, ws: &GridMask, layer: Layer) -> Result<ZonalStats, GlacierError> {
        let grid = self
            .grid(layer)
            .ok_or_else(|| GlacierError::Raster(format!("no {} raster loaded", layer.name())))?;
        let cells = match layer {
            Layer::Surface => &ws.surface,
            Layer::Thickness => &ws.thickness,
        };
        let values: Vec<f64> = cells.iter().filter_map(|&(r, c)| grid.get(r, c)).collect();
        ZonalStats::from_values(&values).ok_or(GlacierError::EmptySample)
    }

    fn surface_ratio(&self, ws: &GridMask) -> Result<SurfaceRatio, GlacierError> {
        let cell_area = self.surface.cell_area();
        let mut out = SurfaceRatio {
            area_2d: 0.0,
            area_3d: 0.0,
        };
        for &(r, c) in &ws.surface {
            if let Some((p, q)) = self.surface.horn_gradients(r, c) {
                out.area_2d += cell_area;
                out.area_3d += cell_area * (1.0 + p * p + q * q).sqrt();
            }
        }
        if out.area_2d == 0.0 {
            return Err(GlacierError::EmptySample);
        }
        Ok(out)
    }

    fn terrain(&self, ws: &GridMask) -> Result<TerrainSummary, GlacierError> {
        let mut slope_sum = 0.0;
        let mut n = 0usize;
        let (mut sin_sum, mut cos_sum, mut n_aspect) = (0.0, 0.0, 0usize);
        for &(r, c) in &ws.surface {
            let (p, q) = match self.surface.horn_gradients(r, c) {
                Some(g) => g,
                None => continue,
            };
            slope_sum += slope_degrees(p, q);
            n += 1;
            if let Some(aspect) = aspect_degrees(p, q) {
                let rad = aspect.to_radians();
                sin_sum += rad.sin();
                cos_sum += rad.cos();
                n_aspect += 1;
            }
        }
        if n == 0 {
            return Err(GlacierError::EmptySample);
        }
        let mean_aspect = if n_aspect == 0 {
            SENTINEL
        } else {
            sin_sum.atan2(cos_sum).to_degrees().rem_euclid(360.0)
        };
        Ok(TerrainSummary {
            mean_slope: slope_sum / n as f64,
            mean_aspect,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 5x5 plane rising 10 m per 10 m cell toward the east.
    fn east_ramp() -> Grid {
        let data = Array2::from_shape_fn((5, 5), |(_, c)| 1000.0 + 10.0 * c as f64);
        Grid::new(data, 0.0, 50.0, 10.0).unwrap()
    }

    fn interior_square() -> Outline {
        Outline::from_exterior(vec![[10.0, 10.0], [40.0, 10.0], [40.0, 40.0], [10.0, 40.0], [10.0, 10.0]])
    }

    #[test]
    fn parses_ascii_grid_with_nodata() {
        let text = "ncols 3\nnrows 2\nxllcorner 100\nyllcorner 200\ncellsize 10\nNODATA_value -9999\n\
                    1 2 3\n4 -9999 6\n";
        let grid = Grid::parse_ascii(text).unwrap();
        assert_eq!((grid.nrows(), grid.ncols()), (2, 3));
        assert_eq!(grid.get(0, 2), Some(3.0));
        assert_eq!(grid.get(1, 1), None);
        assert_eq!(grid.cell_center(0, 0), [105.0, 215.0]);
    }

    #[test]
    fn xllcenter_shifts_origin_by_half_cell() {
        let text = "ncols 1\nnrows 1\nxllcenter 5\nyllcenter 5\ncellsize 10\n7\n";
        let grid = Grid::parse_ascii(text).unwrap();
        assert_eq!(grid.cell_center(0, 0), [5.0, 5.0]);
    }

    #[test]
    fn rejects_short_ascii_grid() {
        let text = "ncols 2\nnrows 2\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2 3\n";
        assert!(matches!(Grid::parse_ascii(text), Err(GlacierError::Raster(_))));
    }

    #[test]
    fn rejects_oversized_ascii_header() {
        let text = "ncols 4294967296\nnrows 4294967296\nxllcorner 0\nyllcorner 0\ncellsize 1\n1\n";
        assert!(matches!(Grid::parse_ascii(text), Err(GlacierError::Raster(_))));

        let text = "ncols 100000\nnrows 100000\nxllcorner 0\nyllcorner 0\ncellsize 1\n1 2\n";
        assert!(matches!(Grid::parse_ascii(text), Err(GlacierError::Raster(_))));
    }

    #[test]
    fn mask_selects_cells_with_centres_inside() {
        let grid = east_ramp();
        let cells = grid.mask(&interior_square());
        assert_eq!(cells.len(), 9);
        assert!(cells.iter().all(|&(r, c)| (1..=3).contains(&r) && (1..=3).contains(&c)));

        let far = Outline::from_exterior(vec![[500.0, 500.0], [600.0, 500.0], [600.0, 600.0], [500.0, 500.0]]);
        assert!(grid.mask(&far).is_empty());
    }

    #[test]
    fn ramp_slope_aspect_and_surface_ratio() {
        let service = GridRasterService::new(east_ramp(), None);
        let ws = service.acquire(&interior_square()).unwrap();

        let terrain = service.terrain(&ws).unwrap();
        assert!((terrain.mean_slope - 45.0).abs() < 1e-9);
        // Rising to the east means facing west.
        assert!((terrain.mean_aspect - 270.0).abs() < 1e-9);

        let sr = service.surface_ratio(&ws).unwrap();
        assert!((sr.area_2d - 900.0).abs() < 1e-9);
        assert!((sr.ratio().unwrap() - 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn aspect_follows_compass_convention() {
        // Rising to the south faces north.
        assert!((aspect_degrees(0.0, 1.0).unwrap() - 0.0).abs() < 1e-9);
        assert!((aspect_degrees(-1.0, 0.0).unwrap() - 90.0).abs() < 1e-9);
        assert!((aspect_degrees(0.0, -1.0).unwrap() - 180.0).abs() < 1e-9);
        assert!(aspect_degrees(0.0, 0.0).is_none());
    }

    #[test]
    fn zonal_stats_over_thickness_layer() {
        let thickness = Array2::from_shape_fn((5, 5), |(r, c)| (r * 5 + c) as f64);
        let service = GridRasterService::new(east_ramp(), Some(Grid::new(thickness, 0.0, 50.0, 10.0).unwrap()));
        let ws = service.acquire(&interior_square()).unwrap();
        let stats = service.zonal_stats(&ws, Layer::Thickness).unwrap();
        assert_eq!(stats.count, 9);
        assert_eq!(stats.min, 6.0);
        assert_eq!(stats.max, 18.0);
        assert_eq!(stats.median, 12.0);
        assert!((stats.mean - 12.0).abs() < 1e-12);

        let no_thickness = GridRasterService::new(east_ramp(), None);
        assert!(!no_thickness.has_layer(Layer::Thickness));
        let ws = no_thickness.acquire(&interior_square()).unwrap();
        assert!(no_thickness.zonal_stats(&ws, Layer::Thickness).is_err());
    }

    #[test]
    fn zonal_table_skips_outlines_off_the_grid() {
        let service = GridRasterService::new(east_ramp(), None);
        let far = Outline::from_exterior(vec![[500.0, 500.0], [600.0, 500.0], [600.0, 600.0], [500.0, 500.0]]);
        let table = zonal_table(&service, &[interior_square(), far], Layer::Surface).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[&1].min, 1010.0);
        assert_eq!(table[&1].max, 1030.0);
    }
}
