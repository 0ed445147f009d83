//! Glacier outline polygons: planar measures, point-in-polygon and GeoJSON input.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::GlacierError;

pub type Ring = Vec<[f64; 2]>;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Polygon {
    pub exterior: Ring,
    pub holes: Vec<Ring>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bbox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Outline {
    /// Existing `PGI_ID` property, kept verbatim.
    pub pgi_id: Option<String>,
    pub polygons: Vec<Polygon>,
    /// Centroid longitude/latitude carried on the feature (`Cenlon`/`Cenlat`).
    pub anchor_lonlat: Option<(f64, f64)>,
}

impl Outline {
    pub fn from_exterior(exterior: Ring) -> Self {
        Self {
            pgi_id: None,
            polygons: vec![Polygon {
                exterior,
                holes: Vec::new(),
            }],
            anchor_lonlat: None,
        }
    }

    fn rings(&self) -> impl Iterator<Item = (&Ring, bool)> {
        self.polygons.iter().flat_map(|p| {
            std::iter::once((&p.exterior, true)).chain(p.holes.iter().map(|h| (h, false)))
        })
    }

    /// Planar area with holes removed.
    pub fn area(&self) -> f64 {
        self.rings()
            .map(|(ring, outer)| {
                let a = ring_signed_area(ring).abs();
                if outer {
                    a
                } else {
                    -a
                }
            })
            .sum::<f64>()
            .max(0.0)
    }

    /// Length of every ring boundary, holes included.
    pub fn perimeter(&self) -> f64 {
        self.rings().map(|(ring, _)| ring_length(ring)).sum()
    }

    /// Area-weighted centroid.
    pub fn centroid(&self) -> Option<[f64; 2]> {
        let mut sx = 0.0;
        let mut sy = 0.0;
        let mut total = 0.0;
        for (ring, outer) in self.rings() {
            let signed = ring_signed_area(ring);
            if signed == 0.0 {
                continue;
            }
            let [cx, cy] = ring_centroid(ring, signed);
            let weight = if outer { signed.abs() } else { -signed.abs() };
            sx += cx * weight;
            sy += cy * weight;
            total += weight;
        }
        if total.abs() < f64::EPSILON {
            return None;
        }
        Some([sx / total, sy / total])
    }

    pub fn bbox(&self) -> Option<Bbox> {
        let mut points = self.polygons.iter().flat_map(|p| p.exterior.iter());
        let first = points.next()?;
        let mut bbox = Bbox {
            min_x: first[0],
            min_y: first[1],
            max_x: first[0],
            max_y: first[1],
        };
        for p in points {
            bbox.min_x = bbox.min_x.min(p[0]);
            bbox.min_y = bbox.min_y.min(p[1]);
            bbox.max_x = bbox.max_x.max(p[0]);
            bbox.max_y = bbox.max_y.max(p[1]);
        }
        Some(bbox)
    }

    /// Even-odd containment; holes exclude, any member polygon includes.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        self.polygons.iter().any(|p| {
            let mut inside = ring_crossings(&p.exterior, x, y);
            for hole in &p.holes {
                if ring_crossings(hole, x, y) {
                    inside = !inside;
                }
            }
            inside
        })
    }
}

fn ring_segments(ring: &Ring) -> impl Iterator<Item = ([f64; 2], [f64; 2])> + '_ {
    let n = ring.len();
    let closed = n > 1 && ring[0] == ring[n - 1];
    let count = if closed { n - 1 } else { n };
    (0..count).map(move |i| (ring[i], ring[(i + 1) % n]))
}

fn ring_signed_area(ring: &Ring) -> f64 {
    if ring.len() < 3 {
        return 0.0;
    }
    ring_segments(ring)
        .map(|(a, b)| a[0] * b[1] - b[0] * a[1])
        .sum::<f64>()
        / 2.0
}

fn ring_centroid(ring: &Ring, signed_area: f64) -> [f64; 2] {
    let mut cx = 0.0;
    let mut cy = 0.0;
    for (a, b) in ring_segments(ring) {
        let cross = a[0] * b[1] - b[0] * a[1];
        cx += (a[0] + b[0]) * cross;
        cy += (a[1] + b[1]) * cross;
    }
    let denom = 6.0 * signed_area;
    [cx / denom, cy / denom]
}

fn ring_length(ring: &Ring) -> f64 {
    if ring.len() < 2 {
        return 0.0;
    }
    ring_segments(ring)
        .map(|(a, b)| ((b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2)).sqrt())
        .sum()
}

fn ring_crossings(ring: &Ring, x: f64, y: f64) -> bool {
    let mut inside = false;
    for (a, b) in ring_segments(ring) {
        if (a[1] > y) != (b[1] > y) {
            let t = (y - a[1]) / (b[1] - a[1]);
            if x < a[0] + t * (b[0] - a[0]) {
                inside = !inside;
            }
        }
    }
    inside
}

/// `PGI_<stage>_<lon><E|W><lat><N|S>` identifier from a centroid in degrees.
pub fn coordinate_id(stage: &str, lon: f64, lat: f64) -> String {
    format!(
        "PGI_{}_{}{}",
        stage,
        coordinate_token(lon, 'E', 'W'),
        coordinate_token(lat, 'N', 'S')
    )
}

// Absolute value cut (not rounded) to three decimals, padded with a single
// leading zero when shorter than six characters.
fn coordinate_token(value: f64, positive: char, negative: char) -> String {
    let mut text = format!("{}", value.abs());
    if !text.contains('.') {
        text.push_str(".0");
    }
    if let Some(dot) = text.find('.') {
        text.truncate((dot + 4).min(text.len()));
    }
    if text.len() < 6 {
        text.insert(0, '0');
    }
    text.push(if value < 0.0 { negative } else { positive });
    text
}

/// Read outlines from a GeoJSON `FeatureCollection` or single `Feature`.
///
/// `Polygon` and `MultiPolygon` geometries are accepted; the optional
/// `PGI_ID`, `Cenlon` and `Cenlat` properties are carried over.
pub fn read_outlines_geojson(text: &str) -> Result<Vec<Outline>, GlacierError> {
    let json: JsonValue =
        serde_json::from_str(text).map_err(|e| GlacierError::Geometry(e.to_string()))?;
    let kind = json.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match kind {
        "FeatureCollection" => json
            .get("features")
            .and_then(|f| f.as_array())
            .ok_or_else(|| GlacierError::Geometry("FeatureCollection without features".into()))?
            .iter()
            .enumerate()
            .map(|(i, feature)| {
                parse_feature(feature)
                    .map_err(|e| GlacierError::Geometry(format!("feature {}: {}", i + 1, e)))
            })
            .collect(),
        "Feature" => Ok(vec![parse_feature(&json)?]),
        other => Err(GlacierError::Geometry(format!(
            "unsupported GeoJSON type '{}'",
            other
        ))),
    }
}

fn parse_feature(feature: &JsonValue) -> Result<Outline, GlacierError> {
    let geometry = feature
        .get("geometry")
        .ok_or_else(|| GlacierError::Geometry("feature has no geometry".into()))?;
    let coords = geometry
        .get("coordinates")
        .ok_or_else(|| GlacierError::Geometry("geometry has no coordinates".into()))?;
    let polygons = match geometry.get("type").and_then(|t| t.as_str()) {
        Some("Polygon") => vec![parse_polygon(coords)?],
        Some("MultiPolygon") => coords
            .as_array()
            .ok_or_else(|| GlacierError::Geometry("MultiPolygon coordinates".into()))?
            .iter()
            .map(parse_polygon)
            .collect::<Result<Vec<_>, _>>()?,
        Some(other) => {
            return Err(GlacierError::Geometry(format!(
                "unsupported geometry '{}'",
                other
            )))
        }
        None => return Err(GlacierError::Geometry("geometry without type".into())),
    };

    let props = feature.get("properties");
    let pgi_id = props
        .and_then(|p| p.get("PGI_ID"))
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let lon = props.and_then(|p| p.get("Cenlon")).and_then(|v| v.as_f64());
    let lat = props.and_then(|p| p.get("Cenlat")).and_then(|v| v.as_f64());

    Ok(Outline {
        pgi_id,
        polygons,
        anchor_lonlat: lon.zip(lat),
    })
}

fn parse_polygon(value: &JsonValue) -> Result<Polygon, GlacierError> {
    let rings = value
        .as_array()
        .ok_or_else(|| GlacierError::Geometry("polygon rings must be an array".into()))?;
    let mut parsed = rings.iter().map(parse_ring);
    let exterior = parsed
        .next()
        .ok_or_else(|| GlacierError::Geometry("polygon has no exterior ring".into()))??;
    if exterior.len() < 3 {
        return Err(GlacierError::Geometry(
            "exterior ring needs at least three points".into(),
        ));
    }
    let holes = parsed.collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon { exterior, holes })
}

fn parse_ring(value: &JsonValue) -> Result<Ring, GlacierError> {
    value
        .as_array()
        .ok_or_else(|| GlacierError::Geometry("ring must be an array".into()))?
        .iter()
        .map(|pt| {
            let x = pt.get(0).and_then(|v| v.as_f64());
            let y = pt.get(1).and_then(|v| v.as_f64());
            match (x, y) {
                (Some(x), Some(y)) => Ok([x, y]),
                _ => Err(GlacierError::Geometry(format!("bad coordinate {}", pt))),
            }
        })
        .collect()
}
