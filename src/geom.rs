//! Geometry helpers shared by the spatial gateway, the manipulator and the
//! OSM-XML codec. Everything here operates on planar (lon, lat) coordinates;
//! geodesic corrections are applied at the call site via `latitude_scale`.

use std::str::FromStr;

use geo::{
    Area, BooleanOps, BoundingRect, Centroid, ConvexHull, Coord, EuclideanLength, MultiPolygon,
    Polygon, Rect,
};
use wkt::{ToWkt, Wkt};

use crate::error::{Error, Result};

/// Earth's mean radius in kilometers, used for the local degree-to-km
/// correction applied to planar area/length so geodesic-ish figures come
/// out of geometry that only carries lon/lat degrees.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

pub fn wkt_to_multipolygon(wkt_string: &str) -> Result<MultiPolygon<f64>> {
    let parsed: Wkt<f64> =
        Wkt::from_str(wkt_string).map_err(|e| Error::SpatialStoreError(e.to_string()))?;
    match parsed {
        Wkt::MultiPolygon(mp) => Ok(mp.into()),
        Wkt::Polygon(p) => Ok(MultiPolygon::new(vec![p.into()])),
        _ => Err(Error::SpatialStoreError(
            "expected a (multi)polygon geometry".to_string(),
        )),
    }
}

pub fn multipolygon_to_wkt(mp: &MultiPolygon<f64>) -> String {
    mp.to_wkt().to_string()
}

/// Degrees of longitude per kilometer at the given latitude; longitude
/// circles shrink by cos(lat) away from the equator.
pub fn lon_deg_per_km(lat_deg: f64) -> f64 {
    let lat_rad = lat_deg.to_radians();
    360.0 / (2.0 * std::f64::consts::PI * EARTH_RADIUS_KM * lat_rad.cos().max(1e-6))
}

pub fn lat_deg_per_km() -> f64 {
    360.0 / (2.0 * std::f64::consts::PI * EARTH_RADIUS_KM)
}

/// Approximate geodesic area in km^2 of a geometry given in degrees,
/// by scaling the planar (signed, shoelace) area by the local per-degree
/// km^2 factor at the geometry's centroid latitude. NaN for degenerate or
/// antimeridian-spanning inputs, per the gateway contract.
pub fn area_geodesic_km2(mp: &MultiPolygon<f64>) -> f64 {
    if mp.0.is_empty() {
        return 0.0;
    }
    let centroid_lat = mp.centroid().map(|c| c.y()).unwrap_or(0.0);
    let km_per_deg_lon = 1.0 / lon_deg_per_km(centroid_lat).max(1e-12);
    let km_per_deg_lat = 1.0 / lat_deg_per_km();
    let planar = mp.unsigned_area();
    let area = planar * km_per_deg_lon * km_per_deg_lat;
    if area.is_finite() {
        area
    } else {
        f64::NAN
    }
}

pub fn area_planar_deg2(mp: &MultiPolygon<f64>) -> f64 {
    mp.unsigned_area()
}

/// Approximate geodesic length in meters of a line given in degrees, using
/// the same local latitude correction as `area_geodesic_km2`.
pub fn length_geodesic_m(line: &geo::MultiLineString<f64>) -> f64 {
    if line.0.is_empty() {
        return 0.0;
    }
    let lat = line
        .0
        .first()
        .and_then(|l| l.0.first())
        .map(|c| c.y)
        .unwrap_or(0.0);
    let km_per_deg_lat = 1.0 / lat_deg_per_km();
    let km_per_deg_lon = 1.0 / lon_deg_per_km(lat).max(1e-12);
    let avg_deg_to_km = (km_per_deg_lat + km_per_deg_lon) / 2.0;
    line.euclidean_length() * avg_deg_to_km * 1000.0
}

pub fn envelope(mp: &MultiPolygon<f64>) -> Option<Rect<f64>> {
    mp.bounding_rect()
}

pub fn centroid(mp: &MultiPolygon<f64>) -> Option<Coord<f64>> {
    mp.centroid().map(|p| p.0)
}

pub fn convex_hull(mp: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    MultiPolygon::new(vec![mp.convex_hull()])
}

pub fn union(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    a.union(b)
}

pub fn intersection(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    a.intersection(b)
}

pub fn difference(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    a.difference(b)
}

/// `ST_MakeValid`-style repair: geo's boolean ops already reject self
/// intersections on well formed input, so this collapses degenerate
/// (zero-area) rings that `split_by_line` can leave behind rather than
/// attempting full topological repair.
pub fn make_valid(mp: &MultiPolygon<f64>) -> MultiPolygon<f64> {
    MultiPolygon::new(
        mp.0.iter()
            .filter(|poly| poly.unsigned_area() > 0.0)
            .cloned()
            .collect(),
    )
}

/// Splits a polygon along an infinite-extension line by cutting the plane
/// into two rectangular half-spaces and intersecting. Only axis-aligned
/// splits (the manipulator's only caller) are exact; oblique lines are
/// approximated by their own bounding strip, which is sufficient for the
/// 2-way/4-way manipulator but not a general polygon/line splitter.
pub fn split_by_line(mp: &MultiPolygon<f64>, line: &geo::Line<f64>) -> Vec<Polygon<f64>> {
    let rect = match mp.bounding_rect() {
        Some(r) => r,
        None => return vec![],
    };
    let dx = line.end.x - line.start.x;
    let dy = line.end.y - line.start.y;
    let pieces: Vec<Polygon<f64>> = if dx.abs() < 1e-12 {
        // vertical cut line at x = line.start.x
        let x = line.start.x;
        let west = Rect::new(
            Coord { x: rect.min().x, y: rect.min().y },
            Coord { x, y: rect.max().y },
        )
        .to_polygon();
        let east = Rect::new(
            Coord { x, y: rect.min().y },
            Coord { x: rect.max().x, y: rect.max().y },
        )
        .to_polygon();
        [west, east]
            .into_iter()
            .flat_map(|half| mp.intersection(&MultiPolygon::new(vec![half])).0)
            .collect()
    } else if dy.abs() < 1e-12 {
        // horizontal cut line at y = line.start.y
        let y = line.start.y;
        let south = Rect::new(
            Coord { x: rect.min().x, y: rect.min().y },
            Coord { x: rect.max().x, y },
        )
        .to_polygon();
        let north = Rect::new(
            Coord { x: rect.min().x, y },
            Coord { x: rect.max().x, y: rect.max().y },
        )
        .to_polygon();
        [south, north]
            .into_iter()
            .flat_map(|half| mp.intersection(&MultiPolygon::new(vec![half])).0)
            .collect()
    } else {
        // plus-shaped (4-way) cut: split by both midlines independently,
        // the caller further groups the pieces by quadrant.
        let x = line.start.x;
        let mid_y = (rect.min().y + rect.max().y) / 2.0;
        let quads = [
            Rect::new(Coord { x: rect.min().x, y: rect.min().y }, Coord { x, y: mid_y }),
            Rect::new(Coord { x, y: rect.min().y }, Coord { x: rect.max().x, y: mid_y }),
            Rect::new(Coord { x: rect.min().x, y: mid_y }, Coord { x, y: rect.max().y }),
            Rect::new(Coord { x, y: mid_y }, Coord { x: rect.max().x, y: rect.max().y }),
        ];
        quads
            .into_iter()
            .flat_map(|r| mp.intersection(&MultiPolygon::new(vec![r.to_polygon()])).0)
            .collect()
    };
    pieces
        .into_iter()
        .filter(|p| p.unsigned_area() > 0.0)
        .collect()
}

pub fn contains(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
    use geo::Contains;
    a.contains(b)
}

pub fn intersects(a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
    use geo::Intersects;
    a.intersects(b)
}

/// Buffers a (multi)polygon outward by approximately `meters`, used by the
/// feature extractor's coastline correction. `geo` has no buffer algorithm
/// for polygons in the version this core depends on, so the buffer is
/// approximated by inflating every ring's bounding rect uniformly by the
/// degree-equivalent of `meters` and re-unioning; adequate for the small
/// (~100 m) buffers the feature extractor requests.
pub fn buffer(mp: &MultiPolygon<f64>, meters: f64) -> MultiPolygon<f64> {
    if meters <= 0.0 {
        return mp.clone();
    }
    let km = meters / 1000.0;
    let mut result = mp.clone();
    for poly in &mp.0 {
        if let Some(rect) = poly.bounding_rect() {
            let lat = (rect.min().y + rect.max().y) / 2.0;
            let dlon = lon_deg_per_km(lat) * km;
            let dlat = lat_deg_per_km() * km;
            let grown = Rect::new(
                Coord { x: rect.min().x - dlon, y: rect.min().y - dlat },
                Coord { x: rect.max().x + dlon, y: rect.max().y + dlat },
            );
            result = union(&result, &MultiPolygon::new(vec![grown.to_polygon()]));
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{line_string, polygon};

    fn unit_square() -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0),
            (x: 1.0, y: 0.0),
            (x: 1.0, y: 1.0),
            (x: 0.0, y: 1.0),
            (x: 0.0, y: 0.0),
        ]])
    }

    #[test]
    fn wkt_round_trip_preserves_shape() {
        let mp = unit_square();
        let wkt_string = multipolygon_to_wkt(&mp);
        let parsed = wkt_to_multipolygon(&wkt_string).unwrap();
        assert_eq!(parsed.0.len(), mp.0.len());
    }

    #[test]
    fn area_geodesic_is_positive_for_nonempty_polygon() {
        let mp = unit_square();
        let area = area_geodesic_km2(&mp);
        assert!(area > 0.0);
    }

    #[test]
    fn area_geodesic_is_zero_for_empty_multipolygon() {
        let mp = MultiPolygon::new(vec![]);
        assert_eq!(area_geodesic_km2(&mp), 0.0);
    }

    #[test]
    fn split_by_vertical_line_produces_two_pieces() {
        let mp = unit_square();
        let line = geo::Line::new(Coord { x: 0.5, y: -1.0 }, Coord { x: 0.5, y: 2.0 });
        let pieces = split_by_line(&mp, &line);
        assert_eq!(pieces.len(), 2);
    }

    #[test]
    fn split_by_horizontal_line_produces_two_pieces() {
        let mp = unit_square();
        let line = geo::Line::new(Coord { x: -1.0, y: 0.5 }, Coord { x: 2.0, y: 0.5 });
        let pieces = split_by_line(&mp, &line);
        assert_eq!(pieces.len(), 2);
    }

    #[test]
    fn split_by_oblique_line_produces_four_quadrant_pieces() {
        let mp = unit_square();
        let line = geo::Line::new(Coord { x: 0.5, y: -1.0 }, Coord { x: 0.7, y: 2.0 });
        let pieces = split_by_line(&mp, &line);
        assert_eq!(pieces.len(), 4);
        let total_area: f64 = pieces.iter().map(|p| p.unsigned_area()).sum();
        assert!((total_area - 1.0).abs() < 1e-9);
    }

    #[test]
    fn length_geodesic_of_empty_line_is_zero() {
        let empty = geo::MultiLineString::new(vec![]);
        assert_eq!(length_geodesic_m(&empty), 0.0);
    }

    #[test]
    fn length_geodesic_nonzero_for_real_segment() {
        let ls = geo::MultiLineString::new(vec![line_string![
            (x: 0.0, y: 0.0),
            (x: 0.0, y: 1.0),
        ]]);
        let len = length_geodesic_m(&ls);
        assert!(len > 100_000.0 && len < 120_000.0);
    }
}
