//! The spatial gateway: the only place in this core that touches raw
//! geometry. Everything upstream (feature extractor, manipulator,
//! partitioning engine) goes through this trait so a test double can stand
//! in for the one shipped, in-process implementation.

use geo::{Centroid, MultiLineString, MultiPolygon, Point, Rect, Simplify};
use rstar::AABB;

use crate::geom;
use crate::inputs::{InputData, OsmPlace, PlaceKind};

pub trait SpatialGateway {
    fn area_geodesic(&self, geom: &MultiPolygon<f64>) -> f64;
    fn area_planar(&self, geom: &MultiPolygon<f64>) -> f64;
    fn contains(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool;
    fn intersects(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool;
    fn intersection(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64>;
    fn union(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64>;
    fn difference(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64>;
    fn length_geodesic(&self, line: &MultiLineString<f64>) -> f64;
    fn simplify_preserving_topology(&self, geom: &MultiPolygon<f64>, tolerance: f64) -> MultiPolygon<f64>;
    fn split_by_line(&self, geom: &MultiPolygon<f64>, line: &geo::Line<f64>) -> Vec<MultiPolygon<f64>>;
    fn envelope(&self, geom: &MultiPolygon<f64>) -> Option<Rect<f64>>;
    fn centroid(&self, geom: &MultiPolygon<f64>) -> Option<Point<f64>>;
    fn dump_polygons(&self, multi: &MultiPolygon<f64>) -> Vec<MultiPolygon<f64>>;
    fn buffer(&self, geom: &MultiPolygon<f64>, meters: f64) -> MultiPolygon<f64>;
    fn make_valid(&self, geom: &MultiPolygon<f64>) -> MultiPolygon<f64>;
    fn convex_hull(&self, geom: &MultiPolygon<f64>) -> MultiPolygon<f64>;
}

/// The one concrete gateway this core ships: computes every primitive
/// in-process over `geo` and serves the read-only reference collections
/// out of `rstar` indices rather than a network round trip. See
/// `InputData` for the indexed collections.
pub struct InProcessGateway {
    pub inputs: InputData,
}

impl InProcessGateway {
    pub fn new(inputs: InputData) -> Self {
        InProcessGateway { inputs }
    }

    fn bbox_envelope(rect: Rect<f64>) -> AABB<[f64; 2]> {
        AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
    }

    /// Union of land polygons whose bbox intersects `bbox`, per §4.C step 1.
    pub fn land_union_near(&self, bbox: Rect<f64>) -> MultiPolygon<f64> {
        let envelope = Self::bbox_envelope(bbox);
        let mut acc = MultiPolygon::new(vec![]);
        for land in self.inputs.land_polygons.locate_in_envelope_intersecting(&envelope) {
            acc = geom::union(&acc, &land.geom);
        }
        acc
    }

    /// Coastline segments whose bbox hits `bbox`, per §4.C step 4.
    pub fn coastlines_near(&self, bbox: Rect<f64>) -> MultiLineString<f64> {
        let envelope = Self::bbox_envelope(bbox);
        let lines: Vec<_> = self
            .inputs
            .coastlines
            .locate_in_envelope_intersecting(&envelope)
            .map(|c| c.line.clone())
            .collect();
        MultiLineString::new(lines)
    }

    /// OsmPlace points contained in `geom`, per §4.C step 3.
    pub fn places_within(&self, geom: &MultiPolygon<f64>) -> Vec<&OsmPlace> {
        let bbox = match geom.bounding_rect() {
            Some(b) => b,
            None => return vec![],
        };
        let envelope = Self::bbox_envelope(bbox);
        self.inputs
            .osm_places
            .locate_in_envelope_intersecting(&envelope)
            .filter(|place| self.contains_point(geom, place.center))
            .collect()
    }

    fn contains_point(&self, geom: &MultiPolygon<f64>, point: Point<f64>) -> bool {
        use geo::Contains;
        geom.contains(&point)
    }

    /// Aggregates city/hamlet counts and city population for places within
    /// `geom`, per §4.C step 3's {city,town} vs. other classification.
    pub fn classify_places(&self, geom: &MultiPolygon<f64>) -> (u64, u64, u64) {
        let mut city_count = 0u64;
        let mut city_population_sum = 0u64;
        let mut hamlet_count = 0u64;
        for place in self.places_within(geom) {
            if place.place.counts_as_city() {
                city_count += 1;
                city_population_sum += place.population;
            } else {
                hamlet_count += 1;
            }
        }
        (city_count, city_population_sum, hamlet_count)
    }

    /// OSM administrative polygons at `admin_level` contained in `geom`,
    /// used by country bootstrap's `divide_region_into_subregions`.
    pub fn osm_borders_within(&self, geom: &MultiPolygon<f64>, admin_level: u8) -> Vec<&crate::inputs::OsmBorder> {
        let bbox = match geom.bounding_rect() {
            Some(b) => b,
            None => return vec![],
        };
        let envelope = Self::bbox_envelope(bbox);
        self.inputs
            .osm_borders
            .locate_in_envelope_intersecting(&envelope)
            .filter(|border| border.admin_level == admin_level && self.contains(geom, &border.geom))
            .collect()
    }

    /// Sum of tile counts intersecting `geom`, for the background worker.
    pub fn tile_count_sum(&self, geom: &MultiPolygon<f64>) -> i64 {
        use geo::Intersects;
        let bbox = match geom.bounding_rect() {
            Some(b) => b,
            None => return 0,
        };
        let envelope = Self::bbox_envelope(bbox);
        self.inputs
            .tiles
            .locate_in_envelope_intersecting(&envelope)
            .filter(|tile| geom.intersects(&tile.bbox.to_polygon()))
            .map(|tile| tile.count)
            .sum()
    }
}

use geo::BoundingRect;

impl SpatialGateway for InProcessGateway {
    fn area_geodesic(&self, geom: &MultiPolygon<f64>) -> f64 {
        geom::area_geodesic_km2(geom)
    }

    fn area_planar(&self, geom: &MultiPolygon<f64>) -> f64 {
        geom::area_planar_deg2(geom)
    }

    fn contains(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
        geom::contains(a, b)
    }

    fn intersects(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> bool {
        geom::intersects(a, b)
    }

    fn intersection(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        geom::intersection(a, b)
    }

    fn union(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        geom::union(a, b)
    }

    fn difference(&self, a: &MultiPolygon<f64>, b: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        geom::difference(a, b)
    }

    fn length_geodesic(&self, line: &MultiLineString<f64>) -> f64 {
        geom::length_geodesic_m(line)
    }

    fn simplify_preserving_topology(&self, geom: &MultiPolygon<f64>, tolerance: f64) -> MultiPolygon<f64> {
        if tolerance <= 0.0 {
            return geom.clone();
        }
        geom.simplify(&tolerance)
    }

    fn split_by_line(&self, geom: &MultiPolygon<f64>, line: &geo::Line<f64>) -> Vec<MultiPolygon<f64>> {
        crate::geom::split_by_line(geom, line)
            .into_iter()
            .map(|p| MultiPolygon::new(vec![p]))
            .collect()
    }

    fn envelope(&self, geom: &MultiPolygon<f64>) -> Option<Rect<f64>> {
        crate::geom::envelope(geom)
    }

    fn centroid(&self, geom: &MultiPolygon<f64>) -> Option<Point<f64>> {
        geom.centroid()
    }

    fn dump_polygons(&self, multi: &MultiPolygon<f64>) -> Vec<MultiPolygon<f64>> {
        multi.0.iter().cloned().map(|p| MultiPolygon::new(vec![p])).collect()
    }

    fn buffer(&self, geom: &MultiPolygon<f64>, meters: f64) -> MultiPolygon<f64> {
        crate::geom::buffer(geom, meters)
    }

    fn make_valid(&self, geom: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        crate::geom::make_valid(geom)
    }

    fn convex_hull(&self, geom: &MultiPolygon<f64>) -> MultiPolygon<f64> {
        crate::geom::convex_hull(geom)
    }
}
