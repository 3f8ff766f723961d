//! Read-only input collections the spatial gateway indexes:
//! `OsmBorder`, `OsmPlace`, `LandPolygon`, `Coastline`, `Tile`. These are
//! never written by the core; they are loaded once (typically from WKT/CSV
//! extracts) and queried through an R-tree per collection.

use geo::{LineString, MultiPolygon, Point, Rect};
use rstar::{RTree, RTreeObject, AABB};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaceKind {
    City,
    Town,
    Village,
    Hamlet,
    Other(String),
}

impl PlaceKind {
    pub fn counts_as_city(&self) -> bool {
        matches!(self, PlaceKind::City | PlaceKind::Town)
    }

    pub fn from_osm_tag(value: &str) -> PlaceKind {
        match value {
            "city" => PlaceKind::City,
            "town" => PlaceKind::Town,
            "village" => PlaceKind::Village,
            "hamlet" => PlaceKind::Hamlet,
            other => PlaceKind::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OsmBorder {
    pub osm_id: i64,
    pub name: String,
    pub admin_level: u8,
    pub geom: MultiPolygon<f64>,
}

#[derive(Debug, Clone)]
pub struct OsmPlace {
    pub name: String,
    pub place: PlaceKind,
    pub population: u64,
    pub center: Point<f64>,
}

#[derive(Debug, Clone)]
pub struct LandPolygon {
    pub geom: MultiPolygon<f64>,
}

#[derive(Debug, Clone)]
pub struct Coastline {
    pub line: LineString<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct Tile {
    pub bbox: Rect<f64>,
    pub count: i64,
}

macro_rules! envelope_via_bbox {
    ($ty:ty, $field:ident, $bbox_fn:expr) => {
        impl RTreeObject for $ty {
            type Envelope = AABB<[f64; 2]>;
            fn envelope(&self) -> Self::Envelope {
                #[allow(clippy::redundant_closure_call)]
                let rect: Option<Rect<f64>> = $bbox_fn(&self.$field);
                match rect {
                    Some(r) => AABB::from_corners(
                        [r.min().x, r.min().y],
                        [r.max().x, r.max().y],
                    ),
                    None => AABB::from_point([0.0, 0.0]),
                }
            }
        }
    };
}

use geo::BoundingRect;

envelope_via_bbox!(OsmBorder, geom, |g: &MultiPolygon<f64>| g.bounding_rect());
envelope_via_bbox!(LandPolygon, geom, |g: &MultiPolygon<f64>| g.bounding_rect());
envelope_via_bbox!(Coastline, line, |g: &LineString<f64>| g.bounding_rect());

impl RTreeObject for OsmPlace {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.center.x(), self.center.y()])
    }
}

impl RTreeObject for Tile {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bbox.min().x, self.bbox.min().y],
            [self.bbox.max().x, self.bbox.max().y],
        )
    }
}

/// Bundles the four read-only reference datasets plus the tile grid into
/// one set of R-tree indices, built once at load time.
pub struct InputData {
    pub osm_borders: RTree<OsmBorder>,
    pub osm_places: RTree<OsmPlace>,
    pub land_polygons: RTree<LandPolygon>,
    pub coastlines: RTree<Coastline>,
    pub tiles: RTree<Tile>,
}

impl InputData {
    pub fn new(
        osm_borders: Vec<OsmBorder>,
        osm_places: Vec<OsmPlace>,
        land_polygons: Vec<LandPolygon>,
        coastlines: Vec<Coastline>,
        tiles: Vec<Tile>,
    ) -> Self {
        InputData {
            osm_borders: RTree::bulk_load(osm_borders),
            osm_places: RTree::bulk_load(osm_places),
            land_polygons: RTree::bulk_load(land_polygons),
            coastlines: RTree::bulk_load(coastlines),
            tiles: RTree::bulk_load(tiles),
        }
    }

    pub fn empty() -> Self {
        InputData::new(vec![], vec![], vec![], vec![], vec![])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{polygon, coord};

    #[test]
    fn place_kind_classifies_city_and_town_as_city() {
        assert!(PlaceKind::City.counts_as_city());
        assert!(PlaceKind::Town.counts_as_city());
        assert!(!PlaceKind::Village.counts_as_city());
        assert!(!PlaceKind::Hamlet.counts_as_city());
    }

    #[test]
    fn rtree_can_be_queried_by_envelope() {
        let land = LandPolygon {
            geom: MultiPolygon::new(vec![polygon![
                (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0), (x: 0.0, y: 0.0),
            ]]),
        };
        let tree = RTree::bulk_load(vec![land]);
        let hits: Vec<&LandPolygon> = tree
            .locate_in_envelope_intersecting(&AABB::from_corners([0.5, 0.5], [2.0, 2.0]))
            .collect();
        assert_eq!(hits.len(), 1);
        let _ = coord! { x: 0.0, y: 0.0 };
    }
}
