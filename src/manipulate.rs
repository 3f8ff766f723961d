//! Geometric manipulator: split-by-line, join, chop-largest, simple axis
//! split, and convex-hull replacement, per §4.F. Grounded on
//! `simple_splitting.py` for the exact 2-way/4-way split geometry and on
//! `borders_api_utils.py`'s join/collapse behaviour.

use geo::{Area, Centroid, Coord, Line, MultiPolygon};
use log::info;

use crate::error::{Error, Result};
use crate::features::FeatureExtractor;
use crate::gateway::{InProcessGateway, SpatialGateway};
use crate::predictor::Predictor;
use crate::store::region::Region;
use crate::store::{BorderStore, RegionMetaUpdate};

pub struct Manipulator<'a, S: BorderStore> {
    pub store: &'a S,
    pub gateway: &'a InProcessGateway,
    pub predictor: &'a Predictor,
    pub limits: &'a crate::config::ModelLimits,
}

#[derive(Debug, Clone, Copy)]
pub enum SplitMode {
    Delete,
    Retain,
}

impl<'a, S: BorderStore> Manipulator<'a, S> {
    pub fn new(
        store: &'a S,
        gateway: &'a InProcessGateway,
        predictor: &'a Predictor,
        limits: &'a crate::config::ModelLimits,
    ) -> Self {
        Manipulator { store, gateway, predictor, limits }
    }

    fn refresh_size(&self, region: &mut Region) {
        let extractor = FeatureExtractor::new(self.gateway, self.limits);
        let features = extractor.extract(region);
        region.mwm_size_est = self.predictor.predict(&features);
    }

    /// **Split by line.** Requires a single outer ring; inserts one new
    /// region per resulting piece named `{base}_{i}`.
    pub fn split_by_line(&self, region_id: i64, line: Line<f64>, mode: SplitMode) -> Result<Vec<i64>> {
        let region = self.store.get(region_id)?;
        if region.geom.0.len() != 1 {
            return Err(Error::NotSinglePolygon(region_id, region.geom.0.len()));
        }
        let pieces = self.gateway.split_by_line(&region.geom, &line);
        if pieces.len() <= 1 {
            return Ok(vec![]);
        }

        let parent_for_pieces = match mode {
            SplitMode::Delete => region.parent_id,
            SplitMode::Retain => Some(region.id),
        };

        let mut new_ids = Vec::with_capacity(pieces.len());
        for (i, piece) in pieces.into_iter().enumerate() {
            let id = self.store.allocate_free_id();
            let mut piece_region = Region::new(id, format!("{}_{}", region.name, i), piece, parent_for_pieces);
            self.refresh_size(&mut piece_region);
            self.store.create(piece_region)?;
            new_ids.push(id);
        }

        if matches!(mode, SplitMode::Delete) {
            self.store.delete(region_id)?;
        }
        info!("split region {region_id} into {} pieces", new_ids.len());
        Ok(new_ids)
    }

    /// **Join.** Merges two regions into a freshly-id'd region; collapses
    /// the parent into the joint if it is left with a single child.
    pub fn join(&self, id_a: i64, id_b: i64) -> Result<i64> {
        let a = self.store.get(id_a)?;
        let b = self.store.get(id_b)?;
        let joined_geom = self.gateway.union(&a.geom, &b.geom);
        let joined_size = match (a.mwm_size_est, b.mwm_size_est) {
            (Some(x), Some(y)) => Some(x + y),
            (Some(x), None) => Some(x),
            (None, Some(y)) => Some(y),
            (None, None) => None,
        };

        let new_id = self.store.allocate_free_id();
        let mut joint = Region::new(new_id, format!("{}+{}", a.name, b.name), joined_geom, a.parent_id);
        joint.mwm_size_est = joined_size;
        joint.mark_stale();
        self.store.create(joint)?;
        self.store.delete(id_a)?;
        self.store.delete(id_b)?;

        if let Some(parent_id) = a.parent_id {
            let siblings = self.store.children(parent_id)?;
            if siblings.len() == 1 && siblings[0].id == new_id {
                self.collapse_into_parent(new_id, parent_id)?;
            }
        }
        info!("joined {id_a} and {id_b} into {new_id}");
        Ok(new_id)
    }

    fn collapse_into_parent(&self, child_id: i64, parent_id: i64) -> Result<()> {
        let child = self.store.get(child_id)?;
        self.store.update_geom(parent_id, child.geom.clone())?;
        self.store.update_meta(
            parent_id,
            RegionMetaUpdate { name: None, disabled: None, cmnt: None, parent_id: None },
        )?;
        let mut parent = self.store.get(parent_id)?;
        parent.mwm_size_est = child.mwm_size_est;
        self.store.delete(child_id)?;
        Ok(())
    }

    /// **Chop largest.** Extracts the largest-area ring as `{name}_main`
    /// and all others as `{name}_small`; both become children of `region`.
    pub fn chop_largest(&self, region_id: i64) -> Result<(i64, i64)> {
        let region = self.store.get(region_id)?;
        if region.geom.0.len() < 2 {
            return Err(Error::NotSinglePolygon(region_id, region.geom.0.len()));
        }
        let mut rings = region.geom.0.clone();
        rings.sort_by(|a, b| b.unsigned_area().partial_cmp(&a.unsigned_area()).unwrap());
        let main_ring = rings.remove(0);

        let main_id = self.store.allocate_free_id();
        let mut main_region = Region::new(main_id, format!("{}_main", region.name), MultiPolygon::new(vec![main_ring]), Some(region_id));
        self.refresh_size(&mut main_region);
        self.store.create(main_region)?;

        let small_id = self.store.allocate_free_id();
        let mut small_region = Region::new(small_id, format!("{}_small", region.name), MultiPolygon::new(rings), Some(region_id));
        self.refresh_size(&mut small_region);
        self.store.create(small_region)?;

        Ok((main_id, small_id))
    }

    /// **Hull.** Replaces a multi-ring region's geometry with its convex
    /// hull.
    pub fn hull(&self, region_id: i64) -> Result<()> {
        let region = self.store.get(region_id)?;
        if region.geom.0.len() < 2 {
            return Err(Error::NotSinglePolygon(region_id, region.geom.0.len()));
        }
        let hull = self.gateway.convex_hull(&region.geom);
        self.store.update_geom(region_id, hull)?;
        Ok(())
    }

    /// **Simple axis split.** Two pieces along the long bbox axis, or four
    /// quadrants when the predicted size exceeds `2 * threshold_kb` or is
    /// unknown. Geometry grounded on `simple_splitting.py`.
    pub fn simple_axis_split(&self, region_id: i64, threshold_kb: f64) -> Result<Vec<i64>> {
        let region = self.store.get(region_id)?;
        let bbox = crate::geom::envelope(&region.geom).ok_or(Error::NoSplit(region_id, 0))?;
        let use_four = region.mwm_size_est.map_or(true, |size| size > 2.0 * threshold_kb);

        let (min, max) = (bbox.min(), bbox.max());
        let width = max.x - min.x;
        let height = max.y - min.y;
        let split_vertically = width > height;

        self.split_into_n(region, min, max, split_vertically, use_four)
    }

    /// Splits `geom` along `cut_line` and buckets the resulting pieces into
    /// the two sides of the cut by centroid, unioning each side into one
    /// `MultiPolygon`. `vertical` selects whether a piece's side is decided
    /// by its centroid's x or y coordinate against `mid_lon`/`mid_lat`.
    fn two_way_split(
        &self,
        geom: &MultiPolygon<f64>,
        cut_line: &Line<f64>,
        vertical: bool,
        mid_lon: f64,
        mid_lat: f64,
        fallback: Coord<f64>,
    ) -> (MultiPolygon<f64>, MultiPolygon<f64>) {
        let pieces = self.gateway.split_by_line(geom, cut_line);
        let mut low = MultiPolygon::new(vec![]);
        let mut high = MultiPolygon::new(vec![]);
        for piece in pieces {
            let c = piece.centroid().map(|p| p.0).unwrap_or(fallback);
            let is_low = if vertical { c.x < mid_lon } else { c.y < mid_lat };
            if is_low {
                low = self.gateway.union(&low, &piece);
            } else {
                high = self.gateway.union(&high, &piece);
            }
        }
        (low, high)
    }

    fn split_into_n(
        &self,
        region: Region,
        min: Coord<f64>,
        max: Coord<f64>,
        split_vertically: bool,
        use_four: bool,
    ) -> Result<Vec<i64>> {
        let mid_lon = (min.x + max.x) / 2.0;
        let mid_lat = (min.y + max.y) / 2.0;

        let groups: Vec<(String, MultiPolygon<f64>)> = if !use_four {
            let cut_line = if split_vertically {
                Line::new(Coord { x: mid_lon, y: min.y }, Coord { x: mid_lon, y: max.y })
            } else {
                Line::new(Coord { x: min.x, y: mid_lat }, Coord { x: max.x, y: mid_lat })
            };
            let (low_name, high_name) = if split_vertically { ("west", "east") } else { ("south", "north") };
            let (low, high) = self.two_way_split(&region.geom, &cut_line, split_vertically, mid_lon, mid_lat, min);
            vec![(low_name.to_string(), low), (high_name.to_string(), high)]
        } else {
            // Four-way split: cut vertically first, then cut each half
            // horizontally, rather than trying to encode a plus-shaped cut
            // as a single line.
            let vertical_line = Line::new(Coord { x: mid_lon, y: min.y }, Coord { x: mid_lon, y: max.y });
            let (west, east) = self.two_way_split(&region.geom, &vertical_line, true, mid_lon, mid_lat, min);

            let horizontal_line = Line::new(Coord { x: min.x, y: mid_lat }, Coord { x: max.x, y: mid_lat });
            let (sw, nw) = self.two_way_split(&west, &horizontal_line, false, mid_lon, mid_lat, min);
            let (se, ne) = self.two_way_split(&east, &horizontal_line, false, mid_lon, mid_lat, min);

            vec![
                ("southwest".to_string(), sw),
                ("northwest".to_string(), nw),
                ("southeast".to_string(), se),
                ("northeast".to_string(), ne),
            ]
        };

        let groups: Vec<(String, MultiPolygon<f64>)> =
            groups.into_iter().filter(|(_, geom)| !geom.0.is_empty()).collect();
        if groups.len() < 2 {
            return Err(Error::NoSplit(region.id, groups.len()));
        }

        let mut new_ids = Vec::with_capacity(groups.len());
        for (suffix, geom) in groups {
            let valid = self.gateway.make_valid(&geom);
            let id = self.store.allocate_free_id();
            let mut piece_region = Region::new(id, format!("{}_{}", region.name, suffix), valid, Some(region.id));
            self.refresh_size(&mut piece_region);
            self.store.create(piece_region)?;
            new_ids.push(id);
        }
        Ok(new_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::InputData;
    use crate::predictor::ModelAsset;
    use crate::store::InMemoryBorderStore;
    use geo::polygon;

    fn identity_predictor() -> Predictor {
        Predictor::new(
            ModelAsset {
                version: crate::predictor::MODEL_SCHEMA_VERSION,
                intercept: 1.0,
                coefficients: [0.0, 0.0, 0.0, 0.0, 0.0],
                feature_means: [0.0; 5],
                feature_scales: [1.0; 5],
            },
            crate::config::ModelLimits::default(),
        )
    }

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0),
        ]])
    }

    #[test]
    fn split_by_line_rejects_multi_ring_input() {
        let gateway = InProcessGateway::new(InputData::empty());
        let predictor = identity_predictor();
        let limits = crate::config::ModelLimits::default();
        let store = InMemoryBorderStore::new(InProcessGateway::new(InputData::empty()), false, std::env::temp_dir());
        let mut two_rings = square(0.0, 0.0, 1.0, 1.0);
        two_rings.0.push(square(2.0, 2.0, 3.0, 3.0).0.remove(0));
        store.create(Region::new(1, "multi", two_rings, None)).unwrap();

        let manipulator = Manipulator::new(&store, &gateway, &predictor, &limits);
        let line = Line::new(Coord { x: 0.5, y: -1.0 }, Coord { x: 0.5, y: 2.0 });
        let err = manipulator.split_by_line(1, line, SplitMode::Delete).unwrap_err();
        assert!(matches!(err, Error::NotSinglePolygon(1, 2)));
    }

    #[test]
    fn split_by_line_produces_two_pieces_for_single_ring() {
        let gateway = InProcessGateway::new(InputData::empty());
        let predictor = identity_predictor();
        let limits = crate::config::ModelLimits::default();
        let store = InMemoryBorderStore::new(InProcessGateway::new(InputData::empty()), false, std::env::temp_dir());
        store.create(Region::new(1, "square", square(0.0, 0.0, 1.0, 1.0), None)).unwrap();

        let manipulator = Manipulator::new(&store, &gateway, &predictor, &limits);
        let line = Line::new(Coord { x: 0.5, y: -1.0 }, Coord { x: 0.5, y: 2.0 });
        let new_ids = manipulator.split_by_line(1, line, SplitMode::Delete).unwrap();
        assert_eq!(new_ids.len(), 2);
        assert!(store.get(1).is_err());
    }

    #[test]
    fn join_then_orphan_collapse_matches_scenario_s5() {
        let gateway = InProcessGateway::new(InputData::empty());
        let predictor = identity_predictor();
        let limits = crate::config::ModelLimits::default();
        let store = InMemoryBorderStore::new(InProcessGateway::new(InputData::empty()), false, std::env::temp_dir());
        store.create(Region::new(1, "P", square(0.0, 0.0, 4.0, 4.0), None)).unwrap();
        store.create(Region::new(2, "X", square(0.0, 0.0, 2.0, 2.0), Some(1))).unwrap();
        store.create(Region::new(3, "Y", square(2.0, 0.0, 4.0, 2.0), Some(1))).unwrap();

        let manipulator = Manipulator::new(&store, &gateway, &predictor, &limits);
        manipulator.join(2, 3).unwrap();

        assert!(store.get(2).is_err());
        assert!(store.get(3).is_err());
        // The joint collapsed into P: P's children list is now empty.
        assert_eq!(store.children(1).unwrap().len(), 0);
    }

    #[test]
    fn hull_rejects_single_ring_input() {
        let gateway = InProcessGateway::new(InputData::empty());
        let predictor = identity_predictor();
        let limits = crate::config::ModelLimits::default();
        let store = InMemoryBorderStore::new(InProcessGateway::new(InputData::empty()), false, std::env::temp_dir());
        store.create(Region::new(1, "single", square(0.0, 0.0, 1.0, 1.0), None)).unwrap();

        let manipulator = Manipulator::new(&store, &gateway, &predictor, &limits);
        let err = manipulator.hull(1).unwrap_err();
        assert!(matches!(err, Error::NotSinglePolygon(1, 1)));
    }

    // A region taller than it is wide must be split by a horizontal line
    // (two pieces stacked north/south), not the vertical line used for the
    // wide case.
    #[test]
    fn simple_axis_split_cuts_horizontally_when_bbox_is_taller_than_wide() {
        let gateway = InProcessGateway::new(InputData::empty());
        let predictor = identity_predictor();
        let limits = crate::config::ModelLimits::default();
        let store = InMemoryBorderStore::new(InProcessGateway::new(InputData::empty()), false, std::env::temp_dir());
        let mut region = Region::new(1, "tall", square(0.0, 0.0, 2.0, 6.0), None);
        region.mwm_size_est = Some(10.0);
        store.create(region).unwrap();

        let manipulator = Manipulator::new(&store, &gateway, &predictor, &limits);
        let new_ids = manipulator.simple_axis_split(1, 100.0).unwrap();
        assert_eq!(new_ids.len(), 2);

        let pieces: Vec<Region> = new_ids.iter().map(|&id| store.get(id).unwrap()).collect();
        assert!(pieces.iter().any(|p| p.name.ends_with("_south")));
        assert!(pieces.iter().any(|p| p.name.ends_with("_north")));

        let total_area: f64 = pieces.iter().map(|p| gateway.area_planar(&p.geom)).sum();
        assert!((total_area - gateway.area_planar(&square(0.0, 0.0, 2.0, 6.0))).abs() < 1e-9);

        for piece in &pieces {
            let bbox = crate::geom::envelope(&piece.geom).unwrap();
            assert!((bbox.max().y - bbox.min().y - 3.0).abs() < 1e-9, "each half should be 3.0 tall");
        }
    }

    // An oversized region with no predicted size yet falls back to a
    // four-way quadrant split.
    #[test]
    fn simple_axis_split_produces_four_quadrants_when_size_is_unknown() {
        let gateway = InProcessGateway::new(InputData::empty());
        let predictor = identity_predictor();
        let limits = crate::config::ModelLimits::default();
        let store = InMemoryBorderStore::new(InProcessGateway::new(InputData::empty()), false, std::env::temp_dir());
        store.create(Region::new(1, "big", square(0.0, 0.0, 4.0, 4.0), None)).unwrap();

        let manipulator = Manipulator::new(&store, &gateway, &predictor, &limits);
        let new_ids = manipulator.simple_axis_split(1, 10.0).unwrap();
        assert_eq!(new_ids.len(), 4);

        let pieces: Vec<Region> = new_ids.iter().map(|&id| store.get(id).unwrap()).collect();
        for suffix in ["southwest", "northwest", "southeast", "northeast"] {
            assert!(pieces.iter().any(|p| p.name.ends_with(suffix)), "missing {suffix} piece");
        }

        let total_area: f64 = pieces.iter().map(|p| gateway.area_planar(&p.geom)).sum();
        assert!((total_area - gateway.area_planar(&square(0.0, 0.0, 4.0, 4.0))).abs() < 1e-9);

        for piece in &pieces {
            assert!((gateway.area_planar(&piece.geom) - 4.0).abs() < 1e-9, "each quadrant should be 2x2");
        }
    }
}
