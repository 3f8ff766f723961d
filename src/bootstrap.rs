//! Country bootstrap: populates a `BorderStore` from the OSM reference
//! borders for a declared per-country admin-level ladder, then runs an
//! optional auto-divide post-pass. Grounded on `auto_split.py`'s
//! country-loop driver and `countries_division.py`'s level table, per
//! §4.G.

use std::cell::RefCell;
use std::collections::HashMap;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::features::FeatureExtractor;
use crate::gateway::{InProcessGateway, SpatialGateway};
use crate::manipulate::Manipulator;
use crate::partition::PartitioningEngine;
use crate::predictor::Predictor;
use crate::store::region::Region;
use crate::store::{BorderStore, RegionMetaUpdate};

/// `[4, 5]` means "divide the country at level 4 first, then divide each
/// level-4 region at level 5"; `[]` means the country is copied as a single
/// admin-level-2 region with no further descent.
#[derive(Debug, Clone)]
pub struct CountryPlan {
    pub name: String,
    pub levels: Vec<u8>,
}

/// Small built-in convenience table covering the common single-level and
/// multi-level cases (levels 3 through 6), per SPEC_FULL.md §4.G. Callers
/// are expected to supply their own, more complete table in production;
/// this one exists so the engine is usable without external configuration.
pub fn default_country_plans() -> Vec<CountryPlan> {
    vec![
        CountryPlan { name: "Germany".to_string(), levels: vec![4, 6] },
        CountryPlan { name: "Switzerland".to_string(), levels: vec![3] },
        CountryPlan { name: "United Kingdom".to_string(), levels: vec![5, 6] },
        CountryPlan { name: "Latvia".to_string(), levels: vec![4, 6] },
        CountryPlan { name: "Ireland".to_string(), levels: vec![5, 6] },
    ]
}

pub struct CountryBootstrap<'a, S: BorderStore> {
    pub store: &'a S,
    pub gateway: &'a InProcessGateway,
    pub predictor: &'a Predictor,
    pub limits: &'a crate::config::ModelLimits,
    /// Ids created so far for the country currently being bootstrapped, so
    /// a failure partway through can be rolled back without a real
    /// transaction (§4.G: "failures roll back that country only").
    created_for_country: RefCell<HashMap<String, Vec<i64>>>,
}

impl<'a, S: BorderStore> CountryBootstrap<'a, S> {
    pub fn new(
        store: &'a S,
        gateway: &'a InProcessGateway,
        predictor: &'a Predictor,
        limits: &'a crate::config::ModelLimits,
    ) -> Self {
        CountryBootstrap { store, gateway, predictor, limits, created_for_country: RefCell::new(HashMap::new()) }
    }

    fn record_created(&self, plan: &CountryPlan, id: i64) {
        self.created_for_country.borrow_mut().entry(plan.name.clone()).or_default().push(id);
    }

    fn refresh_size(&self, region: &mut Region) {
        let extractor = FeatureExtractor::new(self.gateway, self.limits);
        let features = extractor.extract(region);
        region.mwm_size_est = self.predictor.predict(&features);
    }

    /// Runs the full procedure for one country: copies the admin-level-2
    /// polygon, descends the declared ladder, then optionally merges
    /// fully-covered leaves under `threshold_kb`. A failure at any step
    /// leaves the store untouched for this country, per §4.G's "rolls back
    /// that country only."
    pub fn bootstrap_country(&self, plan: &CountryPlan, threshold_kb: f64, auto_divide: bool) -> Result<i64> {
        match self.try_bootstrap_country(plan, threshold_kb, auto_divide) {
            Ok(id) => Ok(id),
            Err(err) => {
                warn!("bootstrap of {} failed, rolling back: {err}", plan.name);
                self.rollback_country(plan);
                Err(err)
            }
        }
    }

    fn rollback_country(&self, plan: &CountryPlan) {
        let ids = self.created_for_country.borrow_mut().remove(&plan.name).unwrap_or_default();
        // Children must be deleted before their parents (`delete` refuses a
        // region with remaining children), so unwind in reverse creation
        // order.
        for &id in ids.iter().rev() {
            let _ = self.store.delete(id);
        }
    }

    fn try_bootstrap_country(&self, plan: &CountryPlan, threshold_kb: f64, auto_divide: bool) -> Result<i64> {
        let country_border = self
            .gateway
            .inputs
            .osm_borders
            .iter()
            .find(|b| b.admin_level == 2 && b.name == plan.name)
            .ok_or_else(|| Error::NotFound(0))?;

        let country_id = self.store.allocate_free_id();
        let mut country = Region::new(country_id, country_border.name.clone(), country_border.geom.clone(), None);
        self.refresh_size(&mut country);
        self.store.create(country)?;
        self.record_created(plan, country_id);
        info!("bootstrapped country polygon for {} as {country_id}", plan.name);

        let mut current_leaves = vec![country_id];
        for &level in &plan.levels {
            let mut next_leaves = Vec::new();
            for leaf_id in current_leaves {
                let children = self.divide_region_into_subregions(plan, leaf_id, level)?;
                if children.is_empty() {
                    next_leaves.push(leaf_id);
                } else {
                    next_leaves.extend(children);
                }
            }
            current_leaves = next_leaves;
        }

        if auto_divide {
            for leaf_id in &current_leaves {
                self.auto_divide_leaf(plan, *leaf_id, threshold_kb)?;
            }
        }

        Ok(country_id)
    }

    /// Inserts the OSM polygons at `level` contained in `leaf`'s geometry as
    /// new children, parented to `leaf` (or `leaf`'s own parent, when `leaf`
    /// has no administrative content of its own — this core treats every
    /// bootstrapped region as administrative, so that branch never triggers
    /// here but is named for parity with the source procedure).
    fn divide_region_into_subregions(&self, plan: &CountryPlan, leaf_id: i64, level: u8) -> Result<Vec<i64>> {
        let leaf = self.store.get(leaf_id)?;
        let subregions: Vec<(i64, String, geo::MultiPolygon<f64>)> = self
            .gateway
            .osm_borders_within(&leaf.geom, level)
            .into_iter()
            .map(|b| (b.osm_id, b.name.clone(), b.geom.clone()))
            .collect();

        let mut child_ids = Vec::with_capacity(subregions.len());
        for (_osm_id, name, geom) in subregions {
            let id = self.store.allocate_free_id();
            let mut child = Region::new(id, name, geom, Some(leaf_id));
            self.refresh_size(&mut child);
            self.store.create(child)?;
            self.record_created(plan, id);
            child_ids.push(id);
        }
        Ok(child_ids)
    }

    /// Post-pass per §4.G step 3: merges a fully-covered leaf's children
    /// under `threshold_kb` via the partitioning engine, or falls back to a
    /// simple axis split of the leaf itself when coverage is incomplete and
    /// the leaf is oversized.
    fn auto_divide_leaf(&self, plan: &CountryPlan, leaf_id: i64, threshold_kb: f64) -> Result<()> {
        let leaf = self.store.get(leaf_id)?;
        let children = self.store.children(leaf_id)?;
        if children.is_empty() {
            return Ok(());
        }

        let parent_land_km2 = self.gateway.area_geodesic(&leaf.geom);
        let children_land_km2: f64 = children
            .iter()
            .map(|c| self.gateway.area_geodesic(&c.geom))
            .sum();
        let fully_covered = parent_land_km2 <= 0.0 || children_land_km2 >= 0.99 * parent_land_km2;

        if fully_covered {
            let next_level = plan.levels.last().copied().unwrap_or(0);
            self.merge_existing_children(&leaf, &children, next_level, threshold_kb)?;
            Ok(())
        } else {
            self.store.update_meta(
                leaf_id,
                RegionMetaUpdate { name: None, disabled: None, cmnt: Some("has lost subregions".to_string()), parent_id: None },
            )?;
            if leaf.mwm_size_est.map_or(false, |s| s > threshold_kb) {
                let manipulator = Manipulator::new(self.store, self.gateway, self.predictor, self.limits);
                manipulator.simple_axis_split(leaf_id, threshold_kb)?;
                info!("applied simple axis split to undersubdivided region {leaf_id} ({})", plan.name);
            }
            Ok(())
        }
    }

    /// Runs the golden-splitting merge directly over already-materialized
    /// child regions (rather than re-deriving subregions from the OSM
    /// reference layer), used when the children came from an earlier
    /// `divide_region_into_subregions` pass instead of a single admin level.
    /// Persists the result as the splitting table for `(leaf.id, next_level,
    /// threshold_kb)`, per §4.E step 6 / I8.
    fn merge_existing_children(
        &self,
        leaf: &Region,
        children: &[Region],
        next_level: u8,
        threshold_kb: f64,
    ) -> Result<Vec<i64>> {
        let extractor = FeatureExtractor::new(self.gateway, self.limits);
        let mut subregions = Vec::with_capacity(children.len());
        for child in children {
            let size = match child.mwm_size_est {
                Some(s) => s,
                None => {
                    let features = extractor.extract(child);
                    self.predictor.predict(&features).ok_or(Error::Unestimable(child.id))?
                }
            };
            subregions.push(crate::partition::Subregion { id: child.id, geom: child.geom.clone(), size_kb: size });
        }

        let engine = PartitioningEngine::new(self.gateway, self.predictor, self.limits);
        let adjacency = engine.adjacency_matrix(&subregions);
        let clusters = crate::partition::golden_splitting(&subregions, &adjacency, threshold_kb);

        let rows = crate::partition::cluster_rows(self.gateway, leaf.id, next_level, threshold_kb, &clusters, |id| {
            children.iter().find(|c| c.id == id).map(|c| c.geom.clone())
        });
        self.store.replace_clusters(leaf.id, next_level, threshold_kb, rows)?;

        let mut merged_ids = Vec::with_capacity(clusters.len());
        for cluster in &clusters {
            if cluster.subregion_ids.len() == 1 {
                merged_ids.push(cluster.subregion_ids[0]);
                continue;
            }
            let mut geom = geo::MultiPolygon::new(vec![]);
            for &id in &cluster.subregion_ids {
                let member = children.iter().find(|c| c.id == id).unwrap();
                geom = self.gateway.union(&geom, &member.geom);
            }
            let new_id = self.store.allocate_free_id();
            let mut merged = Region::new(new_id, format!("{}_{}", leaf.name, new_id.unsigned_abs()), geom, Some(leaf.id));
            merged.mwm_size_est = Some(cluster.size_kb);
            self.store.create(merged)?;
            for &id in &cluster.subregion_ids {
                self.store.delete(id)?;
            }
            merged_ids.push(new_id);
        }
        Ok(merged_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelLimits;
    use crate::inputs::{InputData, OsmBorder};
    use crate::predictor::{ModelAsset, MODEL_SCHEMA_VERSION};
    use crate::store::InMemoryBorderStore;
    use geo::polygon;

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> geo::MultiPolygon<f64> {
        geo::MultiPolygon::new(vec![polygon![
            (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0),
        ]])
    }

    fn identity_predictor() -> Predictor {
        Predictor::new(
            ModelAsset {
                version: MODEL_SCHEMA_VERSION,
                intercept: 1.0,
                coefficients: [0.0, 0.0, 0.0, 0.0, 0.0],
                feature_means: [0.0; 5],
                feature_scales: [1.0; 5],
            },
            ModelLimits::default(),
        )
    }

    #[test]
    fn default_country_plans_covers_the_single_and_multi_level_cases() {
        let plans = default_country_plans();
        assert!(plans.iter().any(|p| p.name == "Switzerland" && p.levels.len() == 1));
        assert!(plans.iter().any(|p| p.name == "Germany" && p.levels.len() == 2));
    }

    #[test]
    fn bootstrap_copies_the_admin_level_two_polygon_with_no_ladder() {
        let country = OsmBorder { osm_id: -1, name: "Switzerland".to_string(), admin_level: 2, geom: square(0.0, 0.0, 4.0, 4.0) };
        let gateway = InProcessGateway::new(InputData::new(vec![country], vec![], vec![], vec![], vec![]));
        let predictor = identity_predictor();
        let limits = ModelLimits::default();
        let store = InMemoryBorderStore::new(InProcessGateway::new(InputData::empty()), false, std::env::temp_dir());

        let bootstrap = CountryBootstrap::new(&store, &gateway, &predictor, &limits);
        let plan = CountryPlan { name: "Switzerland".to_string(), levels: vec![] };
        let id = bootstrap.bootstrap_country(&plan, 1000.0, false).unwrap();

        let region = store.get(id).unwrap();
        assert_eq!(region.name, "Switzerland");
        assert_eq!(region.parent_id, None);
    }

    #[test]
    fn bootstrap_descends_one_ladder_level_and_parents_children() {
        let country = OsmBorder { osm_id: -1, name: "Latvia".to_string(), admin_level: 2, geom: square(0.0, 0.0, 4.0, 4.0) };
        let region4a = OsmBorder { osm_id: -2, name: "Riga".to_string(), admin_level: 4, geom: square(0.0, 0.0, 2.0, 2.0) };
        let region4b = OsmBorder { osm_id: -3, name: "Vidzeme".to_string(), admin_level: 4, geom: square(2.0, 0.0, 4.0, 2.0) };
        let gateway = InProcessGateway::new(InputData::new(vec![country, region4a, region4b], vec![], vec![], vec![], vec![]));
        let predictor = identity_predictor();
        let limits = ModelLimits::default();
        let store = InMemoryBorderStore::new(InProcessGateway::new(InputData::empty()), false, std::env::temp_dir());

        let bootstrap = CountryBootstrap::new(&store, &gateway, &predictor, &limits);
        let plan = CountryPlan { name: "Latvia".to_string(), levels: vec![4] };
        let country_id = bootstrap.bootstrap_country(&plan, 1000.0, false).unwrap();

        let children = store.children(country_id).unwrap();
        assert_eq!(children.len(), 2);
        assert!(children.iter().all(|c| c.parent_id == Some(country_id)));
    }

    #[test]
    fn bootstrap_of_unknown_country_fails_without_leaving_a_partial_row() {
        let gateway = InProcessGateway::new(InputData::empty());
        let predictor = identity_predictor();
        let limits = ModelLimits::default();
        let store = InMemoryBorderStore::new(InProcessGateway::new(InputData::empty()), false, std::env::temp_dir());

        let bootstrap = CountryBootstrap::new(&store, &gateway, &predictor, &limits);
        let plan = CountryPlan { name: "Nowhereland".to_string(), levels: vec![] };
        let err = bootstrap.bootstrap_country(&plan, 1000.0, false).unwrap_err();
        assert!(matches!(err, Error::NotFound(0)));
    }
}
