//! Border store: CRUD over the hierarchical `Region` table, the free-id
//! allocator, and backup/restore snapshots. Grounded on
//! `borders_api_utils.py`'s `create_or_update_region`/`get_free_id`/
//! `find_potential_parents`, and on `area.rs`'s `AreaMappingManager` for the
//! CSV+YAML persistence shape.

pub mod cluster;
pub mod region;

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::Utc;
use csv::{ReaderBuilder, WriterBuilder};
use geo::MultiPolygon;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gateway::SpatialGateway;
use cluster::{Cluster, ClusterKey};
use region::{Region, RegionRow};

/// The id below which free ids are synthesized, per I7.
pub const FREE_ID_CEILING: i64 = -1_000_000_000;
pub const FREE_ID_FALLBACK: i64 = -1_000_000_001;

pub trait BorderStore {
    fn get(&self, id: i64) -> Result<Region>;
    fn children(&self, id: i64) -> Result<Vec<Region>>;
    fn parent(&self, id: i64) -> Result<Option<Region>>;
    fn predecessors(&self, id: i64) -> Result<Vec<Region>>;
    fn in_bbox(&self, bbox: geo::Rect<f64>, simplify_level: SimplifyLevel) -> Result<Vec<Region>>;
    fn create(&self, region: Region) -> Result<()>;
    fn update_geom(&self, id: i64, geom: MultiPolygon<f64>) -> Result<()>;
    fn update_meta(&self, id: i64, meta: RegionMetaUpdate) -> Result<()>;
    fn delete(&self, id: i64) -> Result<()>;
    /// Writes back the background worker's tile-count sum; the only field
    /// the worker's connection is allowed to touch, per §4.I/§5.
    fn set_count_k(&self, id: i64, count_k: i64) -> Result<()>;
    fn allocate_free_id(&self) -> i64;
    fn set_parent(&self, id: i64, parent_id: Option<i64>) -> Result<()>;
    fn find_potential_parents(&self, id: i64) -> Result<Vec<Region>>;
    fn assign_to_lowest_parent(&self, id: i64) -> Result<()>;
    fn snapshot(&self, label: &str) -> Result<()>;
    fn restore(&self, label: &str) -> Result<()>;
    fn list_snapshots(&self) -> Result<Vec<String>>;
    fn delete_snapshot(&self, label: &str) -> Result<()>;
    /// Deletes every cluster row for `(region_id, next_level, size_threshold)`.
    fn delete_clusters(&self, region_id: i64, next_level: u8, size_threshold: f64) -> Result<()>;
    /// Inserts one surviving cluster row.
    fn insert_cluster(&self, cluster: Cluster) -> Result<()>;
    /// Reads back the cluster rows for `(region_id, next_level, size_threshold)`.
    fn clusters(&self, region_id: i64, next_level: u8, size_threshold: f64) -> Result<Vec<Cluster>>;
    /// Atomically deletes the previous rows for this key and inserts the
    /// surviving clusters in their place, per §4.E step 6.
    fn replace_clusters(&self, region_id: i64, next_level: u8, size_threshold: f64, clusters: Vec<Cluster>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimplifyLevel {
    Full,
    Medium,
    Coarse,
}

impl SimplifyLevel {
    pub fn tolerance_degrees(self) -> f64 {
        match self {
            SimplifyLevel::Full => 0.0,
            SimplifyLevel::Medium => 0.01,
            SimplifyLevel::Coarse => 0.1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RegionMetaUpdate {
    pub name: Option<String>,
    pub disabled: Option<bool>,
    pub cmnt: Option<String>,
    pub parent_id: Option<Option<i64>>,
}

struct Inner {
    regions: BTreeMap<i64, Region>,
    clusters: BTreeMap<ClusterKey, Vec<Cluster>>,
    last_snapshot_minute: Option<String>,
}

/// The one shipped `BorderStore`: a `parking_lot::Mutex`-guarded in-process
/// table, persisted to disk as CSV+YAML the way `AreaMappingManager`
/// persists its grid, plus a `SpatialGateway` for containment/union checks.
pub struct InMemoryBorderStore<G: SpatialGateway> {
    inner: Mutex<Inner>,
    gateway: G,
    read_only: bool,
    snapshot_dir: PathBuf,
}

impl<G: SpatialGateway> InMemoryBorderStore<G> {
    pub fn new(gateway: G, read_only: bool, snapshot_dir: PathBuf) -> Self {
        InMemoryBorderStore {
            inner: Mutex::new(Inner { regions: BTreeMap::new(), clusters: BTreeMap::new(), last_snapshot_minute: None }),
            gateway,
            read_only,
            snapshot_dir,
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(Error::Forbidden);
        }
        Ok(())
    }

    fn is_descendant(&self, inner: &Inner, ancestor_candidate: i64, of: i64) -> bool {
        let mut current = inner.regions.get(&of).and_then(|r| r.parent_id);
        while let Some(pid) = current {
            if pid == ancestor_candidate {
                return true;
            }
            current = inner.regions.get(&pid).and_then(|r| r.parent_id);
        }
        false
    }

    pub fn load_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut reader = ReaderBuilder::new().delimiter(b';').from_path(path)?;
        let mut inner = self.inner.lock();
        for result in reader.deserialize() {
            let row: RegionRow = result?;
            let region = row.into_region()?;
            inner.regions.insert(region.id, region);
        }
        Ok(())
    }

    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let inner = self.inner.lock();
        let mut writer = WriterBuilder::new().delimiter(b';').from_path(path)?;
        for region in inner.regions.values() {
            writer.serialize(RegionRow::from_region(region))?;
        }
        writer.flush()?;
        Ok(())
    }
}

impl<G: SpatialGateway> BorderStore for InMemoryBorderStore<G> {
    fn get(&self, id: i64) -> Result<Region> {
        let inner = self.inner.lock();
        inner.regions.get(&id).cloned().ok_or(Error::NotFound(id))
    }

    fn children(&self, id: i64) -> Result<Vec<Region>> {
        let inner = self.inner.lock();
        Ok(inner
            .regions
            .values()
            .filter(|r| r.parent_id == Some(id))
            .cloned()
            .collect())
    }

    fn parent(&self, id: i64) -> Result<Option<Region>> {
        let inner = self.inner.lock();
        let region = inner.regions.get(&id).ok_or(Error::NotFound(id))?;
        Ok(region.parent_id.and_then(|pid| inner.regions.get(&pid).cloned()))
    }

    fn predecessors(&self, id: i64) -> Result<Vec<Region>> {
        let inner = self.inner.lock();
        let mut chain = Vec::new();
        let mut current = inner.regions.get(&id).ok_or(Error::NotFound(id))?.parent_id;
        while let Some(pid) = current {
            match inner.regions.get(&pid) {
                Some(region) => {
                    chain.push(region.clone());
                    current = region.parent_id;
                }
                None => break,
            }
        }
        Ok(chain)
    }

    fn in_bbox(&self, bbox: geo::Rect<f64>, simplify_level: SimplifyLevel) -> Result<Vec<Region>> {
        use geo::Intersects;
        let inner = self.inner.lock();
        let bbox_poly = bbox.to_polygon();
        let tolerance = simplify_level.tolerance_degrees();
        Ok(inner
            .regions
            .values()
            .filter(|r| r.geom.intersects(&bbox_poly))
            .map(|r| {
                let mut clone = r.clone();
                clone.geom = self.gateway.simplify_preserving_topology(&clone.geom, tolerance);
                clone
            })
            .collect())
    }

    fn create(&self, region: Region) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        if inner.regions.contains_key(&region.id) {
            return Err(Error::Conflict(region.id));
        }
        let id = region.id;
        let is_new_synthetic = id < 0;
        inner.regions.insert(id, region);
        drop(inner);
        if is_new_synthetic {
            self.assign_to_lowest_parent(id)?;
        }
        Ok(())
    }

    fn update_geom(&self, id: i64, geom: MultiPolygon<f64>) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let region = inner.regions.get_mut(&id).ok_or(Error::NotFound(id))?;
        region.geom = geom;
        region.mark_stale();
        region.mwm_size_est = None;
        Ok(())
    }

    fn update_meta(&self, id: i64, meta: RegionMetaUpdate) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let region = inner.regions.get_mut(&id).ok_or(Error::NotFound(id))?;
        if let Some(name) = meta.name {
            region.name = name;
        }
        if let Some(disabled) = meta.disabled {
            region.disabled = disabled;
        }
        if let Some(cmnt) = meta.cmnt {
            region.cmnt = Some(cmnt);
        }
        if let Some(parent_id) = meta.parent_id {
            region.parent_id = parent_id;
        }
        region.modified = Utc::now();
        Ok(())
    }

    fn delete(&self, id: i64) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        if !inner.regions.contains_key(&id) {
            return Err(Error::NotFound(id));
        }
        if inner.regions.values().any(|r| r.parent_id == Some(id)) {
            return Err(Error::HasChildren(id));
        }
        inner.regions.remove(&id);
        Ok(())
    }

    fn set_count_k(&self, id: i64, count_k: i64) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let region = inner.regions.get_mut(&id).ok_or(Error::NotFound(id))?;
        region.count_k = Some(count_k);
        Ok(())
    }

    fn allocate_free_id(&self) -> i64 {
        let inner = self.inner.lock();
        let min_in_range = inner
            .regions
            .keys()
            .copied()
            .filter(|&id| id < FREE_ID_CEILING)
            .min();
        match min_in_range {
            Some(min_id) => min_id - 1,
            None => FREE_ID_FALLBACK,
        }
    }

    fn set_parent(&self, id: i64, parent_id: Option<i64>) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        if !inner.regions.contains_key(&id) {
            return Err(Error::NotFound(id));
        }
        if let Some(pid) = parent_id {
            if !inner.regions.contains_key(&pid) {
                return Err(Error::NotFound(pid));
            }
            if pid == id || self.is_descendant(&inner, id, pid) {
                return Err(Error::Conflict(id));
            }
        }
        inner.regions.get_mut(&id).unwrap().parent_id = parent_id;
        Ok(())
    }

    fn find_potential_parents(&self, id: i64) -> Result<Vec<Region>> {
        let inner = self.inner.lock();
        let child = inner.regions.get(&id).ok_or(Error::NotFound(id))?;
        let child_area = self.gateway.area_planar(&child.geom);
        let mut candidates: Vec<(f64, Region)> = inner
            .regions
            .values()
            .filter(|r| r.id != id)
            .filter_map(|r| {
                if !self.gateway.intersects(&r.geom, &child.geom) {
                    return None;
                }
                let intersection = self.gateway.intersection(&r.geom, &child.geom);
                let intersection_area = self.gateway.area_planar(&intersection);
                let parent_area = self.gateway.area_planar(&r.geom);
                if parent_area > child_area && intersection_area > 0.5 * child_area {
                    Some((parent_area, r.clone()))
                } else {
                    None
                }
            })
            .collect();
        candidates.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap());
        Ok(candidates.into_iter().map(|(_, r)| r).collect())
    }

    fn assign_to_lowest_parent(&self, id: i64) -> Result<()> {
        let parents = self.find_potential_parents(id)?;
        if let Some(lowest) = parents.into_iter().next() {
            self.set_parent(id, Some(lowest.id))?;
        }
        Ok(())
    }

    fn snapshot(&self, label: &str) -> Result<()> {
        self.check_writable()?;
        let minute_key = Utc::now().format("%Y-%m-%d %H:%M").to_string();
        {
            let mut inner = self.inner.lock();
            if inner.last_snapshot_minute.as_deref() == Some(minute_key.as_str()) {
                return Err(Error::Retry);
            }
            inner.last_snapshot_minute = Some(minute_key);
        }
        std::fs::create_dir_all(&self.snapshot_dir)?;
        let path = self.snapshot_dir.join(format!("{label}.csv"));
        self.save_csv(path)?;
        info!("wrote snapshot {label}");
        Ok(())
    }

    fn restore(&self, label: &str) -> Result<()> {
        self.check_writable()?;
        let path = self.snapshot_dir.join(format!("{label}.csv"));
        if !path.exists() {
            return Err(Error::NotFound(0));
        }
        {
            let mut inner = self.inner.lock();
            inner.regions.clear();
        }
        self.load_csv(path)?;
        warn!("restored border store from snapshot {label}");
        Ok(())
    }

    fn list_snapshots(&self) -> Result<Vec<String>> {
        if !self.snapshot_dir.exists() {
            return Ok(vec![]);
        }
        let mut labels = Vec::new();
        for entry in std::fs::read_dir(&self.snapshot_dir)? {
            let entry = entry?;
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("csv") {
                    labels.push(stem.to_string());
                }
            }
        }
        labels.sort();
        Ok(labels)
    }

    fn delete_snapshot(&self, label: &str) -> Result<()> {
        self.check_writable()?;
        let path = self.snapshot_dir.join(format!("{label}.csv"));
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        debug!("deleted snapshot {label}");
        Ok(())
    }

    fn delete_clusters(&self, region_id: i64, next_level: u8, size_threshold: f64) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner.clusters.remove(&ClusterKey::new(region_id, next_level, size_threshold));
        Ok(())
    }

    fn insert_cluster(&self, cluster: Cluster) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let key = cluster.key();
        inner.clusters.entry(key).or_default().push(cluster);
        Ok(())
    }

    fn clusters(&self, region_id: i64, next_level: u8, size_threshold: f64) -> Result<Vec<Cluster>> {
        let inner = self.inner.lock();
        Ok(inner
            .clusters
            .get(&ClusterKey::new(region_id, next_level, size_threshold))
            .cloned()
            .unwrap_or_default())
    }

    fn replace_clusters(&self, region_id: i64, next_level: u8, size_threshold: f64, clusters: Vec<Cluster>) -> Result<()> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        let key = ClusterKey::new(region_id, next_level, size_threshold);
        inner.clusters.insert(key, clusters);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InProcessGateway;
    use crate::inputs::InputData;
    use geo::polygon;

    fn gateway() -> InProcessGateway {
        InProcessGateway::new(InputData::empty())
    }

    fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: x0, y: y0), (x: x1, y: y0), (x: x1, y: y1), (x: x0, y: y1), (x: x0, y: y0),
        ]])
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = InMemoryBorderStore::new(gateway(), false, PathBuf::from("/tmp/bps-test-1"));
        let region = Region::new(1, "A", square(0.0, 0.0, 1.0, 1.0), None);
        store.create(region).unwrap();
        let fetched = store.get(1).unwrap();
        assert_eq!(fetched.name, "A");
    }

    #[test]
    fn delete_with_children_fails() {
        let store = InMemoryBorderStore::new(gateway(), false, PathBuf::from("/tmp/bps-test-2"));
        store.create(Region::new(1, "Parent", square(0.0, 0.0, 2.0, 2.0), None)).unwrap();
        store.create(Region::new(2, "Child", square(0.0, 0.0, 1.0, 1.0), Some(1))).unwrap();
        let err = store.delete(1).unwrap_err();
        assert!(matches!(err, Error::HasChildren(1)));
    }

    #[test]
    fn read_only_store_refuses_mutation() {
        let store = InMemoryBorderStore::new(gateway(), true, PathBuf::from("/tmp/bps-test-3"));
        let err = store.create(Region::new(1, "A", square(0.0, 0.0, 1.0, 1.0), None)).unwrap_err();
        assert!(matches!(err, Error::Forbidden));
    }

    #[test]
    fn free_id_allocation_is_strictly_decreasing() {
        let store = InMemoryBorderStore::new(gateway(), false, PathBuf::from("/tmp/bps-test-4"));
        let first = store.allocate_free_id();
        assert_eq!(first, FREE_ID_FALLBACK);
        store.create(Region::new(first, "Synth", square(0.0, 0.0, 1.0, 1.0), None)).unwrap();
        let second = store.allocate_free_id();
        assert!(second < first);
    }

    #[test]
    fn set_parent_rejects_descendant_as_parent() {
        let store = InMemoryBorderStore::new(gateway(), false, PathBuf::from("/tmp/bps-test-5"));
        store.create(Region::new(1, "Root", square(0.0, 0.0, 3.0, 3.0), None)).unwrap();
        store.create(Region::new(2, "Mid", square(0.0, 0.0, 2.0, 2.0), Some(1))).unwrap();
        store.create(Region::new(3, "Leaf", square(0.0, 0.0, 1.0, 1.0), Some(2))).unwrap();
        let err = store.set_parent(1, Some(3)).unwrap_err();
        assert!(matches!(err, Error::Conflict(1)));
    }

    #[test]
    fn find_potential_parents_orders_by_increasing_area() {
        let store = InMemoryBorderStore::new(gateway(), false, PathBuf::from("/tmp/bps-test-6"));
        store.create(Region::new(1, "Big", square(-5.0, -5.0, 5.0, 5.0), None)).unwrap();
        store.create(Region::new(2, "Medium", square(-2.0, -2.0, 2.0, 2.0), None)).unwrap();
        store.create(Region::new(3, "Child", square(-1.0, -1.0, 1.0, 1.0), None)).unwrap();
        let parents = store.find_potential_parents(3).unwrap();
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0].id, 2);
        assert_eq!(parents[1].id, 1);
    }

    #[test]
    fn replace_clusters_overwrites_previous_rows_for_the_same_key() {
        let store = InMemoryBorderStore::new(gateway(), false, PathBuf::from("/tmp/bps-test-7"));
        let first_pass = vec![Cluster {
            region_id: 1,
            subregion_ids: vec![10],
            geom: square(0.0, 0.0, 1.0, 1.0),
            next_level: 4,
            size_threshold: 70.0,
            predicted_size: 50.0,
        }];
        store.replace_clusters(1, 4, 70.0, first_pass).unwrap();
        assert_eq!(store.clusters(1, 4, 70.0).unwrap().len(), 1);

        let second_pass = vec![
            Cluster {
                region_id: 1,
                subregion_ids: vec![10],
                geom: square(0.0, 0.0, 1.0, 1.0),
                next_level: 4,
                size_threshold: 70.0,
                predicted_size: 40.0,
            },
            Cluster {
                region_id: 1,
                subregion_ids: vec![20],
                geom: square(1.0, 0.0, 2.0, 1.0),
                next_level: 4,
                size_threshold: 70.0,
                predicted_size: 30.0,
            },
        ];
        store.replace_clusters(1, 4, 70.0, second_pass).unwrap();
        let rows = store.clusters(1, 4, 70.0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().map(|c| c.predicted_size).sum::<f64>(), 70.0);

        // A different threshold is a different key and is untouched.
        store.insert_cluster(Cluster {
            region_id: 1,
            subregion_ids: vec![10, 20],
            geom: square(0.0, 0.0, 2.0, 1.0),
            next_level: 4,
            size_threshold: 140.0,
            predicted_size: 70.0,
        }).unwrap();
        assert_eq!(store.clusters(1, 4, 70.0).unwrap().len(), 2);
        assert_eq!(store.clusters(1, 4, 140.0).unwrap().len(), 1);

        store.delete_clusters(1, 4, 70.0).unwrap();
        assert!(store.clusters(1, 4, 70.0).unwrap().is_empty());
        assert_eq!(store.clusters(1, 4, 140.0).unwrap().len(), 1);
    }

    #[test]
    fn snapshot_twice_in_same_minute_returns_retry() {
        let store = InMemoryBorderStore::new(gateway(), false, std::env::temp_dir().join("bps-snap-test"));
        store.create(Region::new(1, "A", square(0.0, 0.0, 1.0, 1.0), None)).unwrap();
        store.snapshot("label1").unwrap();
        let err = store.snapshot("label2").unwrap_err();
        assert!(matches!(err, Error::Retry));
    }
}
