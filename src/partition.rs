//! Partitioning engine: `DisjointClusterUnion` and the golden-splitting
//! loop, grounded directly on `auto_split.py`'s `DisjointClusterUnion` and
//! `find_golden_splitting`.

use std::collections::HashMap;

use geo::MultiPolygon;
use log::{debug, info};
use rustc_hash::FxHashMap;

use crate::error::{Error, Result};
use crate::features::FeatureExtractor;
use crate::gateway::{InProcessGateway, SpatialGateway};
use crate::predictor::Predictor;
use crate::store::cluster::Cluster;
use crate::store::region::Region;
use crate::store::BorderStore;

/// A leaf subregion entering the partitioning loop, with its geometry and
/// already-resolved predicted size.
#[derive(Debug, Clone)]
pub struct Subregion {
    pub id: i64,
    pub geom: MultiPolygon<f64>,
    pub size_kb: f64,
}

/// `W[i][j]`: geodesic length (meters) of the shared border between two
/// subregions, for `i < j`. Zero-length entries are omitted, per §4.E
/// step 3.
pub type Adjacency = FxHashMap<(i64, i64), f64>;

#[derive(Debug, Clone)]
pub struct ClusterAggregate {
    pub representative: i64,
    pub subregion_ids: Vec<i64>,
    pub size_kb: f64,
    pub finished: bool,
}

/// Classic union-find with path compression, augmented with a side table
/// mapping representative to aggregate; union always keeps the larger id as
/// representative so output is deterministic regardless of iteration order.
pub struct DisjointClusterUnion {
    representatives: HashMap<i64, i64>,
    clusters: HashMap<i64, ClusterAggregate>,
}

impl DisjointClusterUnion {
    pub fn new(subregions: &[Subregion]) -> DisjointClusterUnion {
        let mut representatives = HashMap::new();
        let mut clusters = HashMap::new();
        for s in subregions {
            representatives.insert(s.id, s.id);
            clusters.insert(
                s.id,
                ClusterAggregate {
                    representative: s.id,
                    subregion_ids: vec![s.id],
                    size_kb: s.size_kb,
                    finished: false,
                },
            );
        }
        DisjointClusterUnion { representatives, clusters }
    }

    pub fn find_cluster(&mut self, subregion_id: i64) -> i64 {
        let parent = self.representatives[&subregion_id];
        if parent == subregion_id {
            return subregion_id;
        }
        let root = self.find_cluster(parent);
        self.representatives.insert(subregion_id, root);
        root
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn aggregate(&self, representative: i64) -> &ClusterAggregate {
        &self.clusters[&representative]
    }

    pub fn representatives(&self) -> Vec<i64> {
        let mut reps: Vec<i64> = self.clusters.keys().copied().collect();
        reps.sort_unstable();
        reps
    }

    /// Smallest unfinished cluster by size, ties broken by minimum
    /// representative id, per §4.E step 5.
    pub fn smallest_unfinished(&self) -> Option<i64> {
        self.clusters
            .values()
            .filter(|c| !c.finished)
            .min_by(|a, b| {
                a.size_kb
                    .partial_cmp(&b.size_kb)
                    .unwrap()
                    .then(a.representative.cmp(&b.representative))
            })
            .map(|c| c.representative)
    }

    pub fn mark_finished(&mut self, representative: i64) {
        self.clusters.get_mut(&representative).unwrap().finished = true;
    }

    /// Merges the clusters represented by `a` and `b`, retaining the larger
    /// id as the new representative.
    pub fn union(&mut self, a: i64, b: i64) -> i64 {
        let (keep, drop) = if a >= b { (a, b) } else { (b, a) };
        let mut dropped = self.clusters.remove(&drop).expect("dropped cluster must exist");
        let kept = self.clusters.get_mut(&keep).expect("kept cluster must exist");
        kept.subregion_ids.append(&mut dropped.subregion_ids);
        kept.size_kb += dropped.size_kb;
        for id in &kept.subregion_ids {
            self.representatives.insert(*id, keep);
        }
        self.representatives.insert(drop, keep);
        keep
    }
}

/// Runs the "golden splitting" loop (§4.E steps 5-6's in-memory part) and
/// returns the surviving clusters in sorted representative order.
pub fn golden_splitting(
    subregions: &[Subregion],
    adjacency: &Adjacency,
    threshold_kb: f64,
) -> Vec<ClusterAggregate> {
    let mut dcu = DisjointClusterUnion::new(subregions);

    loop {
        if dcu.cluster_count() <= 1 {
            break;
        }
        let smallest = match dcu.smallest_unfinished() {
            Some(s) => s,
            None => break,
        };
        let smallest_subregions: Vec<i64> = dcu.aggregate(smallest).subregion_ids.clone();
        let smallest_size = dcu.aggregate(smallest).size_kb;

        // common_borders: candidate representative -> total shared length
        let mut common_borders: FxHashMap<i64, f64> = FxHashMap::default();
        for rep in dcu.representatives() {
            if rep == smallest {
                continue;
            }
            if dcu.aggregate(rep).finished {
                continue;
            }
            let candidate_subregions = &dcu.aggregate(rep).subregion_ids;
            let mut shared = 0.0;
            for &s in &smallest_subregions {
                for &c in candidate_subregions {
                    let key = if s < c { (s, c) } else { (c, s) };
                    if let Some(len) = adjacency.get(&key) {
                        shared += len;
                    }
                }
            }
            if shared > 0.0 && smallest_size + dcu.aggregate(rep).size_kb <= threshold_kb {
                common_borders.insert(rep, shared);
            }
        }

        if common_borders.is_empty() {
            debug!("cluster {smallest} has no admissible partner, marking finished");
            dcu.mark_finished(smallest);
            continue;
        }

        let b_total: f64 = common_borders.values().sum();
        let m_total: f64 = common_borders.keys().map(|rep| dcu.aggregate(*rep).size_kb).sum();

        let best = common_borders
            .iter()
            .map(|(&rep, &border_len)| {
                let b_c = border_len;
                let score = if m_total > 0.0 {
                    b_c / b_total - dcu.aggregate(rep).size_kb / m_total
                } else {
                    b_c / b_total
                };
                (score, rep)
            })
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap().then(a.1.cmp(&b.1)))
            .map(|(_, rep)| rep)
            .unwrap();

        info!("merging cluster {smallest} with {best}");
        dcu.union(smallest, best);
    }

    let mut clusters: Vec<ClusterAggregate> = dcu
        .representatives()
        .into_iter()
        .map(|rep| dcu.aggregate(rep).clone())
        .collect();
    for cluster in &mut clusters {
        cluster.subregion_ids.sort_unstable();
    }
    clusters.sort_by_key(|c| c.representative);
    clusters
}

/// Ties the algorithm above to the store/gateway/predictor so a caller can
/// run it against an administrative region by id, per §4.E steps 1-2.
pub struct PartitioningEngine<'a> {
    pub gateway: &'a InProcessGateway,
    pub predictor: &'a Predictor,
    pub limits: &'a crate::config::ModelLimits,
}

impl<'a> PartitioningEngine<'a> {
    pub fn new(
        gateway: &'a InProcessGateway,
        predictor: &'a Predictor,
        limits: &'a crate::config::ModelLimits,
    ) -> Self {
        PartitioningEngine { gateway, predictor, limits }
    }

    /// Enumerates subregions of `parent` at `level`, estimates each size,
    /// and aborts with `Unestimable` if any estimate is unavailable.
    pub fn collect_subregions(&self, parent: &Region, level: u8) -> Result<Vec<Subregion>> {
        let extractor = FeatureExtractor::new(self.gateway, self.limits);
        let borders = self.gateway.osm_borders_within(&parent.geom, level);
        let mut subregions = Vec::with_capacity(borders.len());
        for border in borders {
            let temp_region = Region::new(border.osm_id, border.name.clone(), border.geom.clone(), Some(parent.id));
            let features = extractor.extract(&temp_region);
            let size = self
                .predictor
                .predict(&features)
                .ok_or(Error::Unestimable(border.osm_id))?;
            subregions.push(Subregion { id: border.osm_id, geom: border.geom.clone(), size_kb: size });
        }
        Ok(subregions)
    }

    /// Computes the adjacency matrix for `subregions`, per §4.E step 3.
    pub fn adjacency_matrix(&self, subregions: &[Subregion]) -> Adjacency {
        let mut adjacency = FxHashMap::default();
        for i in 0..subregions.len() {
            for j in (i + 1)..subregions.len() {
                let a = &subregions[i];
                let b = &subregions[j];
                if !self.gateway.intersects(&a.geom, &b.geom) {
                    continue;
                }
                let shared = self.gateway.intersection(&a.geom, &b.geom);
                let boundary = shared_boundary_length(self.gateway, &a.geom, &b.geom, &shared);
                if boundary > 0.0 {
                    let key = if a.id < b.id { (a.id, b.id) } else { (b.id, a.id) };
                    adjacency.insert(key, boundary);
                }
            }
        }
        adjacency
    }

    /// Runs the full partitioning loop for `parent` at `level` and persists
    /// the surviving clusters as the splitting table for `(parent.id,
    /// level, threshold_kb)`, per §4.E step 6 / I8.
    pub fn partition<S: BorderStore>(
        &self,
        store: &S,
        parent: &Region,
        level: u8,
        threshold_kb: f64,
    ) -> Result<Vec<ClusterAggregate>> {
        let subregions = self.collect_subregions(parent, level)?;
        let adjacency = self.adjacency_matrix(&subregions);
        let clusters = golden_splitting(&subregions, &adjacency, threshold_kb);
        let rows = cluster_rows(self.gateway, parent.id, level, threshold_kb, &clusters, |id| {
            subregions.iter().find(|s| s.id == id).map(|s| s.geom.clone())
        });
        store.replace_clusters(parent.id, level, threshold_kb, rows)?;
        Ok(clusters)
    }
}

/// Materializes splitting-table rows from golden-splitting output, unioning
/// each cluster's member geometries via `geom_for` — a lookup callers supply
/// since `partition()` and bootstrap's already-materialized-children merge
/// draw subregion geometry from different collections.
pub fn cluster_rows(
    gateway: &InProcessGateway,
    region_id: i64,
    next_level: u8,
    size_threshold: f64,
    clusters: &[ClusterAggregate],
    geom_for: impl Fn(i64) -> Option<MultiPolygon<f64>>,
) -> Vec<Cluster> {
    clusters
        .iter()
        .map(|cluster| {
            let mut geom = MultiPolygon::new(vec![]);
            for &id in &cluster.subregion_ids {
                if let Some(member_geom) = geom_for(id) {
                    geom = gateway.union(&geom, &member_geom);
                }
            }
            Cluster {
                region_id,
                subregion_ids: cluster.subregion_ids.clone(),
                geom,
                next_level,
                size_threshold,
                predicted_size: cluster.size_kb,
            }
        })
        .collect()
}

/// `geo`'s boolean ops return an intersection polygon, not a shared-length
/// line; a border-sharing length is approximated as half the perimeter of
/// the (typically sliver) intersection polygon, which is exact for a
/// shared edge and degrades gracefully for point/near-empty intersections.
fn shared_boundary_length(
    gateway: &InProcessGateway,
    _a: &MultiPolygon<f64>,
    _b: &MultiPolygon<f64>,
    shared: &MultiPolygon<f64>,
) -> f64 {
    use geo::EuclideanLength;
    if shared.0.is_empty() {
        return 0.0;
    }
    let rings_length: f64 = shared
        .0
        .iter()
        .map(|poly| poly.exterior().euclidean_length())
        .sum();
    let lines = geo::MultiLineString::new(
        shared.0.iter().map(|poly| poly.exterior().clone()).collect(),
    );
    if rings_length <= 0.0 {
        return 0.0;
    }
    gateway.length_geodesic(&lines) / 2.0
}
