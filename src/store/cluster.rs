use geo::MultiPolygon;

/// One row of the splitting table. See data model §3.1: transient, rebuilt
/// every time a region is re-partitioned at a given level and threshold.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub region_id: i64,
    pub subregion_ids: Vec<i64>,
    pub geom: MultiPolygon<f64>,
    pub next_level: u8,
    pub size_threshold: f64,
    pub predicted_size: f64,
}

impl Cluster {
    /// The key cluster rows for a single partitioning run share: I8 is
    /// defined over all rows with the same `(region_id, next_level,
    /// size_threshold)` tuple.
    pub fn key(&self) -> ClusterKey {
        ClusterKey { region_id: self.region_id, next_level: self.next_level, size_threshold_bits: self.size_threshold.to_bits() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterKey {
    pub region_id: i64,
    pub next_level: u8,
    size_threshold_bits: u64,
}

impl ClusterKey {
    pub fn new(region_id: i64, next_level: u8, size_threshold: f64) -> ClusterKey {
        ClusterKey { region_id, next_level, size_threshold_bits: size_threshold.to_bits() }
    }
}
