use chrono::{DateTime, Utc};
use geo::MultiPolygon;
use serde::{Deserialize, Serialize};

/// The central entity of the Border store. See data model §3.1.
#[derive(Debug, Clone)]
pub struct Region {
    pub id: i64,
    pub name: String,
    pub geom: MultiPolygon<f64>,
    pub parent_id: Option<i64>,
    pub disabled: bool,
    pub modified: DateTime<Utc>,
    /// `None` = never computed (I6); `Some(n)` with `n < 0` = stale.
    pub count_k: Option<i64>,
    pub mwm_size_est: Option<f64>,
    pub cmnt: Option<String>,
}

impl Region {
    pub fn new(id: i64, name: impl Into<String>, geom: MultiPolygon<f64>, parent_id: Option<i64>) -> Region {
        Region {
            id,
            name: name.into(),
            geom,
            parent_id,
            disabled: false,
            modified: Utc::now(),
            count_k: None,
            mwm_size_est: None,
            cmnt: None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self.count_k, Some(n) if n < 0)
    }

    pub fn is_never_computed(&self) -> bool {
        self.count_k.is_none()
    }

    /// Marks the region stale per §4.D `update_geom`'s "always mark
    /// count_k = -1" rule; the caller decides separately whether to clear
    /// or recompute `mwm_size_est`.
    pub fn mark_stale(&mut self) {
        self.count_k = Some(-1);
        self.modified = Utc::now();
    }
}

/// Row shape persisted to the `.region.csv` file; kept separate from
/// `Region` because the geometry column is stored as WKT text, not the
/// in-memory `MultiPolygon`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RegionRow {
    pub id: i64,
    pub name: String,
    pub wkt: String,
    pub parent_id: Option<i64>,
    pub disabled: bool,
    pub modified: String,
    pub count_k: Option<i64>,
    pub mwm_size_est: Option<f64>,
    pub cmnt: Option<String>,
}

impl RegionRow {
    pub fn from_region(region: &Region) -> RegionRow {
        RegionRow {
            id: region.id,
            name: region.name.clone(),
            wkt: crate::geom::multipolygon_to_wkt(&region.geom),
            parent_id: region.parent_id,
            disabled: region.disabled,
            modified: region.modified.to_rfc3339(),
            count_k: region.count_k,
            mwm_size_est: region.mwm_size_est,
            cmnt: region.cmnt.clone(),
        }
    }

    pub fn into_region(self) -> crate::error::Result<Region> {
        let geom = crate::geom::wkt_to_multipolygon(&self.wkt)?;
        let modified = DateTime::parse_from_rfc3339(&self.modified)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());
        Ok(Region {
            id: self.id,
            name: self.name,
            geom,
            parent_id: self.parent_id,
            disabled: self.disabled,
            modified,
            count_k: self.count_k,
            mwm_size_est: self.mwm_size_est,
            cmnt: self.cmnt,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn sample_geom() -> MultiPolygon<f64> {
        MultiPolygon::new(vec![polygon![
            (x: 0.0, y: 0.0), (x: 1.0, y: 0.0), (x: 1.0, y: 1.0), (x: 0.0, y: 1.0), (x: 0.0, y: 0.0),
        ]])
    }

    #[test]
    fn mark_stale_sets_count_k_to_negative_one() {
        let mut region = Region::new(1, "Test", sample_geom(), None);
        assert!(region.is_never_computed());
        region.mark_stale();
        assert!(region.is_stale());
        assert_eq!(region.count_k, Some(-1));
    }

    #[test]
    fn row_round_trips_through_wkt() {
        let region = Region::new(42, "Roundtrip", sample_geom(), Some(1));
        let row = RegionRow::from_region(&region);
        let restored = row.into_region().unwrap();
        assert_eq!(restored.id, 42);
        assert_eq!(restored.name, "Roundtrip");
        assert_eq!(restored.parent_id, Some(1));
        assert_eq!(restored.geom.0.len(), 1);
    }
}
