//! Size predictor: a frozen linear regression over five scaled features,
//! loaded once from a versioned JSON asset and shared read-only afterwards.
//! Grounded on the feature order and bound-checking behaviour of the
//! "unavailable beyond bounds" rule; the model format itself (plain JSON
//! coefficients rather than a pickled scikit-learn pair) is this core's own
//! choice, recorded in DESIGN.md.

use std::fs::File;
use std::path::Path;
use std::sync::Mutex;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::config::ModelLimits;
use crate::error::{Error, Result};

pub const MODEL_SCHEMA_VERSION: u32 = 1;

pub const FEATURE_ORDER: [&str; 5] = [
    "city_population_sum",
    "land_area_km2",
    "city_count",
    "hamlet_count",
    "coastline_length_km",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelAsset {
    pub version: u32,
    pub intercept: f64,
    pub coefficients: [f64; 5],
    pub feature_means: [f64; 5],
    pub feature_scales: [f64; 5],
}

impl ModelAsset {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<ModelAsset> {
        let file = File::open(path)?;
        let asset: ModelAsset = serde_json::from_reader(file)?;
        if asset.version != MODEL_SCHEMA_VERSION {
            return Err(Error::InvalidModel(format!(
                "model schema version {} does not match expected {}",
                asset.version, MODEL_SCHEMA_VERSION
            )));
        }
        Ok(asset)
    }
}

/// A region's feature vector in the fixed order `FEATURE_ORDER`. Any `None`
/// entry means "not computed because an earlier bound was already
/// exceeded," per §4.C step 2.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    pub city_population_sum: Option<f64>,
    pub land_area_km2: Option<f64>,
    pub city_count: Option<f64>,
    pub hamlet_count: Option<f64>,
    pub coastline_length_km: Option<f64>,
}

impl Features {
    fn as_array(&self) -> Option<[f64; 5]> {
        Some([
            self.city_population_sum?,
            self.land_area_km2?,
            self.city_count?,
            self.hamlet_count?,
            self.coastline_length_km?,
        ])
    }

    fn exceeds_bounds(&self, limits: &ModelLimits) -> bool {
        self.land_area_km2.map_or(false, |v| v > limits.land_area_km2)
            || self.city_population_sum.map_or(false, |v| v > limits.city_population_sum)
            || self.city_count.map_or(false, |v| v > limits.city_count)
            || self.hamlet_count.map_or(false, |v| v > limits.hamlet_count)
            || self.coastline_length_km.map_or(false, |v| v > limits.coastline_length_km)
    }
}

pub struct Predictor {
    asset: ModelAsset,
    limits: ModelLimits,
}

impl Predictor {
    pub fn new(asset: ModelAsset, limits: ModelLimits) -> Predictor {
        Predictor { asset, limits }
    }

    pub fn load<P: AsRef<Path>>(model_path: P, limits: ModelLimits) -> Result<Predictor> {
        let asset = ModelAsset::from_file(model_path)?;
        Ok(Predictor::new(asset, limits))
    }

    /// Returns `None` ("unavailable") if any feature is missing or exceeds
    /// its configured bound, per §4.B.
    pub fn predict(&self, features: &Features) -> Option<f64> {
        if features.exceeds_bounds(&self.limits) {
            return None;
        }
        let values = features.as_array()?;
        let mut z = self.asset.intercept;
        for i in 0..5 {
            let scale = if self.asset.feature_scales[i] == 0.0 { 1.0 } else { self.asset.feature_scales[i] };
            let scaled = (values[i] - self.asset.feature_means[i]) / scale;
            z += self.asset.coefficients[i] * scaled;
        }
        Some(z.max(0.0))
    }

    pub fn predict_batch(&self, rows: &[Features]) -> Vec<Option<f64>> {
        rows.iter().map(|f| self.predict(f)).collect()
    }
}

lazy_static! {
    static ref GLOBAL_PREDICTOR: Mutex<Option<std::sync::Arc<Predictor>>> = Mutex::new(None);
}

/// Lazily initializes the process-wide predictor instance; concurrent
/// first-use calls all observe the same initialized instance, per §4.B's
/// "lazily re-entrant" loading requirement.
pub fn global_predictor<P: AsRef<Path>>(
    model_path: P,
    limits: ModelLimits,
) -> Result<std::sync::Arc<Predictor>> {
    let mut guard = GLOBAL_PREDICTOR.lock().unwrap();
    if let Some(existing) = guard.as_ref() {
        return Ok(existing.clone());
    }
    let predictor = std::sync::Arc::new(Predictor::load(model_path, limits)?);
    *guard = Some(predictor.clone());
    Ok(predictor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_asset() -> ModelAsset {
        ModelAsset {
            version: MODEL_SCHEMA_VERSION,
            intercept: 0.0,
            coefficients: [1.0, 1.0, 1.0, 1.0, 1.0],
            feature_means: [0.0, 0.0, 0.0, 0.0, 0.0],
            feature_scales: [1.0, 1.0, 1.0, 1.0, 1.0],
        }
    }

    #[test]
    fn predict_sums_features_for_identity_model() {
        let predictor = Predictor::new(identity_asset(), ModelLimits::default());
        let features = Features {
            city_population_sum: Some(10.0),
            land_area_km2: Some(20.0),
            city_count: Some(1.0),
            hamlet_count: Some(2.0),
            coastline_length_km: Some(3.0),
        };
        assert_eq!(predictor.predict(&features), Some(36.0));
    }

    #[test]
    fn predict_returns_none_when_land_area_exceeds_bound() {
        let mut limits = ModelLimits::default();
        limits.land_area_km2 = 100.0;
        let predictor = Predictor::new(identity_asset(), limits);
        let features = Features {
            city_population_sum: None,
            land_area_km2: Some(200.0),
            city_count: None,
            hamlet_count: None,
            coastline_length_km: None,
        };
        assert_eq!(predictor.predict(&features), None);
    }

    #[test]
    fn predict_returns_none_when_feature_missing() {
        let predictor = Predictor::new(identity_asset(), ModelLimits::default());
        let features = Features {
            city_population_sum: Some(1.0),
            land_area_km2: None,
            city_count: Some(1.0),
            hamlet_count: Some(1.0),
            coastline_length_km: Some(1.0),
        };
        assert_eq!(predictor.predict(&features), None);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let mut asset = identity_asset();
        asset.version = 99;
        let path = std::env::temp_dir().join("border_partitioner_bad_model.json");
        let file = File::create(&path).unwrap();
        serde_json::to_writer(file, &asset).unwrap();
        let err = ModelAsset::from_file(&path).unwrap_err();
        assert!(matches!(err, Error::InvalidModel(_)));
        std::fs::remove_file(&path).ok();
    }
}
