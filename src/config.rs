use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Per-feature upper bound the predictor enforces before declaring a
/// feature vector unestimable. Order matches `Predictor::FEATURE_ORDER`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelLimits {
    pub city_population_sum: f64,
    pub land_area_km2: f64,
    pub city_count: f64,
    pub hamlet_count: f64,
    pub coastline_length_km: f64,
}

impl Default for ModelLimits {
    fn default() -> Self {
        ModelLimits {
            city_population_sum: 50_000_000.0,
            land_area_km2: 5_000_000.0,
            city_count: 5_000.0,
            hamlet_count: 50_000.0,
            coastline_length_km: 100_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub connection: String,
    pub read_only: bool,

    pub borders_table: String,
    pub osm_table: String,
    pub osm_places_table: String,
    pub land_polygons_table: String,
    pub coastline_table: String,
    pub tiles_table: String,
    pub backup_table: String,
    pub autosplit_table: String,

    pub small_km2: f64,
    pub mwm_size_threshold: f64,

    pub model_path: PathBuf,
    pub scaler_path: PathBuf,
    pub model_limits: ModelLimits,

    pub josm_force_multi: bool,

    pub daemon_status_path: PathBuf,
    pub daemon_pid_path: PathBuf,
    pub daemon_log_path: PathBuf,

    pub worker_poll_interval_secs: u64,
    pub worker_max_envelope_area_deg2: f64,

    pub snapshot_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connection: "inprocess://default".to_string(),
            read_only: false,
            borders_table: "borders".to_string(),
            osm_table: "osm_borders".to_string(),
            osm_places_table: "osm_places".to_string(),
            land_polygons_table: "land_polygons".to_string(),
            coastline_table: "coastlines".to_string(),
            tiles_table: "tiles".to_string(),
            backup_table: "borders_backup".to_string(),
            autosplit_table: "splitting".to_string(),
            small_km2: 10.0,
            mwm_size_threshold: 70.0 * 1024.0,
            model_path: PathBuf::from("model.json"),
            scaler_path: PathBuf::from("model.json"),
            model_limits: ModelLimits::default(),
            josm_force_multi: true,
            daemon_status_path: PathBuf::from("daemon.status"),
            daemon_pid_path: PathBuf::from("daemon.pid"),
            daemon_log_path: PathBuf::from("daemon.log"),
            worker_poll_interval_secs: 10,
            worker_max_envelope_area_deg2: 5_000_000.0,
            snapshot_dir: PathBuf::from("snapshots"),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let file = File::open(path)?;
        let config = serde_yaml::from_reader(file)?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_yaml::to_writer(file, self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.small_km2, 10.0);
        assert_eq!(config.mwm_size_threshold, 70.0 * 1024.0);
        assert!(config.josm_force_multi);
        assert_eq!(config.worker_poll_interval_secs, 10);
    }

    #[test]
    fn round_trips_through_yaml() {
        let config = Config::default();
        let path = std::env::temp_dir().join("border_partitioner_config_test.yml");
        config.to_file(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.borders_table, config.borders_table);
        assert_eq!(loaded.mwm_size_threshold, config.mwm_size_threshold);
        std::fs::remove_file(&path).ok();
    }
}
