//! Background size-counting worker: a single-threaded loop that picks
//! stale or never-computed regions, sums tile counts over their geometry,
//! and writes the result back to `count_k`. Grounded on the two-stage
//! candidate preference and scratch status file described for the
//! background worker in §4.I/§5.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{error, info, warn};

use crate::error::Result;
use crate::gateway::{InProcessGateway, SpatialGateway};
use crate::store::BorderStore;

/// Picks one candidate by the two-stage preference (`count_k < 0` first,
/// then `count_k IS NULL`), restricted to regions whose envelope area stays
/// under `max_envelope_area_deg2`. Exposed separately from the sleep/retry
/// loop so it can be unit tested without a clock.
pub fn pick_candidate<S: BorderStore>(store: &S, gateway: &InProcessGateway, max_envelope_area_deg2: f64) -> Result<Option<i64>> {
    let world = geo::Rect::new(geo::coord! { x: -180.0, y: -90.0 }, geo::coord! { x: 180.0, y: 90.0 });
    let all = store.in_bbox(world, crate::store::SimplifyLevel::Full)?;

    let under_cap = |region: &crate::store::region::Region| -> bool {
        match gateway.envelope(&region.geom) {
            Some(rect) => {
                let area = (rect.max().x - rect.min().x) * (rect.max().y - rect.min().y);
                area <= max_envelope_area_deg2
            }
            None => false,
        }
    };

    if let Some(stale) = all.iter().filter(|r| r.is_stale() && under_cap(r)).min_by_key(|r| r.id) {
        return Ok(Some(stale.id));
    }
    if let Some(uncomputed) = all.iter().filter(|r| r.is_never_computed() && under_cap(r)).min_by_key(|r| r.id) {
        return Ok(Some(uncomputed.id));
    }
    Ok(None)
}

/// Computes and writes back `count_k` for `region_id`; writes the region's
/// name to the scratch status file while processing, clearing it on
/// completion, per §4.I.
pub fn process_one<S: BorderStore>(store: &S, gateway: &InProcessGateway, region_id: i64, status_path: &Path) -> Result<()> {
    let region = store.get(region_id)?;
    write_status(status_path, &region.name);
    let count = gateway.tile_count_sum(&region.geom);
    store.set_count_k(region_id, count)?;
    clear_status(status_path);
    Ok(())
}

fn write_status(path: &Path, region_name: &str) {
    if let Err(err) = fs::write(path, region_name) {
        warn!("failed to write worker status file {}: {err}", path.display());
    }
}

fn clear_status(path: &Path) {
    if let Err(err) = fs::write(path, "") {
        warn!("failed to clear worker status file {}: {err}", path.display());
    }
}

/// Runs the worker loop until `should_stop` returns true. One dedicated
/// connection (here, the same in-process mutex-guarded store as request
/// handlers use), autocommit per update, sleeping briefly on a dry query
/// and retrying with backoff on a store error, per §5.
pub fn run<S: BorderStore>(
    store: &S,
    gateway: &InProcessGateway,
    status_path: PathBuf,
    poll_interval: Duration,
    max_envelope_area_deg2: f64,
    mut should_stop: impl FnMut() -> bool,
    mut sleep: impl FnMut(Duration),
) {
    let mut backoff = poll_interval;
    while !should_stop() {
        match pick_candidate(store, gateway, max_envelope_area_deg2) {
            Ok(Some(region_id)) => {
                backoff = poll_interval;
                if let Err(err) = process_one(store, gateway, region_id, &status_path) {
                    error!("worker failed on region {region_id}: {err}");
                    clear_status(&status_path);
                    sleep(backoff);
                    backoff = (backoff * 2).min(Duration::from_secs(300));
                }
            }
            Ok(None) => {
                sleep(poll_interval);
            }
            Err(err) => {
                error!("worker lost its store connection: {err}");
                sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(300));
            }
        }
    }
    info!("worker loop stopped");
}
