use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::limits::SWEEP_INTERVAL_SECS;

/// Background task driving time-based progression: finishes due confirmed
/// reservations through the validated transition path and reaps expired
/// advisory holds. Safe to re-run at any cadence — an already-transitioned
/// reservation no longer selects, so a second pass is a no-op.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    loop {
        interval.tick().await;

        let reaped = engine.purge_expired_holds();
        if reaped > 0 {
            tracing::debug!("reaped {reaped} expired slot holds");
        }

        match engine.sweep_due_at(crate::engine::now_local()).await {
            Ok(0) => {}
            Ok(n) => info!("sweep finished {n} due reservations"),
            // Store hiccups are retried on the next tick, not fatal.
            Err(e) => tracing::warn!("sweep pass failed: {e}"),
        }
    }
}
