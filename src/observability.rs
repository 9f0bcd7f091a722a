use std::net::SocketAddr;

use crate::model::ReservationStatus;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: slot-generation queries. Labels: shop.
pub const SLOT_QUERIES_TOTAL: &str = "bookd_slot_queries_total";

/// Counter: availability checks answered from cache.
pub const AVAILABILITY_CACHE_HITS_TOTAL: &str = "bookd_availability_cache_hits_total";

/// Counter: availability checks computed fresh.
pub const AVAILABILITY_CACHE_MISSES_TOTAL: &str = "bookd_availability_cache_misses_total";

/// Counter: state transitions executed. Labels: from, to, actor.
pub const TRANSITIONS_TOTAL: &str = "bookd_transitions_total";

/// Counter: transition attempts rejected by validation.
pub const TRANSITION_REJECTIONS_TOTAL: &str = "bookd_transition_rejections_total";

/// Counter: committed reschedules.
pub const RESCHEDULES_TOTAL: &str = "bookd_reschedules_total";

/// Histogram: reschedule fee charged (minor units).
pub const RESCHEDULE_FEE: &str = "bookd_reschedule_fee";

// ── Concurrency & degradation ───────────────────────────────────

/// Counter: reschedule lock acquisitions that timed out.
pub const LOCK_TIMEOUTS_TOTAL: &str = "bookd_lock_timeouts_total";

/// Counter: compare-and-swap updates rejected by the store.
pub const VERSION_CONFLICTS_TOTAL: &str = "bookd_version_conflicts_total";

/// Counter: conflicts recorded by detection. Labels: kind.
pub const CONFLICTS_DETECTED_TOTAL: &str = "bookd_conflicts_detected_total";

/// Counter: detection calls that degraded to an empty report on internal
/// failure. Every fallback path must bump this.
pub const DETECTION_FALLBACKS_TOTAL: &str = "bookd_detection_fallbacks_total";

/// Counter: automatic sweep transitions. Labels: to.
pub const SWEEP_TRANSITIONS_TOTAL: &str = "bookd_sweep_transitions_total";

/// Counter: advisory holds reaped after expiry.
pub const HOLDS_EXPIRED_TOTAL: &str = "bookd_holds_expired_total";

/// Counter: notifications emitted (not delivered).
pub const NOTIFICATIONS_EMITTED_TOTAL: &str = "bookd_notifications_emitted_total";

/// Install the default fmt tracing subscriber. Embedding services with
/// their own subscriber skip this.
pub fn init_tracing() {
    tracing_subscriber::fmt::init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a status to a short label for metrics.
pub fn status_label(status: ReservationStatus) -> &'static str {
    status.as_str()
}
