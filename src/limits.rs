//! Policy constants. Everything tunable about slot generation, notice
//! windows, fees, and concurrency lives here; `Policy` bundles the knobs an
//! embedding service may override per deployment.

use crate::model::{Min, Span};

// ── Slot generation ──────────────────────────────────────────────

/// Smallest slot-walk step callers may request.
pub const MIN_SLOT_INTERVAL_MIN: Min = 15;

/// Walk step when the caller does not ask for one.
pub const DEFAULT_SLOT_INTERVAL_MIN: Min = 30;

/// Default opening window when a shop has no operating-hours row: 09:00–18:00.
pub const DEFAULT_OPEN_MIN: Min = 9 * 60;
pub const DEFAULT_CLOSE_MIN: Min = 18 * 60;

/// High-demand windows that get 15-minute granularity regardless of the
/// requested interval: 10:00–12:00 and 14:00–16:00.
pub const PEAK_WINDOWS: [Span; 2] = [
    Span { start: 10 * 60, end: 12 * 60 },
    Span { start: 14 * 60, end: 16 * 60 },
];

/// Symmetric gap enforced around a candidate slot when testing overlap.
pub const SLOT_GAP_BUFFER_MIN: Min = 15;

// ── State machine notice windows (hours) ─────────────────────────

pub const CONFIRM_DEADLINE_HOURS: i64 = 24;
pub const USER_CANCEL_NOTICE_HOURS: i64 = 2;
pub const SHOP_CANCEL_NOTICE_HOURS: i64 = 1;

/// Minutes past the scheduled time before the sweep auto-finishes a
/// confirmed reservation.
pub const AUTO_FINISH_AFTER_MIN: i64 = 30;

// ── Rescheduling ─────────────────────────────────────────────────

pub const MAX_RESCHEDULES: u32 = 3;
pub const MAX_RESCHEDULES_CONFIRMED: u32 = 2;
pub const MAX_ADVANCE_DAYS: i64 = 30;
pub const RESCHEDULE_NOTICE_HOURS: i64 = 2;
/// A user moving a confirmed reservation within this window needs shop
/// approval (surfaced as a warning, not an error).
pub const SHOP_APPROVAL_WINDOW_HOURS: i64 = 24;

// ── Fees (minor currency units) ──────────────────────────────────

pub const FEE_SAME_DAY: i64 = 30_000;
pub const FEE_UNDER_24H: i64 = 20_000;
/// Half of the <24h fee.
pub const FEE_UNDER_48H: i64 = FEE_UNDER_24H / 2;
pub const FEE_NO_SHOW: i64 = 50_000;
/// Admin-initiated reschedules pay this percentage of the computed fee.
pub const ADMIN_FEE_PERCENT: i64 = 50;
/// Refund adjustment cap: at most this percentage of the fee comes off.
pub const REFUND_ADJUST_CAP_PERCENT: i64 = 30;

// ── Concurrency ──────────────────────────────────────────────────

pub const LOCK_TIMEOUT_MS: u64 = 10_000;
pub const LOCK_RETRY_MS: u64 = 50;
pub const AVAILABILITY_CACHE_TTL_SECS: u64 = 30;
pub const SLOT_HOLD_TTL_SECS: u64 = 5 * 60;
pub const SWEEP_INTERVAL_SECS: u64 = 60;

/// Deployment-tunable policy. Defaults mirror the constants above.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    /// Added on top of the widest per-service duration+buffer when sizing
    /// generated slots.
    pub global_slot_buffer_min: Min,
    pub slot_gap_buffer_min: Min,
    pub max_reschedules: u32,
    pub max_reschedules_confirmed: u32,
    pub max_advance_days: i64,
    pub reschedule_notice_hours: i64,
    pub lock_timeout_ms: u64,
    pub fee_same_day: i64,
    pub fee_under_24h: i64,
    pub fee_under_48h: i64,
    pub fee_no_show: i64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            global_slot_buffer_min: 0,
            slot_gap_buffer_min: SLOT_GAP_BUFFER_MIN,
            max_reschedules: MAX_RESCHEDULES,
            max_reschedules_confirmed: MAX_RESCHEDULES_CONFIRMED,
            max_advance_days: MAX_ADVANCE_DAYS,
            reschedule_notice_hours: RESCHEDULE_NOTICE_HOURS,
            lock_timeout_ms: LOCK_TIMEOUT_MS,
            fee_same_day: FEE_SAME_DAY,
            fee_under_24h: FEE_UNDER_24H,
            fee_under_48h: FEE_UNDER_48H,
            fee_no_show: FEE_NO_SHOW,
        }
    }
}
