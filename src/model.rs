use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Whole minutes since local midnight — the only time type slot math uses.
pub type Min = i32;

/// Half-open interval `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Min,
    pub end: Min,
}

impl Span {
    pub fn new(start: Min, end: Min) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_min(&self) -> Min {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Min) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Symmetric widening by `pad` minutes on both sides, floored at 0.
    pub fn padded(&self, pad: Min) -> Span {
        Span {
            start: (self.start - pad).max(0),
            end: self.end + pad,
        }
    }
}

pub fn minute_of(t: NaiveTime) -> Min {
    (t.hour() * 60 + t.minute()) as Min
}

// ── Reservation lifecycle ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Requested,
    Confirmed,
    Completed,
    CancelledByUser,
    CancelledByShop,
    NoShow,
}

impl ReservationStatus {
    /// Terminal for the normal flow; operator overrides can still leave these.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReservationStatus::Completed
                | ReservationStatus::CancelledByUser
                | ReservationStatus::CancelledByShop
                | ReservationStatus::NoShow
        )
    }

    /// Blocking statuses occupy their time interval for overlap purposes.
    pub fn is_blocking(&self) -> bool {
        matches!(self, ReservationStatus::Requested | ReservationStatus::Confirmed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Requested => "requested",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Completed => "completed",
            ReservationStatus::CancelledByUser => "cancelled_by_user",
            ReservationStatus::CancelledByShop => "cancelled_by_shop",
            ReservationStatus::NoShow => "no_show",
        }
    }
}

/// Who is triggering an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    User,
    Shop,
    Admin,
    System,
}

impl Actor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::User => "user",
            Actor::Shop => "shop",
            Actor::Admin => "admin",
            Actor::System => "system",
        }
    }
}

/// One service line item on a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationService {
    pub service_id: Ulid,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub status: ReservationStatus,
    pub services: Vec<ReservationService>,
    /// Minor currency units.
    pub total_amount: i64,
    /// Refund penalty already incurred; consulted by the reschedule fee adjustment.
    pub refund_penalty: i64,
    pub reschedule_count: u32,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    pub confirmed_at: Option<NaiveDateTime>,
    pub completed_at: Option<NaiveDateTime>,
    pub cancelled_at: Option<NaiveDateTime>,
    pub cancellation_reason: Option<String>,
    /// Absence signal recorded by the shop ahead of the automatic sweep.
    pub no_show_reason: Option<String>,
    /// Compare-and-swap guard: updates must name the version they read.
    pub version: u64,
}

impl Reservation {
    pub fn scheduled_at(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }

    pub fn start_minute(&self) -> Min {
        minute_of(self.time)
    }

    /// Occupied interval: start + Σ(duration × quantity) + the widest
    /// service buffer. Timings missing from the map contribute nothing.
    pub fn occupied_span(&self, timings: &HashMap<Ulid, ServiceTiming>) -> Span {
        let start = self.start_minute();
        let mut total = 0;
        let mut buffer = 0;
        for line in &self.services {
            if let Some(t) = timings.get(&line.service_id) {
                total += t.duration_min * line.quantity as Min;
                buffer = buffer.max(t.buffer_min);
            }
        }
        Span::new(start, start + total.max(1) + buffer)
    }
}

/// Duration + trailing buffer for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTiming {
    pub duration_min: Min,
    pub buffer_min: Min,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub shop_id: Ulid,
    pub name: String,
    pub price: i64,
    pub timing: ServiceTiming,
}

// ── Shop configuration ────────────────────────────────────────────

/// Per-weekday opening window. Absent row ⇒ the default window applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    /// 0 = Sunday … 6 = Saturday.
    pub weekday: u8,
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub is_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaffAvailability {
    pub staff_id: Ulid,
    pub name: String,
    /// Working window in minutes since midnight.
    pub working: Span,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentAvailability {
    pub equipment_id: Ulid,
    pub name: String,
    /// Services that need this item.
    pub required_by: Vec<Ulid>,
    pub remaining: u32,
}

/// Constraint inputs only — the core never mutates capacity config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShopCapacity {
    pub shop_id: Ulid,
    pub max_concurrent_services: u32,
    pub max_concurrent_customers: u32,
    pub per_service: HashMap<Ulid, u32>,
    pub staff: Vec<StaffAvailability>,
    pub equipment: Vec<EquipmentAvailability>,
}

// ── Slots ─────────────────────────────────────────────────────────

/// A candidate time window, generated independent of any occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Min,
    pub end: Min,
    pub duration: Min,
    pub available: bool,
}

/// Why a slot was refused. The first failed rule fixes the reason even
/// though conflicting ids keep accumulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnavailableReason {
    TimeConflict,
    ConcurrentServiceLimit,
    ServiceCapacity,
    StaffUnavailable,
    EquipmentUnavailable,
    Held,
}

impl UnavailableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnavailableReason::TimeConflict => "time_conflict",
            UnavailableReason::ConcurrentServiceLimit => "concurrent_service_limit",
            UnavailableReason::ServiceCapacity => "service_capacity",
            UnavailableReason::StaffUnavailable => "staff_unavailable",
            UnavailableReason::EquipmentUnavailable => "equipment_unavailable",
            UnavailableReason::Held => "held",
        }
    }
}

/// Outcome of an availability check for one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityDecision {
    pub available: bool,
    pub conflicting: Vec<Ulid>,
    pub reason: Option<UnavailableReason>,
}

impl AvailabilityDecision {
    pub fn free() -> Self {
        Self { available: true, conflicting: Vec::new(), reason: None }
    }
}

// ── Conflicts ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    TimeOverlap,
    ResourceShortage,
    StaffUnavailable,
    CapacityExceeded,
    DoubleBooking,
    ServiceConflict,
    PaymentConflict,
}

impl ConflictKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictKind::TimeOverlap => "time_overlap",
            ConflictKind::ResourceShortage => "resource_shortage",
            ConflictKind::StaffUnavailable => "staff_unavailable",
            ConflictKind::CapacityExceeded => "capacity_exceeded",
            ConflictKind::DoubleBooking => "double_booking",
            ConflictKind::ServiceConflict => "service_conflict",
            ConflictKind::PaymentConflict => "payment_conflict",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }

    /// Map a mean of 1–4 ranks back onto a severity bucket.
    pub fn from_mean(mean: f64) -> Severity {
        if mean >= 3.5 {
            Severity::Critical
        } else if mean >= 2.5 {
            Severity::High
        } else if mean >= 1.5 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionMethod {
    AutomaticReschedule,
    ManualReschedule,
    Cancellation,
    Compensation,
    PriorityOverride,
    ResourceReallocation,
}

impl ResolutionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionMethod::AutomaticReschedule => "automatic_reschedule",
            ResolutionMethod::ManualReschedule => "manual_reschedule",
            ResolutionMethod::Cancellation => "cancellation",
            ResolutionMethod::Compensation => "compensation",
            ResolutionMethod::PriorityOverride => "priority_override",
            ResolutionMethod::ResourceReallocation => "resource_reallocation",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationKind {
    Refund,
    Discount,
    FreeService,
    Points,
    Voucher,
}

/// Recorded intent only — the payment/loyalty subsystem executes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compensation {
    pub kind: CompensationKind,
    pub amount: i64,
    pub note: Option<String>,
    pub applied_at: NaiveDateTime,
}

/// Append-only audit entity: detection creates it, resolution fills in the
/// `resolved_*` fields, nothing deletes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: Ulid,
    pub kind: ConflictKind,
    pub severity: Severity,
    pub shop_id: Ulid,
    pub affected_reservation_ids: Vec<Ulid>,
    pub detected_at: NaiveDateTime,
    pub resolved_at: Option<NaiveDateTime>,
    pub resolved_by: Option<Ulid>,
    pub resolution_method: Option<ResolutionMethod>,
    pub compensation: Option<Compensation>,
}

// ── Audit trail ───────────────────────────────────────────────────

/// Immutable record of one successful status transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeLog {
    pub reservation_id: Ulid,
    pub from: ReservationStatus,
    pub to: ReservationStatus,
    pub changed_by: Actor,
    pub changed_by_id: Ulid,
    pub reason: Option<String>,
    pub at: NaiveDateTime,
}

/// Immutable record of one committed reschedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleRecord {
    pub reservation_id: Ulid,
    pub old_date: NaiveDate,
    pub old_time: NaiveTime,
    pub new_date: NaiveDate,
    pub new_time: NaiveTime,
    pub requested_by: Actor,
    pub fee: i64,
    pub at: NaiveDateTime,
}

// ── Customers & payments ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerTier {
    Admin,
    Vip,
    Member,
    Basic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub user_id: Ulid,
    pub tier: CustomerTier,
    pub loyalty_points: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    FullyPaid,
    DepositPaid,
    Pending,
}

// ── Inbound request shapes ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub shop_id: Ulid,
    pub user_id: Ulid,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub services: Vec<ReservationService>,
    pub total_amount: i64,
}

/// Raw date/time strings — parsing failures surface as validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleRequest {
    pub reservation_id: Ulid,
    pub new_date: String,
    pub new_time: String,
    pub reason: Option<String>,
    pub requested_by: Actor,
    pub requested_by_id: Ulid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub reservation_id: Ulid,
    pub to: ReservationStatus,
    pub changed_by: Actor,
    pub changed_by_id: Ulid,
    pub reason: Option<String>,
    /// Required by the privileged completed↔no_show corrections.
    pub approved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Reschedule,
    Cancel,
    Modify,
    Keep,
}

/// What to do with one affected reservation during resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationAction {
    pub reservation_id: Ulid,
    pub action: ActionKind,
    pub new_date: Option<NaiveDate>,
    pub new_time: Option<NaiveTime>,
    pub new_services: Option<Vec<ReservationService>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictResolutionRequest {
    pub conflict_id: Ulid,
    pub method: ResolutionMethod,
    pub resolved_by: Ulid,
    pub actions: Vec<ReservationAction>,
    pub compensation: Option<(CompensationKind, i64)>,
}
