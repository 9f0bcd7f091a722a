mod conflict;
mod error;
mod lifecycle;
mod reschedule;
mod resolution;
mod slots;

pub use conflict::{check_availability, detect_shop_conflicts, overall_severity, ShopConflictScan};
pub use error::EngineError;
pub use lifecycle::{
    rule_for, validate_transition, TransitionContext, TransitionOutcome, TransitionRule,
    TRANSITIONS,
};
pub use reschedule::{compute_fee, RescheduleAssessment, RescheduleOutcome, RescheduleWarning};
pub use resolution::{
    lead_time_weight, loyalty_weight, payment_weight, priority_score, service_value_weight,
    tier_weight, ConflictReport, PriorityScore, ReservationResolution, ResolutionOutcome,
};
pub use slots::{
    compute_saturated_spans, generate_slots, merge_overlapping, slot_duration_for,
    subtract_intervals,
};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::cache::{AvailabilityCache, SlotKey};
use crate::limits::{Policy, DEFAULT_CLOSE_MIN, DEFAULT_OPEN_MIN, DEFAULT_SLOT_INTERVAL_MIN};
use crate::lock::LockService;
use crate::model::*;
use crate::notify::{Notification, NotifyHub};
use crate::observability;
use crate::store::{PaymentPort, Store};

pub(crate) fn now_local() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

fn weekday_of(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

/// The booking core. Stateless between calls apart from the availability
/// cache; everything durable lives behind the injected collaborators.
pub struct Engine {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) payments: Arc<dyn PaymentPort>,
    pub(crate) locks: Arc<dyn LockService>,
    pub notify: Arc<NotifyHub>,
    pub(crate) cache: AvailabilityCache,
    pub(crate) policy: Policy,
}

impl Engine {
    pub fn new(
        store: Arc<dyn Store>,
        payments: Arc<dyn PaymentPort>,
        locks: Arc<dyn LockService>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        Self::with_policy(store, payments, locks, notify, Policy::default())
    }

    pub fn with_policy(
        store: Arc<dyn Store>,
        payments: Arc<dyn PaymentPort>,
        locks: Arc<dyn LockService>,
        notify: Arc<NotifyHub>,
        policy: Policy,
    ) -> Self {
        Self {
            store,
            payments,
            locks,
            notify,
            cache: AvailabilityCache::default(),
            policy,
        }
    }

    /// Opening window for a shop on a date. A missing row means the default
    /// window, never an error; a closed day is `None`.
    pub(crate) async fn resolve_hours(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
    ) -> Result<Option<Span>, EngineError> {
        match self.store.operating_hours(shop_id, weekday_of(date)).await? {
            Some(hours) if !hours.is_open => Ok(None),
            Some(hours) => Ok(Some(Span::new(minute_of(hours.open), minute_of(hours.close)))),
            None => Ok(Some(Span::new(DEFAULT_OPEN_MIN, DEFAULT_CLOSE_MIN))),
        }
    }

    /// Timing lookup for every service the given reservations reference.
    pub(crate) async fn timings_for(
        &self,
        reservations: &[Reservation],
    ) -> Result<HashMap<Ulid, ServiceTiming>, EngineError> {
        let mut ids: Vec<Ulid> = reservations
            .iter()
            .flat_map(|r| r.services.iter().map(|s| s.service_id))
            .collect();
        ids.sort();
        ids.dedup();
        let services = self.store.services(&ids).await?;
        Ok(services.into_iter().map(|s| (s.id, s.timing)).collect())
    }

    /// Generate candidate slots for a shop, date and service set, with
    /// availability resolved against the current reservation set.
    ///
    /// The three independent reads (operating hours, service catalogue,
    /// existing reservations) are issued concurrently; scoring proceeds
    /// once all of them resolve.
    pub async fn generate_slots_for(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
        service_ids: &[Ulid],
        window: Option<Span>,
        interval: Option<Min>,
    ) -> Result<Vec<Slot>, EngineError> {
        metrics::counter!(observability::SLOT_QUERIES_TOTAL).increment(1);
        if service_ids.is_empty() {
            return Err(EngineError::Validation("at least one service is required".into()));
        }

        let (open, services, existing, capacity) = tokio::join!(
            self.resolve_hours(shop_id, date),
            self.store.services(service_ids),
            self.store.reservations_for_shop(shop_id, Some((date, date))),
            self.store.capacity(shop_id),
        );
        let services = services?;
        if services.is_empty() {
            return Err(EngineError::NotFound("service", service_ids[0]));
        }
        let Some(open) = open? else {
            return Ok(Vec::new()); // closed that day
        };
        let existing = existing?;
        let capacity = capacity?;

        let slot_duration = slot_duration_for(&services, self.policy.global_slot_buffer_min);
        let interval = interval.unwrap_or(DEFAULT_SLOT_INTERVAL_MIN);
        let mut generated = generate_slots(open, window, slot_duration, interval);

        let timings = self.timings_for(&existing).await?;
        let requested: Vec<ReservationService> = service_ids
            .iter()
            .map(|&id| ReservationService { service_id: id, quantity: 1 })
            .collect();

        for slot in &mut generated {
            let span = Span::new(slot.start, slot.end);
            let decision = check_availability(
                &span,
                &requested,
                &existing,
                &timings,
                capacity.as_ref(),
                self.policy.slot_gap_buffer_min,
            );
            slot.available =
                decision.available && !self.cache.held_by_other(shop_id, date, slot.start, None);
        }

        Ok(generated)
    }

    /// Availability decision for one concrete slot. Cached (30s TTL) unless
    /// the check excludes a reservation, since exclusion makes the answer
    /// caller-specific.
    pub(crate) async fn decide_slot(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
        start: Min,
        requested: &[ReservationService],
        exclude: Option<Ulid>,
        for_user: Option<Ulid>,
    ) -> Result<AvailabilityDecision, EngineError> {
        if self.cache.held_by_other(shop_id, date, start, for_user) {
            return Ok(AvailabilityDecision {
                available: false,
                conflicting: Vec::new(),
                reason: Some(UnavailableReason::Held),
            });
        }

        let service_ids: Vec<Ulid> = requested.iter().map(|s| s.service_id).collect();
        let key = SlotKey::new(shop_id, date, start, service_ids.clone());
        if exclude.is_none()
            && let Some(cached) = self.cache.get(&key)
        {
            metrics::counter!(observability::AVAILABILITY_CACHE_HITS_TOTAL).increment(1);
            return Ok(cached);
        }
        metrics::counter!(observability::AVAILABILITY_CACHE_MISSES_TOTAL).increment(1);

        let (services, existing, capacity) = tokio::join!(
            self.store.services(&service_ids),
            self.store.reservations_for_shop(shop_id, Some((date, date))),
            self.store.capacity(shop_id),
        );
        let services = services?;
        if services.is_empty() && !service_ids.is_empty() {
            return Err(EngineError::NotFound("service", service_ids[0]));
        }
        let mut existing = existing?;
        if let Some(excluded) = exclude {
            existing.retain(|r| r.id != excluded);
        }
        let capacity = capacity?;

        let slot_duration = slot_duration_for(&services, self.policy.global_slot_buffer_min);
        let span = Span::new(start, start + slot_duration.max(1));
        let timings = self.timings_for(&existing).await?;
        let decision = check_availability(
            &span,
            requested,
            &existing,
            &timings,
            capacity.as_ref(),
            self.policy.slot_gap_buffer_min,
        );

        if exclude.is_none() {
            self.cache.put(key, decision.clone());
        }
        Ok(decision)
    }

    /// Create a new reservation in `requested` state. Availability is
    /// checked first; a write-time uniqueness rejection from the store is a
    /// definitive "not available", surfaced as a conflict to re-query — no
    /// retry loop.
    pub async fn create_booking(&self, req: &BookingRequest) -> Result<Reservation, EngineError> {
        self.create_booking_at(req, now_local()).await
    }

    pub async fn create_booking_at(
        &self,
        req: &BookingRequest,
        now: NaiveDateTime,
    ) -> Result<Reservation, EngineError> {
        if req.services.is_empty() {
            return Err(EngineError::Validation("at least one service is required".into()));
        }
        if req.date.and_time(req.time) <= now {
            return Err(EngineError::Validation("cannot book a slot in the past".into()));
        }

        let decision = self
            .decide_slot(
                req.shop_id,
                req.date,
                minute_of(req.time),
                &req.services,
                None,
                Some(req.user_id),
            )
            .await?;
        if !decision.available {
            let label = decision.reason.map_or("unknown", |r| r.as_str());
            return Err(EngineError::Conflict(format!("requested slot is unavailable ({label})")));
        }

        let reservation = Reservation {
            id: Ulid::new(),
            shop_id: req.shop_id,
            user_id: req.user_id,
            date: req.date,
            time: req.time,
            status: ReservationStatus::Requested,
            services: req.services.clone(),
            total_amount: req.total_amount,
            refund_penalty: 0,
            reschedule_count: 0,
            created_at: now,
            updated_at: now,
            confirmed_at: None,
            completed_at: None,
            cancelled_at: None,
            cancellation_reason: None,
            no_show_reason: None,
            version: 0,
        };
        self.store.insert_reservation(reservation.clone()).await?;
        self.cache.invalidate(req.shop_id, req.date);
        tracing::info!(
            reservation = %reservation.id,
            shop = %req.shop_id,
            date = %req.date,
            "reservation requested"
        );

        if let Ok(Some(owner)) = self.store.shop_owner(req.shop_id).await {
            self.notify.send(Notification {
                recipient_id: owner,
                title: "new reservation request".into(),
                body: format!("{} at {}", req.date, req.time.format("%H:%M")),
                metadata: serde_json::json!({
                    "reservation_id": reservation.id.to_string(),
                    "shop_id": req.shop_id.to_string(),
                }),
            });
        }

        Ok(reservation)
    }

    // ── Advisory holds ───────────────────────────────────────────

    /// Hold a slot while the user finishes a multi-step booking flow.
    /// Additive with its own TTL; never a substitute for the commit checks.
    pub fn hold_slot(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
        time: NaiveTime,
        user_id: Ulid,
    ) -> Result<Ulid, EngineError> {
        self.cache
            .place_hold(shop_id, date, minute_of(time), user_id)
            .ok_or_else(|| EngineError::Conflict("slot is held by another user".into()))
    }

    pub fn release_slot_hold(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
        time: NaiveTime,
        hold_id: Ulid,
    ) -> bool {
        self.cache.release_hold(shop_id, date, minute_of(time), hold_id)
    }

    /// Expire stale holds and cache entries; returns the number of holds
    /// reaped. Called by the background sweeper.
    pub fn purge_expired_holds(&self) -> usize {
        let reaped = self.cache.purge_expired();
        if reaped > 0 {
            metrics::counter!(observability::HOLDS_EXPIRED_TOTAL).increment(reaped as u64);
        }
        reaped
    }
}
