use chrono::{NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;
use crate::observability;

use super::conflict::{detect_shop_conflicts, overall_severity};
use super::{now_local, Engine, EngineError};

// ── Priority scoring ──────────────────────────────────────────────
//
// Fixed lookups by bracket. The total decides which reservation wins a
// contested slot; ties keep detection order (stable sort).

pub fn tier_weight(tier: CustomerTier) -> u32 {
    match tier {
        CustomerTier::Admin => 100,
        CustomerTier::Vip => 80,
        CustomerTier::Member => 65,
        CustomerTier::Basic => 50,
    }
}

pub fn payment_weight(status: PaymentStatus) -> u32 {
    match status {
        PaymentStatus::FullyPaid => 50,
        PaymentStatus::DepositPaid => 30,
        PaymentStatus::Pending => 10,
    }
}

/// Booking lead time: how far ahead of the scheduled slot the reservation
/// was placed.
pub fn lead_time_weight(hours: i64) -> u32 {
    if hours >= 24 {
        100
    } else if hours >= 12 {
        80
    } else if hours >= 6 {
        60
    } else if hours >= 2 {
        40
    } else {
        20
    }
}

pub fn service_value_weight(amount: i64) -> u32 {
    if amount >= 100_000 {
        80
    } else if amount >= 50_000 {
        60
    } else if amount >= 20_000 {
        40
    } else {
        20
    }
}

pub fn loyalty_weight(points: u32) -> u32 {
    if points >= 1_000 {
        50
    } else if points >= 500 {
        35
    } else if points >= 100 {
        20
    } else {
        10
    }
}

/// Derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityScore {
    pub reservation_id: Ulid,
    pub total: u32,
}

pub fn priority_score(
    reservation: &Reservation,
    profile: Option<&CustomerProfile>,
    payment: PaymentStatus,
) -> u32 {
    let tier = profile.map_or(CustomerTier::Basic, |p| p.tier);
    let points = profile.map_or(0, |p| p.loyalty_points);
    let lead_hours = (reservation.scheduled_at() - reservation.created_at).num_hours();
    tier_weight(tier)
        + payment_weight(payment)
        + lead_time_weight(lead_hours)
        + service_value_weight(reservation.total_amount)
        + loyalty_weight(points)
}

// ── Detection ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictReport {
    pub has_conflicts: bool,
    pub conflicts: Vec<Conflict>,
    pub severity: Severity,
    pub recommendations: Vec<String>,
}

impl ConflictReport {
    fn empty() -> Self {
        Self {
            has_conflicts: false,
            conflicts: Vec::new(),
            severity: Severity::Low,
            recommendations: Vec::new(),
        }
    }
}

fn recommendation_for(kind: ConflictKind) -> &'static str {
    match kind {
        ConflictKind::TimeOverlap => "reschedule one of the overlapping reservations",
        ConflictKind::ResourceShortage => "reallocate equipment or reduce concurrent bookings",
        ConflictKind::StaffUnavailable => "assign staff or move the reservation into a covered window",
        ConflictKind::CapacityExceeded => "move the lowest-priority reservation to another slot",
        ConflictKind::DoubleBooking => "cancel or reschedule the duplicate booking",
        ConflictKind::ServiceConflict => "adjust the service line items",
        ConflictKind::PaymentConflict => "settle the payment state before the visit",
    }
}

// ── Resolution ────────────────────────────────────────────────────

/// Per-reservation outcome of a resolution attempt. Partial success is
/// normal: each entry reports its own error rather than failing the batch.
#[derive(Debug, Clone)]
pub struct ReservationResolution {
    pub reservation_id: Ulid,
    pub action: ActionKind,
    pub success: bool,
    pub error: Option<EngineError>,
}

#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    pub success: bool,
    pub affected: Vec<ReservationResolution>,
    pub compensation: Option<Compensation>,
    pub errors: Vec<EngineError>,
    pub warnings: Vec<String>,
}

impl Engine {
    /// Scan a shop for conflicts. Degrades to an empty report on internal
    /// failure — monitoring stays alive even when the core is limping — but
    /// every fallback bumps a counter and logs.
    pub async fn detect_conflicts(
        &self,
        shop_id: Ulid,
        reservation_id: Option<Ulid>,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> ConflictReport {
        self.detect_conflicts_at(shop_id, reservation_id, range, now_local()).await
    }

    pub async fn detect_conflicts_at(
        &self,
        shop_id: Ulid,
        reservation_id: Option<Ulid>,
        range: Option<(NaiveDate, NaiveDate)>,
        now: NaiveDateTime,
    ) -> ConflictReport {
        match self.detect_conflicts_inner(shop_id, reservation_id, range, now).await {
            Ok(report) => report,
            Err(e) => {
                metrics::counter!(observability::DETECTION_FALLBACKS_TOTAL).increment(1);
                tracing::warn!(shop = %shop_id, error = %e, "conflict detection degraded to empty report");
                ConflictReport::empty()
            }
        }
    }

    async fn detect_conflicts_inner(
        &self,
        shop_id: Ulid,
        reservation_id: Option<Ulid>,
        range: Option<(NaiveDate, NaiveDate)>,
        now: NaiveDateTime,
    ) -> Result<ConflictReport, EngineError> {
        let (reservations, capacity) = tokio::join!(
            self.store.reservations_for_shop(shop_id, range),
            self.store.capacity(shop_id),
        );
        let reservations = reservations?;
        let capacity = capacity?;

        let timings = self.timings_for(&reservations).await?;
        let scan =
            detect_shop_conflicts(shop_id, &reservations, &timings, capacity.as_ref(), now);

        let mut conflicts = scan.conflicts;
        if let Some(rid) = reservation_id {
            conflicts.retain(|c| c.affected_reservation_ids.contains(&rid));
        }

        for conflict in &conflicts {
            metrics::counter!(
                observability::CONFLICTS_DETECTED_TOTAL,
                "kind" => conflict.kind.as_str(),
            )
            .increment(1);
            self.store.insert_conflict(conflict.clone()).await?;
        }

        let mut recommendations: Vec<String> = Vec::new();
        for conflict in &conflicts {
            let rec = recommendation_for(conflict.kind);
            if !recommendations.iter().any(|r| r == rec) {
                recommendations.push(rec.to_string());
            }
        }

        Ok(ConflictReport {
            has_conflicts: !conflicts.is_empty(),
            severity: overall_severity(&conflicts),
            conflicts,
            recommendations,
        })
    }

    /// Rank reservations for a contested slot, highest priority first.
    /// Ties keep the given order.
    pub async fn priority_ranking(
        &self,
        reservation_ids: &[Ulid],
    ) -> Result<Vec<PriorityScore>, EngineError> {
        let mut scores = Vec::with_capacity(reservation_ids.len());
        for &rid in reservation_ids {
            let Some(reservation) = self.store.reservation(rid).await? else {
                continue;
            };
            let (profile, payment) = tokio::join!(
                self.store.customer(reservation.user_id),
                self.payments.payment_status(rid),
            );
            let total = priority_score(&reservation, profile?.as_ref(), payment?);
            scores.push(PriorityScore { reservation_id: rid, total });
        }
        scores.sort_by(|a, b| b.total.cmp(&a.total)); // stable: ties keep order
        Ok(scores)
    }

    /// Apply an operator-selected resolution method to a detected conflict.
    /// Granular by design: one reservation failing its action does not undo
    /// the others, and the conflict is still marked resolved.
    pub async fn resolve_conflict(
        &self,
        req: &ConflictResolutionRequest,
    ) -> Result<ResolutionOutcome, EngineError> {
        self.resolve_conflict_at(req, now_local()).await
    }

    pub async fn resolve_conflict_at(
        &self,
        req: &ConflictResolutionRequest,
        now: NaiveDateTime,
    ) -> Result<ResolutionOutcome, EngineError> {
        let Some(mut conflict) = self.store.conflict(req.conflict_id).await? else {
            return Ok(ResolutionOutcome {
                success: false,
                affected: Vec::new(),
                compensation: None,
                errors: vec![EngineError::NotFound("conflict", req.conflict_id)],
                warnings: Vec::new(),
            });
        };
        if conflict.resolved_at.is_some() {
            return Ok(ResolutionOutcome {
                success: false,
                affected: Vec::new(),
                compensation: None,
                errors: vec![EngineError::Policy("conflict is already resolved".into())],
                warnings: Vec::new(),
            });
        }

        let mut errors: Vec<EngineError> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        if req.method == ResolutionMethod::Compensation && req.compensation.is_none() {
            errors.push(EngineError::Validation(
                "the compensation method requires a compensation entry".into(),
            ));
        }

        // Priority override: the highest-scored affected reservation keeps
        // its slot no matter what the action list says.
        let mut actions = req.actions.clone();
        if req.method == ResolutionMethod::PriorityOverride {
            let ranking = self.priority_ranking(&conflict.affected_reservation_ids).await?;
            if let Some(winner) = ranking.first() {
                for action in &mut actions {
                    if action.reservation_id == winner.reservation_id
                        && action.action != ActionKind::Keep
                    {
                        warnings.push(format!(
                            "reservation {} wins on priority; its {:?} action was replaced with keep",
                            action.reservation_id, action.action
                        ));
                        action.action = ActionKind::Keep;
                    }
                }
            }
        }

        let mut affected = Vec::with_capacity(actions.len());
        if errors.is_empty() {
            for action in &actions {
                let result = self.apply_action(action, req.resolved_by, now).await;
                let (success, error) = match result {
                    Ok(()) => (true, None),
                    Err(e) => {
                        warnings.push(format!(
                            "action on reservation {} failed: {e}",
                            action.reservation_id
                        ));
                        (false, Some(e))
                    }
                };
                affected.push(ReservationResolution {
                    reservation_id: action.reservation_id,
                    action: action.action,
                    success,
                    error,
                });
            }
        }

        if !errors.is_empty() {
            return Ok(ResolutionOutcome {
                success: false,
                affected,
                compensation: None,
                errors,
                warnings,
            });
        }

        let compensation = req.compensation.map(|(kind, amount)| Compensation {
            kind,
            amount,
            note: None,
            applied_at: now,
        });
        conflict.resolved_at = Some(now);
        conflict.resolved_by = Some(req.resolved_by);
        conflict.resolution_method = Some(req.method);
        conflict.compensation = compensation.clone();
        self.store.update_conflict(conflict).await?;

        tracing::info!(
            conflict = %req.conflict_id,
            method = req.method.as_str(),
            actions = affected.len(),
            failed = affected.iter().filter(|a| !a.success).count(),
            "conflict resolved"
        );

        Ok(ResolutionOutcome { success: true, affected, compensation, errors, warnings })
    }

    /// Execute one per-reservation action. Lifecycle changes go through the
    /// validated machinery as `System` — resolution is not a bypass.
    async fn apply_action(
        &self,
        action: &ReservationAction,
        resolved_by: Ulid,
        now: NaiveDateTime,
    ) -> Result<(), EngineError> {
        match action.action {
            ActionKind::Keep => Ok(()),
            ActionKind::Cancel => {
                let outcome = self
                    .transition_at(
                        TransitionRequest {
                            reservation_id: action.reservation_id,
                            to: ReservationStatus::CancelledByShop,
                            changed_by: Actor::System,
                            changed_by_id: resolved_by,
                            reason: Some("conflict resolution".into()),
                            approved: false,
                        },
                        now,
                    )
                    .await?;
                match outcome.errors.into_iter().next() {
                    None => Ok(()),
                    Some(first) => Err(first),
                }
            }
            ActionKind::Reschedule => {
                let (Some(date), Some(time)) = (action.new_date, action.new_time) else {
                    return Err(EngineError::Validation(
                        "reschedule action needs a new date and time".into(),
                    ));
                };
                let outcome = self
                    .reschedule_at(
                        &RescheduleRequest {
                            reservation_id: action.reservation_id,
                            new_date: date.to_string(),
                            new_time: time.format("%H:%M").to_string(),
                            reason: Some("conflict resolution".into()),
                            requested_by: Actor::Admin,
                            requested_by_id: resolved_by,
                        },
                        now,
                    )
                    .await?;
                match outcome.errors.into_iter().next() {
                    None => Ok(()),
                    Some(first) => Err(first),
                }
            }
            ActionKind::Modify => {
                let Some(services) = action.new_services.clone() else {
                    return Err(EngineError::Validation(
                        "modify action needs a replacement service list".into(),
                    ));
                };
                let Some(reservation) = self.store.reservation(action.reservation_id).await? else {
                    return Err(EngineError::NotFound("reservation", action.reservation_id));
                };
                let decision = self
                    .decide_slot(
                        reservation.shop_id,
                        reservation.date,
                        reservation.start_minute(),
                        &services,
                        Some(reservation.id),
                        Some(reservation.user_id),
                    )
                    .await?;
                if !decision.available {
                    let label = decision.reason.map_or("unknown", |r| r.as_str());
                    return Err(EngineError::Conflict(format!(
                        "modified services do not fit the slot ({label})"
                    )));
                }
                let expected_version = reservation.version;
                let mut updated = reservation;
                updated.services = services;
                updated.updated_at = now;
                self.store.update_reservation(updated.clone(), expected_version).await?;
                self.cache.invalidate(updated.shop_id, updated.date);
                Ok(())
            }
        }
    }
}
