use chrono::{Duration, NaiveDateTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notification;
use crate::observability;

use super::{now_local, Engine, EngineError};

/// One row of the transition table.
#[derive(Debug, Clone, Copy)]
pub struct TransitionRule {
    pub from: ReservationStatus,
    pub to: ReservationStatus,
    pub allowed: &'static [Actor],
    pub reason_required: bool,
    /// Privileged corrections (completed↔no_show) need an explicit approval.
    pub approval_required: bool,
    pub requires_payment: bool,
    /// Hours of notice before the scheduled time.
    pub min_notice_hours: Option<i64>,
    /// Hours since booking creation the transition must happen within.
    pub max_hours_since_booking: Option<i64>,
}

use Actor::{Admin, Shop, System, User};
use ReservationStatus::*;

/// The canonical lifecycle. Anything not listed here does not happen.
pub const TRANSITIONS: &[TransitionRule] = &[
    TransitionRule {
        from: Requested,
        to: Confirmed,
        allowed: &[Shop],
        reason_required: false,
        approval_required: false,
        requires_payment: true,
        min_notice_hours: None,
        max_hours_since_booking: Some(CONFIRM_DEADLINE_HOURS),
    },
    TransitionRule {
        from: Requested,
        to: CancelledByUser,
        allowed: &[User],
        reason_required: false,
        approval_required: false,
        requires_payment: false,
        min_notice_hours: Some(USER_CANCEL_NOTICE_HOURS),
        max_hours_since_booking: None,
    },
    TransitionRule {
        from: Requested,
        to: CancelledByShop,
        allowed: &[Shop],
        reason_required: true,
        approval_required: false,
        requires_payment: false,
        min_notice_hours: Some(SHOP_CANCEL_NOTICE_HOURS),
        max_hours_since_booking: None,
    },
    TransitionRule {
        from: Confirmed,
        to: Completed,
        allowed: &[Shop, System],
        reason_required: false,
        approval_required: false,
        requires_payment: false,
        min_notice_hours: None,
        max_hours_since_booking: None,
    },
    TransitionRule {
        from: Confirmed,
        to: NoShow,
        allowed: &[System],
        reason_required: false,
        approval_required: false,
        requires_payment: false,
        min_notice_hours: None,
        max_hours_since_booking: None,
    },
    TransitionRule {
        from: Confirmed,
        to: CancelledByUser,
        allowed: &[User],
        reason_required: false,
        approval_required: false,
        requires_payment: false,
        min_notice_hours: Some(USER_CANCEL_NOTICE_HOURS),
        max_hours_since_booking: None,
    },
    TransitionRule {
        from: Confirmed,
        to: CancelledByShop,
        allowed: &[Shop],
        reason_required: true,
        approval_required: false,
        requires_payment: false,
        min_notice_hours: Some(SHOP_CANCEL_NOTICE_HOURS),
        max_hours_since_booking: None,
    },
    // Privileged misclassification corrections.
    TransitionRule {
        from: Completed,
        to: NoShow,
        allowed: &[Admin],
        reason_required: true,
        approval_required: true,
        requires_payment: false,
        min_notice_hours: None,
        max_hours_since_booking: None,
    },
    TransitionRule {
        from: NoShow,
        to: Completed,
        allowed: &[Admin],
        reason_required: true,
        approval_required: true,
        requires_payment: false,
        min_notice_hours: None,
        max_hours_since_booking: None,
    },
    // Operator rollback out of terminal states.
    TransitionRule {
        from: Completed,
        to: Requested,
        allowed: &[Admin],
        reason_required: true,
        approval_required: false,
        requires_payment: false,
        min_notice_hours: None,
        max_hours_since_booking: None,
    },
    TransitionRule {
        from: Completed,
        to: Confirmed,
        allowed: &[Admin],
        reason_required: true,
        approval_required: false,
        requires_payment: false,
        min_notice_hours: None,
        max_hours_since_booking: None,
    },
    TransitionRule {
        from: NoShow,
        to: Requested,
        allowed: &[Admin],
        reason_required: true,
        approval_required: false,
        requires_payment: false,
        min_notice_hours: None,
        max_hours_since_booking: None,
    },
    TransitionRule {
        from: NoShow,
        to: Confirmed,
        allowed: &[Admin],
        reason_required: true,
        approval_required: false,
        requires_payment: false,
        min_notice_hours: None,
        max_hours_since_booking: None,
    },
];

pub fn rule_for(from: ReservationStatus, to: ReservationStatus) -> Option<&'static TransitionRule> {
    TRANSITIONS.iter().find(|r| r.from == from && r.to == to)
}

/// Everything the validation pipeline needs besides the request itself.
pub struct TransitionContext<'a> {
    pub reservation: &'a Reservation,
    /// Fetched only when the rule demands a payment prerequisite.
    pub payment: Option<PaymentStatus>,
    /// Owner of the reservation's shop, when known.
    pub shop_owner: Option<Ulid>,
    pub now: NaiveDateTime,
}

/// Run the full validation pipeline. All failures are collected so a client
/// can fix everything in one round trip; the transition may execute only if
/// the returned list is empty.
pub fn validate_transition(req: &TransitionRequest, ctx: &TransitionContext) -> Vec<EngineError> {
    let from = ctx.reservation.status;
    let Some(rule) = rule_for(from, req.to) else {
        return vec![EngineError::Validation(format!(
            "no transition from {} to {}",
            from.as_str(),
            req.to.as_str()
        ))];
    };

    let mut errors = Vec::new();

    if !rule.allowed.contains(&req.changed_by) && req.changed_by != System {
        errors.push(EngineError::Permission(format!(
            "{} may not move a reservation from {} to {}",
            req.changed_by.as_str(),
            from.as_str(),
            req.to.as_str()
        )));
    }

    if rule.reason_required && req.reason.as_deref().is_none_or(|r| r.trim().is_empty()) {
        errors.push(EngineError::Validation("a reason is required for this change".into()));
    }

    if rule.approval_required && !req.approved {
        errors.push(EngineError::Permission("this correction requires explicit approval".into()));
    }

    if rule.requires_payment && ctx.payment != Some(PaymentStatus::FullyPaid) {
        errors.push(EngineError::Policy("payment must be completed before confirmation".into()));
    }

    // Ownership: users touch only their own reservations, shops only their
    // own shop's. Admin and system skip this.
    match req.changed_by {
        User => {
            if req.changed_by_id != ctx.reservation.user_id {
                errors.push(EngineError::Permission(
                    "users may only change their own reservations".into(),
                ));
            }
        }
        Shop => {
            if ctx.shop_owner != Some(req.changed_by_id) {
                errors.push(EngineError::Permission(
                    "shops may only change reservations at a shop they own".into(),
                ));
            }
        }
        Admin | System => {}
    }

    if let Some(min_notice) = rule.min_notice_hours {
        let notice = ctx.reservation.scheduled_at() - ctx.now;
        if notice < Duration::hours(min_notice) {
            errors.push(EngineError::Policy(format!(
                "requires at least {min_notice}h notice before the scheduled time"
            )));
        }
    }

    if let Some(max_since) = rule.max_hours_since_booking {
        let elapsed = ctx.now - ctx.reservation.created_at;
        if elapsed > Duration::hours(max_since) {
            errors.push(EngineError::Policy(format!(
                "must happen within {max_since}h of booking"
            )));
        }
    }

    errors
}

/// Write the new status and its state-specific timestamp onto the row.
fn apply_transition(
    reservation: &mut Reservation,
    req: &TransitionRequest,
    now: NaiveDateTime,
) {
    reservation.status = req.to;
    reservation.updated_at = now;
    match req.to {
        Confirmed => reservation.confirmed_at = Some(now),
        Completed => reservation.completed_at = Some(now),
        CancelledByUser | CancelledByShop => {
            reservation.cancelled_at = Some(now);
            reservation.cancellation_reason = req.reason.clone();
        }
        NoShow => {
            if reservation.no_show_reason.is_none() {
                reservation.no_show_reason = req.reason.clone();
            }
        }
        Requested => {}
    }
}

/// Result of a transition attempt. `errors` carries the complete validation
/// failure list; the transition executed only if it is empty.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub executed: bool,
    pub reservation: Option<Reservation>,
    pub errors: Vec<EngineError>,
}

impl Engine {
    /// Validate and execute one lifecycle transition at the current time.
    pub async fn transition(&self, req: TransitionRequest) -> Result<TransitionOutcome, EngineError> {
        self.transition_at(req, now_local()).await
    }

    /// Validate and execute one lifecycle transition at an explicit `now`.
    pub async fn transition_at(
        &self,
        req: TransitionRequest,
        now: NaiveDateTime,
    ) -> Result<TransitionOutcome, EngineError> {
        let Some(reservation) = self.store.reservation(req.reservation_id).await? else {
            return Ok(TransitionOutcome {
                executed: false,
                reservation: None,
                errors: vec![EngineError::NotFound("reservation", req.reservation_id)],
            });
        };

        let payment = match rule_for(reservation.status, req.to) {
            Some(rule) if rule.requires_payment => {
                Some(self.payments.payment_status(reservation.id).await?)
            }
            _ => None,
        };
        let shop_owner = if req.changed_by == Shop {
            self.store.shop_owner(reservation.shop_id).await?
        } else {
            None
        };

        let ctx = TransitionContext { reservation: &reservation, payment, shop_owner, now };
        let errors = validate_transition(&req, &ctx);
        if !errors.is_empty() {
            metrics::counter!(observability::TRANSITION_REJECTIONS_TOTAL).increment(1);
            return Ok(TransitionOutcome { executed: false, reservation: Some(reservation), errors });
        }

        let from = reservation.status;
        let expected_version = reservation.version;
        let mut updated = reservation.clone();
        apply_transition(&mut updated, &req, now);
        self.store.update_reservation(updated.clone(), expected_version).await?;

        // The audit row and notifications ride behind the committed write:
        // a failure here is logged and surfaced to metrics, never unwound.
        if let Err(e) = self
            .store
            .append_state_log(StateChangeLog {
                reservation_id: updated.id,
                from,
                to: req.to,
                changed_by: req.changed_by,
                changed_by_id: req.changed_by_id,
                reason: req.reason.clone(),
                at: now,
            })
            .await
        {
            tracing::warn!(reservation = %updated.id, error = %e, "audit log append failed");
        }

        self.cache.invalidate(updated.shop_id, updated.date);
        metrics::counter!(
            observability::TRANSITIONS_TOTAL,
            "from" => from.as_str(),
            "to" => req.to.as_str(),
            "actor" => req.changed_by.as_str(),
        )
        .increment(1);
        tracing::info!(
            reservation = %updated.id,
            from = from.as_str(),
            to = req.to.as_str(),
            actor = req.changed_by.as_str(),
            "reservation transitioned"
        );

        self.emit_transition_notices(&updated, from, req.to).await;

        Ok(TransitionOutcome { executed: true, reservation: Some(updated), errors: Vec::new() })
    }

    async fn emit_transition_notices(
        &self,
        reservation: &Reservation,
        from: ReservationStatus,
        to: ReservationStatus,
    ) {
        let metadata = serde_json::json!({
            "reservation_id": reservation.id.to_string(),
            "from": from.as_str(),
            "to": to.as_str(),
            "date": reservation.date.to_string(),
            "time": reservation.time.format("%H:%M").to_string(),
        });
        let body = format!(
            "reservation on {} at {} is now {}",
            reservation.date,
            reservation.time.format("%H:%M"),
            to.as_str()
        );
        self.notify.send(Notification {
            recipient_id: reservation.user_id,
            title: "reservation update".into(),
            body: body.clone(),
            metadata: metadata.clone(),
        });
        match self.store.shop_owner(reservation.shop_id).await {
            Ok(Some(owner)) => self.notify.send(Notification {
                recipient_id: owner,
                title: "reservation update".into(),
                body,
                metadata,
            }),
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "owner lookup for notification failed"),
        }
    }

    /// Shop records an absence ahead of the sweep — the signal that makes
    /// the automatic outcome `no_show` instead of `completed`.
    pub async fn mark_no_show_reason(
        &self,
        reservation_id: Ulid,
        reason: String,
        by: Actor,
        by_id: Ulid,
    ) -> Result<(), EngineError> {
        let Some(reservation) = self.store.reservation(reservation_id).await? else {
            return Err(EngineError::NotFound("reservation", reservation_id));
        };
        match by {
            Shop => {
                let owner = self.store.shop_owner(reservation.shop_id).await?;
                if owner != Some(by_id) {
                    return Err(EngineError::Permission(
                        "shops may only flag reservations at a shop they own".into(),
                    ));
                }
            }
            Admin => {}
            _ => {
                return Err(EngineError::Permission(
                    "only the shop or an operator may flag a no-show".into(),
                ));
            }
        }
        let expected_version = reservation.version;
        let mut updated = reservation;
        updated.no_show_reason = Some(reason);
        updated.updated_at = now_local();
        self.store.update_reservation(updated, expected_version).await?;
        Ok(())
    }

    /// Automatic progression: every `confirmed` reservation 30+ minutes past
    /// its scheduled time is finished through the validated transition path.
    /// Defaults to `completed`; an explicit absence signal flips it to
    /// `no_show`. Idempotent: once transitioned, a row no longer selects.
    pub async fn sweep_due_at(&self, now: NaiveDateTime) -> Result<usize, EngineError> {
        let cutoff = now - Duration::minutes(AUTO_FINISH_AFTER_MIN);
        let due = self.store.confirmed_due(cutoff).await?;
        let mut transitioned = 0;
        for reservation in due {
            let to = if reservation.no_show_reason.is_some() { NoShow } else { Completed };
            let req = TransitionRequest {
                reservation_id: reservation.id,
                to,
                changed_by: System,
                changed_by_id: Ulid::nil(),
                reason: reservation.no_show_reason.clone(),
                approved: false,
            };
            match self.transition_at(req, now).await {
                Ok(outcome) if outcome.executed => {
                    metrics::counter!(
                        observability::SWEEP_TRANSITIONS_TOTAL,
                        "to" => to.as_str(),
                    )
                    .increment(1);
                    transitioned += 1;
                }
                Ok(outcome) => {
                    // Lost a race with a concurrent writer — already handled.
                    tracing::debug!(
                        reservation = %reservation.id,
                        errors = outcome.errors.len(),
                        "sweep skipped reservation"
                    );
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(reservation = %reservation.id, error = %e, "sweep will retry next tick");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(transitioned)
    }
}
