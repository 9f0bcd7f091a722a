use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::limits::{Policy, ADMIN_FEE_PERCENT, REFUND_ADJUST_CAP_PERCENT, SHOP_APPROVAL_WINDOW_HOURS};
use crate::model::*;
use crate::notify::Notification;
use crate::observability;

use super::{now_local, Engine, EngineError};

/// Non-fatal findings surfaced alongside a reschedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RescheduleWarning {
    /// A user moving a confirmed reservation close to its original time:
    /// the move goes through, pending an asynchronous shop approval.
    ShopApprovalRequired,
}

/// Answer to "could this reschedule go through, and at what cost?".
#[derive(Debug, Clone)]
pub struct RescheduleAssessment {
    pub can_reschedule: bool,
    pub errors: Vec<EngineError>,
    pub warnings: Vec<RescheduleWarning>,
    pub fee: i64,
}

/// Result of an attempted reschedule commit.
#[derive(Debug, Clone)]
pub struct RescheduleOutcome {
    pub success: bool,
    pub reservation: Option<Reservation>,
    pub fee: i64,
    pub errors: Vec<EngineError>,
    pub warnings: Vec<RescheduleWarning>,
}

impl RescheduleOutcome {
    fn failed(errors: Vec<EngineError>, warnings: Vec<RescheduleWarning>, fee: i64) -> Self {
        Self { success: false, reservation: None, fee, errors, warnings }
    }
}

/// Reschedule fee from notice period and requester role.
///
/// Buckets: same local calendar day beats <24h beats <48h (half of <24h)
/// beats free; a prior no-show overrides the bucket outright. The shop
/// waives its own reschedules, admins pay half, and a refund penalty
/// already incurred comes off the top — capped at 30% of the fee or the
/// penalty itself, whichever is smaller.
pub fn compute_fee(
    policy: &Policy,
    requested_by: Actor,
    had_no_show: bool,
    refund_penalty: i64,
    now: NaiveDateTime,
    new_at: NaiveDateTime,
) -> i64 {
    if requested_by == Actor::Shop {
        return 0;
    }

    let mut fee = if had_no_show {
        policy.fee_no_show
    } else if new_at.date() == now.date() {
        policy.fee_same_day
    } else {
        let notice = new_at - now;
        if notice < Duration::hours(24) {
            policy.fee_under_24h
        } else if notice < Duration::hours(48) {
            policy.fee_under_48h
        } else {
            0
        }
    };

    if requested_by == Actor::Admin {
        fee = fee * ADMIN_FEE_PERCENT / 100;
    }

    if refund_penalty > 0 && fee > 0 {
        let cap = fee * REFUND_ADJUST_CAP_PERCENT / 100;
        fee -= cap.min(refund_penalty);
    }

    fee
}

fn parse_target(date: &str, time: &str) -> Result<(NaiveDate, NaiveTime), Vec<EngineError>> {
    let mut errors = Vec::new();
    let d = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| errors.push(EngineError::Validation(format!("unparseable date: {date}"))))
        .ok();
    let t = NaiveTime::parse_from_str(time, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M:%S"))
        .map_err(|_| errors.push(EngineError::Validation(format!("unparseable time: {time}"))))
        .ok();
    match (d, t) {
        (Some(d), Some(t)) => Ok((d, t)),
        _ => Err(errors),
    }
}

impl Engine {
    /// Dry-run a reschedule at the current time.
    pub async fn validate_reschedule(
        &self,
        req: &RescheduleRequest,
    ) -> Result<RescheduleAssessment, EngineError> {
        self.validate_reschedule_at(req, now_local()).await
    }

    /// Dry-run a reschedule: the full validation sequence plus the fee the
    /// caller would be charged. Collects every failure, never just the first.
    pub async fn validate_reschedule_at(
        &self,
        req: &RescheduleRequest,
        now: NaiveDateTime,
    ) -> Result<RescheduleAssessment, EngineError> {
        let mut errors: Vec<EngineError> = Vec::new();
        let mut warnings: Vec<RescheduleWarning> = Vec::new();
        let mut fee = 0;

        let Some(reservation) = self.store.reservation(req.reservation_id).await? else {
            return Ok(RescheduleAssessment {
                can_reschedule: false,
                errors: vec![EngineError::NotFound("reservation", req.reservation_id)],
                warnings,
                fee,
            });
        };

        if !matches!(
            reservation.status,
            ReservationStatus::Requested | ReservationStatus::Confirmed
        ) {
            errors.push(EngineError::Policy(format!(
                "cannot reschedule a {} reservation",
                reservation.status.as_str()
            )));
        }

        let limit = if reservation.status == ReservationStatus::Confirmed {
            self.policy.max_reschedules_confirmed
        } else {
            self.policy.max_reschedules
        };
        if reservation.reschedule_count >= limit {
            errors.push(EngineError::Policy(format!(
                "reschedule limit of {limit} reached"
            )));
        }

        match parse_target(&req.new_date, &req.new_time) {
            Err(parse_errors) => errors.extend(parse_errors),
            Ok((new_date, new_time)) => {
                let new_at = new_date.and_time(new_time);
                if new_at <= now {
                    errors.push(EngineError::Policy("the new time is in the past".into()));
                } else {
                    if new_at > now + Duration::days(self.policy.max_advance_days) {
                        errors.push(EngineError::Policy(format!(
                            "cannot book more than {} days ahead",
                            self.policy.max_advance_days
                        )));
                    }
                    if new_at - now < Duration::hours(self.policy.reschedule_notice_hours) {
                        errors.push(EngineError::Policy(format!(
                            "requires at least {}h notice before the new time",
                            self.policy.reschedule_notice_hours
                        )));
                    }
                }

                let decision = self
                    .decide_slot(
                        reservation.shop_id,
                        new_date,
                        minute_of(new_time),
                        &reservation.services,
                        Some(reservation.id),
                        Some(reservation.user_id),
                    )
                    .await?;
                if !decision.available {
                    let label = decision.reason.map_or("unknown", |r| r.as_str());
                    errors.push(EngineError::Conflict(format!(
                        "target slot is unavailable ({label})"
                    )));
                }

                let had_no_show = self
                    .store
                    .state_logs(reservation.id)
                    .await?
                    .iter()
                    .any(|l| l.to == ReservationStatus::NoShow);
                fee = compute_fee(
                    &self.policy,
                    req.requested_by,
                    had_no_show,
                    reservation.refund_penalty,
                    now,
                    new_at,
                );
            }
        }

        match req.requested_by {
            Actor::User => {
                if req.requested_by_id != reservation.user_id {
                    errors.push(EngineError::Permission(
                        "users may only reschedule their own reservations".into(),
                    ));
                } else if reservation.status == ReservationStatus::Confirmed
                    && reservation.scheduled_at() - now
                        < Duration::hours(SHOP_APPROVAL_WINDOW_HOURS)
                {
                    warnings.push(RescheduleWarning::ShopApprovalRequired);
                }
            }
            Actor::Shop => {
                let owner = self.store.shop_owner(reservation.shop_id).await?;
                if owner != Some(req.requested_by_id) {
                    errors.push(EngineError::Permission(
                        "shops may only reschedule reservations at a shop they own".into(),
                    ));
                }
            }
            Actor::Admin | Actor::System => {}
        }

        Ok(RescheduleAssessment { can_reschedule: errors.is_empty(), errors, warnings, fee })
    }

    /// Validate, lock, re-validate, commit. The lock is scoped to the
    /// reservation+shop pair and released on every exit path.
    pub async fn reschedule(&self, req: &RescheduleRequest) -> Result<RescheduleOutcome, EngineError> {
        self.reschedule_at(req, now_local()).await
    }

    pub async fn reschedule_at(
        &self,
        req: &RescheduleRequest,
        now: NaiveDateTime,
    ) -> Result<RescheduleOutcome, EngineError> {
        let assessment = self.validate_reschedule_at(req, now).await?;
        if !assessment.can_reschedule {
            return Ok(RescheduleOutcome::failed(
                assessment.errors,
                assessment.warnings,
                assessment.fee,
            ));
        }

        let Some(current) = self.store.reservation(req.reservation_id).await? else {
            return Ok(RescheduleOutcome::failed(
                vec![EngineError::NotFound("reservation", req.reservation_id)],
                assessment.warnings,
                0,
            ));
        };

        let lock_name = format!("reschedule:{}:{}", req.reservation_id, current.shop_id);
        let Some(token) = self.locks.acquire(&lock_name, self.policy.lock_timeout_ms).await else {
            metrics::counter!(observability::LOCK_TIMEOUTS_TOTAL).increment(1);
            return Ok(RescheduleOutcome::failed(
                vec![EngineError::LockTimeout],
                assessment.warnings,
                assessment.fee,
            ));
        };

        let result = self.commit_under_lock(req, now, assessment.warnings).await;

        if !self.locks.release(token).await {
            tracing::warn!(lock = %lock_name, "reschedule lock was already gone at release");
        }
        result
    }

    /// The lock does not imply the slot is still free — another writer may
    /// have committed between initial validation and acquisition, so the
    /// whole validation sequence runs again against fresh state.
    async fn commit_under_lock(
        &self,
        req: &RescheduleRequest,
        now: NaiveDateTime,
        warnings: Vec<RescheduleWarning>,
    ) -> Result<RescheduleOutcome, EngineError> {
        let assessment = self.validate_reschedule_at(req, now).await?;
        if !assessment.can_reschedule {
            return Ok(RescheduleOutcome::failed(assessment.errors, warnings, assessment.fee));
        }

        let Some(current) = self.store.reservation(req.reservation_id).await? else {
            return Ok(RescheduleOutcome::failed(
                vec![EngineError::NotFound("reservation", req.reservation_id)],
                warnings,
                0,
            ));
        };
        let (new_date, new_time) = match parse_target(&req.new_date, &req.new_time) {
            Ok(target) => target,
            Err(errors) => return Ok(RescheduleOutcome::failed(errors, warnings, 0)),
        };

        let expected_version = current.version;
        let mut updated = current.clone();
        updated.date = new_date;
        updated.time = new_time;
        updated.reschedule_count += 1;
        updated.updated_at = now;

        match self.store.update_reservation(updated.clone(), expected_version).await {
            Ok(()) => {}
            Err(crate::store::StoreError::VersionConflict) => {
                metrics::counter!(observability::VERSION_CONFLICTS_TOTAL).increment(1);
                return Ok(RescheduleOutcome::failed(
                    vec![EngineError::VersionConflict],
                    warnings,
                    assessment.fee,
                ));
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = self
            .store
            .append_reschedule(RescheduleRecord {
                reservation_id: current.id,
                old_date: current.date,
                old_time: current.time,
                new_date,
                new_time,
                requested_by: req.requested_by,
                fee: assessment.fee,
                at: now,
            })
            .await
        {
            tracing::warn!(reservation = %current.id, error = %e, "reschedule history append failed");
        }

        self.cache.invalidate(current.shop_id, current.date);
        self.cache.invalidate(current.shop_id, new_date);
        metrics::counter!(observability::RESCHEDULES_TOTAL).increment(1);
        metrics::histogram!(observability::RESCHEDULE_FEE).record(assessment.fee as f64);
        tracing::info!(
            reservation = %current.id,
            from = %format!("{} {}", current.date, current.time.format("%H:%M")),
            to = %format!("{new_date} {}", new_time.format("%H:%M")),
            fee = assessment.fee,
            "reservation rescheduled"
        );

        let metadata = serde_json::json!({
            "reservation_id": current.id.to_string(),
            "new_date": new_date.to_string(),
            "new_time": new_time.format("%H:%M").to_string(),
            "fee": assessment.fee,
        });
        self.notify.send(Notification {
            recipient_id: current.user_id,
            title: "reservation rescheduled".into(),
            body: format!("moved to {new_date} at {}", new_time.format("%H:%M")),
            metadata: metadata.clone(),
        });
        if let Ok(Some(owner)) = self.store.shop_owner(current.shop_id).await {
            self.notify.send(Notification {
                recipient_id: owner,
                title: "reservation rescheduled".into(),
                body: format!("moved to {new_date} at {}", new_time.format("%H:%M")),
                metadata,
            });
        }

        Ok(RescheduleOutcome {
            success: true,
            reservation: Some(updated),
            fee: assessment.fee,
            errors: Vec::new(),
            warnings,
        })
    }
}
