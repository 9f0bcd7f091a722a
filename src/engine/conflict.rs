use std::collections::HashMap;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::model::*;

/// Availability check for one candidate slot against a shop's current
/// reservation set and capacity config.
///
/// The slot (not the existing reservations) is widened by `gap_buffer` on
/// both sides before the half-open overlap test, so contiguous generated
/// slots still leave a real-world gap between bookings. Rules run in a
/// fixed order and the first failure fixes the reason code; conflicting
/// reservation ids keep accumulating regardless.
pub fn check_availability(
    slot: &Span,
    requested: &[ReservationService],
    existing: &[Reservation],
    timings: &HashMap<Ulid, ServiceTiming>,
    capacity: Option<&ShopCapacity>,
    gap_buffer: Min,
) -> AvailabilityDecision {
    let padded = slot.padded(gap_buffer);

    let overlapping: Vec<&Reservation> = existing
        .iter()
        .filter(|r| r.status.is_blocking())
        .filter(|r| r.occupied_span(timings).overlaps(&padded))
        .collect();
    let conflicting: Vec<Ulid> = overlapping.iter().map(|r| r.id).collect();

    let mut reason: Option<UnavailableReason> = None;
    if !overlapping.is_empty() {
        reason = Some(UnavailableReason::TimeConflict);
    }

    if let Some(cap) = capacity {
        let requested_units: u32 = requested.iter().map(|s| s.quantity).sum();
        let existing_units: u32 = overlapping
            .iter()
            .flat_map(|r| r.services.iter())
            .map(|s| s.quantity)
            .sum();

        // (a) concurrent-services ceiling for the whole shop
        if reason.is_none() && existing_units + requested_units > cap.max_concurrent_services {
            reason = Some(UnavailableReason::ConcurrentServiceLimit);
        }

        // (b) per-service ceiling
        if reason.is_none() {
            for line in requested {
                let Some(&limit) = cap.per_service.get(&line.service_id) else {
                    continue;
                };
                let in_use: u32 = overlapping
                    .iter()
                    .flat_map(|r| r.services.iter())
                    .filter(|s| s.service_id == line.service_id)
                    .map(|s| s.quantity)
                    .sum();
                if in_use + line.quantity > limit {
                    reason = Some(UnavailableReason::ServiceCapacity);
                    break;
                }
            }
        }

        // (c) staff: someone's working window must contain the slot start.
        // An empty collection means staffing isn't tracked for this shop.
        if reason.is_none()
            && !cap.staff.is_empty()
            && !cap.staff.iter().any(|s| s.working.contains_instant(slot.start))
        {
            reason = Some(UnavailableReason::StaffUnavailable);
        }

        // (d) equipment: every item a requested service needs must have
        // remaining quantity.
        if reason.is_none() {
            let exhausted = cap.equipment.iter().any(|eq| {
                eq.remaining == 0
                    && requested.iter().any(|line| eq.required_by.contains(&line.service_id))
            });
            if exhausted {
                reason = Some(UnavailableReason::EquipmentUnavailable);
            }
        }
    }

    AvailabilityDecision { available: reason.is_none(), conflicting, reason }
}

/// Result of a whole-shop conflict scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShopConflictScan {
    pub conflicts: Vec<Conflict>,
    pub severity: Severity,
}

/// Scan a shop's reservation set for pairwise time overlap and duplicate
/// (date, time) over-capacity, independent of any single request.
///
/// Active reservations are sorted by start; comparing temporally adjacent
/// entries per date is sufficient since an overlap implies adjacency in
/// that order.
pub fn detect_shop_conflicts(
    shop_id: Ulid,
    reservations: &[Reservation],
    timings: &HashMap<Ulid, ServiceTiming>,
    capacity: Option<&ShopCapacity>,
    detected_at: NaiveDateTime,
) -> ShopConflictScan {
    let mut active: Vec<&Reservation> = reservations
        .iter()
        .filter(|r| r.status.is_blocking())
        .collect();
    active.sort_by_key(|r| (r.date, r.time));

    let mut conflicts: Vec<Conflict> = Vec::new();

    for pair in active.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if a.date != b.date {
            continue;
        }
        if a.occupied_span(timings).overlaps(&b.occupied_span(timings)) {
            conflicts.push(Conflict {
                id: Ulid::new(),
                kind: ConflictKind::TimeOverlap,
                severity: Severity::High,
                shop_id,
                affected_reservation_ids: vec![a.id, b.id],
                detected_at,
                resolved_at: None,
                resolved_by: None,
                resolution_method: None,
                compensation: None,
            });
        }
    }

    // Duplicate (date, time) groups: same-instant bookings.
    let mut by_slot: HashMap<(NaiveDate, NaiveTime), Vec<Ulid>> = HashMap::new();
    for r in &active {
        by_slot.entry((r.date, r.time)).or_default().push(r.id);
    }
    let mut groups: Vec<((NaiveDate, NaiveTime), Vec<Ulid>)> =
        by_slot.into_iter().filter(|(_, ids)| ids.len() > 1).collect();
    groups.sort_by_key(|(slot, _)| *slot);

    for (_, ids) in groups {
        let over_customer_cap =
            capacity.is_some_and(|c| ids.len() as u32 > c.max_concurrent_customers);
        let (kind, severity) = if over_customer_cap {
            (ConflictKind::CapacityExceeded, Severity::Critical)
        } else {
            (ConflictKind::DoubleBooking, Severity::Medium)
        };
        conflicts.push(Conflict {
            id: Ulid::new(),
            kind,
            severity,
            shop_id,
            affected_reservation_ids: ids,
            detected_at,
            resolved_at: None,
            resolved_by: None,
            resolution_method: None,
            compensation: None,
        });
    }

    let severity = overall_severity(&conflicts);
    ShopConflictScan { conflicts, severity }
}

/// Mean of per-conflict 1–4 ranks, mapped back onto a bucket.
pub fn overall_severity(conflicts: &[Conflict]) -> Severity {
    if conflicts.is_empty() {
        return Severity::Low;
    }
    let sum: u32 = conflicts.iter().map(|c| c.severity.rank() as u32).sum();
    Severity::from_mean(sum as f64 / conflicts.len() as f64)
}
