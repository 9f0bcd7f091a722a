use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use ulid::Ulid;

use crate::model::*;

/// Failures at the persistence seam. Mapped into `EngineError` at the
/// engine boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Compare-and-swap rejected: the row's version moved.
    VersionConflict,
    /// Uniqueness rejected a write — the slot is definitively taken.
    DuplicateSlot(String),
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::VersionConflict => write!(f, "version conflict"),
            StoreError::DuplicateSlot(msg) => write!(f, "duplicate slot: {msg}"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence collaborator. The engine is stateless between calls; all
/// durable reads and writes go through this seam. Updates use single-row
/// compare-and-swap: they succeed only when `expected_version` matches, so
/// concurrent reschedules surface as `VersionConflict` instead of lost
/// writes.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Reservations ─────────────────────────────────────────────
    async fn reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError>;

    /// Insert a new reservation. Rejects a second blocking reservation at
    /// the exact same (shop, date, time) — the database-layer uniqueness
    /// guarantee booking creation leans on instead of the reschedule lock.
    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError>;

    /// Compare-and-swap update: commits only if the stored version equals
    /// `expected_version`, then bumps the version.
    async fn update_reservation(
        &self,
        reservation: Reservation,
        expected_version: u64,
    ) -> Result<(), StoreError>;

    async fn reservations_for_shop(
        &self,
        shop_id: Ulid,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<Vec<Reservation>, StoreError>;

    /// Confirmed reservations whose scheduled time is at or before `cutoff`
    /// — the sweep's work list.
    async fn confirmed_due(&self, cutoff: NaiveDateTime) -> Result<Vec<Reservation>, StoreError>;

    // ── Shop configuration ───────────────────────────────────────
    async fn operating_hours(
        &self,
        shop_id: Ulid,
        weekday: u8,
    ) -> Result<Option<OperatingHours>, StoreError>;

    async fn services(&self, ids: &[Ulid]) -> Result<Vec<Service>, StoreError>;

    async fn capacity(&self, shop_id: Ulid) -> Result<Option<ShopCapacity>, StoreError>;

    async fn customer(&self, user_id: Ulid) -> Result<Option<CustomerProfile>, StoreError>;

    async fn shop_owner(&self, shop_id: Ulid) -> Result<Option<Ulid>, StoreError>;

    // ── Audit trail (append-only) ────────────────────────────────
    async fn append_state_log(&self, log: StateChangeLog) -> Result<(), StoreError>;

    async fn state_logs(&self, reservation_id: Ulid) -> Result<Vec<StateChangeLog>, StoreError>;

    async fn append_reschedule(&self, record: RescheduleRecord) -> Result<(), StoreError>;

    async fn reschedules(&self, reservation_id: Ulid)
        -> Result<Vec<RescheduleRecord>, StoreError>;

    // ── Conflicts (append-only entity, resolution fields mutable) ─
    async fn insert_conflict(&self, conflict: Conflict) -> Result<(), StoreError>;

    async fn conflict(&self, id: Ulid) -> Result<Option<Conflict>, StoreError>;

    async fn update_conflict(&self, conflict: Conflict) -> Result<(), StoreError>;

    async fn conflicts_for_shop(&self, shop_id: Ulid) -> Result<Vec<Conflict>, StoreError>;
}

/// Payment collaborator: status reads only. Fee collection is delegated.
#[async_trait]
pub trait PaymentPort: Send + Sync {
    async fn payment_status(&self, reservation_id: Ulid) -> Result<PaymentStatus, StoreError>;
}

// ── In-memory reference implementation ───────────────────────────

/// DashMap-backed store for tests and single-process deployments.
pub struct MemoryStore {
    reservations: DashMap<Ulid, Reservation>,
    hours: DashMap<(Ulid, u8), OperatingHours>,
    services: DashMap<Ulid, Service>,
    capacities: DashMap<Ulid, ShopCapacity>,
    customers: DashMap<Ulid, CustomerProfile>,
    shop_owners: DashMap<Ulid, Ulid>,
    state_logs: DashMap<Ulid, Vec<StateChangeLog>>,
    reschedule_logs: DashMap<Ulid, Vec<RescheduleRecord>>,
    conflicts: DashMap<Ulid, Conflict>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            reservations: DashMap::new(),
            hours: DashMap::new(),
            services: DashMap::new(),
            capacities: DashMap::new(),
            customers: DashMap::new(),
            shop_owners: DashMap::new(),
            state_logs: DashMap::new(),
            reschedule_logs: DashMap::new(),
            conflicts: DashMap::new(),
        }
    }

    // Seeding helpers — not part of the `Store` seam.

    pub fn set_hours(&self, shop_id: Ulid, hours: OperatingHours) {
        self.hours.insert((shop_id, hours.weekday), hours);
    }

    pub fn upsert_service(&self, service: Service) {
        self.services.insert(service.id, service);
    }

    pub fn set_capacity(&self, capacity: ShopCapacity) {
        self.capacities.insert(capacity.shop_id, capacity);
    }

    pub fn upsert_customer(&self, profile: CustomerProfile) {
        self.customers.insert(profile.user_id, profile);
    }

    pub fn set_shop_owner(&self, shop_id: Ulid, owner_id: Ulid) {
        self.shop_owners.insert(shop_id, owner_id);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn reservation(&self, id: Ulid) -> Result<Option<Reservation>, StoreError> {
        Ok(self.reservations.get(&id).map(|e| e.value().clone()))
    }

    async fn insert_reservation(&self, reservation: Reservation) -> Result<(), StoreError> {
        if reservation.status.is_blocking() {
            let taken = self.reservations.iter().any(|e| {
                let r = e.value();
                r.status.is_blocking()
                    && r.shop_id == reservation.shop_id
                    && r.date == reservation.date
                    && r.time == reservation.time
            });
            if taken {
                return Err(StoreError::DuplicateSlot(format!(
                    "{} {} already booked",
                    reservation.date, reservation.time
                )));
            }
        }
        self.reservations.insert(reservation.id, reservation);
        Ok(())
    }

    async fn update_reservation(
        &self,
        mut reservation: Reservation,
        expected_version: u64,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .reservations
            .get_mut(&reservation.id)
            .ok_or_else(|| StoreError::Unavailable("reservation vanished".into()))?;
        if entry.version != expected_version {
            return Err(StoreError::VersionConflict);
        }
        reservation.version = expected_version + 1;
        *entry = reservation;
        Ok(())
    }

    async fn reservations_for_shop(
        &self,
        shop_id: Ulid,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<Vec<Reservation>, StoreError> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| e.value().shop_id == shop_id)
            .filter(|e| {
                range.is_none_or(|(from, to)| {
                    let d = e.value().date;
                    from <= d && d <= to
                })
            })
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| (r.date, r.time));
        Ok(out)
    }

    async fn confirmed_due(&self, cutoff: NaiveDateTime) -> Result<Vec<Reservation>, StoreError> {
        let mut out: Vec<Reservation> = self
            .reservations
            .iter()
            .filter(|e| {
                let r = e.value();
                r.status == ReservationStatus::Confirmed && r.scheduled_at() <= cutoff
            })
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|r| (r.date, r.time));
        Ok(out)
    }

    async fn operating_hours(
        &self,
        shop_id: Ulid,
        weekday: u8,
    ) -> Result<Option<OperatingHours>, StoreError> {
        Ok(self.hours.get(&(shop_id, weekday)).map(|e| *e.value()))
    }

    async fn services(&self, ids: &[Ulid]) -> Result<Vec<Service>, StoreError> {
        Ok(ids
            .iter()
            .filter_map(|id| self.services.get(id).map(|e| e.value().clone()))
            .collect())
    }

    async fn capacity(&self, shop_id: Ulid) -> Result<Option<ShopCapacity>, StoreError> {
        Ok(self.capacities.get(&shop_id).map(|e| e.value().clone()))
    }

    async fn customer(&self, user_id: Ulid) -> Result<Option<CustomerProfile>, StoreError> {
        Ok(self.customers.get(&user_id).map(|e| e.value().clone()))
    }

    async fn shop_owner(&self, shop_id: Ulid) -> Result<Option<Ulid>, StoreError> {
        Ok(self.shop_owners.get(&shop_id).map(|e| *e.value()))
    }

    async fn append_state_log(&self, log: StateChangeLog) -> Result<(), StoreError> {
        self.state_logs.entry(log.reservation_id).or_default().push(log);
        Ok(())
    }

    async fn state_logs(&self, reservation_id: Ulid) -> Result<Vec<StateChangeLog>, StoreError> {
        Ok(self
            .state_logs
            .get(&reservation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    async fn append_reschedule(&self, record: RescheduleRecord) -> Result<(), StoreError> {
        self.reschedule_logs
            .entry(record.reservation_id)
            .or_default()
            .push(record);
        Ok(())
    }

    async fn reschedules(
        &self,
        reservation_id: Ulid,
    ) -> Result<Vec<RescheduleRecord>, StoreError> {
        Ok(self
            .reschedule_logs
            .get(&reservation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default())
    }

    async fn insert_conflict(&self, conflict: Conflict) -> Result<(), StoreError> {
        self.conflicts.insert(conflict.id, conflict);
        Ok(())
    }

    async fn conflict(&self, id: Ulid) -> Result<Option<Conflict>, StoreError> {
        Ok(self.conflicts.get(&id).map(|e| e.value().clone()))
    }

    async fn update_conflict(&self, conflict: Conflict) -> Result<(), StoreError> {
        match self.conflicts.get_mut(&conflict.id) {
            Some(mut entry) => {
                *entry = conflict;
                Ok(())
            }
            None => Err(StoreError::Unavailable("conflict vanished".into())),
        }
    }

    async fn conflicts_for_shop(&self, shop_id: Ulid) -> Result<Vec<Conflict>, StoreError> {
        let mut out: Vec<Conflict> = self
            .conflicts
            .iter()
            .filter(|e| e.value().shop_id == shop_id)
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|c| c.detected_at);
        Ok(out)
    }
}

/// DashMap-backed payment reads. Unknown reservations read as `Pending`.
pub struct MemoryPayments {
    statuses: DashMap<Ulid, PaymentStatus>,
}

impl Default for MemoryPayments {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPayments {
    pub fn new() -> Self {
        Self { statuses: DashMap::new() }
    }

    pub fn set_status(&self, reservation_id: Ulid, status: PaymentStatus) {
        self.statuses.insert(reservation_id, status);
    }
}

#[async_trait]
impl PaymentPort for MemoryPayments {
    async fn payment_status(&self, reservation_id: Ulid) -> Result<PaymentStatus, StoreError> {
        Ok(self
            .statuses
            .get(&reservation_id)
            .map(|e| *e.value())
            .unwrap_or(PaymentStatus::Pending))
    }
}
