use std::time::{Duration, Instant};

use chrono::NaiveDate;
use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::{AVAILABILITY_CACHE_TTL_SECS, SLOT_HOLD_TTL_SECS};
use crate::model::{AvailabilityDecision, Min};

/// Cache key: one shop, one calendar date, one slot start, one service set.
/// Service ids are sorted so the same set always hits the same entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    pub shop_id: Ulid,
    pub date: NaiveDate,
    pub start: Min,
    pub services: Vec<Ulid>,
}

impl SlotKey {
    pub fn new(shop_id: Ulid, date: NaiveDate, start: Min, mut services: Vec<Ulid>) -> Self {
        services.sort();
        Self { shop_id, date, start, services }
    }
}

struct CachedDecision {
    at: Instant,
    decision: AvailabilityDecision,
}

/// An advisory hold on a slot while a user finishes a multi-step booking
/// flow. Purely additive — never a substitute for the commit-time checks.
#[derive(Debug, Clone)]
pub struct SlotHold {
    pub id: Ulid,
    pub user_id: Ulid,
    pub expires_at: Instant,
}

/// Short-lived availability results plus advisory holds. The only state the
/// engine keeps between calls; everything here expires on its own.
pub struct AvailabilityCache {
    decisions: DashMap<SlotKey, CachedDecision>,
    holds: DashMap<(Ulid, NaiveDate, Min), SlotHold>,
    decision_ttl: Duration,
    hold_ttl: Duration,
}

impl Default for AvailabilityCache {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(AVAILABILITY_CACHE_TTL_SECS),
            Duration::from_secs(SLOT_HOLD_TTL_SECS),
        )
    }
}

impl AvailabilityCache {
    pub fn new(decision_ttl: Duration, hold_ttl: Duration) -> Self {
        Self {
            decisions: DashMap::new(),
            holds: DashMap::new(),
            decision_ttl,
            hold_ttl,
        }
    }

    pub fn get(&self, key: &SlotKey) -> Option<AvailabilityDecision> {
        let entry = self.decisions.get(key)?;
        if entry.at.elapsed() > self.decision_ttl {
            drop(entry);
            self.decisions.remove(key);
            return None;
        }
        Some(entry.decision.clone())
    }

    pub fn put(&self, key: SlotKey, decision: AvailabilityDecision) {
        self.decisions
            .insert(key, CachedDecision { at: Instant::now(), decision });
    }

    /// Drop every cached decision touching this shop+date. Called whenever a
    /// reservation there is created, cancelled, or rescheduled.
    pub fn invalidate(&self, shop_id: Ulid, date: NaiveDate) {
        self.decisions
            .retain(|k, _| !(k.shop_id == shop_id && k.date == date));
    }

    // ── Advisory holds ───────────────────────────────────────────

    /// Place a hold for `user_id`. Refused (returns None) while a live hold
    /// by somebody else covers the slot; re-holding one's own slot renews it.
    pub fn place_hold(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
        start: Min,
        user_id: Ulid,
    ) -> Option<Ulid> {
        let key = (shop_id, date, start);
        if let Some(existing) = self.holds.get(&key)
            && existing.expires_at > Instant::now()
            && existing.user_id != user_id
        {
            return None;
        }
        let hold = SlotHold {
            id: Ulid::new(),
            user_id,
            expires_at: Instant::now() + self.hold_ttl,
        };
        let id = hold.id;
        self.holds.insert(key, hold);
        Some(id)
    }

    pub fn release_hold(&self, shop_id: Ulid, date: NaiveDate, start: Min, hold_id: Ulid) -> bool {
        self.holds
            .remove_if(&(shop_id, date, start), |_, h| h.id == hold_id)
            .is_some()
    }

    /// Is this slot held by someone other than `user_id` right now?
    pub fn held_by_other(
        &self,
        shop_id: Ulid,
        date: NaiveDate,
        start: Min,
        user_id: Option<Ulid>,
    ) -> bool {
        self.holds
            .get(&(shop_id, date, start))
            .is_some_and(|h| h.expires_at > Instant::now() && Some(h.user_id) != user_id)
    }

    /// Drop expired holds and stale decisions; returns how many holds went.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.holds.len();
        self.holds.retain(|_, h| h.expires_at > now);
        self.decisions.retain(|_, d| d.at.elapsed() <= self.decision_ttl);
        before - self.holds.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, 2).unwrap()
    }

    fn short_cache() -> AvailabilityCache {
        AvailabilityCache::new(Duration::from_millis(50), Duration::from_millis(50))
    }

    #[test]
    fn decision_roundtrip_and_expiry() {
        let cache = short_cache();
        let shop = Ulid::new();
        let key = SlotKey::new(shop, date(), 600, vec![]);
        assert!(cache.get(&key).is_none());

        cache.put(key.clone(), AvailabilityDecision::free());
        assert!(cache.get(&key).is_some());

        std::thread::sleep(Duration::from_millis(70));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn key_normalizes_service_order() {
        let shop = Ulid::new();
        let a = Ulid::new();
        let b = Ulid::new();
        let k1 = SlotKey::new(shop, date(), 600, vec![a, b]);
        let k2 = SlotKey::new(shop, date(), 600, vec![b, a]);
        assert_eq!(k1, k2);
    }

    #[test]
    fn invalidate_is_scoped_to_shop_and_date() {
        let cache = AvailabilityCache::default();
        let shop = Ulid::new();
        let other_shop = Ulid::new();
        let key = SlotKey::new(shop, date(), 600, vec![]);
        let other = SlotKey::new(other_shop, date(), 600, vec![]);
        cache.put(key.clone(), AvailabilityDecision::free());
        cache.put(other.clone(), AvailabilityDecision::free());

        cache.invalidate(shop, date());
        assert!(cache.get(&key).is_none());
        assert!(cache.get(&other).is_some());
    }

    #[test]
    fn hold_blocks_other_users_until_expiry() {
        let cache = short_cache();
        let shop = Ulid::new();
        let alice = Ulid::new();
        let bob = Ulid::new();

        let hold = cache.place_hold(shop, date(), 600, alice);
        assert!(hold.is_some());

        // Bob can't hold or book the same slot.
        assert!(cache.place_hold(shop, date(), 600, bob).is_none());
        assert!(cache.held_by_other(shop, date(), 600, Some(bob)));
        // Alice's own view of the slot stays clear.
        assert!(!cache.held_by_other(shop, date(), 600, Some(alice)));

        std::thread::sleep(Duration::from_millis(70));
        assert!(!cache.held_by_other(shop, date(), 600, Some(bob)));
        assert!(cache.place_hold(shop, date(), 600, bob).is_some());
    }

    #[test]
    fn release_requires_matching_hold_id() {
        let cache = AvailabilityCache::default();
        let shop = Ulid::new();
        let alice = Ulid::new();
        let id = cache.place_hold(shop, date(), 600, alice).unwrap();
        assert!(!cache.release_hold(shop, date(), 600, Ulid::new()));
        assert!(cache.release_hold(shop, date(), 600, id));
        assert!(!cache.held_by_other(shop, date(), 600, None));
    }

    #[test]
    fn purge_reaps_expired_holds() {
        let cache = short_cache();
        let shop = Ulid::new();
        cache.place_hold(shop, date(), 600, Ulid::new());
        cache.place_hold(shop, date(), 660, Ulid::new());
        assert_eq!(cache.purge_expired(), 0);

        std::thread::sleep(Duration::from_millis(70));
        assert_eq!(cache.purge_expired(), 2);
    }
}
