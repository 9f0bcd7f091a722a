use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::LOCK_RETRY_MS;

/// Proof of lock ownership. Only the holder of the token can release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub name: String,
    pub id: Ulid,
}

/// Named mutual-exclusion collaborator with bounded acquisition.
///
/// A horizontally scaled deployment must back this with a shared service
/// (every process instance has to see the same lock table); `MemoryLocks`
/// is correct only within one process.
#[async_trait]
pub trait LockService: Send + Sync {
    /// Try to take the named lock, waiting at most `timeout_ms`.
    /// `None` means somebody else still holds it.
    async fn acquire(&self, name: &str, timeout_ms: u64) -> Option<LockToken>;

    /// Release a held lock. Returns false if the token no longer matches
    /// (already released, or taken over after going stale).
    async fn release(&self, token: LockToken) -> bool;
}

struct Held {
    token_id: Ulid,
    acquired_at: Instant,
    timeout_ms: u64,
}

impl Held {
    /// A holder past its own timeout is presumed dead and may be displaced.
    fn is_stale(&self) -> bool {
        self.acquired_at.elapsed() > Duration::from_millis(self.timeout_ms)
    }
}

/// In-process lock table. Entries left behind by a crashed holder go stale
/// after their own timeout and can be taken over.
pub struct MemoryLocks {
    held: DashMap<String, Held>,
}

impl Default for MemoryLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self { held: DashMap::new() }
    }

    fn try_take(&self, name: &str, timeout_ms: u64) -> Option<LockToken> {
        let id = Ulid::new();
        let mut taken = false;
        let mut entry = self.held.entry(name.to_string()).or_insert_with(|| {
            taken = true;
            Held { token_id: id, acquired_at: Instant::now(), timeout_ms }
        });
        if taken {
            return Some(LockToken { name: name.to_string(), id });
        }
        // Occupied — displace only a stale holder.
        if entry.is_stale() {
            *entry = Held { token_id: id, acquired_at: Instant::now(), timeout_ms };
            return Some(LockToken { name: name.to_string(), id });
        }
        None
    }
}

#[async_trait]
impl LockService for MemoryLocks {
    async fn acquire(&self, name: &str, timeout_ms: u64) -> Option<LockToken> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if let Some(token) = self.try_take(name, timeout_ms) {
                return Some(token);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(LOCK_RETRY_MS)).await;
        }
    }

    async fn release(&self, token: LockToken) -> bool {
        // Remove only if we still own it.
        self.held
            .remove_if(&token.name, |_, held| held.token_id == token.id)
            .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_release() {
        let locks = MemoryLocks::new();
        let token = locks.acquire("resv:a", 100).await.unwrap();
        assert!(locks.release(token).await);
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let locks = MemoryLocks::new();
        let _held = locks.acquire("resv:a", 5_000).await.unwrap();
        let start = Instant::now();
        let second = locks.acquire("resv:a", 120).await;
        assert!(second.is_none());
        assert!(start.elapsed() >= Duration::from_millis(120));
    }

    #[tokio::test]
    async fn different_names_do_not_contend() {
        let locks = MemoryLocks::new();
        let a = locks.acquire("resv:a", 100).await.unwrap();
        let b = locks.acquire("resv:b", 100).await.unwrap();
        assert!(locks.release(a).await);
        assert!(locks.release(b).await);
    }

    #[tokio::test]
    async fn release_is_idempotent_per_token() {
        let locks = MemoryLocks::new();
        let token = locks.acquire("resv:a", 100).await.unwrap();
        assert!(locks.release(token.clone()).await);
        assert!(!locks.release(token).await);
    }

    #[tokio::test]
    async fn stale_holder_is_displaced() {
        let locks = MemoryLocks::new();
        // Holder with a 10ms timeout that never releases.
        let dead = locks.acquire("resv:a", 10).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let taken = locks.acquire("resv:a", 200).await;
        assert!(taken.is_some());
        // The dead holder's token no longer releases anything.
        assert!(!locks.release(dead).await);
    }

    #[tokio::test]
    async fn waiter_gets_lock_after_release() {
        let locks = std::sync::Arc::new(MemoryLocks::new());
        let token = locks.acquire("resv:a", 5_000).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("resv:a", 2_000).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(locks.release(token).await);

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_some());
    }
}
