//! # Cache Manager (§4.3)
//!
//! Deduplicates stage executions by fingerprint and coordinates concurrent
//! requesters of the same fingerprint via leases. `InMemoryCacheManager` is
//! the default backend: a `tokio::sync::Mutex`-guarded map holding both
//! Cache Entries and Leases as the single source of truth, with a
//! per-fingerprint `tokio::sync::Notify` waking parked waiters — the
//! "subscribe to the in-flight task's completion" of spec §4.2 step 3.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bespoke_shared::domain::CacheEntry;
use bespoke_shared::error::ExecutorResult;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// Result of a [`CacheManager::lookup`].
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Hit(CacheEntry),
    Miss,
}

/// Result of a [`CacheManager::acquire`].
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// No entry and no lease existed; caller now owns the lease.
    Granted,
    /// Another owner already holds the lease for this fingerprint.
    HeldBy(Uuid),
    /// A Cache Entry already exists; no lease was taken.
    Hit(CacheEntry),
}

#[async_trait]
pub trait CacheManager: Send + Sync {
    async fn lookup(&self, fingerprint: &str) -> ExecutorResult<CacheLookup>;

    async fn acquire(&self, fingerprint: &str, owner: Uuid, ttl: Duration) -> ExecutorResult<AcquireOutcome>;

    /// Insert the Cache Entry and release the lease. Rejected (returns
    /// `Ok(false)`) if `owner` no longer holds the lease — a stale publish
    /// (§4.3 "a stale publish is rejected and the value is discarded").
    async fn publish(
        &self,
        fingerprint: &str,
        value: serde_json::Value,
        owner: Uuid,
        produced_by: String,
    ) -> ExecutorResult<bool>;

    /// Release the lease without publishing, waking waiters so one may
    /// re-acquire (§4.3).
    async fn release(&self, fingerprint: &str, owner: Uuid) -> ExecutorResult<()>;

    /// Heartbeat an owned lease, extending its deadline (§4.4 step 2).
    async fn heartbeat(&self, fingerprint: &str, owner: Uuid, ttl: Duration) -> ExecutorResult<bool>;

    /// Park until the fingerprint resolves to a Cache Entry or the lease is
    /// released without one, returning the current lookup either way.
    async fn wait_for_resolution(&self, fingerprint: &str) -> ExecutorResult<CacheLookup>;
}

struct LeaseState {
    owner: Uuid,
    deadline: DateTime<Utc>,
    notify: Arc<Notify>,
}

enum Slot {
    Entry(CacheEntry),
    Leased(LeaseState),
}

#[derive(Default)]
pub struct InMemoryCacheManager {
    slots: Mutex<HashMap<String, Slot>>,
}

impl InMemoryCacheManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Administratively release any lease whose deadline has passed,
    /// waking waiters (§4.3 "Lease expiry"). Intended to be driven by a
    /// periodic reaper task alongside the lazy checks in `lookup`/`acquire`.
    pub async fn reap_expired_leases(&self) -> usize {
        let now = Utc::now();
        let mut slots = self.slots.lock().await;
        let expired: Vec<String> = slots
            .iter()
            .filter_map(|(fp, slot)| match slot {
                Slot::Leased(lease) if lease.deadline <= now => Some(fp.clone()),
                _ => None,
            })
            .collect();
        let count = expired.len();
        for fp in expired {
            if let Some(Slot::Leased(lease)) = slots.remove(&fp) {
                lease.notify.notify_waiters();
            }
        }
        count
    }

    fn notify_for(slots: &mut HashMap<String, Slot>, fingerprint: &str) -> Arc<Notify> {
        match slots.get(fingerprint) {
            Some(Slot::Leased(lease)) => lease.notify.clone(),
            _ => Arc::new(Notify::new()),
        }
    }

    fn expire_if_due(slots: &mut HashMap<String, Slot>, fingerprint: &str) {
        let expired = matches!(
            slots.get(fingerprint),
            Some(Slot::Leased(lease)) if lease.deadline <= Utc::now()
        );
        if expired {
            if let Some(Slot::Leased(lease)) = slots.remove(fingerprint) {
                lease.notify.notify_waiters();
            }
        }
    }
}

#[async_trait]
impl CacheManager for InMemoryCacheManager {
    async fn lookup(&self, fingerprint: &str) -> ExecutorResult<CacheLookup> {
        let mut slots = self.slots.lock().await;
        Self::expire_if_due(&mut slots, fingerprint);
        Ok(match slots.get(fingerprint) {
            Some(Slot::Entry(entry)) => CacheLookup::Hit(entry.clone()),
            _ => CacheLookup::Miss,
        })
    }

    async fn acquire(&self, fingerprint: &str, owner: Uuid, ttl: Duration) -> ExecutorResult<AcquireOutcome> {
        let mut slots = self.slots.lock().await;
        Self::expire_if_due(&mut slots, fingerprint);
        match slots.get(fingerprint) {
            Some(Slot::Entry(entry)) => Ok(AcquireOutcome::Hit(entry.clone())),
            Some(Slot::Leased(lease)) => Ok(AcquireOutcome::HeldBy(lease.owner)),
            None => {
                let deadline = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
                slots.insert(
                    fingerprint.to_string(),
                    Slot::Leased(LeaseState {
                        owner,
                        deadline,
                        notify: Arc::new(Notify::new()),
                    }),
                );
                Ok(AcquireOutcome::Granted)
            }
        }
    }

    async fn publish(
        &self,
        fingerprint: &str,
        value: serde_json::Value,
        owner: Uuid,
        produced_by: String,
    ) -> ExecutorResult<bool> {
        let size_bytes = serde_json::to_vec(&value).map(|v| v.len() as u64).unwrap_or(0);
        let mut slots = self.slots.lock().await;
        let notify = match slots.get(fingerprint) {
            Some(Slot::Leased(lease)) if lease.owner == owner => lease.notify.clone(),
            _ => {
                tracing::warn!(%fingerprint, %owner, "stale publish rejected: caller no longer holds the lease");
                return Ok(false);
            }
        };
        slots.insert(
            fingerprint.to_string(),
            Slot::Entry(CacheEntry {
                fingerprint: fingerprint.to_string(),
                value,
                produced_by,
                finished_at: Utc::now(),
                size_bytes,
            }),
        );
        notify.notify_waiters();
        Ok(true)
    }

    async fn release(&self, fingerprint: &str, owner: Uuid) -> ExecutorResult<()> {
        let mut slots = self.slots.lock().await;
        if let Some(Slot::Leased(lease)) = slots.get(fingerprint) {
            if lease.owner == owner {
                if let Some(Slot::Leased(lease)) = slots.remove(fingerprint) {
                    lease.notify.notify_waiters();
                }
            }
        }
        Ok(())
    }

    async fn heartbeat(&self, fingerprint: &str, owner: Uuid, ttl: Duration) -> ExecutorResult<bool> {
        let mut slots = self.slots.lock().await;
        match slots.get_mut(fingerprint) {
            Some(Slot::Leased(lease)) if lease.owner == owner => {
                lease.deadline = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn wait_for_resolution(&self, fingerprint: &str) -> ExecutorResult<CacheLookup> {
        loop {
            let mut slots = self.slots.lock().await;
            Self::expire_if_due(&mut slots, fingerprint);
            let notify = match slots.get(fingerprint) {
                Some(Slot::Entry(entry)) => return Ok(CacheLookup::Hit(entry.clone())),
                Some(Slot::Leased(_)) => Self::notify_for(&mut slots, fingerprint),
                None => return Ok(CacheLookup::Miss),
            };
            // Register interest while still holding `slots` so a `publish`/
            // `release` that runs the instant the lock is dropped can't slip
            // its `notify_waiters()` between registration and the await — a
            // notification with no registered waiter is lost, not queued.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(slots);
            notified.await;
        }
    }
}

/// Spawn a background task that periodically reaps expired leases (§4.3
/// "broken by Cache Manager when deadline passes without progress").
pub fn spawn_lease_reaper(cache: Arc<InMemoryCacheManager>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reaped = cache.reap_expired_leases().await;
            if reaped > 0 {
                tracing::debug!(count = reaped, "reaped expired cache leases");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn first_acquire_is_granted_then_second_is_held_by() {
        let cache = InMemoryCacheManager::new();
        let owner_a = Uuid::now_v7();
        let owner_b = Uuid::now_v7();

        let outcome = cache.acquire("fp1", owner_a, Duration::from_secs(60)).await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Granted));

        let outcome = cache.acquire("fp1", owner_b, Duration::from_secs(60)).await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::HeldBy(o) if o == owner_a));
    }

    #[tokio::test]
    async fn publish_then_acquire_returns_hit() {
        let cache = InMemoryCacheManager::new();
        let owner = Uuid::now_v7();
        cache.acquire("fp1", owner, Duration::from_secs(60)).await.unwrap();
        let published = cache
            .publish("fp1", json!({"result": true}), owner, "worker-1".into())
            .await
            .unwrap();
        assert!(published);

        let outcome = cache.acquire("fp1", Uuid::now_v7(), Duration::from_secs(60)).await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Hit(_)));
    }

    #[tokio::test]
    async fn stale_publish_is_rejected() {
        let cache = InMemoryCacheManager::new();
        let owner_a = Uuid::now_v7();
        let owner_b = Uuid::now_v7();
        cache.acquire("fp1", owner_a, Duration::from_secs(60)).await.unwrap();
        cache.release("fp1", owner_a).await.unwrap();
        cache.acquire("fp1", owner_b, Duration::from_secs(60)).await.unwrap();

        // owner_a no longer holds the lease; its publish must be rejected.
        let published = cache.publish("fp1", json!({}), owner_a, "stale".into()).await.unwrap();
        assert!(!published);
        assert!(matches!(cache.lookup("fp1").await.unwrap(), CacheLookup::Miss));
    }

    #[tokio::test]
    async fn release_without_publish_lets_next_caller_acquire() {
        let cache = InMemoryCacheManager::new();
        let owner_a = Uuid::now_v7();
        let owner_b = Uuid::now_v7();
        cache.acquire("fp1", owner_a, Duration::from_secs(60)).await.unwrap();
        cache.release("fp1", owner_a).await.unwrap();

        let outcome = cache.acquire("fp1", owner_b, Duration::from_secs(60)).await.unwrap();
        assert!(matches!(outcome, AcquireOutcome::Granted));
    }

    #[tokio::test]
    async fn waiter_wakes_on_publish() {
        let cache = Arc::new(InMemoryCacheManager::new());
        let owner = Uuid::now_v7();
        cache.acquire("fp1", owner, Duration::from_secs(60)).await.unwrap();

        let waiter_cache = cache.clone();
        let waiter = tokio::spawn(async move { waiter_cache.wait_for_resolution("fp1").await.unwrap() });

        tokio::time::sleep(Duration::from_millis(10)).await;
        cache
            .publish("fp1", json!({"ok": 1}), owner, "worker".into())
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(result, CacheLookup::Hit(_)));
    }

    #[tokio::test]
    async fn expired_lease_is_reaped_and_wakes_waiters() {
        let cache = InMemoryCacheManager::new();
        let owner = Uuid::now_v7();
        cache.acquire("fp1", owner, Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reaped = cache.reap_expired_leases().await;
        assert_eq!(reaped, 1);
        assert!(matches!(cache.lookup("fp1").await.unwrap(), CacheLookup::Miss));
    }

    #[tokio::test]
    async fn heartbeat_extends_deadline_for_current_owner_only() {
        let cache = InMemoryCacheManager::new();
        let owner = Uuid::now_v7();
        let other = Uuid::now_v7();
        cache.acquire("fp1", owner, Duration::from_secs(60)).await.unwrap();
        assert!(cache.heartbeat("fp1", owner, Duration::from_secs(60)).await.unwrap());
        assert!(!cache.heartbeat("fp1", other, Duration::from_secs(60)).await.unwrap());
    }
}
