//! Short-window guard against creating two checkout sessions for the same
//! service and time.
//!
//! The cache is memory-only and scoped to the process. It is a best-effort
//! guard; the payment provider remains the authority on duplicate charges.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Key for a checkout attempt. The date string is used exactly as supplied,
/// so two attempts only collide when they match byte for byte.
pub fn checkout_key(service_id: &str, date: &str) -> String {
    format!("{service_id}-{date}")
}

/// Storage seam for idempotency keys, so a shared store can replace the
/// in-process cache in multi-process deployments.
pub trait IdempotencyStore: Send + Sync {
    /// True while a live entry exists for `key`.
    fn should_block(&self, key: &str) -> bool;

    /// Inserts or refreshes the entry for `key`.
    fn record(&self, key: &str);

    /// Atomically claims `key` unless a live entry exists. Returns whether
    /// the claim succeeded.
    fn try_reserve(&self, key: &str) -> bool;

    /// Drops a claim taken with `try_reserve` that did not lead to a checkout.
    fn release(&self, key: &str);

    /// Removes expired entries and returns how many were dropped.
    fn sweep(&self) -> usize;
}

pub struct IdempotencyCache {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
    retention: chrono::Duration,
}

impl IdempotencyCache {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retention: chrono::Duration::from_std(retention)
                .unwrap_or_else(|_| chrono::Duration::minutes(10)),
        }
    }

    pub fn should_block_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let entries = self.lock();
        entries
            .get(key)
            .is_some_and(|recorded| self.is_live(*recorded, now))
    }

    pub fn record_at(&self, key: &str, now: DateTime<Utc>) {
        self.lock().insert(key.to_string(), now);
    }

    pub fn try_reserve_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.lock();
        if entries
            .get(key)
            .is_some_and(|recorded| self.is_live(*recorded, now))
        {
            return false;
        }
        entries.insert(key.to_string(), now);
        true
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, recorded| self.is_live(*recorded, now));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_live(&self, recorded: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(recorded) < self.retention
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl IdempotencyStore for IdempotencyCache {
    fn should_block(&self, key: &str) -> bool {
        self.should_block_at(key, Utc::now())
    }

    fn record(&self, key: &str) {
        self.record_at(key, Utc::now())
    }

    fn try_reserve(&self, key: &str) -> bool {
        self.try_reserve_at(key, Utc::now())
    }

    fn release(&self, key: &str) {
        self.lock().remove(key);
    }

    fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }
}

/// Background task purging expired keys on a fixed period.
pub struct SweepHandle {
    task: JoinHandle<()>,
}

impl SweepHandle {
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

pub fn spawn_sweeper(store: Arc<dyn IdempotencyStore>, period: Duration) -> SweepHandle {
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = store.sweep();
            if removed > 0 {
                tracing::debug!(removed, "swept expired checkout keys");
            }
        }
    });

    SweepHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minutes(m: i64) -> chrono::Duration {
        chrono::Duration::minutes(m)
    }

    #[test]
    fn test_record_blocks_within_window() {
        let cache = IdempotencyCache::default();
        let t0 = Utc::now();
        let key = checkout_key("svc-1", "2025-11-05T10:00:00");

        assert!(!cache.should_block_at(&key, t0));
        cache.record_at(&key, t0);
        assert!(cache.should_block_at(&key, t0));
        assert!(cache.should_block_at(&key, t0 + minutes(9)));
        assert!(!cache.should_block_at(&key, t0 + minutes(10)));
    }

    #[test]
    fn test_keys_are_literal() {
        let cache = IdempotencyCache::default();
        let t0 = Utc::now();
        cache.record_at(&checkout_key("svc-1", "2025-11-05T10:00:00"), t0);

        assert!(!cache.should_block_at(&checkout_key("svc-1", "2025-11-05T10:00"), t0));
        assert!(!cache.should_block_at(&checkout_key("svc-2", "2025-11-05T10:00:00"), t0));
    }

    #[test]
    fn test_record_overwrites_timestamp() {
        let cache = IdempotencyCache::default();
        let t0 = Utc::now();
        cache.record_at("k", t0);
        cache.record_at("k", t0 + minutes(8));
        assert!(cache.should_block_at("k", t0 + minutes(15)));
    }

    #[test]
    fn test_sweep_drops_only_expired_entries() {
        let cache = IdempotencyCache::default();
        let t0 = Utc::now();
        cache.record_at("old", t0);
        cache.record_at("fresh", t0 + minutes(7));

        let removed = cache.sweep_at(t0 + minutes(11));
        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
        assert!(!cache.should_block_at("old", t0 + minutes(11)));
        assert!(cache.should_block_at("fresh", t0 + minutes(11)));
    }

    #[test]
    fn test_reserve_is_exclusive_until_released() {
        let cache = IdempotencyCache::default();
        let t0 = Utc::now();

        assert!(cache.try_reserve_at("k", t0));
        assert!(!cache.try_reserve_at("k", t0));
        cache.release("k");
        assert!(cache.try_reserve_at("k", t0));
        // An expired entry can be claimed again.
        assert!(cache.try_reserve_at("k", t0 + minutes(10)));
    }

    #[tokio::test]
    async fn test_sweeper_can_be_stopped() {
        let cache: Arc<dyn IdempotencyStore> = Arc::new(IdempotencyCache::default());
        let handle = spawn_sweeper(cache, Duration::from_millis(10));
        assert!(handle.is_running());
        handle.stop();
    }

    #[tokio::test]
    async fn test_sweeper_purges_without_traffic() {
        let cache = Arc::new(IdempotencyCache::new(Duration::from_millis(50)));
        cache.record("svc-1-2025-11-05T10:00:00");
        cache.record("svc-1-2025-11-05T11:00:00");
        assert_eq!(cache.len(), 2);

        let handle = spawn_sweeper(cache.clone() as Arc<dyn IdempotencyStore>, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(cache.is_empty());
        assert!(handle.is_running());
        handle.stop();
    }
}
