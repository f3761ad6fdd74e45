//! Bounded TTL cache for slowly changing reference data that connectors
//! look up repeatedly (regions, machine types, project metadata).
//!
//! The cache is an ordinary value owned by whoever needs it; there is no
//! process-wide instance.

use crate::clock::{Clock, duration_ms};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    inserted_at_ms: u64,
}

/// Cache whose entries expire a fixed `ttl` after insertion.
///
/// When full, inserting evicts expired entries first and then the oldest one.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
    max_entries: usize,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(clock: Arc<dyn Clock>, ttl: Duration, max_entries: usize) -> Self {
        Self {
            clock,
            ttl_ms: duration_ms(ttl),
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn expired(&self, entry: &Entry<V>, now_ms: u64) -> bool {
        now_ms.saturating_sub(entry.inserted_at_ms) >= self.ttl_ms
    }

    /// Fresh value for `key`, if any. An expired entry is removed.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if !self.expired(entry, now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn insert(&self, key: K, value: V) {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().await;
        if !entries.contains_key(&key) && entries.len() >= self.max_entries {
            entries.retain(|_, e| now.saturating_sub(e.inserted_at_ms) < self.ttl_ms);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at_ms)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            Entry {
                value,
                inserted_at_ms: now,
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, e| now.saturating_sub(e.inserted_at_ms) < self.ttl_ms);
        before - entries.len()
    }

    /// Number of entries held, including expired ones not yet swept.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Return the cached value or load, cache and return it. Load errors are
    /// not cached.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(v) = self.get(&key).await {
            return Ok(v);
        }
        let value = load().await?;
        self.insert(key, value.clone()).await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache(clock: &Arc<ManualClock>, max: usize) -> TtlCache<String, u32> {
        TtlCache::new(clock.clone(), Duration::from_secs(60), max)
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let c = cache(&clock, 8);
        c.insert("us-east1".into(), 1).await;
        clock.advance(Duration::from_secs(59));
        assert_eq!(c.get(&"us-east1".to_string()).await, Some(1));
        clock.advance(Duration::from_secs(1));
        assert_eq!(c.get(&"us-east1".to_string()).await, None);
        assert!(c.is_empty().await);
    }

    #[tokio::test]
    async fn full_cache_evicts_oldest() {
        let clock = Arc::new(ManualClock::new(0));
        let c = cache(&clock, 2);
        c.insert("a".into(), 1).await;
        clock.advance(Duration::from_secs(1));
        c.insert("b".into(), 2).await;
        clock.advance(Duration::from_secs(1));
        c.insert("c".into(), 3).await;
        assert_eq!(c.len().await, 2);
        assert_eq!(c.get(&"a".to_string()).await, None);
        assert_eq!(c.get(&"c".to_string()).await, Some(3));
    }

    #[tokio::test]
    async fn sweep_removes_only_expired() {
        let clock = Arc::new(ManualClock::new(0));
        let c = cache(&clock, 8);
        c.insert("old".into(), 1).await;
        clock.advance(Duration::from_secs(30));
        c.insert("new".into(), 2).await;
        clock.advance(Duration::from_secs(31));
        assert_eq!(c.sweep().await, 1);
        assert_eq!(c.get(&"new".to_string()).await, Some(2));
    }

    #[tokio::test]
    async fn loader_runs_once_and_errors_are_not_cached() {
        let clock = Arc::new(ManualClock::new(0));
        let c = cache(&clock, 8);
        let err: Result<u32, String> = c
            .get_or_try_insert_with("k".into(), || async { Err("unavailable".to_string()) })
            .await;
        assert!(err.is_err());
        let v: Result<u32, String> = c.get_or_try_insert_with("k".into(), || async { Ok(7) }).await;
        assert_eq!(v, Ok(7));
        let again: Result<u32, String> = c
            .get_or_try_insert_with("k".into(), || async { Err("loader must not run".to_string()) })
            .await;
        assert_eq!(again, Ok(7));
    }
}
