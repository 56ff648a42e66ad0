//! In-process implementations of the shared store traits.
//!
//! Production deployments point [`CacheStore`] and [`CounterStore`] at a
//! networked key-value service so every worker observes the same circuit
//! and cache state. These implementations cover tests and single-process
//! runs: the cache rides on `moka` with per-entry TTLs, the counters on a
//! mutexed map with lazy expiry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use moka::Expiry;
use moka::future::Cache;

use crate::error::AppError;
use crate::models::ExtractionResult;
use crate::traits::{CacheStore, CounterStore};

// ---------------------------------------------------------------------------
// MemoryCacheStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct CachedEntry {
    result: ExtractionResult,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, CachedEntry> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CachedEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Moka-backed cache honoring the per-entry TTL passed to `set`.
#[derive(Clone)]
pub struct MemoryCacheStore {
    cache: Cache<String, CachedEntry>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(max_entries: u64) -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(max_entries)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Flush moka's internal queues so `entry_count` is exact. Test helper.
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<ExtractionResult>, AppError> {
        Ok(self.cache.get(key).await.map(|e| e.result))
    }

    async fn set(
        &self,
        key: &str,
        value: &ExtractionResult,
        ttl: Duration,
    ) -> Result<(), AppError> {
        self.cache
            .insert(
                key.to_string(),
                CachedEntry {
                    result: value.clone(),
                    ttl,
                },
            )
            .await;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryCounterStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CounterEntry {
    value: u64,
    expires_at: Option<Instant>,
}

/// Mutexed counter map with lazy expiry, mirroring the atomic
/// increment/get/expire contract of a networked counter service.
#[derive(Clone, Default)]
pub struct MemoryCounterStore {
    entries: Arc<Mutex<HashMap<String, CounterEntry>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CounterEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned counter store mutex");
            poisoned.into_inner()
        })
    }

    fn purge_if_expired(entries: &mut HashMap<String, CounterEntry>, key: &str) {
        if let Some(entry) = entries.get(key)
            && let Some(deadline) = entry.expires_at
            && Instant::now() >= deadline
        {
            entries.remove(key);
        }
    }
}

impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<u64, AppError> {
        let mut entries = self.lock();
        Self::purge_if_expired(&mut entries, key);
        let entry = entries.entry(key.to_string()).or_insert(CounterEntry {
            value: 0,
            expires_at: None,
        });
        entry.value += 1;
        Ok(entry.value)
    }

    async fn get(&self, key: &str) -> Result<u64, AppError> {
        let mut entries = self.lock();
        Self::purge_if_expired(&mut entries, key);
        Ok(entries.get(key).map(|e| e.value).unwrap_or(0))
    }

    async fn put(&self, key: &str, value: u64) -> Result<(), AppError> {
        let mut entries = self.lock();
        Self::purge_if_expired(&mut entries, key);
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(key.to_string(), CounterEntry { value, expires_at });
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), AppError> {
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), AppError> {
        self.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExtractedContent, tier};

    fn sample_result() -> ExtractionResult {
        ExtractionResult::ok(
            ExtractedContent::PlainText {
                text: "sample".into(),
            },
            tier::OCR,
        )
    }

    #[tokio::test]
    async fn cache_set_then_get_returns_equal_value() {
        let store = MemoryCacheStore::new();
        let result = sample_result();
        store
            .set("key-1", &result, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("key-1").await.unwrap(), Some(result));
    }

    #[tokio::test]
    async fn cache_miss_returns_none() {
        let store = MemoryCacheStore::new();
        assert_eq!(store.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn cache_entry_expires_after_ttl() {
        let store = MemoryCacheStore::new();
        store
            .set("short", &sample_result(), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("short").await.unwrap(), None);
    }

    #[tokio::test]
    async fn counters_increment_and_read_back() {
        let store = MemoryCounterStore::new();
        assert_eq!(store.increment("c").await.unwrap(), 1);
        assert_eq!(store.increment("c").await.unwrap(), 2);
        assert_eq!(store.get("c").await.unwrap(), 2);
        assert_eq!(store.get("other").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counter_expiry_resets_the_window() {
        let store = MemoryCounterStore::new();
        store.increment("c").await.unwrap();
        store.expire("c", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("c").await.unwrap(), 0);
        // A fresh increment starts over.
        assert_eq!(store.increment("c").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn counter_delete_removes_key() {
        let store = MemoryCounterStore::new();
        store.put("c", 7).await.unwrap();
        store.delete("c").await.unwrap();
        assert_eq!(store.get("c").await.unwrap(), 0);
    }
}
