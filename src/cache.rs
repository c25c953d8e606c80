use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;

use crate::config::CacheConfig;
use crate::entry::DurableEntry;
use crate::error::DataLayerError;
use crate::error::StoreError;
use crate::fast_tier::FastTier;
use crate::fast_tier::Lookup;
use crate::traits::DurableStore;
use crate::types::Tier;

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits:             u64,
    pub misses:           u64,
    /// Fast-tier entries dropped to make room.
    pub evictions:        u64,
    /// Entries found expired on read or removed by a sweep.
    pub expirations:      u64,
    /// Durable-tier operations that failed and were degraded.
    pub durable_failures: u64,
    pub fast_entries:     u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        }
        else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits:             AtomicU64,
    misses:           AtomicU64,
    evictions:        AtomicU64,
    expirations:      AtomicU64,
    durable_failures: AtomicU64,
}

impl Counters {
    #[inline]
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// Two-tier key/value cache with TTL expiry.
///
/// The fast tier is a bounded in-memory map with **FIFO** eviction: when full, the entry inserted earliest goes
/// first, no matter how recently it was read. The durable tier is whatever [`DurableStore`] the cache is given; it
/// is unbounded and relies on periodic sweeps by age.
///
/// Nothing here ever fails loudly. When the durable store is missing or failing, durable-tier operations fall back
/// to the fast tier: writes land there and return `false` ("persistence degraded"), reads and deletes consult it.
/// Caching keeps working within the process; only persistence is lost.
///
/// ```ignore
/// let cache = Arc::new(TieredCache::new(CacheConfig::new()).with_durable(Arc::new(LmdbStore::open(dir, 64)?)));
/// cache.set("items", json!([]), Duration::from_secs(600), Tier::Durable).await;
/// let _sweeper = cache.spawn_sweeper();
/// ```
pub struct TieredCache {
    name:     String,
    config:   CacheConfig,
    fast:     Mutex<FastTier>,
    durable:  Option<Arc<dyn DurableStore>>,
    counters: Counters,
}

impl TieredCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            name: "datalayer".to_string(),
            fast: Mutex::new(FastTier::new(config.fast_capacity())),
            config,
            durable: None,
            counters: Counters::default(),
        }
    }

    pub fn with_name<S: ToString>(mut self, name: S) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_durable(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.durable = Some(store);
        self
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn has_durable(&self) -> bool {
        self.durable.is_some()
    }

    fn valid_key(&self, key: &str) -> bool {
        if key.trim().is_empty() {
            log::warn!("[{}] rejecting empty cache key", self.name);
            false
        }
        else {
            true
        }
    }

    fn durable_failed(&self, op: &str, key: &str, err: StoreError) {
        Counters::bump(&self.counters.durable_failures, 1);
        let err = DataLayerError::PersistentStoreUnavailable(err);
        log::warn!("[{}] durable {op}({key}) failed, degrading to fast tier: {err}", self.name);
    }

    // The durable tier to use for `op`, or `None` after recording that there is none.
    fn durable_store(&self, op: &str, key: &str) -> Option<&Arc<dyn DurableStore>> {
        let store = self.durable.as_ref();
        if store.is_none() {
            self.durable_failed(op, key, StoreError::Unavailable("no durable store configured".to_string()));
        }
        store
    }

    fn set_fast(&self, key: &str, value: Value, ttl: Duration) {
        let evicted = self.fast.lock().insert(key.to_string(), value, ttl);
        if !evicted.is_empty() {
            log::debug!("[{}] evicted {evicted:?}", self.name);
            Counters::bump(&self.counters.evictions, evicted.len() as u64);
        }
    }

    pub async fn get(&self, key: &str, tier: Tier) -> Option<Value> {
        if !self.valid_key(key) {
            return None;
        }

        let found = match tier {
            Tier::Fast => self.get_fast(key),
            Tier::Durable => self.get_durable(key).await,
        };

        log::debug!("[{}] GET({key}, {tier}) {}", self.name, if found.is_some() { "hit" } else { "miss" });
        Counters::bump(
            if found.is_some() {
                &self.counters.hits
            }
            else {
                &self.counters.misses
            },
            1,
        );

        found
    }

    fn get_fast(&self, key: &str) -> Option<Value> {
        match self.fast.lock().get(key) {
            Lookup::Hit(value) => Some(value),
            Lookup::Expired => {
                Counters::bump(&self.counters.expirations, 1);
                None
            }
            Lookup::Miss => None,
        }
    }

    async fn get_durable(&self, key: &str) -> Option<Value> {
        let Some(store) = self.durable_store("get", key)
        else {
            return self.get_fast(key);
        };
        match store.get(key).await {
            Ok(Some(entry)) if entry.is_valid() => Some(entry.value),
            Ok(Some(_)) => {
                Counters::bump(&self.counters.expirations, 1);
                // Best effort; the horizon sweep gets it otherwise.
                if let Err(err) = store.delete(key).await {
                    self.durable_failed("delete", key, err);
                }
                None
            }
            Ok(None) => None,
            Err(err) => {
                self.durable_failed("get", key, err);
                self.get_fast(key)
            }
        }
    }

    /// Returns `false` if the value could not be stored as asked. For the durable tier that means persistence is
    /// degraded: the value is kept in the fast tier instead.
    pub async fn set(&self, key: &str, value: Value, ttl: Duration, tier: Tier) -> bool {
        if !self.valid_key(key) {
            return false;
        }

        log::debug!("[{}] SET({key}, {tier}, ttl={ttl:?})", self.name);

        match tier {
            Tier::Fast => {
                self.set_fast(key, value, ttl);
                true
            }
            Tier::Durable => {
                let Some(store) = self.durable_store("put", key)
                else {
                    self.set_fast(key, value, ttl);
                    return false;
                };
                let entry = DurableEntry::new(key, value, ttl);
                match store.put(&entry).await {
                    Ok(()) => true,
                    Err(err) => {
                        self.durable_failed("put", key, err);
                        self.set_fast(key, entry.value, ttl);
                        false
                    }
                }
            }
        }
    }

    /// Idempotent. Returns `true` if there was an entry to remove.
    pub async fn delete(&self, key: &str, tier: Tier) -> bool {
        match tier {
            Tier::Fast => self.fast.lock().remove(key),
            Tier::Durable => {
                let Some(store) = self.durable.as_ref()
                else {
                    return self.fast.lock().remove(key);
                };
                match store.delete(key).await {
                    Ok(removed) => removed,
                    Err(err) => {
                        self.durable_failed("delete", key, err);
                        self.fast.lock().remove(key)
                    }
                }
            }
        }
    }

    pub async fn delete_everywhere(&self, key: &str) -> bool {
        let fast = self.delete(key, Tier::Fast).await;
        let durable = self.delete(key, Tier::Durable).await;
        fast || durable
    }

    /// Removes every key starting with `prefix` from both tiers. Returns how many were removed.
    pub async fn delete_prefix(&self, prefix: &str) -> usize {
        let mut removed = self.fast.lock().remove_prefix(prefix);
        if let Some(store) = self.durable.as_ref() {
            match store.delete_prefix(prefix).await {
                Ok(count) => removed += count,
                Err(err) => self.durable_failed("delete_prefix", prefix, err),
            }
        }
        removed
    }

    pub async fn clear_tier(&self, tier: Tier) {
        log::info!("[{}] clearing {tier} tier", self.name);
        match tier {
            Tier::Fast => self.fast.lock().clear(),
            Tier::Durable => {
                if let Some(store) = self.durable.as_ref() {
                    if let Err(err) = store.clear().await {
                        self.durable_failed("clear", "*", err);
                    }
                }
            }
        }
    }

    pub async fn clear(&self) {
        self.clear_tier(Tier::Fast).await;
        self.clear_tier(Tier::Durable).await;
    }

    /// Drops expired fast-tier entries, oldest first.
    pub fn sweep_fast(&self) -> usize {
        let expired = self.fast.lock().sweep_expired();
        if !expired.is_empty() {
            Counters::bump(&self.counters.expirations, expired.len() as u64);
            log::debug!("[{}] fast sweep dropped {} entries", self.name, expired.len());
        }
        expired.len()
    }

    /// Drops durable entries older than the configured horizon regardless of their own TTL.
    pub async fn sweep_durable(&self) -> usize {
        let Some(store) = self.durable.as_ref()
        else {
            return 0;
        };

        let horizon = chrono::Duration::from_std(self.config.durable_horizon()).unwrap_or(chrono::Duration::MAX);
        let Some(upper_bound) = Utc::now().checked_sub_signed(horizon)
        else {
            return 0;
        };

        let stale = match store.iterate_by_timestamp_ascending(upper_bound).await {
            Ok(stale) => stale,
            Err(err) => {
                self.durable_failed("sweep", "*", err);
                return 0;
            }
        };

        let mut removed = 0;
        for entry in stale {
            match store.delete(&entry.key).await {
                Ok(true) => removed += 1,
                Ok(false) => (),
                Err(err) => self.durable_failed("sweep", &entry.key, err),
            }
        }

        if removed > 0 {
            Counters::bump(&self.counters.expirations, removed as u64);
            log::info!("[{}] durable sweep dropped {removed} entries", self.name);
        }
        removed
    }

    pub async fn sweep(&self) -> usize {
        self.sweep_fast() + self.sweep_durable().await
    }

    /// Starts the periodic sweeper. The task ends by itself once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::downgrade(self);
        let fast_every = self.config.fast_sweep_interval();
        let durable_every = self.config.durable_sweep_interval();

        tokio::spawn(async move {
            let mut fast_tick = interval_at(Instant::now() + fast_every, fast_every);
            let mut durable_tick = interval_at(Instant::now() + durable_every, durable_every);
            fast_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            durable_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = fast_tick.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        cache.sweep_fast();
                    }
                    _ = durable_tick.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        cache.sweep_durable().await;
                    }
                }
            }
        })
    }

    /// Effective fast-tier capacity; a configured zero reads as one.
    pub fn fast_capacity(&self) -> usize {
        self.fast.lock().capacity()
    }

    /// Fast-tier keys, oldest first.
    pub fn fast_keys(&self) -> Vec<String> {
        self.fast.lock().keys()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hits:             c.hits.load(Ordering::Relaxed),
            misses:           c.misses.load(Ordering::Relaxed),
            evictions:        c.evictions.load(Ordering::Relaxed),
            expirations:      c.expirations.load(Ordering::Relaxed),
            durable_failures: c.durable_failures.load(Ordering::Relaxed),
            fast_entries:     self.fast.lock().len() as u64,
        }
    }
}

impl std::fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCache")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("has_durable", &self.has_durable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::MemoryStore;
    use crate::test::BrokenStore;
    use serde_json::json;

    const MINUTE: Duration = Duration::from_secs(60);

    fn cache_with_capacity(capacity: usize) -> TieredCache {
        TieredCache::new(CacheConfig::builder().fast_capacity(capacity).build().unwrap())
    }

    #[tokio::test]
    async fn capacity_two_scenario() {
        let cache = cache_with_capacity(2);
        cache.set("a", json!(1), MINUTE, Tier::Fast).await;
        cache.set("b", json!(2), MINUTE, Tier::Fast).await;
        cache.set("c", json!(3), MINUTE, Tier::Fast).await;

        assert_eq!(cache.get("a", Tier::Fast).await, None);
        assert_eq!(cache.get("b", Tier::Fast).await, Some(json!(2)));
        assert_eq!(cache.get("c", Tier::Fast).await, Some(json!(3)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn inserting_capacity_plus_one_keeps_the_last_capacity_keys() {
        let capacity = 5;
        let cache = cache_with_capacity(capacity);
        for i in 0..=capacity {
            cache.set(&format!("k{i}"), json!(i), MINUTE, Tier::Fast).await;
        }

        assert_eq!(cache.get("k0", Tier::Fast).await, None);
        for i in 1..=capacity {
            assert_eq!(cache.get(&format!("k{i}"), Tier::Fast).await, Some(json!(i)));
        }
        assert_eq!(cache.fast_keys(), (1..=capacity).map(|i| format!("k{i}")).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn fast_entry_expires_and_is_removed_on_read() {
        let cache = cache_with_capacity(10);
        cache.set("k", json!("v"), Duration::from_secs(10), Tier::Fast).await;

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("k", Tier::Fast).await, Some(json!("v")));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("k", Tier::Fast).await, None);
        assert!(cache.fast_keys().is_empty());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn durable_tier_round_trip_and_expiry() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with_capacity(10).with_durable(store.clone());

        assert!(cache.set("catalog", json!([1, 2]), MINUTE, Tier::Durable).await);
        assert_eq!(cache.get("catalog", Tier::Durable).await, Some(json!([1, 2])));
        // Tiers are independent.
        assert_eq!(cache.get("catalog", Tier::Fast).await, None);

        assert!(cache.set("stale", json!(0), Duration::ZERO, Tier::Durable).await);
        assert_eq!(cache.get("stale", Tier::Durable).await, None);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn broken_durable_store_degrades_to_fast_tier() {
        let cache = cache_with_capacity(10).with_durable(Arc::new(BrokenStore));

        // Not persisted, but still cached.
        assert!(!cache.set("k", json!(1), MINUTE, Tier::Durable).await);
        assert_eq!(cache.fast_keys(), vec!["k".to_string()]);
        assert_eq!(cache.get("k", Tier::Durable).await, Some(json!(1)));
        assert_eq!(cache.get("k", Tier::Fast).await, Some(json!(1)));

        assert!(cache.delete("k", Tier::Durable).await);
        assert_eq!(cache.get("k", Tier::Durable).await, None);
        assert_eq!(cache.sweep_durable().await, 0);
        assert!(cache.stats().durable_failures >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_durable_store_caches_in_fast_tier() {
        let cache = cache_with_capacity(10);

        assert!(!cache.set("k", json!(1), Duration::from_secs(10), Tier::Durable).await);
        assert_eq!(cache.get("k", Tier::Durable).await, Some(json!(1)));
        assert_eq!(cache.stats().durable_failures, 2);

        // The fallback copy keeps the requested TTL.
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.get("k", Tier::Durable).await, None);
    }

    #[tokio::test]
    async fn fallback_writes_respect_fast_capacity() {
        let cache = cache_with_capacity(2);
        for key in ["a", "b", "c"] {
            cache.set(key, json!(key), MINUTE, Tier::Durable).await;
        }
        assert_eq!(cache.fast_keys(), vec!["b".to_string(), "c".to_string()]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn zero_capacity_reads_as_one() {
        let cache = cache_with_capacity(0);
        assert_eq!(cache.fast_capacity(), 1);
        cache.set("a", json!(1), MINUTE, Tier::Fast).await;
        cache.set("b", json!(2), MINUTE, Tier::Fast).await;
        assert_eq!(cache.fast_keys(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn empty_keys_are_rejected() {
        let cache = cache_with_capacity(10);
        assert!(!cache.set("  ", json!(1), MINUTE, Tier::Fast).await);
        assert_eq!(cache.get("", Tier::Fast).await, None);
    }

    #[tokio::test]
    async fn durable_sweep_uses_the_horizon_not_the_ttl() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with_capacity(10).with_durable(store.clone());
        let week = Duration::from_secs(7 * 86_400);

        store
            .put(&DurableEntry::new("old", json!(1), week).with_created_at(Utc::now() - chrono::Duration::hours(25)))
            .await
            .unwrap();
        store
            .put(&DurableEntry::new("young", json!(2), week).with_created_at(Utc::now() - chrono::Duration::hours(1)))
            .await
            .unwrap();

        assert_eq!(cache.sweep_durable().await, 1);
        assert_eq!(cache.get("old", Tier::Durable).await, None);
        assert_eq!(cache.get("young", Tier::Durable).await, Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_fast_sweep_periodically() {
        let config = CacheConfig::builder()
            .fast_capacity(10)
            .fast_sweep_interval(Duration::from_secs(60))
            .build()
            .unwrap();
        let cache = Arc::new(TieredCache::new(config));
        cache.set("k", json!(1), Duration::from_secs(5), Tier::Fast).await;
        let sweeper = cache.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.fast_keys().is_empty());

        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_durable_sweep_periodically() {
        let store = Arc::new(MemoryStore::new());
        let config = CacheConfig::builder()
            .fast_capacity(10)
            .fast_sweep_interval(Duration::from_secs(3_600))
            .durable_sweep_interval(Duration::from_secs(60))
            .build()
            .unwrap();
        let cache = Arc::new(TieredCache::new(config).with_durable(store.clone()));
        let week = Duration::from_secs(7 * 86_400);
        store
            .put(&DurableEntry::new("old", json!(1), week).with_created_at(Utc::now() - chrono::Duration::hours(25)))
            .await
            .unwrap();
        store.put(&DurableEntry::new("young", json!(2), week)).await.unwrap();
        let sweeper = cache.spawn_sweeper();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(store.len(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(store.len(), 1);
        assert_eq!(cache.get("young", Tier::Durable).await, Some(json!(2)));
        assert_eq!(cache.stats().expirations, 1);

        // The task ends once the cache is gone.
        drop(cache);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(sweeper.is_finished());
    }

    #[tokio::test]
    async fn delete_prefix_and_clear_cover_both_tiers() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_with_capacity(10).with_durable(store.clone());
        cache.set("items:1", json!(1), MINUTE, Tier::Fast).await;
        cache.set("items:2", json!(2), MINUTE, Tier::Durable).await;
        cache.set("cart", json!([]), MINUTE, Tier::Durable).await;

        assert_eq!(cache.delete_prefix("items:").await, 2);
        assert_eq!(store.len(), 1);

        cache.clear().await;
        cache.clear().await;
        assert!(store.is_empty());
    }
}
