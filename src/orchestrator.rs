use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::TieredCache;
use crate::config::OrchestratorConfig;
use crate::error::DataLayerError;
use crate::error::ErrorReport;
use crate::error::RemoteError;
use crate::retry::RetryCounters;
use crate::retry::RetryPolicy;
use crate::traits::ErrorSink;
use crate::traits::LogErrorSink;
use crate::types::ExecOptions;
use crate::types::Fetched;
use crate::types::Outcome;
use crate::write_queue::WriteQueue;

/// Snapshot of orchestrator counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    /// Remote calls made, retries included.
    pub attempts:     u64,
    /// Pauses taken between attempts.
    pub backoffs:     u64,
    pub cache_hits:   u64,
    pub cache_misses: u64,
    /// Operations that ended in an error reported to the sink.
    pub failures:     u64,
    /// Writes settled successfully.
    pub writes:       u64,
}

#[derive(Debug, Default)]
struct Counters {
    retry:        RetryCounters,
    cache_hits:   AtomicU64,
    cache_misses: AtomicU64,
    failures:     AtomicU64,
    writes:       AtomicU64,
}

/// Read-through, retrying front of a remote service.
///
/// Reads go through [`execute()`](Self::execute): cache first, then the remote operation under a bounded retry
/// with linear backoff, then back into the cache. Writes go through [`write()`](Self::write): no cache, same retry,
/// and strictly one at a time in submission order. Whatever goes wrong comes back as an `Err` value and is also
/// handed to the [`ErrorSink`]; nothing panics through here.
///
/// The orchestrator never guesses which cache keys a write made stale. Call [`invalidate()`](Self::invalidate).
pub struct DataOrchestrator {
    cache:    Arc<TieredCache>,
    config:   OrchestratorConfig,
    retry:    RetryPolicy,
    sink:     Arc<dyn ErrorSink>,
    writes:   WriteQueue,
    counters: Arc<Counters>,
}

impl DataOrchestrator {
    pub fn new(cache: Arc<TieredCache>, config: OrchestratorConfig) -> Self {
        let writes = WriteQueue::new(format!("{}:writes", cache.name()), config.write_delay());
        Self {
            retry: RetryPolicy::new(config.base_delay()),
            sink: Arc::new(LogErrorSink),
            counters: Arc::new(Counters::default()),
            cache,
            config,
            writes,
        }
    }

    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Read-through execution of `operation`.
    ///
    /// With `use_cache` on and a `cache_key` given, a valid cached value is returned as [`Fetched::cached`] and
    /// `operation` is not called at all. Otherwise `operation` is attempted up to `options.retries` times and a
    /// successful result is cached under `cache_key` in `options.tier` before being returned.
    ///
    /// A cached payload that no longer deserializes into `T` is dropped and treated as a miss.
    #[tracing::instrument(level = "debug", skip_all, fields(key = ?cache_key, tier = %options.tier))]
    pub async fn execute<T, F, Fut>(&self, operation: F, cache_key: Option<&str>, options: ExecOptions) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let cache_key = cache_key.filter(|_| options.use_cache);

        if let Some(key) = cache_key {
            if let Some(cached) = self.cache.get(key, options.tier).await {
                match serde_json::from_value::<T>(cached) {
                    Ok(data) => {
                        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[{}] EXECUTE({key}) served from {} tier", self.name(), options.tier);
                        return Ok(Fetched::cached(data));
                    }
                    Err(err) => {
                        log::warn!("[{}] dropping unparseable cached payload for '{key}': {err}", self.name());
                        self.cache.delete(key, options.tier).await;
                    }
                }
            }
            self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        }

        let label = format!("{}:{}", self.name(), cache_key.unwrap_or("execute"));
        match self
            .retry
            .run(&label, options.retries, operation, &self.counters.retry)
            .await
        {
            Ok(data) => {
                if let Some(key) = cache_key {
                    self.populate(key, &data, options).await;
                }
                Ok(Fetched::fresh(data))
            }
            Err(err) => Err(self.fail(err, format!("execute({})", cache_key.unwrap_or("-")))),
        }
    }

    async fn populate<T: Serialize>(&self, key: &str, data: &T, options: ExecOptions) {
        let ttl = options.cache_ttl.unwrap_or(self.config.default_ttl());
        match serde_json::to_value(data) {
            Ok(value) => {
                if !self.cache.set(key, value, ttl, options.tier).await {
                    log::debug!("[{}] result for '{key}' not cached in {} tier", self.name(), options.tier);
                }
            }
            Err(err) => log::warn!("[{}] cannot cache result for '{key}': {err}", self.name()),
        }
    }

    /// Queues a remote write and waits for it to settle.
    ///
    /// Writes skip the cache entirely and run one at a time, in submission order, each followed by the configured
    /// write delay. The retry budget comes from `options.retries`; other options are ignored.
    #[tracing::instrument(level = "debug", skip_all, fields(retries = options.retries))]
    pub async fn write<T, F, Fut>(&self, operation: F, options: ExecOptions) -> Outcome<T>
    where
        T: Send + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
    {
        let retry = self.retry;
        let counters = self.counters.clone();
        let label = format!("{}:write", self.name());
        let retries = options.retries;

        let result = self
            .writes
            .submit(async move {
                let result = retry.run(&label, retries, operation, &counters.retry).await;
                if result.is_ok() {
                    counters.writes.fetch_add(1, Ordering::Relaxed);
                }
                result
            })
            .await;

        result
            .map(Fetched::fresh)
            .map_err(|err| self.fail(err, "write"))
    }

    /// Removes `pattern` and its key family from both tiers.
    ///
    /// `"items"` removes `items` itself and every `items:*` key. A pattern ending with `*` is a plain prefix:
    /// `"items:4*"` removes `items:4`, `items:42` and so on. Returns the number of entries removed.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let removed = if let Some(prefix) = pattern.strip_suffix('*') {
            self.cache.delete_prefix(prefix).await
        }
        else {
            usize::from(self.cache.delete_everywhere(pattern).await)
                + self.cache.delete_prefix(&format!("{pattern}:")).await
        };
        log::debug!("[{}] INVALIDATE({pattern}) removed {removed} entries", self.name());
        removed
    }

    /// Writes submitted but not settled yet.
    pub fn pending_writes(&self) -> usize {
        self.writes.pending()
    }

    pub fn stats(&self) -> OrchestratorStats {
        let c = &self.counters;
        OrchestratorStats {
            attempts:     c.retry.attempts.load(Ordering::Relaxed),
            backoffs:     c.retry.backoffs.load(Ordering::Relaxed),
            cache_hits:   c.cache_hits.load(Ordering::Relaxed),
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            failures:     c.failures.load(Ordering::Relaxed),
            writes:       c.writes.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn name(&self) -> &str {
        self.cache.name()
    }

    fn fail<C: std::fmt::Display>(&self, err: DataLayerError, context: C) -> DataLayerError {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        self.sink.report(&ErrorReport::new(&err, context));
        err
    }
}

impl std::fmt::Debug for DataOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataOrchestrator")
            .field("cache", &self.cache)
            .field("config", &self.config)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}
