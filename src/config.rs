//! Configuration of the data layer components.
//!
//! Every config can be taken as is with `new()` or tuned through its builder:
//!
//! ```ignore
//! let config = CacheConfig::builder()
//!     .fast_capacity(200)
//!     .durable_horizon(Duration::from_secs(12 * 3600))
//!     .build()?;
//! ```
use std::time::Duration;

use fieldx::fxstruct;

const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
#[fxstruct(builder, get(copy))]
pub struct CacheConfig {
    /// Maximum number of fast-tier entries before FIFO eviction kicks in.
    #[fieldx(default(50))]
    fast_capacity: usize,

    /// How often the background sweeper drops expired fast-tier entries.
    #[fieldx(default(HOUR))]
    fast_sweep_interval: Duration,

    /// Durable entries older than this are removed by a sweep no matter what their TTL says.
    #[fieldx(default(HOUR * 24))]
    durable_horizon: Duration,

    #[fieldx(default(HOUR * 24))]
    durable_sweep_interval: Duration,
}

#[derive(Debug, Clone)]
#[fxstruct(builder, get(copy))]
pub struct OrchestratorConfig {
    /// Backoff unit. Attempt `n` is followed by a `base_delay * n` pause.
    #[fieldx(default(Duration::from_secs(1)))]
    base_delay: Duration,

    /// Pause the write queue takes after settling each write.
    #[fieldx(default(Duration::from_millis(100)))]
    write_delay: Duration,

    /// TTL of cached results when the caller doesn't specify one.
    #[fieldx(default(Duration::from_secs(300)))]
    default_ttl: Duration,
}

#[derive(Debug, Clone)]
#[fxstruct(builder, get(copy))]
pub struct StoreConfig {
    #[fieldx(default(50))]
    max_history: usize,
}

/// Names and lifetimes used by [`DataLayer`](crate::layer::DataLayer).
#[derive(Debug, Clone)]
#[fxstruct(builder, get)]
pub struct LayerConfig {
    /// Remote collection served by the layer. Also the cache key family of everything loaded from it.
    #[fieldx(builder(into), default(String::from("items")))]
    collection: String,

    /// State slot receiving the loaded collection.
    #[fieldx(builder(into), default(String::from("items")))]
    collection_slot: String,

    /// State slot receiving a single loaded entity.
    #[fieldx(builder(into), default(String::from("selected")))]
    entity_slot: String,

    #[fieldx(get(copy), default(Duration::from_secs(600)))]
    collection_ttl: Duration,

    #[fieldx(get(copy), default(Duration::from_secs(120)))]
    entity_ttl: Duration,

    #[fieldx(get(copy), default(3))]
    retries: u32,

    /// Session snapshots older than this are not restored.
    #[fieldx(get(copy), default(HOUR * 24))]
    session_max_age: Duration,
}
