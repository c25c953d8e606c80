use std::fmt::Display;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::error::DataLayerError;

/// The state document and any partial update of it: top-level slot name to value.
pub type Document = Map<String, Value>;

/// Uniform result of orchestrated remote operations.
pub type Outcome<T> = Result<Fetched<T>, DataLayerError>;

/// Cache tier selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Tier {
    /// Bounded, volatile, FIFO-evicted.
    #[default]
    Fast,
    /// Unbounded, persistent, swept by age horizon.
    Durable,
}

impl Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Fast => write!(f, "fast"),
            Tier::Durable => write!(f, "durable"),
        }
    }
}

/// Successful outcome of [`DataOrchestrator::execute()`](crate::orchestrator::DataOrchestrator::execute).
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub data:       T,
    pub from_cache: bool,
}

impl<T> Fetched<T> {
    pub fn fresh(data: T) -> Self {
        Self {
            data,
            from_cache: false,
        }
    }

    pub fn cached(data: T) -> Self {
        Self { data, from_cache: true }
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        Fetched {
            data:       f(self.data),
            from_cache: self.from_cache,
        }
    }
}

/// Per-call options of the orchestrator.
///
/// ```ignore
/// let opts = ExecOptions::default().with_tier(Tier::Durable).with_ttl(Duration::from_secs(600));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    /// Consult and populate the cache.
    pub use_cache: bool,
    /// Falls back to the orchestrator's default TTL when not set.
    pub cache_ttl: Option<Duration>,
    pub tier:      Tier,
    /// Total number of attempts, not the number of re-tries. Zero is treated as one.
    pub retries:   u32,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            cache_ttl: None,
            tier:      Tier::Fast,
            retries:   3,
        }
    }
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_cache() -> Self {
        Self::default().with_cache(false)
    }

    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}
