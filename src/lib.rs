//! # wb-datalayer
//!
//! Client-side data layer sitting between UI code and a remote record service.
//!
//! It is made of three parts:
//!
//! - [`TieredCache`]: a bounded, volatile fast tier with TTL expiry and **FIFO** eviction, plus an optional durable
//!   tier (any [`DurableStore`], e.g. the LMDB-backed [`LmdbStore`]) swept by age.
//! - [`DataOrchestrator`]: read-through execution of remote operations with bounded retry and linear backoff, and
//!   a write queue that runs writes one at a time in submission order.
//! - [`StateStore`]: a single observable document with per-slot subscriptions, a middleware chain and bounded undo
//!   history.
//!
//! [`DataLayer`] glues them to a [`RemoteService`] and exposes the handful of operations a view layer needs.
//!
//! # Failure Policy
//!
//! Remote failures are retried while they look transient. When the budget is spent the caller gets an `Err`
//! [`Outcome`] and an [`ErrorSink`] gets a report; nothing panics through the orchestrator. A missing or failing
//! durable tier never shows up as an error at all: writes return `false` and land in the fast tier, reads are served
//! from there, and the layer keeps caching without persistence. Middleware and subscribers are isolated from each other and from the commit.
//!
//! # Eviction
//!
//! The fast tier evicts the *earliest inserted* entry when full, regardless of how recently it was read. This is
//! FIFO, not LRU, and it is intentional: reads never reorder anything.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use wb_datalayer::prelude::*;
//!
//! let cache = Arc::new(TieredCache::new(CacheConfig::new()).with_durable(Arc::new(LmdbStore::open("./cache", 64)?)));
//! let _sweeper = cache.spawn_sweeper();
//! let orchestrator = Arc::new(DataOrchestrator::new(cache, OrchestratorConfig::new()));
//! let layer = DataLayer::new(Arc::new(my_remote), orchestrator, LayerConfig::new());
//!
//! let _sub = layer.subscribe("items", |new, _old| {
//!     render(new);
//!     Ok(())
//! });
//! layer.restore_session().await;
//! layer.load_collection().await?;
//! ```

pub mod cache;
pub mod config;
pub mod durable;
pub mod entry;
pub mod error;
pub(crate) mod fast_tier;
pub mod layer;
pub mod orchestrator;
pub mod retry;
pub mod session;
pub mod store;
pub mod test;
pub mod traits;
pub mod types;
pub(crate) mod write_queue;

#[doc(inline)]
pub use cache::TieredCache;
#[doc(inline)]
pub use durable::LmdbStore;
#[doc(inline)]
pub use durable::MemoryStore;
#[doc(inline)]
pub use error::DataLayerError;
#[doc(inline)]
pub use layer::DataLayer;
#[doc(inline)]
pub use orchestrator::DataOrchestrator;
#[doc(inline)]
pub use store::StateStore;
#[doc(inline)]
pub use traits::DurableStore;
#[doc(inline)]
pub use traits::ErrorSink;
#[doc(inline)]
pub use traits::RemoteService;
#[doc(inline)]
pub use types::Outcome;

pub mod prelude {
    pub use crate::cache::CacheStats;
    pub use crate::cache::TieredCache;
    pub use crate::config::*;
    pub use crate::durable::LmdbStore;
    pub use crate::durable::MemoryStore;
    pub use crate::error::DataLayerError;
    pub use crate::error::ErrorReport;
    pub use crate::error::RemoteError;
    pub use crate::layer::DataLayer;
    pub use crate::orchestrator::DataOrchestrator;
    pub use crate::session::SessionSnapshot;
    pub use crate::store::StateStore;
    pub use crate::traits::*;
    pub use crate::types::*;
}

/// Installs a `tracing` subscriber filtered by `RUST_LOG`. `log` records emitted by this crate are routed through it.
#[cfg(feature = "tracing")]
pub fn init_tracing() -> Result<(), DataLayerError> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::from_default_env();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| DataLayerError::Tracing(err.to_string()))?;

    tracing::info!("Tracing initialized");
    Ok(())
}
