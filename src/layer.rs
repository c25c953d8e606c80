//! What the view layer talks to.
//!
//! [`DataLayer`] wires together one orchestrator (and through it one cache), one state store and a remote service.
//! Loaded data is pushed into the store; renderers subscribe to store slots and never call the remote service
//! themselves.

use std::sync::Arc;

use serde_json::json;
use serde_json::Value;

use crate::config::LayerConfig;
use crate::config::StoreConfig;
use crate::error::DataLayerError;
use crate::error::Result;
use crate::orchestrator::DataOrchestrator;
use crate::session::SessionSnapshot;
use crate::store::StateStore;
use crate::store::SubscriptionHandle;
use crate::traits::RemoteService;
use crate::types::Document;
use crate::types::ExecOptions;
use crate::types::Outcome;
use crate::types::Tier;

pub const LOADING_SLOT: &str = "loading";
pub const ERROR_SLOT: &str = "error";
pub const SESSION_KEY: &str = "session";

pub struct DataLayer<R: RemoteService> {
    remote:       Arc<R>,
    orchestrator: Arc<DataOrchestrator>,
    store:        StateStore,
    config:       LayerConfig,
}

impl<R: RemoteService> DataLayer<R> {
    /// Builds a layer with a fresh store in the [initial shape](Self::initial_state).
    pub fn new(remote: Arc<R>, orchestrator: Arc<DataOrchestrator>, config: LayerConfig) -> Self {
        let store = StateStore::new(Self::initial_state(&config), StoreConfig::new());
        Self::with_store(remote, orchestrator, store, config)
    }

    pub fn with_store(
        remote: Arc<R>,
        orchestrator: Arc<DataOrchestrator>,
        store: StateStore,
        config: LayerConfig,
    ) -> Self {
        Self {
            remote,
            orchestrator,
            store,
            config,
        }
    }

    /// `{ <collection>: [], <entity>: null, filters: {}, cart: [], loading: false, error: null }`
    pub fn initial_state(config: &LayerConfig) -> Document {
        let mut state = Document::new();
        state.insert(config.collection_slot().clone(), json!([]));
        state.insert(config.entity_slot().clone(), Value::Null);
        state.insert(SessionSnapshot::FILTERS_SLOT.to_string(), json!({}));
        state.insert(SessionSnapshot::CART_SLOT.to_string(), json!([]));
        state.insert(LOADING_SLOT.to_string(), Value::Bool(false));
        state.insert(ERROR_SLOT.to_string(), Value::Null);
        state
    }

    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    pub fn orchestrator(&self) -> &Arc<DataOrchestrator> {
        &self.orchestrator
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    fn entity_key(&self, id: &str) -> String {
        format!("{}:{id}", self.config.collection())
    }

    fn read_options(&self, tier: Tier, ttl: std::time::Duration) -> ExecOptions {
        ExecOptions::new()
            .with_tier(tier)
            .with_ttl(ttl)
            .with_retries(self.config.retries())
    }

    fn begin(&self, source: &str) {
        let mut patch = Document::new();
        patch.insert(LOADING_SLOT.to_string(), Value::Bool(true));
        patch.insert(ERROR_SLOT.to_string(), Value::Null);
        self.store.set_state(patch, source);
    }

    // Ends a load: on success `slot` receives the data, on failure the error slot gets `{ code, message }`.
    fn finish<T>(&self, source: &str, slot: Option<&str>, outcome: &Outcome<T>, data: impl FnOnce(&T) -> Value) {
        let mut patch = Document::new();
        patch.insert(LOADING_SLOT.to_string(), Value::Bool(false));
        match outcome {
            Ok(fetched) => {
                if let Some(slot) = slot {
                    patch.insert(slot.to_string(), data(&fetched.data));
                }
            }
            Err(err) => {
                patch.insert(ERROR_SLOT.to_string(), Self::describe(err));
            }
        }
        self.store.set_state(patch, source);
    }

    fn describe(err: &DataLayerError) -> Value {
        json!({ "code": err.code(), "message": err.to_string() })
    }

    /// Loads the whole collection through the durable tier and publishes it in the collection slot.
    pub async fn load_collection(&self) -> Outcome<Vec<Value>> {
        let collection = self.config.collection().as_str();
        let remote = self.remote.as_ref();
        self.begin("load_collection");

        let outcome = self
            .orchestrator
            .execute(
                || remote.query(collection),
                Some(collection),
                self.read_options(Tier::Durable, self.config.collection_ttl()),
            )
            .await;

        self.finish(
            "load_collection",
            Some(self.config.collection_slot().as_str()),
            &outcome,
            |rows| Value::Array(rows.clone()),
        );
        outcome
    }

    /// Loads one record through the fast tier and publishes it in the entity slot.
    pub async fn load_entity(&self, id: &str) -> Outcome<Value> {
        let collection = self.config.collection().as_str();
        let remote = self.remote.as_ref();
        let key = self.entity_key(id);
        self.begin("load_entity");

        let outcome = self
            .orchestrator
            .execute(
                || remote.query_one(collection, id),
                Some(&key),
                self.read_options(Tier::Fast, self.config.entity_ttl()),
            )
            .await;

        self.finish("load_entity", Some(self.config.entity_slot().as_str()), &outcome, Value::clone);
        outcome
    }

    /// Queues an insert. On success the collection and every cached record of it are invalidated.
    pub async fn create_entity(&self, record: Value) -> Outcome<Value> {
        let remote = self.remote.clone();
        let collection = self.config.collection().clone();

        let outcome = self
            .orchestrator
            .write(
                {
                    let collection = collection.clone();
                    move || {
                        let remote = remote.clone();
                        let collection = collection.clone();
                        let record = record.clone();
                        async move { remote.insert(&collection, record).await }
                    }
                },
                ExecOptions::no_cache().with_retries(self.config.retries()),
            )
            .await;

        self.after_write("create_entity", &collection, &outcome).await;
        outcome
    }

    /// Queues an update of record `id` with `patch`. On success the collection family is invalidated.
    pub async fn update_entity(&self, id: &str, patch: Value) -> Outcome<Value> {
        let remote = self.remote.clone();
        let collection = self.config.collection().clone();
        let id = id.to_string();

        let outcome = self
            .orchestrator
            .write(
                {
                    let collection = collection.clone();
                    move || {
                        let remote = remote.clone();
                        let collection = collection.clone();
                        let id = id.clone();
                        let patch = patch.clone();
                        async move { remote.update(&collection, &id, patch).await }
                    }
                },
                ExecOptions::no_cache().with_retries(self.config.retries()),
            )
            .await;

        self.after_write("update_entity", &collection, &outcome).await;
        outcome
    }

    async fn after_write(&self, source: &str, collection: &str, outcome: &Outcome<Value>) {
        match outcome {
            Ok(_) => {
                self.orchestrator.invalidate(collection).await;
            }
            Err(err) => {
                let mut patch = Document::new();
                patch.insert(ERROR_SLOT.to_string(), Self::describe(err));
                self.store.set_state(patch, source);
            }
        }
    }

    pub fn subscribe<F>(&self, slot: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Value, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.store.subscribe(slot, callback)
    }

    pub fn get_state(&self, slot: Option<&str>) -> Value {
        self.store.get_state(slot)
    }

    /// Sets `filters.<name>`. A dotted `name` addresses a nested filter.
    pub fn set_filter(&self, name: &str, value: Value) -> Result<Document> {
        self.store
            .update_nested_state(&format!("{}.{name}", SessionSnapshot::FILTERS_SLOT), value, "set_filter")
    }

    pub fn undo(&self) -> bool {
        self.store.undo()
    }

    /// Saves filters and cart into the durable tier. Returns `false` if there is no working durable tier.
    pub async fn persist_session(&self) -> Result<bool> {
        let snapshot = SessionSnapshot::capture(&self.store);
        let value = serde_json::to_value(&snapshot)?;
        Ok(self
            .orchestrator
            .cache()
            .set(SESSION_KEY, value, self.config.session_max_age(), Tier::Durable)
            .await)
    }

    /// Puts a previously persisted session back into the store.
    ///
    /// A missing, unreadable or too old snapshot is treated as absent and `None` is returned; the last two are also
    /// removed from the durable tier.
    pub async fn restore_session(&self) -> Option<SessionSnapshot> {
        let cache = self.orchestrator.cache();
        let stored = cache.get(SESSION_KEY, Tier::Durable).await?;

        let snapshot = match serde_json::from_value::<SessionSnapshot>(stored) {
            Ok(snapshot) if snapshot.is_fresh(self.config.session_max_age()) => snapshot,
            Ok(snapshot) => {
                log::info!("[{}] discarding session saved at {}", cache.name(), snapshot.timestamp);
                cache.delete(SESSION_KEY, Tier::Durable).await;
                return None;
            }
            Err(err) => {
                log::warn!("[{}] discarding unreadable session: {err}", cache.name());
                cache.delete(SESSION_KEY, Tier::Durable).await;
                return None;
            }
        };

        let mut patch = Document::new();
        patch.insert(SessionSnapshot::FILTERS_SLOT.to_string(), snapshot.filters.clone());
        patch.insert(SessionSnapshot::CART_SLOT.to_string(), snapshot.cart.clone());
        self.store.set_state(patch, "restore_session");
        Some(snapshot)
    }
}

impl<R: RemoteService> std::fmt::Debug for DataLayer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLayer")
            .field("orchestrator", &self.orchestrator)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
