//! Observable state document with middleware and bounded undo history.
//!
//! The store owns one [`Document`]: a map of named top-level slots. It never hands out references into it; every
//! read is a deep copy, so nothing outside can mutate the live state except through [`StateStore::set_state()`] and
//! [`StateStore::update_nested_state()`].
//!
//! A committing `set_state` call does the following before it returns:
//!
//! 1. diffs the patch against the current slots; unchanged slots are dropped from the change set,
//! 2. runs every middleware with `(changes, new_state, old_state, source)`,
//! 3. commits and records a [`HistoryEntry`],
//! 4. notifies subscribers of changed slots in registration order with `(new, old)`.
//!
//! Middleware and subscriber failures (errors or panics) are logged and contained; they never cancel the commit or
//! keep other callbacks from running. Callbacks are invoked with no internal lock held and may use the store.

use std::collections::VecDeque;
use std::panic::catch_unwind;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Weak;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use crate::config::StoreConfig;
use crate::error::panic_message;
use crate::error::DataLayerError;
use crate::error::Result;
use crate::types::Document;

/// `(changes, new_state, old_state, source)`
pub type Middleware = dyn Fn(&Document, &Document, &Document, &str) -> anyhow::Result<()> + Send + Sync;
/// `(new_value, old_value)`
pub type Subscriber = dyn Fn(&Value, &Value) -> anyhow::Result<()> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub old_state: Document,
    pub new_state: Document,
    pub source:    String,
}

struct Subscription {
    id:       u64,
    slot:     String,
    callback: Arc<Subscriber>,
}

struct Inner {
    state:       Document,
    subscribers: Vec<Subscription>,
    middleware:  Vec<(u64, Arc<Middleware>)>,
    history:     VecDeque<HistoryEntry>,
    next_id:     u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn subscribers_for(&self, slots: impl Fn(&str) -> bool) -> Vec<(String, Arc<Subscriber>)> {
        self.subscribers
            .iter()
            .filter(|s| slots(s.slot.as_str()))
            .map(|s| (s.slot.clone(), s.callback.clone()))
            .collect()
    }
}

struct Shared {
    max_history: usize,
    inner:       Mutex<Inner>,
}

/// See the [module documentation](self).
#[derive(Clone)]
pub struct StateStore {
    shared: Arc<Shared>,
}

impl StateStore {
    pub fn new(initial: Document, config: StoreConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_history: config.max_history(),
                inner:       Mutex::new(Inner {
                    state:       initial,
                    subscribers: Vec::new(),
                    middleware:  Vec::new(),
                    history:     VecDeque::new(),
                    next_id:     0,
                }),
            }),
        }
    }

    /// Like [`new()`](Self::new) but takes a JSON object literal.
    pub fn from_value(initial: Value, config: StoreConfig) -> Result<Self> {
        Ok(Self::new(Self::expect_object(initial, "initial state")?, config))
    }

    fn expect_object(value: Value, what: &str) -> Result<Document> {
        match value {
            Value::Object(map) => Ok(map),
            other => Err(DataLayerError::validation(format!(
                "{what} must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// The whole document or one slot, always deep-copied. A missing slot reads as `null`.
    pub fn get_state(&self, slot: Option<&str>) -> Value {
        let inner = self.shared.inner.lock();
        match slot {
            Some(slot) => inner.state.get(slot).cloned().unwrap_or(Value::Null),
            None => Value::Object(inner.state.clone()),
        }
    }

    pub fn snapshot(&self) -> Document {
        self.shared.inner.lock().state.clone()
    }

    /// Merges `patch` into the document. Returns the committed state; if no slot actually changes nothing is
    /// committed, no callback runs and no history is recorded.
    pub fn set_state(&self, patch: Document, source: &str) -> Document {
        let (changes, old_state, new_state, middleware) = {
            let inner = self.shared.inner.lock();
            let changes = patch
                .into_iter()
                .filter(|(slot, value)| inner.state.get(slot) != Some(value))
                .collect::<Document>();

            if changes.is_empty() {
                log::trace!("[state] {source}: nothing changed");
                return inner.state.clone();
            }

            let old_state = inner.state.clone();
            let mut new_state = old_state.clone();
            for (slot, value) in &changes {
                new_state.insert(slot.clone(), value.clone());
            }
            let middleware = inner.middleware.iter().map(|(_, m)| m.clone()).collect::<Vec<_>>();
            (changes, old_state, new_state, middleware)
        };

        for (idx, mw) in middleware.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| mw(&changes, &new_state, &old_state, source))) {
                Ok(Ok(())) => (),
                Ok(Err(err)) => {
                    let err = DataLayerError::Middleware(format!("#{idx}: {err:#}"));
                    log::error!("[state] {source}: {err}");
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    let err = DataLayerError::Middleware(format!("#{idx} panicked: {message}"));
                    log::error!("[state] {source}: {err}");
                }
            }
        }

        let (committed, subscribers) = {
            let mut inner = self.shared.inner.lock();
            // Apply the change set rather than `new_state` wholesale: a middleware may have committed on its own.
            for (slot, value) in &changes {
                inner.state.insert(slot.clone(), value.clone());
            }
            let committed = inner.state.clone();
            self.push_history(
                &mut inner,
                HistoryEntry {
                    timestamp: Utc::now(),
                    old_state: old_state.clone(),
                    new_state: committed.clone(),
                    source:    source.to_string(),
                },
            );
            (committed, inner.subscribers_for(|slot| changes.contains_key(slot)))
        };

        log::debug!(
            "[state] {source}: committed {:?}",
            changes.keys().map(String::as_str).collect::<Vec<_>>()
        );

        for (slot, callback) in subscribers {
            let new_value = &changes[&slot];
            let old_value = old_state.get(&slot).unwrap_or(&Value::Null);
            Self::notify(&slot, &callback, new_value, old_value);
        }

        committed
    }

    /// [`set_state()`](Self::set_state) for a patch given as a JSON object.
    pub fn set_state_value(&self, patch: Value, source: &str) -> Result<Document> {
        Ok(self.set_state(Self::expect_object(patch, "state patch")?, source))
    }

    /// Sets the value at a dot-delimited path like `"filters.price.max"`, creating intermediate objects on the way.
    /// A non-object met on the way is replaced with an object. Does nothing if the value is already there.
    pub fn update_nested_state(&self, path: &str, value: Value, source: &str) -> Result<Document> {
        let segments = path.split('.').collect::<Vec<_>>();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(DataLayerError::validation(format!("malformed state path '{path}'")));
        }

        let mut document = self.snapshot();
        if lookup(&document, &segments) == Some(&value) {
            return Ok(document);
        }

        set_path(&mut document, &segments, value);
        Ok(self.set_state(document, source))
    }

    pub fn subscribe<F>(&self, slot: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Value, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner.lock();
        let id = inner.next_id();
        inner.subscribers.push(Subscription {
            id,
            slot: slot.to_string(),
            callback: Arc::new(callback),
        });
        SubscriptionHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn add_middleware<F>(&self, middleware: F) -> MiddlewareHandle
    where
        F: Fn(&Document, &Document, &Document, &str) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut inner = self.shared.inner.lock();
        let id = inner.next_id();
        inner.middleware.push((id, Arc::new(middleware)));
        MiddlewareHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Steps back to the state preceding the last commit. Needs at least two history entries; with fewer it returns
    /// `false` and changes nothing.
    ///
    /// Every subscriber of a slot present in the restored state is notified, changed or not, with the restored
    /// value and the value the slot had before the restored entry was committed.
    pub fn undo(&self) -> bool {
        let (restored, previous_old, subscribers) = {
            let mut inner = self.shared.inner.lock();
            let len = inner.history.len();
            if len < 2 {
                return false;
            }
            let previous = &inner.history[len - 2];
            let restored = previous.new_state.clone();
            let previous_old = previous.old_state.clone();

            inner.state = restored.clone();
            inner.history.pop_back();
            let subscribers = inner.subscribers_for(|slot| restored.contains_key(slot));
            (restored, previous_old, subscribers)
        };

        log::debug!("[state] undo");

        for (slot, callback) in subscribers {
            let old_value = previous_old.get(&slot).unwrap_or(&Value::Null);
            Self::notify(&slot, &callback, &restored[&slot], old_value);
        }

        true
    }

    pub fn history_len(&self) -> usize {
        self.shared.inner.lock().history.len()
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.shared.inner.lock().history.iter().cloned().collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.inner.lock().subscribers.len()
    }

    fn push_history(&self, inner: &mut Inner, entry: HistoryEntry) {
        inner.history.push_back(entry);
        while inner.history.len() > self.shared.max_history {
            inner.history.pop_front();
        }
    }

    fn notify(slot: &str, callback: &Arc<Subscriber>, new_value: &Value, old_value: &Value) {
        let outcome = match catch_unwind(AssertUnwindSafe(|| callback(new_value, old_value))) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        let err = DataLayerError::Subscriber {
            slot:    slot.to_string(),
            message: outcome,
        };
        log::error!("[state] {err}");
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("StateStore")
            .field("slots", &inner.state.keys().collect::<Vec<_>>())
            .field("subscribers", &inner.subscribers.len())
            .field("middleware", &inner.middleware.len())
            .field("history", &inner.history.len())
            .finish()
    }
}

/// Returned by [`StateStore::subscribe()`].
#[derive(Debug)]
pub struct SubscriptionHandle {
    id:     u64,
    shared: Weak<Shared>,
}

impl SubscriptionHandle {
    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(shared) = self.shared.upgrade()
        else {
            return false;
        };
        let mut inner = shared.inner.lock();
        let before = inner.subscribers.len();
        inner.subscribers.retain(|s| s.id != self.id);
        before != inner.subscribers.len()
    }
}

/// Returned by [`StateStore::add_middleware()`].
#[derive(Debug)]
pub struct MiddlewareHandle {
    id:     u64,
    shared: Weak<Shared>,
}

impl MiddlewareHandle {
    pub fn remove(self) -> bool {
        let Some(shared) = self.shared.upgrade()
        else {
            return false;
        };
        let mut inner = shared.inner.lock();
        let before = inner.middleware.len();
        inner.middleware.retain(|(id, _)| *id != self.id);
        before != inner.middleware.len()
    }
}

fn lookup<'a>(document: &'a Document, segments: &[&str]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    rest.iter().try_fold(document.get(*first)?, |value, segment| value.get(*segment))
}

fn set_path(document: &mut Document, segments: &[&str], value: Value) {
    let Some((last, parents)) = segments.split_last()
    else {
        return;
    };

    let mut cursor = document;
    for segment in parents {
        let slot = cursor
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        cursor = match slot {
            Value::Object(map) => map,
            _ => unreachable!("intermediate path segment is always an object here"),
        };
    }
    cursor.insert(last.to_string(), value);
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
