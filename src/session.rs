use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::store::StateStore;

/// The part of the state that outlives a session: `{ filters, cart, timestamp }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub filters:   Value,
    #[serde(default)]
    pub cart:      Value,
    pub timestamp: DateTime<Utc>,
}

impl SessionSnapshot {
    pub const FILTERS_SLOT: &'static str = "filters";
    pub const CART_SLOT: &'static str = "cart";

    pub fn capture(store: &StateStore) -> Self {
        let state = store.snapshot();
        Self {
            filters:   state.get(Self::FILTERS_SLOT).cloned().unwrap_or(Value::Null),
            cart:      state.get(Self::CART_SLOT).cloned().unwrap_or(Value::Null),
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// A snapshot from the future counts as fresh.
    pub fn is_fresh_at(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match (now - self.timestamp).to_std() {
            Ok(age) => age <= max_age,
            Err(_) => true,
        }
    }

    pub fn is_fresh(&self, max_age: Duration) -> bool {
        self.is_fresh_at(Utc::now(), max_age)
    }
}
