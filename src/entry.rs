use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

/// A fast-tier record. Never mutated: replacing a key produces a new entry with a fresh timestamp.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    key:        String,
    value:      Value,
    created_at: Instant,
    ttl:        Duration,
}

impl CacheEntry {
    pub(crate) fn new(key: String, value: Value, ttl: Duration) -> Self {
        Self {
            key,
            value,
            created_at: Instant::now(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    // Recomputed on every call, never memoized.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.age() < self.ttl
    }
}

/// A durable-tier record. Timestamps are wall clock because entries outlive the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableEntry {
    pub key:        String,
    pub value:      Value,
    pub created_at: DateTime<Utc>,
    pub ttl:        Duration,
}

impl DurableEntry {
    pub fn new<K: Into<String>>(key: K, value: Value, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            created_at: Utc::now(),
            ttl,
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.age_at(now) < self.ttl
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }
}
