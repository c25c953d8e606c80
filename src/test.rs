#![cfg(any(test, feature = "test"))]
//! Doubles for the data layer's collaborators. Enabled by the `test` feature so integration tests can use them too.

use std::collections::HashMap;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;

use crate::entry::DurableEntry;
use crate::error::ErrorReport;
use crate::error::RemoteError;
use crate::error::StoreError;
use crate::traits::DurableStore;
use crate::traits::ErrorSink;
use crate::traits::RemoteService;

/// In-memory [`RemoteService`] with scriptable transient failures and latency.
#[derive(Debug, Default)]
pub struct MockRemote {
    collections: Mutex<HashMap<String, Vec<Value>>>,
    // Number of upcoming calls that fail with a transient error.
    failures:    AtomicU32,
    calls:       AtomicU32,
    latency:     Mutex<Duration>,
    journal:     Mutex<Vec<String>>,
}

impl MockRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection<S: ToString>(self, name: S, rows: Vec<Value>) -> Self {
        self.collections.lock().insert(name.to_string(), rows);
        self
    }

    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Completed calls in completion order, e.g. `"insert(items, 3)"`.
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    pub fn rows(&self, collection: &str) -> Vec<Value> {
        self.collections.lock().get(collection).cloned().unwrap_or_default()
    }

    async fn enter(&self, call: &str) -> Result<(), RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RemoteError::transient(format!("{call}: connection reset")));
        }
        Ok(())
    }

    fn record(&self, call: String) {
        self.journal.lock().push(call);
    }

    fn id_of(row: &Value) -> Option<String> {
        match row.get("id")? {
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    fn id_matches(row: &Value, id: &str) -> bool {
        Self::id_of(row).is_some_and(|own| own == id)
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn query(&self, collection: &str) -> Result<Vec<Value>, RemoteError> {
        self.enter("query").await?;
        self.record(format!("query({collection})"));
        Ok(self.rows(collection))
    }

    async fn query_one(&self, collection: &str, id: &str) -> Result<Value, RemoteError> {
        self.enter("query_one").await?;
        self.record(format!("query_one({collection}, {id})"));
        self.rows(collection)
            .into_iter()
            .find(|row| Self::id_matches(row, id))
            .ok_or_else(|| RemoteError::rejected(format!("{collection}/{id} not found")))
    }

    async fn insert(&self, collection: &str, record: Value) -> Result<Value, RemoteError> {
        self.enter("insert").await?;
        let Value::Object(mut record) = record
        else {
            return Err(RemoteError::rejected("record must be an object"));
        };
        let record = {
            let mut collections = self.collections.lock();
            let rows = collections.entry(collection.to_string()).or_default();
            if !record.contains_key("id") {
                // Numeric ids continue after the highest one in the collection.
                let next = rows.iter().filter_map(|row| row.get("id")?.as_u64()).max().unwrap_or(0) + 1;
                record.insert("id".into(), Value::from(next));
            }
            let record = Value::Object(record);
            rows.push(record.clone());
            record
        };
        self.record(format!("insert({collection}, {})", Self::id_of(&record).unwrap_or_default()));
        Ok(record)
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<Value, RemoteError> {
        self.enter("update").await?;
        let Value::Object(patch) = patch
        else {
            return Err(RemoteError::rejected("patch must be an object"));
        };
        let updated = {
            let mut collections = self.collections.lock();
            let row = collections
                .get_mut(collection)
                .and_then(|rows| rows.iter_mut().find(|row| Self::id_matches(row, id)))
                .ok_or_else(|| RemoteError::rejected(format!("{collection}/{id} not found")))?;
            if let Value::Object(fields) = row {
                fields.extend(patch);
            }
            row.clone()
        };
        self.record(format!("update({collection}, {id})"));
        Ok(updated)
    }
}

/// Keeps every report it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<ErrorReport>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().clone()
    }
}

impl ErrorSink for RecordingSink {
    fn report(&self, report: &ErrorReport) {
        self.reports.lock().push(report.clone());
    }
}

/// A durable store whose backing storage is gone.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrokenStore;

impl BrokenStore {
    fn err() -> StoreError {
        StoreError::Unavailable("storage quota exceeded".into())
    }
}

#[async_trait]
impl DurableStore for BrokenStore {
    async fn put(&self, _entry: &DurableEntry) -> Result<(), StoreError> {
        Err(Self::err())
    }

    async fn get(&self, _key: &str) -> Result<Option<DurableEntry>, StoreError> {
        Err(Self::err())
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(Self::err())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        Err(Self::err())
    }

    async fn iterate_by_timestamp_ascending(
        &self,
        _upper_bound: DateTime<Utc>,
    ) -> Result<Vec<DurableEntry>, StoreError> {
        Err(Self::err())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Err(Self::err())
    }
}
