use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use serde_json::Value;

use crate::entry::DurableEntry;
use crate::error::ErrorReport;
use crate::error::RemoteError;
use crate::error::StoreError;

/// The remote record service the orchestrator shields callers from. Any backing store implementing it is
/// pluggable.
#[async_trait]
pub trait RemoteService: Send + Sync + 'static {
    async fn query(&self, collection: &str) -> Result<Vec<Value>, RemoteError>;
    async fn query_one(&self, collection: &str, id: &str) -> Result<Value, RemoteError>;
    async fn insert(&self, collection: &str, record: Value) -> Result<Value, RemoteError>;
    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<Value, RemoteError>;
}

/// Backend of the durable cache tier.
///
/// Implementations must keep a secondary ordering by `created_at` so that
/// [`iterate_by_timestamp_ascending()`](Self::iterate_by_timestamp_ascending) doesn't need a full scan-and-sort.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Insert or replace. Replacing drops the old timestamp index record.
    async fn put(&self, entry: &DurableEntry) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<DurableEntry>, StoreError>;
    /// Returns `true` if there was something to delete.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
    /// Entries with `created_at <= upper_bound`, oldest first.
    async fn iterate_by_timestamp_ascending(&self, upper_bound: DateTime<Utc>)
        -> Result<Vec<DurableEntry>, StoreError>;
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for key in self.keys().await?.into_iter().filter(|k| k.starts_with(prefix)) {
            if self.delete(&key).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

/// Where orchestrator failures end up after the retry budget is spent.
pub trait ErrorSink: Send + Sync + 'static {
    fn report(&self, report: &ErrorReport);
}

/// Default sink. Sends everything to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, report: &ErrorReport) {
        log::error!("[{}] {} ({})", report.code, report.message, report.context);
    }
}
