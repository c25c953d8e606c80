use std::collections::BTreeSet;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use parking_lot::RwLock;

use crate::entry::DurableEntry;
use crate::error::StoreError;
use crate::traits::DurableStore;

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, DurableEntry>,
    // (created_at, key) keeps the index unique even when two entries share a timestamp.
    by_time: BTreeSet<(DateTime<Utc>, String)>,
}

/// Volatile [`DurableStore`]. Same indexing as [`LmdbStore`](super::LmdbStore), no persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn put(&self, entry: &DurableEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        if let Some(old) = inner.entries.insert(entry.key.clone(), entry.clone()) {
            inner.by_time.remove(&(old.created_at, old.key));
        }
        inner.by_time.insert((entry.created_at, entry.key.clone()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<DurableEntry>, StoreError> {
        Ok(self.inner.read().entries.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        Ok(if let Some(old) = inner.entries.remove(key) {
            inner.by_time.remove(&(old.created_at, old.key));
            true
        }
        else {
            false
        })
    }

    async fn clear(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.by_time.clear();
        Ok(())
    }

    async fn iterate_by_timestamp_ascending(
        &self,
        upper_bound: DateTime<Utc>,
    ) -> Result<Vec<DurableEntry>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .by_time
            .iter()
            .take_while(|(ts, _)| *ts <= upper_bound)
            .filter_map(|(_, key)| inner.entries.get(key).cloned())
            .collect())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.read().entries.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn entry_at(key: &str, minutes_ago: i64) -> DurableEntry {
        DurableEntry::new(key, json!(key), Duration::from_secs(3600))
            .with_created_at(Utc::now() - chrono::Duration::minutes(minutes_ago))
    }

    #[tokio::test]
    async fn iterates_oldest_first_up_to_the_bound() {
        let store = MemoryStore::new();
        store.put(&entry_at("newest", 1)).await.unwrap();
        store.put(&entry_at("oldest", 30)).await.unwrap();
        store.put(&entry_at("middle", 10)).await.unwrap();

        let bound = Utc::now() - chrono::Duration::minutes(5);
        let keys = store
            .iterate_by_timestamp_ascending(bound)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect::<Vec<_>>();
        assert_eq!(keys, vec!["oldest", "middle"]);
    }

    #[tokio::test]
    async fn replacing_an_entry_reindexes_it() {
        let store = MemoryStore::new();
        store.put(&entry_at("k", 30)).await.unwrap();
        store.put(&entry_at("k", 0)).await.unwrap();

        let bound = Utc::now() - chrono::Duration::minutes(5);
        assert!(store.iterate_by_timestamp_ascending(bound).await.unwrap().is_empty());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn delete_prefix_default_implementation() {
        let store = MemoryStore::new();
        for key in ["items", "items:1", "items:2", "cart"] {
            store.put(&entry_at(key, 0)).await.unwrap();
        }
        assert_eq!(store.delete_prefix("items:").await.unwrap(), 2);
        assert!(store.delete("items").await.unwrap());
        assert!(!store.delete("items").await.unwrap());
        assert_eq!(store.keys().await.unwrap(), vec!["cart".to_string()]);
    }
}
