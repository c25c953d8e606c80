//! LMDB-backed durable tier.
//!
//! Two databases share one environment:
//!
//! - `entries`: entry key → JSON-encoded [`DurableEntry`]
//! - `by_time`: `[created_at: 8 bytes, big-endian, sign-flipped][entry key]` → empty
//!
//! The second one is what makes [`DurableStore::iterate_by_timestamp_ascending`] a prefix walk instead of a full scan.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use heed::types::Bytes;
use heed::Database;
use heed::Env;
use heed::EnvOpenOptions;

use crate::entry::DurableEntry;
use crate::error::StoreError;
use crate::traits::DurableStore;

const TS_LEN: usize = 8;

/// Durable tier on an LMDB environment.
///
/// LMDB calls block, write transactions on disk I/O in particular. Every operation therefore runs on tokio's
/// blocking pool and the async methods only await its completion.
#[derive(Clone)]
pub struct LmdbStore {
    tables: Arc<Tables>,
}

struct Tables {
    env:     Env,
    entries: Database<Bytes, Bytes>,
    by_time: Database<Bytes, Bytes>,
}

impl LmdbStore {
    /// Opens or creates the store in `path`. `max_size_mb` is the LMDB map size.
    pub fn open<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&path)?;

        // SAFETY: the environment is opened once per store and never from another process with different options.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut wtxn = env.write_txn()?;
        let entries: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some("entries"))?;
        let by_time: Database<Bytes, Bytes> = env.create_database(&mut wtxn, Some("by_time"))?;
        wtxn.commit()?;

        Ok(Self {
            tables: Arc::new(Tables { env, entries, by_time }),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Tables) -> Result<T, StoreError> + Send + 'static,
    {
        let tables = self.tables.clone();
        tokio::task::spawn_blocking(move || op(&tables))
            .await
            .map_err(|e| StoreError::Unavailable(format!("LMDB task failed: {e}")))?
    }
}

impl Tables {
    fn encode_ts(ts: DateTime<Utc>) -> [u8; TS_LEN] {
        // Flipping the sign bit makes byte order match numeric order for negative timestamps too.
        ((ts.timestamp_micros() as u64) ^ (1 << 63)).to_be_bytes()
    }

    fn time_key(entry: &DurableEntry) -> Vec<u8> {
        let mut key = Vec::with_capacity(TS_LEN + entry.key.len());
        key.extend_from_slice(&Self::encode_ts(entry.created_at));
        key.extend_from_slice(entry.key.as_bytes());
        key
    }

    fn encode(entry: &DurableEntry) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(entry).map_err(|e| StoreError::Encode(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<DurableEntry, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()))
    }

    fn put(&self, entry: &DurableEntry) -> Result<(), StoreError> {
        let bytes = Self::encode(entry)?;
        let mut wtxn = self.env.write_txn()?;

        let old = self
            .entries
            .get(&wtxn, entry.key.as_bytes())?
            .map(Self::decode)
            .transpose()?;
        if let Some(old) = old {
            self.by_time.delete(&mut wtxn, &Self::time_key(&old))?;
        }

        self.entries.put(&mut wtxn, entry.key.as_bytes(), &bytes)?;
        self.by_time.put(&mut wtxn, &Self::time_key(entry), b"")?;
        wtxn.commit()?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<DurableEntry>, StoreError> {
        let rtxn = self.env.read_txn()?;
        self.entries.get(&rtxn, key.as_bytes())?.map(Self::decode).transpose()
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut wtxn = self.env.write_txn()?;
        let old = self
            .entries
            .get(&wtxn, key.as_bytes())?
            .map(Self::decode)
            .transpose()?;
        let Some(old) = old
        else {
            return Ok(false);
        };
        self.by_time.delete(&mut wtxn, &Self::time_key(&old))?;
        self.entries.delete(&mut wtxn, key.as_bytes())?;
        wtxn.commit()?;
        Ok(true)
    }

    fn clear(&self) -> Result<(), StoreError> {
        let mut wtxn = self.env.write_txn()?;
        self.entries.clear(&mut wtxn)?;
        self.by_time.clear(&mut wtxn)?;
        wtxn.commit()?;
        Ok(())
    }

    fn older_than(&self, upper_bound: DateTime<Utc>) -> Result<Vec<DurableEntry>, StoreError> {
        let upper = Self::encode_ts(upper_bound);
        let rtxn = self.env.read_txn()?;
        let mut found = Vec::new();

        for item in self.by_time.iter(&rtxn)? {
            let (time_key, _) = item?;
            if time_key.len() < TS_LEN || time_key[..TS_LEN] > upper[..] {
                break;
            }
            let key = &time_key[TS_LEN..];
            if let Some(bytes) = self.entries.get(&rtxn, key)? {
                found.push(Self::decode(bytes)?);
            }
        }

        Ok(found)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let rtxn = self.env.read_txn()?;
        let mut keys = Vec::new();
        for item in self.entries.iter(&rtxn)? {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(key).into_owned());
        }
        Ok(keys)
    }
}

impl std::fmt::Debug for LmdbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LmdbStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl DurableStore for LmdbStore {
    async fn put(&self, entry: &DurableEntry) -> Result<(), StoreError> {
        let entry = entry.clone();
        self.blocking(move |tables| tables.put(&entry)).await
    }

    async fn get(&self, key: &str) -> Result<Option<DurableEntry>, StoreError> {
        let key = key.to_string();
        self.blocking(move |tables| tables.get(&key)).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.blocking(move |tables| tables.delete(&key)).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.blocking(|tables| tables.clear()).await
    }

    async fn iterate_by_timestamp_ascending(
        &self,
        upper_bound: DateTime<Utc>,
    ) -> Result<Vec<DurableEntry>, StoreError> {
        self.blocking(move |tables| tables.older_than(upper_bound)).await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.blocking(|tables| tables.keys()).await
    }
}
