//! The typed dataframe overlay (spec §4.2): `DataFrameCache` wraps
//! `Cache<TabularCodec>` and adds `append` (merge-on-write) and
//! `get_dataframe` (range filtering) on top of the generic `get`/`update`.
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use tokio::sync::Mutex as AsyncMutex;

use super::codec::Codec;
use super::Cache;
use crate::dataframe::TabularValue;
use crate::error::CacheError;
use crate::key::Key;

/// `process_contents` for tabular blobs: decode the gzip+msgpack payload
/// and report its deep memory footprint (`TabularValue::memory_usage`).
pub struct TabularCodec;

impl Codec for TabularCodec {
    type Value = TabularValue;

    const SUFFIX: &'static str = ".df";

    fn decode(bytes: &[u8]) -> Result<(Self::Value, usize), CacheError> {
        let value = TabularValue::decode(bytes)?;
        let size = value.memory_usage();
        Ok((value, size))
    }

    fn encode(value: &Self::Value) -> Result<Vec<u8>, CacheError> {
        value.encode()
    }
}

/// Per-key append serialization (spec §4.2, §9 "Per-key dataframe mutex
/// lifetime"): materialized lazily and held only by weak reference so an
/// unused key's lock does not linger after its last caller releases it.
struct AppendLocks {
    locks: scc::HashMap<Key, Weak<AsyncMutex<()>>>,
}

impl AppendLocks {
    fn new() -> Self {
        Self { locks: scc::HashMap::new() }
    }

    /// Returns the mutex for `key`, creating it if absent or if the
    /// previous holder has already dropped it.
    async fn acquire(&self, key: &Key) -> Arc<AsyncMutex<()>> {
        loop {
            if let Some(weak) = self.locks.read(key, |_, weak| weak.clone()) {
                if let Some(strong) = weak.upgrade() {
                    return strong;
                }
                let _ = self.locks.remove(key);
                continue;
            }
            let strong = Arc::new(AsyncMutex::new(()));
            match self.locks.insert(key.clone(), Arc::downgrade(&strong)) {
                Ok(()) => return strong,
                Err(_) => continue, // another caller materialized it first
            }
        }
    }
}

/// Specializes `Cache` for tabular blobs (spec §4.2).
pub struct DataFrameCache {
    cache: Cache<TabularCodec>,
    append_locks: AppendLocks,
}

impl DataFrameCache {
    pub fn new(root: impl Into<PathBuf>, max_memory_bytes: usize) -> Self {
        Self { cache: Cache::new(root, max_memory_bytes), append_locks: AppendLocks::new() }
    }

    pub fn root_path(&self) -> &std::path::Path {
        self.cache.root_path()
    }

    pub fn max_memory_bytes(&self) -> usize {
        self.cache.max_memory_bytes()
    }

    pub fn current_memory_bytes(&self) -> usize {
        self.cache.current_memory_bytes()
    }

    pub fn loaded_keys(&self) -> Vec<(Key, usize)> {
        self.cache.loaded_keys()
    }

    pub fn path_for(&self, key: &Key) -> PathBuf {
        self.cache.path_for(key)
    }

    pub async fn get(&self, key: &Key) -> Result<Arc<TabularValue>, CacheError> {
        self.cache.get(key).await
    }

    pub async fn update(&self, key: &Key, encoded: Vec<u8>) -> Result<bool, CacheError> {
        self.cache.update(key, encoded).await
    }

    pub fn unload(&self, key: &Key) {
        self.cache.unload(key)
    }

    /// Retrieves the cached tabular value and applies the `df:filter` range
    /// (spec §4.2, `get_dataframe`). `NotFound` is treated as "absent"
    /// rather than an error, matching `df:filter`'s zero-length-body
    /// contract for a missing key (spec §6).
    pub async fn get_dataframe(
        &self,
        key: &Key,
        range_start: Option<i64>,
        range_end: Option<i64>,
        range_type: Option<&str>,
    ) -> Result<Option<TabularValue>, CacheError> {
        match self.cache.get(key).await {
            Ok(value) => Ok(Some(value.range(range_start, range_end, range_type))),
            Err(CacheError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Merges `incremental` into the cached value for `key`, sorting by
    /// index and keeping the first occurrence on duplicate indices (spec
    /// §4.2, `append`). Retries when a concurrent writer wins admission:
    /// `applied = false` is flow control, not an error (spec §9).
    pub async fn append(&self, key: &Key, incremental: TabularValue) -> Result<TabularValue, CacheError> {
        let lock = self.append_locks.acquire(key).await;
        let _guard = lock.lock().await;

        loop {
            let current = match self.cache.get(key).await {
                Ok(value) => (*value).clone(),
                Err(CacheError::NotFound(_)) => TabularValue::empty(),
                Err(e) => return Err(e),
            };
            let merged = current.merge(incremental.clone());
            let encoded = TabularCodec::encode(&merged)?;
            if self.cache.update(key, encoded).await? {
                return Ok(merged);
            }
            // A concurrent writer's bytes landed first; retry from the top
            // so the merge subsumes them (spec §4.2, step 4).
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map as JsonMap;
    use tempfile::tempdir;

    fn key(s: &str) -> Key {
        Key::new(vec![s.to_string()]).unwrap()
    }

    fn rows(indices: impl IntoIterator<Item = i64>) -> TabularValue {
        TabularValue {
            rows: indices.into_iter().map(|index| crate::dataframe::Row { index, columns: JsonMap::new() }).collect(),
        }
    }

    #[tokio::test]
    async fn append_merges_sorts_and_dedupes() {
        let dir = tempdir().unwrap();
        let cache = DataFrameCache::new(dir.path(), 1 << 20);
        let key = key("series");

        cache.append(&key, rows(1..=5)).await.unwrap();
        let merged = cache.append(&key, rows(4..=8)).await.unwrap();

        let indices: Vec<i64> = merged.rows.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let dir = tempdir().unwrap();
        let cache = DataFrameCache::new(dir.path(), 1 << 20);
        let key = key("series");

        let once = cache.append(&key, rows(1..=3)).await.unwrap();
        let twice = cache.append(&key, rows(1..=3)).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn get_dataframe_missing_key_is_none() {
        let dir = tempdir().unwrap();
        let cache = DataFrameCache::new(dir.path(), 1 << 20);
        let result = cache.get_dataframe(&key("nope"), None, None, None).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn get_dataframe_filters_by_timestamp_range() {
        let dir = tempdir().unwrap();
        let cache = DataFrameCache::new(dir.path(), 1 << 20);
        let key = key("series");
        cache.append(&key, rows(1..=8)).await.unwrap();

        let filtered = cache.get_dataframe(&key, Some(3), Some(5), Some("timestamp")).await.unwrap().unwrap();
        let indices: Vec<i64> = filtered.rows.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn concurrent_appends_include_every_row() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(DataFrameCache::new(dir.path(), 1 << 20));
        let key = key("series");

        let mut handles = Vec::new();
        for batch in 0..4 {
            let cache = cache.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let start = batch * 10;
                cache.append(&key, rows(start..start + 10)).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let final_value = cache.get(&key).await.unwrap();
        assert_eq!(final_value.len(), 40);
        let mut indices: Vec<i64> = final_value.rows.iter().map(|r| r.index).collect();
        let sorted = {
            let mut s = indices.clone();
            s.sort();
            s
        };
        indices.sort();
        assert_eq!(indices, sorted);
    }
}
