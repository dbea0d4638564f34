//! The bounded-memory file cache (spec §4.1).
//!
//! `Cache<C>` is the generic core shared by the opaque file cache and the
//! tabular overlay; `C: Codec` supplies the one thing the original's
//! `PandasDataFrameCache` subclass overrode (`process_contents`). Rust has
//! no subclassing, so the split is a generic parameter instead: `FileCache`
//! is `Cache<OpaqueCodec>`, `DataFrameCache` wraps `Cache<TabularCodec>`.
pub mod codec;
pub mod dataframe;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

pub use codec::{Codec, OpaqueCodec};

use crate::error::CacheError;
use crate::future::{pending, ValueFuture};
use crate::key::Key;

/// The three states a [`CacheEntry`] can be in (spec §3).
///
/// `Loading` and `Writing` both denote a provisional reservation whose
/// `size_bytes` is a claim pending reconciliation once the producer
/// publishes; they are treated identically by admission and eviction.
/// `Writing` additionally means an older resident value for this key has
/// already been superseded in `entries` — a reader landing on it is routed
/// to the write future instead of stale bytes (spec §5, "once a reader has
/// observed a write's result, subsequent `get`s never return an earlier
/// value").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Loading,
    Resident,
    Writing,
}

struct CacheEntry<V> {
    state: EntryState,
    size_bytes: usize,
    value: ValueFuture<V>,
    last_access_ns: u64,
}

struct CacheState<V> {
    entries: HashMap<Key, CacheEntry<V>>,
    access_index: BinaryHeap<Reverse<(u64, Key)>>,
    current_memory_bytes: usize,
    write_futures: HashMap<Key, ValueFuture<V>>,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            access_index: BinaryHeap::new(),
            current_memory_bytes: 0,
            write_futures: HashMap::new(),
        }
    }

    /// Marks `key` as just-touched: records the timestamp on the entry (if
    /// resident) and pushes a fresh heap marker. Stale markers left behind
    /// by earlier touches are discarded lazily by [`pop_oldest_resident`].
    fn touch(&mut self, key: &Key, now: u64) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_access_ns = now;
        }
        self.access_index.push(Reverse((now, key.clone())));
    }

    /// Pops the least-recently-used *resident* key, skipping stale heap
    /// markers and anything mid-load or mid-write (spec §4.1, "Evicting a
    /// key with an outstanding LOADING future is not allowed").
    fn pop_oldest_resident(&mut self) -> Option<Key> {
        while let Some(Reverse((ts, key))) = self.access_index.pop() {
            let is_current_marker = matches!(
                self.entries.get(&key),
                Some(entry) if entry.state == EntryState::Resident && entry.last_access_ns == ts
            );
            if is_current_marker {
                return Some(key);
            }
        }
        None
    }

    /// Evicts resident entries until `claim` more bytes fit under `max`.
    /// Invoked under the cache lock; never touches disk.
    fn admit(&mut self, claim: usize, max_memory_bytes: usize) -> Result<(), CacheError> {
        if claim > max_memory_bytes {
            return Err(CacheError::OverBudget { claim, max: max_memory_bytes });
        }
        while self.current_memory_bytes + claim > max_memory_bytes {
            match self.pop_oldest_resident() {
                Some(key) => {
                    if let Some(entry) = self.entries.remove(&key) {
                        self.current_memory_bytes -= entry.size_bytes;
                    }
                }
                None => return Err(CacheError::OverBudget { claim, max: max_memory_bytes }),
            }
        }
        self.current_memory_bytes += claim;
        Ok(())
    }
}

/// The bounded-memory blob cache, generic over a [`Codec`] that decides how
/// raw bytes become the in-memory value and how much memory that value
/// costs (spec §4.1, `process_contents`).
pub struct Cache<C: Codec> {
    root: PathBuf,
    max_memory_bytes: usize,
    state: Mutex<CacheState<C::Value>>,
    clock: AtomicU64,
    _codec: std::marker::PhantomData<C>,
}

/// The opaque blob cache (spec §4.1). `FileCache` is a type alias rather
/// than a distinct type: the generic `Cache<OpaqueCodec>` already *is* the
/// base behavior the tabular overlay specializes.
pub type FileCache = Cache<OpaqueCodec>;

impl<C: Codec> Cache<C> {
    pub fn new(root: impl Into<PathBuf>, max_memory_bytes: usize) -> Self {
        Self {
            root: root.into(),
            max_memory_bytes,
            state: Mutex::new(CacheState::new()),
            clock: AtomicU64::new(0),
            _codec: std::marker::PhantomData,
        }
    }

    pub fn root_path(&self) -> &std::path::Path {
        &self.root
    }

    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_bytes
    }

    pub fn current_memory_bytes(&self) -> usize {
        self.state.lock().current_memory_bytes
    }

    /// Per-key resident sizes, for `stats` at `level >= 1` (spec §6).
    pub fn loaded_keys(&self) -> Vec<(Key, usize)> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.state == EntryState::Resident)
            .map(|(key, entry)| (key.clone(), entry.size_bytes))
            .collect()
    }

    fn next_timestamp(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Maps a key to its on-disk path, applying the codec's namespace
    /// suffix to the final path segment only (spec §6, "Filesystem layout";
    /// `SPEC_FULL.md` §6, the suffix decision).
    pub fn path_for(&self, key: &Key) -> PathBuf {
        let segments = key.segments();
        let mut path = self.root.clone();
        for (i, segment) in segments.iter().enumerate() {
            if i + 1 == segments.len() {
                path.push(format!("{segment}{}", C::SUFFIX));
            } else {
                path.push(segment);
            }
        }
        path
    }

    /// Retrieves the decoded value for `key`, loading it from disk on a
    /// cold miss (spec §4.1, `get`).
    pub async fn get(&self, key: &Key) -> Result<Arc<C::Value>, CacheError> {
        let now = self.next_timestamp();
        let waiting = {
            let mut state = self.state.lock();
            match state.entries.get(key) {
                Some(entry) if matches!(entry.state, EntryState::Resident | EntryState::Loading) => {
                    let fut = entry.value.clone();
                    state.touch(key, now);
                    Some(fut)
                }
                _ => state.write_futures.get(key).cloned(),
            }
        };
        if let Some(fut) = waiting {
            return fut.await.map_err(|e| (*e).clone());
        }

        let path = self.path_for(key);
        let stat_path = path.clone();
        let size = tokio::task::spawn_blocking(move || std::fs::metadata(&stat_path))
            .await
            .expect("blocking stat task panicked")
            .map_err(|_| CacheError::NotFound(key.clone()))?
            .len() as usize;
        if size > self.max_memory_bytes {
            return Err(CacheError::OverBudget { claim: size, max: self.max_memory_bytes });
        }

        let (tx, value_future) = pending::<C::Value>();
        {
            let mut state = self.state.lock();
            // Someone may have raced us between the lookup above and now.
            match state.entries.get(key) {
                Some(entry) if matches!(entry.state, EntryState::Resident | EntryState::Loading) => {
                    let fut = entry.value.clone();
                    state.touch(key, now);
                    return fut.await.map_err(|e| (*e).clone());
                }
                _ => {
                    if let Some(fut) = state.write_futures.get(key).cloned() {
                        drop(state);
                        return fut.await.map_err(|e| (*e).clone());
                    }
                }
            }
            state.admit(size, self.max_memory_bytes)?;
            state.entries.insert(
                key.clone(),
                CacheEntry { state: EntryState::Loading, size_bytes: size, value: value_future.clone(), last_access_ns: now },
            );
        }

        let read_path = path;
        let key_for_load = key.clone();
        let decoded = tokio::task::spawn_blocking(move || {
            std::fs::read(&read_path)
                .map_err(|e| format!("{e}"))
                .and_then(|bytes| C::decode(&bytes).map_err(|e| e.to_string()))
        })
        .await
        .expect("blocking load task panicked");

        match decoded {
            Ok((value, mem_bytes)) => {
                let value = Arc::new(value);
                let publish_ts = self.next_timestamp();
                {
                    let mut state = self.state.lock();
                    if let Some(entry) = state.entries.get_mut(key) {
                        let claim = entry.size_bytes;
                        entry.size_bytes = mem_bytes;
                        entry.state = EntryState::Resident;
                        entry.last_access_ns = publish_ts;
                        state.current_memory_bytes = state.current_memory_bytes - claim + mem_bytes;
                    }
                    state.touch(key, publish_ts);
                }
                let _ = tx.send(Ok(value.clone()));
                Ok(value)
            }
            Err(message) => {
                let err = Arc::new(CacheError::LoadError { key: key_for_load.clone(), message });
                {
                    let mut state = self.state.lock();
                    if let Some(entry) = state.entries.remove(key) {
                        state.current_memory_bytes -= entry.size_bytes;
                    }
                }
                error!(key = %key_for_load, "load failed");
                let _ = tx.send(Err(err.clone()));
                Err((*err).clone())
            }
        }
    }

    /// Persists `new_bytes` for `key`, coalescing concurrent writers (spec
    /// §4.1, `update`). Returns `true` iff this call's bytes were the ones
    /// durably written.
    pub async fn update(&self, key: &Key, new_bytes: Vec<u8>) -> Result<bool, CacheError> {
        let claim = new_bytes.len();
        if claim > self.max_memory_bytes {
            return Err(CacheError::OverBudget { claim, max: self.max_memory_bytes });
        }

        enum Action<V> {
            Deduped(ValueFuture<V>),
            Apply { tx: crate::future::ValueSender<V>, fut: ValueFuture<V> },
        }

        let action = {
            let mut state = self.state.lock();
            if let Some(existing) = state.write_futures.get(key) {
                Action::Deduped(existing.clone())
            } else {
                state.admit(claim, self.max_memory_bytes)?;
                if let Some(old) = state.entries.remove(key) {
                    state.current_memory_bytes -= old.size_bytes;
                }
                let (tx, fut) = pending::<C::Value>();
                state.write_futures.insert(key.clone(), fut.clone());
                state.entries.insert(
                    key.clone(),
                    CacheEntry { state: EntryState::Writing, size_bytes: claim, value: fut.clone(), last_access_ns: 0 },
                );
                Action::Apply { tx, fut }
            }
        };

        match action {
            Action::Deduped(fut) => {
                fut.await.map_err(|e| (*e).clone())?;
                Ok(false)
            }
            Action::Apply { tx, fut } => {
                let path = self.path_for(key);
                let write_bytes = new_bytes.clone();
                let write_result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    let mut file = std::fs::File::create(&path)?;
                    file.write_all(&write_bytes)?;
                    file.sync_all()
                })
                .await
                .expect("blocking write task panicked");

                let outcome = write_result
                    .map_err(|e| format!("{e}"))
                    .and_then(|()| C::decode(&new_bytes).map_err(|e| e.to_string()));

                match outcome {
                    Ok((value, mem_bytes)) => {
                        let value = Arc::new(value);
                        let now = self.next_timestamp();
                        {
                            let mut state = self.state.lock();
                            if let Some(entry) = state.entries.get_mut(key) {
                                let reserved = entry.size_bytes;
                                entry.size_bytes = mem_bytes;
                                entry.state = EntryState::Resident;
                                entry.value = fut.clone();
                                entry.last_access_ns = now;
                                state.current_memory_bytes = state.current_memory_bytes - reserved + mem_bytes;
                            }
                            state.touch(key, now);
                            state.write_futures.remove(key);
                        }
                        let _ = tx.send(Ok(value));
                        Ok(true)
                    }
                    Err(message) => {
                        let err = Arc::new(CacheError::WriteError { key: key.clone(), message });
                        {
                            // Open question resolved in SPEC_FULL.md: a failed
                            // write drops the entry entirely rather than
                            // restoring the superseded value.
                            let mut state = self.state.lock();
                            if let Some(entry) = state.entries.remove(key) {
                                state.current_memory_bytes -= entry.size_bytes;
                            }
                            state.write_futures.remove(key);
                        }
                        warn!(key = %key, "write failed");
                        let _ = tx.send(Err(err.clone()));
                        Err((*err).clone())
                    }
                }
            }
        }
    }

    /// Drops the in-memory entry for `key`. The on-disk file is untouched;
    /// removing a non-resident key is a no-op (spec §4.1, `unload`).
    pub fn unload(&self, key: &Key) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get(key) {
            if entry.state == EntryState::Resident {
                let size = entry.size_bytes;
                state.entries.remove(key);
                state.current_memory_bytes -= size;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn key(s: &str) -> Key {
        Key::new(vec![s.to_string()]).unwrap()
    }

    #[tokio::test]
    async fn get_fails_on_missing_file() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path(), 1024);
        let err = cache.get(&key("nope")).await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_fails_over_budget() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("big"), vec![0u8; 32]).unwrap();
        let cache = FileCache::new(dir.path(), 16);
        let err = cache.get(&key("big")).await.unwrap_err();
        assert!(matches!(err, CacheError::OverBudget { .. }));
    }

    #[tokio::test]
    async fn update_then_get_round_trips() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path(), 1024);
        let applied = cache.update(&key("a"), b"hello".to_vec()).await.unwrap();
        assert!(applied);
        let value = cache.get(&key("a")).await.unwrap();
        assert_eq!(*value, b"hello".to_vec());
        assert_eq!(std::fs::read(dir.path().join("a")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn unload_does_not_touch_disk() {
        let dir = tempdir().unwrap();
        let cache = FileCache::new(dir.path(), 1024);
        cache.update(&key("a"), b"hello".to_vec()).await.unwrap();
        cache.unload(&key("a"));
        assert_eq!(cache.current_memory_bytes(), 0);
        let value = cache.get(&key("a")).await.unwrap();
        assert_eq!(*value, b"hello".to_vec());
    }

    #[tokio::test]
    async fn eviction_drops_the_oldest_accessed_key() {
        let dir = tempdir().unwrap();
        for name in ["a", "b", "c", "d"] {
            std::fs::write(dir.path().join(name), vec![0u8; 16]).unwrap();
        }
        let cache = FileCache::new(dir.path(), 47);
        cache.get(&key("a")).await.unwrap();
        cache.get(&key("b")).await.unwrap();
        cache.get(&key("c")).await.unwrap();
        cache.get(&key("d")).await.unwrap();

        assert_eq!(cache.current_memory_bytes(), 32);
        let resident: std::collections::HashSet<_> =
            cache.loaded_keys().into_iter().map(|(k, _)| k).collect();
        assert_eq!(resident, [key("c"), key("d")].into_iter().collect());
    }

    #[tokio::test]
    async fn concurrent_get_on_cold_key_loads_once() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"payload".to_vec()).unwrap();
        let cache = Arc::new(FileCache::new(dir.path(), 1024));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get(&key("a")).await.unwrap() }));
        }
        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap());
        }
        for v in &values {
            assert_eq!(***v, *b"payload".to_vec());
        }
        assert_eq!(cache.loaded_keys().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_update_exactly_one_applies() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(FileCache::new(dir.path(), 1024));
        let key = key("a");

        let c1 = cache.clone();
        let k1 = key.clone();
        let c2 = cache.clone();
        let k2 = key.clone();
        let (r1, r2) = tokio::join!(
            tokio::spawn(async move { c1.update(&k1, b"one".to_vec()).await.unwrap() }),
            tokio::spawn(async move { c2.update(&k2, b"two".to_vec()).await.unwrap() }),
        );
        let applied = [r1.unwrap(), r2.unwrap()];
        assert_eq!(applied.iter().filter(|b| **b).count(), 1);
    }
}
