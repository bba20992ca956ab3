//! Storage facade routing between a cache, backends and listeners.
//!
//! [`LedgerStore`] is the single entry point the rest of the node reads and
//! writes through. Reads consult the cache first, then each backend in
//! registration order, and admit what a backend returned into the cache.
//! Writes go to the cache and then to every backend independently; a
//! failing backend never stops the others from receiving the write.
//! Successful updates are announced to every registered [`ChangeListener`].
//!
//! The registries are fixed at [`LedgerStoreBuilder::build`] time and held
//! in an `ArcSwapOption`, so no call takes a lock. `shutdown` swaps them
//! out; every later call fails with [`StoreError::Closed`].

use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use ledger_core::{Key, ModelKind, Record};

use super::backend::{Entry, StorageBackend};
use super::data_cache::DataCache;
use super::listener::{ChangeListener, CompositeChangeListener};

/// Errors returned by [`LedgerStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("ledger store is shut down")]
    Closed,
    /// A component failed to initialize or shut down.
    #[error("lifecycle failure: {0}")]
    Lifecycle(String),
    /// A backend failed while serving a read.
    #[error("backend #{index} failed")]
    Backend {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
    /// One or more backends failed a write that was still sent to all of
    /// them. `source` is the first failure.
    #[error("{failed} of {attempted} backends failed")]
    FanOut {
        failed: usize,
        attempted: usize,
        #[source]
        source: anyhow::Error,
    },
}

struct Registries {
    cache: Option<Arc<dyn DataCache>>,
    backends: Vec<Arc<dyn StorageBackend>>,
    listeners: CompositeChangeListener,
}

/// Accumulates per-backend outcomes of a fan-out write.
struct FanOut {
    attempted: usize,
    failed: usize,
    first: Option<anyhow::Error>,
}

impl FanOut {
    fn new(attempted: usize) -> Self {
        Self {
            attempted,
            failed: 0,
            first: None,
        }
    }

    fn record<T>(
        &mut self,
        index: usize,
        backend: &dyn StorageBackend,
        op: &'static str,
        result: anyhow::Result<T>,
    ) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(backend = backend.name(), index, op, error = %e, "backend write failed");
                self.failed += 1;
                self.first.get_or_insert(e);
                None
            }
        }
    }

    fn finish(self) -> Result<(), StoreError> {
        match self.first {
            None => Ok(()),
            Some(source) => Err(StoreError::FanOut {
                failed: self.failed,
                attempted: self.attempted,
                source,
            }),
        }
    }
}

/// Unwraps a cache read, logging a failure and answering `T::default()`
/// in its place.
fn cache_answer<T: Default>(op: &'static str, result: anyhow::Result<T>) -> T {
    result.unwrap_or_else(|e| {
        tracing::warn!(op, error = %e, "cache lookup failed");
        T::default()
    })
}

/// Builder for [`LedgerStore`].
#[derive(Default)]
pub struct LedgerStoreBuilder {
    cache: Option<Arc<dyn DataCache>>,
    backends: Vec<Arc<dyn StorageBackend>>,
    listeners: Vec<Arc<dyn ChangeListener>>,
}

impl LedgerStoreBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache. A store has at most one; a second call replaces it.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn DataCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Appends a backend. Registration order is read order.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Appends a change listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn ChangeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    #[must_use]
    pub fn build(self) -> LedgerStore {
        LedgerStore {
            registries: ArcSwapOption::from_pointee(Registries {
                cache: self.cache,
                backends: self.backends,
                listeners: CompositeChangeListener::new(self.listeners),
            }),
        }
    }
}

/// Facade over an optional cache, ordered backends and change listeners.
pub struct LedgerStore {
    registries: ArcSwapOption<Registries>,
}

impl LedgerStore {
    #[must_use]
    pub fn builder() -> LedgerStoreBuilder {
        LedgerStoreBuilder::new()
    }

    /// Whether [`shutdown`](Self::shutdown) has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.registries.load().is_none()
    }

    fn registries(&self) -> Result<Arc<Registries>, StoreError> {
        self.registries.load_full().ok_or(StoreError::Closed)
    }

    // --- Lifecycle ---

    /// Initializes the cache, then every backend in registration order.
    ///
    /// # Errors
    ///
    /// [`StoreError::Lifecycle`] naming the first component that failed;
    /// later components are not initialized.
    pub async fn init(&self) -> Result<(), StoreError> {
        let reg = self.registries()?;
        if let Some(cache) = &reg.cache {
            cache
                .init()
                .await
                .map_err(|e| StoreError::Lifecycle(format!("{}: {e:#}", cache.name())))?;
        }
        for backend in &reg.backends {
            backend
                .init()
                .await
                .map_err(|e| StoreError::Lifecycle(format!("{}: {e:#}", backend.name())))?;
        }
        tracing::info!(
            cache = reg.cache.is_some(),
            backends = reg.backends.len(),
            listeners = reg.listeners.len(),
            "ledger store initialized"
        );
        Ok(())
    }

    /// Flushes the cache, shuts every backend and listener down and drops
    /// the registries.
    ///
    /// Every component is shut down even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// [`StoreError::Closed`] on a second call, or [`StoreError::Lifecycle`]
    /// naming the first component that failed.
    pub async fn shutdown(&self) -> Result<(), StoreError> {
        let reg = self.registries.swap(None).ok_or(StoreError::Closed)?;
        let mut failure: Option<String> = None;

        if let Some(cache) = &reg.cache {
            if let Err(e) = cache.shutdown().await {
                tracing::error!(error = %e, "cache flush on shutdown failed");
                failure.get_or_insert_with(|| format!("{}: {e:#}", cache.name()));
            }
        }
        for backend in &reg.backends {
            if let Err(e) = backend.shutdown().await {
                tracing::error!(backend = backend.name(), error = %e, "backend shutdown failed");
                failure.get_or_insert_with(|| format!("{}: {e:#}", backend.name()));
            }
        }
        reg.listeners.shutdown();
        tracing::info!("ledger store shut down");

        match failure {
            None => Ok(()),
            Some(message) => Err(StoreError::Lifecycle(message)),
        }
    }

    // --- Reads ---

    /// Admits a record found in a backend into the cache.
    fn read_through(reg: &Registries, key: &Key, record: &Record) {
        if let Some(cache) = &reg.cache {
            if cache.add(key, record) {
                tracing::debug!(kind = %record.kind(), key = %key, "admitted on read");
            }
        }
    }

    /// Loads the record stored under `(kind, key)`.
    ///
    /// # Errors
    ///
    /// [`StoreError::Closed`] after shutdown, [`StoreError::Backend`] if a
    /// consulted backend fails.
    pub async fn load(&self, kind: ModelKind, key: &Key) -> Result<Option<Record>, StoreError> {
        let reg = self.registries()?;
        if let Some(cache) = &reg.cache {
            if let Some(record) = cache_answer("get", cache.get(kind, key).await) {
                return Ok(Some(record));
            }
        }
        for (index, backend) in reg.backends.iter().enumerate() {
            let found = backend
                .get(kind, key)
                .await
                .map_err(|source| StoreError::Backend { index, source })?;
            if let Some(record) = found {
                Self::read_through(&reg, key, &record);
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Loads a record by raw key bytes, rebuilding the key from the kind's
    /// key kind.
    ///
    /// # Errors
    ///
    /// As for [`load`](Self::load).
    pub async fn find(&self, kind: ModelKind, raw_key: &[u8]) -> Result<Option<Record>, StoreError> {
        let reg = self.registries()?;
        if let Some(cache) = &reg.cache {
            if let Some(record) = cache_answer("seek", cache.seek(kind, raw_key).await) {
                return Ok(Some(record));
            }
        }
        for (index, backend) in reg.backends.iter().enumerate() {
            let found = backend
                .seek(kind, raw_key)
                .await
                .map_err(|source| StoreError::Backend { index, source })?;
            if let Some(record) = found {
                let key = Key::new(kind.key_kind(), Bytes::copy_from_slice(raw_key));
                Self::read_through(&reg, &key, &record);
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Exact existence check.
    ///
    /// # Errors
    ///
    /// As for [`load`](Self::load).
    pub async fn exists(&self, kind: ModelKind, key: &Key) -> Result<bool, StoreError> {
        let reg = self.registries()?;
        if let Some(cache) = &reg.cache {
            if cache_answer("exists", cache.exists(kind, key).await) {
                return Ok(true);
            }
        }
        for (index, backend) in reg.backends.iter().enumerate() {
            if backend
                .exists(kind, key)
                .await
                .map_err(|source| StoreError::Backend { index, source })?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Probabilistic existence check: `false` is definitive.
    ///
    /// # Errors
    ///
    /// As for [`load`](Self::load).
    pub async fn may_exist(&self, kind: ModelKind, key: &Key) -> Result<bool, StoreError> {
        let reg = self.registries()?;
        if let Some(cache) = &reg.cache {
            if cache_answer("may_exist", cache.may_exist(kind, key).await) {
                return Ok(true);
            }
        }
        for (index, backend) in reg.backends.iter().enumerate() {
            if backend
                .may_exist(kind, key)
                .await
                .map_err(|source| StoreError::Backend { index, source })?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Entry with the smallest key of the table.
    ///
    /// # Errors
    ///
    /// As for [`load`](Self::load).
    pub async fn first(&self, kind: ModelKind) -> Result<Option<Entry>, StoreError> {
        self.neighbor(kind, Neighbor::First).await
    }

    /// Entry with the greatest key of the table.
    ///
    /// # Errors
    ///
    /// As for [`load`](Self::load).
    pub async fn latest(&self, kind: ModelKind) -> Result<Option<Entry>, StoreError> {
        self.neighbor(kind, Neighbor::Latest).await
    }

    /// Entry with the smallest key strictly greater than `key`.
    ///
    /// # Errors
    ///
    /// As for [`load`](Self::load).
    pub async fn next(&self, kind: ModelKind, key: &Key) -> Result<Option<Entry>, StoreError> {
        self.neighbor(kind, Neighbor::Next(key)).await
    }

    /// Entry with the greatest key strictly smaller than `key`.
    ///
    /// # Errors
    ///
    /// As for [`load`](Self::load).
    pub async fn previous(&self, kind: ModelKind, key: &Key) -> Result<Option<Entry>, StoreError> {
        self.neighbor(kind, Neighbor::Previous(key)).await
    }

    async fn neighbor(
        &self,
        kind: ModelKind,
        which: Neighbor<'_>,
    ) -> Result<Option<Entry>, StoreError> {
        let reg = self.registries()?;
        if let Some(cache) = &reg.cache {
            let cached = which.query(cache.as_ref(), kind).await;
            if let Some(entry) = cache_answer("neighbor", cached) {
                return Ok(Some(entry));
            }
        }
        for (index, backend) in reg.backends.iter().enumerate() {
            let found = which
                .query(backend.as_ref(), kind)
                .await
                .map_err(|source| StoreError::Backend { index, source })?;
            if let Some((key, record)) = found {
                Self::read_through(&reg, &key, &record);
                return Ok(Some((key, record)));
            }
        }
        Ok(None)
    }

    /// Number of entries: the cache's count plus every backend's.
    ///
    /// # Errors
    ///
    /// As for [`load`](Self::load).
    pub async fn count(&self, kind: ModelKind) -> Result<u64, StoreError> {
        let reg = self.registries()?;
        let mut total = match &reg.cache {
            Some(cache) => cache_answer("count", cache.count(kind).await),
            None => 0,
        };
        for (index, backend) in reg.backends.iter().enumerate() {
            total += backend
                .count(kind)
                .await
                .map_err(|source| StoreError::Backend { index, source })?;
        }
        Ok(total)
    }

    /// Union of the keys starting with `prefix` across the cache and every
    /// backend. `None` when nothing matches.
    ///
    /// # Errors
    ///
    /// As for [`load`](Self::load).
    pub async fn keys_starting_with(
        &self,
        kind: ModelKind,
        prefix: &[u8],
    ) -> Result<Option<BTreeSet<Key>>, StoreError> {
        let reg = self.registries()?;
        let mut keys = match &reg.cache {
            Some(cache) => cache_answer(
                "keys_starting_with",
                cache.keys_starting_with(kind, prefix).await,
            ),
            None => BTreeSet::new(),
        };
        for (index, backend) in reg.backends.iter().enumerate() {
            keys.extend(
                backend
                    .keys_starting_with(kind, prefix)
                    .await
                    .map_err(|source| StoreError::Backend { index, source })?,
            );
        }
        Ok((!keys.is_empty()).then_some(keys))
    }

    /// Union of every key's bytes across the cache and every backend.
    /// `None` when the table is empty everywhere.
    ///
    /// # Errors
    ///
    /// As for [`load`](Self::load).
    pub async fn load_all_keys(&self, kind: ModelKind) -> Result<Option<Vec<Bytes>>, StoreError> {
        let reg = self.registries()?;
        let mut keys: BTreeSet<Bytes> = match &reg.cache {
            Some(cache) => cache_answer("load_all_keys", cache.load_all_keys(kind).await)
                .into_iter()
                .collect(),
            None => BTreeSet::new(),
        };
        for (index, backend) in reg.backends.iter().enumerate() {
            keys.extend(
                backend
                    .load_all_keys(kind)
                    .await
                    .map_err(|source| StoreError::Backend { index, source })?,
            );
        }
        Ok((!keys.is_empty()).then(|| keys.into_iter().collect()))
    }

    /// Keys of `kind` that have no entry in `referenced`, as reported by
    /// the first backend with a non-empty answer.
    ///
    /// # Errors
    ///
    /// As for [`load`](Self::load).
    pub async fn keys_with_missing_references(
        &self,
        kind: ModelKind,
        referenced: ModelKind,
    ) -> Result<BTreeSet<Key>, StoreError> {
        let reg = self.registries()?;
        for (index, backend) in reg.backends.iter().enumerate() {
            let keys = backend
                .keys_with_missing_references(kind, referenced)
                .await
                .map_err(|source| StoreError::Backend { index, source })?;
            if !keys.is_empty() {
                return Ok(keys);
            }
        }
        Ok(BTreeSet::new())
    }

    // --- Writes ---

    /// Stores a record in the cache and every backend. Listeners are not
    /// notified.
    ///
    /// Returns `true` if any backend accepted the write.
    ///
    /// # Errors
    ///
    /// [`StoreError::FanOut`] if any backend failed (the others still
    /// received the write).
    pub async fn save(&self, record: &Record, key: &Key) -> Result<bool, StoreError> {
        let reg = self.registries()?;
        if let Some(cache) = &reg.cache {
            if let Err(e) = cache.save(record, key).await {
                tracing::warn!(key = %key, error = %e, "cache save failed");
            }
        }
        let mut fan_out = FanOut::new(reg.backends.len());
        let mut accepted = false;
        for (index, backend) in reg.backends.iter().enumerate() {
            let result = backend.save(record, key).await;
            accepted |= fan_out
                .record(index, backend.as_ref(), "save", result)
                .unwrap_or(false);
        }
        fan_out.finish()?;
        Ok(accepted)
    }

    /// Stores several records in the cache and every backend.
    ///
    /// # Errors
    ///
    /// As for [`save`](Self::save).
    pub async fn save_batch(&self, entries: &[Entry]) -> Result<bool, StoreError> {
        let reg = self.registries()?;
        if let Some(cache) = &reg.cache {
            if let Err(e) = cache.save_batch(entries).await {
                tracing::warn!(count = entries.len(), error = %e, "cache batch save failed");
            }
        }
        let mut fan_out = FanOut::new(reg.backends.len());
        let mut accepted = false;
        for (index, backend) in reg.backends.iter().enumerate() {
            let result = backend.save_batch(entries).await;
            accepted |= fan_out
                .record(index, backend.as_ref(), "save_batch", result)
                .unwrap_or(false);
        }
        fan_out.finish()?;
        Ok(accepted)
    }

    /// Replaces a record whose value changed and, if every backend took the
    /// write, notifies every listener with `reason`.
    ///
    /// # Errors
    ///
    /// As for [`save`](Self::save). Listeners are not notified on error.
    pub async fn update(&self, record: &Record, key: &Key, reason: &str) -> Result<bool, StoreError> {
        let reg = self.registries()?;
        if let Some(cache) = &reg.cache {
            if let Err(e) = cache.update(record, key, reason).await {
                tracing::warn!(key = %key, reason, error = %e, "cache update failed");
            }
        }
        let mut fan_out = FanOut::new(reg.backends.len());
        let mut accepted = false;
        for (index, backend) in reg.backends.iter().enumerate() {
            let result = backend.update(record, key, reason).await;
            accepted |= fan_out
                .record(index, backend.as_ref(), "update", result)
                .unwrap_or(false);
        }
        fan_out.finish()?;
        reg.listeners.publish_change(key, record, reason);
        Ok(accepted)
    }

    /// Removes `(kind, key)` from the cache and every backend.
    ///
    /// # Errors
    ///
    /// As for [`save`](Self::save).
    pub async fn delete(&self, kind: ModelKind, key: &Key) -> Result<(), StoreError> {
        let reg = self.registries()?;
        if let Some(cache) = &reg.cache {
            if let Err(e) = cache.delete(kind, key).await {
                tracing::warn!(key = %key, error = %e, "cache delete failed");
            }
        }
        let mut fan_out = FanOut::new(reg.backends.len());
        for (index, backend) in reg.backends.iter().enumerate() {
            let result = backend.delete(kind, key).await;
            fan_out.record(index, backend.as_ref(), "delete", result);
        }
        fan_out.finish()
    }

    /// Removes several entries from the cache and every backend.
    ///
    /// # Errors
    ///
    /// As for [`save`](Self::save).
    pub async fn delete_batch(&self, keys: &[(Key, ModelKind)]) -> Result<(), StoreError> {
        let reg = self.registries()?;
        if let Some(cache) = &reg.cache {
            if let Err(e) = cache.delete_batch(keys).await {
                tracing::warn!(count = keys.len(), error = %e, "cache batch delete failed");
            }
        }
        let mut fan_out = FanOut::new(reg.backends.len());
        for (index, backend) in reg.backends.iter().enumerate() {
            let result = backend.delete_batch(keys).await;
            fan_out.record(index, backend.as_ref(), "delete_batch", result);
        }
        fan_out.finish()
    }

    /// Drops every entry of the table in every backend. The cache is not
    /// consulted.
    ///
    /// # Errors
    ///
    /// As for [`save`](Self::save).
    pub async fn clear_column(&self, kind: ModelKind) -> Result<(), StoreError> {
        let reg = self.registries()?;
        let mut fan_out = FanOut::new(reg.backends.len());
        for (index, backend) in reg.backends.iter().enumerate() {
            let result = backend.clear(kind).await;
            fan_out.record(index, backend.as_ref(), "clear", result);
        }
        fan_out.finish()
    }

    /// Drops the metadata of every entry of the table in every backend.
    ///
    /// # Errors
    ///
    /// As for [`save`](Self::save).
    pub async fn clear_metadata(&self, kind: ModelKind) -> Result<(), StoreError> {
        let reg = self.registries()?;
        let mut fan_out = FanOut::new(reg.backends.len());
        for (index, backend) in reg.backends.iter().enumerate() {
            let result = backend.clear_metadata(kind).await;
            fan_out.record(index, backend.as_ref(), "clear_metadata", result);
        }
        fan_out.finish()
    }

    /// Broadcasts a free-form event to every listener.
    ///
    /// # Errors
    ///
    /// [`StoreError::Closed`] after shutdown.
    pub fn publish(&self, message: &str, args: &[String]) -> Result<(), StoreError> {
        self.registries()?.listeners.publish(message, args);
        Ok(())
    }
}

/// Which ordered neighbor a query asks for.
#[derive(Clone, Copy)]
enum Neighbor<'a> {
    First,
    Latest,
    Next(&'a Key),
    Previous(&'a Key),
}

impl Neighbor<'_> {
    async fn query<S: StorageBackend + ?Sized>(
        self,
        store: &S,
        kind: ModelKind,
    ) -> anyhow::Result<Option<Entry>> {
        match self {
            Self::First => store.first(kind).await,
            Self::Latest => store.latest(kind).await,
            Self::Next(key) => store.next(kind, key).await,
            Self::Previous(key) => store.previous(kind, key).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::storage::backends::failing::FailingBackend;
    use crate::storage::backends::MemoryBackend;
    use crate::storage::impls::{CacheConfig, WriteBackCache, AVERAGE_RECORD_SIZE};
    use crate::storage::listener::tests::CountingListener;

    /// Routes `tracing` output through the test harness; `RUST_LOG` filters.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn tx(byte: u8) -> (Key, Record) {
        (
            Key::hash(vec![byte, byte]),
            Record::new(ModelKind::Transaction, vec![byte]),
        )
    }

    fn small_cache(backend: Arc<dyn StorageBackend>) -> Arc<WriteBackCache> {
        Arc::new(WriteBackCache::new(
            CacheConfig {
                byte_budget: 100 * AVERAGE_RECORD_SIZE,
                ..CacheConfig::default()
            },
            backend,
        ))
    }

    /// Store with a cache flushing into one memory backend.
    fn cached_store() -> (LedgerStore, Arc<WriteBackCache>, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let cache = small_cache(Arc::clone(&backend) as _);
        let store = LedgerStore::builder()
            .with_cache(Arc::clone(&cache) as _)
            .with_backend(Arc::clone(&backend) as _)
            .build();
        (store, cache, backend)
    }

    // --- Reads ---

    #[tokio::test]
    async fn load_reads_through_into_cache() {
        init_tracing();
        let (store, cache, backend) = cached_store();
        let (key, record) = tx(1);
        backend.save(&record, &key).await.unwrap();

        assert_eq!(
            store.load(ModelKind::Transaction, &key).await.unwrap(),
            Some(record.clone())
        );
        assert_eq!(backend.counters().reads(), 1);
        assert_eq!(cache.len(), 1);

        assert_eq!(
            store.load(ModelKind::Transaction, &key).await.unwrap(),
            Some(record)
        );
        assert_eq!(backend.counters().reads(), 1, "second load must be a cache hit");
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn load_miss_returns_none() {
        let (store, _, _) = cached_store();
        let (key, _) = tx(9);
        assert!(store.load(ModelKind::Transaction, &key).await.unwrap().is_none());
        assert!(!store.exists(ModelKind::Transaction, &key).await.unwrap());
        assert!(!store.may_exist(ModelKind::Transaction, &key).await.unwrap());
    }

    #[tokio::test]
    async fn first_match_follows_registration_order() {
        let a = Arc::new(MemoryBackend::named("a"));
        let b = Arc::new(MemoryBackend::named("b"));
        let (key, _) = tx(1);
        b.save(&Record::new(ModelKind::Transaction, vec![0xb]), &key)
            .await
            .unwrap();
        a.save(&Record::new(ModelKind::Transaction, vec![0xa]), &key)
            .await
            .unwrap();
        let store = LedgerStore::builder()
            .with_backend(Arc::clone(&a) as _)
            .with_backend(Arc::clone(&b) as _)
            .build();

        let found = store.load(ModelKind::Transaction, &key).await.unwrap().unwrap();
        assert_eq!(found.bytes().as_ref(), &[0xa]);
        assert_eq!(b.counters().reads(), 0);
    }

    #[tokio::test]
    async fn find_rebuilds_key_and_reads_through() {
        let (store, cache, backend) = cached_store();
        let record = Record::new(ModelKind::Milestone, vec![7]);
        backend.save(&record, &Key::index(42)).await.unwrap();

        let found = store
            .find(ModelKind::Milestone, &42_u32.to_be_bytes())
            .await
            .unwrap();
        assert_eq!(found, Some(record));
        assert!(cache
            .exists(ModelKind::Milestone, &Key::index(42))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn neighbor_queries_fall_back_to_backends() {
        let backend = Arc::new(MemoryBackend::new());
        for index in [10, 20, 30] {
            backend
                .save(&Record::new(ModelKind::Milestone, vec![1]), &Key::index(index))
                .await
                .unwrap();
        }
        let store = LedgerStore::builder().with_backend(backend).build();
        let kind = ModelKind::Milestone;
        let index_of = |entry: Option<Entry>| entry.and_then(|(key, _)| key.as_index());

        assert_eq!(index_of(store.first(kind).await.unwrap()), Some(10));
        assert_eq!(index_of(store.latest(kind).await.unwrap()), Some(30));
        assert_eq!(index_of(store.next(kind, &Key::index(10)).await.unwrap()), Some(20));
        assert_eq!(index_of(store.previous(kind, &Key::index(25)).await.unwrap()), Some(20));
        assert_eq!(index_of(store.next(kind, &Key::index(30)).await.unwrap()), None);
    }

    #[tokio::test]
    async fn neighbor_results_are_admitted() {
        let (store, cache, backend) = cached_store();
        for index in [10, 20, 30] {
            backend
                .save(&Record::new(ModelKind::Milestone, vec![1]), &Key::index(index))
                .await
                .unwrap();
        }
        let kind = ModelKind::Milestone;

        let (key, _) = store.previous(kind, &Key::index(25)).await.unwrap().unwrap();
        assert_eq!(key.as_index(), Some(20));
        assert!(cache.exists(kind, &key).await.unwrap());

        let reads = backend.counters().reads();
        let (again, _) = store.previous(kind, &Key::index(25)).await.unwrap().unwrap();
        assert_eq!(again, key);
        assert_eq!(backend.counters().reads(), reads);
    }

    #[tokio::test]
    async fn exists_checks_backends_after_cache() {
        let backend = Arc::new(MemoryBackend::new());
        let store = LedgerStore::builder()
            .with_backend(Arc::clone(&backend) as _)
            .build();
        let (key, record) = tx(3);
        backend.save(&record, &key).await.unwrap();

        assert!(store.exists(ModelKind::Transaction, &key).await.unwrap());
        assert!(store.may_exist(ModelKind::Transaction, &key).await.unwrap());
    }

    #[tokio::test]
    async fn backend_read_error_propagates() {
        let store = LedgerStore::builder()
            .with_backend(Arc::new(MemoryBackend::new()))
            .with_backend(Arc::new(FailingBackend))
            .build();
        let (key, _) = tx(1);

        let err = store.load(ModelKind::Transaction, &key).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend { index: 1, .. }));
    }

    #[tokio::test]
    async fn aggregate_reads_combine_cache_and_backends() {
        let a = Arc::new(MemoryBackend::named("a"));
        let b = Arc::new(MemoryBackend::named("b"));
        let cache = small_cache(Arc::new(MemoryBackend::new()));
        let store = LedgerStore::builder()
            .with_cache(Arc::clone(&cache) as _)
            .with_backend(Arc::clone(&a) as _)
            .with_backend(Arc::clone(&b) as _)
            .build();

        let kind = ModelKind::Transaction;
        assert_eq!(store.keys_starting_with(kind, &[1]).await.unwrap(), None);
        assert_eq!(store.load_all_keys(kind).await.unwrap(), None);

        let (k1, r1) = tx(1);
        let (k2, r2) = tx(2);
        cache.add(&k1, &r1);
        a.save(&r1, &k1).await.unwrap();
        b.save(&r2, &k2).await.unwrap();

        assert_eq!(store.count(kind).await.unwrap(), 3);
        let keys = store.keys_starting_with(kind, &[1]).await.unwrap().unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec![k1.clone()]);
        let all = store.load_all_keys(kind).await.unwrap().unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn missing_references_use_first_non_empty_backend() {
        let a = Arc::new(MemoryBackend::named("a"));
        let b = Arc::new(MemoryBackend::named("b"));
        let (key, _) = tx(4);
        b.save(&Record::new(ModelKind::Approvee, vec![0]), &key)
            .await
            .unwrap();
        let store = LedgerStore::builder()
            .with_backend(a as _)
            .with_backend(b as _)
            .build();

        let missing = store
            .keys_with_missing_references(ModelKind::Approvee, ModelKind::Transaction)
            .await
            .unwrap();
        assert!(missing.contains(&key));
    }

    /// Collects formatted `tracing` output.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<parking_lot::Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn count(&self, needle: &str) -> usize {
            String::from_utf8_lossy(&self.0.lock()).matches(needle).count()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLogs {
        type Writer = Self;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn failing_cache_reads_fall_back_and_are_logged() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let backend = Arc::new(MemoryBackend::new());
        let (key, record) = tx(4);
        backend.save(&record, &key).await.unwrap();
        let store = LedgerStore::builder()
            .with_cache(Arc::new(FailingBackend))
            .with_backend(Arc::clone(&backend) as _)
            .build();
        let kind = ModelKind::Transaction;

        assert_eq!(store.load(kind, &key).await.unwrap(), Some(record));
        assert!(store.find(kind, key.bytes()).await.unwrap().is_some());
        assert!(store.exists(kind, &key).await.unwrap());
        assert!(store.may_exist(kind, &key).await.unwrap());
        assert!(store.first(kind).await.unwrap().is_some());
        assert_eq!(store.count(kind).await.unwrap(), 1);
        assert_eq!(
            store.keys_starting_with(kind, &[4]).await.unwrap().map(|k| k.len()),
            Some(1)
        );
        assert_eq!(store.load_all_keys(kind).await.unwrap().map(|k| k.len()), Some(1));

        // One warning per read above.
        assert_eq!(logs.count("cache lookup failed"), 8);
    }

    // --- Writes ---

    #[tokio::test]
    async fn save_fans_out_past_a_failing_backend() {
        init_tracing();
        let first = Arc::new(MemoryBackend::named("first"));
        let third = Arc::new(MemoryBackend::named("third"));
        let store = LedgerStore::builder()
            .with_backend(Arc::clone(&first) as _)
            .with_backend(Arc::new(FailingBackend))
            .with_backend(Arc::clone(&third) as _)
            .build();
        let (key, record) = tx(5);

        let err = store.save(&record, &key).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::FanOut {
                failed: 1,
                attempted: 3,
                ..
            }
        ));
        for backend in [&first, &third] {
            assert!(backend.exists(ModelKind::Transaction, &key).await.unwrap());
        }
    }

    #[tokio::test]
    async fn save_reports_acceptance() {
        let store = LedgerStore::builder()
            .with_backend(Arc::new(MemoryBackend::new()))
            .build();
        let (key, record) = tx(1);
        assert!(store.save(&record, &key).await.unwrap());
        assert!(store.save_batch(&[tx(2), tx(3)]).await.unwrap());

        let empty = LedgerStore::builder().build();
        assert!(!empty.save(&record, &key).await.unwrap());
    }

    #[tokio::test]
    async fn writes_reach_cache_and_backends() {
        let (store, cache, backend) = cached_store();
        let (key, record) = tx(6);

        store.save(&record, &key).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert!(backend.exists(ModelKind::Transaction, &key).await.unwrap());

        store.delete(ModelKind::Transaction, &key).await.unwrap();
        assert_eq!(cache.len(), 0);
        assert!(!backend.exists(ModelKind::Transaction, &key).await.unwrap());

        store.save_batch(&[tx(7), tx(8)]).await.unwrap();
        store
            .delete_batch(&[
                (tx(7).0, ModelKind::Transaction),
                (tx(8).0, ModelKind::Transaction),
            ])
            .await
            .unwrap();
        assert_eq!(cache.len(), 0);
        assert_eq!(backend.count(ModelKind::Transaction).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cache_rejection_does_not_fail_the_write() {
        let (store, cache, backend) = cached_store();
        let key = Key::hash(vec![1]);
        let record = Record::new(ModelKind::Approvee, vec![1]);

        assert!(store.save(&record, &key).await.unwrap());
        assert_eq!(cache.len(), 0);
        assert!(backend.exists(ModelKind::Approvee, &key).await.unwrap());
    }

    #[tokio::test]
    async fn clear_goes_to_backends_only() {
        let (store, cache, backend) = cached_store();
        let (key, record) = tx(1);
        store.save(&record.clone().with_metadata(vec![3]), &key).await.unwrap();

        store.clear_metadata(ModelKind::Transaction).await.unwrap();
        let stored = backend.get(ModelKind::Transaction, &key).await.unwrap().unwrap();
        assert!(stored.metadata().is_none());

        store.clear_column(ModelKind::Transaction).await.unwrap();
        assert_eq!(backend.count(ModelKind::Transaction).await.unwrap(), 0);
        assert_eq!(cache.len(), 1);
    }

    // --- Notifications ---

    #[tokio::test]
    async fn only_update_notifies() {
        let listener = Arc::new(CountingListener::default());
        let store = LedgerStore::builder()
            .with_backend(Arc::new(MemoryBackend::new()))
            .with_listener(Arc::clone(&listener) as _)
            .build();
        let (key, record) = tx(1);

        store.save(&record, &key).await.unwrap();
        store.save_batch(&[tx(2)]).await.unwrap();
        assert_eq!(listener.changes.load(Ordering::SeqCst), 0);

        store.update(&record, &key, "solid").await.unwrap();
        assert_eq!(listener.changes.load(Ordering::SeqCst), 1);
        assert_eq!(*listener.reasons.lock(), vec!["solid"]);

        store.publish("lmi", &["7".to_string()]).unwrap();
        assert_eq!(listener.messages.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_update_does_not_notify() {
        let listener = Arc::new(CountingListener::default());
        let healthy = Arc::new(MemoryBackend::new());
        let store = LedgerStore::builder()
            .with_backend(Arc::clone(&healthy) as _)
            .with_backend(Arc::new(FailingBackend))
            .with_listener(Arc::clone(&listener) as _)
            .build();
        let (key, record) = tx(1);

        assert!(store.update(&record, &key, "snapshot").await.is_err());
        assert_eq!(listener.changes.load(Ordering::SeqCst), 0);
        assert!(healthy.exists(ModelKind::Transaction, &key).await.unwrap());
    }

    // --- Lifecycle ---

    #[tokio::test]
    async fn shutdown_flushes_cache_and_closes() {
        init_tracing();
        let listener = Arc::new(CountingListener::default());
        let durable = Arc::new(MemoryBackend::named("durable"));
        let cache = small_cache(Arc::clone(&durable) as _);
        let store = LedgerStore::builder()
            .with_cache(Arc::clone(&cache) as _)
            .with_listener(Arc::clone(&listener) as _)
            .build();
        store.init().await.unwrap();

        for n in 0..5 {
            let (key, record) = tx(n);
            store.save(&record, &key).await.unwrap();
        }
        assert_eq!(durable.count(ModelKind::Transaction).await.unwrap(), 0);

        store.shutdown().await.unwrap();
        assert!(store.is_closed());
        assert_eq!(durable.count(ModelKind::Transaction).await.unwrap(), 5);
        assert_eq!(durable.counters().batch_writes(), 1);
        assert_eq!(cache.len(), 0);
        assert_eq!(listener.shutdowns.load(Ordering::SeqCst), 1);

        let (key, record) = tx(1);
        assert!(matches!(
            store.load(ModelKind::Transaction, &key).await,
            Err(StoreError::Closed)
        ));
        assert!(matches!(store.save(&record, &key).await, Err(StoreError::Closed)));
        assert!(matches!(store.publish("x", &[]), Err(StoreError::Closed)));
        assert!(matches!(store.init().await, Err(StoreError::Closed)));
        assert!(matches!(store.shutdown().await, Err(StoreError::Closed)));
    }

    #[tokio::test]
    async fn init_failure_names_the_backend() {
        let store = LedgerStore::builder()
            .with_backend(Arc::new(MemoryBackend::new()))
            .with_backend(Arc::new(FailingBackend))
            .build();

        match store.init().await {
            Err(StoreError::Lifecycle(message)) => assert!(message.starts_with("failing")),
            other => panic!("expected lifecycle error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shutdown_continues_past_failures() {
        init_tracing();
        let listener = Arc::new(CountingListener::default());
        let store = LedgerStore::builder()
            .with_backend(Arc::new(FailingBackend))
            .with_backend(Arc::new(MemoryBackend::new()))
            .with_listener(Arc::clone(&listener) as _)
            .build();

        assert!(matches!(store.shutdown().await, Err(StoreError::Lifecycle(_))));
        assert!(store.is_closed());
        assert_eq!(listener.shutdowns.load(Ordering::SeqCst), 1);
    }
}
