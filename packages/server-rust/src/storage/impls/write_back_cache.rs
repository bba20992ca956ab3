//! Bounded write-back cache in front of a persistent backend.
//!
//! [`WriteBackCache`] keeps recently written records in memory and only
//! hands them to its backing [`StorageBackend`] when they are evicted or the
//! cache is flushed. Admission order is eviction order; reads never promote.
//!
//! All state (the slot arena, its index and the membership filter) sits
//! behind one `RwLock` that is never held across an `.await`. Eviction runs
//! in three steps on a dedicated [`BackgroundWorker`]:
//!
//! 1. snapshot the oldest slots with their versions under the lock,
//! 2. write them to the backend with no lock held,
//! 3. re-take the lock and drop only slots whose version did not change.
//!
//! A slot replaced between steps 1 and 3 stays cached and is written by a
//! later eviction or flush. A key deleted from the cache between steps 1
//! and 3 is deleted from the backend again once the write returns, so the
//! stale value never outlives the delete.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use ledger_core::{fingerprint, Key, ModelKind, Record};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::service::worker::{BackgroundRunnable, BackgroundWorker, SubmitError};
use crate::storage::backend::{Entry, StorageBackend};
use crate::storage::data_cache::{CacheError, CacheStats, CacheStatsSnapshot, DataCache};
use crate::storage::filter::CuckooFilter;
use crate::storage::impls::cache_arena::{Admission, CacheArena, Slot};

/// Estimated serialized size of one cached record, in bytes.
///
/// A transaction is 1604 trytes; at log2(3) bits per trit that is about
/// 953 bytes.
pub const AVERAGE_RECORD_SIZE: usize = 953;

/// Share of capacity (in percent) removed by one eviction pass.
const EVICTION_PERCENT: usize = 5;

/// Configuration for a [`WriteBackCache`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Memory budget in bytes. Capacity is `byte_budget / AVERAGE_RECORD_SIZE`.
    pub byte_budget: usize,
    /// Kinds that are never admitted.
    pub excluded_kinds: Vec<ModelKind>,
    /// How often the eviction worker retries a cache left over capacity
    /// by a failed flush.
    pub eviction_retry_interval_ms: u64,
    /// Bound of the eviction worker's queue.
    pub eviction_queue_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            byte_budget: 64 * 1024 * 1024,
            excluded_kinds: vec![ModelKind::Approvee],
            eviction_retry_interval_ms: 1_000,
            eviction_queue_capacity: 16,
        }
    }
}

impl CacheConfig {
    /// Entry capacity derived from the byte budget (at least 1).
    #[must_use]
    pub fn max_entries(&self) -> usize {
        (self.byte_budget / AVERAGE_RECORD_SIZE).max(1)
    }
}

/// Number of slots one eviction pass removes: 5% of capacity (at least
/// one) plus however far the cache has overshot.
fn eviction_count(max_size: usize, len: usize) -> usize {
    let base = (max_size * EVICTION_PERCENT).div_ceil(100).max(1);
    base + len.saturating_sub(max_size)
}

/// Keys of one batch being written to the backend, and those of them
/// deleted from the cache before the write returned.
struct InFlightBatch {
    keys: HashSet<(ModelKind, Key)>,
    deleted: HashSet<(ModelKind, Key)>,
}

struct CacheState {
    arena: CacheArena,
    filter: CuckooFilter,
    /// Set when an insert overflowed the filter. While set, the filter
    /// answers "maybe present" for everything.
    filter_degraded: bool,
    in_flight: HashMap<u64, InFlightBatch>,
    next_batch: u64,
}

impl CacheState {
    fn may_contain(&self, kind: ModelKind, key: &Key) -> bool {
        self.filter_degraded || self.filter.contains(fingerprint(kind, key))
    }

    fn forget(&mut self, slot: &Slot) {
        if !self.filter_degraded {
            self.filter.delete(fingerprint(slot.kind(), &slot.key));
        }
    }

    fn rebuild_filter(&mut self, capacity: usize) {
        let mut filter = CuckooFilter::with_capacity(capacity);
        for slot in self.arena.iter() {
            if filter.insert(fingerprint(slot.kind(), &slot.key)).is_err() {
                return;
            }
        }
        self.filter = filter;
        self.filter_degraded = false;
        tracing::debug!(entries = self.arena.len(), "membership filter rebuilt");
    }

    fn begin_batch(&mut self, entries: &[Entry]) -> u64 {
        let id = self.next_batch;
        self.next_batch += 1;
        let keys = entries
            .iter()
            .map(|(key, record)| (record.kind(), key.clone()))
            .collect();
        self.in_flight.insert(
            id,
            InFlightBatch {
                keys,
                deleted: HashSet::new(),
            },
        );
        id
    }

    /// Ends a batch and returns the keys deleted while it was written.
    fn finish_batch(&mut self, id: u64) -> Vec<(Key, ModelKind)> {
        self.in_flight
            .remove(&id)
            .map(|batch| {
                batch
                    .deleted
                    .into_iter()
                    .map(|(kind, key)| (key, kind))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn mark_deleted(&mut self, kind: ModelKind, key: &Key) {
        if self.in_flight.is_empty() {
            return;
        }
        let id = (kind, key.clone());
        for batch in self.in_flight.values_mut() {
            if batch.keys.contains(&id) {
                batch.deleted.insert(id.clone());
            }
        }
    }

    fn mark_kind_cleared(&mut self, kind: ModelKind) {
        for batch in self.in_flight.values_mut() {
            let cleared: Vec<_> = batch
                .keys
                .iter()
                .filter(|(k, _)| *k == kind)
                .cloned()
                .collect();
            batch.deleted.extend(cleared);
        }
    }

    /// A key admitted again after a delete is live, so its pending backend
    /// delete is dropped.
    fn mark_readmitted(&mut self, kind: ModelKind, key: &Key) {
        if self.in_flight.is_empty() {
            return;
        }
        let id = (kind, key.clone());
        for batch in self.in_flight.values_mut() {
            batch.deleted.remove(&id);
        }
    }

    fn remove(&mut self, kind: ModelKind, key: &Key) {
        if let Some(slot) = self.arena.remove(kind, key) {
            self.forget(&slot);
        }
        self.mark_deleted(kind, key);
    }

    fn clear(&mut self) {
        self.arena.clear();
        self.filter.clear();
        self.filter_degraded = false;
    }

    fn entry(slot: &Slot) -> Entry {
        (slot.key.clone(), slot.record.clone())
    }
}

/// State shared between the cache handle and its eviction worker.
struct CacheCore {
    backend: Arc<dyn StorageBackend>,
    excluded: Vec<ModelKind>,
    max_size: usize,
    state: RwLock<CacheState>,
    stats: CacheStats,
    eviction_queued: AtomicBool,
    closed: AtomicBool,
}

impl CacheCore {
    fn is_excluded(&self, kind: ModelKind) -> bool {
        self.excluded.contains(&kind)
    }

    /// Admits a record. Returns whether it was admitted and the cache size
    /// afterwards.
    fn admit(&self, key: &Key, record: &Record) -> (bool, usize) {
        if self.is_excluded(record.kind()) || record.is_derived() || !record.exists() {
            self.stats.record_rejection();
            return (false, 0);
        }

        let mut state = self.state.write();
        // Checked under the lock so shutdown's snapshot sees every admission.
        if self.closed.load(Ordering::Acquire) {
            drop(state);
            self.stats.record_rejection();
            return (false, 0);
        }
        state.mark_readmitted(record.kind(), key);
        if state.arena.insert(key.clone(), record.clone()) == Admission::Inserted
            && !state.filter_degraded
        {
            if let Err(e) = state.filter.insert(fingerprint(record.kind(), key)) {
                state.filter_degraded = true;
                tracing::warn!(
                    error = %e,
                    entries = state.arena.len(),
                    "membership filter saturated, lookups fall back to the index"
                );
            }
        }
        let len = state.arena.len();
        drop(state);

        self.stats.record_admission();
        (true, len)
    }

    fn over_capacity(&self) -> bool {
        self.state.read().arena.len() >= self.max_size
    }

    /// Writes the oldest share of entries to the backend and drops the ones
    /// that were not replaced meanwhile.
    async fn evict_oldest(&self) -> Result<usize, CacheError> {
        let (candidates, entries, batch) = {
            let mut state = self.state.write();
            let len = state.arena.len();
            if len < self.max_size {
                return Ok(0);
            }
            let candidates = state.arena.oldest(eviction_count(self.max_size, len));
            if candidates.is_empty() {
                return Ok(0);
            }
            let entries: Vec<Entry> = candidates
                .iter()
                .map(|c| (c.key.clone(), c.record.clone()))
                .collect();
            let batch = state.begin_batch(&entries);
            (candidates, entries, batch)
        };

        if let Err(source) = self.write_batch(batch, &entries).await {
            self.stats.record_failed_eviction();
            tracing::error!(
                backend = self.backend.name(),
                count = entries.len(),
                error = %source,
                "eviction flush failed, entries stay cached"
            );
            return Err(CacheError::Flush {
                count: entries.len(),
                source,
            });
        }

        let (removed, remaining) = {
            let mut state = self.state.write();
            let mut removed = 0;
            for candidate in &candidates {
                if let Some(slot) = state
                    .arena
                    .remove_if_version(candidate.seq, candidate.version)
                {
                    state.forget(&slot);
                    removed += 1;
                }
            }
            if state.filter_degraded {
                state.rebuild_filter(self.max_size);
            }
            (removed, state.arena.len())
        };

        self.stats.record_evicted(removed);
        tracing::debug!(
            evicted = removed,
            skipped = candidates.len() - removed,
            remaining,
            "evicted oldest cache entries"
        );
        Ok(removed)
    }

    /// Writes every cached entry to the backend. Entries stay cached.
    async fn flush_all(&self) -> Result<usize, CacheError> {
        let (entries, batch) = {
            let mut state = self.state.write();
            let entries: Vec<Entry> = state.arena.iter().map(CacheState::entry).collect();
            if entries.is_empty() {
                return Ok(0);
            }
            let batch = state.begin_batch(&entries);
            (entries, batch)
        };
        self.write_batch(batch, &entries)
            .await
            .map_err(|source| CacheError::Flush {
                count: entries.len(),
                source,
            })?;
        Ok(entries.len())
    }

    /// Writes a batch started with `begin_batch`, then deletes from the
    /// backend every key removed from the cache while the write was in
    /// flight.
    async fn write_batch(&self, batch: u64, entries: &[Entry]) -> anyhow::Result<()> {
        let written = self.persist(entries).await;
        let deleted = self.state.write().finish_batch(batch);
        if deleted.is_empty() {
            return written;
        }
        tracing::debug!(
            backend = self.backend.name(),
            count = deleted.len(),
            "deleting keys removed from the cache during a flush"
        );
        let redeleted = self.backend.delete_batch(&deleted).await;
        written.and(redeleted)
    }

    async fn persist(&self, entries: &[Entry]) -> anyhow::Result<()> {
        if self.backend.save_batch(entries).await? {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "backend {} rejected the batch",
                self.backend.name()
            ))
        }
    }
}

/// Tasks handled by the eviction worker.
enum EvictionTask {
    Evict,
    /// Runs one eviction pass and reports its outcome.
    EvictAndReply(oneshot::Sender<Result<usize, CacheError>>),
    /// Completes once every task queued before it has run.
    Barrier(oneshot::Sender<()>),
}

struct EvictionRunnable {
    core: Arc<CacheCore>,
}

#[async_trait]
impl BackgroundRunnable for EvictionRunnable {
    type Task = EvictionTask;

    async fn run(&mut self, task: EvictionTask) {
        match task {
            EvictionTask::Evict => {
                // Cleared first so admissions during this pass can queue
                // the next one.
                self.core.eviction_queued.store(false, Ordering::Release);
                if let Err(e) = self.core.evict_oldest().await {
                    tracing::debug!(error = %e, "eviction will be retried");
                }
            }
            EvictionTask::EvictAndReply(reply) => {
                let _ = reply.send(self.core.evict_oldest().await);
            }
            EvictionTask::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn on_tick(&mut self) {
        if self.core.over_capacity() {
            let _ = self.core.evict_oldest().await;
        }
    }
}

/// Bounded in-memory write-back cache.
///
/// Records are admitted through the [`StorageBackend`] write methods (or
/// [`DataCache::add`]) and reach the backing store only on eviction or
/// flush. Eviction requires [`init`](StorageBackend::init) to have started
/// the worker. [`evict`](DataCache::evict) runs on that worker once it is
/// started and on the caller's task before.
pub struct WriteBackCache {
    core: Arc<CacheCore>,
    worker: Mutex<Option<BackgroundWorker<EvictionRunnable>>>,
    retry_interval: Duration,
    queue_capacity: usize,
}

impl WriteBackCache {
    /// Creates a cache that evicts into `backend`.
    #[must_use]
    pub fn new(config: CacheConfig, backend: Arc<dyn StorageBackend>) -> Self {
        let max_size = config.max_entries();
        Self {
            core: Arc::new(CacheCore {
                backend,
                excluded: config.excluded_kinds,
                max_size,
                state: RwLock::new(CacheState {
                    arena: CacheArena::default(),
                    filter: CuckooFilter::with_capacity(max_size),
                    filter_degraded: false,
                    in_flight: HashMap::new(),
                    next_batch: 0,
                }),
                stats: CacheStats::default(),
                eviction_queued: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
            retry_interval: Duration::from_millis(config.eviction_retry_interval_ms),
            queue_capacity: config.eviction_queue_capacity,
        }
    }

    /// Waits until every eviction requested so far has run.
    pub async fn wait_for_evictions(&self) {
        let sender = self.worker.lock().as_ref().and_then(BackgroundWorker::sender);
        let Some(sender) = sender else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        if sender.send(EvictionTask::Barrier(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    fn request_eviction(&self) {
        if self.core.eviction_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let submitted = match self.worker.lock().as_ref() {
            Some(worker) => worker.try_submit(EvictionTask::Evict),
            None => Err(SubmitError::Stopped),
        };
        if let Err(e) = submitted {
            // The retry tick picks up a full queue.
            self.core.eviction_queued.store(false, Ordering::Release);
            tracing::debug!(error = %e, "eviction request not queued");
        }
    }

    fn insert(&self, key: &Key, record: &Record) -> bool {
        let (admitted, len) = self.core.admit(key, record);
        if admitted && len >= self.core.max_size {
            self.request_eviction();
        }
        admitted
    }

    fn lookup(&self, kind: ModelKind, key: &Key) -> Option<Record> {
        if self.core.is_excluded(kind) {
            return None;
        }
        let state = self.core.state.read();
        if !state.may_contain(kind, key) {
            return None;
        }
        state.arena.get(kind, key).map(|slot| slot.record.clone())
    }

    fn pick(
        &self,
        kind: ModelKind,
        accept: impl Fn(&Key) -> bool,
        prefer: impl Fn(&Key, &Key) -> bool,
    ) -> Option<Entry> {
        let state = self.core.state.read();
        state
            .arena
            .iter_kind(kind)
            .filter(|slot| accept(&slot.key))
            .reduce(|best, slot| if prefer(&slot.key, &best.key) { slot } else { best })
            .map(CacheState::entry)
    }
}

#[async_trait]
impl StorageBackend for WriteBackCache {
    fn name(&self) -> &str {
        "write-back-cache"
    }

    async fn init(&self) -> anyhow::Result<()> {
        if self.core.closed.load(Ordering::Acquire) {
            anyhow::bail!("write-back cache is shut down");
        }
        {
            let mut worker = self.worker.lock();
            if worker.is_none() {
                *worker = Some(BackgroundWorker::start(
                    "cache-eviction",
                    EvictionRunnable {
                        core: Arc::clone(&self.core),
                    },
                    self.queue_capacity,
                    Some(self.retry_interval),
                ));
            }
        }
        tracing::info!(
            max_size = self.core.max_size,
            backend = self.core.backend.name(),
            "write-back cache initialized"
        );
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        {
            let _state = self.core.state.write();
            if self.core.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }
        let flushed = self.core.flush_all().await?;
        self.core.state.write().clear();
        tracing::info!(flushed, "write-back cache shut down");
        Ok(())
    }

    async fn get(&self, kind: ModelKind, key: &Key) -> anyhow::Result<Option<Record>> {
        let found = self.lookup(kind, key);
        if found.is_some() {
            self.core.stats.record_hit();
        } else {
            self.core.stats.record_miss();
        }
        Ok(found)
    }

    async fn save(&self, record: &Record, key: &Key) -> anyhow::Result<bool> {
        Ok(self.insert(key, record))
    }

    async fn save_batch(&self, entries: &[Entry]) -> anyhow::Result<bool> {
        let mut any = false;
        for (key, record) in entries {
            any |= self.insert(key, record);
        }
        Ok(any)
    }

    async fn update(&self, record: &Record, key: &Key, _reason: &str) -> anyhow::Result<bool> {
        Ok(self.insert(key, record))
    }

    async fn delete(&self, kind: ModelKind, key: &Key) -> anyhow::Result<()> {
        self.core.state.write().remove(kind, key);
        Ok(())
    }

    async fn delete_batch(&self, keys: &[(Key, ModelKind)]) -> anyhow::Result<()> {
        let mut state = self.core.state.write();
        for (key, kind) in keys {
            state.remove(*kind, key);
        }
        Ok(())
    }

    async fn exists(&self, kind: ModelKind, key: &Key) -> anyhow::Result<bool> {
        Ok(self.lookup(kind, key).is_some())
    }

    async fn may_exist(&self, kind: ModelKind, key: &Key) -> anyhow::Result<bool> {
        if self.core.is_excluded(kind) {
            return Ok(false);
        }
        Ok(self.core.state.read().may_contain(kind, key))
    }

    async fn seek(&self, kind: ModelKind, raw_key: &[u8]) -> anyhow::Result<Option<Record>> {
        let key = Key::new(kind.key_kind(), Bytes::copy_from_slice(raw_key));
        self.get(kind, &key).await
    }

    async fn first(&self, kind: ModelKind) -> anyhow::Result<Option<Entry>> {
        Ok(self.pick(kind, |_| true, |a, b| a < b))
    }

    async fn latest(&self, kind: ModelKind) -> anyhow::Result<Option<Entry>> {
        Ok(self.pick(kind, |_| true, |a, b| a > b))
    }

    async fn next(&self, kind: ModelKind, key: &Key) -> anyhow::Result<Option<Entry>> {
        Ok(self.pick(kind, |k| k > key, |a, b| a < b))
    }

    async fn previous(&self, kind: ModelKind, key: &Key) -> anyhow::Result<Option<Entry>> {
        Ok(self.pick(kind, |k| k < key, |a, b| a > b))
    }

    async fn keys_starting_with(
        &self,
        kind: ModelKind,
        prefix: &[u8],
    ) -> anyhow::Result<BTreeSet<Key>> {
        let state = self.core.state.read();
        Ok(state
            .arena
            .iter_kind(kind)
            .filter(|slot| slot.key.starts_with(prefix))
            .map(|slot| slot.key.clone())
            .collect())
    }

    async fn keys_with_missing_references(
        &self,
        _kind: ModelKind,
        _referenced: ModelKind,
    ) -> anyhow::Result<BTreeSet<Key>> {
        Ok(BTreeSet::new())
    }

    async fn load_all_keys(&self, kind: ModelKind) -> anyhow::Result<Vec<Bytes>> {
        let state = self.core.state.read();
        Ok(state
            .arena
            .iter_kind(kind)
            .map(|slot| slot.key.bytes().clone())
            .collect())
    }

    async fn count(&self, kind: ModelKind) -> anyhow::Result<u64> {
        Ok(self.core.state.read().arena.iter_kind(kind).count() as u64)
    }

    async fn clear(&self, kind: ModelKind) -> anyhow::Result<()> {
        let mut state = self.core.state.write();
        for slot in state.arena.remove_kind(kind) {
            state.forget(&slot);
        }
        state.mark_kind_cleared(kind);
        Ok(())
    }

    async fn clear_metadata(&self, _kind: ModelKind) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl DataCache for WriteBackCache {
    fn add(&self, key: &Key, record: &Record) -> bool {
        self.insert(key, record)
    }

    fn max_size(&self) -> usize {
        self.core.max_size
    }

    fn len(&self) -> usize {
        self.core.state.read().arena.len()
    }

    async fn write_all(&self) -> Result<usize, CacheError> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(CacheError::ShutDown);
        }
        self.core.flush_all().await
    }

    async fn evict(&self) -> Result<usize, CacheError> {
        if self.core.closed.load(Ordering::Acquire) {
            return Err(CacheError::ShutDown);
        }
        let sender = self.worker.lock().as_ref().and_then(BackgroundWorker::sender);
        let Some(sender) = sender else {
            return self.core.evict_oldest().await;
        };
        let (tx, rx) = oneshot::channel();
        if sender.send(EvictionTask::EvictAndReply(tx)).await.is_err() {
            return Err(CacheError::ShutDown);
        }
        // A dropped reply means the worker stopped before reaching the task.
        rx.await.unwrap_or(Err(CacheError::ShutDown))
    }

    fn stats(&self) -> CacheStatsSnapshot {
        self.core.stats.snapshot()
    }
}
