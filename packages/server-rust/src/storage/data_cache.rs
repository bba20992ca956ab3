//! Bounded cache contract.
//!
//! Defines [`DataCache`], the extra surface a cache exposes on top of the
//! [`StorageBackend`] contract, along with its error type and hit/eviction
//! counters ([`CacheStats`]).

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use ledger_core::{Key, Record};

use super::backend::StorageBackend;

/// Errors surfaced by cache flushes.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backing store rejected or failed a batched write. The entries
    /// remain cached.
    #[error("failed to flush {count} cached entries")]
    Flush {
        count: usize,
        #[source]
        source: anyhow::Error,
    },
    /// The cache has been shut down.
    #[error("cache is shut down")]
    ShutDown,
}

/// Bounded in-memory cache fronting a persistent backend.
///
/// Reads and writes through the [`StorageBackend`] surface never fall
/// through to the backing store; only eviction and [`write_all`](Self::write_all)
/// contact it.
///
/// Used as `Arc<dyn DataCache>`.
#[async_trait]
pub trait DataCache: StorageBackend {
    /// Admit `record` under `key`. Returns `false` if the admission policy
    /// rejected it (excluded kind, derived record, missing placeholder, or
    /// a cache that is shut down).
    fn add(&self, key: &Key, record: &Record) -> bool;

    /// Maximum number of entries, derived once from the byte budget.
    fn max_size(&self) -> usize;

    /// Current number of cached entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every cached entry to the backing store in one batch.
    /// Returns the number of entries written.
    async fn write_all(&self) -> Result<usize, CacheError>;

    /// Evict the oldest share of entries if the cache is at capacity.
    /// Returns the number of entries removed.
    async fn evict(&self) -> Result<usize, CacheError>;

    fn stats(&self) -> CacheStatsSnapshot;
}

/// Monotonic cache counters, updated lock-free.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    admissions: AtomicU64,
    rejections: AtomicU64,
    evicted: AtomicU64,
    failed_evictions: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission(&self) {
        self.admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejection(&self) {
        self.rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: usize) {
        self.evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_failed_eviction(&self) {
        self.failed_evictions.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            admissions: self.admissions.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            failed_evictions: self.failed_evictions.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub admissions: u64,
    pub rejections: u64,
    pub evicted: u64,
    pub failed_evictions: u64,
}

impl CacheStatsSnapshot {
    /// Share of lookups served from the cache, or `0.0` before any lookup.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}
