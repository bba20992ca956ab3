//! Persistent backend contract.
//!
//! Defines [`StorageBackend`], the key/value contract every persistence
//! layer exposes: point and batched reads and writes scoped by
//! [`ModelKind`], ordered neighbor queries, prefix queries, and per-table
//! maintenance. The write-back cache implements the same contract so the
//! [`LedgerStore`](super::LedgerStore) can treat it uniformly.

use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::Bytes;
use ledger_core::{Key, ModelKind, Record};

/// A `(key, record)` pair as returned by neighbor queries and batch writes.
pub type Entry = (Key, Record);

/// Pluggable persistence backend.
///
/// Every operation is durable when its future resolves. Implementations
/// must be internally thread-safe: the facade calls into them concurrently
/// from many tasks and holds no lock of its own.
///
/// Used as `Arc<dyn StorageBackend>`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &str;

    /// One-time initialization (open tables, start workers).
    async fn init(&self) -> anyhow::Result<()>;

    /// Release resources. The backend is not used afterwards.
    async fn shutdown(&self) -> anyhow::Result<()>;

    // --- Point access ---

    /// Load the record stored under `(kind, key)`.
    async fn get(&self, kind: ModelKind, key: &Key) -> anyhow::Result<Option<Record>>;

    /// Store a record. Returns `true` if the backend accepted the write.
    async fn save(&self, record: &Record, key: &Key) -> anyhow::Result<bool>;

    /// Store several records at once.
    async fn save_batch(&self, entries: &[Entry]) -> anyhow::Result<bool>;

    /// Replace a record whose value changed. `reason` names the changed
    /// aspect (e.g. `"solid"`, `"snapshot"`) and is opaque to storage.
    async fn update(&self, record: &Record, key: &Key, reason: &str) -> anyhow::Result<bool>;

    async fn delete(&self, kind: ModelKind, key: &Key) -> anyhow::Result<()>;

    async fn delete_batch(&self, keys: &[(Key, ModelKind)]) -> anyhow::Result<()>;

    /// Exact existence check.
    async fn exists(&self, kind: ModelKind, key: &Key) -> anyhow::Result<bool>;

    /// Probabilistic existence check: `false` is definitive, `true` may be
    /// a false positive.
    async fn may_exist(&self, kind: ModelKind, key: &Key) -> anyhow::Result<bool>;

    /// Look up a record by raw key bytes, for callers that do not yet know
    /// which key wrapper the bytes belong to.
    async fn seek(&self, kind: ModelKind, raw_key: &[u8]) -> anyhow::Result<Option<Record>>;

    // --- Ordered neighbor queries ---

    /// Entry with the smallest key in the table.
    async fn first(&self, kind: ModelKind) -> anyhow::Result<Option<Entry>>;

    /// Entry with the greatest key in the table.
    async fn latest(&self, kind: ModelKind) -> anyhow::Result<Option<Entry>>;

    /// Entry with the smallest key strictly greater than `key`.
    async fn next(&self, kind: ModelKind, key: &Key) -> anyhow::Result<Option<Entry>>;

    /// Entry with the greatest key strictly smaller than `key`.
    async fn previous(&self, kind: ModelKind, key: &Key) -> anyhow::Result<Option<Entry>>;

    // --- Table queries ---

    /// Keys of the table whose bytes start with `prefix`.
    async fn keys_starting_with(
        &self,
        kind: ModelKind,
        prefix: &[u8],
    ) -> anyhow::Result<BTreeSet<Key>>;

    /// Keys of `kind` with no entry under the same key in `referenced`.
    async fn keys_with_missing_references(
        &self,
        kind: ModelKind,
        referenced: ModelKind,
    ) -> anyhow::Result<BTreeSet<Key>>;

    /// Raw bytes of every key in the table.
    async fn load_all_keys(&self, kind: ModelKind) -> anyhow::Result<Vec<Bytes>>;

    /// Number of entries in the table.
    async fn count(&self, kind: ModelKind) -> anyhow::Result<u64>;

    // --- Maintenance ---

    /// Drop every entry of the table.
    async fn clear(&self, kind: ModelKind) -> anyhow::Result<()>;

    /// Drop the metadata sub-serialization of every entry of the table.
    async fn clear_metadata(&self, kind: ModelKind) -> anyhow::Result<()>;
}
