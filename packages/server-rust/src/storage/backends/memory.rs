//! In-memory [`StorageBackend`] implementation backed by [`DashMap`].
//!
//! Each logical table is a `BTreeMap` so neighbor and prefix queries are
//! ordered range scans, the same access pattern an on-disk key/value store
//! offers. Tables are sharded by [`ModelKind`] through the outer `DashMap`,
//! so writers to different tables never contend.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use ledger_core::{Key, ModelKind, Record};

use crate::storage::backend::{Entry, StorageBackend};

/// Per-operation call counters, readable by tests and diagnostics.
#[derive(Debug, Default)]
pub struct OpCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    batch_writes: AtomicU64,
}

impl OpCounters {
    /// Point and neighbor reads served.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Single-record writes (`save` and `update`).
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// `save_batch` calls.
    #[must_use]
    pub fn batch_writes(&self) -> u64 {
        self.batch_writes.load(Ordering::Relaxed)
    }
}

/// Ordered in-memory storage for every table.
pub struct MemoryBackend {
    name: String,
    tables: DashMap<ModelKind, BTreeMap<Key, Record>>,
    counters: OpCounters,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::named("memory")
    }

    /// Creates an empty backend with a custom name (useful when several
    /// memory backends are registered side by side).
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: DashMap::new(),
            counters: OpCounters::default(),
        }
    }

    #[must_use]
    pub fn counters(&self) -> &OpCounters {
        &self.counters
    }

    /// Total number of entries across all tables.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.iter().map(|t| t.value().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: &Key, record: &Record) {
        self.tables
            .entry(record.kind())
            .or_default()
            .insert(key.clone(), record.clone());
    }

    fn read<T>(&self, kind: ModelKind, f: impl FnOnce(&BTreeMap<Key, Record>) -> Option<T>) -> Option<T> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.tables.get(&kind).and_then(|table| f(table.value()))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn to_entry((key, record): (&Key, &Record)) -> Entry {
    (key.clone(), record.clone())
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get(&self, kind: ModelKind, key: &Key) -> anyhow::Result<Option<Record>> {
        Ok(self.read(kind, |table| table.get(key).cloned()))
    }

    async fn save(&self, record: &Record, key: &Key) -> anyhow::Result<bool> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.insert(key, record);
        Ok(true)
    }

    async fn save_batch(&self, entries: &[Entry]) -> anyhow::Result<bool> {
        self.counters.batch_writes.fetch_add(1, Ordering::Relaxed);
        for (key, record) in entries {
            self.insert(key, record);
        }
        Ok(true)
    }

    async fn update(&self, record: &Record, key: &Key, _reason: &str) -> anyhow::Result<bool> {
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        self.insert(key, record);
        Ok(true)
    }

    async fn delete(&self, kind: ModelKind, key: &Key) -> anyhow::Result<()> {
        if let Some(mut table) = self.tables.get_mut(&kind) {
            table.remove(key);
        }
        Ok(())
    }

    async fn delete_batch(&self, keys: &[(Key, ModelKind)]) -> anyhow::Result<()> {
        for (key, kind) in keys {
            if let Some(mut table) = self.tables.get_mut(kind) {
                table.remove(key);
            }
        }
        Ok(())
    }

    async fn exists(&self, kind: ModelKind, key: &Key) -> anyhow::Result<bool> {
        Ok(self
            .read(kind, |table| Some(table.contains_key(key)))
            .unwrap_or(false))
    }

    async fn may_exist(&self, kind: ModelKind, key: &Key) -> anyhow::Result<bool> {
        self.exists(kind, key).await
    }

    async fn seek(&self, kind: ModelKind, raw_key: &[u8]) -> anyhow::Result<Option<Record>> {
        let key = Key::new(kind.key_kind(), Bytes::copy_from_slice(raw_key));
        self.get(kind, &key).await
    }

    async fn first(&self, kind: ModelKind) -> anyhow::Result<Option<Entry>> {
        Ok(self.read(kind, |table| table.first_key_value().map(to_entry)))
    }

    async fn latest(&self, kind: ModelKind) -> anyhow::Result<Option<Entry>> {
        Ok(self.read(kind, |table| table.last_key_value().map(to_entry)))
    }

    async fn next(&self, kind: ModelKind, key: &Key) -> anyhow::Result<Option<Entry>> {
        Ok(self.read(kind, |table| {
            table
                .range((Bound::Excluded(key), Bound::Unbounded))
                .next()
                .map(to_entry)
        }))
    }

    async fn previous(&self, kind: ModelKind, key: &Key) -> anyhow::Result<Option<Entry>> {
        Ok(self.read(kind, |table| table.range(..key).next_back().map(to_entry)))
    }

    async fn keys_starting_with(
        &self,
        kind: ModelKind,
        prefix: &[u8],
    ) -> anyhow::Result<BTreeSet<Key>> {
        let start = Key::new(kind.key_kind(), Bytes::copy_from_slice(prefix));
        Ok(self
            .read(kind, |table| {
                Some(
                    table
                        .range(&start..)
                        .map(|(key, _)| key)
                        .take_while(|key| key.kind() == start.kind() && key.starts_with(prefix))
                        .cloned()
                        .collect(),
                )
            })
            .unwrap_or_default())
    }

    async fn keys_with_missing_references(
        &self,
        kind: ModelKind,
        referenced: ModelKind,
    ) -> anyhow::Result<BTreeSet<Key>> {
        // Collect first so no two table guards are held at once.
        let keys: Vec<Key> = self
            .read(kind, |table| Some(table.keys().cloned().collect()))
            .unwrap_or_default();
        let Some(other) = self.tables.get(&referenced) else {
            return Ok(keys.into_iter().collect());
        };
        Ok(keys
            .into_iter()
            .filter(|key| !other.contains_key(key))
            .collect())
    }

    async fn load_all_keys(&self, kind: ModelKind) -> anyhow::Result<Vec<Bytes>> {
        Ok(self
            .read(kind, |table| {
                Some(table.keys().map(|key| key.bytes().clone()).collect())
            })
            .unwrap_or_default())
    }

    async fn count(&self, kind: ModelKind) -> anyhow::Result<u64> {
        Ok(self.tables.get(&kind).map_or(0, |table| table.len() as u64))
    }

    async fn clear(&self, kind: ModelKind) -> anyhow::Result<()> {
        self.tables.remove(&kind);
        Ok(())
    }

    async fn clear_metadata(&self, kind: ModelKind) -> anyhow::Result<()> {
        if let Some(mut table) = self.tables.get_mut(&kind) {
            for record in table.values_mut() {
                record.clear_metadata();
            }
        }
        if kind == ModelKind::Transaction {
            self.tables.remove(&ModelKind::TransactionMetadata);
        }
        Ok(())
    }
}
