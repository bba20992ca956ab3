//! Test double whose every operation fails.
//!
//! Also implements [`DataCache`] so a store can be wired with a broken cache.

use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::Bytes;
use ledger_core::{Key, ModelKind, Record};

use crate::storage::backend::{Entry, StorageBackend};
use crate::storage::data_cache::{CacheError, CacheStatsSnapshot, DataCache};

/// Backend standing in for an unreachable store.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FailingBackend;

fn unavailable<T>() -> anyhow::Result<T> {
    Err(anyhow::anyhow!("disk unavailable"))
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn name(&self) -> &str {
        "failing"
    }

    async fn init(&self) -> anyhow::Result<()> {
        unavailable()
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        unavailable()
    }

    async fn get(&self, _: ModelKind, _: &Key) -> anyhow::Result<Option<Record>> {
        unavailable()
    }

    async fn save(&self, _: &Record, _: &Key) -> anyhow::Result<bool> {
        unavailable()
    }

    async fn save_batch(&self, _: &[Entry]) -> anyhow::Result<bool> {
        unavailable()
    }

    async fn update(&self, _: &Record, _: &Key, _: &str) -> anyhow::Result<bool> {
        unavailable()
    }

    async fn delete(&self, _: ModelKind, _: &Key) -> anyhow::Result<()> {
        unavailable()
    }

    async fn delete_batch(&self, _: &[(Key, ModelKind)]) -> anyhow::Result<()> {
        unavailable()
    }

    async fn exists(&self, _: ModelKind, _: &Key) -> anyhow::Result<bool> {
        unavailable()
    }

    async fn may_exist(&self, _: ModelKind, _: &Key) -> anyhow::Result<bool> {
        unavailable()
    }

    async fn seek(&self, _: ModelKind, _: &[u8]) -> anyhow::Result<Option<Record>> {
        unavailable()
    }

    async fn first(&self, _: ModelKind) -> anyhow::Result<Option<Entry>> {
        unavailable()
    }

    async fn latest(&self, _: ModelKind) -> anyhow::Result<Option<Entry>> {
        unavailable()
    }

    async fn next(&self, _: ModelKind, _: &Key) -> anyhow::Result<Option<Entry>> {
        unavailable()
    }

    async fn previous(&self, _: ModelKind, _: &Key) -> anyhow::Result<Option<Entry>> {
        unavailable()
    }

    async fn keys_starting_with(&self, _: ModelKind, _: &[u8]) -> anyhow::Result<BTreeSet<Key>> {
        unavailable()
    }

    async fn keys_with_missing_references(
        &self,
        _: ModelKind,
        _: ModelKind,
    ) -> anyhow::Result<BTreeSet<Key>> {
        unavailable()
    }

    async fn load_all_keys(&self, _: ModelKind) -> anyhow::Result<Vec<Bytes>> {
        unavailable()
    }

    async fn count(&self, _: ModelKind) -> anyhow::Result<u64> {
        unavailable()
    }

    async fn clear(&self, _: ModelKind) -> anyhow::Result<()> {
        unavailable()
    }

    async fn clear_metadata(&self, _: ModelKind) -> anyhow::Result<()> {
        unavailable()
    }
}

#[async_trait]
impl DataCache for FailingBackend {
    fn add(&self, _: &Key, _: &Record) -> bool {
        false
    }

    fn max_size(&self) -> usize {
        0
    }

    fn len(&self) -> usize {
        0
    }

    async fn write_all(&self) -> Result<usize, CacheError> {
        Err(CacheError::Flush {
            count: 0,
            source: anyhow::anyhow!("disk unavailable"),
        })
    }

    async fn evict(&self) -> Result<usize, CacheError> {
        self.write_all().await
    }

    fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot::default()
    }
}
