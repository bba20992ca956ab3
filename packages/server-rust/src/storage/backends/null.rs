//! No-op [`StorageBackend`] implementation.
//!
//! [`NullBackend`] accepts and discards all writes and returns empty results
//! for reads. Useful as the flush target of a cache that fronts a node with
//! no persistence, and in tests that only exercise routing.

use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::Bytes;
use ledger_core::{Key, ModelKind, Record};

use crate::storage::backend::{Entry, StorageBackend};

/// Backend that stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBackend;

#[async_trait]
impl StorageBackend for NullBackend {
    fn name(&self) -> &str {
        "null"
    }

    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get(&self, _kind: ModelKind, _key: &Key) -> anyhow::Result<Option<Record>> {
        Ok(None)
    }

    async fn save(&self, _record: &Record, _key: &Key) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn save_batch(&self, _entries: &[Entry]) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn update(&self, _record: &Record, _key: &Key, _reason: &str) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn delete(&self, _kind: ModelKind, _key: &Key) -> anyhow::Result<()> {
        Ok(())
    }

    async fn delete_batch(&self, _keys: &[(Key, ModelKind)]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn exists(&self, _kind: ModelKind, _key: &Key) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn may_exist(&self, _kind: ModelKind, _key: &Key) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn seek(&self, _kind: ModelKind, _raw_key: &[u8]) -> anyhow::Result<Option<Record>> {
        Ok(None)
    }

    async fn first(&self, _kind: ModelKind) -> anyhow::Result<Option<Entry>> {
        Ok(None)
    }

    async fn latest(&self, _kind: ModelKind) -> anyhow::Result<Option<Entry>> {
        Ok(None)
    }

    async fn next(&self, _kind: ModelKind, _key: &Key) -> anyhow::Result<Option<Entry>> {
        Ok(None)
    }

    async fn previous(&self, _kind: ModelKind, _key: &Key) -> anyhow::Result<Option<Entry>> {
        Ok(None)
    }

    async fn keys_starting_with(
        &self,
        _kind: ModelKind,
        _prefix: &[u8],
    ) -> anyhow::Result<BTreeSet<Key>> {
        Ok(BTreeSet::new())
    }

    async fn keys_with_missing_references(
        &self,
        _kind: ModelKind,
        _referenced: ModelKind,
    ) -> anyhow::Result<BTreeSet<Key>> {
        Ok(BTreeSet::new())
    }

    async fn load_all_keys(&self, _kind: ModelKind) -> anyhow::Result<Vec<Bytes>> {
        Ok(Vec::new())
    }

    async fn count(&self, _kind: ModelKind) -> anyhow::Result<u64> {
        Ok(0)
    }

    async fn clear(&self, _kind: ModelKind) -> anyhow::Result<()> {
        Ok(())
    }

    async fn clear_metadata(&self, _kind: ModelKind) -> anyhow::Result<()> {
        Ok(())
    }
}
