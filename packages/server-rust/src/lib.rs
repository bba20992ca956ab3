//! Ledger node: storage facade, write-back cache and pluggable backends.

pub mod service;
pub mod storage;

pub use storage::{
    CacheConfig, ChangeListener, DataCache, LedgerStore, LedgerStoreBuilder, StorageBackend,
    StoreError, WriteBackCache,
};
