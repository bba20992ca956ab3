//! `DataCache` implementations.
//!
//! Provides the write-back cache that implements the
//! [`DataCache`](super::DataCache) trait, and the slot arena it is built on.

mod cache_arena;
mod write_back_cache;

pub use write_back_cache::{CacheConfig, WriteBackCache, AVERAGE_RECORD_SIZE};
