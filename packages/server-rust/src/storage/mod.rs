//! Storage layer of the ledger node.
//!
//! Provides the contracts and implementations every subsystem reads and
//! writes through:
//!
//! - **Backends** ([`StorageBackend`]): pluggable persistent key/value stores
//!   scoped by [`ModelKind`](ledger_core::ModelKind)
//! - **Cache** ([`DataCache`], [`WriteBackCache`]): bounded write-back cache
//!   with an approximate membership filter ([`CuckooFilter`]) and
//!   percentage-based eviction
//! - **Facade** ([`LedgerStore`]): routes reads cache-first across backends
//!   and fans writes out to all of them
//!
//! Additionally defines [`ChangeListener`] for reacting to updates and
//! [`CompositeChangeListener`] for fan-out to multiple listeners.

pub mod backend;
pub mod backends;
pub mod data_cache;
pub mod facade;
pub mod filter;
pub mod impls;
pub mod listener;

pub use backend::*;
pub use data_cache::*;
pub use facade::*;
pub use filter::*;
pub use impls::*;
pub use listener::*;
