//! `StorageBackend` implementations.

#[cfg(test)]
pub(crate) mod failing;
mod memory;
mod null;

pub use memory::{MemoryBackend, OpCounters};
pub use null::NullBackend;
