//! Ledger core: entity keys, records, the logical table registry and
//! identity fingerprints shared by every storage layer.

pub mod hash;
pub mod key;
pub mod model;
pub mod record;

pub use hash::fingerprint;
pub use key::{Key, KeyKind};
pub use model::{ModelKind, UnknownTable};
pub use record::Record;
