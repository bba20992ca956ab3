//! Entity keys.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// What a [`Key`]'s bytes encode.
///
/// Keys of different kinds never compare equal, even when their bytes do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyKind {
    /// A transaction, address, bundle or tag hash.
    Hash,
    /// A big-endian milestone index.
    Index,
}

/// Immutable, totally ordered entity identifier.
///
/// Ordering is by kind first, then lexicographically by bytes. Index keys are
/// big-endian so byte order matches numeric order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key {
    kind: KeyKind,
    bytes: Bytes,
}

impl Key {
    /// Creates a key of the given kind from raw bytes.
    #[must_use]
    pub fn new(kind: KeyKind, bytes: impl Into<Bytes>) -> Self {
        Self {
            kind,
            bytes: bytes.into(),
        }
    }

    /// Creates a hash key.
    #[must_use]
    pub fn hash(bytes: impl Into<Bytes>) -> Self {
        Self::new(KeyKind::Hash, bytes)
    }

    /// Creates an index key from a milestone index.
    #[must_use]
    pub fn index(index: u32) -> Self {
        Self::new(KeyKind::Index, Bytes::copy_from_slice(&index.to_be_bytes()))
    }

    #[must_use]
    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// Serialized form of the key.
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Decodes an index key back to its milestone index.
    ///
    /// Returns `None` for hash keys or malformed index bytes.
    #[must_use]
    pub fn as_index(&self) -> Option<u32> {
        if self.kind != KeyKind::Index {
            return None;
        }
        let raw: [u8; 4] = self.bytes.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(raw))
    }

    /// Whether the key's bytes start with `prefix`.
    #[must_use]
    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.bytes.starts_with(prefix)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(index) = self.as_index() {
            return write!(f, "#{index}");
        }
        for b in self.bytes.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
