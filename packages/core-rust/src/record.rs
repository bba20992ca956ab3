//! Persisted entity values.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::model::ModelKind;

/// A typed, serialized entity value.
///
/// The [`ModelKind`] is carried as data, so storage layers dispatch by
/// matching on it rather than on the record's concrete type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    kind: ModelKind,
    bytes: Bytes,
    metadata: Option<Bytes>,
    exists: bool,
}

impl Record {
    /// Creates an existing record of the given kind.
    #[must_use]
    pub fn new(kind: ModelKind, bytes: impl Into<Bytes>) -> Self {
        Self {
            kind,
            bytes: bytes.into(),
            metadata: None,
            exists: true,
        }
    }

    /// Attaches a partial metadata serialization.
    #[must_use]
    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Placeholder returned where an entity was looked up but not found.
    #[must_use]
    pub fn missing(kind: ModelKind) -> Self {
        Self {
            kind,
            bytes: Bytes::new(),
            metadata: None,
            exists: false,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Full serialization.
    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Metadata sub-serialization, if the kind carries one.
    #[must_use]
    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    /// Drops the metadata sub-serialization.
    pub fn clear_metadata(&mut self) {
        self.metadata = None;
    }

    /// `false` for placeholder instances created by [`Record::missing`].
    #[must_use]
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Whether the authoritative value is always recomputed from deltas.
    #[must_use]
    pub fn is_derived(&self) -> bool {
        self.kind.is_derived()
    }

    /// Serialized size in bytes, metadata included.
    #[must_use]
    pub fn size(&self) -> usize {
        self.bytes.len() + self.metadata.as_ref().map_or(0, Bytes::len)
    }
}
