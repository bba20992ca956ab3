//! Logical table registry.
//!
//! Every persisted entity belongs to exactly one [`ModelKind`]. The kind
//! selects the logical table (column family) the entity lives in, the kind of
//! key it is addressed by, and whether its value is derived from deltas.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::key::KeyKind;

/// Logical table an entity is stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModelKind {
    /// Full transaction body.
    Transaction,
    /// Partial transaction metadata (validity, solidity, snapshot index).
    TransactionMetadata,
    /// Milestone index to milestone transaction mapping.
    Milestone,
    /// Balance changes introduced by a milestone.
    StateDiff,
    /// Transactions touching an address.
    Address,
    /// Transactions approving a transaction.
    Approvee,
    /// Transactions of a bundle.
    Bundle,
    /// Transactions carrying an obsolete tag.
    ObsoleteTag,
    /// Transactions carrying a tag.
    Tag,
}

/// Returned by [`ModelKind::from_table_name`] for unknown names.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown table name: {0}")]
pub struct UnknownTable(pub String);

impl ModelKind {
    /// Regular tables in their canonical order, paired with their names.
    pub const COLUMN_FAMILIES: [(&'static str, ModelKind); 8] = [
        ("transaction", ModelKind::Transaction),
        ("milestone", ModelKind::Milestone),
        ("stateDiff", ModelKind::StateDiff),
        ("address", ModelKind::Address),
        ("approvee", ModelKind::Approvee),
        ("bundle", ModelKind::Bundle),
        ("obsoleteTag", ModelKind::ObsoleteTag),
        ("tag", ModelKind::Tag),
    ];

    /// Name of the distinguished metadata table.
    pub const METADATA_TABLE: &'static str = "transaction-metadata";

    /// Every kind, metadata table included.
    pub const ALL: [ModelKind; 9] = [
        ModelKind::Transaction,
        ModelKind::TransactionMetadata,
        ModelKind::Milestone,
        ModelKind::StateDiff,
        ModelKind::Address,
        ModelKind::Approvee,
        ModelKind::Bundle,
        ModelKind::ObsoleteTag,
        ModelKind::Tag,
    ];

    /// Human-readable table name.
    #[must_use]
    pub fn table_name(self) -> &'static str {
        match self {
            ModelKind::Transaction => "transaction",
            ModelKind::TransactionMetadata => Self::METADATA_TABLE,
            ModelKind::Milestone => "milestone",
            ModelKind::StateDiff => "stateDiff",
            ModelKind::Address => "address",
            ModelKind::Approvee => "approvee",
            ModelKind::Bundle => "bundle",
            ModelKind::ObsoleteTag => "obsoleteTag",
            ModelKind::Tag => "tag",
        }
    }

    /// Resolves a table name to its kind.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownTable`] if no table has this name.
    pub fn from_table_name(name: &str) -> Result<Self, UnknownTable> {
        if name == Self::METADATA_TABLE {
            return Ok(ModelKind::TransactionMetadata);
        }
        Self::COLUMN_FAMILIES
            .iter()
            .find(|(table, _)| *table == name)
            .map(|(_, kind)| *kind)
            .ok_or_else(|| UnknownTable(name.to_string()))
    }

    /// Kind of key this table is addressed by.
    #[must_use]
    pub fn key_kind(self) -> KeyKind {
        match self {
            ModelKind::Milestone => KeyKind::Index,
            _ => KeyKind::Hash,
        }
    }

    /// Whether values of this kind are hash sets merged from deltas.
    ///
    /// A stored copy of a derived value goes stale as soon as another delta
    /// for the same key is written, so derived values are never cached.
    #[must_use]
    pub fn is_derived(self) -> bool {
        matches!(
            self,
            ModelKind::Address
                | ModelKind::Approvee
                | ModelKind::Bundle
                | ModelKind::ObsoleteTag
                | ModelKind::Tag
        )
    }

    /// Stable one-byte discriminant, used when hashing `(kind, key)` pairs.
    #[must_use]
    pub fn tag(self) -> u8 {
        match self {
            ModelKind::Transaction => 1,
            ModelKind::TransactionMetadata => 2,
            ModelKind::Milestone => 3,
            ModelKind::StateDiff => 4,
            ModelKind::Address => 5,
            ModelKind::Approvee => 6,
            ModelKind::Bundle => 7,
            ModelKind::ObsoleteTag => 8,
            ModelKind::Tag => 9,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

impl FromStr for ModelKind {
    type Err = UnknownTable;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_table_name(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_round_trip() {
        for kind in ModelKind::ALL {
            assert_eq!(ModelKind::from_table_name(kind.table_name()), Ok(kind));
        }
    }

    #[test]
    fn metadata_table_is_not_a_column_family() {
        assert!(ModelKind::COLUMN_FAMILIES
            .iter()
            .all(|(name, _)| *name != ModelKind::METADATA_TABLE));
        assert_eq!(
            ModelKind::TransactionMetadata.table_name(),
            "transaction-metadata"
        );
    }

    #[test]
    fn unknown_table_is_rejected() {
        let err = "spentAddress".parse::<ModelKind>().unwrap_err();
        assert_eq!(err, UnknownTable("spentAddress".to_string()));
        assert_eq!(err.to_string(), "unknown table name: spentAddress");
    }

    #[test]
    fn only_milestones_are_index_keyed() {
        for kind in ModelKind::ALL {
            let expected = if kind == ModelKind::Milestone {
                KeyKind::Index
            } else {
                KeyKind::Hash
            };
            assert_eq!(kind.key_kind(), expected, "{kind}");
        }
    }

    #[test]
    fn hash_set_kinds_are_derived() {
        assert!(ModelKind::Approvee.is_derived());
        assert!(ModelKind::Address.is_derived());
        assert!(!ModelKind::Transaction.is_derived());
        assert!(!ModelKind::Milestone.is_derived());
        assert!(!ModelKind::StateDiff.is_derived());
    }

    #[test]
    fn tags_are_distinct() {
        let mut tags: Vec<u8> = ModelKind::ALL.iter().map(|k| k.tag()).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), ModelKind::ALL.len());
    }

    #[test]
    fn serde_uses_camel_case() {
        let json = serde_json::to_string(&ModelKind::ObsoleteTag).unwrap();
        assert_eq!(json, "\"obsoleteTag\"");
        let parsed: ModelKind = serde_json::from_str("\"stateDiff\"").unwrap();
        assert_eq!(parsed, ModelKind::StateDiff);
    }
}
