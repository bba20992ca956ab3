//! Insertion-ordered slot arena backing the write-back cache.
//!
//! Entries live in a `BTreeMap` keyed by a monotonically increasing sequence
//! number, so iteration order is admission order and the oldest entries are
//! always at the front. A side index maps `(kind, key)` to its sequence
//! number. Each slot carries a version that changes whenever its value is
//! replaced, which lets eviction detect slots updated while their batch was
//! being written.

use std::collections::{BTreeMap, HashMap};

use ledger_core::{Key, ModelKind, Record};

/// A cached entry.
#[derive(Debug, Clone)]
pub(crate) struct Slot {
    pub key: Key,
    pub record: Record,
    pub version: u64,
}

impl Slot {
    pub fn kind(&self) -> ModelKind {
        self.record.kind()
    }
}

/// Snapshot of a slot taken for eviction.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub seq: u64,
    pub version: u64,
    pub key: Key,
    pub record: Record,
}

/// Outcome of [`CacheArena::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// A new slot was appended.
    Inserted,
    /// An existing slot's value was replaced in place.
    Replaced,
}

#[derive(Debug, Default)]
pub(crate) struct CacheArena {
    slots: BTreeMap<u64, Slot>,
    index: HashMap<(ModelKind, Key), u64>,
    next_seq: u64,
    next_version: u64,
}

impl CacheArena {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    /// Appends `(key, record)` or replaces the value of an existing slot.
    ///
    /// Replacement keeps the slot's position in eviction order.
    pub fn insert(&mut self, key: Key, record: Record) -> Admission {
        let version = self.bump_version();
        let index_key = (record.kind(), key);
        if let Some(&seq) = self.index.get(&index_key) {
            if let Some(slot) = self.slots.get_mut(&seq) {
                slot.record = record;
                slot.version = version;
                return Admission::Replaced;
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots.insert(
            seq,
            Slot {
                key: index_key.1.clone(),
                record,
                version,
            },
        );
        self.index.insert(index_key, seq);
        Admission::Inserted
    }

    pub fn get(&self, kind: ModelKind, key: &Key) -> Option<&Slot> {
        let seq = self.index.get(&(kind, key.clone()))?;
        self.slots.get(seq)
    }

    pub fn remove(&mut self, kind: ModelKind, key: &Key) -> Option<Slot> {
        let seq = self.index.remove(&(kind, key.clone()))?;
        self.slots.remove(&seq)
    }

    /// Snapshots up to `count` of the oldest slots.
    pub fn oldest(&self, count: usize) -> Vec<Candidate> {
        self.slots
            .iter()
            .take(count)
            .map(|(&seq, slot)| Candidate {
                seq,
                version: slot.version,
                key: slot.key.clone(),
                record: slot.record.clone(),
            })
            .collect()
    }

    /// Removes the slot at `seq` only if it still holds `version`.
    pub fn remove_if_version(&mut self, seq: u64, version: u64) -> Option<Slot> {
        if self.slots.get(&seq)?.version != version {
            return None;
        }
        let slot = self.slots.remove(&seq)?;
        self.index.remove(&(slot.kind(), slot.key.clone()));
        Some(slot)
    }

    /// Removes every slot of `kind`, returning them.
    pub fn remove_kind(&mut self, kind: ModelKind) -> Vec<Slot> {
        let doomed: Vec<u64> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.kind() == kind)
            .map(|(&seq, _)| seq)
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for seq in doomed {
            if let Some(slot) = self.slots.remove(&seq) {
                self.index.remove(&(kind, slot.key.clone()));
                removed.push(slot);
            }
        }
        removed
    }

    /// Slots in admission order.
    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    /// Slots of one kind, in admission order.
    pub fn iter_kind(&self, kind: ModelKind) -> impl Iterator<Item = &Slot> {
        self.slots.values().filter(move |slot| slot.kind() == kind)
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }
}
