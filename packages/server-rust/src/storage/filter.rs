//! Approximate membership filter.
//!
//! [`CuckooFilter`] answers "could this `(kind, key)` be cached?" in O(1)
//! without touching the cache's entries. Buckets hold four 8-bit tags, which
//! bounds the false-positive rate at roughly `2 * 4 / 255 ≈ 3%`. There are no
//! false negatives as long as every [`delete`](CuckooFilter::delete) is paired
//! with an earlier [`insert`](CuckooFilter::insert) of the same fingerprint.

use ledger_core::hash::mix64;

/// Slots per bucket.
const BUCKET_SIZE: usize = 4;

/// Relocations attempted before an insert parks its tag in the victim stash.
const MAX_KICKS: usize = 500;

/// Maximum share of slots (in percent) the sized filter is expected to fill.
const TARGET_LOAD_PERCENT: usize = 90;

/// Empty slot marker. Tags are never zero.
const EMPTY: u8 = 0;

/// Errors returned by [`CuckooFilter::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    /// Every candidate slot is taken and the victim stash is occupied.
    #[error("membership filter is full (capacity {capacity})")]
    Full { capacity: usize },
}

/// A tag that could not be placed after [`MAX_KICKS`] relocations.
#[derive(Debug, Clone, Copy)]
struct Victim {
    index: usize,
    tag: u8,
}

/// Fixed-capacity cuckoo filter over 64-bit fingerprints.
///
/// Not internally synchronized: the owner guards it with the same lock that
/// protects the set it summarizes.
#[derive(Debug, Clone)]
pub struct CuckooFilter {
    buckets: Vec<[u8; BUCKET_SIZE]>,
    mask: usize,
    len: usize,
    capacity: usize,
    victim: Option<Victim>,
    kick_state: u64,
}

impl CuckooFilter {
    /// Creates a filter sized to hold `capacity` fingerprints.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let needed = capacity.div_ceil(BUCKET_SIZE);
        let mut bucket_count = needed.next_power_of_two();
        if needed * 100 > bucket_count * TARGET_LOAD_PERCENT {
            bucket_count <<= 1;
        }
        Self {
            buckets: vec![[EMPTY; BUCKET_SIZE]; bucket_count],
            mask: bucket_count - 1,
            len: 0,
            capacity,
            victim: None,
            kick_state: 0x9e37_79b9_7f4a_7c15,
        }
    }

    /// Number of fingerprints currently stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Entry-count budget the filter was sized for.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tag slots, a power of two times [`BUCKET_SIZE`].
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.buckets.len() * BUCKET_SIZE
    }

    /// Adds a fingerprint. Duplicates are stored as separate copies.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::Full`] when the victim stash is already
    /// occupied. No previously inserted fingerprint is lost in that case.
    pub fn insert(&mut self, fingerprint: u64) -> Result<(), FilterError> {
        if self.victim.is_some() {
            return Err(FilterError::Full {
                capacity: self.capacity,
            });
        }

        let (i1, tag) = self.locate(fingerprint);
        let i2 = self.alt_index(i1, tag);
        if self.put(i1, tag) || self.put(i2, tag) {
            self.len += 1;
            return Ok(());
        }

        let mut index = if self.next_kick() & 1 == 0 { i1 } else { i2 };
        let mut tag = tag;
        for _ in 0..MAX_KICKS {
            #[allow(clippy::cast_possible_truncation)]
            let slot = (self.next_kick() as usize) % BUCKET_SIZE;
            std::mem::swap(&mut tag, &mut self.buckets[index][slot]);
            index = self.alt_index(index, tag);
            if self.put(index, tag) {
                self.len += 1;
                return Ok(());
            }
        }

        // The displaced tag belongs to an earlier insert; keep it so that
        // insert never turns into a false negative.
        self.victim = Some(Victim { index, tag });
        self.len += 1;
        Ok(())
    }

    /// Whether the fingerprint may have been inserted.
    #[must_use]
    pub fn contains(&self, fingerprint: u64) -> bool {
        let (i1, tag) = self.locate(fingerprint);
        let i2 = self.alt_index(i1, tag);
        if let Some(victim) = self.victim {
            if victim.tag == tag && (victim.index == i1 || victim.index == i2) {
                return true;
            }
        }
        self.buckets[i1].contains(&tag) || self.buckets[i2].contains(&tag)
    }

    /// Removes one copy of the fingerprint.
    ///
    /// Returns `false` (and changes nothing) if no matching tag is stored.
    pub fn delete(&mut self, fingerprint: u64) -> bool {
        let (i1, tag) = self.locate(fingerprint);
        let i2 = self.alt_index(i1, tag);

        let removed = self.take(i1, tag) || self.take(i2, tag);
        if removed {
            self.len -= 1;
            self.rehome_victim();
            return true;
        }

        if let Some(victim) = self.victim {
            if victim.tag == tag && (victim.index == i1 || victim.index == i2) {
                self.victim = None;
                self.len -= 1;
                return true;
            }
        }
        false
    }

    /// Removes every fingerprint.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            *bucket = [EMPTY; BUCKET_SIZE];
        }
        self.len = 0;
        self.victim = None;
    }

    /// Primary bucket index and non-zero tag for a fingerprint.
    fn locate(&self, fingerprint: u64) -> (usize, u8) {
        #[allow(clippy::cast_possible_truncation)]
        let mut tag = (fingerprint >> 56) as u8;
        if tag == EMPTY {
            tag = 1;
        }
        #[allow(clippy::cast_possible_truncation)]
        let index = (fingerprint as usize) & self.mask;
        (index, tag)
    }

    /// Partner bucket. Applying it twice returns the original index.
    fn alt_index(&self, index: usize, tag: u8) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let offset = mix64(u64::from(tag)) as usize;
        (index ^ offset) & self.mask
    }

    fn put(&mut self, index: usize, tag: u8) -> bool {
        if let Some(slot) = self.buckets[index].iter_mut().find(|s| **s == EMPTY) {
            *slot = tag;
            return true;
        }
        false
    }

    fn take(&mut self, index: usize, tag: u8) -> bool {
        if let Some(slot) = self.buckets[index].iter_mut().find(|s| **s == tag) {
            *slot = EMPTY;
            return true;
        }
        false
    }

    /// Moves the stashed victim back into a bucket if a slot freed up.
    fn rehome_victim(&mut self) {
        let Some(victim) = self.victim else {
            return;
        };
        let alt = self.alt_index(victim.index, victim.tag);
        if self.put(victim.index, victim.tag) || self.put(alt, victim.tag) {
            self.victim = None;
        }
    }

    /// Xorshift step used to pick relocation slots deterministically.
    fn next_kick(&mut self) -> u64 {
        let mut x = self.kick_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.kick_state = x;
        x
    }
}
