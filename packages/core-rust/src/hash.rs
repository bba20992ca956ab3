//! Fingerprint hashing for `(kind, key)` pairs.
//!
//! Membership filters need a stable 64-bit digest of an entity's identity.
//! The digest is FNV-1a over a one-byte model tag, a one-byte key-kind tag
//! and the key bytes, passed through a 64-bit finalizer so that both the high
//! and low bits are usable for bucket selection.

use crate::key::{Key, KeyKind};
use crate::model::ModelKind;

/// FNV-1a offset basis (64-bit).
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a prime (64-bit).
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Computes a 64-bit FNV-1a hash of `bytes`, continuing from `state`.
#[must_use]
pub fn fnv1a_64(state: u64, bytes: &[u8]) -> u64 {
    let mut hash = state;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Avalanche finalizer (`fmix64` from `MurmurHash3`).
#[must_use]
pub fn mix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Digest of a `(model kind, key)` pair.
///
/// Pairs that differ in model kind, key kind or key bytes get independent
/// digests, so the same hash stored as a transaction and as a bundle never
/// share a filter slot by construction.
#[must_use]
pub fn fingerprint(kind: ModelKind, key: &Key) -> u64 {
    raw_fingerprint(kind, key.kind(), key.bytes())
}

/// Digest of a `(model kind, key kind, raw key bytes)` triple.
///
/// Used when only the raw bytes of a key are known.
#[must_use]
pub fn raw_fingerprint(kind: ModelKind, key_kind: KeyKind, bytes: &[u8]) -> u64 {
    let key_tag = match key_kind {
        KeyKind::Hash => 0_u8,
        KeyKind::Index => 1_u8,
    };
    let h = fnv1a_64(FNV_OFFSET_BASIS, &[kind.tag(), key_tag]);
    mix64(fnv1a_64(h, bytes))
}
