#![forbid(unsafe_code)]

//! 128-bit content hashing.
//!
//! Every persisted record carries a 128-bit non-cryptographic hash: the
//! superblock hashes its own bytes, each metadata record hashes its fields,
//! and each data page is hashed into its metadata record. The hash detects
//! torn writes and bit rot; it is not a defense against an adversary.

use xxhash_rust::xxh3::xxh3_128;

/// Hash an arbitrary byte range.
pub fn hash128(bytes: &[u8]) -> u128 {
    xxh3_128(bytes)
}

/// Render a hash for log output.
pub fn fmt_hash(hash: u128) -> String {
    hex::encode(hash.to_be_bytes())
}
