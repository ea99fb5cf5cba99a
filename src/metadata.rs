#![forbid(unsafe_code)]

//! Per-block metadata records.
//!
//! Each cache block owns one 64-byte metadata record describing what the
//! block caches and a hash of its data page. The record carries its own
//! hash so restore can tell a torn or rotted record from a valid one.
//! On byte-addressable devices records are stored packed; on block devices
//! each record is zero-padded to a full page.

use std::convert::TryInto;
use std::ops::Range;

use crate::error::{CacheError, Result};
use crate::hash::hash128;
use crate::types::{BlockId, PersistState, Xid, SECTOR_NONE};

/// Record magic.
pub const METADATA_MAGIC: u32 = 0xf10c_8a0f;

/// Serialized record size in bytes.
pub const METADATA_RECORD_SIZE: usize = 64;

const MAGIC: Range<usize> = 0..4;
const BLOCK_ID: Range<usize> = 4..8;
const SECTOR: Range<usize> = 8..16;
const XID: Range<usize> = 16..24;
const STATUS: Range<usize> = 24..28;
const PAD: Range<usize> = 28..32;
const HASH_DATA: Range<usize> = 32..48;
const HASH_METADATA: Range<usize> = 48..64;

/// Everything before the trailing hash is covered by it.
const HASHED_SIZE: usize = HASH_METADATA.start;

/// One block's persisted metadata.
///
/// `status` stays a raw word rather than an enum: restore must classify
/// values outside the persistable set (transient mid-transaction states,
/// garbage) instead of refusing to decode them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockMetadata {
    /// 1-based slot index; must match the slot the record was read from.
    pub block_id: BlockId,
    /// Origin-device sector, or [`SECTOR_NONE`] for invalid slots.
    pub sector: u64,
    /// Transaction id of the block's last state change.
    pub xid: Xid,
    /// Raw persisted status word.
    pub status: u32,
    /// Hash of the block's data page.
    pub hash_data: u128,
}

/// A record parsed without validation, as restore needs it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RawRecord {
    pub magic: u32,
    pub record: BlockMetadata,
    pub stored_hash: u128,
    pub computed_hash: u128,
}

impl BlockMetadata {
    /// Record for a freshly formatted, empty slot.
    pub fn invalid(block_id: BlockId) -> Self {
        BlockMetadata {
            block_id,
            sector: SECTOR_NONE,
            xid: 0,
            status: PersistState::Invalid as u32,
            hash_data: 0,
        }
    }

    /// Record describing `block` in `state`, as staged for a write.
    pub(crate) fn stage(
        block: &crate::types::CacheBlock,
        state: PersistState,
    ) -> Self {
        BlockMetadata {
            block_id: block.block_id,
            sector: if state == PersistState::Invalid {
                SECTOR_NONE
            } else {
                block.sector
            },
            xid: block.xid,
            status: state as u32,
            hash_data: block.hash_data,
        }
    }

    /// Serialize into `buf`, which must hold at least one record. The
    /// trailing hash is computed over all preceding bytes, pad included.
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= METADATA_RECORD_SIZE, "metadata buffer too small");
        let buf = &mut buf[..METADATA_RECORD_SIZE];
        buf.fill(0);
        buf[MAGIC].copy_from_slice(&METADATA_MAGIC.to_le_bytes());
        buf[BLOCK_ID].copy_from_slice(&self.block_id.to_le_bytes());
        buf[SECTOR].copy_from_slice(&self.sector.to_le_bytes());
        buf[XID].copy_from_slice(&self.xid.to_le_bytes());
        buf[STATUS].copy_from_slice(&self.status.to_le_bytes());
        buf[PAD].fill(0);
        buf[HASH_DATA].copy_from_slice(&self.hash_data.to_le_bytes());
        let hash = hash128(&buf[..HASHED_SIZE]);
        buf[HASH_METADATA].copy_from_slice(&hash.to_le_bytes());
    }

    /// Decode with full validation. Used by the sync metadata read path;
    /// restore parses raw and classifies instead.
    pub fn decode(buf: &[u8], block_id: BlockId) -> Result<Self> {
        let raw = RawRecord::parse(buf)?;
        if raw.magic != METADATA_MAGIC {
            return Err(CacheError::CorruptMetadata {
                block_id,
                reason: "bad magic",
            });
        }
        if raw.computed_hash != raw.stored_hash {
            return Err(CacheError::HashCorruptMetadata { block_id });
        }
        Ok(raw.record)
    }
}

impl RawRecord {
    /// Parse a record without judging it.
    pub(crate) fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < METADATA_RECORD_SIZE {
            return Err(CacheError::InvalidArgument(
                "metadata buffer shorter than a record".into(),
            ));
        }
        let record = BlockMetadata {
            block_id: u32::from_le_bytes(buf[BLOCK_ID].try_into().unwrap()),
            sector: u64::from_le_bytes(buf[SECTOR].try_into().unwrap()),
            xid: u64::from_le_bytes(buf[XID].try_into().unwrap()),
            status: u32::from_le_bytes(buf[STATUS].try_into().unwrap()),
            hash_data: u128::from_le_bytes(buf[HASH_DATA].try_into().unwrap()),
        };
        Ok(RawRecord {
            magic: u32::from_le_bytes(buf[MAGIC].try_into().unwrap()),
            record,
            stored_hash: u128::from_le_bytes(buf[HASH_METADATA].try_into().unwrap()),
            computed_hash: hash128(&buf[..HASHED_SIZE]),
        })
    }
}
