#![forbid(unsafe_code)]

//! The cache superblock.
//!
//! The header records the cache geometry, identity, and transaction-id
//! watermarks. Two copies live on the device, one erase block apart.
//! Updates alternate between the copies so that a crash in the middle of a
//! header write always leaves the previous copy intact; the copy with the
//! higher transaction id wins at restore.

use std::convert::TryInto;
use std::ops::Range;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{info, warn};

use crate::error::{CacheError, Result};
use crate::hash::{fmt_hash, hash128};
use crate::layout;
use crate::types::{CacheLayout, Xid, FIRST_OFFSET, PAGE_SIZE};

/// Superblock magic.
pub const HEADER_MAGIC: u32 = 0xf10c_5704;

/// On-device format version.
pub const HEADER_VERSION: u32 = 11;

/// Bytes reserved for the cache and device name fields.
pub const NAME_SIZE: usize = 128;

const MAGIC: Range<usize> = 0..4;
const VERSION: Range<usize> = 4..8;
const HEADER_SIZE: Range<usize> = 8..12;
const LAYOUT: Range<usize> = 12..13;
const PAD: Range<usize> = 13..20;
const CACHE_BLOCKS: Range<usize> = 20..28;
const CACHE_BLOCK_SIZE: Range<usize> = 28..36;
const MCB_SIZE: Range<usize> = 36..44;
const CACHE_SIZE: Range<usize> = 44..52;
const FIRST_OFFSET_FIELD: Range<usize> = 52..60;
const FIRST_DATA_OFFSET: Range<usize> = 60..68;
const UUID: Range<usize> = 68..84;
const NAME: Range<usize> = 84..212;
const DEVICE_UUID: Range<usize> = 212..228;
const DEVICE_NAME: Range<usize> = 228..356;
const XID_FIRST: Range<usize> = 356..364;
const XID_CURRENT: Range<usize> = 364..372;
const SPARE: Range<usize> = 372..884;
const HASH: Range<usize> = 884..900;

/// Bytes covered by the trailing hash.
const HASHED_SIZE: usize = HASH.start;

/// In-memory superblock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// On-device arrangement.
    pub layout: CacheLayout,
    /// Number of cache blocks.
    pub cache_blocks: u64,
    /// Cache block size; fixed at one page.
    pub cache_block_size: u64,
    /// Per-block metadata cell size: packed record size or one page.
    pub mcb_size_bytes: u64,
    /// Configured cache size; at most the device size.
    pub cache_size_bytes: u64,
    /// First metadata offset (sequential) or first pair offset
    /// (interleaved).
    pub first_offset_bytes: u64,
    /// First data page offset.
    pub first_data_offset_bytes: u64,
    /// Cache instance UUID, generated at format time.
    pub uuid: [u8; 16],
    /// Cache name, bounded ASCII.
    pub name: String,
    /// Cached origin device UUID.
    pub device_uuid: [u8; 16],
    /// Cached origin device name.
    pub device_name: String,
    /// First transaction id used by this cache instance.
    pub xid_first: Xid,
    /// Transaction id stamped into this copy at its last write.
    pub xid_current: Xid,
}

impl Header {
    /// Build a fresh header for a device of `device_size_bytes`, sizing the
    /// block count and region offsets for the given layout.
    pub fn format(
        layout: CacheLayout,
        page_size_transfer_only: bool,
        device_size_bytes: u64,
        name: &str,
        device_name: &str,
    ) -> Result<Self> {
        let geometry =
            layout::compute_geometry(device_size_bytes, layout, page_size_transfer_only)?;
        let mut uuid = [0u8; 16];
        let mut device_uuid = [0u8; 16];
        OsRng.fill_bytes(&mut uuid);
        OsRng.fill_bytes(&mut device_uuid);
        let header = Header {
            layout,
            cache_blocks: geometry.cache_blocks,
            cache_block_size: PAGE_SIZE as u64,
            mcb_size_bytes: geometry.mcb_size_bytes,
            cache_size_bytes: geometry.cache_size_bytes,
            first_offset_bytes: FIRST_OFFSET,
            first_data_offset_bytes: geometry.first_data_offset_bytes,
            uuid,
            name: bounded_name(name),
            device_uuid,
            device_name: bounded_name(device_name),
            xid_first: 1,
            xid_current: 1,
        };
        info!(
            layout = ?layout,
            cache_blocks = header.cache_blocks,
            mcb_size = header.mcb_size_bytes,
            cache_size = header.cache_size_bytes,
            uuid = %hex::encode(header.uuid),
            "formatted cache header"
        );
        Ok(header)
    }

    /// Serialize into a page-sized buffer, hashing all preceding bytes
    /// into the trailing field.
    pub fn encode(&self, buf: &mut [u8]) {
        assert!(buf.len() >= PAGE_SIZE, "header buffer smaller than a page");
        let buf = &mut buf[..PAGE_SIZE];
        buf.fill(0);
        buf[MAGIC].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf[VERSION].copy_from_slice(&HEADER_VERSION.to_le_bytes());
        buf[HEADER_SIZE].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        buf[LAYOUT.start] = self.layout.as_byte();
        buf[PAD].fill(0);
        buf[CACHE_BLOCKS].copy_from_slice(&self.cache_blocks.to_le_bytes());
        buf[CACHE_BLOCK_SIZE].copy_from_slice(&self.cache_block_size.to_le_bytes());
        buf[MCB_SIZE].copy_from_slice(&self.mcb_size_bytes.to_le_bytes());
        buf[CACHE_SIZE].copy_from_slice(&self.cache_size_bytes.to_le_bytes());
        buf[FIRST_OFFSET_FIELD].copy_from_slice(&self.first_offset_bytes.to_le_bytes());
        buf[FIRST_DATA_OFFSET].copy_from_slice(&self.first_data_offset_bytes.to_le_bytes());
        buf[UUID].copy_from_slice(&self.uuid);
        encode_name(&mut buf[NAME], &self.name);
        buf[DEVICE_UUID].copy_from_slice(&self.device_uuid);
        encode_name(&mut buf[DEVICE_NAME], &self.device_name);
        buf[XID_FIRST].copy_from_slice(&self.xid_first.to_le_bytes());
        buf[XID_CURRENT].copy_from_slice(&self.xid_current.to_le_bytes());
        buf[SPARE].fill(0);
        let hash = hash128(&buf[..HASHED_SIZE]);
        buf[HASH].copy_from_slice(&hash.to_le_bytes());
    }

    /// Validate and deserialize one header copy. Magic, version, and the
    /// overall hash gate acceptance; geometry consistency is checked
    /// separately once a copy has been adopted.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < PAGE_SIZE {
            return Err(CacheError::HeaderCorrupt("header shorter than a page"));
        }
        let magic = u32::from_le_bytes(buf[MAGIC].try_into().unwrap());
        if magic != HEADER_MAGIC {
            return Err(CacheError::HeaderCorrupt("bad magic"));
        }
        let version = u32::from_le_bytes(buf[VERSION].try_into().unwrap());
        if version != HEADER_VERSION {
            return Err(CacheError::HeaderCorrupt("unsupported version"));
        }
        let stored_hash = u128::from_le_bytes(buf[HASH].try_into().unwrap());
        let computed_hash = hash128(&buf[..HASHED_SIZE]);
        if stored_hash != computed_hash {
            warn!(
                stored = %fmt_hash(stored_hash),
                computed = %fmt_hash(computed_hash),
                "header hash mismatch"
            );
            return Err(CacheError::HeaderCorrupt("hash mismatch"));
        }
        let header_size = u32::from_le_bytes(buf[HEADER_SIZE].try_into().unwrap());
        if header_size != PAGE_SIZE as u32 {
            return Err(CacheError::HeaderCorrupt("header size mismatch"));
        }
        let layout = CacheLayout::from_byte(buf[LAYOUT.start])
            .ok_or(CacheError::HeaderCorrupt("unknown layout"))?;
        Ok(Header {
            layout,
            cache_blocks: u64::from_le_bytes(buf[CACHE_BLOCKS].try_into().unwrap()),
            cache_block_size: u64::from_le_bytes(buf[CACHE_BLOCK_SIZE].try_into().unwrap()),
            mcb_size_bytes: u64::from_le_bytes(buf[MCB_SIZE].try_into().unwrap()),
            cache_size_bytes: u64::from_le_bytes(buf[CACHE_SIZE].try_into().unwrap()),
            first_offset_bytes: u64::from_le_bytes(buf[FIRST_OFFSET_FIELD].try_into().unwrap()),
            first_data_offset_bytes: u64::from_le_bytes(
                buf[FIRST_DATA_OFFSET].try_into().unwrap(),
            ),
            uuid: buf[UUID].try_into().unwrap(),
            name: decode_name(&buf[NAME])?,
            device_uuid: buf[DEVICE_UUID].try_into().unwrap(),
            device_name: decode_name(&buf[DEVICE_NAME])?,
            xid_first: u64::from_le_bytes(buf[XID_FIRST].try_into().unwrap()),
            xid_current: u64::from_le_bytes(buf[XID_CURRENT].try_into().unwrap()),
        })
    }

    /// Check the adopted copy against the opened provider and device.
    /// A cache smaller than the device is tolerated with a warning; a
    /// cache larger than the device can never have been written here.
    pub fn validate_against(
        &self,
        layout: CacheLayout,
        page_size_transfer_only: bool,
        device_size_bytes: u64,
    ) -> Result<()> {
        if self.cache_block_size != PAGE_SIZE as u64 {
            return Err(CacheError::HeaderCorrupt("cache block size mismatch"));
        }
        if self.layout != layout {
            return Err(CacheError::HeaderCorrupt("layout mismatch with provider"));
        }
        let expected_mcb = if page_size_transfer_only {
            PAGE_SIZE as u64
        } else {
            crate::metadata::METADATA_RECORD_SIZE as u64
        };
        if self.mcb_size_bytes != expected_mcb {
            return Err(CacheError::HeaderCorrupt("metadata cell size mismatch"));
        }
        if self.first_offset_bytes != FIRST_OFFSET {
            return Err(CacheError::HeaderCorrupt("first offset mismatch"));
        }
        match self.layout {
            CacheLayout::Sequential => {
                let expected_first_data = layout::round_up(
                    self.first_offset_bytes + self.cache_blocks * self.mcb_size_bytes,
                    PAGE_SIZE as u64,
                );
                if expected_first_data != self.first_data_offset_bytes {
                    return Err(CacheError::HeaderCorrupt("first data offset mismatch"));
                }
                let end = expected_first_data + self.cache_blocks * PAGE_SIZE as u64;
                if end > self.cache_size_bytes {
                    return Err(CacheError::HeaderCorrupt("blocks exceed cache size"));
                }
            }
            CacheLayout::Interleaved => {
                if self.first_data_offset_bytes != self.first_offset_bytes {
                    return Err(CacheError::HeaderCorrupt("first data offset mismatch"));
                }
                let end = self.first_offset_bytes + self.cache_blocks * 2 * PAGE_SIZE as u64;
                if end > self.cache_size_bytes {
                    return Err(CacheError::HeaderCorrupt("blocks exceed cache size"));
                }
            }
        }
        if self.cache_size_bytes > device_size_bytes {
            return Err(CacheError::HeaderCorrupt("cache larger than device"));
        }
        if self.cache_size_bytes < device_size_bytes {
            warn!(
                cache_size = self.cache_size_bytes,
                device_size = device_size_bytes,
                "configured cache smaller than device"
            );
        }
        layout::check_offsets(self)
    }
}

fn bounded_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|c| c.is_ascii() && *c != '\0')
        .collect();
    out.truncate(NAME_SIZE - 1);
    out
}

fn encode_name(field: &mut [u8], name: &str) {
    field.fill(0);
    let bytes = name.as_bytes();
    let len = bytes.len().min(NAME_SIZE - 1);
    field[..len].copy_from_slice(&bytes[..len]);
}

fn decode_name(field: &[u8]) -> Result<String> {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| CacheError::HeaderCorrupt("name is not valid ASCII"))
}
