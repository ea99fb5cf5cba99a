#![forbid(unsafe_code)]

//! Offset arithmetic for the on-device cache layout.
//!
//! Sequential ('S', byte-addressable devices):
//!
//! ```text
//! | hdr0 | hdr1 | metadata cells 1..N packed | data pages 1..N |
//! ```
//!
//! Interleaved ('I', block devices):
//!
//! ```text
//! | hdr0 | hdr1 | (data page, metadata page) pairs 1..N |
//! ```
//!
//! All functions here are pure; the header carries the parameters.

use tracing::{debug, error};

use crate::error::{CacheError, Result};
use crate::header::Header;
use crate::metadata::METADATA_RECORD_SIZE;
use crate::types::{CacheLayout, ERASE_BLOCK_SIZE, FIRST_OFFSET, PAGE_SIZE};

/// Round `value` up to a multiple of `align` (a power of two).
pub fn round_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
pub fn round_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Format-time sizing for a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    /// Number of cache blocks that fit.
    pub cache_blocks: u64,
    /// Metadata cell size.
    pub mcb_size_bytes: u64,
    /// First data page offset.
    pub first_data_offset_bytes: u64,
    /// Total bytes the cache will use; at most the device size.
    pub cache_size_bytes: u64,
}

/// Size a cache for `device_size_bytes`. The usable size is rounded down
/// to the erase block so no cache block straddles one, then the header
/// region is subtracted before dividing the rest among blocks.
pub fn compute_geometry(
    device_size_bytes: u64,
    layout: CacheLayout,
    page_size_transfer_only: bool,
) -> Result<Geometry> {
    let page = PAGE_SIZE as u64;
    let rounded = round_down(device_size_bytes, ERASE_BLOCK_SIZE);
    if rounded <= FIRST_OFFSET {
        return Err(CacheError::InvalidArgument(format!(
            "device of {device_size_bytes} bytes has no room past the header region"
        )));
    }
    let usable = rounded - FIRST_OFFSET;
    let geometry = match layout {
        CacheLayout::Sequential => {
            let mcb_size = if page_size_transfer_only {
                page
            } else {
                METADATA_RECORD_SIZE as u64
            };
            let mut cache_blocks = usable / (page + mcb_size);
            let mut first_data =
                round_up(FIRST_OFFSET + cache_blocks * mcb_size, page);
            // Page-aligning the data region can push the last block past
            // the rounded device size; give that block up.
            if first_data + cache_blocks * page > rounded {
                cache_blocks -= 1;
                first_data = round_up(FIRST_OFFSET + cache_blocks * mcb_size, page);
            }
            Geometry {
                cache_blocks,
                mcb_size_bytes: mcb_size,
                first_data_offset_bytes: first_data,
                cache_size_bytes: first_data + cache_blocks * page,
            }
        }
        CacheLayout::Interleaved => {
            // Pairing data with metadata only pays off when every transfer
            // is a full page anyway.
            if !page_size_transfer_only {
                return Err(CacheError::InvalidArgument(
                    "interleaved layout requires page-sized transfers".into(),
                ));
            }
            let cache_blocks = usable / (2 * page);
            Geometry {
                cache_blocks,
                mcb_size_bytes: page,
                first_data_offset_bytes: FIRST_OFFSET,
                cache_size_bytes: FIRST_OFFSET + cache_blocks * 2 * page,
            }
        }
    };
    if geometry.cache_blocks == 0 {
        return Err(CacheError::InvalidArgument(
            "device too small for any cache block".into(),
        ));
    }
    debug!(
        ?layout,
        cache_blocks = geometry.cache_blocks,
        first_data = geometry.first_data_offset_bytes,
        cache_size = geometry.cache_size_bytes,
        "computed cache geometry"
    );
    Ok(geometry)
}

/// Byte offset of `block_id`'s metadata cell.
pub fn metadata_offset(header: &Header, block_id: u64) -> u64 {
    debug_assert!(block_id >= 1 && block_id <= header.cache_blocks);
    let page = PAGE_SIZE as u64;
    match header.layout {
        CacheLayout::Sequential => {
            header.first_offset_bytes + (block_id - 1) * header.mcb_size_bytes
        }
        CacheLayout::Interleaved => {
            header.first_offset_bytes + (block_id - 1) * 2 * page + page
        }
    }
}

/// Byte offset of `block_id`'s data page.
pub fn data_offset(header: &Header, block_id: u64) -> u64 {
    debug_assert!(block_id >= 1 && block_id <= header.cache_blocks);
    let page = PAGE_SIZE as u64;
    match header.layout {
        CacheLayout::Sequential => {
            header.first_data_offset_bytes + (block_id - 1) * page
        }
        CacheLayout::Interleaved => {
            header.first_data_offset_bytes + (block_id - 1) * 2 * page
        }
    }
}

/// Probe representative block ids and verify their metadata and data
/// ranges stay inside the cache. Run at format and restore; a violation
/// means the header's geometry cannot be trusted.
pub fn check_offsets(header: &Header) -> Result<()> {
    let n = header.cache_blocks;
    let page = PAGE_SIZE as u64;
    let probes = [1, 2, n / 2, n / 2 + 1, n.saturating_sub(1).max(1), n];
    for block_id in probes {
        if block_id < 1 || block_id > n {
            continue;
        }
        let m = metadata_offset(header, block_id);
        let d = data_offset(header, block_id);
        if m < header.first_offset_bytes
            || m + header.mcb_size_bytes > header.cache_size_bytes
        {
            error!(block_id, metadata_offset = m, "metadata offset out of bounds");
            return Err(CacheError::HeaderCorrupt("metadata offset out of bounds"));
        }
        if d < header.first_data_offset_bytes || d + page > header.cache_size_bytes {
            error!(block_id, data_offset = d, "data offset out of bounds");
            return Err(CacheError::HeaderCorrupt("data offset out of bounds"));
        }
        if d % page != 0 {
            return Err(CacheError::HeaderCorrupt("data offset misaligned"));
        }
        if header.mcb_size_bytes == page && m % page != 0 {
            return Err(CacheError::HeaderCorrupt("metadata offset misaligned"));
        }
    }
    Ok(())
}
