#![forbid(unsafe_code)]

//! Shared identifiers, constants, and persisted-state classification.

/// Cache block and transfer unit size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Device sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Sectors covered by one cache block.
pub const SECTORS_PER_PAGE: u64 = PAGE_SIZE as u64 / SECTOR_SIZE;

/// NAND-flash erase block size. Device capacity is rounded down to this
/// alignment so no two cache blocks share MLC data, and the two superblock
/// copies are kept one erase block apart.
pub const ERASE_BLOCK_SIZE: u64 = 128 * 1024;

/// Byte offset of superblock copy 0.
pub const HEADER0_OFFSET: u64 = 0;

/// Byte offset of superblock copy 1.
pub const HEADER1_OFFSET: u64 = ERASE_BLOCK_SIZE;

/// Byte offset of the first metadata or data block.
pub const FIRST_OFFSET: u64 = 2 * ERASE_BLOCK_SIZE;

/// Sector sentinel stored for slots with no cached data (all ones, the
/// two's-complement encoding of -1).
pub const SECTOR_NONE: u64 = u64::MAX;

/// 1-based cache block index.
pub type BlockId = u32;

/// Cache-wide transaction id, monotonically increasing per cache instance.
pub type Xid = u64;

/// On-device arrangement of metadata and data regions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheLayout {
    /// Packed metadata cells followed by data pages. For byte-addressable
    /// devices.
    Sequential,
    /// Adjacent (data page, metadata page) pairs. For block devices, so a
    /// block's data and metadata live next to each other.
    Interleaved,
}

impl CacheLayout {
    /// Discriminator byte persisted in the superblock.
    pub fn as_byte(self) -> u8 {
        match self {
            CacheLayout::Sequential => b'S',
            CacheLayout::Interleaved => b'I',
        }
    }

    /// Parse the persisted discriminator byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b'S' => Some(CacheLayout::Sequential),
            b'I' => Some(CacheLayout::Interleaved),
            _ => None,
        }
    }
}

/// Block states that may be persisted. Everything else a metadata record
/// can carry is either a transient mid-transaction state or corruption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum PersistState {
    /// Slot holds no cached data.
    Invalid = 0,
    /// Cached data matches the origin device.
    Clean = 1,
    /// Cached data is newer than the origin device.
    Dirty = 2,
}

impl PersistState {
    /// Decode a raw persisted status word into a persistable state.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PersistState::Invalid),
            1 => Some(PersistState::Clean),
            2 => Some(PersistState::Dirty),
            _ => None,
        }
    }

    /// Short name for log output.
    pub fn as_str(self) -> &'static str {
        match self {
            PersistState::Invalid => "invalid",
            PersistState::Clean => "clean",
            PersistState::Dirty => "dirty",
        }
    }
}

/// Number of states in the upper cache layer's transition table. Raw
/// status words below this bound that are not persistable states were
/// written mid-transaction; values at or above it never existed.
pub const STATE_TABLE_SIZE: u32 = 54;

/// Classification of a raw persisted status word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusClass {
    /// One of the three states that survive a crash.
    Persistable(PersistState),
    /// A recognized mid-transaction state; rolled back on restore.
    Transient,
    /// Not a state the cache layer could ever have written.
    Corrupt,
}

/// Classify a raw status word read back from the device.
pub fn classify_status(raw: u32) -> StatusClass {
    match PersistState::from_raw(raw) {
        Some(state) => StatusClass::Persistable(state),
        None if raw < STATE_TABLE_SIZE => StatusClass::Transient,
        None => StatusClass::Corrupt,
    }
}

/// In-core block descriptor the caller passes when staging metadata.
///
/// The engine reads these fields when building a metadata record; it never
/// stores the descriptor.
#[derive(Clone, Copy, Debug)]
pub struct CacheBlock {
    /// 1-based slot index.
    pub block_id: BlockId,
    /// Origin-device sector this block caches, or [`SECTOR_NONE`].
    pub sector: u64,
    /// Transaction id of the block's last state change.
    pub xid: Xid,
    /// Hash of the block's data page.
    pub hash_data: u128,
}

/// Outcome of restoring one block from the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockRestore {
    /// Metadata and data both validated; the descriptor fields to adopt.
    Valid {
        /// Origin-device sector.
        sector: u64,
        /// Restored state, `Clean` or `Dirty`.
        state: PersistState,
        /// Transaction id stored with the block.
        xid: Xid,
        /// Stored hash of the data page.
        hash_data: u128,
    },
    /// Slot is formatted but holds nothing.
    Invalid,
    /// Slot was mid-transaction at crash time; the caller reinitializes it.
    Transient,
}
