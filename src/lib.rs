//! # nvcache - persistent-memory block cache engine
//!
//! `nvcache` persists page-sized cache blocks and their metadata on a fast
//! device (byte-addressable NVDIMM-style memory, or a block device such as
//! NVMe) sitting in front of a slower origin disk. After a crash the cache
//! restores itself: clean and dirty blocks come back verified against
//! 128-bit content hashes, torn state is detected, and blocks caught
//! mid-transaction are reported for reinitialization instead of being
//! trusted.
//!
//! ## Quick start
//!
//! ```no_run
//! use nvcache::{EngineOptions, PmemEngine, ProviderKind};
//!
//! let mut options = EngineOptions::default();
//! options.provider = ProviderKind::BlockDevice;
//! options.cache_name = "cache0".into();
//! options.device_size = Some(64 << 20);
//!
//! let engine = PmemEngine::allocate("/tmp/cache.dev", options)?;
//! engine.header_initialize()?;
//! for block_id in 1..=engine.cache_blocks().unwrap() as u32 {
//!     engine.metadata_initialize(block_id)?;
//! }
//! engine.header_update_start();
//! # Ok::<(), nvcache::CacheError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Providers**: one engine interface, two device drivers. The
//!   direct-memory provider maps the device and moves pages with flushed
//!   memory copies; the block provider bounces every transfer through
//!   page-aligned buffers and a single submission worker.
//! - **Header manager**: two superblock copies one erase block apart,
//!   written alternately with a monotonically increasing transaction id,
//!   so one valid copy survives any crash.
//! - **Restore engine**: validates both header copies, adopts the newer,
//!   then classifies every block by magic, metadata hash, persisted
//!   state, and data hash.
//! - **Request contexts**: caller-owned per-request state carrying a
//!   pooled page buffer through async operations, handed back through
//!   completion callbacks.

pub mod context;
pub mod engine;
pub mod error;
pub mod hash;
pub mod header;
pub mod io;
pub mod layout;
pub mod metadata;
pub mod provider;
pub mod stats;
pub mod types;

pub use crate::context::{BufferBinding, PoolKind, RequestContext};
pub use crate::engine::{EngineOptions, PmemEngine, ProviderKind};
pub use crate::error::{CacheError, Result};
pub use crate::header::Header;
pub use crate::metadata::{BlockMetadata, METADATA_RECORD_SIZE};
pub use crate::provider::IoCompletion;
pub use crate::stats::StatsSnapshot;
pub use crate::types::{
    BlockId, BlockRestore, CacheBlock, CacheLayout, PersistState, Xid, PAGE_SIZE, SECTOR_NONE,
};
