//! Direct-memory provider for byte-addressable devices.
//!
//! The device is mapped into the address space; transfers are memory
//! copies and every write is flushed to the device before the call
//! returns, so persistence is reached by the time a caller sees the
//! result. Completion callbacks therefore always fire synchronously.
//!
//! Metadata cells are stored packed at 64 bytes, which is the point of the
//! sequential layout: tens of millions of blocks cost megabytes instead of
//! gigabytes of metadata space.

// The single unsafe expression in the crate is the device mapping below.
#![allow(unsafe_code)]

use std::fs::File;
use std::sync::Arc;
use std::time::Instant;

use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::info;

use crate::context::{BufferBinding, RequestContext};
use crate::error::{CacheError, Result};
use crate::metadata::METADATA_RECORD_SIZE;
use crate::provider::{IoCompletion, PmemProvider};
use crate::stats::PmemStats;
use crate::types::{CacheLayout, PAGE_SIZE};

/// Provider backed by a memory-mapped byte-addressable device.
pub struct MemProvider {
    map: Mutex<MmapMut>,
    size: u64,
    stats: Arc<PmemStats>,
}

impl MemProvider {
    /// Map an already-sized device file.
    pub(crate) fn new(file: &File, stats: Arc<PmemStats>) -> Result<Self> {
        let size = file.metadata().map_err(CacheError::from)?.len();
        if size == 0 {
            return Err(CacheError::InvalidArgument(
                "byte-addressable device has zero size".into(),
            ));
        }
        let map = unsafe { MmapMut::map_mut(file) }.map_err(CacheError::from)?;
        info!(size, "mapped byte-addressable cache device");
        Ok(MemProvider {
            map: Mutex::new(map),
            size,
            stats,
        })
    }

    fn check_range(&self, offset: u64, len: usize) {
        assert!(len > 0 && len <= PAGE_SIZE, "transfer larger than a page");
        assert!(
            offset + len as u64 <= self.size,
            "transfer past device end: offset={offset} len={len}"
        );
        // A transfer must stay within one page of the device.
        let page_mask = !(PAGE_SIZE as u64 - 1);
        assert_eq!(
            offset & page_mask,
            (offset + len as u64 - 1) & page_mask,
            "transfer straddles a page boundary"
        );
    }

    /// Copy out of the device without touching transfer counters.
    fn load(&self, offset: u64, dst: &mut [u8]) {
        self.check_range(offset, dst.len());
        let map = self.map.lock();
        dst.copy_from_slice(&map[offset as usize..offset as usize + dst.len()]);
    }

    /// Copy into the device and flush the range, so the bytes are durable
    /// when this returns. Does not touch transfer counters.
    fn store(&self, offset: u64, src: &[u8]) -> Result<()> {
        self.check_range(offset, src.len());
        let mut map = self.map.lock();
        map[offset as usize..offset as usize + src.len()].copy_from_slice(src);
        map.flush_range(offset as usize, src.len())
            .map_err(CacheError::from)
    }
}

impl PmemProvider for MemProvider {
    fn api_name(&self) -> &'static str {
        "mem"
    }

    fn page_size_transfer_only(&self) -> bool {
        false
    }

    fn cache_layout(&self) -> CacheLayout {
        CacheLayout::Sequential
    }

    fn device_size_bytes(&self) -> u64 {
        self.size
    }

    fn read_sync(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let started = Instant::now();
        self.load(offset, dst);
        self.stats.count_sync_read(dst.len(), started);
        Ok(())
    }

    fn write_sync(&self, offset: u64, src: &[u8]) -> Result<()> {
        let started = Instant::now();
        self.store(offset, src)?;
        self.stats.count_sync_write(src.len(), started);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.map.lock().flush().map_err(CacheError::from)
    }

    fn metadata_write(&self, meta_off: u64, ctx: RequestContext, done: IoCompletion) {
        let mut record = [0u8; METADATA_RECORD_SIZE];
        ctx.staging.encode(&mut record);
        let result = self.store(meta_off, &record);
        done(ctx, result);
    }

    fn page_read_bind(&self, data_off: u64, mut ctx: RequestContext, done: IoCompletion) {
        let page = ctx
            .page
            .as_mut()
            .expect("request context set up without a buffer");
        self.load(data_off, page.as_mut_slice());
        ctx.bind(BufferBinding::ReadDirect);
        done(ctx, Ok(()));
    }

    fn page_read_release(&self, ctx: &mut RequestContext) {
        assert_eq!(
            ctx.binding(),
            BufferBinding::ReadDirect,
            "release of a non-read direct binding"
        );
        ctx.unbind();
    }

    fn convert_read_to_write(&self, ctx: &mut RequestContext) {
        ctx.binding = ctx.binding.into_read_write();
    }

    fn clone_read_to_write(&self, ctx: &mut RequestContext) {
        // The held page already carries the source block's bytes; the
        // destination offset arrives with the put.
        ctx.binding = ctx.binding.into_read_write();
    }

    fn page_write_bind(&self, data_off: u64, ctx: &mut RequestContext) {
        let page = ctx
            .page
            .as_mut()
            .expect("request context set up without a buffer");
        // Expose the current page content, as a direct mapping would.
        self.load(data_off, page.as_mut_slice());
        ctx.bind(BufferBinding::WriteDirect);
    }

    fn page_write_put(&self, data_off: u64, meta_off: u64, mut ctx: RequestContext, done: IoCompletion) {
        assert!(
            ctx.binding().is_write(),
            "put on a non-write binding: {:?}",
            ctx.binding()
        );
        let result = self
            .store(data_off, ctx.data())
            .and_then(|()| {
                let mut record = [0u8; METADATA_RECORD_SIZE];
                ctx.staging.encode(&mut record);
                self.store(meta_off, &record)
            });
        ctx.unbind();
        done(ctx, result);
    }

    fn shutdown(&self) {}
}
