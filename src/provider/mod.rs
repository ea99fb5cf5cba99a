//! Storage providers.
//!
//! A provider knows how to move pages and metadata records between memory
//! and one kind of cache device. The engine selects a provider when the
//! cache is allocated and dispatches every transfer through this trait.
//! Two implementations exist: [`mem::MemProvider`] for byte-addressable
//! devices and [`block::BlockProvider`] for block devices.

pub mod block;
pub mod mem;

use crate::context::RequestContext;
use crate::error::Result;
use crate::types::CacheLayout;

/// Completion callback for asynchronous provider operations. Receives the
/// caller's context back together with the outcome; invoked exactly once,
/// possibly before the submitting call returns.
pub type IoCompletion = Box<dyn FnOnce(RequestContext, Result<()>) + Send + 'static>;

/// Capability set every provider implements.
///
/// Sync transfers may block for device I/O. Async operations return
/// promptly; the block provider runs them on its submission worker, the
/// memory provider completes them before returning.
pub trait PmemProvider: Send + Sync {
    /// Short provider name for logs and introspection.
    fn api_name(&self) -> &'static str;

    /// True if the device only accepts page-sized transfers.
    fn page_size_transfer_only(&self) -> bool;

    /// On-device layout this provider formats and expects.
    fn cache_layout(&self) -> CacheLayout;

    /// Device capacity in bytes.
    fn device_size_bytes(&self) -> u64;

    /// Synchronous read of up to one page. `offset` must be page-aligned.
    fn read_sync(&self, offset: u64, dst: &mut [u8]) -> Result<()>;

    /// Synchronous write of up to one page. `offset` must be page-aligned.
    /// Sub-page writes to a block device land in a zero-filled page.
    fn write_sync(&self, offset: u64, src: &[u8]) -> Result<()>;

    /// Reach a durability point for everything written so far.
    fn sync(&self) -> Result<()>;

    /// Write the record staged in `ctx` at `meta_off`.
    fn metadata_write(&self, meta_off: u64, ctx: RequestContext, done: IoCompletion);

    /// Bind `ctx` to a readable view of the page at `data_off`. The page
    /// is valid from the callback until the matching release.
    fn page_read_bind(&self, data_off: u64, ctx: RequestContext, done: IoCompletion);

    /// Release a read binding.
    fn page_read_release(&self, ctx: &mut RequestContext);

    /// Convert an in-hand read binding to read-write without copying.
    fn convert_read_to_write(&self, ctx: &mut RequestContext);

    /// Turn a read binding into a write binding destined for another
    /// block, keeping the page contents.
    fn clone_read_to_write(&self, ctx: &mut RequestContext);

    /// Bind `ctx` to a writable page for the block at `data_off`.
    fn page_write_bind(&self, data_off: u64, ctx: &mut RequestContext);

    /// Flush the bound page to `data_off`, then persist the record staged
    /// in `ctx` at `meta_off`. The data write is durable before the
    /// metadata write is issued; `done` fires once with the combined
    /// outcome.
    fn page_write_put(&self, data_off: u64, meta_off: u64, ctx: RequestContext, done: IoCompletion);

    /// Stop accepting submissions and drain in-flight work.
    fn shutdown(&self);
}
