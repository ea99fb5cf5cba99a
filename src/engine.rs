#![forbid(unsafe_code)]

//! The cache engine facade.
//!
//! Owns the selected storage provider, the in-memory superblock and its
//! double-buffered on-device copies, the periodic header updater, the page
//! buffer pools, and the restore logic. The upper cache layer drives all
//! state transitions; this engine persists them and hands back whatever
//! survived a crash.
//!
//! Once a header update fails the engine enters a terminal fail-all state
//! and every subsequent call reports an I/O error, so the upper layer can
//! fail host requests instead of silently running without durability.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::context::{PagePool, PoolKind, RequestContext};
use crate::error::{CacheError, Result};
use crate::hash::hash128;
use crate::header::Header;
use crate::io::StdFileIo;
use crate::layout;
use crate::metadata::{BlockMetadata, RawRecord, METADATA_MAGIC, METADATA_RECORD_SIZE};
use crate::provider::block::BlockProvider;
use crate::provider::mem::MemProvider;
use crate::provider::{IoCompletion, PmemProvider};
use crate::stats::{PmemStats, StatsSnapshot};
use crate::types::{
    classify_status, BlockId, BlockRestore, CacheBlock, CacheLayout, PersistState, StatusClass,
    Xid, FIRST_OFFSET, HEADER0_OFFSET, HEADER1_OFFSET, PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_NONE,
};

/// How the cache device is accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    /// Byte-addressable persistent memory; sequential layout, packed
    /// metadata cells.
    DirectMemory,
    /// Block device; interleaved layout, page-sized metadata cells.
    BlockDevice,
}

/// Configuration for [`PmemEngine::allocate`].
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Provider to drive the device with.
    pub provider: ProviderKind,
    /// Cache name recorded in the superblock.
    pub cache_name: String,
    /// Cached origin device name recorded in the superblock.
    pub device_name: String,
    /// If set, size the backing file to this many bytes before opening
    /// the provider. Raw devices report their own size.
    pub device_size: Option<u64>,
    /// Period of the background header updater.
    pub header_update_interval: Duration,
    /// Bound on outstanding request-context buffers.
    pub map_pool_limit: usize,
    /// Bound on outstanding worker-context buffers.
    pub worker_pool_limit: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            provider: ProviderKind::BlockDevice,
            cache_name: String::new(),
            device_name: String::new(),
            device_size: None,
            header_update_interval: Duration::from_secs(30),
            map_pool_limit: 1024,
            worker_pool_limit: 256,
        }
    }
}

#[derive(Default)]
struct HeaderSlot {
    header: Option<Header>,
    /// Which copy the last update wrote; updates write the other one.
    updated_last: u8,
}

struct Shared {
    provider: Box<dyn PmemProvider>,
    header: Mutex<HeaderSlot>,
    xid: AtomicU64,
    fail_all: AtomicBool,
    stats: Arc<PmemStats>,
}

struct Updater {
    tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// The persistent-memory cache engine.
pub struct PmemEngine {
    shared: Arc<Shared>,
    map_pool: PagePool,
    worker_pool: PagePool,
    updater: Mutex<Option<Updater>>,
    update_interval: Duration,
    cache_name: String,
    device_name: String,
}

impl PmemEngine {
    /// Open the cache device at `path` and attach the configured provider.
    /// The cache is not usable until [`header_initialize`] or
    /// [`header_restore`] has run.
    ///
    /// [`header_initialize`]: PmemEngine::header_initialize
    /// [`header_restore`]: PmemEngine::header_restore
    pub fn allocate(path: impl AsRef<Path>, options: EngineOptions) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())
            .map_err(CacheError::from)?;
        if let Some(size) = options.device_size {
            file.set_len(size).map_err(CacheError::from)?;
        }
        let stats = Arc::new(PmemStats::default());
        let provider: Box<dyn PmemProvider> = match options.provider {
            ProviderKind::DirectMemory => Box::new(MemProvider::new(&file, stats.clone())?),
            ProviderKind::BlockDevice => {
                Box::new(BlockProvider::new(StdFileIo::new(file), stats.clone())?)
            }
        };
        info!(
            api = provider.api_name(),
            device_size = provider.device_size_bytes(),
            "allocated cache engine"
        );
        Ok(PmemEngine {
            shared: Arc::new(Shared {
                provider,
                header: Mutex::new(HeaderSlot::default()),
                xid: AtomicU64::new(0),
                fail_all: AtomicBool::new(false),
                stats,
            }),
            map_pool: PagePool::new(options.map_pool_limit),
            worker_pool: PagePool::new(options.worker_pool_limit),
            updater: Mutex::new(None),
            update_interval: options.header_update_interval,
            cache_name: options.cache_name,
            device_name: options.device_name,
        })
    }

    fn guard(&self) -> Result<()> {
        if self.shared.fail_all.load(Ordering::Relaxed) {
            return Err(CacheError::fail_all());
        }
        Ok(())
    }

    fn pool(&self, kind: PoolKind) -> &PagePool {
        match kind {
            PoolKind::Map => &self.map_pool,
            PoolKind::Worker => &self.worker_pool,
        }
    }

    /// Metadata and data offsets for `block_id`, validated against the
    /// current header.
    fn offsets(&self, block_id: BlockId) -> Result<(u64, u64)> {
        let slot = self.shared.header.lock();
        let header = slot
            .header
            .as_ref()
            .ok_or_else(|| CacheError::InvalidArgument("cache not formatted or restored".into()))?;
        if block_id < 1 || u64::from(block_id) > header.cache_blocks {
            return Err(CacheError::InvalidArgument(format!(
                "block id {block_id} outside 1..={}",
                header.cache_blocks
            )));
        }
        Ok((
            layout::metadata_offset(header, u64::from(block_id)),
            layout::data_offset(header, u64::from(block_id)),
        ))
    }

    // ------------------------------------------------------------------
    // Header management
    // ------------------------------------------------------------------

    /// Format the device: size the geometry, stamp fresh identities, and
    /// write both superblock copies.
    pub fn header_initialize(&self) -> Result<()> {
        self.guard()?;
        let provider = &self.shared.provider;
        let mut header = Header::format(
            provider.cache_layout(),
            provider.page_size_transfer_only(),
            provider.device_size_bytes(),
            &self.cache_name,
            &self.device_name,
        )?;
        layout::check_offsets(&header)?;

        let mut buf = vec![0u8; PAGE_SIZE];
        header.xid_current += 1;
        header.encode(&mut buf);
        provider.write_sync(HEADER0_OFFSET, &buf)?;
        header.xid_current += 1;
        header.encode(&mut buf);
        provider.write_sync(HEADER1_OFFSET, &buf)?;
        provider.sync()?;

        self.shared.xid.store(header.xid_current + 1, Ordering::SeqCst);
        info!(
            cache_blocks = header.cache_blocks,
            xid = header.xid_current + 1,
            "initialized cache header"
        );
        let mut slot = self.shared.header.lock();
        slot.header = Some(header);
        slot.updated_last = 0;
        Ok(())
    }

    /// Restore the superblock from the device. Each copy validates
    /// independently; the valid copy with the higher transaction id is
    /// adopted (ties go to copy 1) and the engine's transaction counter
    /// moves strictly past both stored copies.
    pub fn header_restore(&self) -> Result<()> {
        self.guard()?;
        let provider = &self.shared.provider;
        let stats = &self.shared.stats;
        if provider.device_size_bytes() < FIRST_OFFSET {
            return Err(CacheError::HeaderCorrupt("device smaller than header region"));
        }

        let read_copy = |offset: u64| -> Result<Header> {
            let mut buf = vec![0u8; PAGE_SIZE];
            provider.read_sync(offset, &mut buf)?;
            Header::decode(&buf)
        };

        let copy0 = read_copy(HEADER0_OFFSET);
        let copy1 = read_copy(HEADER1_OFFSET);
        match &copy0 {
            Ok(header) => {
                stats.restore_header0_valid.store(1, Ordering::Relaxed);
                info!(xid = header.xid_current, "header copy 0 valid");
            }
            Err(err) => warn!(%err, "header copy 0 invalid"),
        }
        match &copy1 {
            Ok(header) => {
                stats.restore_header1_valid.store(1, Ordering::Relaxed);
                info!(xid = header.xid_current, "header copy 1 valid");
            }
            Err(err) => warn!(%err, "header copy 1 invalid"),
        }

        let adopt = match (&copy0, &copy1) {
            (Err(_), Err(_)) => {
                error!("both header copies invalid");
                return Err(CacheError::HeaderCorrupt("both header copies invalid"));
            }
            (Ok(_), Err(_)) => 0u8,
            (Err(_), Ok(_)) => 1u8,
            (Ok(h0), Ok(h1)) => {
                if h0.xid_current > h1.xid_current {
                    0
                } else {
                    1
                }
            }
        };

        // Re-read the surviving copy so the in-memory header is exactly
        // what the device holds.
        let offset = if adopt == 0 { HEADER0_OFFSET } else { HEADER1_OFFSET };
        let header = read_copy(offset)?;
        info!(copy = adopt, xid = header.xid_current, "adopting header copy");
        self.shared
            .xid
            .store(header.xid_current + 2, Ordering::SeqCst);

        header.validate_against(
            provider.cache_layout(),
            provider.page_size_transfer_only(),
            provider.device_size_bytes(),
        )?;
        stats.restore_header_valid.store(1, Ordering::Relaxed);
        info!(
            name = %header.name,
            device = %header.device_name,
            cache_blocks = header.cache_blocks,
            uuid = %hex::encode(header.uuid),
            "cache restore ok"
        );
        let mut slot = self.shared.header.lock();
        slot.header = Some(header);
        Ok(())
    }

    /// Persist the current transaction id into one superblock copy,
    /// alternating with the previous update, or into both on request.
    /// No-op when nothing has advanced since the last update.
    pub fn header_update(&self, update_both: bool) -> Result<()> {
        self.guard()?;
        self.shared.header_update(update_both)
    }

    /// Start the periodic header updater. An update failure moves the
    /// engine to the fail-all state.
    pub fn header_update_start(&self) {
        let mut updater = self.updater.lock();
        if updater.is_some() {
            return;
        }
        let (tx, rx) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let interval = self.update_interval;
        let handle = thread::Builder::new()
            .name("nvcache-hdr".into())
            .spawn(move || updater_loop(shared, rx, interval))
            .expect("spawn header updater");
        *updater = Some(Updater { tx, handle });
    }

    /// Stop the periodic updater, waiting for an in-flight update to
    /// finish.
    pub fn header_update_stop(&self) {
        if let Some(updater) = self.updater.lock().take() {
            let _ = updater.tx.send(());
            let _ = updater.handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Metadata operations
    // ------------------------------------------------------------------

    /// Write the formatted-empty record for `block_id`.
    pub fn metadata_initialize(&self, block_id: BlockId) -> Result<()> {
        self.guard()?;
        let (meta_off, _) = self.offsets(block_id)?;
        let mut buf = [0u8; METADATA_RECORD_SIZE];
        BlockMetadata::invalid(block_id).encode(&mut buf);
        self.shared.provider.write_sync(meta_off, &buf)
    }

    /// Read and validate `block_id`'s metadata record.
    pub fn metadata_sync_read(&self, block_id: BlockId) -> Result<BlockMetadata> {
        self.guard()?;
        let started = Instant::now();
        let (meta_off, _) = self.offsets(block_id)?;
        let mut buf = [0u8; METADATA_RECORD_SIZE];
        self.shared.provider.read_sync(meta_off, &mut buf)?;
        self.shared
            .stats
            .metadata_read_count
            .fetch_add(1, Ordering::Relaxed);
        self.shared.stats.metadata_read_timer.record(started);
        BlockMetadata::decode(&buf, block_id)
    }

    /// Asynchronously persist a record describing `block` in `state`.
    /// `state` may be any persistable state, including `Invalid` for
    /// invalidations.
    pub fn metadata_async_write(
        &self,
        block: &CacheBlock,
        state: PersistState,
        mut ctx: RequestContext,
        done: IoCompletion,
    ) {
        let started = Instant::now();
        if self.guard().is_err() {
            done(ctx, Err(CacheError::fail_all()));
            return;
        }
        let meta_off = match self.offsets(block.block_id) {
            Ok((meta_off, _)) => meta_off,
            Err(err) => {
                done(ctx, Err(err));
                return;
            }
        };
        self.shared
            .stats
            .metadata_write_async_count
            .fetch_add(1, Ordering::Relaxed);
        ctx.staging = BlockMetadata::stage(block, state);
        let stats = Arc::clone(&self.shared.stats);
        let done: IoCompletion = Box::new(move |ctx, res| {
            stats.metadata_write_async_timer.record(started);
            done(ctx, res);
        });
        self.shared.provider.metadata_write(meta_off, ctx, done);
    }

    /// Restore one block: validate its metadata record and, for blocks
    /// carrying data, the data page hash.
    pub fn block_restore(&self, block_id: BlockId) -> Result<BlockRestore> {
        self.guard()?;
        let (meta_off, data_off) = self.offsets(block_id)?;
        let stats = &self.shared.stats;

        let mut buf = [0u8; METADATA_RECORD_SIZE];
        self.shared.provider.read_sync(meta_off, &mut buf)?;
        let raw = RawRecord::parse(&buf)?;
        if raw.magic != METADATA_MAGIC {
            stats
                .restore_corrupt_metadata_blocks
                .fetch_add(1, Ordering::Relaxed);
            error!(block_id, magic = raw.magic, "metadata magic mismatch");
            return Err(CacheError::CorruptMetadata {
                block_id,
                reason: "bad magic",
            });
        }
        if raw.computed_hash != raw.stored_hash {
            stats
                .restore_hash_corrupt_metadata_blocks
                .fetch_add(1, Ordering::Relaxed);
            error!(block_id, "metadata hash mismatch");
            return Err(CacheError::HashCorruptMetadata { block_id });
        }

        let record = raw.record;
        let state = match classify_status(record.status) {
            StatusClass::Corrupt => {
                stats
                    .restore_corrupt_metadata_blocks
                    .fetch_add(1, Ordering::Relaxed);
                error!(block_id, status = record.status, "impossible block status");
                return Err(CacheError::CorruptMetadata {
                    block_id,
                    reason: "impossible status",
                });
            }
            StatusClass::Persistable(PersistState::Invalid) => {
                stats
                    .restore_invalid_metadata_blocks
                    .fetch_add(1, Ordering::Relaxed);
                stats
                    .restore_invalid_data_blocks
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(BlockRestore::Invalid);
            }
            StatusClass::Transient => {
                // Crash mid-transaction. Normal; the caller reinitializes
                // the slot.
                stats
                    .restore_pending_metadata_blocks
                    .fetch_add(1, Ordering::Relaxed);
                debug!(block_id, status = record.status, "transient state, skipping");
                return Ok(BlockRestore::Transient);
            }
            StatusClass::Persistable(state) => state,
        };

        if record.block_id != block_id {
            stats
                .restore_corrupt_metadata_blocks
                .fetch_add(1, Ordering::Relaxed);
            error!(block_id, stored = record.block_id, "slot id mismatch");
            return Err(CacheError::CorruptMetadata {
                block_id,
                reason: "slot id mismatch",
            });
        }
        if record.sector == SECTOR_NONE || record.sector % SECTORS_PER_PAGE != 0 {
            stats
                .restore_corrupt_metadata_blocks
                .fetch_add(1, Ordering::Relaxed);
            error!(block_id, sector = record.sector, "bad sector in valid block");
            return Err(CacheError::CorruptMetadata {
                block_id,
                reason: "bad sector",
            });
        }
        match state {
            PersistState::Clean => stats
                .restore_valid_clean_metadata_blocks
                .fetch_add(1, Ordering::Relaxed),
            _ => stats
                .restore_valid_dirty_metadata_blocks
                .fetch_add(1, Ordering::Relaxed),
        };

        let mut page = vec![0u8; PAGE_SIZE];
        self.shared.provider.read_sync(data_off, &mut page)?;
        let computed = hash128(&page);
        if computed != record.hash_data {
            stats
                .restore_hash_corrupt_data_blocks
                .fetch_add(1, Ordering::Relaxed);
            error!(block_id, "data hash mismatch");
            return Err(CacheError::HashCorruptData { block_id });
        }
        match state {
            PersistState::Clean => stats
                .restore_valid_clean_data_blocks
                .fetch_add(1, Ordering::Relaxed),
            _ => stats
                .restore_valid_dirty_data_blocks
                .fetch_add(1, Ordering::Relaxed),
        };

        debug!(
            block_id,
            state = state.as_str(),
            sector = record.sector,
            xid = record.xid,
            "block restore ok"
        );
        Ok(BlockRestore::Valid {
            sector: record.sector,
            state,
            xid: record.xid,
            hash_data: record.hash_data,
        })
    }

    // ------------------------------------------------------------------
    // Data page operations
    // ------------------------------------------------------------------

    /// Bind `ctx` to a readable view of `block`'s data page. The callback
    /// fires when the page is available, possibly before this returns.
    pub fn data_get_page_read(&self, block: &CacheBlock, ctx: RequestContext, done: IoCompletion) {
        let started = Instant::now();
        if self.guard().is_err() {
            done(ctx, Err(CacheError::fail_all()));
            return;
        }
        let data_off = match self.offsets(block.block_id) {
            Ok((_, data_off)) => data_off,
            Err(err) => {
                done(ctx, Err(err));
                return;
            }
        };
        let stats = &self.shared.stats;
        stats
            .data_get_page_read_count
            .fetch_add(1, Ordering::Relaxed);
        stats.data_get_put_page_pending.fetch_add(1, Ordering::Relaxed);
        let stats = Arc::clone(&self.shared.stats);
        let done: IoCompletion = Box::new(move |ctx, res| {
            stats.data_get_page_read_timer.record(started);
            done(ctx, res);
        });
        self.shared.provider.page_read_bind(data_off, ctx, done);
    }

    /// Release a read binding acquired with [`data_get_page_read`].
    ///
    /// [`data_get_page_read`]: PmemEngine::data_get_page_read
    pub fn data_put_page_read(&self, block: &CacheBlock, ctx: &mut RequestContext) {
        let started = Instant::now();
        let stats = &self.shared.stats;
        stats
            .data_put_page_read_count
            .fetch_add(1, Ordering::Relaxed);
        stats.data_get_put_page_pending.fetch_sub(1, Ordering::Relaxed);
        self.shared.provider.page_read_release(ctx);
        stats.data_put_page_read_timer.record(started);
        debug!(block_id = block.block_id, "released read page");
    }

    /// Convert an in-hand read view into a write view without copying.
    /// Used for read-modify-write cycles.
    pub fn data_convert_read_to_write(&self, block: &CacheBlock, ctx: &mut RequestContext) {
        self.shared
            .stats
            .data_convert_page_read_to_write_count
            .fetch_add(1, Ordering::Relaxed);
        self.shared.provider.convert_read_to_write(ctx);
        debug!(block_id = block.block_id, "converted read page to write");
    }

    /// Turn a read view of `from` into a write view for `to`, keeping the
    /// page contents. The data lands at `to`'s offsets on the next put.
    pub fn data_clone_read_to_write(
        &self,
        from: &CacheBlock,
        to: &CacheBlock,
        ctx: &mut RequestContext,
    ) {
        assert_ne!(
            from.block_id, to.block_id,
            "clone source and destination must differ"
        );
        self.shared
            .stats
            .data_clone_read_page_to_write_page_count
            .fetch_add(1, Ordering::Relaxed);
        self.shared.provider.clone_read_to_write(ctx);
        debug!(
            from = from.block_id,
            to = to.block_id,
            "cloned read page to write page"
        );
    }

    /// Bind `ctx` to a writable page for `block`. The caller fills the
    /// page, then flushes it with [`data_put_page_write`].
    ///
    /// [`data_put_page_write`]: PmemEngine::data_put_page_write
    pub fn data_get_page_write(&self, block: &CacheBlock, ctx: &mut RequestContext) -> Result<()> {
        let started = Instant::now();
        self.guard()?;
        let (_, data_off) = self.offsets(block.block_id)?;
        let stats = &self.shared.stats;
        stats
            .data_get_page_write_count
            .fetch_add(1, Ordering::Relaxed);
        stats.data_get_put_page_pending.fetch_add(1, Ordering::Relaxed);
        self.shared.provider.page_write_bind(data_off, ctx);
        stats.data_get_page_write_timer.record(started);
        Ok(())
    }

    /// Flush the bound page and persist a metadata record stamping the
    /// block `Clean` or `Dirty`, atomically from the caller's view: the
    /// data write is durable before the record is written, and `done`
    /// fires once with the combined outcome.
    pub fn data_put_page_write(
        &self,
        block: &CacheBlock,
        state: PersistState,
        mut ctx: RequestContext,
        done: IoCompletion,
    ) {
        assert!(
            matches!(state, PersistState::Clean | PersistState::Dirty),
            "data puts persist clean or dirty only"
        );
        let started = Instant::now();
        if self.guard().is_err() {
            done(ctx, Err(CacheError::fail_all()));
            return;
        }
        let (meta_off, data_off) = match self.offsets(block.block_id) {
            Ok(offsets) => offsets,
            Err(err) => {
                done(ctx, Err(err));
                return;
            }
        };
        let stats = &self.shared.stats;
        stats
            .data_put_page_write_count
            .fetch_add(1, Ordering::Relaxed);
        stats.data_get_put_page_pending.fetch_sub(1, Ordering::Relaxed);
        ctx.staging = BlockMetadata::stage(block, state);
        let stats = Arc::clone(&self.shared.stats);
        let done: IoCompletion = Box::new(move |ctx, res| {
            stats.data_put_page_write_timer.record(started);
            done(ctx, res);
        });
        self.shared
            .provider
            .page_write_put(data_off, meta_off, ctx, done);
    }

    // ------------------------------------------------------------------
    // Request contexts
    // ------------------------------------------------------------------

    /// Attach a page buffer from `pool` to `ctx`.
    pub fn context_setup(&self, pool: PoolKind, ctx: &mut RequestContext) -> Result<()> {
        self.guard()?;
        let page = self.pool(pool).acquire()?;
        ctx.attach(pool, page);
        Ok(())
    }

    /// Return `ctx`'s buffer to its pool. The context must not have a
    /// live binding.
    pub fn context_destroy(&self, ctx: &mut RequestContext) {
        if let Some((pool, page)) = ctx.detach() {
            self.pool(pool).release(page);
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Provider name, `"mem"` or `"block"`.
    pub fn api_name(&self) -> &'static str {
        self.shared.provider.api_name()
    }

    /// True if the device only accepts page-sized transfers.
    pub fn page_size_transfer_only(&self) -> bool {
        self.shared.provider.page_size_transfer_only()
    }

    /// On-device layout.
    pub fn cache_layout(&self) -> CacheLayout {
        self.shared.provider.cache_layout()
    }

    /// Device capacity in bytes.
    pub fn device_size_bytes(&self) -> u64 {
        self.shared.provider.device_size_bytes()
    }

    /// Copy of the in-memory superblock, if formatted or restored.
    pub fn header(&self) -> Option<Header> {
        self.shared.header.lock().header.clone()
    }

    /// Number of cache blocks, once formatted or restored.
    pub fn cache_blocks(&self) -> Option<u64> {
        self.shared.header.lock().header.as_ref().map(|h| h.cache_blocks)
    }

    /// Byte offset of `block_id`'s metadata cell.
    pub fn metadata_offset(&self, block_id: BlockId) -> Result<u64> {
        self.offsets(block_id).map(|(meta_off, _)| meta_off)
    }

    /// Byte offset of `block_id`'s data page.
    pub fn data_offset(&self, block_id: BlockId) -> Result<u64> {
        self.offsets(block_id).map(|(_, data_off)| data_off)
    }

    /// Current cache-wide transaction id.
    pub fn xid(&self) -> Xid {
        self.shared.xid.load(Ordering::SeqCst)
    }

    /// Advance the cache-wide transaction id, returning the new value.
    pub fn bump_xid(&self) -> Xid {
        self.shared.xid.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// True once a failed header update has latched the engine into the
    /// fail-all state.
    pub fn error_state(&self) -> bool {
        self.shared.fail_all.load(Ordering::Relaxed)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Reach a durability point for everything written so far.
    pub fn flush(&self) -> Result<()> {
        self.guard()?;
        self.shared.provider.sync()
    }

    /// Tear the engine down: stop the updater and drain the provider's
    /// submission queue. Also runs on drop.
    pub fn deallocate(&self) {
        self.header_update_stop();
        self.shared.provider.shutdown();
        let pending = self
            .shared
            .stats
            .data_get_put_page_pending
            .load(Ordering::Relaxed);
        if pending != 0 {
            warn!(pending, "tearing down with pages still bound");
        }
    }
}

impl Drop for PmemEngine {
    fn drop(&mut self) {
        self.deallocate();
    }
}

impl Shared {
    fn header_update(&self, update_both: bool) -> Result<()> {
        let mut slot = self.header.lock();
        let header = slot
            .header
            .as_mut()
            .ok_or_else(|| CacheError::InvalidArgument("cache not formatted or restored".into()))?;
        let current = self.xid.load(Ordering::SeqCst);
        debug_assert!(header.xid_current <= current);
        if header.xid_current == current {
            return Ok(());
        }
        header.xid_current = current;
        let mut buf = vec![0u8; PAGE_SIZE];
        header.encode(&mut buf);
        if slot.updated_last == 1 || update_both {
            self.provider.write_sync(HEADER0_OFFSET, &buf)?;
        }
        if slot.updated_last == 0 || update_both {
            self.provider.write_sync(HEADER1_OFFSET, &buf)?;
        }
        self.provider.sync()?;
        slot.updated_last = (slot.updated_last + 1) % 2;
        debug!(xid = current, last = slot.updated_last, "header updated");
        Ok(())
    }
}

fn updater_loop(shared: Arc<Shared>, rx: Receiver<()>, interval: Duration) {
    debug!("header updater running");
    loop {
        match rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                if shared.fail_all.load(Ordering::Relaxed) {
                    continue;
                }
                if let Err(err) = shared.header_update(false) {
                    error!(%err, "cannot update header, failing all future requests");
                    shared.fail_all.store(true, Ordering::Relaxed);
                }
            }
        }
    }
    debug!("header updater stopped");
}
