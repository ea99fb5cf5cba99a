#![forbid(unsafe_code)]

//! Block-device provider.
//!
//! The device only accepts whole-page transfers, so every context carries
//! a page-aligned bounce buffer and sub-page writes are zero-filled before
//! the caller's bytes are copied in, keeping stale memory out of
//! persistent storage. Metadata cells occupy a full page each and sit next
//! to their data page (interleaved layout) so a block's data and metadata
//! can be updated with adjacent I/O.
//!
//! Asynchronous operations are deferred to one submission worker per
//! provider instance; submission sites may not be allowed to perform I/O
//! themselves. Completion callbacks run on the worker thread.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::context::{BufferBinding, RequestContext};
use crate::error::{CacheError, Result};
use crate::io::{FileIo, StdFileIo};
use crate::provider::{IoCompletion, PmemProvider};
use crate::stats::PmemStats;
use crate::types::{CacheLayout, PAGE_SIZE};

enum BlockJob {
    MetadataWrite {
        meta_off: u64,
        ctx: RequestContext,
        done: IoCompletion,
        queued: Instant,
    },
    PageRead {
        data_off: u64,
        ctx: RequestContext,
        done: IoCompletion,
        queued: Instant,
    },
    PageWriteMeta {
        data_off: u64,
        meta_off: u64,
        ctx: RequestContext,
        done: IoCompletion,
        queued: Instant,
    },
    Shutdown,
}

/// Provider backed by a block device behind positioned file I/O.
pub struct BlockProvider {
    file: StdFileIo,
    size: u64,
    tx: Mutex<Option<Sender<BlockJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<PmemStats>,
}

impl BlockProvider {
    /// Open the provider over an already-sized device and start its
    /// submission worker.
    pub(crate) fn new(file: StdFileIo, stats: Arc<PmemStats>) -> Result<Self> {
        let size = file.len()?;
        if size == 0 {
            return Err(CacheError::InvalidArgument(
                "block device has zero size".into(),
            ));
        }
        let (tx, rx) = mpsc::channel();
        let worker_file = file.clone();
        let worker_stats = stats.clone();
        let worker = thread::Builder::new()
            .name("nvcache-blk".into())
            .spawn(move || worker_loop(worker_file, worker_stats, rx))
            .map_err(CacheError::from)?;
        info!(size, "opened block cache device");
        Ok(BlockProvider {
            file,
            size,
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            stats,
        })
    }

    fn submit(&self, job: BlockJob) {
        self.stats
            .pmem_make_req_wq_count
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let tx = self.tx.lock();
        let Some(sender) = tx.as_ref() else {
            drop(tx);
            fail_job(job);
            return;
        };
        if let Err(mpsc::SendError(job)) = sender.send(job) {
            fail_job(job);
        }
    }

    fn check_sync_args(&self, offset: u64, len: usize) {
        assert!(len > 0 && len <= PAGE_SIZE, "transfer larger than a page");
        assert_eq!(offset % PAGE_SIZE as u64, 0, "transfer offset misaligned");
        assert!(
            offset + PAGE_SIZE as u64 <= self.size,
            "transfer past device end: offset={offset}"
        );
    }
}

/// Complete a job that can no longer be submitted.
fn fail_job(job: BlockJob) {
    match job {
        BlockJob::MetadataWrite { mut ctx, done, .. }
        | BlockJob::PageWriteMeta { mut ctx, done, .. } => {
            ctx.unbind();
            done(ctx, Err(CacheError::stopped()));
        }
        BlockJob::PageRead { mut ctx, done, .. } => {
            ctx.unbind();
            done(ctx, Err(CacheError::stopped()));
        }
        BlockJob::Shutdown => {}
    }
}

/// Encode the staged record into the context page, zero-padded to a full
/// metadata cell.
fn fill_metadata_page(ctx: &mut RequestContext) {
    let record = ctx.staging;
    let page = ctx
        .page
        .as_mut()
        .expect("request context set up without a buffer");
    page.zero();
    record.encode(page.as_mut_slice());
}

fn worker_loop(file: StdFileIo, stats: Arc<PmemStats>, rx: Receiver<BlockJob>) {
    debug!("block submission worker running");
    while let Ok(job) = rx.recv() {
        match job {
            BlockJob::Shutdown => break,
            BlockJob::MetadataWrite {
                meta_off,
                mut ctx,
                done,
                queued,
            } => {
                stats.pmem_make_req_wq_timer.record(queued);
                fill_metadata_page(&mut ctx);
                let result = file.write_at(meta_off, ctx.data());
                ctx.unbind();
                done(ctx, result);
            }
            BlockJob::PageRead {
                data_off,
                mut ctx,
                done,
                queued,
            } => {
                stats.pmem_make_req_wq_timer.record(queued);
                let page = ctx
                    .page
                    .as_mut()
                    .expect("request context set up without a buffer");
                let result = file.read_at(data_off, page.as_mut_slice());
                // The binding stays live either way; the caller releases
                // it with the put.
                done(ctx, result);
            }
            BlockJob::PageWriteMeta {
                data_off,
                meta_off,
                mut ctx,
                done,
                queued,
            } => {
                stats.pmem_make_req_wq_timer.record(queued);
                let result = file
                    .write_at(data_off, ctx.data())
                    .and_then(|()| file.sync_all())
                    .and_then(|()| {
                        // Data is durable; now the trailing record may
                        // claim it.
                        let started = Instant::now();
                        stats
                            .data_put_page_write_metadata_count
                            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                        fill_metadata_page(&mut ctx);
                        let res = file.write_at(meta_off, ctx.data());
                        stats.data_put_page_write_metadata_timer.record(started);
                        res
                    });
                if let Err(err) = &result {
                    error!(data_off, meta_off, %err, "data put failed");
                }
                ctx.unbind();
                done(ctx, result);
            }
        }
    }
    debug!("block submission worker stopped");
}

impl PmemProvider for BlockProvider {
    fn api_name(&self) -> &'static str {
        "block"
    }

    fn page_size_transfer_only(&self) -> bool {
        true
    }

    fn cache_layout(&self) -> CacheLayout {
        CacheLayout::Interleaved
    }

    fn device_size_bytes(&self) -> u64 {
        self.size
    }

    fn read_sync(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let started = Instant::now();
        self.check_sync_args(offset, dst.len());
        let mut bounce = vec![0u8; PAGE_SIZE];
        self.file.read_at(offset, &mut bounce)?;
        dst.copy_from_slice(&bounce[..dst.len()]);
        self.stats.count_sync_read(dst.len(), started);
        Ok(())
    }

    fn write_sync(&self, offset: u64, src: &[u8]) -> Result<()> {
        let started = Instant::now();
        self.check_sync_args(offset, src.len());
        // Whole-page write with a zeroed tail, so a short record never
        // drags neighboring heap bytes onto persistent storage.
        let mut bounce = vec![0u8; PAGE_SIZE];
        bounce[..src.len()].copy_from_slice(src);
        self.file.write_at(offset, &bounce)?;
        self.stats.count_sync_write(src.len(), started);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()
    }

    fn metadata_write(&self, meta_off: u64, mut ctx: RequestContext, done: IoCompletion) {
        ctx.bind(BufferBinding::WriteBounce);
        self.submit(BlockJob::MetadataWrite {
            meta_off,
            ctx,
            done,
            queued: Instant::now(),
        });
    }

    fn page_read_bind(&self, data_off: u64, mut ctx: RequestContext, done: IoCompletion) {
        ctx.bind(BufferBinding::ReadBounce);
        self.submit(BlockJob::PageRead {
            data_off,
            ctx,
            done,
            queued: Instant::now(),
        });
    }

    fn page_read_release(&self, ctx: &mut RequestContext) {
        assert_eq!(
            ctx.binding(),
            BufferBinding::ReadBounce,
            "release of a non-read bounce binding"
        );
        ctx.unbind();
    }

    fn convert_read_to_write(&self, ctx: &mut RequestContext) {
        ctx.binding = ctx.binding.into_read_write();
    }

    fn clone_read_to_write(&self, ctx: &mut RequestContext) {
        // The bounce already holds the source block's bytes; only the
        // binding changes. The destination offset arrives with the put.
        ctx.binding = ctx.binding.into_read_write();
    }

    fn page_write_bind(&self, _data_off: u64, ctx: &mut RequestContext) {
        let page = ctx
            .page
            .as_mut()
            .expect("request context set up without a buffer");
        // Fresh write binding; do not leak a previous request's bytes.
        page.zero();
        ctx.bind(BufferBinding::WriteBounce);
    }

    fn page_write_put(&self, data_off: u64, meta_off: u64, ctx: RequestContext, done: IoCompletion) {
        assert!(
            ctx.binding().is_write(),
            "put on a non-write binding: {:?}",
            ctx.binding()
        );
        self.submit(BlockJob::PageWriteMeta {
            data_off,
            meta_off,
            ctx,
            done,
            queued: Instant::now(),
        });
    }

    fn shutdown(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(BlockJob::Shutdown);
        }
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!("block submission worker panicked");
            }
        }
    }
}

impl Drop for BlockProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}
