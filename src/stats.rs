#![forbid(unsafe_code)]

//! Engine statistics.
//!
//! Observable, not part of the correctness contract. Counters are relaxed
//! atomics; timers accumulate call count and total elapsed nanoseconds.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Count plus cumulative elapsed time for one operation kind.
#[derive(Default)]
pub struct OpTimer {
    count: AtomicU64,
    total_ns: AtomicU64,
}

impl OpTimer {
    /// Record one operation that started at `started`.
    pub fn record(&self, started: Instant) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_ns
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Number of recorded operations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Total elapsed nanoseconds across recorded operations.
    pub fn total_ns(&self) -> u64 {
        self.total_ns.load(Ordering::Relaxed)
    }
}

/// Counters and timers the engine maintains.
#[derive(Default)]
pub struct PmemStats {
    /// 1 once a restore has adopted a header copy.
    pub restore_header_valid: AtomicU64,
    /// 1 if header copy 0 validated during restore.
    pub restore_header0_valid: AtomicU64,
    /// 1 if header copy 1 validated during restore.
    pub restore_header1_valid: AtomicU64,
    /// Blocks whose metadata was structurally bad.
    pub restore_corrupt_metadata_blocks: AtomicU64,
    /// Blocks restored clean, metadata side.
    pub restore_valid_clean_metadata_blocks: AtomicU64,
    /// Blocks restored dirty, metadata side.
    pub restore_valid_dirty_metadata_blocks: AtomicU64,
    /// Formatted-but-empty slots, metadata side.
    pub restore_invalid_metadata_blocks: AtomicU64,
    /// Slots persisted mid-transaction.
    pub restore_pending_metadata_blocks: AtomicU64,
    /// Formatted-but-empty slots, data side.
    pub restore_invalid_data_blocks: AtomicU64,
    /// Blocks restored clean, data side.
    pub restore_valid_clean_data_blocks: AtomicU64,
    /// Blocks restored dirty, data side.
    pub restore_valid_dirty_data_blocks: AtomicU64,
    /// Blocks whose metadata hash did not match.
    pub restore_hash_corrupt_metadata_blocks: AtomicU64,
    /// Blocks whose data hash did not match.
    pub restore_hash_corrupt_data_blocks: AtomicU64,

    /// Synchronous metadata reads.
    pub metadata_read_count: AtomicU64,
    /// Async metadata writes, including trailing writes of data puts.
    pub metadata_write_async_count: AtomicU64,
    /// Pages currently bound between a get and the matching put.
    pub data_get_put_page_pending: AtomicI64,
    /// Read bindings established.
    pub data_get_page_read_count: AtomicU64,
    /// Read bindings released.
    pub data_put_page_read_count: AtomicU64,
    /// Write bindings established.
    pub data_get_page_write_count: AtomicU64,
    /// Write bindings flushed.
    pub data_put_page_write_count: AtomicU64,
    /// Trailing metadata writes issued by data puts.
    pub data_put_page_write_metadata_count: AtomicU64,
    /// Read bindings converted to read-write.
    pub data_convert_page_read_to_write_count: AtomicU64,
    /// Read bindings cloned to another block's write binding.
    pub data_clone_read_page_to_write_page_count: AtomicU64,

    /// Full-page synchronous reads.
    pub pmem_read_4k_count: AtomicU64,
    /// Sub-page synchronous reads.
    pub pmem_read_not4k_count: AtomicU64,
    /// Full-page synchronous writes.
    pub pmem_write_4k_count: AtomicU64,
    /// Sub-page synchronous writes.
    pub pmem_write_not4k_count: AtomicU64,
    /// Jobs deferred to a provider submission worker.
    pub pmem_make_req_wq_count: AtomicU64,

    /// Sync metadata read latency.
    pub metadata_read_timer: OpTimer,
    /// Async metadata write latency.
    pub metadata_write_async_timer: OpTimer,
    /// Read binding latency.
    pub data_get_page_read_timer: OpTimer,
    /// Write binding latency.
    pub data_get_page_write_timer: OpTimer,
    /// Read release latency.
    pub data_put_page_read_timer: OpTimer,
    /// Data put latency, end to end.
    pub data_put_page_write_timer: OpTimer,
    /// Latency of the trailing metadata write within a data put.
    pub data_put_page_write_metadata_timer: OpTimer,
    /// Full-page sync read latency.
    pub pmem_read_4k_timer: OpTimer,
    /// Sub-page sync read latency.
    pub pmem_read_not4k_timer: OpTimer,
    /// Full-page sync write latency.
    pub pmem_write_4k_timer: OpTimer,
    /// Sub-page sync write latency.
    pub pmem_write_not4k_timer: OpTimer,
    /// Queue latency from submission to worker pickup.
    pub pmem_make_req_wq_timer: OpTimer,
}

/// Plain-value copy of the counters for callers to inspect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Restore adopted a header copy.
    pub restore_header_valid: u64,
    /// Header copy 0 validated.
    pub restore_header0_valid: u64,
    /// Header copy 1 validated.
    pub restore_header1_valid: u64,
    /// Structurally bad metadata blocks.
    pub restore_corrupt_metadata_blocks: u64,
    /// Clean blocks restored, metadata side.
    pub restore_valid_clean_metadata_blocks: u64,
    /// Dirty blocks restored, metadata side.
    pub restore_valid_dirty_metadata_blocks: u64,
    /// Empty slots, metadata side.
    pub restore_invalid_metadata_blocks: u64,
    /// Mid-transaction slots.
    pub restore_pending_metadata_blocks: u64,
    /// Empty slots, data side.
    pub restore_invalid_data_blocks: u64,
    /// Clean blocks restored, data side.
    pub restore_valid_clean_data_blocks: u64,
    /// Dirty blocks restored, data side.
    pub restore_valid_dirty_data_blocks: u64,
    /// Metadata hash mismatches.
    pub restore_hash_corrupt_metadata_blocks: u64,
    /// Data hash mismatches.
    pub restore_hash_corrupt_data_blocks: u64,
    /// Synchronous metadata reads.
    pub metadata_read_count: u64,
    /// Async metadata writes.
    pub metadata_write_async_count: u64,
    /// Pages bound between get and put.
    pub data_get_put_page_pending: i64,
    /// Read bindings established.
    pub data_get_page_read_count: u64,
    /// Read bindings released.
    pub data_put_page_read_count: u64,
    /// Write bindings established.
    pub data_get_page_write_count: u64,
    /// Write bindings flushed.
    pub data_put_page_write_count: u64,
    /// Trailing metadata writes.
    pub data_put_page_write_metadata_count: u64,
    /// Read-to-write conversions.
    pub data_convert_page_read_to_write_count: u64,
    /// Read-to-write clones.
    pub data_clone_read_page_to_write_page_count: u64,
    /// Full-page sync reads.
    pub pmem_read_4k_count: u64,
    /// Sub-page sync reads.
    pub pmem_read_not4k_count: u64,
    /// Full-page sync writes.
    pub pmem_write_4k_count: u64,
    /// Sub-page sync writes.
    pub pmem_write_not4k_count: u64,
    /// Worker-queue deferrals.
    pub pmem_make_req_wq_count: u64,
}

impl PmemStats {
    pub(crate) fn count_sync_read(&self, len: usize, started: Instant) {
        if len == crate::types::PAGE_SIZE {
            self.pmem_read_4k_count.fetch_add(1, Ordering::Relaxed);
            self.pmem_read_4k_timer.record(started);
        } else {
            self.pmem_read_not4k_count.fetch_add(1, Ordering::Relaxed);
            self.pmem_read_not4k_timer.record(started);
        }
    }

    pub(crate) fn count_sync_write(&self, len: usize, started: Instant) {
        if len == crate::types::PAGE_SIZE {
            self.pmem_write_4k_count.fetch_add(1, Ordering::Relaxed);
            self.pmem_write_4k_timer.record(started);
        } else {
            self.pmem_write_not4k_count.fetch_add(1, Ordering::Relaxed);
            self.pmem_write_not4k_timer.record(started);
        }
    }

    /// Copy out the current counter values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            restore_header_valid: self.restore_header_valid.load(Ordering::Relaxed),
            restore_header0_valid: self.restore_header0_valid.load(Ordering::Relaxed),
            restore_header1_valid: self.restore_header1_valid.load(Ordering::Relaxed),
            restore_corrupt_metadata_blocks: self
                .restore_corrupt_metadata_blocks
                .load(Ordering::Relaxed),
            restore_valid_clean_metadata_blocks: self
                .restore_valid_clean_metadata_blocks
                .load(Ordering::Relaxed),
            restore_valid_dirty_metadata_blocks: self
                .restore_valid_dirty_metadata_blocks
                .load(Ordering::Relaxed),
            restore_invalid_metadata_blocks: self
                .restore_invalid_metadata_blocks
                .load(Ordering::Relaxed),
            restore_pending_metadata_blocks: self
                .restore_pending_metadata_blocks
                .load(Ordering::Relaxed),
            restore_invalid_data_blocks: self
                .restore_invalid_data_blocks
                .load(Ordering::Relaxed),
            restore_valid_clean_data_blocks: self
                .restore_valid_clean_data_blocks
                .load(Ordering::Relaxed),
            restore_valid_dirty_data_blocks: self
                .restore_valid_dirty_data_blocks
                .load(Ordering::Relaxed),
            restore_hash_corrupt_metadata_blocks: self
                .restore_hash_corrupt_metadata_blocks
                .load(Ordering::Relaxed),
            restore_hash_corrupt_data_blocks: self
                .restore_hash_corrupt_data_blocks
                .load(Ordering::Relaxed),
            metadata_read_count: self.metadata_read_count.load(Ordering::Relaxed),
            metadata_write_async_count: self
                .metadata_write_async_count
                .load(Ordering::Relaxed),
            data_get_put_page_pending: self.data_get_put_page_pending.load(Ordering::Relaxed),
            data_get_page_read_count: self.data_get_page_read_count.load(Ordering::Relaxed),
            data_put_page_read_count: self.data_put_page_read_count.load(Ordering::Relaxed),
            data_get_page_write_count: self.data_get_page_write_count.load(Ordering::Relaxed),
            data_put_page_write_count: self.data_put_page_write_count.load(Ordering::Relaxed),
            data_put_page_write_metadata_count: self
                .data_put_page_write_metadata_count
                .load(Ordering::Relaxed),
            data_convert_page_read_to_write_count: self
                .data_convert_page_read_to_write_count
                .load(Ordering::Relaxed),
            data_clone_read_page_to_write_page_count: self
                .data_clone_read_page_to_write_page_count
                .load(Ordering::Relaxed),
            pmem_read_4k_count: self.pmem_read_4k_count.load(Ordering::Relaxed),
            pmem_read_not4k_count: self.pmem_read_not4k_count.load(Ordering::Relaxed),
            pmem_write_4k_count: self.pmem_write_4k_count.load(Ordering::Relaxed),
            pmem_write_not4k_count: self.pmem_write_not4k_count.load(Ordering::Relaxed),
            pmem_make_req_wq_count: self.pmem_make_req_wq_count.load(Ordering::Relaxed),
        }
    }
}
