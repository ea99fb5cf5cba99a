#![forbid(unsafe_code)]

//! Per-request contexts and page buffer pools.
//!
//! A [`RequestContext`] is caller-owned for the lifetime of one engine
//! operation. It carries the staging metadata record and one page buffer
//! acquired from a pool at setup time. Async operations take the context
//! by value and hand it back through the completion callback, so no
//! provider ever holds a reference to caller state between calls.

use parking_lot::Mutex;

use crate::error::{CacheError, Result};
use crate::metadata::BlockMetadata;
use crate::types::PAGE_SIZE;

/// One page of owned buffer space.
#[derive(Debug)]
pub struct PageBuf(Box<[u8]>);

impl PageBuf {
    fn zeroed() -> Self {
        PageBuf(vec![0u8; PAGE_SIZE].into_boxed_slice())
    }

    /// Immutable view of the page.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Mutable view of the page.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }

    /// Zero the whole page.
    pub fn zero(&mut self) {
        self.0.fill(0);
    }
}

/// Which pool a context draws its buffer from.
///
/// Short-lived request contexts use the `Map` pool; long-lived per-worker
/// contexts use the `Worker` pool so a burst of requests cannot starve the
/// workers of buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolKind {
    /// Pool for per-request contexts.
    Map,
    /// Pool for long-lived worker contexts.
    Worker,
}

/// Bounded free list of page buffers.
pub(crate) struct PagePool {
    inner: Mutex<PoolInner>,
    limit: usize,
}

struct PoolInner {
    free: Vec<PageBuf>,
    outstanding: usize,
}

/// Buffers kept around for reuse once released.
const POOL_KEEP: usize = 64;

impl PagePool {
    pub(crate) fn new(limit: usize) -> Self {
        PagePool {
            inner: Mutex::new(PoolInner {
                free: Vec::new(),
                outstanding: 0,
            }),
            limit,
        }
    }

    pub(crate) fn acquire(&self) -> Result<PageBuf> {
        let mut inner = self.inner.lock();
        if inner.outstanding >= self.limit {
            return Err(CacheError::OutOfMemory("page pool exhausted"));
        }
        inner.outstanding += 1;
        Ok(inner.free.pop().unwrap_or_else(PageBuf::zeroed))
    }

    pub(crate) fn release(&self, buf: PageBuf) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.outstanding > 0);
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if inner.free.len() < POOL_KEEP {
            inner.free.push(buf);
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }
}

/// How a context's page buffer is currently bound.
///
/// `Direct` bindings are staged by synchronous memory copy against a
/// byte-addressable device; `Bounce` bindings travel through the block
/// provider's submission worker as single-page I/O. Read and write may
/// coexist after a read-to-write conversion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferBinding {
    /// Not bound to any block.
    Idle,
    /// Readable view of a byte-addressable page.
    ReadDirect,
    /// Readable view filled by a block read.
    ReadBounce,
    /// Writable view destined for a byte-addressable page.
    WriteDirect,
    /// Writable view destined for a block write.
    WriteBounce,
    /// Read view converted to read-write, byte-addressable device.
    ReadWriteDirect,
    /// Read view converted to read-write, block device.
    ReadWriteBounce,
}

impl BufferBinding {
    /// True for any bound state that permits reading.
    pub fn is_read(self) -> bool {
        matches!(
            self,
            BufferBinding::ReadDirect
                | BufferBinding::ReadBounce
                | BufferBinding::ReadWriteDirect
                | BufferBinding::ReadWriteBounce
        )
    }

    /// True for any bound state that permits writing.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            BufferBinding::WriteDirect
                | BufferBinding::WriteBounce
                | BufferBinding::ReadWriteDirect
                | BufferBinding::ReadWriteBounce
        )
    }

    /// True when the page travels through the submission worker.
    pub fn is_bounce(self) -> bool {
        matches!(
            self,
            BufferBinding::ReadBounce
                | BufferBinding::WriteBounce
                | BufferBinding::ReadWriteBounce
        )
    }

    /// Add write access to a read binding. Converting anything else is a
    /// caller bug.
    pub(crate) fn into_read_write(self) -> Self {
        match self {
            BufferBinding::ReadDirect => BufferBinding::ReadWriteDirect,
            BufferBinding::ReadBounce => BufferBinding::ReadWriteBounce,
            other => panic!("convert on a non-read binding: {other:?}"),
        }
    }
}

/// Caller-provided state for one in-flight engine operation.
#[derive(Debug)]
pub struct RequestContext {
    pub(crate) staging: BlockMetadata,
    pub(crate) page: Option<PageBuf>,
    pub(crate) binding: BufferBinding,
    pub(crate) pool: Option<PoolKind>,
}

impl RequestContext {
    /// An empty, unbound context. Buffers are attached by
    /// [`crate::engine::PmemEngine::context_setup`].
    pub fn new() -> Self {
        RequestContext {
            staging: BlockMetadata::default(),
            page: None,
            binding: BufferBinding::Idle,
            pool: None,
        }
    }

    /// Current binding state.
    pub fn binding(&self) -> BufferBinding {
        self.binding
    }

    /// The bound data page. Panics on an unbound context; binding is part
    /// of the call protocol, not a runtime condition.
    pub fn data(&self) -> &[u8] {
        assert!(
            self.binding != BufferBinding::Idle,
            "data() on an unbound request context"
        );
        self.page
            .as_ref()
            .expect("bound context without a page buffer")
            .as_slice()
    }

    /// Mutable view of the bound data page. Panics unless the binding
    /// permits writing.
    pub fn data_mut(&mut self) -> &mut [u8] {
        assert!(
            self.binding.is_write(),
            "data_mut() on a non-writable binding: {:?}",
            self.binding
        );
        self.page
            .as_mut()
            .expect("bound context without a page buffer")
            .as_mut_slice()
    }

    pub(crate) fn attach(&mut self, pool: PoolKind, page: PageBuf) {
        assert!(self.page.is_none(), "context already holds a buffer");
        assert_eq!(self.binding, BufferBinding::Idle);
        self.page = Some(page);
        self.pool = Some(pool);
    }

    pub(crate) fn detach(&mut self) -> Option<(PoolKind, PageBuf)> {
        assert_eq!(
            self.binding,
            BufferBinding::Idle,
            "destroying a context with a live binding"
        );
        let pool = self.pool.take()?;
        self.page.take().map(|page| (pool, page))
    }

    pub(crate) fn bind(&mut self, binding: BufferBinding) {
        assert_eq!(
            self.binding,
            BufferBinding::Idle,
            "double-binding a request context"
        );
        assert!(binding != BufferBinding::Idle);
        assert!(self.page.is_some(), "binding a context without a buffer");
        self.binding = binding;
    }

    pub(crate) fn unbind(&mut self) {
        assert!(self.binding != BufferBinding::Idle, "context not bound");
        self.binding = BufferBinding::Idle;
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
