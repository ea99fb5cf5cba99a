#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::mpsc;
use std::time::Duration;

use nvcache::{
    hash::hash128, BlockRestore, CacheBlock, EngineOptions, PersistState, PmemEngine, PoolKind,
    ProviderKind, RequestContext, METADATA_RECORD_SIZE, PAGE_SIZE,
};
use tempfile::tempdir;

const DEVICE_SIZE: u64 = 2 << 20;

fn options(kind: ProviderKind) -> EngineOptions {
    EngineOptions {
        provider: kind,
        cache_name: "cache0".into(),
        device_name: "/dev/origin0".into(),
        device_size: Some(DEVICE_SIZE),
        ..EngineOptions::default()
    }
}

fn formatted(path: &Path, kind: ProviderKind) -> PmemEngine {
    let engine = PmemEngine::allocate(path, options(kind)).unwrap();
    engine.header_initialize().unwrap();
    for block_id in 1..=engine.cache_blocks().unwrap() as u32 {
        engine.metadata_initialize(block_id).unwrap();
    }
    engine
}

fn reopen(path: &Path, kind: ProviderKind) -> PmemEngine {
    let mut options = options(kind);
    options.device_size = None;
    PmemEngine::allocate(path, options).unwrap()
}

fn wait_io(rx: &mpsc::Receiver<(RequestContext, nvcache::Result<()>)>) -> RequestContext {
    let (ctx, res) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    res.unwrap();
    ctx
}

/// Write `fill` into `block` and persist it in `state`.
fn write_block(engine: &PmemEngine, block_id: u32, sector: u64, fill: u8, state: PersistState) {
    let mut ctx = RequestContext::new();
    engine.context_setup(PoolKind::Map, &mut ctx).unwrap();
    let mut block = CacheBlock {
        block_id,
        sector,
        xid: engine.bump_xid(),
        hash_data: 0,
    };
    engine.data_get_page_write(&block, &mut ctx).unwrap();
    ctx.data_mut().fill(fill);
    block.hash_data = hash128(ctx.data());

    let (tx, rx) = mpsc::channel();
    engine.data_put_page_write(
        &block,
        state,
        ctx,
        Box::new(move |ctx, res| tx.send((ctx, res)).unwrap()),
    );
    let mut ctx = wait_io(&rx);
    engine.context_destroy(&mut ctx);
}

fn restore_expect(engine: &PmemEngine, block_id: u32) -> (u64, PersistState, u128) {
    match engine.block_restore(block_id).unwrap() {
        BlockRestore::Valid {
            sector,
            state,
            hash_data,
            ..
        } => (sector, state, hash_data),
        other => panic!("expected a valid block, got {other:?}"),
    }
}

#[test]
fn partial_metadata_write_zeroes_page_tail() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = formatted(&path, ProviderKind::BlockDevice);
    let meta_off = engine.metadata_offset(3).unwrap();
    drop(engine);

    // Dirty the whole metadata page, then reinitialize the slot. The
    // 64-byte record must arrive inside an otherwise zero page.
    let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
    file.write_all_at(&[0xff_u8; PAGE_SIZE], meta_off).unwrap();
    file.sync_all().unwrap();

    let engine = reopen(&path, ProviderKind::BlockDevice);
    engine.header_restore().unwrap();
    engine.metadata_initialize(3).unwrap();
    engine.flush().unwrap();

    let mut page = vec![0u8; PAGE_SIZE];
    file.read_exact_at(&mut page, meta_off).unwrap();
    assert!(page[METADATA_RECORD_SIZE..].iter().all(|b| *b == 0));
    assert_eq!(engine.block_restore(3).unwrap(), BlockRestore::Invalid);
}

#[test]
fn read_modify_write_via_convert() {
    for kind in [ProviderKind::BlockDevice, ProviderKind::DirectMemory] {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.dev");
        let engine = formatted(&path, kind);
        write_block(&engine, 5, 8 * 11, 0x21, PersistState::Clean);

        // Read the page back, convert the view to read-write, touch a
        // few bytes, and persist as dirty.
        let mut ctx = RequestContext::new();
        engine.context_setup(PoolKind::Map, &mut ctx).unwrap();
        let mut block = CacheBlock {
            block_id: 5,
            sector: 8 * 11,
            xid: engine.bump_xid(),
            hash_data: 0,
        };
        let (tx, rx) = mpsc::channel();
        engine.data_get_page_read(
            &block,
            ctx,
            Box::new(move |ctx, res| tx.send((ctx, res)).unwrap()),
        );
        let mut ctx = wait_io(&rx);
        assert!(ctx.data().iter().all(|b| *b == 0x21));

        engine.data_convert_read_to_write(&block, &mut ctx);
        ctx.data_mut()[..16].fill(0x22);
        block.hash_data = hash128(ctx.data());

        let (tx, rx) = mpsc::channel();
        engine.data_put_page_write(
            &block,
            PersistState::Dirty,
            ctx,
            Box::new(move |ctx, res| tx.send((ctx, res)).unwrap()),
        );
        let mut ctx = wait_io(&rx);
        engine.context_destroy(&mut ctx);
        engine.flush().unwrap();
        drop(engine);

        let engine = reopen(&path, kind);
        engine.header_restore().unwrap();
        let (sector, state, hash_data) = restore_expect(&engine, 5);
        assert_eq!(sector, 8 * 11);
        assert_eq!(state, PersistState::Dirty);
        assert_eq!(hash_data, block.hash_data);
    }
}

#[test]
fn clone_writes_source_page_into_destination_block() {
    for kind in [ProviderKind::BlockDevice, ProviderKind::DirectMemory] {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.dev");
        let engine = formatted(&path, kind);
        write_block(&engine, 1, 8 * 3, 0x77, PersistState::Dirty);

        let from = CacheBlock {
            block_id: 1,
            sector: 8 * 3,
            xid: engine.xid(),
            hash_data: 0,
        };
        let mut to = CacheBlock {
            block_id: 2,
            sector: 8 * 3,
            xid: engine.bump_xid(),
            hash_data: 0,
        };

        let mut ctx = RequestContext::new();
        engine.context_setup(PoolKind::Map, &mut ctx).unwrap();
        let (tx, rx) = mpsc::channel();
        engine.data_get_page_read(
            &from,
            ctx,
            Box::new(move |ctx, res| tx.send((ctx, res)).unwrap()),
        );
        let mut ctx = wait_io(&rx);

        engine.data_clone_read_to_write(&from, &to, &mut ctx);
        to.hash_data = hash128(ctx.data());
        let (tx, rx) = mpsc::channel();
        engine.data_put_page_write(
            &to,
            PersistState::Dirty,
            ctx,
            Box::new(move |ctx, res| tx.send((ctx, res)).unwrap()),
        );
        let mut ctx = wait_io(&rx);
        engine.context_destroy(&mut ctx);
        engine.flush().unwrap();
        drop(engine);

        let engine = reopen(&path, kind);
        engine.header_restore().unwrap();
        // Both blocks carry the same bytes now.
        let (_, _, from_hash) = restore_expect(&engine, 1);
        let (sector, state, to_hash) = restore_expect(&engine, 2);
        assert_eq!(sector, 8 * 3);
        assert_eq!(state, PersistState::Dirty);
        assert_eq!(from_hash, to_hash);
    }
}

#[test]
fn sequential_layout_packs_metadata_cells() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = formatted(&path, ProviderKind::DirectMemory);
    let first = engine.metadata_offset(1).unwrap();
    let second = engine.metadata_offset(2).unwrap();
    assert_eq!(second - first, METADATA_RECORD_SIZE as u64);

    let data_first = engine.data_offset(1).unwrap();
    let data_second = engine.data_offset(2).unwrap();
    assert_eq!(data_second - data_first, PAGE_SIZE as u64);
    assert!(data_first > engine.metadata_offset(engine.cache_blocks().unwrap() as u32).unwrap());
}

#[test]
fn interleaved_layout_pairs_data_and_metadata() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = formatted(&path, ProviderKind::BlockDevice);
    for block_id in [1u32, 2, 3] {
        let data = engine.data_offset(block_id).unwrap();
        let meta = engine.metadata_offset(block_id).unwrap();
        assert_eq!(meta, data + PAGE_SIZE as u64);
    }
}

#[test]
fn pending_page_gauge_balances() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = formatted(&path, ProviderKind::DirectMemory);
    write_block(&engine, 4, 8, 0x01, PersistState::Clean);

    let block = CacheBlock {
        block_id: 4,
        sector: 8,
        xid: engine.xid(),
        hash_data: 0,
    };
    let mut ctx = RequestContext::new();
    engine.context_setup(PoolKind::Map, &mut ctx).unwrap();
    let (tx, rx) = mpsc::channel();
    engine.data_get_page_read(
        &block,
        ctx,
        Box::new(move |ctx, res| tx.send((ctx, res)).unwrap()),
    );
    let mut ctx = wait_io(&rx);
    assert_eq!(engine.stats().data_get_put_page_pending, 1);
    engine.data_put_page_read(&block, &mut ctx);
    engine.context_destroy(&mut ctx);
    assert_eq!(engine.stats().data_get_put_page_pending, 0);

    let stats = engine.stats();
    assert_eq!(stats.data_get_page_read_count, 1);
    assert_eq!(stats.data_put_page_read_count, 1);
    assert_eq!(stats.data_get_page_write_count, 1);
    assert_eq!(stats.data_put_page_write_count, 1);
}

#[test]
fn worker_queue_counts_deferrals_on_block_provider() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = formatted(&path, ProviderKind::BlockDevice);
    write_block(&engine, 6, 8 * 2, 0x33, PersistState::Clean);
    // The data put was deferred to the submission worker at least once.
    assert!(engine.stats().pmem_make_req_wq_count >= 1);
    assert_eq!(engine.stats().data_put_page_write_metadata_count, 1);
}
