#![allow(missing_docs)]

use std::path::Path;
use std::time::Duration;

use nvcache::{CacheError, CacheLayout, EngineOptions, PmemEngine, ProviderKind};
use tempfile::tempdir;

const DEVICE_SIZE: u64 = 64 << 20;

fn options(kind: ProviderKind) -> EngineOptions {
    EngineOptions {
        provider: kind,
        cache_name: "cache0".into(),
        device_name: "/dev/origin0".into(),
        device_size: Some(DEVICE_SIZE),
        header_update_interval: Duration::from_secs(30),
        ..EngineOptions::default()
    }
}

fn reopen(path: &Path, kind: ProviderKind) -> PmemEngine {
    let mut options = options(kind);
    options.device_size = None;
    PmemEngine::allocate(path, options).unwrap()
}

#[test]
fn format_then_restore_block_device() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");

    let engine = PmemEngine::allocate(&path, options(ProviderKind::BlockDevice)).unwrap();
    engine.header_initialize().unwrap();
    let formatted = engine.header().unwrap();
    assert_eq!(engine.xid(), 4);
    drop(engine);

    let engine = reopen(&path, ProviderKind::BlockDevice);
    engine.header_restore().unwrap();

    let restored = engine.header().unwrap();
    assert!(restored.cache_blocks > 0);
    // 64 MiB interleaved: one (data, metadata) page pair per block past
    // the header region.
    assert_eq!(restored.cache_blocks, (DEVICE_SIZE - (256 << 10)) / 8192);
    assert_eq!(restored.uuid, formatted.uuid);
    assert_eq!(restored.name, "cache0");
    assert_eq!(restored.device_name, "/dev/origin0");
    assert_eq!(restored.layout, CacheLayout::Interleaved);
    // Copy 1 carries xid 3; the engine counter moves strictly past both
    // stored copies.
    assert_eq!(restored.xid_current, 3);
    assert_eq!(engine.xid(), 5);

    let stats = engine.stats();
    assert_eq!(stats.restore_header_valid, 1);
    assert_eq!(stats.restore_header0_valid, 1);
    assert_eq!(stats.restore_header1_valid, 1);
}

#[test]
fn format_then_restore_direct_memory() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");

    let engine = PmemEngine::allocate(&path, options(ProviderKind::DirectMemory)).unwrap();
    engine.header_initialize().unwrap();
    assert_eq!(engine.xid(), 4);
    drop(engine);

    let engine = reopen(&path, ProviderKind::DirectMemory);
    engine.header_restore().unwrap();

    let restored = engine.header().unwrap();
    assert!(restored.cache_blocks > 0);
    assert_eq!(restored.layout, CacheLayout::Sequential);
    assert_eq!(restored.mcb_size_bytes, 64);
    assert_eq!(engine.xid(), 5);
    assert_eq!(engine.api_name(), "mem");
    assert!(!engine.page_size_transfer_only());
}

#[test]
fn restore_of_unformatted_device_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = PmemEngine::allocate(&path, options(ProviderKind::BlockDevice)).unwrap();
    assert!(matches!(
        engine.header_restore(),
        Err(CacheError::HeaderCorrupt(_))
    ));
}

#[test]
fn restore_with_wrong_provider_is_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");

    let engine = PmemEngine::allocate(&path, options(ProviderKind::BlockDevice)).unwrap();
    engine.header_initialize().unwrap();
    drop(engine);

    // Interleaved on-device layout cannot be served by the sequential
    // direct-memory provider.
    let engine = reopen(&path, ProviderKind::DirectMemory);
    assert!(matches!(
        engine.header_restore(),
        Err(CacheError::HeaderCorrupt(_))
    ));
}

#[test]
fn introspection_reflects_provider() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = PmemEngine::allocate(&path, options(ProviderKind::BlockDevice)).unwrap();
    assert_eq!(engine.api_name(), "block");
    assert!(engine.page_size_transfer_only());
    assert_eq!(engine.cache_layout(), CacheLayout::Interleaved);
    assert_eq!(engine.device_size_bytes(), DEVICE_SIZE);
}
