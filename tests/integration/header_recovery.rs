#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;

use nvcache::{CacheError, EngineOptions, Header, PmemEngine, ProviderKind, PAGE_SIZE};
use tempfile::tempdir;

const DEVICE_SIZE: u64 = 16 << 20;
const HEADER0: u64 = 0;
const HEADER1: u64 = 128 << 10;
/// Byte range of the trailing header hash within a copy.
const HASH_OFFSET: u64 = 884;

fn options() -> EngineOptions {
    EngineOptions {
        provider: ProviderKind::BlockDevice,
        cache_name: "cache0".into(),
        device_name: "/dev/origin0".into(),
        device_size: Some(DEVICE_SIZE),
        ..EngineOptions::default()
    }
}

fn formatted(path: &Path) -> PmemEngine {
    let engine = PmemEngine::allocate(path, options()).unwrap();
    engine.header_initialize().unwrap();
    engine
}

fn reopen(path: &Path) -> PmemEngine {
    let mut options = options();
    options.device_size = None;
    PmemEngine::allocate(path, options).unwrap()
}

fn overwrite(path: &Path, offset: u64, bytes: &[u8]) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.write_all_at(bytes, offset).unwrap();
    file.sync_all().unwrap();
}

fn read_copy(path: &Path, offset: u64) -> Result<Header, CacheError> {
    let file = OpenOptions::new().read(true).open(path).unwrap();
    let mut buf = vec![0u8; PAGE_SIZE];
    file.read_exact_at(&mut buf, offset).unwrap();
    Header::decode(&buf)
}

#[test]
fn torn_copy0_restores_from_copy1() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    drop(formatted(&path));

    overwrite(&path, HEADER0 + HASH_OFFSET, &[0u8; 16]);

    let engine = reopen(&path);
    engine.header_restore().unwrap();
    let stats = engine.stats();
    assert_eq!(stats.restore_header0_valid, 0);
    assert_eq!(stats.restore_header1_valid, 1);
    // Copy 1 carried xid 3 at format time.
    assert_eq!(engine.header().unwrap().xid_current, 3);
    assert_eq!(engine.xid(), 5);
}

#[test]
fn torn_copy1_restores_from_copy0() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    drop(formatted(&path));

    overwrite(&path, HEADER1 + HASH_OFFSET, &[0u8; 16]);

    let engine = reopen(&path);
    engine.header_restore().unwrap();
    assert_eq!(engine.header().unwrap().xid_current, 2);
    assert_eq!(engine.xid(), 4);
}

#[test]
fn tearing_both_copies_is_fatal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    drop(formatted(&path));

    overwrite(&path, HEADER0 + HASH_OFFSET, &[0u8; 16]);
    overwrite(&path, HEADER1 + HASH_OFFSET, &[0u8; 16]);

    let engine = reopen(&path);
    assert!(matches!(
        engine.header_restore(),
        Err(CacheError::HeaderCorrupt("both header copies invalid"))
    ));
}

#[test]
fn consecutive_updates_alternate_copies() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = formatted(&path);

    // Format leaves copy 0 at xid 2 and copy 1 at xid 3; the first
    // update writes the copy after the one written last.
    engine.bump_xid();
    engine.header_update(false).unwrap();
    assert_eq!(read_copy(&path, HEADER0).unwrap().xid_current, 2);
    assert_eq!(read_copy(&path, HEADER1).unwrap().xid_current, 5);

    engine.bump_xid();
    engine.header_update(false).unwrap();
    assert_eq!(read_copy(&path, HEADER0).unwrap().xid_current, 6);
    assert_eq!(read_copy(&path, HEADER1).unwrap().xid_current, 5);

    engine.bump_xid();
    engine.header_update(false).unwrap();
    assert_eq!(read_copy(&path, HEADER0).unwrap().xid_current, 6);
    assert_eq!(read_copy(&path, HEADER1).unwrap().xid_current, 7);
}

#[test]
fn update_without_xid_advance_writes_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = formatted(&path);

    engine.header_update(false).unwrap();
    assert_eq!(read_copy(&path, HEADER0).unwrap().xid_current, 2);
    assert_eq!(read_copy(&path, HEADER1).unwrap().xid_current, 3);
}

#[test]
fn update_both_writes_both_copies() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = formatted(&path);

    engine.bump_xid();
    engine.header_update(true).unwrap();
    assert_eq!(read_copy(&path, HEADER0).unwrap().xid_current, 5);
    assert_eq!(read_copy(&path, HEADER1).unwrap().xid_current, 5);
}

#[test]
fn crash_during_update_keeps_last_completed_xid() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = formatted(&path);

    engine.bump_xid();
    engine.header_update(false).unwrap(); // copy 1 now holds xid 5
    engine.bump_xid();
    engine.header_update(false).unwrap(); // copy 0 now holds xid 6
    drop(engine);

    // Crash mid-way through the next update, which would write copy 1:
    // scribble over part of that copy.
    overwrite(&path, HEADER1 + 40, &[0xd6u8; 64]);

    let engine = reopen(&path);
    engine.header_restore().unwrap();
    assert_eq!(engine.header().unwrap().xid_current, 6);
    assert_eq!(engine.xid(), 8);
}

#[test]
fn newer_copy_wins_when_both_validate() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cache.dev");
    let engine = formatted(&path);

    engine.bump_xid();
    engine.bump_xid();
    engine.header_update(false).unwrap(); // copy 1 holds xid 6, copy 0 holds 2
    drop(engine);

    let engine = reopen(&path);
    engine.header_restore().unwrap();
    assert_eq!(engine.header().unwrap().xid_current, 6);
    assert_eq!(engine.xid(), 8);
    let stats = engine.stats();
    assert_eq!(stats.restore_header0_valid, 1);
    assert_eq!(stats.restore_header1_valid, 1);
}
