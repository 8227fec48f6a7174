use std::fs;
use std::sync::Arc;

use super::*;
use crate::fits::FitsCodec;
use crate::frame::ImageDimensions;
use crate::test_utils::{composite, dark_metadata, light_metadata, SMALL};

fn open_store(dir: &Path) -> CompositeStore {
    CompositeStore::open(dir, Arc::new(FitsCodec)).unwrap()
}

#[test]
fn open_creates_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("nested").join("storage");

    let store = open_store(&dir);

    assert!(dir.is_dir());
    assert!(store.ledger().is_empty());
}

#[test]
fn save_then_load_returns_same_composite() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let saved = composite(&dark_metadata(), PixelBuffer::filled(SMALL, 0.5), 2);

    assert!(!store.exists(&saved.key));
    store.save(&saved).unwrap();

    assert!(store.exists(&saved.key));
    assert_eq!(
        store.path_for(&saved.key),
        tmp.path().join("CamA_DARK_30.0_100_-10.fits")
    );
    assert_eq!(store.load(&saved.key), Some(saved));
}

#[test]
fn save_replaces_previous_version() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let first = composite(&dark_metadata(), PixelBuffer::filled(SMALL, 0.6), 1);
    let second = composite(&dark_metadata(), PixelBuffer::filled(SMALL, 0.5), 2);

    store.save(&first).unwrap();
    store.save(&second).unwrap();

    let loaded = store.load(&second.key).unwrap();
    assert_eq!(loaded.count, 2);
    assert_eq!(loaded.pixels, second.pixels);
    let leftovers: Vec<_> = fs::read_dir(tmp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn failed_save_keeps_previous_version() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let first = composite(&dark_metadata(), PixelBuffer::filled(SMALL, 0.6), 1);
    store.save(&first).unwrap();

    // a directory in place of the temporary file makes the write fail
    let mut tmp_name = store.path_for(&first.key).into_os_string();
    tmp_name.push(".tmp");
    fs::create_dir(&tmp_name).unwrap();

    let second = composite(&dark_metadata(), PixelBuffer::filled(SMALL, 0.5), 2);
    let err = store.save(&second).unwrap_err();

    assert!(matches!(err, StoreError::Write { .. }));
    assert_eq!(store.load(&first.key), Some(first));
}

#[test]
fn load_missing_is_absent() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let key = composite(&dark_metadata(), PixelBuffer::filled(SMALL, 0.0), 1).key;

    assert_eq!(store.load(&key), None);
}

#[test]
fn load_corrupt_is_absent() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let key = composite(&dark_metadata(), PixelBuffer::filled(SMALL, 0.0), 1).key;
    fs::write(store.path_for(&key), b"definitely not fits").unwrap();

    assert!(store.exists(&key));
    assert_eq!(store.load(&key), None);
}

#[test]
fn load_with_foreign_key_is_absent() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let dark = composite(&dark_metadata(), PixelBuffer::filled(SMALL, 0.1), 1);
    let light = composite(&light_metadata("M31"), PixelBuffer::filled(SMALL, 0.1), 1);
    store.save(&light).unwrap();
    fs::rename(store.path_for(&light.key), store.path_for(&dark.key)).unwrap();

    assert_eq!(store.load(&dark.key), None);
}

#[test]
fn key_with_path_separator_stays_in_storage_dir() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let light = composite(
        &light_metadata("NGC 7000/North America"),
        PixelBuffer::filled(ImageDimensions::new(4, 4, 3), 0.3),
        1,
    );

    store.save(&light).unwrap();

    assert_eq!(store.path_for(&light.key).parent(), Some(tmp.path()));
    assert_eq!(store.load(&light.key), Some(light));
}

#[test]
fn keys_differing_only_in_separator_do_not_collide() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let dashed = composite(&light_metadata("A-B"), PixelBuffer::filled(SMALL, 0.2), 2);
    let slashed = composite(&light_metadata("A/B"), PixelBuffer::filled(SMALL, 0.8), 1);

    store.save(&dashed).unwrap();
    assert!(!store.exists(&slashed.key));
    assert_eq!(store.load(&slashed.key), None);
    store.save(&slashed).unwrap();

    assert_ne!(store.path_for(&dashed.key), store.path_for(&slashed.key));
    assert_eq!(store.load(&dashed.key), Some(dashed));
    assert_eq!(store.load(&slashed.key), Some(slashed));
}

#[test]
fn ledger_entries_are_visible_and_durable() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = open_store(tmp.path());

    assert!(!store.is_processed("/in/a.fits"));
    store.mark_processed("/in/a.fits").unwrap();
    store.mark_processed("/in/a.fits").unwrap();
    assert!(store.is_processed("/in/a.fits"));

    let contents = fs::read_to_string(tmp.path().join(Ledger::FILE_NAME)).unwrap();
    assert_eq!(contents, "/in/a.fits\n");

    let reopened = open_store(tmp.path());
    assert!(reopened.is_processed("/in/a.fits"));
    assert_eq!(reopened.ledger().len(), 1);
}

#[test]
fn ledger_ignores_blank_lines() {
    let tmp = tempfile::tempdir().unwrap();
    fs::write(tmp.path().join(Ledger::FILE_NAME), "a.fits\n\n  \nb.fits\n").unwrap();

    let ledger = Ledger::open(tmp.path()).unwrap();

    assert_eq!(ledger.len(), 2);
    assert!(ledger.contains("a.fits"));
    assert!(ledger.contains("b.fits"));
}

#[test]
fn ledger_rejects_multiline_identifiers() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = open_store(tmp.path());

    assert!(matches!(
        store.mark_processed("a\nb"),
        Err(StoreError::InvalidSourceId(_))
    ));
    assert!(!store.is_processed("a\nb"));
}

#[test]
fn ledger_append_failure_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let mut store = open_store(tmp.path());
    fs::create_dir(tmp.path().join(Ledger::FILE_NAME)).unwrap();

    let err = store.mark_processed("/in/a.fits").unwrap_err();

    assert!(matches!(err, StoreError::LedgerWrite { .. }));
    assert!(!store.is_processed("/in/a.fits"));
}
