//! # Key-Value Engine Integration Tests
//!
//! Exercises the engine through the public `TreeStore` handle:
//!
//! - point operations and inclusive range scans
//! - snapshot isolation between readers and the writer
//! - persistence across reopen
//! - rollback, capacity limits and page reuse
//! - corruption detection on open

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::thread;

use tempfile::TempDir;
use treestore::{KvRead, TreeStore, TreeStoreError};

/// Routes engine logs to the test harness; filter with `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn create_test_store() -> (TempDir, TreeStore) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = TreeStore::builder()
        .path(dir.path().join("kv.db"))
        .sync_on_commit(false)
        .open()
        .unwrap();
    (dir, store)
}

fn key(i: usize) -> Vec<u8> {
    format!("key{:02}", i).into_bytes()
}

fn load_keys(store: &TreeStore, n: usize) {
    store
        .update(|txn| {
            for i in 0..n {
                txn.insert(&key(i), format!("value{}", i).as_bytes())?;
            }
            Ok(())
        })
        .unwrap();
}

// ============================================================================
// Point operations and scans
// ============================================================================

mod scan_tests {
    use super::*;

    #[test]
    fn test_range_scan_is_inclusive_on_both_ends() {
        let (_dir, store) = create_test_store();
        load_keys(&store, 100);

        let rows = store.range_scan(b"key00", b"key10").unwrap();

        assert_eq!(rows.len(), 11);
        assert_eq!(rows.first().unwrap().0, b"key00".to_vec());
        assert_eq!(rows.last().unwrap().0, b"key10".to_vec());
        assert_eq!(rows[5].1, b"value5".to_vec());
    }

    #[test]
    fn test_range_scan_between_missing_keys() {
        let (_dir, store) = create_test_store();
        load_keys(&store, 20);

        let rows = store.range_scan(b"key05x", b"key07x").unwrap();
        let keys: Vec<_> = rows.into_iter().map(|(k, _)| k).collect();

        assert_eq!(keys, vec![key(6), key(7)]);
        assert!(store.range_scan(b"zzz", b"zzzz").unwrap().is_empty());
    }

    #[test]
    fn test_prefix_scans_in_both_directions() {
        let (_dir, store) = create_test_store();
        for k in ["a1", "a2", "a3", "b1", "b2"] {
            store.insert(k.as_bytes(), b"x").unwrap();
        }

        let txn = store.begin_read().unwrap();
        let forward: Vec<_> = txn
            .scan_prefix(b"a")
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();
        let backward: Vec<_> = txn
            .scan_prefix_rev(b"a")
            .unwrap()
            .map(|r| r.unwrap().0)
            .collect();

        assert_eq!(forward, vec![b"a1".to_vec(), b"a2".to_vec(), b"a3".to_vec()]);
        assert_eq!(backward, vec![b"a3".to_vec(), b"a2".to_vec(), b"a1".to_vec()]);
    }

    #[test]
    fn test_overwrite_and_delete() {
        let (_dir, store) = create_test_store();
        store.insert(b"k", b"one").unwrap();
        store.insert(b"k", b"two").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"two".to_vec()));

        assert!(store.delete(b"k").unwrap());
        assert_eq!(store.get(b"k").unwrap(), None);
        assert!(!store.delete(b"k").unwrap());
    }

    #[test]
    fn test_empty_key_is_rejected() {
        let (_dir, store) = create_test_store();
        let err = store.insert(b"", b"v").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeStoreError>(),
            Some(TreeStoreError::EmptyKey)
        ));
    }
}

// ============================================================================
// Transactions
// ============================================================================

mod transaction_tests {
    use super::*;

    #[test]
    fn test_reader_keeps_its_snapshot() {
        let (_dir, store) = create_test_store();
        store.insert(b"a", b"1").unwrap();

        let old = store.begin_read().unwrap();
        store.insert(b"a", b"2").unwrap();
        store.insert(b"b", b"3").unwrap();

        assert_eq!(old.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(old.get(b"b").unwrap(), None);

        let new = store.begin_read().unwrap();
        assert_eq!(new.get(b"a").unwrap(), Some(b"2".to_vec()));
        assert_eq!(new.get(b"b").unwrap(), Some(b"3".to_vec()));
        assert!(new.version() > old.version());
    }

    #[test]
    fn test_writer_reads_its_own_writes() {
        let (_dir, store) = create_test_store();
        let seen = store
            .update(|txn| {
                txn.insert(b"pending", b"yes")?;
                txn.get(b"pending")
            })
            .unwrap();
        assert_eq!(seen, Some(b"yes".to_vec()));
    }

    #[test]
    fn test_failed_update_rolls_back_every_write() {
        let (_dir, store) = create_test_store();
        load_keys(&store, 10);

        let result: eyre::Result<()> = store.update(|txn| {
            txn.delete(&key(0))?;
            txn.insert(b"new", b"row")?;
            eyre::bail!("abort halfway")
        });

        assert!(result.is_err());
        assert_eq!(store.get(&key(0)).unwrap(), Some(b"value0".to_vec()));
        assert_eq!(store.get(b"new").unwrap(), None);
        assert_eq!(store.check_integrity().unwrap().keys, 10);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_snapshots() {
        let (_dir, store) = create_test_store();

        thread::scope(|s| {
            let writer = store.clone();
            s.spawn(move || {
                for batch in 0..20 {
                    writer
                        .update(|txn| {
                            for i in 0..10 {
                                let k = format!("row{:04}", batch * 10 + i);
                                txn.insert(k.as_bytes(), b"v")?;
                            }
                            Ok(())
                        })
                        .unwrap();
                }
            });

            for _ in 0..4 {
                let reader = store.clone();
                s.spawn(move || {
                    let mut last = 0;
                    for _ in 0..50 {
                        let txn = reader.begin_read().unwrap();
                        let first = txn.scan_prefix(b"row").unwrap().count();
                        let second = txn.scan_prefix(b"row").unwrap().count();
                        assert_eq!(first, second);
                        assert_eq!(first % 10, 0);
                        assert!(first >= last);
                        last = first;
                    }
                });
            }
        });

        assert_eq!(store.check_integrity().unwrap().keys, 200);
    }
}

// ============================================================================
// Persistence
// ============================================================================

mod persistence_tests {
    use super::*;

    #[test]
    fn test_reopen_preserves_committed_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.db");

        {
            let store = TreeStore::builder().path(&path).open().unwrap();
            load_keys(&store, 100);
            store.delete(&key(50)).unwrap();
        }

        let store = TreeStore::builder()
            .path(&path)
            .create_if_missing(false)
            .open()
            .unwrap();
        assert_eq!(store.get(&key(49)).unwrap(), Some(b"value49".to_vec()));
        assert_eq!(store.get(&key(50)).unwrap(), None);

        let stats = store.check_integrity().unwrap();
        assert_eq!(stats.keys, 99);
    }

    #[test]
    fn test_missing_file_without_create_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = TreeStore::builder()
            .path(dir.path().join("absent.db"))
            .create_if_missing(false)
            .open();
        assert!(result.is_err());
        assert!(!dir.path().join("absent.db").exists());
    }

    #[test]
    fn test_corrupted_signature_is_detected_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.db");
        {
            let store = TreeStore::open(&path).unwrap();
            store.insert(b"k", b"v").unwrap();
        }

        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write_all(b"NotATreeStore!!!").unwrap();
        file.sync_all().unwrap();
        drop(file);

        let err = TreeStore::open(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeStoreError>(),
            Some(TreeStoreError::Corruption(_))
        ));
    }
}

// ============================================================================
// Page management
// ============================================================================

mod page_tests {
    use super::*;

    #[test]
    fn test_page_ceiling_raises_capacity_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TreeStore::builder()
            .path(dir.path().join("small.db"))
            .sync_on_commit(false)
            .max_pages(4)
            .open()
            .unwrap();
        let value = vec![7u8; 3000];

        store.insert(&key(0), &value).unwrap();
        let err = (1..50)
            .find_map(|i| store.insert(&key(i), &value).err())
            .expect("page ceiling never reached");

        assert!(matches!(
            err.downcast_ref::<TreeStoreError>(),
            Some(TreeStoreError::Capacity(_))
        ));
        assert_eq!(store.get(&key(0)).unwrap(), Some(value));
        assert!(store.stats().unwrap().page_count <= 4);
        store.check_integrity().unwrap();
    }

    #[test]
    fn test_swallowed_capacity_error_blocks_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = TreeStore::builder()
            .path(dir.path().join("small.db"))
            .sync_on_commit(false)
            .max_pages(4)
            .open()
            .unwrap();
        store.insert(b"kept", b"before").unwrap();
        let value = vec![7u8; 3000];

        let result = store.update(|txn| {
            assert!(txn.insert(b"", b"v").is_err());
            assert!(!txn.is_failed());
            for i in 0..50 {
                if txn.insert(&key(i), &value).is_err() {
                    break;
                }
            }
            assert!(txn.is_failed());
            Ok(())
        });

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TreeStoreError>(),
            Some(TreeStoreError::Conflict(_))
        ));
        assert_eq!(store.get(&key(0)).unwrap(), None);
        assert_eq!(store.get(b"kept").unwrap(), Some(b"before".to_vec()));
        assert_eq!(store.check_integrity().unwrap().keys, 1);
    }

    #[test]
    fn test_freed_pages_are_reused() {
        let (_dir, store) = create_test_store();
        load_keys(&store, 50);
        let before = store.stats().unwrap().page_count;

        for round in 0..300 {
            store
                .insert(&key(round % 50), format!("round{}", round).as_bytes())
                .unwrap();
        }

        let after = store.stats().unwrap();
        assert!(
            after.page_count <= before + 16,
            "file grew from {} to {} pages",
            before,
            after.page_count
        );
        assert_eq!(store.check_integrity().unwrap().keys, 50);
    }

    #[test]
    fn test_open_reader_delays_page_reuse() {
        let (_dir, store) = create_test_store();
        load_keys(&store, 10);

        let pinned = store.begin_read().unwrap();
        for round in 0..20 {
            store.insert(&key(0), format!("r{}", round).as_bytes()).unwrap();
        }

        assert_eq!(pinned.get(&key(0)).unwrap(), Some(b"value0".to_vec()));
        assert_eq!(store.stats().unwrap().active_readers, 1);
        drop(pinned);
        assert_eq!(store.stats().unwrap().active_readers, 0);
    }
}
