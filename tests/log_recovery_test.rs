mod test_utils;

use fosterdb::{BTree, Database, ErrorCode, Transaction, PAGE_SIZE};
use test_utils::{begin, committed_inserts, scan_all, setup};

fn keyed(i: usize) -> Vec<u8> {
    format!("rec{:05}", i).into_bytes()
}

/// Flip the last footer byte of one page so the LSN duplicate no longer
/// matches the header: the classic torn-write shape.
fn tear_page(path: &std::path::Path, pid: u32) {
    use std::io::{Read, Seek, SeekFrom, Write};
    let mut f = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .unwrap();
    let off = pid as u64 * PAGE_SIZE as u64 + PAGE_SIZE as u64 - 1;
    f.seek(SeekFrom::Start(off)).unwrap();
    let mut b = [0u8; 1];
    f.read_exact(&mut b).unwrap();
    b[0] ^= 0xFF;
    f.seek(SeekFrom::Start(off)).unwrap();
    f.write_all(&b).unwrap();
}

/// Crash with a durable log but unwritten pages: redo replays the
/// committed inserts, undo removes the loser's.
#[test]
fn test_crash_recovery_keeps_committed_drops_losers() {
    let db = setup("crash_basic");
    let tree = BTree::create().unwrap();

    let tx = begin();
    for i in 0..50 {
        tree.insert(&tx, &keyed(i), b"committed").unwrap();
    }
    tx.commit().unwrap();

    // the loser lives on its own thread so its transaction stays active
    // in the table when the thread is gone
    let store = tree.store();
    std::thread::spawn(move || {
        let loser_tree = BTree::open(store);
        let tx = Transaction::begin().unwrap();
        for i in 100..110 {
            loser_tree.insert(&tx, &keyed(i), b"loser").unwrap();
        }
        // durable but uncommitted
        Database::log_manager().flush_all().unwrap();
    })
    .join()
    .unwrap();

    let losers = db.crash_and_restart();
    assert!(losers >= 1);

    let tree = BTree::open(store);
    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 50);
    for (i, (k, v)) in rows.iter().enumerate() {
        assert_eq!(k, &keyed(i));
        assert_eq!(v, b"committed");
    }
    assert!(tree.verify(14).unwrap());
}

/// Applying restart twice yields the same state as once.
#[test]
fn test_recovery_idempotent() {
    let db = setup("crash_twice");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);
    let store = tree.store();

    std::thread::spawn(move || {
        let t = BTree::open(store);
        let tx = Transaction::begin().unwrap();
        t.insert(&tx, b"zz-loser", b"x").unwrap();
        Database::log_manager().flush_all().unwrap();
    })
    .join()
    .unwrap();

    db.crash_and_restart();
    let first = scan_all(&BTree::open(store));

    // crash again with no new work and recover once more
    db.crash_and_restart();
    let second = scan_all(&BTree::open(store));

    assert_eq!(first, second);
    assert_eq!(first.len(), 3);
}

/// Recovery across structure modifications: the log rebuilds split pages
/// byte-compatibly enough that every committed record is reachable.
#[test]
fn test_recovery_replays_splits() {
    let db = setup("crash_splits");
    let tree = BTree::create().unwrap();
    let value = vec![6u8; 300];

    let tx = begin();
    for i in 0..400 {
        tree.insert(&tx, &keyed(i), &value).unwrap();
    }
    tx.commit().unwrap();
    let store = tree.store();

    let losers = db.crash_and_restart();
    assert_eq!(losers, 0);

    let tree = BTree::open(store);
    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 400);
    for (i, (k, _)) in rows.iter().enumerate() {
        assert_eq!(k, &keyed(i));
    }
    assert!(tree.verify(14).unwrap());
}

#[test]
fn test_clean_shutdown_and_remount() {
    let db = setup("clean_remount");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"x", b"1"), (b"y", b"2")]);
    let store = tree.store();

    // orderly shutdown flushes everything; restart finds no losers
    fosterdb::Database::shutdown().unwrap();
    let losers = fosterdb::Database::start(test_utils::test_options("clean_remount")).unwrap();
    assert_eq!(losers, 0);

    let rows = scan_all(&BTree::open(store));
    assert_eq!(rows.len(), 2);
    drop(db);
}

#[test]
fn test_checkpoint_advances_master() {
    let _db = setup("checkpoint");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"k1", b"v1")]);

    let master_before = Database::log_manager().master_lsn();
    Database::checkpoint().unwrap();
    let master_after = Database::log_manager().master_lsn();
    assert!(master_after > master_before || master_before.is_null());

    committed_inserts(&tree, &[(b"k2", b"v2")]);
    Database::recycle_log().unwrap();

    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 2);
}

/// A page torn on disk is rebuilt from its log records on the next fix.
#[test]
fn test_torn_page_rebuilt_by_single_page_recovery() {
    let _db = setup("spr_rebuild");
    let tree = BTree::create().unwrap();
    committed_inserts(
        &tree,
        &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3"), (b"d", b"4")],
    );
    let store = tree.store();
    let root_pid = Database::volume().store_root(store).unwrap();
    Database::shutdown().unwrap();

    let options = test_utils::test_options("spr_rebuild");
    tear_page(&options.data_file, root_pid);

    // restart redo fixes the page, finds it torn, and replays its whole
    // history from the log
    let losers = Database::start(options).unwrap();
    assert_eq!(losers, 0);

    let tree = BTree::open(store);
    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 4);
    assert!(tree.verify(14).unwrap());
}

/// With the log gone there is nothing to replay; a torn root has no
/// parent EMLSN either, so the fix reports exactly that.
#[test]
fn test_torn_root_without_log_reports_no_parent() {
    let _db = setup("spr_no_parent");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"x", b"1"), (b"y", b"2")]);
    let store = tree.store();
    let root_pid = Database::volume().store_root(store).unwrap();
    Database::shutdown().unwrap();

    let options = test_utils::test_options("spr_no_parent");
    std::fs::remove_dir_all(&options.log_dir).unwrap();
    tear_page(&options.data_file, root_pid);

    Database::start(options).unwrap();
    let tree = BTree::open(store);
    let tx = begin();
    let err = tree.scan(&tx).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoParentSpr);
    tx.abort().unwrap();
}

#[test]
fn test_abort_after_savepoint_survives_crash() {
    let db = setup("crash_savepoint");
    let tree = BTree::create().unwrap();
    let store = tree.store();

    let tx = begin();
    tree.insert(&tx, b"keep", b"1").unwrap();
    let sp = tx.save_point();
    tree.insert(&tx, b"undone", b"2").unwrap();
    tx.rollback(sp).unwrap();
    tx.commit().unwrap();
    Database::log_manager().flush_all().unwrap();

    db.crash_and_restart();
    let rows = scan_all(&BTree::open(store));
    let keys: Vec<&[u8]> = rows.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![b"keep".as_ref()]);
}
