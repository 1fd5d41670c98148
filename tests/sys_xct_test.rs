mod test_utils;

use fosterdb::{transaction::SysXct, BTree, Transaction};
use test_utils::{begin, committed_inserts, scan_all, setup};

/// A system transaction nested in a user transaction: its insert is
/// visible alongside the user's own work.
#[test]
fn test_nested_sys_xct_visibility() {
    let _db = setup("ssx_visible");
    let tree = BTree::create().unwrap();
    committed_inserts(
        &tree,
        &[(b"aa1", b"d1"), (b"aa3", b"d3"), (b"aa5", b"d5")],
    );

    let tx = begin();
    tree.insert(&tx, b"aa6", b"d6").unwrap();
    {
        let sxs = SysXct::begin(false).unwrap();
        tree.insert(&sxs.handle(), b"aa7", b"d7").unwrap();
        sxs.commit().unwrap();
    }
    tx.commit().unwrap();

    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 5);
    assert_eq!(rows.first().unwrap().0, b"aa1");
    assert_eq!(rows.last().unwrap().0, b"aa7");
}

/// Abort undoes the user transaction's records but not those of a system
/// transaction that committed inside it: the SSX is its own durable unit.
#[test]
fn test_abort_keeps_committed_sys_xct_work() {
    let _db = setup("ssx_abort");
    let tree = BTree::create().unwrap();
    committed_inserts(
        &tree,
        &[(b"aa1", b"d1"), (b"aa3", b"d3"), (b"aa5", b"d5")],
    );

    let tx = begin();
    tree.insert(&tx, b"aa6", b"d6").unwrap();
    {
        let sxs = SysXct::begin(false).unwrap();
        tree.insert(&sxs.handle(), b"aa7", b"d7").unwrap();
        sxs.commit().unwrap();
    }
    tx.abort().unwrap();

    let rows = scan_all(&tree);
    // aa6 is gone, aa7 survives
    assert_eq!(rows.len(), 4);
    assert!(rows.iter().any(|(k, _)| k == b"aa7"));
    assert!(!rows.iter().any(|(k, _)| k == b"aa6"));
}

#[test]
fn test_savepoint_partial_rollback() {
    let _db = setup("savepoint");
    let tree = BTree::create().unwrap();

    let tx = begin();
    tree.insert(&tx, b"keep", b"1").unwrap();
    let sp = tx.save_point();
    tree.insert(&tx, b"drop1", b"2").unwrap();
    tree.insert(&tx, b"drop2", b"3").unwrap();
    tx.rollback(sp).unwrap();
    tree.insert(&tx, b"after", b"4").unwrap();
    tx.commit().unwrap();

    let rows = scan_all(&tree);
    let keys: Vec<&[u8]> = rows.iter().map(|(k, _)| k.as_slice()).collect();
    assert_eq!(keys, vec![b"after".as_ref(), b"keep".as_ref()]);
}

#[test]
fn test_chain_commits_and_continues() {
    let _db = setup("chain");
    let tree = BTree::create().unwrap();

    let tx = Transaction::begin().unwrap();
    tree.insert(&tx, b"first", b"1").unwrap();
    // lazy link: the chained successor picks up without a log flush
    let tx = tx.chain(true).unwrap();
    tree.insert(&tx, b"second", b"2").unwrap();
    tx.commit().unwrap();

    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 2);
}

#[test]
fn test_read_only_commit_writes_nothing() {
    let _db = setup("read_only");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"k", b"v")]);

    let before = fosterdb::Database::log_manager().curr_lsn();
    let tx = begin();
    assert_eq!(tree.lookup(&tx, b"k").unwrap(), Some(b"v".to_vec()));
    tx.commit().unwrap();
    let after = fosterdb::Database::log_manager().curr_lsn();
    assert_eq!(before, after);
}
