mod test_utils;

use fosterdb::{BTree, ErrorCode, Transaction};
use test_utils::{begin, committed_inserts, scan_all, setup};

#[test]
fn test_insert_and_scan() {
    let _db = setup("insert_scan");
    let tree = BTree::create().unwrap();

    committed_inserts(
        &tree,
        &[(b"aa1", b"d1"), (b"aa3", b"d3"), (b"aa5", b"d5")],
    );

    let rows = scan_all(&tree);
    assert_eq!(
        rows,
        vec![
            (b"aa1".to_vec(), b"d1".to_vec()),
            (b"aa3".to_vec(), b"d3".to_vec()),
            (b"aa5".to_vec(), b"d5".to_vec()),
        ]
    );
}

#[test]
fn test_insert_then_lookup() {
    let _db = setup("insert_lookup");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"k1", b"v1"), (b"k2", b"v2")]);

    let tx = begin();
    assert_eq!(tree.lookup(&tx, b"k1").unwrap(), Some(b"v1".to_vec()));
    assert_eq!(tree.lookup(&tx, b"k2").unwrap(), Some(b"v2".to_vec()));
    assert_eq!(tree.lookup(&tx, b"k3").unwrap(), None);
    tx.commit().unwrap();
}

#[test]
fn test_duplicate_insert_rejected() {
    let _db = setup("duplicate");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"k", b"v")]);

    let tx = begin();
    let err = tree.insert(&tx, b"k", b"other").unwrap_err();
    assert_eq!(err.code(), ErrorCode::Duplicate);
    tx.abort().unwrap();
}

#[test]
fn test_remove_then_lookup_misses() {
    let _db = setup("remove");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"a", b"1"), (b"b", b"2"), (b"c", b"3")]);

    let tx = begin();
    tree.remove(&tx, b"b").unwrap();
    assert_eq!(tree.lookup(&tx, b"b").unwrap(), None);
    tx.commit().unwrap();

    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 2);

    let tx = begin();
    let err = tree.remove(&tx, b"b").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    tx.abort().unwrap();
}

#[test]
fn test_reinsert_after_remove_reuses_ghost() {
    let _db = setup("reinsert");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"key", b"first")]);

    let tx = begin();
    tree.remove(&tx, b"key").unwrap();
    tx.commit().unwrap();

    // the ghost left behind is converted back into a live record
    let tx = begin();
    tree.insert(&tx, b"key", b"again").unwrap();
    tx.commit().unwrap();

    let tx = begin();
    assert_eq!(tree.lookup(&tx, b"key").unwrap(), Some(b"again".to_vec()));
    tx.commit().unwrap();
}

#[test]
fn test_update_and_put() {
    let _db = setup("update_put");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"k", b"old")]);

    let tx = begin();
    tree.update(&tx, b"k", b"new").unwrap();
    // put on an existing key updates, on a missing key inserts
    tree.put(&tx, b"k", b"newer").unwrap();
    tree.put(&tx, b"fresh", b"born").unwrap();
    tx.commit().unwrap();

    let tx = begin();
    assert_eq!(tree.lookup(&tx, b"k").unwrap(), Some(b"newer".to_vec()));
    assert_eq!(tree.lookup(&tx, b"fresh").unwrap(), Some(b"born".to_vec()));
    let err = tree.update(&tx, b"nope", b"x").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    tx.commit().unwrap();
}

#[test]
fn test_update_grows_value() {
    let _db = setup("update_grow");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"k", b"tiny")]);

    let big = vec![b'x'; 500];
    let tx = begin();
    tree.update(&tx, b"k", &big).unwrap();
    tx.commit().unwrap();

    let tx = begin();
    assert_eq!(tree.lookup(&tx, b"k").unwrap(), Some(big));
    tx.commit().unwrap();
}

#[test]
fn test_overwrite_splices_bytes() {
    let _db = setup("overwrite");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"k", b"hello world")]);

    let tx = begin();
    tree.overwrite(&tx, b"k", 6, b"rusty").unwrap();
    tx.commit().unwrap();

    let tx = begin();
    assert_eq!(
        tree.lookup(&tx, b"k").unwrap(),
        Some(b"hello rusty".to_vec())
    );
    let err = tree.overwrite(&tx, b"k", 8, b"too long").unwrap_err();
    assert_eq!(err.code(), ErrorCode::BadArgument);
    tx.commit().unwrap();
}

#[test]
fn test_abort_restores_previous_state() {
    let _db = setup("abort");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"stay", b"1")]);

    let tx = begin();
    tree.insert(&tx, b"gone", b"2").unwrap();
    tree.update(&tx, b"stay", b"changed").unwrap();
    tx.abort().unwrap();

    let tx = begin();
    assert_eq!(tree.lookup(&tx, b"gone").unwrap(), None);
    assert_eq!(tree.lookup(&tx, b"stay").unwrap(), Some(b"1".to_vec()));
    tx.commit().unwrap();
}

#[test]
fn test_two_stores_are_independent() {
    let _db = setup("two_stores");
    let t1 = BTree::create().unwrap();
    let t2 = BTree::create().unwrap();
    assert_ne!(t1.store(), t2.store());

    committed_inserts(&t1, &[(b"k", b"one")]);
    committed_inserts(&t2, &[(b"k", b"two")]);

    let tx = begin();
    assert_eq!(t1.lookup(&tx, b"k").unwrap(), Some(b"one".to_vec()));
    assert_eq!(t2.lookup(&tx, b"k").unwrap(), Some(b"two".to_vec()));
    tx.commit().unwrap();
}

#[test]
fn test_user_transactions_do_not_nest() {
    let _db = setup("no_nesting");
    let _tx = Transaction::begin().unwrap();
    let err = Transaction::begin().unwrap_err();
    assert_eq!(err.code(), ErrorCode::InTrans);
    _tx.commit().unwrap();
}

#[test]
fn test_verify_small_tree() {
    let _db = setup("verify_small");
    let tree = BTree::create().unwrap();
    committed_inserts(&tree, &[(b"a", b"1"), (b"b", b"2")]);
    assert!(tree.verify(12).unwrap());

    let report = fosterdb::btree::verify::verify_volume(12).unwrap();
    assert!(report.consistent);
    assert_eq!(report.stores_checked, 1);
}

#[test]
fn test_drop_store_at_commit() {
    let _db = setup("drop_store");
    let keep = BTree::create().unwrap();
    let doomed = BTree::create().unwrap();
    committed_inserts(&keep, &[(b"k", b"v")]);
    committed_inserts(&doomed, &[(b"gone", b"soon")]);
    let doomed_store = doomed.store();

    let tx = begin();
    doomed.drop_at_commit(&tx);
    tx.commit().unwrap();

    // the freeing-space phase removed the directory entry
    assert!(fosterdb::Database::volume().store_root(doomed_store).is_err());
    let rows = scan_all(&keep);
    assert_eq!(rows.len(), 1);
}
