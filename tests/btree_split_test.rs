mod test_utils;

use fosterdb::{
    btree::{adopt, defrag, grow, key::BTreeKey, merge, traverse},
    sync::qsx::LatchMode,
    BTree, Database,
};
use test_utils::{begin, scan_all, setup};

fn keyed(i: usize) -> Vec<u8> {
    format!("key{:06}", i).into_bytes()
}

/// Descend one level by hand (no opportunistic adoption on the way) and
/// return the EX-latched leaf covering `probe`. If a parent adopted the
/// leaf's foster sibling meanwhile, hand it back first so the foster pair
/// is intact again.
fn fix_leaf_pair(tree: &BTree, probe: &BTreeKey) -> fosterdb::buffer::PageGuard {
    let pool = Database::buffer_pool();
    {
        let root = pool.fix_root(tree.store(), LatchMode::X).unwrap();
        if root.page().is_node() && root.page().nrecs() >= 1 {
            adopt::deadopt_child(&pool, &root, 1).unwrap();
        }
    }
    let root = pool.fix_root(tree.store(), LatchMode::S).unwrap();
    if root.page().is_leaf() {
        drop(root);
        return pool.fix_root(tree.store(), LatchMode::X).unwrap();
    }
    let (_, v) = root.page().node_child_for(probe);
    pool.fix_nonroot(&root, v, LatchMode::X, false, false).unwrap()
}

#[test]
fn test_many_inserts_split_and_scan_in_order() {
    let _db = setup("split_scan");
    let tree = BTree::create().unwrap();
    let value = vec![7u8; 200];

    let tx = begin();
    for i in 0..500 {
        tree.insert(&tx, &keyed(i), &value).unwrap();
    }
    tx.commit().unwrap();

    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 500);
    for (i, (k, v)) in rows.iter().enumerate() {
        assert_eq!(k, &keyed(i));
        assert_eq!(v, &value);
    }
    assert!(tree.verify(14).unwrap());
}

#[test]
fn test_random_order_inserts() {
    let _db = setup("split_random");
    let tree = BTree::create().unwrap();
    let value = vec![3u8; 150];

    // a fixed permutation: no append pattern, splits pick middle pivots
    let mut order: Vec<usize> = (0..400).collect();
    let mut state = 0x12345678u64;
    for i in (1..order.len()).rev() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let j = (state >> 33) as usize % (i + 1);
        order.swap(i, j);
    }

    let tx = begin();
    for i in &order {
        tree.insert(&tx, &keyed(*i), &value).unwrap();
    }
    tx.commit().unwrap();

    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 400);
    for (i, (k, _)) in rows.iter().enumerate() {
        assert_eq!(k, &keyed(i));
    }
    assert!(tree.verify(14).unwrap());
}

#[test]
fn test_root_page_id_stable_across_grow() {
    let _db = setup("grow_stable_root");
    let tree = BTree::create().unwrap();
    let root_before = Database::volume().store_root(tree.store()).unwrap();

    let value = vec![1u8; 400];
    let tx = begin();
    for i in 0..300 {
        tree.insert(&tx, &keyed(i), &value).unwrap();
    }
    tx.commit().unwrap();

    // the tree grew at least one level but kept its root page id
    let root_after = Database::volume().store_root(tree.store()).unwrap();
    assert_eq!(root_before, root_after);
    let pool = Database::buffer_pool();
    let root = pool.fix_root(tree.store(), LatchMode::S).unwrap();
    assert!(root.page().is_node());
    assert_eq!(root.pid(), root_before);
}

#[test]
fn test_prefix_truncation_after_split() {
    let _db = setup("prefix_trunc");
    let tree = BTree::create().unwrap();
    // long shared prefix, 4-5 records per page
    let value = vec![9u8; 1500];
    let tx = begin();
    for i in 0..24 {
        let key = format!("000000{:03}", i * 7).into_bytes();
        tree.insert(&tx, &key, &value).unwrap();
    }
    tx.commit().unwrap();

    // a middle leaf lives between two truncated separators sharing the
    // zeros; its prefix covers everything but the distinguishing tail
    let probe = BTreeKey::regular(b"000000070");
    let leaf = traverse::traverse(
        tree.store(),
        &probe,
        traverse::TraverseMode::FenceContain,
        LatchMode::S,
        None,
    )
    .unwrap();
    let keysize = 10; // serialized: sign byte + 9 characters
    if leaf.page().fence_low().is_regular() && !leaf.page().fence_high().is_pos_inf() {
        assert!(leaf.page().prefix_len() >= keysize - 3);
    }
    assert!(tree.verify(14).unwrap());
}

#[test]
fn test_split_picks_single_byte_separator() {
    let _db = setup("short_separator");
    let tree = BTree::create().unwrap();
    // ~19 records per page puts the d/e boundary inside the pivot window
    let value = vec![2u8; 400];
    let tx = begin();
    for prefix in ["d", "e"].iter() {
        for digit in 0..10 {
            let key = format!("{}{}", prefix, digit).into_bytes();
            tree.insert(&tx, &key, &value).unwrap();
        }
    }
    tx.commit().unwrap();

    // some separator in the tree is the one-byte string between "d9" and
    // "e0"
    let pool = Database::buffer_pool();
    let root = pool.fix_root(tree.store(), LatchMode::S).unwrap();
    let mut found_short = false;
    if root.page().is_node() {
        for slot in 1..=root.page().nrecs() {
            if root.page().key_at(slot).user_bytes().len() == 1 {
                found_short = true;
            }
        }
    }
    drop(root);
    // separators can also live one level down in foster chains
    let probe = BTreeKey::regular(b"d9");
    let leaf = traverse::traverse(
        tree.store(),
        &probe,
        traverse::TraverseMode::FenceContain,
        LatchMode::S,
        None,
    )
    .unwrap();
    if !leaf.page().fence_high().is_pos_inf()
        && leaf.page().fence_high().user_bytes().len() == 1
    {
        found_short = true;
    }
    assert!(found_short);
}

#[test]
fn test_merge_refused_right_after_split_then_succeeds() {
    let _db = setup("merge_cycle");
    // background writers would make durability nondeterministic here
    Database::pause_background_for_test();
    let tree = BTree::create().unwrap();
    let value = vec![5u8; 1200];

    // fill the single-leaf root until it splits once
    let tx = begin();
    let mut count = 0;
    loop {
        tree.insert(&tx, &keyed(count), &value).unwrap();
        count += 1;
        let pool = Database::buffer_pool();
        let root = pool.fix_root(tree.store(), LatchMode::S).unwrap();
        let split = root.page().has_foster();
        drop(root);
        if split {
            break;
        }
        assert!(count < 100, "leaf never split");
    }

    let pool = Database::buffer_pool();
    {
        // both halves are dirty and the rebalance is not durable yet: the
        // merge must refuse, leaving the foster child alive and dirty
        let root = pool.fix_root(tree.store(), LatchMode::X).unwrap();
        assert!(root.page().has_foster());
        let merged = merge::merge_foster(&root).unwrap();
        assert!(!merged);
        assert!(root.page().has_foster());
        let foster = pool
            .fix_nonroot(&root, root.page().foster(), LatchMode::S, false, false)
            .unwrap();
        assert!(foster.cb().is_dirty());
    }
    tx.commit().unwrap();

    // make the split durable and thin out both pages; the removes may
    // grow the tree, so the pair is reached through a fresh traversal
    Database::log_manager().flush_all().unwrap();
    let tx = begin();
    for j in 1..count {
        tree.remove(&tx, &keyed(j)).unwrap();
    }
    tx.commit().unwrap();

    let probe = BTreeKey::regular(&keyed(0));
    {
        let leaf = fix_leaf_pair(&tree, &probe);
        defrag::defrag_page(&leaf).unwrap();
        assert!(leaf.page().has_foster());
        let foster = pool
            .fix_nonroot(&leaf, leaf.page().foster(), LatchMode::X, false, false)
            .unwrap();
        defrag::defrag_page(&foster).unwrap();
    }
    Database::log_manager().flush_all().unwrap();
    {
        let leaf = fix_leaf_pair(&tree, &probe);
        let merged = merge::merge_foster(&leaf).unwrap();
        assert!(merged);
        assert!(!leaf.page().has_foster());
    }

    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 1);
    assert!(tree.verify(14).unwrap());
}

#[test]
fn test_grow_then_shrink_round_trip() {
    let _db = setup("grow_shrink");
    let tree = BTree::create().unwrap();
    let value = vec![8u8; 1200];

    // split the root leaf once, but do not traverse afterwards so the
    // foster stays unadopted
    let tx = begin();
    let mut count = 0;
    loop {
        tree.insert(&tx, &keyed(count), &value).unwrap();
        count += 1;
        let pool = Database::buffer_pool();
        let root = pool.fix_root(tree.store(), LatchMode::S).unwrap();
        let split = root.page().has_foster();
        drop(root);
        if split {
            break;
        }
        assert!(count < 100, "leaf never split");
    }
    tx.commit().unwrap();

    // grow: the root becomes an empty node whose pid0 child carries the
    // old records and the foster pointer
    grow::grow_tree(tree.store()).unwrap();
    let pool = Database::buffer_pool();
    {
        let root = pool.fix_root(tree.store(), LatchMode::S).unwrap();
        assert!(root.page().is_node());
        assert_eq!(root.page().nrecs(), 0);
        assert!(!root.page().has_foster());
    }

    // shrink: with no separators the child content comes back up; the
    // foster chain comes with it
    grow::shrink_tree(tree.store()).unwrap();
    {
        let root = pool.fix_root(tree.store(), LatchMode::S).unwrap();
        assert!(root.page().is_leaf());
        assert!(root.page().has_foster());
    }

    let rows = scan_all(&tree);
    assert_eq!(rows.len(), count);
    assert!(tree.verify(14).unwrap());
}

#[test]
fn test_rebalance_evens_out_foster_pair() {
    let _db = setup("rebalance");
    let tree = BTree::create().unwrap();
    let value = vec![1u8; 700];

    // split once, then empty out the foster side so the pair is lopsided
    let tx = begin();
    let mut count = 0;
    loop {
        tree.insert(&tx, &keyed(count), &value).unwrap();
        count += 1;
        let pool = Database::buffer_pool();
        let root = pool.fix_root(tree.store(), LatchMode::S).unwrap();
        let split = root.page().has_foster();
        drop(root);
        if split {
            break;
        }
        assert!(count < 100, "leaf never split");
    }
    tx.commit().unwrap();

    let pool = Database::buffer_pool();
    let head_records = {
        let root = pool.fix_root(tree.store(), LatchMode::S).unwrap();
        root.page().nrecs()
    };
    assert!(head_records >= 2);
    let tx = begin();
    for i in head_records..count {
        tree.remove(&tx, &keyed(i)).unwrap();
    }
    tx.commit().unwrap();

    // the removes may have grown the tree or adopted the sibling; rebuild
    // the foster pair and reach it without the traversal's adoption path
    let probe = BTreeKey::regular(&keyed(0));
    {
        let leaf = fix_leaf_pair(&tree, &probe);
        assert!(leaf.page().has_foster());
        let foster = pool
            .fix_nonroot(&leaf, leaf.page().foster(), LatchMode::X, false, false)
            .unwrap();
        defrag::defrag_page(&foster).unwrap();
        drop(foster);
        let moved = merge::rebalance_foster(&leaf).unwrap();
        assert!(moved);
        assert!(leaf.page().has_foster());
    }

    let rows = scan_all(&tree);
    assert_eq!(rows.len(), head_records);
    assert!(tree.verify(14).unwrap());
}

#[test]
fn test_deadopt_returns_child_to_foster_chain() {
    let _db = setup("deadopt");
    let tree = BTree::create().unwrap();
    let value = vec![3u8; 300];
    let tx = begin();
    for i in 0..300 {
        tree.insert(&tx, &keyed(i), &value).unwrap();
    }
    tx.commit().unwrap();

    let pool = Database::buffer_pool();
    let mut deadopted = false;
    {
        let root = pool.fix_root(tree.store(), LatchMode::X).unwrap();
        if root.page().is_node() && root.page().nrecs() >= 1 {
            // hand the rightmost child back to its left neighbor; refusal
            // (the neighbor already fosters something) is a valid outcome
            let slot = root.page().nrecs();
            deadopted = adopt::deadopt_child(&pool, &root, slot).unwrap();
        }
    }
    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 300);
    assert!(tree.verify(14).unwrap());
    // regardless of the outcome the tree stayed whole; when it happened,
    // the structure check above already covered the re-fostered chain
    let _ = deadopted;
}

#[test]
fn test_ghosts_reclaimed_by_defrag() {
    let _db = setup("defrag");
    let tree = BTree::create().unwrap();
    let value = vec![4u8; 100];
    let tx = begin();
    for i in 0..20 {
        tree.insert(&tx, &keyed(i), &value).unwrap();
    }
    for i in 0..10 {
        tree.remove(&tx, &keyed(i)).unwrap();
    }
    tx.commit().unwrap();

    let pool = Database::buffer_pool();
    let root = pool.fix_root(tree.store(), LatchMode::X).unwrap();
    let free_before = root.page().free_space();
    let reclaimed = defrag::defrag_page(&root).unwrap();
    assert_eq!(reclaimed, 10);
    assert!(root.page().free_space() > free_before);
    drop(root);

    let rows = scan_all(&tree);
    assert_eq!(rows.len(), 10);
}
