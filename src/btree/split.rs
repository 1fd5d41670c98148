//! Foster split: no-record child allocation followed by a rebalance, each
//! a single-log system transaction whose record is self-contained enough
//! to replay either page on its own.

use log::debug;

use crate::{
    buffer::PageGuard,
    db_error,
    error::ErrorCode,
    log::{
        record::{FosterRebalancePayload, GhostReservePayload, LogRecord, LogRecordKind,
            NorecAllocPayload},
        Lsn,
    },
    sync::qsx::LatchMode,
    transaction::SysXct,
    types::{DbResult, PageId},
    Database,
};

use super::{
    apply::{self, PageRole},
    key::BTreeKey,
    page::encode_records,
};

/// Reserve an initially-empty foster child: the new page covers the empty
/// range [high, high) and inherits the page's old foster pointer and chain
/// fence; the page's own fence keys are untouched.
fn norec_alloc(page: &PageGuard) -> DbResult<PageId> {
    debug_assert_eq!(page.mode(), LatchMode::X);
    let pool = Database::buffer_pool();
    let store = page.page().store_id();
    let new_pid = Database::volume().allocate_page(store)?;

    let fence = page.page().fence_high();
    // the first split of a rightmost page starts the chain fence
    let chain_high = page.page().chain_fence_high();
    let inherited_foster = pool.normalize_pid(page.page().foster());

    let sxs = SysXct::begin(true)?;
    let mut rec = LogRecord::new(LogRecordKind::NorecAlloc, 0, page.pid()).with_payload(
        NorecAllocPayload::encode(
            new_pid,
            store,
            page.page().root_pid(),
            page.page().level(),
            &fence,
            &chain_high,
            inherited_foster,
        ),
    );
    rec.page_prev_lsn = page.page().page_lsn();
    let lsn = Database::xct_manager().log_insert(sxs.id(), rec.clone())?;
    rec.lsn = lsn;

    let new_page = pool.fix_direct(new_pid, LatchMode::X, true)?;
    apply::apply_to_page(&rec, page.page_mut(), PageRole::Primary)?;
    page.update_lsn_and_dirty(lsn);
    apply::apply_to_page(&rec, new_page.page_mut(), PageRole::Secondary)?;
    new_page.update_lsn_and_dirty(lsn);
    sxs.commit()?;
    Ok(new_pid)
}

/// Split the EX-latched page around `triggering_key`. On return the page
/// keeps the head of its records and its new foster child holds the tail;
/// the caller re-locates the key (it may now belong to the foster).
pub fn split_foster(page: &PageGuard, triggering_key: &BTreeKey) -> DbResult<PageId> {
    debug_assert_eq!(page.mode(), LatchMode::X);
    let pool = Database::buffer_pool();
    if page.page().is_node() {
        pool.unswizzle_children_of(page);
    }
    let new_pid = norec_alloc(page)?;

    // pivot choice: appends keep the new page nearly empty, otherwise the
    // shortest separator near the middle wins
    let n = page.page().nrecs();
    let norecord = page.page().is_insertion_extremely_skewed_right()
        && *triggering_key > page.page().key_at(n)
        && page.page().fence_contains(triggering_key);
    let (first_moved, separator) = if norecord {
        // pure fence-key update: nothing moves, appends go to the child
        (n + 1, triggering_key.clone())
    } else {
        page.page().suggest_fence_for_split(triggering_key)
    };

    let (move_count, moved, new_pid0, new_pid0_emlsn) = if page.page().is_leaf() {
        let moved = page.page().collect_records(first_moved, n + 1);
        (n + 1 - first_moved, moved, 0, Lsn::NULL)
    } else {
        // the pivot record itself becomes the child's pid0; its key is the
        // separator and its entry disappears
        let pid0 = page.page().node_child(first_moved);
        let emlsn = page.page().node_emlsn(first_moved);
        let moved = page.page().collect_records(first_moved + 1, n + 1);
        (n + 1 - first_moved, moved, pid0, emlsn)
    };
    debug_assert!(norecord || move_count > 0);

    let foster = pool.fix_nonroot(page, page.page().foster(), LatchMode::X, false, false)?;
    let foster_high = foster.page().fence_high();
    let chain_high = foster.page().chain_fence_high();

    let sep_for_node = if page.page().is_node() && !norecord {
        // a node separator is the exact key of the pivot record
        page.page().key_at(first_moved)
    } else {
        separator.clone()
    };

    let sxs = SysXct::begin(true)?;
    let mut rec = LogRecord::new(LogRecordKind::FosterRebalance, 0, page.pid()).with_payload(
        FosterRebalancePayload::encode(
            foster.pid(),
            move_count as u16,
            &sep_for_node,
            &foster_high,
            &chain_high,
            new_pid0,
            new_pid0_emlsn,
            &encode_records(&moved),
        ),
    );
    rec.page_prev_lsn = page.page().page_lsn();
    let lsn = Database::xct_manager().log_insert(sxs.id(), rec.clone())?;
    rec.lsn = lsn;

    apply::apply_to_page(&rec, page.page_mut(), PageRole::Primary)?;
    page.update_lsn_and_dirty(lsn);
    apply::apply_to_page(&rec, foster.page_mut(), PageRole::Secondary)?;
    foster.update_lsn_and_dirty(lsn);
    sxs.commit()?;
    debug!(
        "foster split: page {} -> {} ({} records moved, separator {:?})",
        page.pid(),
        new_pid,
        move_count,
        sep_for_node
    );
    Ok(new_pid)
}

/// Make room for an insert: split when needed, then hand back the guard of
/// whichever page now covers the key.
pub fn split_if_needed(
    leaf: PageGuard,
    key: &BTreeKey,
    value_len: usize,
) -> DbResult<PageGuard> {
    if leaf.page().check_space_for_leaf_insert(key, value_len) {
        return Ok(leaf);
    }
    if leaf.page().nrecs() < 2 {
        // a single oversized record page cannot split further
        return Err(db_error!(
            ErrorCode::RecWontFit,
            "record of {} bytes cannot fit a page",
            value_len
        ));
    }
    split_foster(&leaf, key)?;
    // the key now belongs to this page or somewhere down its foster chain
    let pool = Database::buffer_pool();
    let mut cur = leaf;
    while !cur.page().fence_contains(key) {
        debug_assert!(cur.page().has_foster());
        let next = pool.fix_nonroot(&cur, cur.page().foster(), LatchMode::X, false, false)?;
        cur = next;
    }
    Ok(cur)
}

/// Guarantee a record (ghost at least) exists for the page's low fence so
/// that range locks on the fence boundary have a durable anchor across
/// foster operations.
pub fn assure_fence_low_entry(leaf: &PageGuard) -> DbResult {
    debug_assert_eq!(leaf.mode(), LatchMode::X);
    if !leaf.page().is_leaf() {
        return Ok(());
    }
    let low = leaf.page().fence_low();
    if !low.is_regular() {
        return Ok(());
    }
    if leaf.page().search(&low).is_ok() {
        return Ok(());
    }
    if !leaf.page().check_space_for_leaf_insert(&low, 0) {
        // no room for the anchor; the lock falls back to coarser targets
        return Ok(());
    }
    let sxs = SysXct::begin(true)?;
    let mut rec = LogRecord::new(LogRecordKind::GhostReserve, 0, leaf.pid())
        .with_payload(GhostReservePayload::encode(&low, 0));
    rec.page_prev_lsn = leaf.page().page_lsn();
    let lsn = Database::xct_manager().log_insert(sxs.id(), rec.clone())?;
    rec.lsn = lsn;
    apply::apply_to_page(&rec, leaf.page_mut(), PageRole::Primary)?;
    leaf.update_lsn_and_dirty(lsn);
    sxs.commit()?;
    Ok(())
}
