//! Tree height changes. The root page id is the store's stable identifier
//! and never changes; growth copies the root's content into a fresh child,
//! shrink copies the only child back over the root.

use log::info;

use crate::{
    log::{
        record::{LogRecord, LogRecordKind, TreeImgPayload},
        Lsn,
    },
    sync::qsx::LatchMode,
    transaction::SysXct,
    types::{DbResult, StoreId},
    Database,
};

use super::{
    adopt,
    apply::{self, PageRole},
    key::BTreeKey,
};

/// When the root has a foster chain, add a level: a new left-most child
/// takes over the root's records and its foster pointer; the root becomes
/// an empty node one level up whose only child is the newcomer. One
/// self-contained log record covers both pages.
pub fn grow_tree(store: StoreId) -> DbResult {
    let pool = Database::buffer_pool();
    let root = pool.fix_root(store, LatchMode::X)?;
    if !root.page().has_foster() {
        // another thread already grew the tree
        return Ok(());
    }
    info!("tree grow: store {}", store);

    if root.page().is_node() {
        pool.unswizzle_children_of(&root);
    }
    let child_pid = Database::volume().allocate_page(store)?;

    let sxs = SysXct::begin(true)?;
    let mut child_img = root.page().clone();
    child_img.set_pid(child_pid);
    let mut rec = LogRecord::new(LogRecordKind::TreeGrow, 0, root.pid())
        .with_payload(TreeImgPayload::encode(child_pid, child_img.bytes()));
    rec.page_prev_lsn = root.page().page_lsn();
    let lsn = Database::xct_manager().log_insert(sxs.id(), rec.clone())?;
    rec.lsn = lsn;

    let child = pool.fix_direct(child_pid, LatchMode::X, true)?;
    apply::apply_to_page(&rec, root.page_mut(), PageRole::Primary)?;
    root.update_lsn_and_dirty(lsn);
    apply::apply_to_page(&rec, child.page_mut(), PageRole::Secondary)?;
    child.update_lsn_and_dirty(lsn);
    sxs.commit()?;
    Ok(())
}

/// When the root is a node with no separators left, pull its only child's
/// content up over the root and free the child. A root that still has
/// records or a foster is not ready; its children's fosters are adopted
/// instead.
pub fn shrink_tree(store: StoreId) -> DbResult {
    let pool = Database::buffer_pool();
    let root = pool.fix_root(store, LatchMode::X)?;
    if !root.page().is_node() {
        return Ok(());
    }
    if root.page().nrecs() > 0 || root.page().has_foster() {
        adopt::adopt_sweep(&pool, &root);
        return Ok(());
    }
    let pid0 = pool.normalize_pid(root.page().pid0());
    if pid0 == 0 {
        return Ok(());
    }
    info!("tree shrink: store {}", store);
    pool.unswizzle_children_of(&root);

    let child = pool.fix_nonroot(&root, root.page().pid0(), LatchMode::X, false, false)?;
    if child.page().is_node() {
        pool.unswizzle_children_of(&child);
    }

    let sxs = SysXct::begin(true)?;
    let mut new_root_img = child.page().clone();
    new_root_img.set_pid(root.pid());
    let mut rec = LogRecord::new(LogRecordKind::TreeShrink, 0, root.pid())
        .with_payload(TreeImgPayload::encode(child.pid(), new_root_img.bytes()));
    rec.page_prev_lsn = root.page().page_lsn();
    let lsn = Database::xct_manager().log_insert(sxs.id(), rec.clone())?;
    rec.lsn = lsn;

    apply::apply_to_page(&rec, root.page_mut(), PageRole::Primary)?;
    root.update_lsn_and_dirty(lsn);
    apply::apply_to_page(&rec, child.page_mut(), PageRole::Secondary)?;
    child.update_lsn_and_dirty(lsn);
    sxs.commit()?;
    Ok(())
}

/// Format a brand-new single-leaf tree and register its store.
pub fn create_tree() -> DbResult<StoreId> {
    let pool = Database::buffer_pool();
    let vol = Database::volume();
    let root_pid = vol.allocate_page(0)?;
    let store = vol.create_store(root_pid)?;

    let sxs = SysXct::begin(false)?;
    let guard = pool.fix_direct(root_pid, LatchMode::X, true)?;
    guard.page_mut().format(
        root_pid,
        store,
        root_pid,
        1,
        0,
        0,
        Lsn::NULL,
        &BTreeKey::neg_inf(),
        &BTreeKey::pos_inf(),
        None,
    );

    let mut img_rec = LogRecord::new(LogRecordKind::PageImgFormat, 0, root_pid)
        .with_payload(guard.page().bytes().to_vec());
    img_rec.page_prev_lsn = Lsn::NULL;
    let lsn = Database::xct_manager().log_insert(sxs.id(), img_rec)?;
    guard.update_lsn_and_dirty(lsn);

    let store_rec = LogRecord::new(LogRecordKind::StoreCreate, 0, 0).with_payload(
        crate::log::record::StoreCreatePayload::encode(store, root_pid),
    );
    Database::xct_manager().log_insert(sxs.id(), store_rec)?;
    sxs.commit()?;
    info!("created store {} rooted at page {}", store, root_pid);
    Ok(store)
}
