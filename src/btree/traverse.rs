//! Root-to-leaf traversal with latch coupling.
//!
//! Descent latches strictly parent before child and drops the parent as
//! soon as the child is held; horizontal foster steps walk left to right.
//! A root carrying a foster pointer triggers a tree grow and a restart.
//! When the caller wants the leaf in EX, the leaf is taken in SH and
//! upgraded conditionally; on contention the traversal restarts from the
//! root with a hint naming the page to latch in EX directly next time.

use log::debug;

use crate::{
    buffer::{BufferPool, PageGuard},
    db_error,
    error::ErrorCode,
    sync::qsx::LatchMode,
    types::{DbResult, PageId, StoreId},
    Database,
};

use super::{adopt, grow, key::BTreeKey};

/// Retries before the traversal gives up.
pub const MAX_TRAVERSE_RETRIES: usize = 20;

/// EX-blocked readers on a page before descent eagerly EX-latches it and
/// sweeps its children's fosters.
const EX_RECOMMEND_THRESHOLD: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraverseMode {
    /// The leaf whose fence range contains the search key.
    FenceContain,
    /// Forward-cursor positioning: same leaf choice, low-fence matches
    /// count as containment.
    FenceLowMatch,
    /// Backward-cursor positioning: follow the child whose separator is at
    /// or above the key.
    FenceHighMatch,
}

pub fn traverse(
    store: StoreId,
    key: &BTreeKey,
    mode: TraverseMode,
    latch: LatchMode,
    hint: Option<PageId>,
) -> DbResult<PageGuard> {
    let pool = Database::buffer_pool();
    let mut ex_hint = hint;
    for _ in 0..MAX_TRAVERSE_RETRIES {
        match traverse_once(&pool, store, key, mode, latch, &mut ex_hint) {
            Ok(guard) => return Ok(guard),
            Err(e) if e.code().is_retryable() => continue,
            Err(e) => return Err(e),
        }
    }
    Err(db_error!(
        ErrorCode::TooManyRetry,
        "traversal for {:?} in store {} kept retrying",
        key,
        store
    ))
}

fn traverse_once(
    pool: &std::sync::Arc<BufferPool>,
    store: StoreId,
    key: &BTreeKey,
    mode: TraverseMode,
    latch: LatchMode,
    ex_hint: &mut Option<PageId>,
) -> DbResult<PageGuard> {
    // a contended root leaf cannot be EX-upgraded through the hint path
    // below; fix it in EX outright when the hint names it
    let root_pid = Database::volume().store_root(store)?;
    let root_mode = if latch == LatchMode::X && *ex_hint == Some(root_pid) {
        LatchMode::X
    } else {
        LatchMode::S
    };
    let root = pool.fix_root(store, root_mode)?;
    if root.page().has_foster() {
        // the root must stay the store's single entry point; absorb the
        // chain by growing one level, then start over
        drop(root);
        grow::grow_tree(store)?;
        return Err(db_error!(ErrorCode::GoodRetry, "tree grew"));
    }
    let mut cur = root;

    loop {
        // horizontal foster steps
        while cur.page().belongs_to_foster(key) {
            let foster = cur.page().foster();
            let next = pool.fix_nonroot(&cur, foster, cur.mode(), false, false)?;
            cur = next;
        }
        if cur.page().is_leaf() {
            break;
        }

        let (slot, child_value) = match mode {
            TraverseMode::FenceHighMatch => cur.page().node_child_for_high(key),
            _ => cur.page().node_child_for(key),
        };
        let child_is_leaf = cur.page().level() == 2;
        let child_pid = pool.normalize_pid(child_value);
        let leaf_wants_x =
            child_is_leaf && latch == LatchMode::X && *ex_hint == Some(child_pid);
        let child_mode = if leaf_wants_x {
            LatchMode::X
        } else {
            LatchMode::S
        };

        let mut child = pool.fix_nonroot(&cur, child_value, child_mode, false, false)?;

        // eager path: a node whose readers keep losing EX upgrades gets
        // EX-latched outright and its children's fosters adopted
        if !child_is_leaf
            && child.mode() == LatchMode::S
            && child.cb().ex_blocked() >= EX_RECOMMEND_THRESHOLD
            && child.try_upgrade()
        {
            child.cb().reset_ex_blocked();
            adopt::adopt_sweep(pool, &child);
            child.downgrade();
        }

        // opportunistic adoption: the child carries a foster and both
        // pages happen to be upgradable right now
        if child.page().has_foster() && cur.mode() == LatchMode::S && child.mode() == LatchMode::S
        {
            let mut parent = cur;
            if parent.try_upgrade() {
                if child.try_upgrade() {
                    if let Err(e) = adopt::try_adopt(pool, &parent, &child) {
                        debug!("opportunistic adopt skipped: {}", e);
                    }
                    child.downgrade();
                }
                parent.downgrade();
            }
            cur = parent;
        }

        // latch coupling: child held, parent released
        drop(cur);
        cur = child;
    }

    // leaf level: finish the foster walk, then honor the latch request
    while cur.page().belongs_to_foster(key) {
        let foster = cur.page().foster();
        let next = pool.fix_nonroot(&cur, foster, cur.mode(), false, false)?;
        cur = next;
    }
    if latch == LatchMode::X && cur.mode() == LatchMode::S {
        if !cur.try_upgrade() {
            let contended = cur.pid();
            *ex_hint = Some(contended);
            drop(cur);
            return Err(db_error!(
                ErrorCode::Retry,
                "leaf {} contended, retrying with EX hint",
                contended
            ));
        }
    }
    Ok(cur)
}
