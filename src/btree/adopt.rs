//! Foster-child adoption and its reversal.
//!
//! Adoption moves a foster edge up into the real parent: the parent gains
//! a separator entry for the foster child and the chain owner sheds its
//! foster pointer. De-adoption reverses this to thin out a parent before a
//! shrink. Both are single-log system transactions on (parent, child).

use log::debug;

use crate::{
    buffer::{BufferPool, PageGuard},
    log::record::{AdoptPayload, LogRecord, LogRecordKind},
    sync::qsx::LatchMode,
    transaction::SysXct,
    types::DbResult,
    Database,
};

use super::apply::{self, PageRole};

/// Adopt `child`'s foster into `parent`. Both guards are EX. Returns false
/// without side effects when the parent lacks space or the foster is gone.
pub fn try_adopt(
    pool: &std::sync::Arc<BufferPool>,
    parent: &PageGuard,
    child: &PageGuard,
) -> DbResult<bool> {
    debug_assert_eq!(parent.mode(), LatchMode::X);
    debug_assert_eq!(child.mode(), LatchMode::X);
    if !child.page().has_foster() {
        return Ok(false);
    }
    let separator = child.page().fence_high();
    if !parent.page().fence_contains(&separator) {
        // the chain crosses the parent's bound; the foster belongs to the
        // parent's own foster subtree
        return Ok(false);
    }
    if !parent.page().check_space_for_node_insert(&separator) {
        // the parent splits on its own insert pressure eventually
        return Ok(false);
    }
    if parent.page().search(&separator).is_ok() {
        // already adopted by someone else
        return Ok(false);
    }
    let foster_pid = pool.normalize_pid(child.page().foster());
    let foster_emlsn = child.page().foster_emlsn();

    let sxs = SysXct::begin(true)?;
    let mut rec = LogRecord::new(LogRecordKind::FosterAdopt, 0, parent.pid()).with_payload(
        AdoptPayload::encode(
            child.pid(),
            foster_pid,
            &separator,
            &child.page().chain_fence_high(),
            foster_emlsn,
        ),
    );
    rec.page_prev_lsn = parent.page().page_lsn();
    let lsn = Database::xct_manager().log_insert(sxs.id(), rec.clone())?;
    rec.lsn = lsn;

    apply::apply_to_page(&rec, parent.page_mut(), PageRole::Primary)?;
    parent.update_lsn_and_dirty(lsn);
    apply::apply_to_page(&rec, child.page_mut(), PageRole::Secondary)?;
    child.update_lsn_and_dirty(lsn);
    sxs.commit()?;
    debug!(
        "adopted page {} into parent {} under {:?}",
        foster_pid,
        parent.pid(),
        separator
    );
    Ok(true)
}

/// Walk the EX-latched parent's children and adopt any fosters found,
/// skipping contended pages. Best effort by design.
pub fn adopt_sweep(pool: &std::sync::Arc<BufferPool>, parent: &PageGuard) {
    debug_assert_eq!(parent.mode(), LatchMode::X);
    if !parent.page().is_node() {
        return;
    }
    let mut values: Vec<crate::types::PageId> = vec![parent.page().pid0()];
    for slot in 1..=parent.page().nrecs() {
        values.push(parent.page().node_child(slot));
    }
    for v in values {
        if v == 0 {
            continue;
        }
        let child = match pool.fix_nonroot(parent, v, LatchMode::X, true, false) {
            Ok(c) => c,
            Err(_) => continue, // contended or gone; next round
        };
        while child.page().has_foster() {
            match try_adopt(pool, parent, &child) {
                Ok(true) => continue,
                _ => break,
            }
        }
    }
}

/// De-adopt: remove the parent entry at `slot` and hand that child back to
/// its left neighbor as a foster. Refuses when the neighbor already has a
/// foster.
pub fn deadopt_child(
    pool: &std::sync::Arc<BufferPool>,
    parent: &PageGuard,
    slot: usize,
) -> DbResult<bool> {
    debug_assert_eq!(parent.mode(), LatchMode::X);
    debug_assert!(slot >= 1 && slot <= parent.page().nrecs());
    let foster_pid = pool.normalize_pid(parent.page().node_child(slot));
    let foster_emlsn = parent.page().node_emlsn(slot);
    let separator = parent.page().key_at(slot);

    // the left neighbor that takes over the edge
    let left_value = if slot == 1 {
        parent.page().pid0()
    } else {
        parent.page().node_child(slot - 1)
    };
    let left = match pool.fix_nonroot(parent, left_value, LatchMode::X, true, false) {
        Ok(g) => g,
        Err(_) => return Ok(false),
    };
    if left.page().has_foster() {
        return Ok(false);
    }
    debug_assert_eq!(left.page().fence_high(), separator);

    // the chain now ends where the re-fostered child ends
    let chain_high = if slot < parent.page().nrecs() {
        parent.page().key_at(slot + 1)
    } else {
        parent.page().fence_high()
    };

    let sxs = SysXct::begin(true)?;
    let mut rec = LogRecord::new(LogRecordKind::FosterDeadopt, 0, parent.pid()).with_payload(
        AdoptPayload::encode(left.pid(), foster_pid, &separator, &chain_high, foster_emlsn),
    );
    rec.page_prev_lsn = parent.page().page_lsn();
    let lsn = Database::xct_manager().log_insert(sxs.id(), rec.clone())?;
    rec.lsn = lsn;

    apply::apply_to_page(&rec, parent.page_mut(), PageRole::Primary)?;
    parent.update_lsn_and_dirty(lsn);
    apply::apply_to_page(&rec, left.page_mut(), PageRole::Secondary)?;
    left.update_lsn_and_dirty(lsn);
    sxs.commit()?;
    debug!(
        "de-adopted page {} from parent {} back to {}",
        foster_pid,
        parent.pid(),
        left.pid()
    );
    Ok(true)
}
