//! Foster-chain shrinking: merge absorbs the foster child back into its
//! predecessor; rebalance shifts records between a foster pair without
//! dismantling the chain.

use log::debug;

use crate::{
    buffer::PageGuard,
    log::record::{FosterMergePayload, FosterRebalancePayload, LogRecord, LogRecordKind},
    log::Lsn,
    sync::qsx::LatchMode,
    transaction::SysXct,
    types::DbResult,
    Database,
};

use super::{
    apply::{self, PageRole},
    page::encode_records,
    split,
};

/// Absorb the page's foster child. Returns false (no change) when there is
/// no foster, the records do not fit, or the write ordering between the
/// two dirty pages would form a cycle; in the last case the child stays
/// alive and dirty until a cleaner pass breaks the cycle.
pub fn merge_foster(page: &PageGuard) -> DbResult<bool> {
    debug_assert_eq!(page.mode(), LatchMode::X);
    if !page.page().has_foster() {
        return Ok(false);
    }
    let pool = Database::buffer_pool();
    let log = Database::log_manager();
    let foster = pool.fix_nonroot(page, page.page().foster(), LatchMode::X, false, false)?;

    split::assure_fence_low_entry(&foster)?;

    // write-order cycle avoidance: absorbing a child whose latest update
    // is not yet durable while this page is itself dirty would force a
    // write order neither page can honor
    if page.cb().is_dirty()
        && foster.cb().is_dirty()
        && log.durable_lsn() < foster.page().page_lsn()
    {
        debug!(
            "merge of {} <- {} refused: write-order cycle",
            page.pid(),
            foster.pid()
        );
        return Ok(false);
    }

    if page.page().is_node() {
        // the log payload must carry real page ids
        pool.unswizzle_children_of(page);
        pool.unswizzle_children_of(&foster);
    }

    // every absorbed record is re-prefixed under the merged fences; the
    // collected encoding bounds the space it can take. A node child's pid0
    // subtree becomes an explicit entry keyed by the child's low fence.
    let mut absorbed = Vec::new();
    if foster.page().is_node() {
        absorbed.push(crate::btree::page::MovedRecord {
            key: foster.page().fence_low(),
            body: crate::btree::page::RecordBody::Node {
                child: foster.page().pid0(),
                emlsn: crate::log::Lsn::NULL,
            },
        });
    }
    absorbed.extend(
        foster
            .page()
            .collect_records(1, foster.page().nrecs() + 1),
    );
    let needed: usize = encode_records(&absorbed).len() + absorbed.len() * 8;
    if page.page().free_space() < needed {
        return Ok(false);
    }

    let new_foster = pool.normalize_pid(foster.page().foster());
    let new_foster_emlsn = foster.page().foster_emlsn();
    let (new_high, new_chain_high) = if new_foster != 0 {
        (foster.page().fence_high(), page.page().chain_fence_high())
    } else {
        // the chain disappears with its last member
        let h = page.page().chain_fence_high();
        (h.clone(), h)
    };

    let sxs = SysXct::begin(true)?;
    let mut rec = LogRecord::new(LogRecordKind::FosterMerge, 0, page.pid()).with_payload(
        FosterMergePayload::encode(
            foster.pid(),
            new_foster,
            new_foster_emlsn,
            &new_high,
            &new_chain_high,
            &encode_records(&absorbed),
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
    debug!("merged page {} into {}", foster.pid(), page.pid());
    Ok(true)
}

/// Shift the tail of an overfull page into its (existing) foster child to
/// even the pair out. Chooses the pivot that balances used bytes.
pub fn rebalance_foster(page: &PageGuard) -> DbResult<bool> {
    debug_assert_eq!(page.mode(), LatchMode::X);
    if !page.page().has_foster() {
        return Ok(false);
    }
    let n = page.page().nrecs();
    if n < 2 {
        return Ok(false);
    }
    let pool = Database::buffer_pool();
    let foster = pool.fix_nonroot(page, page.page().foster(), LatchMode::X, false, false)?;
    if foster.page().free_space() < page.page().free_space() {
        // the child is the fuller one; nothing to shift this way
        return Ok(false);
    }
    if page.page().is_node() {
        pool.unswizzle_children_of(page);
        pool.unswizzle_children_of(&foster);
    }
    split::assure_fence_low_entry(&foster)?;

    let first_moved = n / 2 + 1;
    let (move_count, moved, new_pid0, new_pid0_emlsn, separator) = if page.page().is_leaf() {
        let sep = super::key::BTreeKey::shortest_separator(
            &page.page().key_at(first_moved - 1),
            &page.page().key_at(first_moved),
        );
        (
            n + 1 - first_moved,
            page.page().collect_records(first_moved, n + 1),
            0,
            Lsn::NULL,
            sep,
        )
    } else {
        (
            n + 1 - first_moved,
            page.page().collect_records(first_moved + 1, n + 1),
            page.page().node_child(first_moved),
            page.page().node_emlsn(first_moved),
            page.page().key_at(first_moved),
        )
    };

    let sxs = SysXct::begin(true)?;
    let mut rec = LogRecord::new(LogRecordKind::FosterRebalance, 0, page.pid()).with_payload(
        FosterRebalancePayload::encode(
            foster.pid(),
            move_count as u16,
            &separator,
            &foster.page().fence_high(),
            &foster.page().chain_fence_high(),
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
        "rebalanced {} records from {} into foster {}",
        move_count,
        page.pid(),
        foster.pid()
    );
    Ok(true)
}
