//! Log-record application.
//!
//! Every record kind dispatches here for redo; the runtime paths apply
//! their own updates through the same functions right after logging, so a
//! page rebuilt from the log is byte-for-byte what the original mutation
//! produced. Undo is logical: the record carries the store id and key, the
//! current home of the key is found by a fresh traversal, and a
//! compensation record is written for the inverse action.

use log::debug;

use crate::{
    buffer::PageGuard,
    db_error,
    error::ErrorCode,
    log::{
        record::{
            AdoptPayload, FosterMergePayload, FosterRebalancePayload, GhostReservePayload,
            KeyValuePayload, LogRecord, LogRecordKind, NorecAllocPayload, OverwritePayload,
            TreeImgPayload, UpdatePayload, FLAG_CLR,
        },
        Lsn,
    },
    sync::qsx::LatchMode,
    transaction::manager::TransactionManager,
    types::DbResult,
    Database,
};

use super::{
    key::BTreeKey,
    page::{decode_records, PageData},
    traverse::{self, TraverseMode},
};

/// Which side of a (possibly two-page) record a page plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRole {
    Primary,
    Secondary,
}

/// Recovery entry point: replay `rec` onto its primary page (already fixed
/// and LSN-guarded by the caller) and, for two-page records, onto the
/// secondary page with its own guard.
pub fn redo_record(rec: &LogRecord, primary: &PageGuard) -> DbResult {
    apply_to_page(rec, primary.page_mut(), PageRole::Primary)?;

    if let Some(second_pid) = secondary_pid(rec) {
        let pool = Database::buffer_pool();
        // a never-written page reads back zeroed; the record formats it
        let second = pool.fix_direct(second_pid, LatchMode::X, false)?;
        if second.page().page_lsn() < rec.lsn {
            apply_to_page(rec, second.page_mut(), PageRole::Secondary)?;
            second.update_lsn_and_dirty(rec.lsn);
        }
    }
    Ok(())
}

/// Record kinds that build a page image from nothing; every other kind
/// presupposes a formatted page.
fn formats_page(kind: LogRecordKind, role: PageRole) -> bool {
    match role {
        PageRole::Primary => matches!(
            kind,
            LogRecordKind::PageImgFormat | LogRecordKind::TreeGrow | LogRecordKind::TreeShrink
        ),
        PageRole::Secondary => {
            matches!(kind, LogRecordKind::NorecAlloc | LogRecordKind::TreeGrow)
        }
    }
}

/// Single-page recovery: rebuild one page from a clean image by replaying
/// its log records in order, self-contained structure-modification records
/// included. `emlsn` is the expected-minimum LSN the parent recorded for
/// this page; a replay that cannot reach it means the log no longer covers
/// the page's history.
pub fn recover_single_page(
    log: &crate::log::LogManager,
    pid: crate::types::PageId,
    emlsn: Lsn,
) -> DbResult<PageData> {
    let mut page = PageData::new();
    let mut scan = log.scan_from(Lsn::NULL);
    while let Some(rec) = scan.next_record() {
        if !rec.kind.is_page_record() {
            continue;
        }
        let role = if rec.page_id == pid {
            PageRole::Primary
        } else if secondary_pid(&rec) == Some(pid) {
            PageRole::Secondary
        } else {
            continue;
        };
        if page.page_lsn().is_null() && !formats_page(rec.kind, role) {
            // the genesis record was recycled away; nothing to build on
            continue;
        }
        if page.page_lsn() < rec.lsn {
            apply_to_page(&rec, &mut page, role)?;
            page.set_page_lsn(rec.lsn);
        }
    }
    if page.page_lsn().is_null() {
        return Err(db_error!(
            ErrorCode::WrongPageLsnChain,
            "no log records left to rebuild page {}",
            pid
        ));
    }
    if !emlsn.is_null() && page.page_lsn() < emlsn {
        return Err(db_error!(
            ErrorCode::WrongPageLsnChain,
            "single-page recovery of page {} ends at {} short of the expected {}",
            pid,
            page.page_lsn(),
            emlsn
        ));
    }
    debug!("page {} rebuilt by single-page recovery at {}", pid, page.page_lsn());
    Ok(page)
}

/// The other page a two-page structure modification touches.
pub fn secondary_pid(rec: &LogRecord) -> Option<crate::types::PageId> {
    let body = rec.body();
    match rec.kind {
        LogRecordKind::NorecAlloc => Some(NorecAllocPayload::decode(body).new_page_id),
        LogRecordKind::FosterRebalance => Some(FosterRebalancePayload::decode(body).foster_pid),
        LogRecordKind::FosterMerge => Some(FosterMergePayload::decode(body).foster_pid),
        LogRecordKind::FosterAdopt | LogRecordKind::FosterDeadopt => {
            Some(AdoptPayload::decode(body).child_pid)
        }
        LogRecordKind::TreeGrow | LogRecordKind::TreeShrink => {
            Some(TreeImgPayload::decode(body).other_pid)
        }
        _ => None,
    }
}

/// Pure page mutation for one side of the record. The caller stamps the
/// page LSN afterwards.
pub fn apply_to_page(rec: &LogRecord, page: &mut PageData, role: PageRole) -> DbResult {
    let body = rec.body();
    match rec.kind {
        LogRecordKind::Insert => {
            let p = KeyValuePayload::decode(body);
            match page.search(&p.key) {
                Ok(slot) => {
                    // filling a reserved ghost
                    if page.is_ghost(slot) {
                        page.clear_ghost(slot);
                    }
                    page.leaf_replace_value(slot, &p.value)?;
                }
                Err(pos) => {
                    page.leaf_insert(pos, &p.key, &p.value, false)?;
                    page.track_insertion_skew(pos);
                }
            }
        }
        LogRecordKind::GhostReserve => {
            let p = GhostReservePayload::decode(body);
            if let Err(pos) = page.search(&p.key) {
                let placeholder = vec![0u8; p.value_len as usize];
                page.leaf_insert(pos, &p.key, &placeholder, true)?;
                page.track_insertion_skew(pos);
            }
        }
        LogRecordKind::GhostMark => {
            let p = KeyValuePayload::decode(body);
            let slot = expect_slot(page, &p.key)?;
            if !page.is_ghost(slot) {
                page.set_ghost(slot);
            }
        }
        LogRecordKind::GhostUnmark => {
            let p = KeyValuePayload::decode(body);
            let slot = expect_slot(page, &p.key)?;
            if page.is_ghost(slot) {
                page.clear_ghost(slot);
            }
        }
        LogRecordKind::Update => {
            let p = UpdatePayload::decode(body);
            let slot = expect_slot(page, &p.key)?;
            page.leaf_replace_value(slot, &p.new_value)?;
        }
        LogRecordKind::Overwrite => {
            let p = OverwritePayload::decode(body);
            let slot = expect_slot(page, &p.key)?;
            page.leaf_overwrite_value(slot, p.offset as usize, &p.new_bytes)?;
        }
        LogRecordKind::PageImgFormat => {
            page.bytes_mut().copy_from_slice(body);
        }
        LogRecordKind::DefragPage => {
            page.defrag()?;
        }
        LogRecordKind::NorecAlloc => {
            let p = NorecAllocPayload::decode(body);
            match role {
                PageRole::Primary => {
                    // the parent accepts the empty child: foster pointer and
                    // chain fence change, records stay
                    let low = page.fence_low();
                    let high = page.fence_high();
                    let records = page.collect_records(1, page.nrecs() + 1);
                    let pid0 = page.pid0();
                    page.rebuild(
                        &low,
                        &high,
                        Some(&p.chain_high),
                        pid0,
                        p.new_page_id,
                        rec.lsn,
                        &records,
                    )?;
                }
                PageRole::Secondary => {
                    // fresh empty child with an empty key range [fence, fence)
                    page.format(
                        p.new_page_id,
                        p.store_id,
                        p.root_id,
                        p.level,
                        0,
                        p.inherited_foster,
                        rec.page_prev_lsn,
                        &p.fence,
                        &p.fence,
                        Some(&p.chain_high),
                    );
                }
            }
        }
        LogRecordKind::FosterRebalance => {
            let p = FosterRebalancePayload::decode(body);
            match role {
                PageRole::Primary => {
                    // source keeps the head, its high fence drops to the
                    // separator
                    let keep = page.nrecs() - p.move_count as usize;
                    let records = page.collect_records(1, keep + 1);
                    let low = page.fence_low();
                    let (pid0, foster, femlsn) =
                        (page.pid0(), page.foster(), page.foster_emlsn());
                    page.rebuild(
                        &low,
                        &p.separator,
                        Some(&p.chain_high),
                        pid0,
                        foster,
                        femlsn,
                        &records,
                    )?;
                }
                PageRole::Secondary => {
                    // foster child gains the moved tail below its existing
                    // records (empty right after the no-record alloc)
                    let mut records = decode_records(&p.moved);
                    records.extend(page.collect_records(1, page.nrecs() + 1));
                    let (foster, femlsn) = (page.foster(), page.foster_emlsn());
                    page.rebuild(
                        &p.separator,
                        &p.foster_high,
                        Some(&p.chain_high),
                        p.new_pid0,
                        foster,
                        femlsn,
                        &records,
                    )?;
                }
            }
        }
        LogRecordKind::FosterMerge => {
            let p = FosterMergePayload::decode(body);
            match role {
                PageRole::Primary => {
                    let mut records = page.collect_records(1, page.nrecs() + 1);
                    records.extend(decode_records(&p.absorbed));
                    let low = page.fence_low();
                    let pid0 = page.pid0();
                    let chain = if p.new_foster != 0 {
                        Some(p.new_chain_high.clone())
                    } else {
                        None
                    };
                    page.rebuild(
                        &low,
                        &p.new_high,
                        chain.as_ref(),
                        pid0,
                        p.new_foster,
                        p.new_foster_emlsn,
                        &records,
                    )?;
                }
                PageRole::Secondary => {
                    page.set_to_be_deleted();
                }
            }
        }
        LogRecordKind::FosterAdopt => {
            let p = AdoptPayload::decode(body);
            match role {
                PageRole::Primary => {
                    // real parent gains the separator entry for the foster
                    if let Err(pos) = page.search(&p.separator) {
                        page.node_insert(pos, &p.separator, p.foster_pid, p.foster_emlsn)?;
                    }
                }
                PageRole::Secondary => {
                    // child sheds its foster pointer and chain fence
                    let low = page.fence_low();
                    let high = page.fence_high();
                    let records = page.collect_records(1, page.nrecs() + 1);
                    let pid0 = page.pid0();
                    page.rebuild(&low, &high, None, pid0, 0, Lsn::NULL, &records)?;
                }
            }
        }
        LogRecordKind::FosterDeadopt => {
            let p = AdoptPayload::decode(body);
            match role {
                PageRole::Primary => {
                    if let Ok(slot) = page.search(&p.separator) {
                        page.remove_slot(slot);
                    }
                }
                PageRole::Secondary => {
                    // child re-fosters its former right sibling
                    let low = page.fence_low();
                    let high = page.fence_high();
                    let records = page.collect_records(1, page.nrecs() + 1);
                    let pid0 = page.pid0();
                    page.rebuild(
                        &low,
                        &high,
                        Some(&p.chain_high),
                        pid0,
                        p.foster_pid,
                        p.foster_emlsn,
                        &records,
                    )?;
                }
            }
        }
        LogRecordKind::TreeGrow => {
            let p = TreeImgPayload::decode(body);
            match role {
                PageRole::Primary => {
                    // the root empties out one level up; its page id is the
                    // store's stable identifier and never changes
                    let (pid, store, root) = (page.pid(), page.store_id(), page.root_pid());
                    let child = PageData::from_bytes(&p.image);
                    page.format(
                        pid,
                        store,
                        root,
                        child.level() + 1,
                        p.other_pid,
                        0,
                        Lsn::NULL,
                        &BTreeKey::neg_inf(),
                        &BTreeKey::pos_inf(),
                        None,
                    );
                }
                PageRole::Secondary => {
                    page.bytes_mut().copy_from_slice(&p.image);
                }
            }
        }
        LogRecordKind::TreeShrink => {
            let p = TreeImgPayload::decode(body);
            match role {
                PageRole::Primary => {
                    page.bytes_mut().copy_from_slice(&p.image);
                }
                PageRole::Secondary => {
                    page.set_to_be_deleted();
                }
            }
        }
        LogRecordKind::Skip
        | LogRecordKind::XctBegin
        | LogRecordKind::XctCommit
        | LogRecordKind::XctAbort
        | LogRecordKind::XctEnd
        | LogRecordKind::StoreCreate
        | LogRecordKind::CheckpointBegin
        | LogRecordKind::CheckpointEnd
        | LogRecordKind::Compensate => {}
    }
    Ok(())
}

fn expect_slot(page: &PageData, key: &BTreeKey) -> DbResult<usize> {
    page.search(key).map_err(|_| {
        db_error!(
            ErrorCode::WrongPageLsnChain,
            "log record key {:?} not found on page {}",
            key,
            page.pid()
        )
    })
}

/// Undo one undoable record during rollback: apply the inverse through a
/// fresh traversal and write the matching compensation record.
pub fn undo_record(mgr: &TransactionManager, rec: &LogRecord) -> DbResult {
    debug_assert!(rec.is_undoable() && !rec.is_clr());
    match rec.kind {
        LogRecordKind::Insert => {
            let p = KeyValuePayload::decode(rec.body());
            undo_with_clr(
                mgr,
                rec,
                p.store,
                &p.key,
                LogRecordKind::GhostMark,
                KeyValuePayload::encode(p.store, &p.key, b""),
                |page, slot| {
                    page.set_ghost(slot);
                    Ok(())
                },
            )
        }
        LogRecordKind::GhostMark => {
            let p = KeyValuePayload::decode(rec.body());
            undo_with_clr(
                mgr,
                rec,
                p.store,
                &p.key,
                LogRecordKind::GhostUnmark,
                KeyValuePayload::encode(p.store, &p.key, b""),
                |page, slot| {
                    page.clear_ghost(slot);
                    Ok(())
                },
            )
        }
        LogRecordKind::Update => {
            let p = UpdatePayload::decode(rec.body());
            let old = p.old_value.clone();
            undo_with_clr(
                mgr,
                rec,
                p.store,
                &p.key,
                LogRecordKind::Update,
                UpdatePayload::encode(p.store, &p.key, &p.new_value, &p.old_value),
                move |page, slot| page.leaf_replace_value(slot, &old),
            )
        }
        LogRecordKind::Overwrite => {
            let p = OverwritePayload::decode(rec.body());
            let (at, old) = (p.offset as usize, p.old_bytes.clone());
            undo_with_clr(
                mgr,
                rec,
                p.store,
                &p.key,
                LogRecordKind::Overwrite,
                OverwritePayload::encode(p.store, &p.key, p.offset, &p.new_bytes, &p.old_bytes),
                move |page, slot| page.leaf_overwrite_value(slot, at, &old),
            )
        }
        _ => Ok(()),
    }
}

fn undo_with_clr(
    mgr: &TransactionManager,
    rec: &LogRecord,
    store: u32,
    key: &BTreeKey,
    clr_kind: LogRecordKind,
    clr_body: Vec<u8>,
    mutate: impl FnOnce(&mut PageData, usize) -> DbResult,
) -> DbResult {
    let leaf = traverse::traverse(store, key, TraverseMode::FenceContain, LatchMode::X, None)?;
    let slot = expect_slot(leaf.page(), key)?;

    let mut payload = rec.prev_lsn.to_u64().to_le_bytes().to_vec();
    payload.extend_from_slice(&clr_body);
    let mut clr = LogRecord::new(clr_kind, rec.xct_id, leaf.pid())
        .with_flags(FLAG_CLR)
        .with_payload(payload);
    clr.page_prev_lsn = leaf.page().page_lsn();
    let lsn = mgr.log_insert(rec.xct_id, clr)?;

    mutate(leaf.page_mut(), slot)?;
    leaf.update_lsn_and_dirty(lsn);
    debug!(
        "undo {:?} of xct {} on page {} (clr at {})",
        rec.kind,
        rec.xct_id,
        leaf.pid(),
        lsn
    );
    Ok(())
}
