//! Restart recovery: analysis, redo, undo.
//!
//! Analysis scans forward from the master checkpoint (or the log start)
//! and rebuilds the transaction table and an approximate dirty-page table.
//! Redo repeats history from the lowest dirty LSN, guarded by each page's
//! stamped LSN so re-running it is idempotent. Undo rolls the losers back
//! through the normal rollback path, which writes compensation records;
//! system-transaction records are redo-only and are never undone.

use std::collections::HashMap;

use log::{debug, info};

use crate::{
    log::{record::LogRecordKind, Lsn},
    sync::qsx::LatchMode,
    types::{DbResult, PageId, TransactionId},
    Database,
};

struct XctInfo {
    first_lsn: Lsn,
    last_lsn: Lsn,
    ended: bool,
}

/// Run full restart recovery. Returns the number of loser transactions
/// rolled back.
pub fn restart() -> DbResult<usize> {
    let log = Database::log_manager();

    // ---- analysis ----
    let mut xcts: HashMap<TransactionId, XctInfo> = HashMap::new();
    let mut dirty: HashMap<PageId, Lsn> = HashMap::new();
    let master = log.master_lsn();
    {
        let mut scan = log.scan_from(master);
        while let Some(rec) = scan.next_record() {
            if rec.xct_id != 0 && !rec.is_ssx() {
                let info = xcts.entry(rec.xct_id).or_insert(XctInfo {
                    first_lsn: rec.lsn,
                    last_lsn: rec.lsn,
                    ended: false,
                });
                info.last_lsn = rec.lsn;
                match rec.kind {
                    LogRecordKind::XctEnd | LogRecordKind::XctAbort => info.ended = true,
                    // commit without end still releases no undo work
                    LogRecordKind::XctCommit => info.ended = true,
                    _ => {}
                }
            }
            if rec.kind.is_page_record() {
                dirty.entry(rec.page_id).or_insert(rec.lsn);
            }
        }
    }
    let losers: Vec<(TransactionId, XctInfo)> = xcts
        .into_iter()
        .filter(|(_, info)| !info.ended)
        .collect();
    info!(
        "analysis: {} dirty pages, {} losers",
        dirty.len(),
        losers.len()
    );

    // ---- redo ----
    let redo_start = dirty.values().copied().min().unwrap_or(Lsn::NULL);
    if !redo_start.is_null() {
        let pool = Database::buffer_pool();
        let vol = Database::volume();
        let mut scan = log.scan_from(redo_start);
        while let Some(rec) = scan.next_record() {
            match rec.kind {
                LogRecordKind::StoreCreate => {
                    let p = crate::log::record::StoreCreatePayload::decode(rec.body());
                    vol.restore_store(p.store_id, p.root_pid)?;
                    continue;
                }
                k if k.is_page_record() => {}
                _ => continue,
            }
            // replay onto the main page; two-page records replay their
            // second page inside the apply dispatch
            let guard = pool.fix_direct(rec.page_id, LatchMode::X, false)?;
            if guard.page().page_lsn() < rec.lsn {
                crate::btree::apply::redo_record(&rec, &guard)?;
                guard.update_lsn_and_dirty(rec.lsn);
                debug!("redo {:?} at {} on page {}", rec.kind, rec.lsn, rec.page_id);
            }
        }
    }

    // ---- undo ----
    let xct_mgr = Database::xct_manager();
    let loser_count = losers.len();
    for (id, info) in losers {
        xct_mgr.adopt_loser(id, info.last_lsn, info.first_lsn);
        xct_mgr.rollback(id, Lsn::NULL)?;
        xct_mgr.abort_loser_finish(id)?;
        info!("undo: rolled back loser {}", id);
    }

    log.flush_all()?;
    Ok(loser_count)
}

/// Write a fuzzy checkpoint: the transaction table replay points and the
/// dirty-page lower bounds, bracketed by begin/end records, then advance
/// the master record.
pub fn take_checkpoint() -> DbResult<Lsn> {
    let log = Database::log_manager();
    let pool = Database::buffer_pool();
    let xct_mgr = Database::xct_manager();

    let min_rec = pool.min_rec_lsn();
    let min_xct = xct_mgr.min_first_lsn();

    let mut begin = crate::log::record::LogRecord::new(LogRecordKind::CheckpointBegin, 0, 0);
    log.reservations()
        .consume_checkpoint(begin.total_len() as u64)?;
    let begin_lsn = log.insert(&mut begin)?;

    let mut payload = Vec::new();
    payload.extend_from_slice(&min_rec.to_u64().to_le_bytes());
    payload.extend_from_slice(&min_xct.to_u64().to_le_bytes());
    let mut end = crate::log::record::LogRecord::new(LogRecordKind::CheckpointEnd, 0, 0)
        .with_payload(payload);
    log.reservations().consume_checkpoint(end.total_len() as u64)?;
    log.insert(&mut end)?;
    log.flush_all()?;

    // the master points at the lowest LSN recovery must still read
    let mut master = begin_lsn;
    for lsn in [min_rec, min_xct].iter() {
        if !lsn.is_null() && *lsn < master {
            master = *lsn;
        }
    }
    log.set_master_lsn(master)?;
    info!("checkpoint at {}, master {}", begin_lsn, master);
    Ok(begin_lsn)
}
