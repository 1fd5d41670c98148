//! Transaction table and lifecycle.
//!
//! One mutex-protected table holds every live transaction; a thread-local
//! stack tracks the transaction (and nested system transactions) bound to
//! the current thread. Commit walks active -> committing -> freeing-space
//! -> ended so that a crash between the commit record and the store
//! releases re-runs the release on restart; abort walks the undo chain
//! backward writing compensation records.

use std::{
    cell::RefCell,
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
};

use log::{debug, info};

use crate::{
    config::ElrMode,
    db_error,
    error::ErrorCode,
    lock::LockManager,
    log::{
        record::{LogRecord, LogRecordKind, FLAG_CLR, FLAG_SSX},
        reservation::UNDO_FUDGE_FACTOR,
        LogManager, Lsn,
    },
    types::{DbResult, StoreId, TransactionId},
    Database,
};

use super::tx::{Xct, XctState};

thread_local! {
    static XCT_STACK: RefCell<Vec<TransactionId>> = RefCell::new(Vec::new());
}

/// The innermost transaction bound to this thread (an SSX when one is
/// open, else the user transaction).
pub fn current_xct() -> Option<TransactionId> {
    XCT_STACK.with(|s| s.borrow().last().copied())
}

/// The outermost (user) transaction bound to this thread.
pub fn current_user_xct() -> Option<TransactionId> {
    XCT_STACK.with(|s| s.borrow().first().copied())
}

pub struct TransactionManager {
    table: Mutex<HashMap<TransactionId, Xct>>,
    next_id: AtomicU32,
    log: Arc<LogManager>,
    locks: Arc<LockManager>,
    elr_mode: ElrMode,
}

impl TransactionManager {
    pub fn new(log: Arc<LogManager>, locks: Arc<LockManager>, elr_mode: ElrMode) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            log,
            locks,
            elr_mode,
        }
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Begin a transaction on this thread. User transactions may not nest;
    /// system transactions nest inside anything.
    pub fn begin(&self, sys: bool, single_log: bool) -> DbResult<TransactionId> {
        let parent = XCT_STACK.with(|s| {
            let stack = s.borrow();
            if !sys && !stack.is_empty() {
                return Err(db_error!(
                    ErrorCode::InTrans,
                    "a user transaction is already active on this thread"
                ));
            }
            Ok(stack.last().copied())
        })?;

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let xct = Xct::new(id, sys, single_log, self.elr_mode);
        {
            let mut table = self.table.lock().unwrap();
            if let Some(p) = parent {
                if let Some(px) = table.get_mut(&p) {
                    px.ssx_chain_len += 1;
                }
            }
            table.insert(id, xct);
        }
        self.locks.register_xct(id);
        if !sys {
            self.log_insert(id, LogRecord::new(LogRecordKind::XctBegin, id, 0))?;
        }
        XCT_STACK.with(|s| s.borrow_mut().push(id));
        debug!("begin {} (sys={}, single_log={})", id, sys, single_log);
        Ok(id)
    }

    /// Append a log record on behalf of `xct_id`: reserves log space
    /// (with the undo fudge for undoable records), chains the record into
    /// the transaction's LSN chain and tracks the first LSN.
    pub fn log_insert(&self, xct_id: TransactionId, mut rec: LogRecord) -> DbResult<Lsn> {
        let need =
            rec.total_len() as u64 * if rec.is_undoable() { UNDO_FUDGE_FACTOR } else { 1 };
        self.log.reservations().reserve(need)?;

        let mut table = self.table.lock().unwrap();
        let xct = table
            .get_mut(&xct_id)
            .ok_or_else(|| db_error!(ErrorCode::NoTrans, "no transaction {}", xct_id))?;
        rec.xct_id = xct_id;
        if xct.is_sys {
            // system-transaction records are redo-only: restart analysis
            // never turns them into losers
            rec.flags |= FLAG_SSX;
        }
        if xct.is_sys && xct.single_log {
            debug_assert!(
                xct.last_lsn.is_null(),
                "single-log system transaction wrote a second record"
            );
            rec.prev_lsn = Lsn::NULL;
        } else {
            rec.prev_lsn = xct.last_lsn;
        }
        let lsn = self.log.insert(&mut rec)?;
        if xct.first_lsn.is_null() {
            xct.first_lsn = lsn;
            self.log.oldest_lsn_tracker().enter(xct_id, lsn);
        }
        xct.last_lsn = lsn;
        if rec.is_undoable() {
            xct.undo_next_lsn = lsn;
        }
        xct.reserved_log_space += need;
        xct.read_only = false;
        Ok(lsn)
    }

    pub fn last_lsn(&self, xct_id: TransactionId) -> Lsn {
        self.table
            .lock()
            .unwrap()
            .get(&xct_id)
            .map(|x| x.last_lsn)
            .unwrap_or(Lsn::NULL)
    }

    pub fn state(&self, xct_id: TransactionId) -> Option<XctState> {
        self.table.lock().unwrap().get(&xct_id).map(|x| x.state)
    }

    /// Mark a store for deletion at commit (freeing-space phase).
    pub fn defer_store_delete(&self, xct_id: TransactionId, store: StoreId) {
        if let Some(x) = self.table.lock().unwrap().get_mut(&xct_id) {
            x.stores_to_delete.push(store);
        }
    }

    // -- compensation anchors ----------------------------------------------

    /// The current rollback position; pair with `compensate`.
    pub fn anchor(&self, xct_id: TransactionId) -> Lsn {
        self.last_lsn(xct_id)
    }

    /// Make everything logged since `anchor` atomic for rollback: a later
    /// undo jumps straight past the range.
    pub fn compensate(&self, xct_id: TransactionId, anchor: Lsn) -> DbResult {
        let payload = anchor.to_u64().to_le_bytes().to_vec();
        let rec = LogRecord::new(LogRecordKind::Compensate, xct_id, 0)
            .with_flags(FLAG_CLR)
            .with_payload(payload);
        self.log_insert(xct_id, rec)?;
        let mut table = self.table.lock().unwrap();
        if let Some(x) = table.get_mut(&xct_id) {
            x.undo_next_lsn = anchor;
        }
        Ok(())
    }

    // -- commit -------------------------------------------------------------

    pub fn commit(&self, xct_id: TransactionId, lazy: bool) -> DbResult {
        let (is_sys, read_only, read_watermark, stores) = {
            let mut table = self.table.lock().unwrap();
            let xct = table
                .get_mut(&xct_id)
                .ok_or_else(|| db_error!(ErrorCode::NoTrans, "no transaction {}", xct_id))?;
            if xct.state != XctState::Active {
                return Err(db_error!(
                    ErrorCode::BadArgument,
                    "commit of transaction {} in state {:?}",
                    xct_id,
                    xct.state
                ));
            }
            xct.state = XctState::Committing;
            let wm = xct.read_watermark;
            (
                xct.is_sys,
                xct.read_only,
                wm,
                std::mem::take(&mut xct.stores_to_delete),
            )
        };

        if is_sys {
            // a committed SSX is durable by its own single record; nothing
            // more to write
            self.finish(xct_id, XctState::Ended);
            return Ok(());
        }

        if read_only && stores.is_empty() {
            self.locks.release_all(xct_id, ElrMode::None, Lsn::NULL);
            self.finish(xct_id, XctState::Ended);
            return Ok(());
        }

        // under ELR-SX this transaction may have read data of commits whose
        // log is not durable yet; it must not commit before them
        let watermark = {
            let observed = self.locks.read_watermark(xct_id);
            if observed > read_watermark {
                observed
            } else {
                read_watermark
            }
        };
        if !watermark.is_null() {
            self.log.wait_flushed(watermark);
        }

        // freeing-space: release marked stores before declaring the end
        {
            let mut table = self.table.lock().unwrap();
            if let Some(x) = table.get_mut(&xct_id) {
                x.state = XctState::FreeingSpace;
            }
        }
        for store in stores {
            Database::volume().delete_store(store)?;
            info!("transaction {} dropped store {}", xct_id, store);
        }

        let commit_lsn =
            self.log_insert(xct_id, LogRecord::new(LogRecordKind::XctCommit, xct_id, 0))?;

        match self.elr_mode {
            ElrMode::None => {
                if !lazy {
                    self.log.flush(commit_lsn)?;
                }
                self.locks.release_all(xct_id, ElrMode::None, Lsn::NULL);
            }
            ElrMode::S => {
                // read side first, write side after durability
                self.locks.release_read_locks(xct_id);
                if !lazy {
                    self.log.flush(commit_lsn)?;
                }
                self.locks.release_all(xct_id, ElrMode::S, Lsn::NULL);
            }
            ElrMode::Sx | ElrMode::Clv => {
                self.locks.release_all(xct_id, ElrMode::Sx, commit_lsn);
                if !lazy {
                    self.log.flush(commit_lsn)?;
                }
            }
        }

        self.log_insert(xct_id, LogRecord::new(LogRecordKind::XctEnd, xct_id, 0))?;
        self.finish(xct_id, XctState::Ended);
        debug!("commit {} at {}", xct_id, commit_lsn);
        Ok(())
    }

    // -- abort and rollback --------------------------------------------------

    pub fn abort(&self, xct_id: TransactionId) -> DbResult {
        {
            let mut table = self.table.lock().unwrap();
            let xct = table
                .get_mut(&xct_id)
                .ok_or_else(|| db_error!(ErrorCode::NoTrans, "no transaction {}", xct_id))?;
            xct.state = XctState::Aborting;
        }
        self.rollback(xct_id, Lsn::NULL)?;
        let read_only = self
            .table
            .lock()
            .unwrap()
            .get(&xct_id)
            .map(|x| x.read_only)
            .unwrap_or(true);
        if !read_only {
            self.log_insert(xct_id, LogRecord::new(LogRecordKind::XctAbort, xct_id, 0))?;
        }
        self.locks.release_all(xct_id, ElrMode::None, Lsn::NULL);
        self.finish(xct_id, XctState::Ended);
        debug!("abort {}", xct_id);
        Ok(())
    }

    /// Undo every undoable record with LSN above `until` (null = all),
    /// writing a compensation record per step. Already-compensated ranges
    /// are skipped via the CLR undo-next chain.
    pub fn rollback(&self, xct_id: TransactionId, until: Lsn) -> DbResult {
        loop {
            let cur = {
                let table = self.table.lock().unwrap();
                match table.get(&xct_id) {
                    Some(x) => x.undo_next_lsn,
                    None => return Err(db_error!(ErrorCode::NoTrans, "no transaction {}", xct_id)),
                }
            };
            if cur.is_null() || cur <= until {
                break;
            }
            let rec = self.log.fetch(cur)?;
            let next = if rec.is_clr() {
                rec.undo_next()
            } else {
                if rec.is_undoable() {
                    crate::btree::apply::undo_record(self, &rec)?;
                }
                rec.prev_lsn
            };
            let mut table = self.table.lock().unwrap();
            if let Some(x) = table.get_mut(&xct_id) {
                x.undo_next_lsn = next;
            }
        }
        Ok(())
    }

    /// Restart: undo uses records only, so the chain head starts at the
    /// last known record of the loser.
    pub fn adopt_loser(&self, xct_id: TransactionId, last_lsn: Lsn, first_lsn: Lsn) {
        let mut xct = Xct::new(xct_id, false, false, ElrMode::None);
        xct.state = XctState::Aborting;
        xct.is_loser = true;
        xct.first_lsn = first_lsn;
        xct.last_lsn = last_lsn;
        xct.undo_next_lsn = last_lsn;
        xct.read_only = false;
        self.locks.register_xct(xct_id);
        self.table.lock().unwrap().insert(xct_id, xct);
        let next = self.next_id.load(Ordering::Acquire).max(xct_id + 1);
        self.next_id.store(next, Ordering::Release);
        self.log.oldest_lsn_tracker().enter(xct_id, first_lsn);
    }

    /// Close out a loser after restart undo: log the abort and drop its
    /// table entry (losers have no thread stack to unwind).
    pub fn abort_loser_finish(&self, xct_id: TransactionId) -> DbResult {
        self.log_insert(xct_id, LogRecord::new(LogRecordKind::XctAbort, xct_id, 0))?;
        self.locks.release_all(xct_id, ElrMode::None, Lsn::NULL);
        self.finish(xct_id, XctState::Ended);
        Ok(())
    }

    /// Lowest first-LSN over live transactions (for log recycling).
    pub fn min_first_lsn(&self) -> Lsn {
        let table = self.table.lock().unwrap();
        let mut min = Lsn::NULL;
        for x in table.values() {
            if !x.first_lsn.is_null() && (min.is_null() || x.first_lsn < min) {
                min = x.first_lsn;
            }
        }
        min
    }

    pub fn active_count(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    fn finish(&self, xct_id: TransactionId, state: XctState) {
        let mut table = self.table.lock().unwrap();
        if let Some(mut xct) = table.remove(&xct_id) {
            xct.state = state;
            if !xct.first_lsn.is_null() {
                self.log.oldest_lsn_tracker().leave(xct_id);
            }
            if xct.reserved_log_space > 0 {
                self.log.reservations().release(xct.reserved_log_space);
            }
            // a system transaction that took locks (filling records on
            // behalf of its parent) sheds them here
            self.locks.release_all(xct_id, ElrMode::None, Lsn::NULL);
            self.locks.deregister_xct(xct_id);
        }
        drop(table);
        XCT_STACK.with(|s| {
            let mut stack = s.borrow_mut();
            if stack.last() == Some(&xct_id) {
                stack.pop();
            }
        });
    }
}

/// RAII wrapper for system transactions.
pub struct SysXct {
    id: TransactionId,
    done: bool,
}

impl SysXct {
    pub fn begin(single_log: bool) -> DbResult<SysXct> {
        let id = Database::xct_manager().begin(true, single_log)?;
        Ok(SysXct { id, done: false })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn commit(mut self) -> DbResult {
        self.done = true;
        Database::xct_manager().commit(self.id, true)
    }

    /// A transaction handle bound to this system transaction, for the rare
    /// caller that issues regular operations inside it.
    pub fn handle(&self) -> crate::transaction::Transaction {
        crate::transaction::Transaction::from_id(self.id)
    }
}

impl Drop for SysXct {
    fn drop(&mut self) {
        if !self.done {
            // a system transaction that logged nothing just ends; one that
            // logged its single record is already consistent
            Database::xct_manager().commit(self.id, true).ok();
        }
    }
}
