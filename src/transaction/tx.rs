//! Transaction objects.
//!
//! `Transaction` is the thin per-thread handle user code holds; the real
//! state lives in the transaction table. System transactions (SSX) nest
//! inside a user transaction or another SSX and are tracked on the same
//! thread-local stack; a single-log SSX writes exactly one self-contained
//! redo-only record and therefore keeps no undo chain.

use core::fmt;

use crate::{
    config::ElrMode,
    log::Lsn,
    types::{DbResult, StoreId, TransactionId},
    Database,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XctState {
    Active,
    Aborting,
    Committing,
    /// Commit has been logged; marked stores and extents are being freed.
    /// A crash in this window re-runs the release on restart.
    FreeingSpace,
    Ended,
    Prepared,
}

pub struct Xct {
    pub id: TransactionId,
    pub state: XctState,

    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub undo_next_lsn: Lsn,

    /// Max commit LSN of transactions whose early-released X locks this
    /// one observed; commit waits for the log to reach it.
    pub read_watermark: Lsn,

    pub elr_mode: ElrMode,

    pub is_sys: bool,
    pub single_log: bool,
    /// Consecutive SSXs begun directly under this transaction.
    pub ssx_chain_len: u32,

    pub reserved_log_space: u64,

    pub stores_to_delete: Vec<StoreId>,
    pub read_only: bool,
    pub is_loser: bool,
}

impl Xct {
    pub fn new(id: TransactionId, is_sys: bool, single_log: bool, elr_mode: ElrMode) -> Xct {
        Xct {
            id,
            state: XctState::Active,
            first_lsn: Lsn::NULL,
            last_lsn: Lsn::NULL,
            undo_next_lsn: Lsn::NULL,
            read_watermark: Lsn::NULL,
            elr_mode,
            is_sys,
            single_log,
            ssx_chain_len: 0,
            reserved_log_space: 0,
            stores_to_delete: Vec::new(),
            read_only: true,
            is_loser: false,
        }
    }
}

/// User-transaction handle. Cheap to copy; state lives in the table.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Transaction {
    id: TransactionId,
}

impl Transaction {
    /// Begin a user transaction on this thread.
    pub fn begin() -> DbResult<Transaction> {
        let id = Database::xct_manager().begin(false, false)?;
        Ok(Transaction { id })
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn from_id(id: TransactionId) -> Transaction {
        Transaction { id }
    }

    pub fn commit(&self) -> DbResult {
        Database::xct_manager().commit(self.id, false)
    }

    /// Commit without waiting for the log flush.
    pub fn commit_lazy(&self) -> DbResult {
        Database::xct_manager().commit(self.id, true)
    }

    pub fn abort(&self) -> DbResult {
        Database::xct_manager().abort(self.id)
    }

    /// Commit and immediately begin a successor on this thread.
    pub fn chain(&self, lazy: bool) -> DbResult<Transaction> {
        Database::xct_manager().commit(self.id, lazy)?;
        let id = Database::xct_manager().begin(false, false)?;
        Ok(Transaction { id })
    }

    /// A rollback target for `rollback`.
    pub fn save_point(&self) -> Lsn {
        Database::xct_manager().last_lsn(self.id)
    }

    /// Undo everything logged after the savepoint.
    pub fn rollback(&self, save_point: Lsn) -> DbResult {
        Database::xct_manager().rollback(self.id, save_point)
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}
