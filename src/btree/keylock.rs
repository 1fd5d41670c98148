//! Key-lock acquisition under a held leaf latch.
//!
//! The B+Tree always tries the lock without waiting first. On conflict it
//! cannot block while holding the leaf latch (lock holders may need this
//! very page), so it pins the frame, releases the latch, waits for the
//! lock, re-latches by frame index and compares the page LSN: any change
//! means the leaf may no longer be the key's home and the operation
//! restarts from the root.

use log::debug;

use crate::{
    buffer::PageGuard,
    error::ErrorCode,
    lock::{OkvlMode, WaitPolicy},
    types::{DbResult, StoreId, TransactionId},
    Database,
};

pub enum KeyLockOutcome {
    /// Lock granted; the leaf guard is still (or again) valid.
    Granted(PageGuard),
    /// The leaf changed while waiting; retry from the root.
    Restart,
}

pub fn lock_key(
    xct: TransactionId,
    store: StoreId,
    lock_bytes: &[u8],
    mode: OkvlMode,
    leaf: PageGuard,
) -> DbResult<KeyLockOutcome> {
    let locks = Database::lock_manager();
    let vid = Database::volume().vid();
    match locks.key_lock(xct, vid, store, lock_bytes, mode, WaitPolicy::Immediate) {
        Ok(()) => Ok(KeyLockOutcome::Granted(leaf)),
        Err(e) if e.code() == ErrorCode::LockTimeout => {
            let pool = Database::buffer_pool();
            let lsn = leaf.page().page_lsn();
            let latch_mode = leaf.mode();
            let idx = pool.pin_for_refix(&leaf);
            drop(leaf);

            let lock_result = locks.key_lock(xct, vid, store, lock_bytes, mode, WaitPolicy::Forever);

            let relatch = pool.refix_direct(idx, latch_mode);
            pool.unpin_for_refix(idx);
            let leaf = relatch?;
            lock_result?;

            if leaf.page().page_lsn() != lsn {
                debug!("leaf {} moved under a lock wait; restart", leaf.pid());
                return Ok(KeyLockOutcome::Restart);
            }
            Ok(KeyLockOutcome::Granted(leaf))
        }
        Err(e) => Err(e),
    }
}
