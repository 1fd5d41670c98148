//! Remove: delete marks the record a ghost; the space comes back later
//! through a defrag pass or a merge.

use log::debug;

use crate::{
    db_error,
    error::ErrorCode,
    lock::{IntentMode, OkvlMode, WaitPolicy},
    log::record::{KeyValuePayload, LogRecord, LogRecordKind, FLAG_UNDOABLE},
    sync::qsx::LatchMode,
    transaction::Transaction,
    types::{DbResult, StoreId},
    Database,
};

use super::{
    apply::{self, PageRole},
    key::BTreeKey,
    keylock::{self, KeyLockOutcome},
    traverse::{self, TraverseMode, MAX_TRAVERSE_RETRIES},
};

pub(crate) fn remove_impl(store: StoreId, tx: &Transaction, key_bytes: &[u8]) -> DbResult {
    let key = BTreeKey::regular(key_bytes);
    let locks = Database::lock_manager();
    let vid = Database::volume().vid();
    locks.intent_store_lock(tx.id(), vid, store, IntentMode::IX, WaitPolicy::Forever)?;

    for _ in 0..MAX_TRAVERSE_RETRIES {
        let leaf = traverse::traverse(
            store,
            &key,
            TraverseMode::FenceContain,
            LatchMode::X,
            None,
        )?;

        let leaf = match keylock::lock_key(
            tx.id(),
            store,
            key.serialized(),
            OkvlMode::key_x(),
            leaf,
        )? {
            KeyLockOutcome::Granted(leaf) => leaf,
            KeyLockOutcome::Restart => continue,
        };

        return match leaf.page().search(&key) {
            Ok(slot) if !leaf.page().is_ghost(slot) => {
                let mut rec = LogRecord::new(LogRecordKind::GhostMark, tx.id(), leaf.pid())
                    .with_flags(FLAG_UNDOABLE)
                    .with_payload(KeyValuePayload::encode(store, &key, b""));
                rec.page_prev_lsn = leaf.page().page_lsn();
                let lsn = Database::xct_manager().log_insert(tx.id(), rec.clone())?;
                rec.lsn = lsn;
                apply::apply_to_page(&rec, leaf.page_mut(), PageRole::Primary)?;
                leaf.update_lsn_and_dirty(lsn);
                debug!("removed {:?} from page {}", key, leaf.pid());
                Ok(())
            }
            _ => Err(db_error!(ErrorCode::NotFound, "key {:?} not found", key)),
        };
    }
    Err(db_error!(
        ErrorCode::TooManyRetry,
        "remove of {:?} kept retrying",
        key
    ))
}
