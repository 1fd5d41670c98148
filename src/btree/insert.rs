//! Insert.

use log::debug;

use crate::{
    config::MAX_KEY_LEN,
    db_error,
    error::ErrorCode,
    lock::{IntentMode, OkvlMode, WaitPolicy},
    log::record::{
        GhostReservePayload, KeyValuePayload, LogRecord, LogRecordKind, FLAG_UNDOABLE,
    },
    sync::qsx::LatchMode,
    transaction::{SysXct, Transaction},
    types::{DbResult, StoreId},
    Database,
};

use super::{
    apply::{self, PageRole},
    defrag,
    key::BTreeKey,
    keylock::{self, KeyLockOutcome},
    split,
    traverse::{self, TraverseMode, MAX_TRAVERSE_RETRIES},
};

pub(crate) fn insert_impl(
    store: StoreId,
    tx: &Transaction,
    key_bytes: &[u8],
    value: &[u8],
) -> DbResult {
    if key_bytes.is_empty() || key_bytes.len() + 1 > MAX_KEY_LEN {
        return Err(db_error!(
            ErrorCode::BadArgument,
            "key of {} bytes (limit {})",
            key_bytes.len(),
            MAX_KEY_LEN
        ));
    }
    if value.len() > MAX_KEY_LEN * 2 {
        return Err(db_error!(
            ErrorCode::RecWontFit,
            "value of {} bytes never fits a page",
            value.len()
        ));
    }
    let key = BTreeKey::regular(key_bytes);
    let locks = Database::lock_manager();
    let vid = Database::volume().vid();
    locks.intent_store_lock(tx.id(), vid, store, IntentMode::IX, WaitPolicy::Forever)?;

    for _ in 0..MAX_TRAVERSE_RETRIES {
        let leaf = traverse::traverse(store, &key, TraverseMode::FenceContain, LatchMode::X, None)?;

        let mut leaf = match keylock::lock_key(
            tx.id(),
            store,
            key.serialized(),
            OkvlMode::key_x(),
            leaf,
        )? {
            KeyLockOutcome::Granted(leaf) => leaf,
            KeyLockOutcome::Restart => continue,
        };

        loop {
            match leaf.page().search(&key) {
                Ok(slot) => {
                    if !leaf.page().is_ghost(slot) {
                        return Err(db_error!(
                            ErrorCode::Duplicate,
                            "key {:?} already present",
                            key
                        ));
                    }
                    // prefer converting the ghost when its space suffices
                    let reserved = leaf.page().record_reserved_len(slot);
                    let suffix_len = key.serialized_len() - leaf.page().prefix_len();
                    if reserved >= 6 + suffix_len + value.len() {
                        fill_ghost(&leaf, tx, store, &key, value)?;
                        return Ok(());
                    }
                    // undersized ghost: reclaim it, then take the fresh path
                    defrag::defrag_page(&leaf)?;
                    continue;
                }
                Err(_) => {
                    if !leaf.page().check_space_for_leaf_insert(&key, value.len()) {
                        leaf = split::split_if_needed(leaf, &key, value.len())?;
                        continue;
                    }
                    reserve_ghost(&leaf, &key, value.len())?;
                    fill_ghost(&leaf, tx, store, &key, value)?;
                    return Ok(());
                }
            }
        }
    }
    Err(db_error!(
        ErrorCode::TooManyRetry,
        "insert of {:?} kept retrying",
        key
    ))
}

/// Reserve a ghost slot for the key via a single-log system transaction,
/// so the structural change stays durable independent of the user
/// transaction that fills it.
fn reserve_ghost(
    leaf: &crate::buffer::PageGuard,
    key: &BTreeKey,
    value_len: usize,
) -> DbResult {
    let sxs = SysXct::begin(true)?;
    let mut rec = LogRecord::new(LogRecordKind::GhostReserve, 0, leaf.pid())
        .with_payload(GhostReservePayload::encode(key, value_len as u16));
    rec.page_prev_lsn = leaf.page().page_lsn();
    let lsn = Database::xct_manager().log_insert(sxs.id(), rec.clone())?;
    rec.lsn = lsn;
    apply::apply_to_page(&rec, leaf.page_mut(), PageRole::Primary)?;
    leaf.update_lsn_and_dirty(lsn);
    sxs.commit()?;
    Ok(())
}

/// Turn the reserved ghost into the real record under the user
/// transaction; this is the undoable half of the insert.
fn fill_ghost(
    leaf: &crate::buffer::PageGuard,
    tx: &Transaction,
    store: StoreId,
    key: &BTreeKey,
    value: &[u8],
) -> DbResult {
    let mut rec = LogRecord::new(LogRecordKind::Insert, tx.id(), leaf.pid())
        .with_flags(FLAG_UNDOABLE)
        .with_payload(KeyValuePayload::encode(store, key, value));
    rec.page_prev_lsn = leaf.page().page_lsn();
    let lsn = Database::xct_manager().log_insert(tx.id(), rec.clone())?;
    rec.lsn = lsn;
    apply::apply_to_page(&rec, leaf.page_mut(), PageRole::Primary)?;
    leaf.update_lsn_and_dirty(lsn);
    debug!("insert {:?} on page {} at {}", key, leaf.pid(), lsn);
    Ok(())
}
