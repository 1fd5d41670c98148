//! Update, insert-or-update, and in-place byte overwrite.

use log::debug;

use crate::{
    db_error,
    error::ErrorCode,
    lock::{IntentMode, OkvlMode, WaitPolicy},
    log::record::{
        LogRecord, LogRecordKind, OverwritePayload, UpdatePayload, FLAG_UNDOABLE,
    },
    sync::qsx::LatchMode,
    transaction::Transaction,
    types::{DbResult, StoreId},
    Database,
};

use super::{
    apply::{self, PageRole},
    insert,
    key::BTreeKey,
    keylock::{self, KeyLockOutcome},
    remove,
    traverse::{self, TraverseMode, MAX_TRAVERSE_RETRIES},
};

pub(crate) fn update_impl(
    store: StoreId,
    tx: &Transaction,
    key_bytes: &[u8],
    value: &[u8],
) -> DbResult {
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

        let slot = match leaf.page().search(&key) {
            Ok(slot) if !leaf.page().is_ghost(slot) => slot,
            _ => return Err(db_error!(ErrorCode::NotFound, "key {:?} not found", key)),
        };
        let old_value = leaf.page().leaf_value(slot).to_vec();
        let suffix_len = key.serialized_len() - leaf.page().prefix_len();
        if leaf.page().record_reserved_len(slot) >= 6 + suffix_len + value.len() {
            let mut rec = LogRecord::new(LogRecordKind::Update, tx.id(), leaf.pid())
                .with_flags(FLAG_UNDOABLE)
                .with_payload(UpdatePayload::encode(store, &key, &old_value, value));
            rec.page_prev_lsn = leaf.page().page_lsn();
            let lsn = Database::xct_manager().log_insert(tx.id(), rec.clone())?;
            rec.lsn = lsn;
            apply::apply_to_page(&rec, leaf.page_mut(), PageRole::Primary)?;
            leaf.update_lsn_and_dirty(lsn);
            debug!("updated {:?} in place on page {}", key, leaf.pid());
            return Ok(());
        }
        // the grown value does not fit the reserved record: delete and
        // re-insert under the same transaction
        drop(leaf);
        remove::remove_impl(store, tx, key_bytes)?;
        return insert::insert_impl(store, tx, key_bytes, value);
    }
    Err(db_error!(
        ErrorCode::TooManyRetry,
        "update of {:?} kept retrying",
        key
    ))
}

/// Insert the key or, when it already exists, update it.
pub(crate) fn put_impl(
    store: StoreId,
    tx: &Transaction,
    key_bytes: &[u8],
    value: &[u8],
) -> DbResult {
    match insert::insert_impl(store, tx, key_bytes, value) {
        Err(e) if e.code() == ErrorCode::Duplicate => update_impl(store, tx, key_bytes, value),
        other => other,
    }
}

/// Replace `new_bytes.len()` bytes of the value at `offset`, logging only
/// the spliced range.
pub(crate) fn overwrite_impl(
    store: StoreId,
    tx: &Transaction,
    key_bytes: &[u8],
    offset: usize,
    new_bytes: &[u8],
) -> DbResult {
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

        let slot = match leaf.page().search(&key) {
            Ok(slot) if !leaf.page().is_ghost(slot) => slot,
            _ => return Err(db_error!(ErrorCode::NotFound, "key {:?} not found", key)),
        };
        let value = leaf.page().leaf_value(slot);
        if offset + new_bytes.len() > value.len() {
            return Err(db_error!(
                ErrorCode::BadArgument,
                "overwrite of {}+{} past value end {}",
                offset,
                new_bytes.len(),
                value.len()
            ));
        }
        let old_bytes = value[offset..offset + new_bytes.len()].to_vec();
        let mut rec = LogRecord::new(LogRecordKind::Overwrite, tx.id(), leaf.pid())
            .with_flags(FLAG_UNDOABLE)
            .with_payload(OverwritePayload::encode(
                store,
                &key,
                offset as u16,
                &old_bytes,
                new_bytes,
            ));
        rec.page_prev_lsn = leaf.page().page_lsn();
        let lsn = Database::xct_manager().log_insert(tx.id(), rec.clone())?;
        rec.lsn = lsn;
        apply::apply_to_page(&rec, leaf.page_mut(), PageRole::Primary)?;
        leaf.update_lsn_and_dirty(lsn);
        return Ok(());
    }
    Err(db_error!(
        ErrorCode::TooManyRetry,
        "overwrite of {:?} kept retrying",
        key
    ))
}
