//! Point lookup with key-range locking on misses.

use crate::{
    config::QueryConcurrency,
    error::ErrorCode,
    db_error,
    lock::{IntentMode, LockBase, OkvlMode, WaitPolicy},
    sync::qsx::LatchMode,
    transaction::Transaction,
    types::{DbResult, StoreId},
    Database,
};

use super::{
    key::BTreeKey,
    keylock::{self, KeyLockOutcome},
    traverse::{self, TraverseMode, MAX_TRAVERSE_RETRIES},
};

pub(crate) fn lookup_impl(
    store: StoreId,
    tx: &Transaction,
    key_bytes: &[u8],
) -> DbResult<Option<Vec<u8>>> {
    let key = BTreeKey::regular(key_bytes);
    let options = Database::options();
    let locks = Database::lock_manager();
    let vid = Database::volume().vid();

    let exlock = options.query_exlock_for_select;
    let keyrange = options.query_concurrency == QueryConcurrency::KeyRange;
    let intent = if exlock { IntentMode::IX } else { IntentMode::IS };
    locks.intent_store_lock(tx.id(), vid, store, intent, WaitPolicy::Forever)?;

    let hit_mode = if exlock {
        OkvlMode::key_x()
    } else {
        OkvlMode::key_s()
    };
    let gap_base = if exlock { LockBase::X } else { LockBase::S };

    for _ in 0..MAX_TRAVERSE_RETRIES {
        let leaf = traverse::traverse(store, &key, TraverseMode::FenceContain, LatchMode::S, None)?;

        match leaf.page().search(&key) {
            Ok(slot) if !leaf.page().is_ghost(slot) => {
                if !keyrange {
                    return Ok(Some(leaf.page().leaf_value(slot).to_vec()));
                }
                match keylock::lock_key(tx.id(), store, key.serialized(), hit_mode, leaf)? {
                    KeyLockOutcome::Granted(leaf) => {
                        // the page LSN was re-validated; re-probe the slot
                        match leaf.page().search(&key) {
                            Ok(slot) if !leaf.page().is_ghost(slot) => {
                                return Ok(Some(leaf.page().leaf_value(slot).to_vec()));
                            }
                            _ => continue,
                        }
                    }
                    KeyLockOutcome::Restart => continue,
                }
            }
            found => {
                if !keyrange {
                    return Ok(None);
                }
                // protect the gap between the previous key and the missing
                // one so no one can slip the key in before we commit
                let anchor = match found {
                    // a ghost with the same key anchors the lock directly
                    Ok(_) => key.clone(),
                    Err(pos) if pos > 1 => leaf.page().key_at(pos - 1),
                    // below the first record the low fence is the anchor
                    Err(_) => leaf.page().fence_low(),
                };
                let mode = if anchor == key {
                    // spec 4.11: a miss exactly on the fence key takes the
                    // key lock itself
                    hit_mode
                } else {
                    OkvlMode::gap_mode(gap_base)
                };
                match keylock::lock_key(tx.id(), store, anchor.serialized(), mode, leaf)? {
                    KeyLockOutcome::Granted(leaf) => {
                        match leaf.page().search(&key) {
                            Ok(slot) if !leaf.page().is_ghost(slot) => {
                                // the key appeared before the lock landed
                                return Ok(Some(leaf.page().leaf_value(slot).to_vec()));
                            }
                            _ => return Ok(None),
                        }
                    }
                    KeyLockOutcome::Restart => continue,
                }
            }
        }
    }
    Err(db_error!(
        ErrorCode::TooManyRetry,
        "lookup of {:?} kept retrying",
        key
    ))
}
