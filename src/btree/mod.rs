//! The B+Tree: unique byte-string keys to byte-string values, stored in a
//! foster-chained tree. Splits, adoptions, merges and height changes run
//! as nested system transactions inside the caller's transaction.

pub mod adopt;
pub mod apply;
pub mod defrag;
pub mod grow;
pub mod insert;
pub mod key;
pub mod keylock;
pub mod lookup;
pub mod merge;
pub mod page;
pub mod remove;
pub mod split;
pub mod traverse;
pub mod update;
pub mod verify;

use crate::{
    buffer::PageGuard,
    lock::{IntentMode, WaitPolicy},
    sync::qsx::LatchMode,
    transaction::Transaction,
    types::{DbResult, StoreId},
    Database,
};

pub use verify::VolumeReport;

pub struct BTree {
    store: StoreId,
}

impl BTree {
    /// Create a new empty tree and its store.
    pub fn create() -> DbResult<BTree> {
        let store = grow::create_tree()?;
        Ok(BTree { store })
    }

    pub fn open(store: StoreId) -> BTree {
        BTree { store }
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    pub fn insert(&self, tx: &Transaction, key: &[u8], value: &[u8]) -> DbResult {
        insert::insert_impl(self.store, tx, key, value)
    }

    pub fn lookup(&self, tx: &Transaction, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        lookup::lookup_impl(self.store, tx, key)
    }

    pub fn update(&self, tx: &Transaction, key: &[u8], value: &[u8]) -> DbResult {
        update::update_impl(self.store, tx, key, value)
    }

    /// Insert-or-update.
    pub fn put(&self, tx: &Transaction, key: &[u8], value: &[u8]) -> DbResult {
        update::put_impl(self.store, tx, key, value)
    }

    pub fn overwrite(
        &self,
        tx: &Transaction,
        key: &[u8],
        offset: usize,
        bytes: &[u8],
    ) -> DbResult {
        update::overwrite_impl(self.store, tx, key, offset, bytes)
    }

    pub fn remove(&self, tx: &Transaction, key: &[u8]) -> DbResult {
        remove::remove_impl(self.store, tx, key)
    }

    /// All live records in key order. Takes a store-level S lock instead of
    /// per-key locks.
    pub fn scan(&self, tx: &Transaction) -> DbResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let locks = Database::lock_manager();
        let vid = Database::volume().vid();
        locks.intent_store_lock(tx.id(), vid, self.store, IntentMode::S, WaitPolicy::Forever)?;
        let pool = Database::buffer_pool();
        let root = pool.fix_root(self.store, LatchMode::S)?;
        let mut out = Vec::new();
        scan_page(&pool, root, &mut out)?;
        Ok(out)
    }

    pub fn verify(&self, hash_bits: u32) -> DbResult<bool> {
        verify::verify_tree(self.store, hash_bits)
    }

    /// Mark the whole store for deletion when `tx` commits.
    pub fn drop_at_commit(self, tx: &Transaction) {
        Database::xct_manager().defer_store_delete(tx.id(), self.store);
    }
}

fn scan_page(
    pool: &std::sync::Arc<crate::buffer::BufferPool>,
    guard: PageGuard,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> DbResult<()> {
    if guard.page().is_leaf() {
        for slot in 1..=guard.page().nrecs() {
            if !guard.page().is_ghost(slot) {
                out.push((
                    guard.page().key_at(slot).user_bytes().to_vec(),
                    guard.page().leaf_value(slot).to_vec(),
                ));
            }
        }
    } else {
        let child = pool.fix_nonroot(&guard, guard.page().pid0(), LatchMode::S, false, false)?;
        scan_page(pool, child, out)?;
        for slot in 1..=guard.page().nrecs() {
            let child = pool.fix_nonroot(
                &guard,
                guard.page().node_child(slot),
                LatchMode::S,
                false,
                false,
            )?;
            scan_page(pool, child, out)?;
        }
    }
    if guard.page().has_foster() {
        let foster = pool.fix_nonroot(&guard, guard.page().foster(), LatchMode::S, false, false)?;
        drop(guard);
        scan_page(pool, foster, out)?;
    }
    Ok(())
}
