//! Tree and volume verification.
//!
//! Vertical edges are checked directly (parent and child are both latched
//! during the descent); a child that carries a foster chain satisfies the
//! parent's bound through its chain fence, and the chain is walked and
//! checked link by link. Every page additionally toggles a hashed bit for
//! the (page id, low fence) fact its parent expected, so a dangling or
//! duplicated edge leaves a bit set even when the direct checks could not
//! see it. `hash_bits` sizes that parity bitmap.

use bit_vec::BitVec;
use log::warn;

use crate::{
    buffer::PageGuard,
    lock::hash_key,
    sync::qsx::LatchMode,
    types::{DbResult, StoreId},
    Database,
};

use super::key::BTreeKey;

pub struct VolumeReport {
    pub stores_checked: usize,
    pub pages_checked: usize,
    pub consistent: bool,
}

struct Verifier {
    bits: BitVec,
    ok: bool,
    pages: usize,
}

impl Verifier {
    fn new(hash_bits: u32) -> Verifier {
        let size = 1usize << hash_bits.min(24).max(4);
        Verifier {
            bits: BitVec::from_elem(size, false),
            ok: true,
            pages: 0,
        }
    }

    fn toggle(&mut self, pid: u32, low: &BTreeKey) {
        let mut h = hash_key(low.serialized()) as u64;
        h = h.wrapping_mul(31).wrapping_add(pid as u64);
        let idx = (h as usize) % self.bits.len();
        let cur = self.bits.get(idx).unwrap_or(false);
        self.bits.set(idx, !cur);
    }

    fn fail(&mut self, why: &str, pid: u32) {
        warn!("verify: {} (page {})", why, pid);
        self.ok = false;
    }

    fn balanced(&self) -> bool {
        self.bits.iter().all(|b| !b)
    }
}

pub fn verify_tree(store: StoreId, hash_bits: u32) -> DbResult<bool> {
    let pool = Database::buffer_pool();
    let mut v = Verifier::new(hash_bits);
    let root = pool.fix_root(store, LatchMode::S)?;
    // the root (with its transient foster chain, if any) spans everything
    v.toggle(root.pid(), &BTreeKey::neg_inf());
    verify_page(
        &pool,
        &mut v,
        &root,
        &BTreeKey::neg_inf(),
        &BTreeKey::pos_inf(),
    )?;
    Ok(v.ok && v.balanced())
}

pub fn verify_volume(hash_bits: u32) -> DbResult<VolumeReport> {
    let mut report = VolumeReport {
        stores_checked: 0,
        pages_checked: 0,
        consistent: true,
    };
    for store in Database::volume().store_ids() {
        let ok = verify_tree(store, hash_bits)?;
        report.stores_checked += 1;
        report.consistent &= ok;
    }
    Ok(report)
}

/// Check the page against the key interval its parent assigned to it. A
/// foster chain as a whole covers the interval: each link hands the next
/// one the range from its own high fence, and the chain fence of every
/// link equals the parent's bound.
fn verify_page(
    pool: &std::sync::Arc<crate::buffer::BufferPool>,
    v: &mut Verifier,
    page: &PageGuard,
    expect_low: &BTreeKey,
    expect_high: &BTreeKey,
) -> DbResult<()> {
    v.pages += 1;

    if !page.page().is_consistent() {
        v.fail("page self-check failed", page.pid());
    }
    if page.page().fence_low() != *expect_low {
        v.fail("low fence does not match the parent's separator", page.pid());
    }
    if page.page().has_foster() {
        if page.page().chain_fence_high() != *expect_high {
            v.fail("chain fence does not reach the parent's bound", page.pid());
        }
    } else if page.page().fence_high() != *expect_high {
        v.fail("high fence does not match the parent's bound", page.pid());
    }

    if page.page().is_node() {
        let n = page.page().nrecs();
        let first_high = if n >= 1 {
            page.page().key_at(1)
        } else {
            page.page().fence_high()
        };
        let low = page.page().fence_low();
        let child = pool.fix_nonroot(page, page.page().pid0(), LatchMode::S, false, false)?;
        v.toggle(child.pid(), &low);
        verify_page(pool, v, &child, &low, &first_high)?;
        drop(child);
        for slot in 1..=n {
            let sep = page.page().key_at(slot);
            let high = if slot < n {
                page.page().key_at(slot + 1)
            } else {
                page.page().fence_high()
            };
            let child =
                pool.fix_nonroot(page, page.page().node_child(slot), LatchMode::S, false, false)?;
            v.toggle(child.pid(), &sep);
            verify_page(pool, v, &child, &sep, &high)?;
        }
    }

    if page.page().has_foster() {
        let low = page.page().fence_high();
        let foster = pool.fix_nonroot(page, page.page().foster(), LatchMode::S, false, false)?;
        v.toggle(foster.pid(), &low);
        verify_page(pool, v, &foster, &low, expect_high)?;
    }
    Ok(())
}
