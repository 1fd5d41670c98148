//! Per-frame buffer control block.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::{
    log::Lsn,
    sync::QsxLatch,
    types::{PageId, INVALID_PAGE_ID},
};

pub struct ControlBlock {
    pub latch: QsxLatch,

    pid: AtomicU32,
    dirty: AtomicBool,
    ref_bit: AtomicBool,
    pin_count: AtomicI32,

    /// Lower bound on the LSN of updates to this frame that are not yet on
    /// disk. Null when clean.
    rec_lsn: AtomicU64,

    /// This frame's page id is stored swizzled in its parent.
    swizzled: AtomicBool,

    /// This page holds at least one swizzled child pointer.
    has_swizzled_children: AtomicBool,

    /// Parent hint used to unswizzle at eviction.
    parent_pid: AtomicU32,

    /// Readers that failed a conditional EX upgrade here; feeds the eager
    /// adoption hint.
    ex_blocked: AtomicU32,
}

impl ControlBlock {
    pub fn new() -> Self {
        Self {
            latch: QsxLatch::new(),
            pid: AtomicU32::new(INVALID_PAGE_ID),
            dirty: AtomicBool::new(false),
            ref_bit: AtomicBool::new(false),
            pin_count: AtomicI32::new(0),
            rec_lsn: AtomicU64::new(0),
            swizzled: AtomicBool::new(false),
            has_swizzled_children: AtomicBool::new(false),
            parent_pid: AtomicU32::new(INVALID_PAGE_ID),
            ex_blocked: AtomicU32::new(0),
        }
    }

    pub fn pid(&self) -> PageId {
        self.pid.load(Ordering::Acquire)
    }

    pub fn set_pid(&self, pid: PageId) {
        self.pid.store(pid, Ordering::Release)
    }

    pub fn is_free(&self) -> bool {
        self.pid() == INVALID_PAGE_ID
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Record an update at `lsn`: the frame becomes dirty and the recovery
    /// LSN is pinned to the first dirtying update.
    pub fn mark_dirty(&self, lsn: Lsn) {
        if !self.dirty.swap(true, Ordering::AcqRel) {
            self.rec_lsn.store(lsn.to_u64(), Ordering::Release);
        }
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
        self.rec_lsn.store(0, Ordering::Release);
    }

    pub fn rec_lsn(&self) -> Lsn {
        Lsn::from_u64(self.rec_lsn.load(Ordering::Acquire))
    }

    pub fn set_rec_lsn(&self, lsn: Lsn) {
        self.rec_lsn.store(lsn.to_u64(), Ordering::Release)
    }

    pub fn set_ref_bit(&self) {
        self.ref_bit.store(true, Ordering::Relaxed)
    }

    /// Returns the previous value and clears it (the clock hand passing).
    pub fn take_ref_bit(&self) -> bool {
        self.ref_bit.swap(false, Ordering::Relaxed)
    }

    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let old = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0);
    }

    pub fn pin_count(&self) -> i32 {
        self.pin_count.load(Ordering::Acquire)
    }

    pub fn is_swizzled(&self) -> bool {
        self.swizzled.load(Ordering::Acquire)
    }

    pub fn set_swizzled(&self, v: bool) {
        self.swizzled.store(v, Ordering::Release)
    }

    pub fn has_swizzled_children(&self) -> bool {
        self.has_swizzled_children.load(Ordering::Acquire)
    }

    pub fn set_has_swizzled_children(&self, v: bool) {
        self.has_swizzled_children.store(v, Ordering::Release)
    }

    pub fn parent_pid(&self) -> PageId {
        self.parent_pid.load(Ordering::Acquire)
    }

    pub fn set_parent_pid(&self, pid: PageId) {
        self.parent_pid.store(pid, Ordering::Release)
    }

    pub fn note_ex_blocked(&self) {
        self.ex_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ex_blocked(&self) -> u32 {
        self.ex_blocked.load(Ordering::Relaxed)
    }

    pub fn reset_ex_blocked(&self) {
        self.ex_blocked.store(0, Ordering::Relaxed);
    }

    /// Return the frame to the free state.
    pub fn reset(&self) {
        self.pid.store(INVALID_PAGE_ID, Ordering::Release);
        self.dirty.store(false, Ordering::Release);
        self.ref_bit.store(false, Ordering::Release);
        self.pin_count.store(0, Ordering::Release);
        self.rec_lsn.store(0, Ordering::Release);
        self.swizzled.store(false, Ordering::Release);
        self.has_swizzled_children.store(false, Ordering::Release);
        self.parent_pid.store(INVALID_PAGE_ID, Ordering::Release);
        self.ex_blocked.store(0, Ordering::Release);
    }
}

impl Default for ControlBlock {
    fn default() -> Self {
        Self::new()
    }
}
