//! Buffer pool: fixed frame array, cuckoo lookup, clock eviction, pointer
//! swizzling, pin-for-refix.

use std::{
    cell::UnsafeCell,
    sync::atomic::{AtomicUsize, Ordering},
    sync::{Arc, Mutex},
};

use log::{debug, warn};

use crate::{
    btree::page::PageData,
    config::Options,
    db_error,
    error::ErrorCode,
    log::{LogManager, Lsn},
    sync::{qsx::LatchMode, LockFreeQueue, Ticket},
    types::{DbResult, PageId, StoreId, INVALID_PAGE_ID},
    vol::Volume,
};

use super::{frame::ControlBlock, hashtable::PageTable};

/// High bit of a page-id field: the rest is a frame index, not a page id.
pub const SWIZZLE_BIT: PageId = 0x8000_0000;

pub fn is_swizzled(v: PageId) -> bool {
    v & SWIZZLE_BIT != 0
}

pub fn swizzle(idx: usize) -> PageId {
    idx as PageId | SWIZZLE_BIT
}

pub fn swizzled_idx(v: PageId) -> usize {
    (v & !SWIZZLE_BIT) as usize
}

pub struct Frame {
    pub cb: ControlBlock,
    page: UnsafeCell<PageData>,
}

unsafe impl Sync for Frame {}

pub struct BufferPool {
    frames: Vec<Frame>,
    table: PageTable,
    free_frames: LockFreeQueue<usize>,
    clock_hand: AtomicUsize,

    /// Serializes miss handling, eviction and page-table writes.
    miss_mutex: Mutex<()>,

    volume: Arc<Volume>,
    log: Arc<LogManager>,
}

/// A latched page. Releases the latch on drop.
pub struct PageGuard {
    pool: Arc<BufferPool>,
    idx: usize,
    mode: LatchMode,
    ticket: Ticket,
}

impl PageGuard {
    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn mode(&self) -> LatchMode {
        self.mode
    }

    pub fn cb(&self) -> &ControlBlock {
        &self.pool.frames[self.idx].cb
    }

    pub fn pid(&self) -> PageId {
        self.cb().pid()
    }

    pub fn page(&self) -> &PageData {
        unsafe { &*self.pool.frames[self.idx].page.get() }
    }

    /// Callers must hold the EX latch; updates happen through this and are
    /// serialized by it.
    pub fn page_mut(&self) -> &mut PageData {
        debug_assert_eq!(self.mode, LatchMode::X);
        unsafe { &mut *self.pool.frames[self.idx].page.get() }
    }

    /// Stamp the page LSN after logging an update and mark the frame dirty.
    pub fn update_lsn_and_dirty(&self, lsn: Lsn) {
        self.page_mut().set_page_lsn(lsn);
        self.cb().mark_dirty(lsn);
    }

    /// Conditional S -> X upgrade: never blocks, succeeds only when this
    /// guard is the sole reader. On failure the guard keeps S and the
    /// blocked-writer hint is bumped.
    pub fn try_upgrade(&mut self) -> bool {
        debug_assert_eq!(self.mode, LatchMode::S);
        match self.cb().latch.try_upgrade_sx_cond(self.ticket) {
            Some(t) => {
                self.ticket = t;
                self.mode = LatchMode::X;
                true
            }
            None => {
                self.cb().note_ex_blocked();
                false
            }
        }
    }

    pub fn downgrade(&mut self) {
        debug_assert_eq!(self.mode, LatchMode::X);
        self.ticket = self.cb().latch.downgrade_xs(self.ticket);
        self.mode = LatchMode::S;
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        let latch = &self.pool.frames[self.idx].cb.latch;
        match self.mode {
            LatchMode::X => latch.release_x(self.ticket),
            LatchMode::S => latch.release_s(self.ticket),
            LatchMode::Q => {
                latch.release_q(self.ticket);
            }
        }
    }
}

impl BufferPool {
    pub fn new(options: &Options, volume: Arc<Volume>, log: Arc<LogManager>) -> Arc<BufferPool> {
        let n = options.frame_count();
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            frames.push(Frame {
                cb: ControlBlock::new(),
                page: UnsafeCell::new(PageData::new()),
            });
        }
        let free_frames = LockFreeQueue::new();
        for idx in 0..n {
            free_frames.enqueue(idx);
        }
        Arc::new(BufferPool {
            frames,
            table: PageTable::new(n),
            free_frames,
            clock_hand: AtomicUsize::new(0),
            miss_mutex: Mutex::new(()),
            volume,
            log,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn cb(&self, idx: usize) -> &ControlBlock {
        &self.frames[idx].cb
    }

    fn page_ref(&self, idx: usize) -> &PageData {
        unsafe { &*self.frames[idx].page.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn page_mut_ref(&self, idx: usize) -> &mut PageData {
        unsafe { &mut *self.frames[idx].page.get() }
    }

    /// Turn a possibly-swizzled page-id field into the real page id.
    pub fn normalize_pid(&self, v: PageId) -> PageId {
        if is_swizzled(v) {
            self.frames[swizzled_idx(v)].cb.pid()
        } else {
            v
        }
    }

    /// Fetch-or-load the root page of a store. The root has no parent and
    /// therefore no EMLSN to drive single-page recovery: a torn root image
    /// surfaces as such.
    pub fn fix_root(
        self: &Arc<Self>,
        store: StoreId,
        mode: LatchMode,
    ) -> DbResult<PageGuard> {
        let root = self.volume.store_root(store)?;
        self.fix(root, mode, false, false, None)
    }

    /// Fix a page reached from a latched parent. A swizzled id goes
    /// straight to its frame; otherwise hash lookup, reading from disk on a
    /// miss. With `conditional` a contended latch returns Retry instead of
    /// blocking. With `virgin` the frame is claimed without a disk read.
    pub fn fix_nonroot(
        self: &Arc<Self>,
        parent: &PageGuard,
        pid: PageId,
        mode: LatchMode,
        conditional: bool,
        virgin: bool,
    ) -> DbResult<PageGuard> {
        if is_swizzled(pid) {
            // the parent latch keeps the child resident: eviction would
            // need the parent EX to unswizzle this pointer
            let idx = swizzled_idx(pid);
            let guard = self.latch_frame(idx, mode, conditional)?;
            guard.cb().set_ref_bit();
            return Ok(guard);
        }
        // the parent's EMLSN for this child bounds single-page recovery
        // should the on-disk image turn out torn
        let emlsn = parent.page().emlsn_for_child(pid);
        let guard = self.fix(pid, mode, conditional, virgin, Some(emlsn))?;
        guard.cb().set_parent_pid(parent.pid());
        Ok(guard)
    }

    /// Fix by real page id, outside swizzling (recovery, cursor refix).
    /// A torn image is rebuilt from the log with no minimum-LSN bound.
    pub fn fix_direct(
        self: &Arc<Self>,
        pid: PageId,
        mode: LatchMode,
        virgin: bool,
    ) -> DbResult<PageGuard> {
        self.fix(pid, mode, false, virgin, Some(Lsn::NULL))
    }

    fn fix(
        self: &Arc<Self>,
        pid: PageId,
        mode: LatchMode,
        conditional: bool,
        virgin: bool,
        recovery_emlsn: Option<Lsn>,
    ) -> DbResult<PageGuard> {
        debug_assert!(!is_swizzled(pid));
        debug_assert!(pid != INVALID_PAGE_ID);
        loop {
            if let Some(idx) = self.table.lookup(pid) {
                let guard = self.latch_frame(idx, mode, conditional)?;
                if guard.cb().pid() == pid {
                    guard.cb().set_ref_bit();
                    return Ok(guard);
                }
                // frame was recycled under us; retry
                drop(guard);
                continue;
            }

            let _miss = self.miss_mutex.lock().unwrap();
            if self.table.lookup(pid).is_some() {
                continue; // raced with another miss
            }
            let idx = match self.free_frames.dequeue() {
                Some(idx) => idx,
                None => self.evict_one()?,
            };
            let cb = &self.frames[idx].cb;
            let ticket = cb
                .latch
                .try_acquire_x()
                .expect("fresh frame latched by someone");
            cb.set_pid(pid);
            if virgin {
                *self.page_mut_ref(idx) = PageData::new();
            } else {
                let page = self.page_mut_ref(idx);
                if let Err(e) = self.volume.read_page(pid, page.bytes_mut()) {
                    cb.reset();
                    cb.latch.release_x(ticket);
                    self.free_frames.enqueue(idx);
                    return Err(e);
                }
                let torn = !page.lsn_consistent()
                    || (!page.page_lsn().is_null() && !page.verify_checksum());
                if torn {
                    // the disk image is unusable; rebuild it from the log
                    // when the caller brought a parent EMLSN to bound the
                    // replay, else surface the missing-parent condition
                    match recovery_emlsn {
                        Some(emlsn) => {
                            match crate::btree::apply::recover_single_page(
                                &self.log, pid, emlsn,
                            ) {
                                Ok(img) => {
                                    *page = img;
                                    cb.mark_dirty(page.page_lsn());
                                    warn!("page {} rebuilt by single-page recovery", pid);
                                }
                                Err(e) => {
                                    cb.reset();
                                    cb.latch.release_x(ticket);
                                    self.free_frames.enqueue(idx);
                                    return Err(e);
                                }
                            }
                        }
                        None => {
                            cb.reset();
                            cb.latch.release_x(ticket);
                            self.free_frames.enqueue(idx);
                            return Err(db_error!(
                                ErrorCode::NoParentSpr,
                                "page {} is torn and no parent EMLSN can drive \
                                 single-page recovery",
                                pid
                            ));
                        }
                    }
                }
            }
            cb.set_ref_bit();
            self.table.insert(pid, idx)?;
            drop(_miss);

            let mut guard = PageGuard {
                pool: Arc::clone(self),
                idx,
                mode: LatchMode::X,
                ticket,
            };
            if mode == LatchMode::S {
                guard.downgrade();
            }
            return Ok(guard);
        }
    }

    fn latch_frame(
        self: &Arc<Self>,
        idx: usize,
        mode: LatchMode,
        conditional: bool,
    ) -> DbResult<PageGuard> {
        let cb = &self.frames[idx].cb;
        let ticket = match mode {
            LatchMode::X => {
                if conditional {
                    cb.latch.try_acquire_x().ok_or_else(|| {
                        cb.note_ex_blocked();
                        db_error!(ErrorCode::Retry, "conditional EX latch contended")
                    })?
                } else {
                    cb.latch.acquire_x()
                }
            }
            LatchMode::S => {
                if conditional {
                    cb.latch
                        .try_acquire_s()
                        .ok_or_else(|| db_error!(ErrorCode::Retry, "conditional SH latch contended"))?
                } else {
                    cb.latch.acquire_s()
                }
            }
            LatchMode::Q => cb.latch.acquire_q(),
        };
        Ok(PageGuard {
            pool: Arc::clone(self),
            idx,
            mode,
            ticket,
        })
    }

    /// Keep a frame resident across an unlatch; pair with `refix_direct`
    /// and `unpin_for_refix`.
    pub fn pin_for_refix(&self, guard: &PageGuard) -> usize {
        guard.cb().pin();
        guard.idx
    }

    pub fn refix_direct(self: &Arc<Self>, idx: usize, mode: LatchMode) -> DbResult<PageGuard> {
        let guard = self.latch_frame(idx, mode, false)?;
        Ok(guard)
    }

    pub fn unpin_for_refix(&self, idx: usize) {
        self.frames[idx].cb.unpin();
    }

    /// Clock sweep. Pass 1 takes only clean unlatched frames, pass 2 also
    /// flushes dirty ones, pass 3 additionally unswizzles. Reference bits
    /// are cleared as the hand passes. Caller holds the miss mutex.
    fn evict_one(&self) -> DbResult<usize> {
        let n = self.frames.len();
        for pass in 0..3 {
            let mut scanned = 0;
            while scanned < n {
                let idx = self.clock_hand.fetch_add(1, Ordering::Relaxed) % n;
                scanned += 1;
                let cb = &self.frames[idx].cb;
                if cb.is_free() || cb.pin_count() != 0 {
                    continue;
                }
                if cb.take_ref_bit() && pass < 2 {
                    continue;
                }
                let ticket = match cb.latch.try_acquire_x() {
                    Some(t) => t,
                    None => continue,
                };
                if cb.pin_count() != 0 || cb.is_free() {
                    cb.latch.release_x(ticket);
                    continue;
                }
                if cb.is_swizzled() {
                    if pass < 2 || !self.unswizzle_frame(idx) {
                        cb.latch.release_x(ticket);
                        continue;
                    }
                }
                if cb.has_swizzled_children() {
                    if pass < 2 {
                        cb.latch.release_x(ticket);
                        continue;
                    }
                    self.unswizzle_children(idx);
                }
                let doomed = self.page_ref(idx).is_to_be_deleted();
                if cb.is_dirty() && !doomed {
                    if pass == 0 {
                        cb.latch.release_x(ticket);
                        continue;
                    }
                    if let Err(e) = self.write_frame_locked(idx) {
                        cb.latch.release_x(ticket);
                        return Err(e);
                    }
                }
                let pid = cb.pid();
                self.table.remove(pid);
                if doomed {
                    self.volume.deallocate_page(pid)?;
                }
                debug!("evicted page {} from frame {}", pid, idx);
                cb.reset();
                cb.latch.release_x(ticket);
                return Ok(idx);
            }
        }
        Err(db_error!(
            ErrorCode::OutOfMemory,
            "buffer pool exhausted: no evictable frame"
        ))
    }

    /// Remove this frame's swizzled pointer from its parent. Needs the
    /// parent resident and its latch uncontended.
    fn unswizzle_frame(&self, idx: usize) -> bool {
        let cb = &self.frames[idx].cb;
        let parent_pid = cb.parent_pid();
        let parent_idx = match self.table.lookup(parent_pid) {
            Some(i) => i,
            None => return false,
        };
        let pcb = &self.frames[parent_idx].cb;
        let pticket = match pcb.latch.try_acquire_x() {
            Some(t) => t,
            None => return false,
        };
        if pcb.pid() != parent_pid {
            pcb.latch.release_x(pticket);
            return false;
        }
        let parent = self.page_mut_ref(parent_idx);
        let target = swizzle(idx);
        let mut found = false;
        if parent.is_node() {
            if parent.pid0() == target {
                parent.set_pid0(cb.pid());
                found = true;
            }
            for slot in 1..=parent.nrecs() {
                if parent.node_child(slot) == target {
                    parent.set_node_child(slot, cb.pid());
                    found = true;
                    break;
                }
            }
        }
        if found {
            cb.set_swizzled(false);
        }
        pcb.latch.release_x(pticket);
        found
    }

    /// Replace every swizzled child pointer on this page (held in EX) with
    /// the real page id.
    fn unswizzle_children(&self, idx: usize) {
        let page = self.page_mut_ref(idx);
        if !page.is_node() {
            self.frames[idx].cb.set_has_swizzled_children(false);
            return;
        }
        let pid0 = page.pid0();
        if is_swizzled(pid0) {
            let child_idx = swizzled_idx(pid0);
            page.set_pid0(self.frames[child_idx].cb.pid());
            self.frames[child_idx].cb.set_swizzled(false);
        }
        for slot in 1..=page.nrecs() {
            let v = page.node_child(slot);
            if is_swizzled(v) {
                let child_idx = swizzled_idx(v);
                page.set_node_child(slot, self.frames[child_idx].cb.pid());
                self.frames[child_idx].cb.set_swizzled(false);
            }
        }
        self.frames[idx].cb.set_has_swizzled_children(false);
    }

    /// Install a swizzled pointer for `child` into `parent` (both latched,
    /// parent in EX).
    pub fn swizzle_child(&self, parent: &PageGuard, slot: usize, child: &PageGuard) {
        #[cfg(feature = "swizzling")]
        {
            debug_assert_eq!(parent.mode(), LatchMode::X);
            let page = parent.page_mut();
            let v = swizzle(child.idx);
            if slot == 0 {
                page.set_pid0(v);
            } else {
                page.set_node_child(slot, v);
            }
            child.cb().set_swizzled(true);
            child.cb().set_parent_pid(parent.pid());
            parent.cb().set_has_swizzled_children(true);
        }
        #[cfg(not(feature = "swizzling"))]
        {
            let _ = (parent, slot, child);
        }
    }

    /// Strip swizzled child pointers from a page before a structure
    /// modification moves or logs its records.
    pub fn unswizzle_children_of(&self, guard: &PageGuard) {
        debug_assert_eq!(guard.mode(), LatchMode::X);
        self.unswizzle_children(guard.idx());
    }

    /// Write one frame's page image while holding its EX latch: normalize
    /// swizzled pointers in a copy, honor WAL, then clear dirty.
    fn write_frame_locked(&self, idx: usize) -> DbResult {
        let cb = &self.frames[idx].cb;
        let mut copy = self.page_ref(idx).clone();
        self.normalize_copy(&mut copy);
        copy.update_checksum();
        // WAL: everything up to the page LSN must be durable first
        self.log.flush(copy.page_lsn())?;
        self.volume.write_page(cb.pid(), copy.bytes())?;
        cb.clear_dirty();
        Ok(())
    }

    /// Swizzled pointers never reach disk.
    pub fn normalize_copy(&self, copy: &mut PageData) {
        if !copy.is_node() {
            return;
        }
        let pid0 = copy.pid0();
        if is_swizzled(pid0) {
            copy.set_pid0(self.frames[swizzled_idx(pid0)].cb.pid());
        }
        for slot in 1..=copy.nrecs() {
            let v = copy.node_child(slot);
            if is_swizzled(v) {
                copy.set_node_child(slot, self.frames[swizzled_idx(v)].cb.pid());
            }
        }
    }

    /// Lower bound over dirty frames' recovery LSNs; null when everything
    /// is clean.
    pub fn min_rec_lsn(&self) -> Lsn {
        let mut min = Lsn::NULL;
        for f in &self.frames {
            if f.cb.is_dirty() {
                let l = f.cb.rec_lsn();
                if !l.is_null() && (min.is_null() || l < min) {
                    min = l;
                }
            }
        }
        min
    }

    /// Raw image of a frame; callers hold at least an S latch.
    pub fn page_bytes(&self, idx: usize) -> &[u8] {
        self.page_ref(idx).bytes()
    }

    pub fn page_lsn_of(&self, idx: usize) -> Lsn {
        self.page_ref(idx).page_lsn()
    }

    pub fn dirty_frames(&self) -> Vec<(PageId, usize)> {
        self.frames
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.cb.is_free() && f.cb.is_dirty())
            .map(|(i, f)| (f.cb.pid(), i))
            .collect()
    }

    pub fn volume(&self) -> &Arc<Volume> {
        &self.volume
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// Synchronously write out every dirty frame (shutdown, checkpoint and
    /// tests).
    pub fn flush_all(&self) -> DbResult {
        for (_, idx) in self.dirty_frames() {
            let cb = &self.frames[idx].cb;
            let ticket = cb.latch.acquire_x();
            if !cb.is_free() && cb.is_dirty() {
                let r = self.write_frame_locked(idx);
                cb.latch.release_x(ticket);
                r?;
            } else {
                cb.latch.release_x(ticket);
            }
        }
        self.volume.sync()
    }
}
