//! Background page cleaner.
//!
//! One cleaner serves one volume. Each round collects the dirty frames,
//! sorts them by page id and writes contiguous runs with a single call.
//! A frame is copied under an S latch so updaters are not blocked during
//! the disk write; after the write the cleaner re-latches in EX and clears
//! the dirty bit only if the page LSN is unchanged. A page re-dirtied in
//! the meantime stays dirty, but its recovery LSN still advances to the
//! written image's LSN.
//!
//! Copy buffers come from the cleaner's own block list: the cleaner thread
//! is the owning allocator and releases every chip at the end of a round.

use std::{sync::Arc, time::Duration};

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use itertools::Itertools;
use log::{debug, warn};

use crate::{
    btree::page::PageData,
    config::PAGE_SIZE,
    log::Lsn,
    mem::{BlockList, BlockPool, Chip},
    types::{DbResult, PageId},
};

use super::pool::BufferPool;

const CLEANER_INTERVAL: Duration = Duration::from_millis(100);
const SCRATCH_CHIPS: usize = 64;

pub struct PageCleaner {
    stop_tx: Sender<()>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PageCleaner {
    pub fn start(pool: Arc<BufferPool>) -> PageCleaner {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = std::thread::Builder::new()
            .name("page-cleaner".to_string())
            .spawn(move || {
                let scratch_pool = BlockPool::new(PAGE_SIZE, SCRATCH_CHIPS);
                let mut scratch = BlockList::new(&scratch_pool);
                loop {
                    match stop_rx.recv_timeout(CLEANER_INTERVAL) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            if let Err(e) = clean_round(&pool, &mut scratch) {
                                warn!("cleaner round failed: {}", e);
                            }
                        }
                    }
                }
            })
            .unwrap();
        PageCleaner {
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop_tx.send(()).ok();
        if let Some(h) = self.handle.take() {
            h.join().ok();
        }
    }
}

impl Drop for PageCleaner {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CopiedPage {
    pid: PageId,
    idx: usize,
    lsn: Lsn,
    chip: Chip,
}

impl CopiedPage {
    fn image(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.chip.ptr, PAGE_SIZE) }
    }

    fn image_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.chip.ptr, PAGE_SIZE) }
    }
}

pub fn clean_round(pool: &Arc<BufferPool>, scratch: &mut BlockList<'_>) -> DbResult {
    let mut dirty = pool.dirty_frames();
    if dirty.is_empty() {
        return Ok(());
    }
    dirty.sort_by_key(|(pid, _)| *pid);

    // copy phase: S latch, snapshot into a scratch chip, release
    let mut copies: Vec<CopiedPage> = Vec::new();
    for (pid, idx) in dirty {
        let cb = pool.cb(idx);
        let ticket = match cb.latch.try_acquire_s() {
            Some(t) => t,
            None => continue, // contended; next round
        };
        if cb.pid() != pid || !cb.is_dirty() {
            cb.latch.release_s(ticket);
            continue;
        }
        let copied = CopiedPage {
            pid,
            idx,
            lsn: Lsn::NULL,
            chip: scratch.acquire(),
        };
        copied.image_mut().copy_from_slice(pool.page_bytes(idx));
        cb.latch.release_s(ticket);

        // swizzled pointers never reach disk
        let mut page = PageData::from_bytes(copied.image());
        pool.normalize_copy(&mut page);
        page.update_checksum();
        copied.image_mut().copy_from_slice(page.bytes());
        copies.push(CopiedPage {
            lsn: page.page_lsn(),
            ..copied
        });
    }
    if copies.is_empty() {
        return Ok(());
    }

    // WAL: the log must cover the newest copied image before any write
    let max_lsn = copies.iter().map(|c| c.lsn).max().unwrap();
    pool.log_manager().flush(max_lsn)?;

    // write phase: one call per contiguous run
    let mut runs = 0;
    for (_, run) in &copies
        .iter()
        .enumerate()
        .group_by(|(i, c)| c.pid as i64 - *i as i64)
    {
        let run: Vec<&CopiedPage> = run.map(|(_, c)| c).collect();
        let first = run[0].pid;
        let mut buf = Vec::with_capacity(run.len() * PAGE_SIZE);
        for c in &run {
            buf.extend_from_slice(c.image());
        }
        pool.volume().write_pages(first, &buf)?;
        runs += 1;
    }
    pool.volume().sync()?;
    debug!("cleaner wrote {} pages in {} runs", copies.len(), runs);

    // confirm phase: clear dirty where the image is still current
    for c in &copies {
        let cb = pool.cb(c.idx);
        let ticket = match cb.latch.try_acquire_x() {
            Some(t) => t,
            None => continue,
        };
        if cb.pid() == c.pid {
            if pool.page_lsn_of(c.idx) == c.lsn {
                cb.clear_dirty();
            } else {
                // re-dirtied during the write; updates up to the written
                // image are durable, so the recovery LSN may advance
                cb.set_rec_lsn(c.lsn);
            }
        }
        cb.latch.release_x(ticket);
    }
    for c in copies {
        c.chip.release();
    }
    Ok(())
}
