//! Block pool and per-thread block lists.
//!
//! The pool hands out whole blocks through a lock-free queue and can
//! validate that a chip pointer belongs to one of its blocks. Each thread
//! allocates from its own `BlockList`, a small ring of blocks; the list
//! grows when a full round of the ring served fewer than half its chips and
//! shrinks by returning nearly-empty blocks to the pool.

use std::sync::Mutex;

use log::debug;

use super::block::Block;
use crate::sync::LockFreeQueue;

/// A chip handle carries its owning block so that release from any thread
/// is O(1).
#[derive(Clone, Copy)]
pub struct Chip {
    pub ptr: *mut u8,
    block: *const Block,
}

unsafe impl Send for Chip {}

impl Chip {
    pub fn release(self) -> bool {
        unsafe { (*self.block).release(self.ptr) }
    }
}

pub struct BlockPool {
    chip_size: usize,
    chip_count: usize,

    free: LockFreeQueue<usize>,

    /// Every block ever created, for pointer validation and reclamation.
    all: Mutex<Vec<*mut Block>>,
}

unsafe impl Send for BlockPool {}
unsafe impl Sync for BlockPool {}

impl BlockPool {
    pub fn new(chip_size: usize, chip_count: usize) -> Self {
        Self {
            chip_size,
            chip_count,
            free: LockFreeQueue::new(),
            all: Mutex::new(Vec::new()),
        }
    }

    pub fn acquire_block(&self) -> *mut Block {
        if let Some(raw) = self.free.dequeue() {
            return raw as *mut Block;
        }
        let block = Box::into_raw(Block::new(self.chip_size, self.chip_count));
        self.all.lock().unwrap().push(block);
        block
    }

    pub fn release_block(&self, block: *mut Block) {
        self.free.enqueue(block as usize);
    }

    /// True iff `ptr` lies inside a block owned by this pool.
    pub fn validate(&self, ptr: *const u8) -> bool {
        self.all
            .lock()
            .unwrap()
            .iter()
            .any(|b| unsafe { (**b).contains(ptr) })
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        while self.free.dequeue().is_some() {}
        for b in self.all.lock().unwrap().drain(..) {
            unsafe {
                drop(Box::from_raw(b));
            }
        }
    }
}

pub struct BlockList<'a> {
    pool: &'a BlockPool,

    /// Ring of blocks; the last entry is the current allocation target.
    ring: Vec<*mut Block>,

    /// Chips served since the last adaptation round.
    round_hits: u64,

    /// Blocks visited since the last adaptation round.
    advances: usize,
}

impl<'a> BlockList<'a> {
    pub fn new(pool: &'a BlockPool) -> Self {
        let first = pool.acquire_block();
        Self {
            pool,
            ring: vec![first],
            round_hits: 0,
            advances: 0,
        }
    }

    fn tail(&self) -> &Block {
        unsafe { &**self.ring.last().unwrap() }
    }

    pub fn acquire(&mut self) -> Chip {
        loop {
            if let Some(ptr) = self.tail().acquire() {
                self.round_hits += 1;
                return Chip {
                    ptr,
                    block: *self.ring.last().unwrap(),
                };
            }
            self.advance();
        }
    }

    /// Rotate to the next block, recycling its zombies, and adapt the ring
    /// size once per full round.
    fn advance(&mut self) {
        let tail = self.ring.pop().unwrap();
        self.ring.insert(0, tail);

        let next = *self.ring.last().unwrap();
        unsafe { (*next).recycle() };

        self.advances += 1;
        if self.advances >= self.ring.len() {
            // one full round: the average hit rate decides the direction
            let total_chips = (self.ring.len() * self.chip_count()) as u64;
            if self.round_hits < total_chips / 2 {
                let fresh = self.pool.acquire_block();
                debug!(
                    "block list grows to {} blocks (hits {} < {}/2)",
                    self.ring.len() + 1,
                    self.round_hits,
                    total_chips
                );
                self.ring.push(fresh);
            } else {
                self.shrink();
            }
            self.round_hits = 0;
            self.advances = 0;
        }
    }

    fn chip_count(&self) -> usize {
        self.tail().chip_count()
    }

    /// Return a run of nearly-empty blocks to the pool, keeping at least
    /// one block for ourselves.
    fn shrink(&mut self) {
        while self.ring.len() > 1 {
            let head = self.ring[0];
            let b = unsafe { &*head };
            b.recycle();
            if b.in_use_count() == 0 && b.usable_count() as usize == b.chip_count() {
                self.ring.remove(0);
                self.pool.release_block(head);
                debug!("block list shrinks to {} blocks", self.ring.len());
            } else {
                break;
            }
        }
    }
}

impl<'a> Drop for BlockList<'a> {
    fn drop(&mut self) {
        for b in self.ring.drain(..) {
            self.pool.release_block(b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_grows_under_pressure() {
        let pool = BlockPool::new(64, 8);
        let mut list = BlockList::new(&pool);
        let mut chips = Vec::new();
        // exhaust several blocks without releasing anything
        for _ in 0..64 {
            chips.push(list.acquire());
        }
        assert!(list.ring.len() > 1);
        for c in chips.drain(..) {
            assert!(c.release());
        }
    }

    #[test]
    fn test_release_and_reuse() {
        let pool = BlockPool::new(64, 8);
        let mut list = BlockList::new(&pool);
        for _ in 0..100 {
            let c = list.acquire();
            assert!(pool.validate(c.ptr));
            assert!(c.release());
        }
        // steady-state acquire/release must not grow the ring beyond a
        // couple of blocks
        assert!(list.ring.len() <= 2);
    }

    #[test]
    fn test_validate_rejects_foreign_pointer() {
        let pool = BlockPool::new(64, 8);
        let mut list = BlockList::new(&pool);
        let c = list.acquire();
        assert!(pool.validate(c.ptr));
        let foreign = Box::into_raw(Box::new(0u64)) as *const u8;
        assert!(!pool.validate(foreign));
        unsafe {
            drop(Box::from_raw(foreign as *mut u64));
        }
        c.release();
    }
}
