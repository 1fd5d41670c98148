//! Cuckoo hash table mapping page id -> frame index.
//!
//! Two hash functions, four-slot buckets, packed 8-byte entries. Lookups
//! are lock-free; inserts, removes and displacement walks must be
//! serialized by the caller (the buffer pool's miss path already owns a
//! mutex there).

use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

use crate::{db_error, error::ErrorCode, types::DbResult, types::PageId};

const SLOTS_PER_BUCKET: usize = 4;
const MAX_DISPLACEMENTS: usize = 64;

fn pack(pid: PageId, frame: usize) -> u64 {
    ((pid as u64) << 32) | (frame as u64 + 1)
}

fn entry_pid(e: u64) -> PageId {
    (e >> 32) as PageId
}

fn entry_frame(e: u64) -> usize {
    (e as u32 as usize) - 1
}

pub struct PageTable {
    buckets: Vec<[AtomicU64; SLOTS_PER_BUCKET]>,
    mask: usize,
}

impl PageTable {
    pub fn new(frame_count: usize) -> Self {
        // keep the load factor low; cuckoo displacement is the rare path
        let mut n = 4;
        while n * SLOTS_PER_BUCKET < frame_count * 2 {
            n <<= 1;
        }
        let mut buckets = Vec::with_capacity(n);
        for _ in 0..n {
            buckets.push([
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ]);
        }
        Self {
            buckets,
            mask: n - 1,
        }
    }

    fn hash1(&self, pid: PageId) -> usize {
        (pid.wrapping_mul(0x9E37_79B1) as usize) & self.mask
    }

    fn hash2(&self, pid: PageId) -> usize {
        let h = pid.wrapping_mul(0x85EB_CA77) ^ pid.rotate_left(16);
        (h as usize) & self.mask
    }

    /// Lock-free: visits at most two buckets.
    pub fn lookup(&self, pid: PageId) -> Option<usize> {
        for &b in [self.hash1(pid), self.hash2(pid)].iter() {
            for slot in &self.buckets[b] {
                let e = slot.load(Ordering::Acquire);
                if e != 0 && entry_pid(e) == pid {
                    return Some(entry_frame(e));
                }
            }
        }
        None
    }

    /// Caller-serialized write.
    pub fn insert(&self, pid: PageId, frame: usize) -> DbResult {
        debug_assert!(self.lookup(pid).is_none());
        if self.try_place(pid, frame) {
            return Ok(());
        }
        // displacement walk: kick a random resident to its alternate bucket
        let mut rng = rand::thread_rng();
        let mut cur_pid = pid;
        let mut cur_frame = frame;
        let mut bucket = self.hash1(cur_pid);
        for _ in 0..MAX_DISPLACEMENTS {
            let victim_slot = rng.gen_range(0, SLOTS_PER_BUCKET);
            let victim = self.buckets[bucket][victim_slot].load(Ordering::Acquire);
            self.buckets[bucket][victim_slot].store(pack(cur_pid, cur_frame), Ordering::Release);
            if victim == 0 {
                return Ok(());
            }
            cur_pid = entry_pid(victim);
            cur_frame = entry_frame(victim);
            let (h1, h2) = (self.hash1(cur_pid), self.hash2(cur_pid));
            bucket = if bucket == h1 { h2 } else { h1 };
            if self.try_place_in(bucket, cur_pid, cur_frame) {
                return Ok(());
            }
        }
        Err(db_error!(
            ErrorCode::OutOfMemory,
            "page table displacement bound hit inserting page {}",
            pid
        ))
    }

    fn try_place(&self, pid: PageId, frame: usize) -> bool {
        self.try_place_in(self.hash1(pid), pid, frame)
            || self.try_place_in(self.hash2(pid), pid, frame)
    }

    fn try_place_in(&self, bucket: usize, pid: PageId, frame: usize) -> bool {
        for slot in &self.buckets[bucket] {
            if slot.load(Ordering::Acquire) == 0 {
                slot.store(pack(pid, frame), Ordering::Release);
                return true;
            }
        }
        false
    }

    /// Caller-serialized write.
    pub fn remove(&self, pid: PageId) -> Option<usize> {
        for &b in [self.hash1(pid), self.hash2(pid)].iter() {
            for slot in &self.buckets[b] {
                let e = slot.load(Ordering::Acquire);
                if e != 0 && entry_pid(e) == pid {
                    slot.store(0, Ordering::Release);
                    return Some(entry_frame(e));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::PageTable;

    #[test]
    fn test_insert_lookup_remove() {
        let t = PageTable::new(64);
        for pid in 1..=40u32 {
            t.insert(pid, pid as usize + 100).unwrap();
        }
        for pid in 1..=40u32 {
            assert_eq!(t.lookup(pid), Some(pid as usize + 100));
        }
        assert_eq!(t.lookup(999), None);
        assert_eq!(t.remove(17), Some(117));
        assert_eq!(t.lookup(17), None);
        assert_eq!(t.remove(17), None);
    }

    #[test]
    fn test_fill_to_capacity() {
        let t = PageTable::new(128);
        for pid in 1..=128u32 {
            t.insert(pid, pid as usize).unwrap();
        }
        for pid in 1..=128u32 {
            assert_eq!(t.lookup(pid), Some(pid as usize));
        }
    }
}
