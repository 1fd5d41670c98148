//! Bitmap chip allocator.
//!
//! A block is one aligned allocation holding up to 64 fixed-size chips and
//! two bitmaps. The `usable` map is written only by the owning thread; the
//! `zombie` map collects releases from any thread via atomic OR. A chip is
//! in one of three states: usable, in-use, or zombie (freed since the last
//! recycling pass).

use std::{
    alloc::{alloc, dealloc, Layout},
    sync::atomic::{AtomicU64, Ordering},
};

pub const MAX_CHIPS: usize = 64;

pub struct Block {
    /// Bits set here are available for allocation. Owner-only writes.
    usable: AtomicU64,

    /// Bits set here were released since the last recycle. Any thread may
    /// OR bits in.
    zombie: AtomicU64,

    chip_size: usize,
    chip_count: usize,

    data: *mut u8,
    layout: Layout,
}

unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Block {
    pub fn new(chip_size: usize, chip_count: usize) -> Box<Block> {
        assert!(chip_count >= 1 && chip_count <= MAX_CHIPS);
        assert!(chip_size >= 8 && chip_size % 8 == 0);
        let layout = Layout::from_size_align(chip_size * chip_count, 8).unwrap();
        let data = unsafe { alloc(layout) };
        assert!(!data.is_null());
        let full = if chip_count == 64 {
            u64::MAX
        } else {
            (1u64 << chip_count) - 1
        };
        Box::new(Block {
            usable: AtomicU64::new(full),
            zombie: AtomicU64::new(0),
            chip_size,
            chip_count,
            data,
            layout,
        })
    }

    pub fn chip_count(&self) -> usize {
        self.chip_count
    }

    pub fn chip_size(&self) -> usize {
        self.chip_size
    }

    /// Pop the lowest usable bit. Owner-only.
    pub fn acquire(&self) -> Option<*mut u8> {
        let usable = self.usable.load(Ordering::Relaxed);
        if usable == 0 {
            return None;
        }
        let idx = usable.trailing_zeros() as usize;
        self.usable
            .store(usable & !(1u64 << idx), Ordering::Relaxed);
        Some(unsafe { self.data.add(idx * self.chip_size) })
    }

    /// Release a chip from any thread. Returns true iff the chip was
    /// actually in use (not usable and not already zombie).
    pub fn release(&self, chip: *mut u8) -> bool {
        let idx = self.chip_index(chip);
        let bit = 1u64 << idx;
        if self.usable.load(Ordering::Relaxed) & bit != 0 {
            return false;
        }
        let old = self.zombie.fetch_or(bit, Ordering::AcqRel);
        old & bit == 0
    }

    /// Move the zombie bits back to usable. Owner-only. The XOR is safe
    /// against racing releases: a bit OR'd in after our read is untouched
    /// because we only XOR out the bits we observed.
    pub fn recycle(&self) -> u32 {
        let z = self.zombie.load(Ordering::Acquire);
        if z == 0 {
            return 0;
        }
        let usable = self.usable.load(Ordering::Relaxed);
        self.usable.store(usable | z, Ordering::Relaxed);
        self.zombie.fetch_xor(z, Ordering::AcqRel);
        z.count_ones()
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.data as usize;
        let p = ptr as usize;
        p >= base && p < base + self.chip_size * self.chip_count
    }

    fn chip_index(&self, ptr: *const u8) -> usize {
        debug_assert!(self.contains(ptr));
        let off = ptr as usize - self.data as usize;
        debug_assert_eq!(off % self.chip_size, 0);
        off / self.chip_size
    }

    pub fn usable_count(&self) -> u32 {
        self.usable.load(Ordering::Relaxed).count_ones()
    }

    pub fn in_use_count(&self) -> u32 {
        self.chip_count as u32
            - self.usable.load(Ordering::Relaxed).count_ones()
            - self.zombie.load(Ordering::Relaxed).count_ones()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { dealloc(self.data, self.layout) };
    }
}
