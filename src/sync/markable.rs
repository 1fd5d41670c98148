//! Bit-stealing pointers for the lock-free containers.
//!
//! Pointers to sized structs are at least 8-byte aligned, so the low bit is
//! always zero and can carry a flag; the whole (pointer, flag) pair then fits
//! one 8-byte atomic word. The queue additionally stamps its pointers with a
//! 16-bit counter in the (unused) top bits of the address to defeat ABA.

use std::{
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

const MARK_ON: u64 = 0x0000_0000_0000_0001;
const POINTER_MASK: u64 = 0xFFFF_FFFF_FFFF_FFFE;

/// An atomic (pointer, bool) pair in one 64-bit word.
pub struct MarkablePointer<T> {
    word: AtomicU64,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for MarkablePointer<T> {}
unsafe impl<T> Sync for MarkablePointer<T> {}

impl<T> MarkablePointer<T> {
    pub fn null() -> Self {
        Self {
            word: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    pub fn new(ptr: *mut T, mark: bool) -> Self {
        Self {
            word: AtomicU64::new(Self::combine(ptr, mark)),
            _marker: PhantomData,
        }
    }

    fn combine(ptr: *mut T, mark: bool) -> u64 {
        ptr as u64 | if mark { MARK_ON } else { 0 }
    }

    pub fn load(&self) -> (*mut T, bool) {
        let w = self.word.load(Ordering::Acquire);
        ((w & POINTER_MASK) as *mut T, w & MARK_ON != 0)
    }

    pub fn get_pointer(&self) -> *mut T {
        self.load().0
    }

    pub fn is_marked(&self) -> bool {
        self.load().1
    }

    pub fn is_null(&self) -> bool {
        self.get_pointer().is_null()
    }

    /// Non-atomic read-modify-write of the flag; only safe while this word
    /// is not shared yet.
    pub fn mark(&self) {
        let w = self.word.load(Ordering::Relaxed);
        self.word.store(w | MARK_ON, Ordering::Relaxed);
    }

    /// Compare-and-set on the (pointer, mark) pair.
    pub fn atomic_cas(
        &self,
        expected_ptr: *mut T,
        new_ptr: *mut T,
        expected_mark: bool,
        new_mark: bool,
    ) -> bool {
        let expected = Self::combine(expected_ptr, expected_mark);
        let new = Self::combine(new_ptr, new_mark);
        self.word
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Unconditional swap; returns the old (pointer, mark).
    pub fn atomic_swap(&self, new_ptr: *mut T, new_mark: bool) -> (*mut T, bool) {
        let old = self.word.swap(Self::combine(new_ptr, new_mark), Ordering::AcqRel);
        ((old & POINTER_MASK) as *mut T, old & MARK_ON != 0)
    }
}

const STAMP_SHIFT: u32 = 48;
const ADDR_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

/// An atomic (pointer, 16-bit counter) pair. The counter advances on every
/// successful CAS so that a pointer recycled through the node pool never
/// matches a stale expectation.
pub struct StampedPointer<T> {
    word: AtomicU64,
    _marker: PhantomData<*mut T>,
}

unsafe impl<T> Send for StampedPointer<T> {}
unsafe impl<T> Sync for StampedPointer<T> {}

impl<T> StampedPointer<T> {
    pub fn null() -> Self {
        Self {
            word: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    pub fn new(ptr: *mut T) -> Self {
        Self {
            word: AtomicU64::new(Self::pack(ptr, 0)),
            _marker: PhantomData,
        }
    }

    fn pack(ptr: *mut T, stamp: u16) -> u64 {
        (ptr as u64 & ADDR_MASK) | ((stamp as u64) << STAMP_SHIFT)
    }

    pub fn load(&self) -> (*mut T, u16) {
        let w = self.word.load(Ordering::Acquire);
        ((w & ADDR_MASK) as *mut T, (w >> STAMP_SHIFT) as u16)
    }

    pub fn cas(&self, exp_ptr: *mut T, exp_stamp: u16, new_ptr: *mut T) -> bool {
        let expected = Self::pack(exp_ptr, exp_stamp);
        let new = Self::pack(new_ptr, exp_stamp.wrapping_add(1));
        self.word
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn store(&self, ptr: *mut T) {
        let (_, stamp) = self.load();
        self.word
            .store(Self::pack(ptr, stamp.wrapping_add(1)), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_and_cas() {
        let mut x = 7u64;
        let p = MarkablePointer::new(&mut x as *mut u64, false);
        assert!(!p.is_marked());
        assert!(!p.is_null());

        assert!(p.atomic_cas(&mut x as *mut u64, &mut x as *mut u64, false, true));
        assert!(p.is_marked());
        assert_eq!(p.get_pointer(), &mut x as *mut u64);

        // stale expectation fails
        assert!(!p.atomic_cas(&mut x as *mut u64, std::ptr::null_mut(), false, false));
    }

    #[test]
    fn test_swap() {
        let mut a = 1u64;
        let mut b = 2u64;
        let p = MarkablePointer::new(&mut a as *mut u64, true);
        let (old, old_mark) = p.atomic_swap(&mut b as *mut u64, false);
        assert_eq!(old, &mut a as *mut u64);
        assert!(old_mark);
        assert_eq!(p.get_pointer(), &mut b as *mut u64);
    }

    #[test]
    fn test_stamp_advances() {
        let mut x = 3u64;
        let p = StampedPointer::<u64>::null();
        let (ptr, stamp) = p.load();
        assert!(ptr.is_null());
        assert!(p.cas(ptr, stamp, &mut x as *mut u64));
        let (_, stamp2) = p.load();
        assert_eq!(stamp2, stamp.wrapping_add(1));
        // a CAS with the old stamp must fail even with the right pointer
        assert!(!p.cas(&mut x as *mut u64, stamp, std::ptr::null_mut()));
    }
}
