//! Lock-free ordered list.
//!
//! Entries are sorted by a 64-bit key. An entry whose next-pointer is marked
//! is logically deleted; `find` helps unlink such entries as it walks.
//! Physically unlinked entries are kept on a retire chain until the list is
//! dropped, so readers racing past an unlink never touch freed memory.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

use super::markable::MarkablePointer;

pub struct Entry<V> {
    pub key: u64,
    pub value: V,
    next: MarkablePointer<Entry<V>>,

    /// Retire chain link, written once at unlink time.
    retired: AtomicUsize,
}

struct Window<V> {
    pred: *mut Entry<V>,
    curr: *mut Entry<V>,
}

pub struct LockFreeList<V> {
    /// Sentinel with key 0; real keys must be nonzero.
    head: *mut Entry<V>,

    /// Singly-linked chain of unlinked entries, reclaimed on drop.
    retire_chain: AtomicUsize,
}

unsafe impl<V: Send> Send for LockFreeList<V> {}
unsafe impl<V: Send + Sync> Sync for LockFreeList<V> {}

impl<V> LockFreeList<V> {
    pub fn new() -> Self
    where
        V: Default,
    {
        let head = Box::into_raw(Box::new(Entry {
            key: 0,
            value: V::default(),
            next: MarkablePointer::null(),
            retired: AtomicUsize::new(0),
        }));
        Self {
            head,
            retire_chain: AtomicUsize::new(0),
        }
    }

    /// Walk from the head to the first entry with `key >= target`, helping
    /// to unlink marked entries on the way. Returns the (pred, curr) window;
    /// `curr` may be null at the list end.
    fn find(&self, key: u64) -> Window<V> {
        let backoff = Backoff::new();
        'retry: loop {
            let mut pred = self.head;
            let (mut curr, _) = unsafe { &(*pred).next }.load();
            loop {
                if curr.is_null() {
                    return Window { pred, curr };
                }
                let (succ, marked) = unsafe { &(*curr).next }.load();
                if marked {
                    // curr is logically deleted; try to unlink it
                    if !unsafe { &(*pred).next }.atomic_cas(curr, succ, false, false) {
                        backoff.spin();
                        continue 'retry;
                    }
                    self.retire(curr);
                    curr = succ;
                    continue;
                }
                if unsafe { (*curr).key } >= key {
                    return Window { pred, curr };
                }
                pred = curr;
                curr = succ;
            }
        }
    }

    fn retire(&self, entry: *mut Entry<V>) {
        let backoff = Backoff::new();
        loop {
            let top = self.retire_chain.load(Ordering::Acquire);
            unsafe { (*entry).retired.store(top, Ordering::Relaxed) };
            if self
                .retire_chain
                .compare_exchange(top, entry as usize, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
            backoff.spin();
        }
    }

    /// Insert; returns false if the key is already present.
    pub fn insert(&self, key: u64, value: V) -> bool {
        debug_assert!(key != 0);
        let node = Box::into_raw(Box::new(Entry {
            key,
            value,
            next: MarkablePointer::null(),
            retired: AtomicUsize::new(0),
        }));
        let backoff = Backoff::new();
        loop {
            let w = self.find(key);
            if !w.curr.is_null() && unsafe { (*w.curr).key } == key {
                unsafe {
                    drop(Box::from_raw(node));
                }
                return false;
            }
            unsafe { (*node).next = MarkablePointer::new(w.curr, false) };
            if unsafe { &(*w.pred).next }.atomic_cas(w.curr, node, false, false) {
                return true;
            }
            backoff.spin();
        }
    }

    /// Look up `key`, inserting `make()` if absent. Returns a reference to
    /// the entry that ended up in the list, which stays valid for the life
    /// of the list (entries are never freed before drop).
    pub fn get_or_add(&self, key: u64, make: impl Fn() -> V) -> &Entry<V> {
        debug_assert!(key != 0);
        let backoff = Backoff::new();
        let mut node: *mut Entry<V> = std::ptr::null_mut();
        loop {
            let w = self.find(key);
            if !w.curr.is_null() && unsafe { (*w.curr).key } == key {
                if !node.is_null() {
                    unsafe {
                        drop(Box::from_raw(node));
                    }
                }
                return unsafe { &*w.curr };
            }
            if node.is_null() {
                node = Box::into_raw(Box::new(Entry {
                    key,
                    value: make(),
                    next: MarkablePointer::null(),
                    retired: AtomicUsize::new(0),
                }));
            }
            unsafe { (*node).next = MarkablePointer::new(w.curr, false) };
            if unsafe { &(*w.pred).next }.atomic_cas(w.curr, node, false, false) {
                return unsafe { &*node };
            }
            backoff.spin();
        }
    }

    /// Mark the entry deleted, then best-effort unlink it.
    pub fn remove(&self, key: u64) -> bool {
        let backoff = Backoff::new();
        loop {
            let w = self.find(key);
            if w.curr.is_null() || unsafe { (*w.curr).key } != key {
                return false;
            }
            let (succ, marked) = unsafe { &(*w.curr).next }.load();
            if marked {
                return false;
            }
            if !unsafe { &(*w.curr).next }.atomic_cas(succ, succ, false, true) {
                backoff.spin();
                continue;
            }
            // logical delete done; physical unlink is best effort
            if unsafe { &(*w.pred).next }.atomic_cas(w.curr, succ, false, false) {
                self.retire(w.curr);
            }
            return true;
        }
    }

    /// Wait-free membership test: walks without helping.
    pub fn contains(&self, key: u64) -> bool {
        let (mut curr, _) = unsafe { &(*self.head).next }.load();
        while !curr.is_null() {
            let k = unsafe { (*curr).key };
            if k > key {
                return false;
            }
            let (succ, marked) = unsafe { &(*curr).next }.load();
            if k == key {
                return !marked;
            }
            curr = succ;
        }
        false
    }

    pub fn get(&self, key: u64) -> Option<&Entry<V>> {
        let (mut curr, _) = unsafe { &(*self.head).next }.load();
        while !curr.is_null() {
            let k = unsafe { (*curr).key };
            if k > key {
                return None;
            }
            let (succ, marked) = unsafe { &(*curr).next }.load();
            if k == key {
                return if marked { None } else { Some(unsafe { &*curr }) };
            }
            curr = succ;
        }
        None
    }

    /// Snapshot of live keys in order.
    pub fn keys(&self) -> Vec<u64> {
        let mut out = Vec::new();
        let (mut curr, _) = unsafe { &(*self.head).next }.load();
        while !curr.is_null() {
            let (succ, marked) = unsafe { &(*curr).next }.load();
            if !marked {
                out.push(unsafe { (*curr).key });
            }
            curr = succ;
        }
        out
    }
}

impl<V> Drop for LockFreeList<V> {
    fn drop(&mut self) {
        let (mut curr, _) = unsafe { &(*self.head).next }.load();
        while !curr.is_null() {
            let (succ, _) = unsafe { &(*curr).next }.load();
            unsafe {
                drop(Box::from_raw(curr));
            }
            curr = succ;
        }
        let mut top = self.retire_chain.load(Ordering::Relaxed) as *mut Entry<V>;
        while !top.is_null() {
            let next = unsafe { (*top).retired.load(Ordering::Relaxed) } as *mut Entry<V>;
            unsafe {
                drop(Box::from_raw(top));
            }
            top = next;
        }
        unsafe {
            drop(Box::from_raw(self.head));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::LockFreeList;

    #[test]
    fn test_insert_contains_remove() {
        let list: LockFreeList<u32> = LockFreeList::new();
        assert!(list.insert(10, 100));
        assert!(list.insert(5, 50));
        assert!(list.insert(20, 200));
        assert!(!list.insert(10, 999));

        assert!(list.contains(5));
        assert!(list.contains(10));
        assert!(!list.contains(15));
        assert_eq!(list.keys(), vec![5, 10, 20]);

        assert!(list.remove(10));
        assert!(!list.remove(10));
        assert!(!list.contains(10));
        assert_eq!(list.keys(), vec![5, 20]);
    }

    #[test]
    fn test_get_or_add() {
        let list: LockFreeList<u32> = LockFreeList::new();
        let e = list.get_or_add(7, || 70);
        assert_eq!(e.value, 70);
        // second call must find the first entry, not replace it
        let e2 = list.get_or_add(7, || 71);
        assert_eq!(e2.value, 70);
        assert_eq!(list.keys(), vec![7]);
    }

    #[test]
    fn test_concurrent_get_or_add_single_winner() {
        let list: Arc<LockFreeList<u64>> = Arc::new(LockFreeList::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let list = Arc::clone(&list);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    for k in 1..=100u64 {
                        seen.push(list.get_or_add(k, || t).value);
                    }
                    seen
                })
            })
            .collect();
        let results: Vec<Vec<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // all threads must agree on the winning value per key
        for k in 0..100usize {
            let first = results[0][k];
            for r in &results {
                assert_eq!(r[k], first);
            }
        }
        assert_eq!(list.keys().len(), 100);
    }
}
