//! Michael–Scott lock-free FIFO queue.
//!
//! Head and tail are stamped pointers; a permanent sentinel node separates
//! producers from consumers. Dequeued nodes are retired to an internal
//! Treiber stack and reused by later enqueues, which is what the 16-bit
//! stamp protects: a recycled node can reappear at the same address, but
//! never with the same stamp.

use std::sync::atomic::{fence, AtomicIsize, Ordering};

use crossbeam::utils::Backoff;

use super::markable::StampedPointer;

struct Node<T> {
    value: Option<T>,
    next: StampedPointer<Node<T>>,
}

impl<T> Node<T> {
    fn boxed(value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            value,
            next: StampedPointer::null(),
        }))
    }
}

pub struct LockFreeQueue<T> {
    head: StampedPointer<Node<T>>,
    tail: StampedPointer<Node<T>>,

    /// Retired nodes available for reuse.
    free: StampedPointer<Node<T>>,

    /// Approximate element count. A hint, not an invariant: it may lag the
    /// true size while operations are in flight.
    approx_size: AtomicIsize,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> LockFreeQueue<T> {
    pub fn new() -> Self {
        let sentinel = Node::boxed(None);
        Self {
            head: StampedPointer::new(sentinel),
            tail: StampedPointer::new(sentinel),
            free: StampedPointer::null(),
            approx_size: AtomicIsize::new(0),
        }
    }

    fn alloc_node(&self, value: T) -> *mut Node<T> {
        // pop a retired node if we have one
        let backoff = Backoff::new();
        loop {
            let (top, stamp) = self.free.load();
            if top.is_null() {
                return Node::boxed(Some(value));
            }
            let (next, _) = unsafe { &(*top).next }.load();
            if self.free.cas(top, stamp, next) {
                unsafe {
                    (*top).value = Some(value);
                    (*top).next.store(std::ptr::null_mut());
                }
                return top;
            }
            backoff.spin();
        }
    }

    fn retire_node(&self, node: *mut Node<T>) {
        // The winning dequeuer moved the payload out with ptr::read; clear
        // the slot without dropping the stale bits.
        unsafe { std::ptr::write(&mut (*node).value, None) };
        let backoff = Backoff::new();
        loop {
            let (top, stamp) = self.free.load();
            unsafe { (*node).next.store(top) };
            if self.free.cas(top, stamp, node) {
                return;
            }
            backoff.spin();
        }
    }

    /// Linearizes at the CAS that links the new node behind the tail.
    pub fn enqueue(&self, value: T) {
        let node = self.alloc_node(value);
        let backoff = Backoff::new();
        loop {
            let (tail, tail_stamp) = self.tail.load();
            let (next, next_stamp) = unsafe { &(*tail).next }.load();
            // re-check that tail has not moved under us
            if (tail, tail_stamp) != self.tail.load() {
                continue;
            }
            if next.is_null() {
                if unsafe { &(*tail).next }.cas(next, next_stamp, node) {
                    // helping is allowed here: failure means someone else
                    // already advanced the tail for us
                    self.tail.cas(tail, tail_stamp, node);
                    self.approx_size.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            } else {
                // tail is lagging; help advance it
                self.tail.cas(tail, tail_stamp, next);
            }
            backoff.spin();
        }
    }

    /// Linearizes at the head CAS.
    pub fn dequeue(&self) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            let (head, head_stamp) = self.head.load();
            let (tail, tail_stamp) = self.tail.load();
            fence(Ordering::SeqCst);
            let (next, _) = unsafe { &(*head).next }.load();
            if (head, head_stamp) != self.head.load() {
                continue;
            }
            if head == tail {
                if next.is_null() {
                    return None;
                }
                // tail is lagging behind a half-finished enqueue
                self.tail.cas(tail, tail_stamp, next);
            } else {
                // read the payload before the CAS: once the head moves, this
                // node may be retired and reused by an enqueuer
                let value = unsafe { std::ptr::read(&(*next).value) };
                if self.head.cas(head, head_stamp, next) {
                    self.approx_size.fetch_sub(1, Ordering::Relaxed);
                    self.retire_node(head);
                    return value;
                }
                // lost the race; the winner owns the payload
                std::mem::forget(value);
            }
            backoff.spin();
        }
    }

    /// The maintained hint counter. May be stale.
    pub fn approximate_size(&self) -> isize {
        self.approx_size.load(Ordering::Relaxed)
    }

    /// Counts elements by walking the list with a fence per step. Still only
    /// a snapshot in the presence of concurrent updates.
    pub fn safe_size(&self) -> usize {
        let mut count = 0;
        let (mut cur, _) = self.head.load();
        loop {
            fence(Ordering::SeqCst);
            let (next, _) = unsafe { &(*cur).next }.load();
            if next.is_null() {
                return count;
            }
            count += 1;
            cur = next;
        }
    }

    pub fn is_empty(&self) -> bool {
        let (head, _) = self.head.load();
        let (next, _) = unsafe { &(*head).next }.load();
        next.is_null()
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
        let (sentinel, _) = self.head.load();
        unsafe {
            drop(Box::from_raw(sentinel));
        }
        let (mut top, _) = self.free.load();
        while !top.is_null() {
            let (next, _) = unsafe { &(*top).next }.load();
            unsafe {
                drop(Box::from_raw(top));
            }
            top = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::LockFreeQueue;

    #[test]
    fn test_fifo_order() {
        let q = LockFreeQueue::new();
        assert!(q.is_empty());
        for i in 0..100 {
            q.enqueue(i);
        }
        assert_eq!(q.safe_size(), 100);
        assert_eq!(q.approximate_size(), 100);
        for i in 0..100 {
            assert_eq!(q.dequeue(), Some(i));
        }
        assert_eq!(q.dequeue(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_node_reuse() {
        let q = LockFreeQueue::new();
        for round in 0..10 {
            for i in 0..64 {
                q.enqueue(round * 64 + i);
            }
            for i in 0..64 {
                assert_eq!(q.dequeue(), Some(round * 64 + i));
            }
        }
    }

    #[test]
    fn test_concurrent_enqueue_dequeue() {
        let q = Arc::new(LockFreeQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        q.enqueue(t * 1000 + i);
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while got.len() < 1000 {
                        if let Some(v) = q.dequeue() {
                            got.push(v);
                        }
                    }
                    got
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        let mut all: Vec<u64> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let expect: Vec<u64> = (0..4u64)
            .flat_map(|t| (0..1000u64).map(move |i| t * 1000 + i))
            .collect();
        assert_eq!(all, expect);
        assert!(q.is_empty());
    }
}
