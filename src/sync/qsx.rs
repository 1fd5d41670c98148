//! QSX latch: a reader-writer latch with an optimistic third mode.
//!
//! One 64-bit counter packs everything: bits 0..31 count readers, bit 31 is
//! the writer-present bit, and the upper 32 bits advance once per exclusive
//! acquire/release pair (adding the writer increment twice carries into the
//! epoch). A Q ticket is simply a snapshot of the counter; it validates iff
//! the counter has not changed and no writer was present at snapshot time.

use std::sync::atomic::{fence, AtomicU64, Ordering};

use crossbeam::utils::Backoff;

const MIN_WRITER: u64 = 1 << 31;
const WLOCK_MASK: u64 = 2 * MIN_WRITER - 1;
const RLOCK_MASK: u64 = MIN_WRITER - 1;

/// Counter snapshot returned by every acquire. Zero is never a valid ticket.
pub type Ticket = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Q,
    S,
    X,
}

pub struct QsxLatch {
    rwcount: AtomicU64,
}

impl QsxLatch {
    pub fn new() -> Self {
        // start the epoch at 2; 0 is reserved as the invalid ticket
        Self {
            rwcount: AtomicU64::new(2 * MIN_WRITER),
        }
    }

    pub fn acquire_x(&self) -> Ticket {
        let backoff = Backoff::new();
        loop {
            if let Some(t) = self.try_acquire_x() {
                return t;
            }
            backoff.snooze();
        }
    }

    pub fn try_acquire_x(&self) -> Option<Ticket> {
        let seq0 = self.rwcount.load(Ordering::Relaxed);
        if seq0 & WLOCK_MASK != 0 {
            // readers present or writer present
            return None;
        }
        self.rwcount
            .compare_exchange(seq0, seq0 + MIN_WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| seq0 + MIN_WRITER)
    }

    pub fn release_x(&self, _ticket: Ticket) {
        // clears the writer bit via carry and bumps the epoch
        self.rwcount.fetch_add(MIN_WRITER, Ordering::Release);
    }

    pub fn acquire_s(&self) -> Ticket {
        let backoff = Backoff::new();
        loop {
            if let Some(t) = self.try_acquire_s() {
                return t;
            }
            backoff.snooze();
        }
    }

    pub fn try_acquire_s(&self) -> Option<Ticket> {
        let seq0 = self.rwcount.fetch_add(1, Ordering::AcqRel);
        if seq0 & MIN_WRITER != 0 {
            self.rwcount.fetch_sub(1, Ordering::Release);
            None
        } else {
            Some(seq0 + 1)
        }
    }

    pub fn release_s(&self, _ticket: Ticket) {
        self.rwcount.fetch_sub(1, Ordering::Release);
    }

    /// Optimistic acquire: a pure snapshot, no mutation.
    pub fn acquire_q(&self) -> Ticket {
        self.rwcount.load(Ordering::Acquire)
    }

    /// Succeeds iff no exclusive acquire or release happened since the
    /// snapshot and no writer was in progress when it was taken.
    pub fn release_q(&self, ticket: Ticket) -> bool {
        fence(Ordering::Acquire);
        ticket & MIN_WRITER == 0 && self.rwcount.load(Ordering::Relaxed) == ticket
    }

    /// Re-validate an old Q ticket: true iff the counter still equals it.
    pub fn reacquire_q(&self, ticket: Ticket) -> bool {
        ticket & MIN_WRITER == 0 && self.acquire_q() == ticket
    }

    /// Q -> S. May refuse; the caller falls back to a fresh acquire.
    pub fn try_upgrade_qs(&self, ticket: Ticket) -> Option<Ticket> {
        if ticket & MIN_WRITER != 0 {
            return None;
        }
        self.rwcount
            .compare_exchange(ticket, ticket + 1, Ordering::AcqRel, Ordering::Relaxed)
            .ok()
            .map(|_| ticket + 1)
    }

    /// Q -> X. Succeeds only when the counter is exactly the snapshot with
    /// no readers and no writer.
    pub fn try_upgrade_qx(&self, ticket: Ticket) -> Option<Ticket> {
        if ticket & WLOCK_MASK != 0 {
            return None;
        }
        self.rwcount
            .compare_exchange(
                ticket,
                ticket + MIN_WRITER,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| ticket + MIN_WRITER)
    }

    /// S -> X. Claims the writer bit first (which shuts out new readers),
    /// then waits for the other readers to drain and retires its own
    /// reader count in the final step.
    pub fn try_upgrade_sx(&self, _ticket: Ticket) -> Option<Ticket> {
        let seq0 = self.rwcount.load(Ordering::Relaxed);
        if seq0 & MIN_WRITER != 0 {
            return None;
        }
        let readers = seq0 & RLOCK_MASK;
        debug_assert!(readers >= 1, "upgrader must hold an S ticket");
        if self
            .rwcount
            .compare_exchange(seq0, seq0 + MIN_WRITER, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // another upgrader is ahead of us
            return None;
        }
        // the counter reaches this value when we are the only reader left
        let sole = seq0 + MIN_WRITER - (readers - 1);
        let backoff = Backoff::new();
        loop {
            if self
                .rwcount
                .compare_exchange(sole, sole - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(sole - 1);
            }
            backoff.snooze();
        }
    }

    /// Conditional S -> X: succeeds only when the caller is the sole
    /// reader and no writer is present, in one CAS. Never blocks; callers
    /// fall back to a retry from a safe point.
    pub fn try_upgrade_sx_cond(&self, _ticket: Ticket) -> Option<Ticket> {
        let seq0 = self.rwcount.load(Ordering::Relaxed);
        if seq0 & MIN_WRITER != 0 || seq0 & RLOCK_MASK != 1 {
            return None;
        }
        self.rwcount
            .compare_exchange(
                seq0,
                seq0 + MIN_WRITER - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .ok()
            .map(|_| seq0 + MIN_WRITER - 1)
    }

    /// X -> S: clears the writer bit (bumping the epoch) and registers one
    /// reader in the same atomic step.
    pub fn downgrade_xs(&self, _ticket: Ticket) -> Ticket {
        self.rwcount.fetch_add(MIN_WRITER + 1, Ordering::AcqRel) + MIN_WRITER + 1
    }

    /// X -> Q: release exclusive and snapshot in one step.
    pub fn downgrade_xq(&self, _ticket: Ticket) -> Ticket {
        self.rwcount.fetch_add(MIN_WRITER, Ordering::AcqRel) + MIN_WRITER
    }

    /// S -> Q: drop the reader count and snapshot.
    pub fn downgrade_sq(&self, _ticket: Ticket) -> Ticket {
        self.rwcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn is_write_locked(&self) -> bool {
        self.rwcount.load(Ordering::Relaxed) & MIN_WRITER != 0
    }

    pub fn reader_count(&self) -> u64 {
        self.rwcount.load(Ordering::Relaxed) & RLOCK_MASK
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_x_excludes_x() {
        let l = QsxLatch::new();
        let t = l.try_acquire_x().unwrap();
        assert!(l.try_acquire_x().is_none());
        assert!(l.try_acquire_s().is_none());
        l.release_x(t);
        assert!(l.try_acquire_x().is_some());
    }

    #[test]
    fn test_s_shared() {
        let l = QsxLatch::new();
        let t1 = l.try_acquire_s().unwrap();
        let t2 = l.try_acquire_s().unwrap();
        assert_eq!(l.reader_count(), 2);
        assert!(l.try_acquire_x().is_none());
        l.release_s(t1);
        l.release_s(t2);
        assert!(l.try_acquire_x().is_some());
    }

    #[test]
    fn test_q_validation() {
        let l = QsxLatch::new();
        let q = l.acquire_q();
        assert!(l.release_q(q));

        let q = l.acquire_q();
        let x = l.acquire_x();
        l.release_x(x);
        // an X acquire+release advanced the epoch; the snapshot is stale
        assert!(!l.release_q(q));
        assert!(!l.reacquire_q(q));
    }

    #[test]
    fn test_q_sees_readers() {
        let l = QsxLatch::new();
        let s = l.acquire_s();
        let q = l.acquire_q();
        // readers do not invalidate a Q ticket
        assert!(l.release_q(q));
        l.release_s(s);
    }

    #[test]
    fn test_upgrade_sx() {
        let l = QsxLatch::new();
        let s = l.try_acquire_s().unwrap();
        let x = l.try_upgrade_sx(s).unwrap();
        assert!(l.is_write_locked());
        assert_eq!(l.reader_count(), 0);
        l.release_x(x);
        assert!(!l.is_write_locked());
    }

    #[test]
    fn test_upgrade_sx_waits_for_other_readers() {
        let l = Arc::new(QsxLatch::new());
        let s_other = l.try_acquire_s().unwrap();
        let s_mine = l.try_acquire_s().unwrap();

        let l2 = Arc::clone(&l);
        let upgrader = std::thread::spawn(move || {
            // blocks until the other reader releases
            l2.try_upgrade_sx(s_mine).unwrap()
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        // a second upgrader is refused while the first holds the claim
        assert!(l.try_acquire_x().is_none());
        l.release_s(s_other);
        let x = upgrader.join().unwrap();
        assert!(l.is_write_locked());
        l.release_x(x);
    }

    #[test]
    fn test_upgrade_sx_cond_fails_with_other_readers() {
        let l = QsxLatch::new();
        let s1 = l.try_acquire_s().unwrap();
        let s2 = l.try_acquire_s().unwrap();
        assert!(l.try_upgrade_sx_cond(s1).is_none());
        l.release_s(s2);
        let x = l.try_upgrade_sx_cond(s1).unwrap();
        assert!(l.is_write_locked());
        assert_eq!(l.reader_count(), 0);
        l.release_x(x);
    }

    #[test]
    fn test_upgrade_qx_only_when_unchanged() {
        let l = QsxLatch::new();
        let q = l.acquire_q();
        let x = l.try_upgrade_qx(q).unwrap();
        l.release_x(x);

        let q = l.acquire_q();
        let x = l.acquire_x();
        l.release_x(x);
        assert!(l.try_upgrade_qx(q).is_none());
    }

    #[test]
    fn test_downgrade_xs() {
        let l = QsxLatch::new();
        let x = l.acquire_x();
        let s = l.downgrade_xs(x);
        assert!(!l.is_write_locked());
        assert_eq!(l.reader_count(), 1);
        l.release_s(s);
        assert_eq!(l.reader_count(), 0);
    }

    #[test]
    fn test_contended_counter() {
        let l = Arc::new(QsxLatch::new());
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let l = Arc::clone(&l);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let t = l.acquire_x();
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                        l.release_x(t);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
