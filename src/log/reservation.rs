//! Log space accounting.
//!
//! The recoverable capacity is the total partition budget minus one
//! partition held back for the largest possible checkpoint. Every
//! transaction reserves enough space to write its records and to undo them
//! later; reservations are returned at end-of-transaction and topped back
//! up when partitions are recycled.

use std::{
    sync::{Condvar, Mutex},
    time::Duration,
};

use log::warn;

use crate::{db_error, error::ErrorCode, log::lsn::Lsn, types::DbResult, types::TransactionId};

/// Multiplier covering the compensation records a rollback would write.
pub const UNDO_FUDGE_FACTOR: u64 = 2;

/// How long a reservation may wait for recycling before giving up.
const RESERVE_TIMEOUT: Duration = Duration::from_secs(5);

struct ResvState {
    available: i64,
    checkpoint_reserve: i64,
    checkpoint_target: i64,
}

pub struct LogReservations {
    state: Mutex<ResvState>,
    space_cond: Condvar,
}

impl LogReservations {
    pub fn new(total_capacity: i64, checkpoint_target: i64) -> Self {
        Self {
            state: Mutex::new(ResvState {
                available: total_capacity - checkpoint_target,
                checkpoint_reserve: checkpoint_target,
                checkpoint_target,
            }),
            space_cond: Condvar::new(),
        }
    }

    /// Reserve `bytes` for a transaction, blocking on the space-available
    /// condition. Fails with OutOfLogSpace rather than dip into the
    /// checkpoint reserve.
    pub fn reserve(&self, bytes: u64) -> DbResult {
        let mut state = self.state.lock().unwrap();
        let deadline = std::time::Instant::now() + RESERVE_TIMEOUT;
        while state.available < bytes as i64 {
            let now = std::time::Instant::now();
            if now >= deadline {
                warn!(
                    "log space reservation of {} bytes failed, {} available",
                    bytes, state.available
                );
                return Err(db_error!(
                    ErrorCode::OutOfLogSpace,
                    "cannot reserve {} bytes of log space",
                    bytes
                ));
            }
            let (s, _) = self
                .space_cond
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = s;
        }
        state.available -= bytes as i64;
        Ok(())
    }

    /// Return an unused (or now-undone) reservation.
    pub fn release(&self, bytes: u64) {
        let mut state = self.state.lock().unwrap();
        state.available += bytes as i64;
        self.space_cond.notify_all();
    }

    /// Bytes reclaimed by partition recycling first refill the checkpoint
    /// reserve, the rest becomes generally available.
    pub fn reclaim(&self, bytes: u64) {
        let mut state = self.state.lock().unwrap();
        let mut left = bytes as i64;
        let deficit = state.checkpoint_target - state.checkpoint_reserve;
        if deficit > 0 {
            let top_up = deficit.min(left);
            state.checkpoint_reserve += top_up;
            left -= top_up;
        }
        state.available += left;
        self.space_cond.notify_all();
    }

    /// Space for checkpoint-related records comes out of the dedicated
    /// reserve only.
    pub fn consume_checkpoint(&self, bytes: u64) -> DbResult {
        let mut state = self.state.lock().unwrap();
        if state.checkpoint_reserve < bytes as i64 {
            return Err(db_error!(
                ErrorCode::OutOfLogSpace,
                "checkpoint reserve exhausted"
            ));
        }
        state.checkpoint_reserve -= bytes as i64;
        Ok(())
    }

    pub fn available(&self) -> i64 {
        self.state.lock().unwrap().available
    }
}

/// Conservative lower bound on the first-LSN of any active transaction.
/// Transactions hash into a fixed bucket array; a bucket remembers the
/// minimum first-LSN of its current entrants and resets when they all
/// leave. Collisions can only make the bound lower (older), never unsafe.
pub struct PoorMansOldestLsnTracker {
    buckets: Vec<Mutex<TrackerBucket>>,
}

#[derive(Default)]
struct TrackerBucket {
    count: u32,
    min_lsn: Lsn,
}

impl PoorMansOldestLsnTracker {
    pub fn new(bucket_count: usize) -> Self {
        let mut buckets = Vec::with_capacity(bucket_count);
        for _ in 0..bucket_count {
            buckets.push(Mutex::new(TrackerBucket::default()));
        }
        Self { buckets }
    }

    fn bucket(&self, xct_id: TransactionId) -> &Mutex<TrackerBucket> {
        &self.buckets[xct_id as usize % self.buckets.len()]
    }

    /// Register a transaction's first LSN.
    pub fn enter(&self, xct_id: TransactionId, first_lsn: Lsn) {
        debug_assert!(!first_lsn.is_null());
        let mut b = self.bucket(xct_id).lock().unwrap();
        if b.count == 0 || first_lsn < b.min_lsn {
            b.min_lsn = first_lsn;
        }
        b.count += 1;
    }

    pub fn leave(&self, xct_id: TransactionId) {
        let mut b = self.bucket(xct_id).lock().unwrap();
        debug_assert!(b.count > 0);
        b.count -= 1;
        if b.count == 0 {
            b.min_lsn = Lsn::NULL;
        }
    }

    /// Null when no transaction is registered.
    pub fn oldest(&self) -> Lsn {
        let mut oldest = Lsn::NULL;
        for bucket in &self.buckets {
            let b = bucket.lock().unwrap();
            if b.count > 0 && (!b.min_lsn.is_null()) && (oldest.is_null() || b.min_lsn < oldest) {
                oldest = b.min_lsn;
            }
        }
        oldest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_release() {
        let r = LogReservations::new(1000, 200);
        assert_eq!(r.available(), 800);
        r.reserve(500).unwrap();
        assert_eq!(r.available(), 300);
        r.release(500);
        assert_eq!(r.available(), 800);
    }

    #[test]
    fn test_out_of_space_preserves_checkpoint_reserve() {
        let r = LogReservations::new(1000, 200);
        // more than the non-checkpoint capacity
        assert_eq!(
            r.reserve(900).unwrap_err().code(),
            ErrorCode::OutOfLogSpace
        );
        // the checkpoint reserve still serves checkpoint records
        r.consume_checkpoint(200).unwrap();
        assert!(r.consume_checkpoint(1).is_err());
    }

    #[test]
    fn test_reclaim_tops_up_checkpoint_first() {
        let r = LogReservations::new(1000, 200);
        r.consume_checkpoint(150).unwrap();
        r.reclaim(100);
        // all 100 went to the checkpoint reserve (deficit was 150)
        assert_eq!(r.available(), 800);
        r.reclaim(100);
        // 50 finish the top-up, 50 become available
        assert_eq!(r.available(), 850);
    }

    #[test]
    fn test_oldest_lsn_tracker() {
        let t = PoorMansOldestLsnTracker::new(8);
        assert!(t.oldest().is_null());
        t.enter(1, Lsn::new(1, 100));
        t.enter(2, Lsn::new(1, 50));
        assert_eq!(t.oldest(), Lsn::new(1, 50));
        t.leave(2);
        // 1 and 2 may share a bucket; the bound stays conservative
        let oldest = t.oldest();
        assert!(!oldest.is_null());
        assert!(oldest <= Lsn::new(1, 100));
        t.leave(1);
        assert!(t.oldest().is_null());
    }
}
