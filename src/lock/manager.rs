//! Hierarchical lock manager.
//!
//! Locks live in a hashed bucket table sized by `locktable_size`. Granted
//! holders are kept per lock id; waiters block on the bucket's condition
//! variable and re-examine the queue on every wakeup, running the
//! Dreadlocks check against the current holders. Intent locks on volume
//! and store must be in place before any key lock underneath them.
//!
//! Lock order inside this module: bucket state first, then the transaction
//! map; releases touch them strictly one at a time.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Condvar, Mutex,
    },
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    config::ElrMode,
    db_error,
    error::ErrorCode,
    log::Lsn,
    types::{DbResult, StoreId, TransactionId, VolumeId},
};

use super::{
    dreadlocks::Fingerprint,
    id::LockId,
    mode::{IntentMode, OkvlMode},
};

/// How long one condvar snooze lasts between Dreadlocks re-examinations.
const WAIT_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitPolicy {
    /// Fail with LockTimeout immediately on conflict.
    Immediate,
    /// Block until granted or deadlock.
    Forever,
    /// Block up to the duration, then LockTimeout.
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HeldMode {
    Intent(IntentMode),
    Key(OkvlMode),
}

impl HeldMode {
    fn compatible(a: &HeldMode, b: &HeldMode) -> bool {
        match (a, b) {
            (HeldMode::Intent(x), HeldMode::Intent(y)) => IntentMode::compatible(*x, *y),
            (HeldMode::Key(x), HeldMode::Key(y)) => x.is_compatible(y),
            // a lock id never mixes intent and key holders
            _ => false,
        }
    }

    fn combine(a: &HeldMode, b: &HeldMode) -> HeldMode {
        match (a, b) {
            (HeldMode::Intent(x), HeldMode::Intent(y)) => {
                HeldMode::Intent(IntentMode::supremum(*x, *y))
            }
            (HeldMode::Key(x), HeldMode::Key(y)) => HeldMode::Key(x.combine(y)),
            (_, other) => *other,
        }
    }

    fn is_read_only(&self) -> bool {
        match self {
            HeldMode::Intent(m) => matches!(m, IntentMode::IS | IntentMode::S),
            HeldMode::Key(m) => m.is_read_only(),
        }
    }
}

struct Holder {
    xct: TransactionId,
    mode: HeldMode,
}

#[derive(Default)]
struct LockQueue {
    holders: Vec<Holder>,
}

struct BucketState {
    locks: HashMap<u64, LockQueue>,
    /// Highest commit LSN whose X locks were released early (ELR-SX)
    /// through this bucket; acquirers absorb it into their read watermark.
    release_watermark: Lsn,
}

struct Bucket {
    state: Mutex<BucketState>,
    cond: Condvar,
}

struct XctLockState {
    fingerprint: Fingerprint,
    /// Own fingerprint plus the digests of the holders currently waited
    /// on; equals the fingerprint when not waiting.
    digest: Fingerprint,
    held: HashMap<u64, (LockId, HeldMode)>,
    read_watermark: Lsn,
    force_nonblocking: bool,
}

pub struct LockManager {
    buckets: Vec<Bucket>,
    xcts: Mutex<HashMap<TransactionId, XctLockState>>,
    deadlocks_detected: AtomicU64,
}

impl LockManager {
    pub fn new(locktable_size: usize) -> LockManager {
        let mut buckets = Vec::with_capacity(locktable_size);
        for _ in 0..locktable_size {
            buckets.push(Bucket {
                state: Mutex::new(BucketState {
                    locks: HashMap::new(),
                    release_watermark: Lsn::NULL,
                }),
                cond: Condvar::new(),
            });
        }
        LockManager {
            buckets,
            xcts: Mutex::new(HashMap::new()),
            deadlocks_detected: AtomicU64::new(0),
        }
    }

    fn bucket_of(&self, id: LockId) -> &Bucket {
        let h = id.raw().wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.buckets[(h >> 32) as usize % self.buckets.len()]
    }

    pub fn register_xct(&self, xct: TransactionId) {
        let fp = Fingerprint::for_xct(xct);
        self.xcts.lock().unwrap().insert(
            xct,
            XctLockState {
                fingerprint: fp,
                digest: fp,
                held: HashMap::new(),
                read_watermark: Lsn::NULL,
                force_nonblocking: false,
            },
        );
    }

    pub fn deregister_xct(&self, xct: TransactionId) {
        debug_assert!(self
            .xcts
            .lock()
            .unwrap()
            .get(&xct)
            .map(|s| s.held.is_empty())
            .unwrap_or(true));
        self.xcts.lock().unwrap().remove(&xct);
    }

    /// Checkpoint and similar callers use this to break any wait: further
    /// blocking acquisitions fail with Deadlock at once.
    pub fn set_force_nonblocking(&self, xct: TransactionId) {
        if let Some(s) = self.xcts.lock().unwrap().get_mut(&xct) {
            s.force_nonblocking = true;
        }
    }

    pub fn read_watermark(&self, xct: TransactionId) -> Lsn {
        self.xcts
            .lock()
            .unwrap()
            .get(&xct)
            .map(|s| s.read_watermark)
            .unwrap_or(Lsn::NULL)
    }

    pub fn deadlocks_detected(&self) -> u64 {
        self.deadlocks_detected.load(Ordering::Relaxed)
    }

    pub fn intent_volume_lock(
        &self,
        xct: TransactionId,
        vid: VolumeId,
        mode: IntentMode,
        wait: WaitPolicy,
    ) -> DbResult {
        self.acquire(xct, LockId::volume(vid), HeldMode::Intent(mode), wait)
    }

    /// Store intent; takes the matching volume intent first.
    pub fn intent_store_lock(
        &self,
        xct: TransactionId,
        vid: VolumeId,
        store: StoreId,
        mode: IntentMode,
        wait: WaitPolicy,
    ) -> DbResult {
        let vol_mode = match mode {
            IntentMode::IS | IntentMode::S => IntentMode::IS,
            _ => IntentMode::IX,
        };
        self.acquire(xct, LockId::volume(vid), HeldMode::Intent(vol_mode), wait)?;
        self.acquire(xct, LockId::store(vid, store), HeldMode::Intent(mode), wait)
    }

    /// Key lock. The caller must already hold a store intent at least as
    /// strong as the key mode's counterpart.
    pub fn key_lock(
        &self,
        xct: TransactionId,
        vid: VolumeId,
        store: StoreId,
        key_bytes: &[u8],
        mode: OkvlMode,
        wait: WaitPolicy,
    ) -> DbResult {
        debug_assert!(self.holds_store_intent(xct, vid, store, mode.intent_counterpart()));
        self.acquire(xct, LockId::key(vid, store, key_bytes), HeldMode::Key(mode), wait)
    }

    fn holds_store_intent(
        &self,
        xct: TransactionId,
        vid: VolumeId,
        store: StoreId,
        needed: IntentMode,
    ) -> bool {
        let xs = self.xcts.lock().unwrap();
        match xs.get(&xct).and_then(|s| s.held.get(&LockId::store(vid, store).raw())) {
            Some((_, HeldMode::Intent(m))) => m.implies(needed),
            _ => false,
        }
    }

    fn acquire(
        &self,
        xct: TransactionId,
        id: LockId,
        mode: HeldMode,
        wait: WaitPolicy,
    ) -> DbResult {
        let bucket = self.bucket_of(id);
        let deadline = match wait {
            WaitPolicy::Timeout(d) => Some(Instant::now() + d),
            _ => None,
        };
        let mut state = bucket.state.lock().unwrap();
        loop {
            let queue = state.locks.entry(id.raw()).or_insert_with(LockQueue::default);

            // the mode we would end up holding
            let effective = queue
                .holders
                .iter()
                .find(|h| h.xct == xct)
                .map(|h| HeldMode::combine(&h.mode, &mode))
                .unwrap_or(mode);
            let conflicts: Vec<TransactionId> = queue
                .holders
                .iter()
                .filter(|h| h.xct != xct && !HeldMode::compatible(&h.mode, &effective))
                .map(|h| h.xct)
                .collect();

            if conflicts.is_empty() {
                match queue.holders.iter_mut().find(|h| h.xct == xct) {
                    Some(h) => h.mode = effective,
                    None => queue.holders.push(Holder { xct, mode: effective }),
                }
                let watermark = state.release_watermark;
                drop(state);
                let mut xs = self.xcts.lock().unwrap();
                if let Some(s) = xs.get_mut(&xct) {
                    s.held.insert(id.raw(), (id, effective));
                    s.digest = s.fingerprint;
                    if watermark > s.read_watermark {
                        s.read_watermark = watermark;
                    }
                }
                return Ok(());
            }

            if wait == WaitPolicy::Immediate {
                return Err(db_error!(
                    ErrorCode::LockTimeout,
                    "lock {:?} busy (immediate request)",
                    id
                ));
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    self.clear_digest(xct);
                    return Err(db_error!(ErrorCode::LockTimeout, "lock {:?} wait timed out", id));
                }
            }

            // Dreadlocks: digest the holders we are about to wait behind
            {
                let mut xs = self.xcts.lock().unwrap();
                let (my_fp, nonblocking) = match xs.get(&xct) {
                    Some(s) => (s.fingerprint, s.force_nonblocking),
                    None => (Fingerprint::default(), false),
                };
                if nonblocking {
                    return Err(db_error!(
                        ErrorCode::Deadlock,
                        "forced nonblocking transaction would wait"
                    ));
                }
                let mut digest = my_fp;
                let mut dead = false;
                for h in &conflicts {
                    if let Some(hs) = xs.get(h) {
                        if hs.digest.intersects(&my_fp) {
                            dead = true;
                            break;
                        }
                        digest.union_with(&hs.digest);
                    }
                }
                if dead {
                    self.deadlocks_detected.fetch_add(1, Ordering::Relaxed);
                    if let Some(s) = xs.get_mut(&xct) {
                        s.digest = s.fingerprint;
                    }
                    debug!("deadlock: xct {} waiting on {:?}", xct, id);
                    return Err(db_error!(
                        ErrorCode::Deadlock,
                        "deadlock detected waiting for {:?}",
                        id
                    ));
                }
                if let Some(s) = xs.get_mut(&xct) {
                    s.digest = digest;
                }
            }

            let (s, _) = bucket.cond.wait_timeout(state, WAIT_SLICE).unwrap();
            state = s;
        }
    }

    fn clear_digest(&self, xct: TransactionId) {
        let mut xs = self.xcts.lock().unwrap();
        if let Some(s) = xs.get_mut(&xct) {
            s.digest = s.fingerprint;
        }
    }

    /// Drop every lock this transaction holds. For ELR-SX commits the
    /// commit LSN is recorded so later acquirers know how far to wait on
    /// the log before committing themselves.
    pub fn release_all(&self, xct: TransactionId, elr: ElrMode, commit_lsn: Lsn) {
        let held: Vec<(LockId, HeldMode)> = {
            let mut xs = self.xcts.lock().unwrap();
            match xs.get_mut(&xct) {
                Some(s) => {
                    s.digest = s.fingerprint;
                    s.held.drain().map(|(_, v)| v).collect()
                }
                None => return,
            }
        };
        for (id, mode) in held {
            self.release_one(xct, id, &mode, elr, commit_lsn);
        }
    }

    /// ELR-S: shed only the read side (S/U/intent) at commit; X key locks
    /// stay until the log is durable.
    pub fn release_read_locks(&self, xct: TransactionId) {
        let held: Vec<(LockId, HeldMode)> = {
            let mut xs = self.xcts.lock().unwrap();
            match xs.get_mut(&xct) {
                Some(s) => {
                    let read: Vec<u64> = s
                        .held
                        .iter()
                        .filter(|(_, (_, m))| m.is_read_only())
                        .map(|(k, _)| *k)
                        .collect();
                    read.iter().filter_map(|k| s.held.remove(k)).collect()
                }
                None => return,
            }
        };
        for (id, mode) in held {
            self.release_one(xct, id, &mode, ElrMode::None, Lsn::NULL);
        }
    }

    fn release_one(
        &self,
        xct: TransactionId,
        id: LockId,
        mode: &HeldMode,
        elr: ElrMode,
        commit_lsn: Lsn,
    ) {
        let bucket = self.bucket_of(id);
        let mut state = bucket.state.lock().unwrap();
        if elr == ElrMode::Sx && !commit_lsn.is_null() && !mode.is_read_only() {
            if commit_lsn > state.release_watermark {
                state.release_watermark = commit_lsn;
            }
        }
        if let Some(q) = state.locks.get_mut(&id.raw()) {
            q.holders.retain(|h| h.xct != xct);
            if q.holders.is_empty() {
                state.locks.remove(&id.raw());
            }
        }
        drop(state);
        bucket.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::lock::mode::LockBase;

    fn mgr() -> Arc<LockManager> {
        Arc::new(LockManager::new(64))
    }

    #[test]
    fn test_shared_grants() {
        let m = mgr();
        m.register_xct(1);
        m.register_xct(2);
        m.intent_store_lock(1, 1, 5, IntentMode::IS, WaitPolicy::Immediate)
            .unwrap();
        m.intent_store_lock(2, 1, 5, IntentMode::IS, WaitPolicy::Immediate)
            .unwrap();
        m.key_lock(1, 1, 5, b"k", OkvlMode::key_s(), WaitPolicy::Immediate)
            .unwrap();
        m.key_lock(2, 1, 5, b"k", OkvlMode::key_s(), WaitPolicy::Immediate)
            .unwrap();
        m.release_all(1, ElrMode::None, Lsn::NULL);
        m.release_all(2, ElrMode::None, Lsn::NULL);
        m.deregister_xct(1);
        m.deregister_xct(2);
    }

    #[test]
    fn test_immediate_conflict_times_out() {
        let m = mgr();
        m.register_xct(1);
        m.register_xct(2);
        m.intent_store_lock(1, 1, 5, IntentMode::IX, WaitPolicy::Immediate)
            .unwrap();
        m.intent_store_lock(2, 1, 5, IntentMode::IX, WaitPolicy::Immediate)
            .unwrap();
        m.key_lock(1, 1, 5, b"k", OkvlMode::key_x(), WaitPolicy::Immediate)
            .unwrap();
        let err = m
            .key_lock(2, 1, 5, b"k", OkvlMode::key_x(), WaitPolicy::Immediate)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::LockTimeout);
        m.release_all(1, ElrMode::None, Lsn::NULL);
        // now it goes through
        m.key_lock(2, 1, 5, b"k", OkvlMode::key_x(), WaitPolicy::Immediate)
            .unwrap();
        m.release_all(2, ElrMode::None, Lsn::NULL);
    }

    #[test]
    fn test_upgrade_in_place() {
        let m = mgr();
        m.register_xct(1);
        m.intent_store_lock(1, 1, 5, IntentMode::IX, WaitPolicy::Immediate)
            .unwrap();
        m.key_lock(1, 1, 5, b"k", OkvlMode::key_s(), WaitPolicy::Immediate)
            .unwrap();
        // same transaction upgrades its own lock without conflicting
        m.key_lock(1, 1, 5, b"k", OkvlMode::key_x(), WaitPolicy::Immediate)
            .unwrap();
        m.release_all(1, ElrMode::None, Lsn::NULL);
    }

    #[test]
    fn test_gap_does_not_block_key() {
        let m = mgr();
        m.register_xct(1);
        m.register_xct(2);
        m.intent_store_lock(1, 1, 5, IntentMode::IX, WaitPolicy::Immediate)
            .unwrap();
        m.intent_store_lock(2, 1, 5, IntentMode::IX, WaitPolicy::Immediate)
            .unwrap();
        m.key_lock(1, 1, 5, b"k", OkvlMode::gap_mode(LockBase::S), WaitPolicy::Immediate)
            .unwrap();
        m.key_lock(2, 1, 5, b"k", OkvlMode::key_x(), WaitPolicy::Immediate)
            .unwrap();
        m.release_all(1, ElrMode::None, Lsn::NULL);
        m.release_all(2, ElrMode::None, Lsn::NULL);
    }

    #[test]
    fn test_two_xct_deadlock_detected() {
        let m = mgr();
        m.register_xct(1);
        m.register_xct(2);
        m.intent_store_lock(1, 1, 5, IntentMode::IX, WaitPolicy::Forever)
            .unwrap();
        m.intent_store_lock(2, 1, 5, IntentMode::IX, WaitPolicy::Forever)
            .unwrap();
        m.key_lock(1, 1, 5, b"a", OkvlMode::key_x(), WaitPolicy::Forever)
            .unwrap();
        m.key_lock(2, 1, 5, b"b", OkvlMode::key_x(), WaitPolicy::Forever)
            .unwrap();

        let m1 = Arc::clone(&m);
        let t1 = std::thread::spawn(move || m1.key_lock(1, 1, 5, b"b", OkvlMode::key_x(), WaitPolicy::Forever));
        let m2 = Arc::clone(&m);
        let t2 = std::thread::spawn(move || m2.key_lock(2, 1, 5, b"a", OkvlMode::key_x(), WaitPolicy::Forever));

        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();
        // at least one waiter must see the cycle
        let deadlocked = [&r1, &r2]
            .iter()
            .filter(|r| {
                r.as_ref()
                    .err()
                    .map(|e| e.code() == ErrorCode::Deadlock)
                    .unwrap_or(false)
            })
            .count();
        assert!(deadlocked >= 1);
        assert!(m.deadlocks_detected() >= 1);
        m.release_all(1, ElrMode::None, Lsn::NULL);
        m.release_all(2, ElrMode::None, Lsn::NULL);
    }

    #[test]
    fn test_elr_sx_watermark_observed() {
        let m = mgr();
        m.register_xct(1);
        m.register_xct(2);
        m.intent_store_lock(1, 1, 5, IntentMode::IX, WaitPolicy::Immediate)
            .unwrap();
        m.key_lock(1, 1, 5, b"k", OkvlMode::key_x(), WaitPolicy::Immediate)
            .unwrap();
        // xct 1 commits with ELR-SX at LSN (1, 512)
        m.release_all(1, ElrMode::Sx, Lsn::new(1, 512));

        m.intent_store_lock(2, 1, 5, IntentMode::IS, WaitPolicy::Immediate)
            .unwrap();
        m.key_lock(2, 1, 5, b"k", OkvlMode::key_s(), WaitPolicy::Immediate)
            .unwrap();
        assert_eq!(m.read_watermark(2), Lsn::new(1, 512));
        m.release_all(2, ElrMode::None, Lsn::NULL);
    }

    #[test]
    fn test_force_nonblocking_breaks_waits() {
        let m = mgr();
        m.register_xct(1);
        m.register_xct(2);
        m.intent_store_lock(1, 1, 5, IntentMode::IX, WaitPolicy::Immediate)
            .unwrap();
        m.intent_store_lock(2, 1, 5, IntentMode::IX, WaitPolicy::Immediate)
            .unwrap();
        m.key_lock(1, 1, 5, b"k", OkvlMode::key_x(), WaitPolicy::Immediate)
            .unwrap();
        m.set_force_nonblocking(2);
        let err = m
            .key_lock(2, 1, 5, b"k", OkvlMode::key_x(), WaitPolicy::Forever)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Deadlock);
        m.release_all(1, ElrMode::None, Lsn::NULL);
        m.release_all(2, ElrMode::None, Lsn::NULL);
    }
}
