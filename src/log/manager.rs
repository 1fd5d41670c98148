//! Partitioned append-only log.
//!
//! Records are appended under a single producer critical section into an
//! in-memory tail keyed by LSN, flushed to `log.N` files in block-size
//! multiples. Every flushed tail block ends in a skip record so that the
//! restart scan can find the true end; the padding is overwritten by the
//! next flush. A record that would straddle the partition end is written
//! whole into a freshly opened partition, with skip records filling the old
//! tail.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::{Condvar, Mutex},
    time::Duration,
};

use crossbeam::channel::{bounded, Sender};
use log::{debug, info, warn};

use crate::{
    config::{Options, LOG_BLOCK_SIZE},
    db_error,
    error::ErrorCode,
    log::{
        lsn::Lsn,
        partition::{self, PartitionFile},
        record::{LogRecord, LogRecordKind, LOG_HEADER_SIZE, MIN_RECORD_SIZE},
        reservation::{LogReservations, PoorMansOldestLsnTracker},
    },
    types::DbResult,
};

const MAX_RECORD_SIZE: usize = u16::MAX as usize;
const TRACKER_BUCKETS: usize = 256;

struct LogCore {
    cur_lsn: Lsn,
    durable_lsn: Lsn,

    /// Encoded records not yet on disk, keyed by LSN.
    unflushed: BTreeMap<u64, Vec<u8>>,

    master_lsn: Lsn,

    /// Lowest partition still present on disk.
    min_partition: u32,
}

pub struct LogManager {
    dir: PathBuf,
    partition_size: u64,

    core: Mutex<LogCore>,
    flushed_cond: Condvar,

    /// Serializes flush I/O so the durable LSN advances monotonically.
    flush_mutex: Mutex<()>,

    files: Mutex<HashMap<u32, PartitionFile>>,

    resv: LogReservations,
    tracker: PoorMansOldestLsnTracker,

    daemon: Mutex<Option<(Sender<()>, std::thread::JoinHandle<()>)>>,
}

impl LogManager {
    pub fn new(options: &Options) -> DbResult<Self> {
        std::fs::create_dir_all(&options.log_dir)
            .map_err(|e| db_error!(ErrorCode::Os, "create log dir: {}", e))?;

        let partition_size = options.partition_size();
        let capacity = options.log_size as i64 - partition_size as i64;
        let resv = LogReservations::new(capacity + partition_size as i64, partition_size as i64);

        let existing = partition::list_partitions(&options.log_dir)?;
        let (min_partition, cur_lsn, master_lsn) = if existing.is_empty() {
            (1, Lsn::new(1, 0), Lsn::NULL)
        } else {
            let last = *existing.last().unwrap();
            let end = discover_log_end(&options.log_dir, last, partition_size)?;
            let master = read_master(&options.log_dir);
            info!("log opened: partitions {:?}, tail at {}", existing, end);
            (existing[0], end, master)
        };

        Ok(Self {
            dir: options.log_dir.clone(),
            partition_size,
            core: Mutex::new(LogCore {
                cur_lsn,
                durable_lsn: cur_lsn,
                unflushed: BTreeMap::new(),
                master_lsn,
                min_partition,
            }),
            flushed_cond: Condvar::new(),
            flush_mutex: Mutex::new(()),
            files: Mutex::new(HashMap::new()),
            resv,
            tracker: PoorMansOldestLsnTracker::new(TRACKER_BUCKETS),
            daemon: Mutex::new(None),
        })
    }

    pub fn reservations(&self) -> &LogReservations {
        &self.resv
    }

    pub fn oldest_lsn_tracker(&self) -> &PoorMansOldestLsnTracker {
        &self.tracker
    }

    pub fn curr_lsn(&self) -> Lsn {
        self.core.lock().unwrap().cur_lsn
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.core.lock().unwrap().durable_lsn
    }

    pub fn master_lsn(&self) -> Lsn {
        self.core.lock().unwrap().master_lsn
    }

    pub fn set_master_lsn(&self, lsn: Lsn) -> DbResult {
        write_master(&self.dir, lsn)?;
        self.core.lock().unwrap().master_lsn = lsn;
        Ok(())
    }

    /// Append one record. The caller has already filled in the chain
    /// fields (`prev_lsn`, `page_prev_lsn`); the assigned LSN is stored
    /// into the record and returned.
    pub fn insert(&self, record: &mut LogRecord) -> DbResult<Lsn> {
        let len = record.total_len();
        if len > MAX_RECORD_SIZE {
            return Err(db_error!(
                ErrorCode::BadArgument,
                "log record of {} bytes exceeds the frame limit",
                len
            ));
        }
        let mut core = self.core.lock().unwrap();
        let mut lsn = core.cur_lsn;
        if lsn.offset() as u64 + (len + MIN_RECORD_SIZE) as u64 > self.partition_size {
            // the record would straddle the partition end; fill the tail
            // with skips and open the next partition
            fill_partition_tail(&mut core, lsn, self.partition_size);
            lsn = Lsn::new(lsn.partition() + 1, 0);
            debug!("log advances to partition {}", lsn.partition());
        }
        record.lsn = lsn;
        core.unflushed.insert(lsn.to_u64(), record.encode());
        core.cur_lsn = lsn.advance(len as u32);
        Ok(lsn)
    }

    /// Read one record, from the unflushed tail or from disk.
    pub fn fetch(&self, lsn: Lsn) -> DbResult<LogRecord> {
        debug_assert!(!lsn.is_null());
        {
            let core = self.core.lock().unwrap();
            if let Some(bytes) = core.unflushed.get(&lsn.to_u64()) {
                let (mut rec, _) = LogRecord::decode(bytes)
                    .ok_or_else(|| db_error!(ErrorCode::Internal, "corrupt log tail at {}", lsn))?;
                rec.lsn = lsn;
                return Ok(rec);
            }
            if lsn >= core.cur_lsn {
                return Err(db_error!(ErrorCode::Eof, "no log record at {}", lsn));
            }
        }
        let mut files = self.files.lock().unwrap();
        let file = open_file(&mut files, &self.dir, lsn.partition())?;
        let mut header = [0u8; LOG_HEADER_SIZE];
        let got = file.read_at(lsn.offset(), &mut header)?;
        if got < LOG_HEADER_SIZE {
            return Err(db_error!(ErrorCode::Eof, "log record at {} truncated", lsn));
        }
        let total = u16::from_le_bytes([header[0], header[1]]) as usize;
        if total < MIN_RECORD_SIZE {
            return Err(db_error!(ErrorCode::Eof, "bad frame length at {}", lsn));
        }
        let mut bytes = vec![0u8; total];
        let got = file.read_at(lsn.offset(), &mut bytes)?;
        if got < total {
            return Err(db_error!(ErrorCode::Eof, "log record at {} truncated", lsn));
        }
        let (mut rec, _) = LogRecord::decode(&bytes)
            .ok_or_else(|| db_error!(ErrorCode::BadChecksum, "torn log record at {}", lsn))?;
        rec.lsn = lsn;
        Ok(rec)
    }

    /// Make the log durable through `upto` (in fact through the current
    /// tail: group commit).
    pub fn flush(&self, upto: Lsn) -> DbResult {
        {
            let core = self.core.lock().unwrap();
            if core.durable_lsn >= upto {
                return Ok(());
            }
        }
        let _guard = self.flush_mutex.lock().unwrap();
        let (entries, target) = {
            let core = self.core.lock().unwrap();
            if core.durable_lsn >= upto {
                return Ok(());
            }
            let entries: Vec<(Lsn, Vec<u8>)> = core
                .unflushed
                .iter()
                .map(|(k, v)| (Lsn::from_u64(*k), v.clone()))
                .collect();
            (entries, core.cur_lsn)
        };

        // group contiguous runs per partition and write each with one call
        let mut touched: Vec<u32> = Vec::new();
        let mut idx = 0;
        while idx < entries.len() {
            let part = entries[idx].0.partition();
            let start = entries[idx].0.offset();
            let mut buf: Vec<u8> = Vec::new();
            while idx < entries.len() && entries[idx].0.partition() == part {
                buf.extend_from_slice(&entries[idx].1);
                idx += 1;
            }
            // pad the tail block so it ends in a skip record
            let end = start as usize + buf.len();
            let block_end = round_up(end, LOG_BLOCK_SIZE).min(self.partition_size as usize);
            let gap = block_end - end;
            if gap >= MIN_RECORD_SIZE {
                buf.extend_from_slice(&LogRecord::skip(gap).encode());
            } else if gap > 0 {
                buf.extend_from_slice(&vec![0u8; gap]);
            }
            let mut files = self.files.lock().unwrap();
            let file = open_file(&mut files, &self.dir, part)?;
            file.write_at(start, &buf)?;
            touched.push(part);
        }
        {
            let files = self.files.lock().unwrap();
            for part in touched {
                if let Some(f) = files.get(&part) {
                    f.sync()?;
                }
            }
        }

        let mut core = self.core.lock().unwrap();
        let flushed: Vec<u64> = core
            .unflushed
            .range(..target.to_u64())
            .map(|(k, _)| *k)
            .collect();
        for k in flushed {
            core.unflushed.remove(&k);
        }
        if target > core.durable_lsn {
            core.durable_lsn = target;
        }
        self.flushed_cond.notify_all();
        Ok(())
    }

    pub fn flush_all(&self) -> DbResult {
        let upto = self.curr_lsn();
        self.flush(upto)
    }

    /// Block until the durable LSN reaches `lsn` (used by read-watermark
    /// waits; commit flushes directly).
    pub fn wait_flushed(&self, lsn: Lsn) {
        let mut core = self.core.lock().unwrap();
        while core.durable_lsn < lsn {
            core = self.flushed_cond.wait(core).unwrap();
        }
    }

    /// Delete partitions wholly below the minimum of the buffer pool's
    /// recovery LSN, the transaction table's first LSN, and the master
    /// checkpoint. Reclaimed space refills the reservations.
    pub fn recycle_partitions(&self, min_rec_lsn: Lsn, min_xct_lsn: Lsn) -> DbResult {
        let (cutoff, doomed) = {
            let core = self.core.lock().unwrap();
            let mut cutoff = core.durable_lsn;
            for lsn in [min_rec_lsn, min_xct_lsn, core.master_lsn].iter() {
                if !lsn.is_null() && *lsn < cutoff {
                    cutoff = *lsn;
                }
            }
            let doomed: Vec<u32> = (core.min_partition..cutoff.partition()).collect();
            (cutoff, doomed)
        };
        if doomed.is_empty() {
            return Ok(());
        }
        let mut files = self.files.lock().unwrap();
        for num in &doomed {
            files.remove(num);
            partition::delete_partition(&self.dir, *num)?;
            self.resv.reclaim(self.partition_size);
            info!("recycled log partition {}", num);
        }
        self.core.lock().unwrap().min_partition = cutoff.partition();
        Ok(())
    }

    /// Forward scan used by restart. Yields records in LSN order starting
    /// at `from` (or the oldest partition when `from` is null).
    pub fn scan_from(&self, from: Lsn) -> LogScan<'_> {
        let core = self.core.lock().unwrap();
        let start = if from.is_null() {
            Lsn::new(core.min_partition, 0)
        } else {
            from
        };
        LogScan {
            mgr: self,
            next: start,
            end: core.cur_lsn,
        }
    }

    pub fn start_flush_daemon(self: &std::sync::Arc<Self>) {
        let mut daemon = self.daemon.lock().unwrap();
        if daemon.is_some() {
            return;
        }
        let (tx, rx) = bounded::<()>(1);
        let me = std::sync::Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("log-flush".to_string())
            .spawn(move || loop {
                match rx.recv_timeout(Duration::from_millis(50)) {
                    Ok(()) => break,
                    Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                        if let Err(e) = me.flush_all() {
                            warn!("flush daemon: {}", e);
                        }
                    }
                    Err(crossbeam::channel::RecvTimeoutError::Disconnected) => break,
                }
            })
            .unwrap();
        *daemon = Some((tx, handle));
    }

    pub fn stop_flush_daemon(&self) {
        if let Some((tx, handle)) = self.daemon.lock().unwrap().take() {
            tx.send(()).ok();
            handle.join().ok();
        }
    }
}

pub struct LogScan<'a> {
    mgr: &'a LogManager,
    next: Lsn,
    end: Lsn,
}

impl<'a> LogScan<'a> {
    pub fn next_record(&mut self) -> Option<LogRecord> {
        loop {
            if self.next >= self.end {
                return None;
            }
            if self.next.offset() as u64 + MIN_RECORD_SIZE as u64 > self.mgr.partition_size {
                self.next = Lsn::new(self.next.partition() + 1, 0);
                continue;
            }
            match self.mgr.fetch(self.next) {
                Ok(rec) => {
                    let len = rec.total_len() as u32;
                    if rec.kind == LogRecordKind::Skip {
                        self.next = self.next.advance(len);
                        continue;
                    }
                    self.next = self.next.advance(len);
                    return Some(rec);
                }
                Err(_) => {
                    // torn or padded region: jump to the next block, or the
                    // next partition when the block was the last one
                    let block = round_up(self.next.offset() as usize + 1, LOG_BLOCK_SIZE);
                    if block as u64 >= self.mgr.partition_size {
                        self.next = Lsn::new(self.next.partition() + 1, 0);
                    } else {
                        self.next = Lsn::new(self.next.partition(), block as u32);
                    }
                }
            }
        }
    }
}

fn round_up(n: usize, to: usize) -> usize {
    (n + to - 1) / to * to
}

fn fill_partition_tail(core: &mut LogCore, from: Lsn, partition_size: u64) {
    let mut pos = from;
    let mut remaining = (partition_size - pos.offset() as u64) as usize;
    while remaining >= MIN_RECORD_SIZE {
        let mut chunk = remaining.min(MAX_RECORD_SIZE);
        if remaining - chunk > 0 && remaining - chunk < MIN_RECORD_SIZE {
            chunk = remaining - MIN_RECORD_SIZE;
        }
        let mut skip = LogRecord::skip(chunk);
        skip.lsn = pos;
        core.unflushed.insert(pos.to_u64(), skip.encode());
        pos = pos.advance(chunk as u32);
        remaining -= chunk;
    }
}

fn open_file<'a>(
    files: &'a mut HashMap<u32, PartitionFile>,
    dir: &std::path::Path,
    num: u32,
) -> DbResult<&'a mut PartitionFile> {
    if !files.contains_key(&num) {
        files.insert(num, PartitionFile::open(dir, num)?);
    }
    Ok(files.get_mut(&num).unwrap())
}

/// Find the end of the durable log in the highest partition: walk records
/// forward; the end is the first skip record that is followed by nothing
/// valid (flush padding), or the first torn frame.
fn discover_log_end(dir: &std::path::Path, last: u32, partition_size: u64) -> DbResult<Lsn> {
    let mut file = PartitionFile::open(dir, last)?;
    let mut pos: u32 = 0;
    loop {
        if pos as u64 + MIN_RECORD_SIZE as u64 > partition_size {
            return Ok(Lsn::new(last + 1, 0));
        }
        let mut header = [0u8; LOG_HEADER_SIZE];
        let got = file.read_at(pos, &mut header)?;
        if got < LOG_HEADER_SIZE {
            return Ok(Lsn::new(last, pos));
        }
        let total = u16::from_le_bytes([header[0], header[1]]) as usize;
        if total < MIN_RECORD_SIZE || pos as usize + total > partition_size as usize {
            return Ok(Lsn::new(last, pos));
        }
        let mut bytes = vec![0u8; total];
        let got = file.read_at(pos, &mut bytes)?;
        if got < total {
            return Ok(Lsn::new(last, pos));
        }
        match LogRecord::decode(&bytes) {
            Some((rec, len)) => {
                if rec.kind == LogRecordKind::Skip {
                    // padding marks the tentative end unless real records
                    // follow (tail fill before a partition switch)
                    let after = pos + len as u32;
                    let mut peek = [0u8; LOG_HEADER_SIZE];
                    let got = file.read_at(after, &mut peek)?;
                    let t = u16::from_le_bytes([peek[0], peek[1]]) as usize;
                    if got < LOG_HEADER_SIZE || t < MIN_RECORD_SIZE {
                        return Ok(Lsn::new(last, pos));
                    }
                    pos = after;
                } else {
                    pos += len as u32;
                }
            }
            None => return Ok(Lsn::new(last, pos)),
        }
    }
}

const MASTER_FILE: &str = "master";

fn read_master(dir: &std::path::Path) -> Lsn {
    match std::fs::read(dir.join(MASTER_FILE)) {
        Ok(bytes) if bytes.len() >= 8 => {
            let mut b = [0u8; 8];
            b.copy_from_slice(&bytes[..8]);
            Lsn::from_u64(u64::from_le_bytes(b))
        }
        _ => Lsn::NULL,
    }
}

fn write_master(dir: &std::path::Path, lsn: Lsn) -> DbResult {
    std::fs::write(dir.join(MASTER_FILE), lsn.to_u64().to_le_bytes())
        .map_err(|e| db_error!(ErrorCode::Os, "write master record: {}", e))
}
