//! Shared helpers for the integration tests.
//!
//! The engine is process-wide, so tests in one binary serialize on a mutex
//! and each gets a freshly formatted scratch volume and log directory.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use lazy_static::lazy_static;

use fosterdb::{utils, Database, Options, Transaction};

lazy_static! {
    static ref TEST_LOCK: Mutex<()> = Mutex::new(());
}

pub struct TestDb {
    name: String,
    _serial: MutexGuard<'static, ()>,
}

fn scratch_dir(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("fosterdb_test_{}_{}", std::process::id(), name));
    p
}

pub fn test_options(name: &str) -> Options {
    let dir = scratch_dir(name);
    Options {
        log_dir: dir.join("log"),
        data_file: dir.join("volume.db"),
        log_size: 32 * 1024 * 1024,
        ..Options::default()
    }
}

/// Start a fresh engine on scratch files. The returned guard keeps other
/// tests out and shuts the engine down at the end.
pub fn setup(name: &str) -> TestDb {
    utils::init_log();
    let serial = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let dir = scratch_dir(name);
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    Database::reset_for_test(test_options(name)).unwrap();
    TestDb {
        name: name.to_string(),
        _serial: serial,
    }
}

impl TestDb {
    /// Simulate a crash (dirty pages and the unflushed log tail are lost)
    /// and run restart recovery on the same files. Returns the number of
    /// losers rolled back.
    pub fn crash_and_restart(&self) -> usize {
        Database::crash_for_test();
        Database::start(test_options(&self.name)).unwrap()
    }
}

impl Drop for TestDb {
    fn drop(&mut self) {
        Database::shutdown().ok();
    }
}

pub fn begin() -> Transaction {
    Transaction::begin().unwrap()
}

/// Run inserts inside a committed transaction.
pub fn committed_inserts(tree: &fosterdb::BTree, rows: &[(&[u8], &[u8])]) {
    let tx = begin();
    for (k, v) in rows {
        tree.insert(&tx, k, v).unwrap();
    }
    tx.commit().unwrap();
}

pub fn scan_all(tree: &fosterdb::BTree) -> Vec<(Vec<u8>, Vec<u8>)> {
    let tx = begin();
    let rows = tree.scan(&tx).unwrap();
    tx.commit().unwrap();
    rows
}
