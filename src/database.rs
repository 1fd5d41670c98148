//! Process-wide engine context.
//!
//! All components hang off one global in the usual storage-manager shape:
//! `Database::buffer_pool()`, `Database::log_manager()` and friends hand
//! out handles wherever the call sites are. Tests start a fresh engine
//! with scratch files and can simulate a crash by dropping everything
//! without the final flushes.

use std::sync::{Arc, Mutex, RwLock};

use lazy_static::lazy_static;
use log::info;

use crate::{
    buffer::{BufferPool, PageCleaner},
    config::Options,
    lock::LockManager,
    log::{LogManager, Lsn},
    transaction::{recovery, TransactionManager},
    types::DbResult,
    utils::HandyRwLock,
    vol::Volume,
};

struct Engine {
    options: Options,
    volume: Arc<Volume>,
    log: Arc<LogManager>,
    locks: Arc<LockManager>,
    pool: Arc<BufferPool>,
    xcts: Arc<TransactionManager>,
    cleaner: Mutex<Option<PageCleaner>>,
}

pub struct Database {
    inner: RwLock<Option<Engine>>,
}

lazy_static! {
    static ref GLOBAL: Database = Database {
        inner: RwLock::new(None),
    };
}

impl Database {
    pub fn global() -> &'static Database {
        &GLOBAL
    }

    /// Bring the engine up: mount or format the volume, open the log, run
    /// restart recovery, start the background daemons. Returns the number
    /// of loser transactions rolled back.
    pub fn start(options: Options) -> DbResult<usize> {
        {
            let mut inner = GLOBAL.inner.wl();
            if inner.is_some() {
                return Ok(0);
            }
            let volume = if options.data_file.exists() {
                Arc::new(Volume::mount(&options.data_file, 1)?)
            } else {
                Arc::new(Volume::format(&options.data_file, 1)?)
            };
            let log = Arc::new(LogManager::new(&options)?);
            let locks = Arc::new(LockManager::new(options.locktable_size));
            let pool = BufferPool::new(&options, Arc::clone(&volume), Arc::clone(&log));
            let xcts = Arc::new(TransactionManager::new(
                Arc::clone(&log),
                Arc::clone(&locks),
                options.elr_mode,
            ));
            *inner = Some(Engine {
                options,
                volume,
                log,
                locks,
                pool,
                xcts,
                cleaner: Mutex::new(None),
            });
        }

        // recovery runs through the normal accessors
        let losers = recovery::restart()?;

        let inner = GLOBAL.inner.rl();
        let engine = inner.as_ref().unwrap();
        engine.log.start_flush_daemon();
        *engine.cleaner.lock().unwrap() = Some(PageCleaner::start(Arc::clone(&engine.pool)));
        info!("engine started ({} losers rolled back)", losers);
        Ok(losers)
    }

    /// Orderly shutdown: stop the daemons, write out every dirty page and
    /// the log tail.
    pub fn shutdown() -> DbResult {
        let engine = match GLOBAL.inner.wl().take() {
            Some(e) => e,
            None => return Ok(()),
        };
        if let Some(mut cleaner) = engine.cleaner.lock().unwrap().take() {
            cleaner.stop();
        }
        engine.log.stop_flush_daemon();
        engine.pool.flush_all()?;
        engine.log.flush_all()?;
        info!("engine shut down");
        Ok(())
    }

    /// Tear the running engine down cleanly and bring a fresh one up on
    /// `options`. The test suites' setup goes through this. Returns the
    /// losers rolled back during the restart.
    pub fn reset_for_test(options: Options) -> DbResult<usize> {
        Self::shutdown()?;
        Self::start(options)
    }

    /// Stop the cleaner and flush daemon so a test can control exactly
    /// what is durable.
    pub fn pause_background_for_test() {
        Self::with_engine(|e| {
            if let Some(mut cleaner) = e.cleaner.lock().unwrap().take() {
                cleaner.stop();
            }
            e.log.stop_flush_daemon();
        });
    }

    /// Drop the engine as a crash would: daemons die, dirty pages and the
    /// unflushed log tail are lost.
    pub fn crash_for_test() {
        if let Some(engine) = GLOBAL.inner.wl().take() {
            if let Some(mut cleaner) = engine.cleaner.lock().unwrap().take() {
                cleaner.stop();
            }
            engine.log.stop_flush_daemon();
            // no flushes on purpose
        }
    }

    fn with_engine<T>(f: impl FnOnce(&Engine) -> T) -> T {
        let inner = GLOBAL.inner.rl();
        let engine = inner
            .as_ref()
            .expect("engine not started; call Database::start first");
        f(engine)
    }

    pub fn options() -> Options {
        Self::with_engine(|e| e.options.clone())
    }

    pub fn volume() -> Arc<Volume> {
        Self::with_engine(|e| Arc::clone(&e.volume))
    }

    pub fn buffer_pool() -> Arc<BufferPool> {
        Self::with_engine(|e| Arc::clone(&e.pool))
    }

    pub fn log_manager() -> Arc<LogManager> {
        Self::with_engine(|e| Arc::clone(&e.log))
    }

    pub fn lock_manager() -> Arc<LockManager> {
        Self::with_engine(|e| Arc::clone(&e.locks))
    }

    pub fn xct_manager() -> Arc<TransactionManager> {
        Self::with_engine(|e| Arc::clone(&e.xcts))
    }

    /// Fuzzy checkpoint; see `transaction::recovery::take_checkpoint`.
    pub fn checkpoint() -> DbResult<Lsn> {
        recovery::take_checkpoint()
    }

    /// Recycle log partitions no longer needed by the buffer pool, the
    /// live transactions or the master checkpoint. The transaction bound
    /// comes from the hashed oldest-LSN tracker, a conservative lower
    /// bound that avoids walking the transaction table.
    pub fn recycle_log() -> DbResult {
        let min_rec = Self::buffer_pool().min_rec_lsn();
        let min_xct = Self::log_manager().oldest_lsn_tracker().oldest();
        Self::log_manager().recycle_partitions(min_rec, min_xct)
    }
}
