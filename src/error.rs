use std::{error::Error, fmt};

use backtrace::Backtrace;

/// Every failure the engine can report. The first three are internal retry
/// signals and must never escape the public API; entry points loop on them
/// and surface `TooManyRetry` when the bound is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    // retryable (internal)
    Retry,
    GoodRetry,
    LockRetry,

    // transactional
    LockTimeout,
    CondLockTimeout,
    Deadlock,
    TooManyRetry,
    OutOfLogSpace,

    // user
    NotFound,
    Duplicate,
    RecWontFit,
    Eof,
    BadArgument,
    TwoThread,
    InTrans,
    NoTrans,

    // latching
    LatchQFail,
    NeedRealLatch,

    // consistency
    BadChecksum,
    AccessConflict,
    WrongPageLsnChain,
    NoParentSpr,
    VolFailed,

    // fatal
    OutOfMemory,
    Internal,
    Crash,
    Os,
}

impl ErrorCode {
    /// Retryable codes are caught at the retry points (insert core, update
    /// core, traverse) and cause a local restart.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::Retry | ErrorCode::GoodRetry | ErrorCode::LockRetry
        )
    }

    /// Codes that abort the enclosing user transaction.
    pub fn is_transactional(&self) -> bool {
        matches!(
            self,
            ErrorCode::LockTimeout
                | ErrorCode::Deadlock
                | ErrorCode::OutOfLogSpace
                | ErrorCode::TooManyRetry
        )
    }
}

pub struct DbError {
    code: ErrorCode,
    details: String,

    /// Stack of `file:line` locations, pushed at the throw point and at
    /// every propagation point that calls `augment`.
    locations: Vec<String>,
}

impl DbError {
    pub fn new(code: ErrorCode, msg: &str) -> DbError {
        DbError {
            code,
            details: msg.to_string(),
            locations: Vec::new(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn augment(mut self, file: &str, line: u32) -> DbError {
        self.locations.push(format!("{}:{}", file, line));
        self
    }

    pub fn show_backtrace(&self) {
        let bt = Backtrace::new();
        log::error!("{}\nbacktrace:\n{:?}", self, bt);
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:?}] {}", self.code, self.details)?;
        for loc in &self.locations {
            write!(f, "\n\tat {}", loc)?;
        }
        Ok(())
    }
}

impl fmt::Debug for DbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Error for DbError {}

/// Build a `DbError` carrying the throw location.
#[macro_export]
macro_rules! db_error {
    ($code:expr) => {
        $crate::error::DbError::new($code, "").augment(file!(), line!())
    };
    ($code:expr, $($arg:tt)*) => {
        $crate::error::DbError::new($code, &format!($($arg)*)).augment(file!(), line!())
    };
}
