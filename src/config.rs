use std::path::PathBuf;

/// Page size is a compile-time constant.
pub const PAGE_SIZE: usize = 8192;

/// Keys may occupy at most one third of a page.
pub const MAX_KEY_LEN: usize = PAGE_SIZE / 3;

/// Log file I/O granularity; every flushed block ends with a skip record.
pub const LOG_BLOCK_SIZE: usize = 8192;

/// Blocks per log segment; the flush daemon works in segment-sized chunks.
pub const LOG_SEGMENT_BLOCKS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElrMode {
    /// Release all locks only after the commit record is durable.
    None,
    /// Release S/U/intent locks at commit, before the log flush.
    S,
    /// Release all locks at commit; readers then wait on the log up to
    /// their read-watermark before committing themselves.
    Sx,
    /// Release with permission-to-violate.
    Clv,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryConcurrency {
    None,
    KeyRange,
}

/// Engine options. All sizes are bytes unless noted.
#[derive(Debug, Clone)]
pub struct Options {
    /// Filesystem directory for log partitions (`log.N` files).
    pub log_dir: PathBuf,

    /// Maximum total bytes across all open log partitions.
    pub log_size: u64,

    /// Maximum number of open partitions.
    pub sm_log_partitions: u32,

    /// Buffer pool capacity; frames = bufferpool_size / PAGE_SIZE.
    pub bufferpool_size: usize,

    /// Path of the volume file.
    pub data_file: PathBuf,

    pub elr_mode: ElrMode,

    /// Lock-manager hash bucket count.
    pub locktable_size: usize,

    pub query_concurrency: QueryConcurrency,

    /// Take X instead of S key locks on reads.
    pub query_exlock_for_select: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./log"),
            log_size: 64 * 1024 * 1024,
            sm_log_partitions: 8,
            bufferpool_size: 1024 * PAGE_SIZE,
            data_file: PathBuf::from("./volume.db"),
            elr_mode: ElrMode::None,
            locktable_size: 1 << 10,
            query_concurrency: QueryConcurrency::KeyRange,
            query_exlock_for_select: false,
        }
    }
}

impl Options {
    pub fn frame_count(&self) -> usize {
        self.bufferpool_size / PAGE_SIZE
    }

    /// Bytes of one log partition file.
    pub fn partition_size(&self) -> u64 {
        self.log_size / self.sm_log_partitions as u64
    }
}
