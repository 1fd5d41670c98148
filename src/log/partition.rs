//! One log partition = one `log.N` file of bounded size.

use std::{
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{db_error, error::ErrorCode, types::DbResult};

pub fn partition_path(dir: &Path, num: u32) -> PathBuf {
    dir.join(format!("log.{}", num))
}

pub struct PartitionFile {
    num: u32,
    file: File,
}

impl PartitionFile {
    pub fn open(dir: &Path, num: u32) -> DbResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(partition_path(dir, num))
            .map_err(|e| db_error!(ErrorCode::Os, "open log partition {}: {}", num, e))?;
        Ok(Self { num, file })
    }

    pub fn num(&self) -> u32 {
        self.num
    }

    pub fn write_at(&mut self, offset: u32, bytes: &[u8]) -> DbResult {
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|e| db_error!(ErrorCode::Os, "seek log.{}: {}", self.num, e))?;
        self.file
            .write_all(bytes)
            .map_err(|e| db_error!(ErrorCode::Os, "write log.{}: {}", self.num, e))?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes; returns the count actually read.
    pub fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> DbResult<usize> {
        self.file
            .seek(SeekFrom::Start(offset as u64))
            .map_err(|e| db_error!(ErrorCode::Os, "seek log.{}: {}", self.num, e))?;
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    return Err(db_error!(ErrorCode::Os, "read log.{}: {}", self.num, e));
                }
            }
        }
        Ok(total)
    }

    pub fn sync(&self) -> DbResult {
        self.file
            .sync_data()
            .map_err(|e| db_error!(ErrorCode::Os, "fsync log.{}: {}", self.num, e))
    }

    pub fn size(&self) -> DbResult<u64> {
        Ok(self
            .file
            .metadata()
            .map_err(|e| db_error!(ErrorCode::Os, "stat log.{}: {}", self.num, e))?
            .len())
    }
}

pub fn delete_partition(dir: &Path, num: u32) -> DbResult {
    fs::remove_file(partition_path(dir, num))
        .map_err(|e| db_error!(ErrorCode::Os, "delete log.{}: {}", num, e))
}

/// Partition numbers present in `dir`, ascending.
pub fn list_partitions(dir: &Path) -> DbResult<Vec<u32>> {
    let mut nums = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return Ok(nums),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("log.") {
            if let Ok(num) = rest.parse::<u32>() {
                nums.push(num);
            }
        }
    }
    nums.sort_unstable();
    Ok(nums)
}
