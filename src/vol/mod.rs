//! Volume: the page allocation and raw page I/O surface the engine
//! consumes. Page 0 is the volume header carrying the store directory
//! (store id -> root page id); data pages start at 1 and map linearly to
//! file offsets.

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::Path,
    sync::atomic::{AtomicU32, Ordering},
    sync::Mutex,
};

use bit_vec::BitVec;
use log::{debug, info};

use crate::{
    config::PAGE_SIZE,
    db_error,
    error::ErrorCode,
    sync::LockFreeList,
    types::{DbResult, PageId, StoreId, VolumeId},
};

const VOLUME_MAGIC: u32 = 0x4642_5644; // "FBVD"
const VOLUME_VERSION: u32 = 1;

#[derive(Default)]
pub struct StoreEntry {
    root_pid: AtomicU32,
}

impl StoreEntry {
    pub fn root(&self) -> PageId {
        self.root_pid.load(Ordering::Acquire)
    }
}

struct AllocState {
    /// One bit per page; set = allocated. Grows with the file.
    used: BitVec,
    next_hint: usize,
}

pub struct Volume {
    vid: VolumeId,
    file: Mutex<File>,
    alloc: Mutex<AllocState>,

    /// In-memory store directory; persisted into the header page.
    stores: LockFreeList<StoreEntry>,
    next_store: AtomicU32,
}

impl Volume {
    /// Create a fresh volume file with an empty store directory.
    pub fn format<P: AsRef<Path>>(path: P, vid: VolumeId) -> DbResult<Volume> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())
            .map_err(|e| db_error!(ErrorCode::VolFailed, "format volume: {}", e))?;
        let vol = Volume {
            vid,
            file: Mutex::new(file),
            alloc: Mutex::new(AllocState {
                used: BitVec::from_elem(1, true), // page 0 is the header
                next_hint: 1,
            }),
            stores: LockFreeList::new(),
            next_store: AtomicU32::new(1),
        };
        vol.write_header()?;
        info!("volume {} formatted", vid);
        Ok(vol)
    }

    /// Open an existing volume and load its store directory.
    pub fn mount<P: AsRef<Path>>(path: P, vid: VolumeId) -> DbResult<Volume> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| db_error!(ErrorCode::VolFailed, "mount volume: {}", e))?;
        let len = file
            .metadata()
            .map_err(|e| db_error!(ErrorCode::VolFailed, "stat volume: {}", e))?
            .len();
        let page_count = (len as usize / PAGE_SIZE).max(1);

        let mut header = vec![0u8; PAGE_SIZE];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut header))
            .map_err(|e| db_error!(ErrorCode::VolFailed, "read volume header: {}", e))?;

        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let page_size = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if magic != VOLUME_MAGIC || version != VOLUME_VERSION {
            return Err(db_error!(ErrorCode::VolFailed, "not a volume file"));
        }
        if page_size as usize != PAGE_SIZE {
            return Err(db_error!(
                ErrorCode::VolFailed,
                "volume page size {} != built page size {}",
                page_size,
                PAGE_SIZE
            ));
        }
        let store_count = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);

        let vol = Volume {
            vid,
            file: Mutex::new(file),
            alloc: Mutex::new(AllocState {
                // every page currently in the file counts as allocated; the
                // extent layer proper would persist a free map
                used: BitVec::from_elem(page_count, true),
                next_hint: page_count,
            }),
            stores: LockFreeList::new(),
            next_store: AtomicU32::new(1),
        };
        let mut max_store = 0;
        for i in 0..store_count as usize {
            let off = 16 + i * 8;
            let store = u32::from_le_bytes([
                header[off],
                header[off + 1],
                header[off + 2],
                header[off + 3],
            ]);
            let root = u32::from_le_bytes([
                header[off + 4],
                header[off + 5],
                header[off + 6],
                header[off + 7],
            ]);
            let entry = vol.stores.get_or_add(store as u64, StoreEntry::default);
            entry.value.root_pid.store(root, Ordering::Release);
            max_store = max_store.max(store);
        }
        vol.next_store.store(max_store + 1, Ordering::Release);
        info!("volume {} mounted: {} stores", vid, store_count);
        Ok(vol)
    }

    pub fn vid(&self) -> VolumeId {
        self.vid
    }

    fn write_header(&self) -> DbResult {
        let mut header = vec![0u8; PAGE_SIZE];
        header[0..4].copy_from_slice(&VOLUME_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&VOLUME_VERSION.to_le_bytes());
        header[8..12].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        let keys = self.stores.keys();
        header[12..16].copy_from_slice(&(keys.len() as u32).to_le_bytes());
        for (i, store) in keys.iter().enumerate() {
            let entry = self.stores.get(*store).unwrap();
            let off = 16 + i * 8;
            header[off..off + 4].copy_from_slice(&(*store as u32).to_le_bytes());
            header[off + 4..off + 8]
                .copy_from_slice(&entry.value.root().to_le_bytes());
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&header))
            .and_then(|_| file.sync_data())
            .map_err(|e| db_error!(ErrorCode::VolFailed, "write volume header: {}", e))
    }

    /// Hand out a free page id. The store argument keeps the signature of
    /// the extent layer; allocation here is volume-wide.
    pub fn allocate_page(&self, _store: StoreId) -> DbResult<PageId> {
        let mut alloc = self.alloc.lock().unwrap();
        let start = alloc.next_hint;
        let len = alloc.used.len();
        for i in (start..len).chain(1..start.min(len)) {
            if !alloc.used.get(i).unwrap_or(true) {
                alloc.used.set(i, true);
                alloc.next_hint = i + 1;
                debug!("allocated page {} (reuse)", i);
                return Ok(i as PageId);
            }
        }
        // extend
        let pid = alloc.used.len();
        alloc.used.push(true);
        alloc.next_hint = pid + 1;
        debug!("allocated page {} (extend)", pid);
        Ok(pid as PageId)
    }

    pub fn deallocate_page(&self, pid: PageId) -> DbResult {
        let mut alloc = self.alloc.lock().unwrap();
        if pid == 0 || pid as usize >= alloc.used.len() {
            return Err(db_error!(ErrorCode::BadArgument, "deallocate page {}", pid));
        }
        alloc.used.set(pid as usize, false);
        let hint = (pid as usize).min(alloc.next_hint);
        alloc.next_hint = hint;
        Ok(())
    }

    pub fn read_page(&self, pid: PageId, buf: &mut [u8]) -> DbResult {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let mut file = self.file.lock().unwrap();
        let offset = pid as u64 * PAGE_SIZE as u64;
        let len = file
            .metadata()
            .map_err(|e| db_error!(ErrorCode::VolFailed, "stat volume: {}", e))?
            .len();
        if offset >= len {
            // never-written page reads back as zeros
            for b in buf.iter_mut() {
                *b = 0;
            }
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.read_exact(buf))
            .map_err(|e| db_error!(ErrorCode::VolFailed, "read page {}: {}", pid, e))
    }

    pub fn write_page(&self, pid: PageId, buf: &[u8]) -> DbResult {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(pid as u64 * PAGE_SIZE as u64))
            .and_then(|_| file.write_all(buf))
            .map_err(|e| db_error!(ErrorCode::VolFailed, "write page {}: {}", pid, e))
    }

    /// Contiguous multi-page write, one syscall per run.
    pub fn write_pages(&self, first_pid: PageId, buf: &[u8]) -> DbResult {
        debug_assert_eq!(buf.len() % PAGE_SIZE, 0);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(first_pid as u64 * PAGE_SIZE as u64))
            .and_then(|_| file.write_all(buf))
            .map_err(|e| db_error!(ErrorCode::VolFailed, "write pages at {}: {}", first_pid, e))
    }

    pub fn sync(&self) -> DbResult {
        self.file
            .lock()
            .unwrap()
            .sync_data()
            .map_err(|e| db_error!(ErrorCode::VolFailed, "volume sync: {}", e))
    }

    /// Register a new store rooted at `root_pid`. The root page id is the
    /// store's stable identifier and never changes afterwards.
    pub fn create_store(&self, root_pid: PageId) -> DbResult<StoreId> {
        let store = self.next_store.fetch_add(1, Ordering::AcqRel);
        let entry = self.stores.get_or_add(store as u64, StoreEntry::default);
        entry.value.root_pid.store(root_pid, Ordering::Release);
        self.write_header()?;
        Ok(store)
    }

    /// Recreate a directory entry during redo.
    pub fn restore_store(&self, store: StoreId, root_pid: PageId) -> DbResult {
        let entry = self.stores.get_or_add(store as u64, StoreEntry::default);
        entry.value.root_pid.store(root_pid, Ordering::Release);
        let next = self.next_store.load(Ordering::Acquire).max(store + 1);
        self.next_store.store(next, Ordering::Release);
        self.write_header()
    }

    pub fn store_root(&self, store: StoreId) -> DbResult<PageId> {
        self.stores
            .get(store as u64)
            .map(|e| e.value.root())
            .filter(|r| *r != 0)
            .ok_or_else(|| db_error!(ErrorCode::BadArgument, "no such store {}", store))
    }

    pub fn delete_store(&self, store: StoreId) -> DbResult {
        if !self.stores.remove(store as u64) {
            return Err(db_error!(ErrorCode::BadArgument, "no such store {}", store));
        }
        self.write_header()
    }

    pub fn store_ids(&self) -> Vec<StoreId> {
        self.stores.keys().iter().map(|k| *k as StoreId).collect()
    }

    pub fn page_count(&self) -> usize {
        self.alloc.lock().unwrap().used.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("fosterdb_vol_{}_{}", std::process::id(), name));
        p
    }

    #[test]
    fn test_allocate_reuse() {
        let path = temp_path("alloc");
        let vol = Volume::format(&path, 1).unwrap();
        let a = vol.allocate_page(1).unwrap();
        let b = vol.allocate_page(1).unwrap();
        assert_ne!(a, b);
        vol.deallocate_page(a).unwrap();
        let c = vol.allocate_page(1).unwrap();
        assert_eq!(c, a);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_page_round_trip() {
        let path = temp_path("rw");
        let vol = Volume::format(&path, 1).unwrap();
        let pid = vol.allocate_page(1).unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        page[0] = 0xAB;
        page[PAGE_SIZE - 1] = 0xCD;
        vol.write_page(pid, &page).unwrap();
        let mut back = vec![0u8; PAGE_SIZE];
        vol.read_page(pid, &mut back).unwrap();
        assert_eq!(page, back);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_store_directory_survives_mount() {
        let path = temp_path("stores");
        {
            let vol = Volume::format(&path, 1).unwrap();
            let s1 = vol.create_store(10).unwrap();
            let s2 = vol.create_store(20).unwrap();
            assert_ne!(s1, s2);
            assert_eq!(vol.store_root(s1).unwrap(), 10);
        }
        {
            let vol = Volume::mount(&path, 1).unwrap();
            let ids = vol.store_ids();
            assert_eq!(ids.len(), 2);
            // a store created after remount gets a fresh id
            let s3 = vol.create_store(30).unwrap();
            assert!(!ids.contains(&s3));
        }
        std::fs::remove_file(&path).ok();
    }
}
