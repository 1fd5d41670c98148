//! Slotted page layout.
//!
//! A page is a fixed 8 KiB byte array. The header occupies the first 64
//! bytes; the slot array grows forward from it and the record area grows
//! backward from the footer. The footer duplicates the page LSN as a
//! torn-write check. Slot 0 always holds the three fence keys; user
//! records live in slots 1..n.
//!
//! Each slot is four bytes: a signed record offset in 8-byte units
//! (negative = ghost) and a 16-bit poor-man's key, the first two bytes of
//! the key suffix. Search compares poor-man's keys first and touches the
//! record only on a match, which keeps most probes inside the slot array.
//!
//! Record bodies, 8-byte aligned:
//!   leaf: `[u16 rec_len][u16 key_len][u16 val_len][suffix][value]`
//!   node: `[u32 child][u64 emlsn][u16 rec_len][u16 key_len][suffix]`
//!   fence (slot 0): `[u16 rec_len][u16 low][u16 high][u16 chain][bytes...]`
//!
//! The common prefix of (fence low, fence high) is stored once and removed
//! from every key suffix.

use crate::{
    config::PAGE_SIZE,
    db_error,
    error::ErrorCode,
    log::Lsn,
    types::{DbResult, PageId, StoreId},
    utils::align8,
};

use super::key::BTreeKey;

pub const HEADER_SIZE: usize = 64;
pub const SLOT_SIZE: usize = 4;
pub const FOOTER_SIZE: usize = 8;
pub const REC_AREA_END: usize = PAGE_SIZE - FOOTER_SIZE;

// header field offsets
const OFF_CHECKSUM: usize = 0;
const OFF_PID: usize = 4;
const OFF_STORE: usize = 8;
const OFF_ROOT: usize = 12;
const OFF_PAGE_LSN: usize = 16;
const OFF_LEVEL: usize = 24;
const OFF_FLAGS: usize = 26;
const OFF_PID0: usize = 28;
const OFF_FOSTER: usize = 32;
const OFF_FOSTER_EMLSN: usize = 36;
const OFF_PREFIX_LEN: usize = 44;
const OFF_FENCE_LOW_LEN: usize = 46;
const OFF_FENCE_HIGH_LEN: usize = 48;
const OFF_CHAIN_HIGH_LEN: usize = 50;
const OFF_NSLOTS: usize = 52;
const OFF_REC_AREA_START: usize = 54;
const OFF_SKEW: usize = 56;

const FLAG_TAG_MASK: u16 = 0x0003;
const FLAG_TO_BE_DELETED: u16 = 0x0004;
const FLAG_VIRGIN: u16 = 0x0008;

/// Insertions this far skewed trigger the no-record split policy.
pub const SKEW_THRESHOLD: i16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageTag {
    Alloc = 0,
    StoreNode = 1,
    BTree = 2,
}

/// A record lifted off a page, as moved by the structure modifications and
/// carried verbatim inside their log records.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordBody {
    Leaf { value: Vec<u8>, ghost: bool },
    Node { child: PageId, emlsn: Lsn },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MovedRecord {
    pub key: BTreeKey,
    pub body: RecordBody,
}

pub fn encode_records(records: &[MovedRecord]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(records.len() as u16).to_le_bytes());
    for r in records {
        let keystr = r.key.serialized();
        match &r.body {
            RecordBody::Leaf { value, ghost } => {
                buf.push(if *ghost { 1 } else { 0 });
                buf.extend_from_slice(&(keystr.len() as u16).to_le_bytes());
                buf.extend_from_slice(keystr);
                buf.extend_from_slice(&(value.len() as u16).to_le_bytes());
                buf.extend_from_slice(value);
            }
            RecordBody::Node { child, emlsn } => {
                buf.push(2);
                buf.extend_from_slice(&(keystr.len() as u16).to_le_bytes());
                buf.extend_from_slice(keystr);
                buf.extend_from_slice(&child.to_le_bytes());
                buf.extend_from_slice(&emlsn.to_u64().to_le_bytes());
            }
        }
    }
    buf
}

pub fn decode_records(bytes: &[u8]) -> Vec<MovedRecord> {
    let count = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
    let mut pos = 2;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let kind = bytes[pos];
        pos += 1;
        let key_len = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
        pos += 2;
        let key = BTreeKey::from_serialized(&bytes[pos..pos + key_len]);
        pos += key_len;
        match kind {
            0 | 1 => {
                let val_len = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]) as usize;
                pos += 2;
                let value = bytes[pos..pos + val_len].to_vec();
                pos += val_len;
                out.push(MovedRecord {
                    key,
                    body: RecordBody::Leaf {
                        value,
                        ghost: kind == 1,
                    },
                });
            }
            _ => {
                let child = u32::from_le_bytes([
                    bytes[pos],
                    bytes[pos + 1],
                    bytes[pos + 2],
                    bytes[pos + 3],
                ]);
                pos += 4;
                let mut b = [0u8; 8];
                b.copy_from_slice(&bytes[pos..pos + 8]);
                pos += 8;
                out.push(MovedRecord {
                    key,
                    body: RecordBody::Node {
                        child,
                        emlsn: Lsn::from_u64(u64::from_le_bytes(b)),
                    },
                });
            }
        }
    }
    out
}

#[derive(Clone)]
pub struct PageData {
    bytes: [u8; PAGE_SIZE],
}

impl PageData {
    pub fn new() -> Self {
        Self {
            bytes: [0u8; PAGE_SIZE],
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), PAGE_SIZE);
        let mut page = Self::new();
        page.bytes.copy_from_slice(bytes);
        page
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    // -- raw field helpers --------------------------------------------------

    fn read_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.bytes[off], self.bytes[off + 1]])
    }

    fn write_u16(&mut self, off: usize, v: u16) {
        self.bytes[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn read_i16(&self, off: usize) -> i16 {
        i16::from_le_bytes([self.bytes[off], self.bytes[off + 1]])
    }

    fn write_i16(&mut self, off: usize, v: i16) {
        self.bytes[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn read_u32(&self, off: usize) -> u32 {
        u32::from_le_bytes([
            self.bytes[off],
            self.bytes[off + 1],
            self.bytes[off + 2],
            self.bytes[off + 3],
        ])
    }

    fn write_u32(&mut self, off: usize, v: u32) {
        self.bytes[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn read_u64(&self, off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.bytes[off..off + 8]);
        u64::from_le_bytes(b)
    }

    fn write_u64(&mut self, off: usize, v: u64) {
        self.bytes[off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    // -- header accessors ---------------------------------------------------

    pub fn pid(&self) -> PageId {
        self.read_u32(OFF_PID)
    }

    /// Used when a page image is copied to a different page id (tree grow
    /// and shrink keep the root id stable and relabel the copy).
    pub fn set_pid(&mut self, pid: PageId) {
        self.write_u32(OFF_PID, pid)
    }

    pub fn store_id(&self) -> StoreId {
        self.read_u32(OFF_STORE)
    }

    pub fn root_pid(&self) -> PageId {
        self.read_u32(OFF_ROOT)
    }

    pub fn page_lsn(&self) -> Lsn {
        Lsn::from_u64(self.read_u64(OFF_PAGE_LSN))
    }

    /// Stamp the LSN in both the header and the footer duplicate.
    pub fn set_page_lsn(&mut self, lsn: Lsn) {
        self.write_u64(OFF_PAGE_LSN, lsn.to_u64());
        self.write_u64(PAGE_SIZE - FOOTER_SIZE, lsn.to_u64());
    }

    /// False when header and footer disagree: the page write was torn.
    pub fn lsn_consistent(&self) -> bool {
        self.read_u64(OFF_PAGE_LSN) == self.read_u64(PAGE_SIZE - FOOTER_SIZE)
    }

    pub fn level(&self) -> u16 {
        self.read_u16(OFF_LEVEL)
    }

    pub fn set_level(&mut self, level: u16) {
        self.write_u16(OFF_LEVEL, level)
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 1
    }

    pub fn is_node(&self) -> bool {
        self.level() > 1
    }

    pub fn tag(&self) -> PageTag {
        match self.read_u16(OFF_FLAGS) & FLAG_TAG_MASK {
            0 => PageTag::Alloc,
            1 => PageTag::StoreNode,
            _ => PageTag::BTree,
        }
    }

    pub fn is_to_be_deleted(&self) -> bool {
        self.read_u16(OFF_FLAGS) & FLAG_TO_BE_DELETED != 0
    }

    pub fn set_to_be_deleted(&mut self) {
        let f = self.read_u16(OFF_FLAGS);
        self.write_u16(OFF_FLAGS, f | FLAG_TO_BE_DELETED);
    }

    pub fn is_virgin(&self) -> bool {
        self.read_u16(OFF_FLAGS) & FLAG_VIRGIN != 0
    }

    pub fn clear_virgin(&mut self) {
        let f = self.read_u16(OFF_FLAGS);
        self.write_u16(OFF_FLAGS, f & !FLAG_VIRGIN);
    }

    pub fn pid0(&self) -> PageId {
        self.read_u32(OFF_PID0)
    }

    pub fn set_pid0(&mut self, pid: PageId) {
        self.write_u32(OFF_PID0, pid)
    }

    pub fn foster(&self) -> PageId {
        self.read_u32(OFF_FOSTER)
    }

    pub fn set_foster(&mut self, pid: PageId) {
        self.write_u32(OFF_FOSTER, pid)
    }

    pub fn has_foster(&self) -> bool {
        self.foster() != 0
    }

    pub fn foster_emlsn(&self) -> Lsn {
        Lsn::from_u64(self.read_u64(OFF_FOSTER_EMLSN))
    }

    pub fn set_foster_emlsn(&mut self, lsn: Lsn) {
        self.write_u64(OFF_FOSTER_EMLSN, lsn.to_u64())
    }

    pub fn prefix_len(&self) -> usize {
        self.read_u16(OFF_PREFIX_LEN) as usize
    }

    fn nslots(&self) -> usize {
        self.read_u16(OFF_NSLOTS) as usize
    }

    /// User records on this page (slot 0 is the fence record).
    pub fn nrecs(&self) -> usize {
        self.nslots().saturating_sub(1)
    }

    fn rec_area_start(&self) -> usize {
        self.read_u16(OFF_REC_AREA_START) as usize
    }

    pub fn skew_counter(&self) -> i16 {
        self.read_i16(OFF_SKEW)
    }

    /// Insert pattern tracking: appends push the counter up, prepends push
    /// it down, anything else resets it.
    pub fn track_insertion_skew(&mut self, slot: usize) {
        let n = self.nrecs();
        let cur = self.skew_counter();
        let next = if n > 0 && slot == n {
            cur.max(0).saturating_add(1)
        } else if slot <= 1 {
            cur.min(0).saturating_sub(1)
        } else {
            0
        };
        self.write_i16(OFF_SKEW, next);
    }

    pub fn is_insertion_extremely_skewed_right(&self) -> bool {
        self.skew_counter() >= SKEW_THRESHOLD
    }

    pub fn is_insertion_skewed_left(&self) -> bool {
        self.skew_counter() <= -SKEW_THRESHOLD
    }

    // -- checksum -----------------------------------------------------------

    fn compute_checksum(&self) -> u32 {
        // wrapping sum over everything except the checksum field itself
        let mut sum: u32 = 0x6f73_7465;
        for chunk in self.bytes[4..].chunks(4) {
            let mut w = [0u8; 4];
            w[..chunk.len()].copy_from_slice(chunk);
            sum = sum.wrapping_mul(31).wrapping_add(u32::from_le_bytes(w));
        }
        sum
    }

    pub fn update_checksum(&mut self) {
        let sum = self.compute_checksum();
        self.write_u32(OFF_CHECKSUM, sum);
    }

    pub fn verify_checksum(&self) -> bool {
        self.read_u32(OFF_CHECKSUM) == self.compute_checksum()
    }

    // -- slot helpers -------------------------------------------------------

    fn slot_off(slot: usize) -> usize {
        HEADER_SIZE + slot * SLOT_SIZE
    }

    fn slot_word(&self, slot: usize) -> i16 {
        self.read_i16(Self::slot_off(slot))
    }

    fn set_slot_word(&mut self, slot: usize, word: i16) {
        self.write_i16(Self::slot_off(slot), word)
    }

    fn poormkey(&self, slot: usize) -> u16 {
        self.read_u16(Self::slot_off(slot) + 2)
    }

    fn set_poormkey(&mut self, slot: usize, pmk: u16) {
        self.write_u16(Self::slot_off(slot) + 2, pmk)
    }

    fn record_off(&self, slot: usize) -> usize {
        let w = self.slot_word(slot);
        debug_assert!(w != 0);
        (w.abs() as usize) * 8
    }

    pub fn is_ghost(&self, slot: usize) -> bool {
        debug_assert!(slot >= 1);
        self.slot_word(slot) < 0
    }

    pub fn set_ghost(&mut self, slot: usize) {
        let w = self.slot_word(slot);
        debug_assert!(w > 0);
        self.set_slot_word(slot, -w);
    }

    pub fn clear_ghost(&mut self, slot: usize) {
        let w = self.slot_word(slot);
        debug_assert!(w < 0);
        self.set_slot_word(slot, -w);
    }

    fn make_poormkey(suffix: &[u8]) -> u16 {
        let b0 = suffix.get(0).copied().unwrap_or(0);
        let b1 = suffix.get(1).copied().unwrap_or(0);
        u16::from_be_bytes([b0, b1])
    }

    // -- fence keys ---------------------------------------------------------

    fn fence_record_off(&self) -> usize {
        self.record_off(0)
    }

    pub fn fence_low(&self) -> BTreeKey {
        let off = self.fence_record_off() + 8;
        let low_len = self.read_u16(OFF_FENCE_LOW_LEN) as usize;
        BTreeKey::from_serialized(&self.bytes[off..off + low_len])
    }

    pub fn fence_high(&self) -> BTreeKey {
        let low_len = self.read_u16(OFF_FENCE_LOW_LEN) as usize;
        let high_len = self.read_u16(OFF_FENCE_HIGH_LEN) as usize;
        let off = self.fence_record_off() + 8 + low_len;
        BTreeKey::from_serialized(&self.bytes[off..off + high_len])
    }

    /// High fence of the rightmost page of the foster chain starting here;
    /// equals `fence_high` when this page has no foster chain.
    pub fn chain_fence_high(&self) -> BTreeKey {
        let chain_len = self.read_u16(OFF_CHAIN_HIGH_LEN) as usize;
        if chain_len == 0 {
            return self.fence_high();
        }
        let low_len = self.read_u16(OFF_FENCE_LOW_LEN) as usize;
        let high_len = self.read_u16(OFF_FENCE_HIGH_LEN) as usize;
        let off = self.fence_record_off() + 8 + low_len + high_len;
        BTreeKey::from_serialized(&self.bytes[off..off + chain_len])
    }

    pub fn has_chain_fence_high(&self) -> bool {
        self.read_u16(OFF_CHAIN_HIGH_LEN) != 0
    }

    pub fn fence_contains(&self, key: &BTreeKey) -> bool {
        let low = self.fence_low();
        if key < &low {
            return false;
        }
        let high = self.fence_high();
        if high.is_pos_inf() {
            return true;
        }
        key < &high
    }

    /// Keys at or past the high fence belong to the foster chain.
    pub fn belongs_to_foster(&self, key: &BTreeKey) -> bool {
        let high = self.fence_high();
        !high.is_pos_inf() && key >= &high && self.has_foster()
    }

    // -- format -------------------------------------------------------------

    /// Initialize an empty page. Existing contents are discarded.
    #[allow(clippy::too_many_arguments)]
    pub fn format(
        &mut self,
        pid: PageId,
        store: StoreId,
        root: PageId,
        level: u16,
        pid0: PageId,
        foster: PageId,
        foster_emlsn: Lsn,
        low: &BTreeKey,
        high: &BTreeKey,
        chain_high: Option<&BTreeKey>,
    ) {
        for b in self.bytes.iter_mut() {
            *b = 0;
        }
        self.write_u32(OFF_PID, pid);
        self.write_u32(OFF_STORE, store);
        self.write_u32(OFF_ROOT, root);
        self.write_u16(OFF_LEVEL, level);
        self.write_u16(OFF_FLAGS, PageTag::BTree as u16);
        self.write_u32(OFF_PID0, pid0);
        self.write_u32(OFF_FOSTER, foster);
        self.write_u64(OFF_FOSTER_EMLSN, foster_emlsn.to_u64());

        let prefix = low.common_leading_bytes(high);
        self.write_u16(OFF_PREFIX_LEN, prefix as u16);
        self.write_u16(OFF_FENCE_LOW_LEN, low.serialized_len() as u16);
        self.write_u16(OFF_FENCE_HIGH_LEN, high.serialized_len() as u16);
        let chain_bytes: &[u8] = match chain_high {
            Some(c) => c.serialized(),
            None => &[],
        };
        self.write_u16(OFF_CHAIN_HIGH_LEN, chain_bytes.len() as u16);

        // fence record in slot 0
        let body_len = 8 + low.serialized_len() + high.serialized_len() + chain_bytes.len();
        let rec_len = align8(body_len);
        let off = REC_AREA_END - rec_len;
        self.write_u16(off, rec_len as u16);
        self.write_u16(off + 2, low.serialized_len() as u16);
        self.write_u16(off + 4, high.serialized_len() as u16);
        self.write_u16(off + 6, chain_bytes.len() as u16);
        let mut pos = off + 8;
        self.bytes[pos..pos + low.serialized_len()].copy_from_slice(low.serialized());
        pos += low.serialized_len();
        self.bytes[pos..pos + high.serialized_len()].copy_from_slice(high.serialized());
        pos += high.serialized_len();
        self.bytes[pos..pos + chain_bytes.len()].copy_from_slice(chain_bytes);

        self.write_u16(OFF_NSLOTS, 1);
        self.write_u16(OFF_REC_AREA_START, off as u16);
        self.set_slot_word(0, (off / 8) as i16);
    }

    // -- space accounting ---------------------------------------------------

    pub fn free_space(&self) -> usize {
        let slots_end = HEADER_SIZE + self.nslots() * SLOT_SIZE;
        self.rec_area_start().saturating_sub(slots_end)
    }

    fn key_suffix_of<'a>(&self, key: &'a BTreeKey) -> &'a [u8] {
        let prefix = self.prefix_len();
        debug_assert!(key.serialized_len() >= prefix);
        &key.serialized()[prefix..]
    }

    fn leaf_record_size(&self, key: &BTreeKey, value_len: usize) -> usize {
        align8(6 + (key.serialized_len() - self.prefix_len()) + value_len)
    }

    fn node_record_size(&self, key: &BTreeKey) -> usize {
        align8(16 + (key.serialized_len() - self.prefix_len()))
    }

    pub fn check_space_for_leaf_insert(&self, key: &BTreeKey, value_len: usize) -> bool {
        self.free_space() >= self.leaf_record_size(key, value_len) + SLOT_SIZE
    }

    pub fn check_space_for_node_insert(&self, key: &BTreeKey) -> bool {
        self.free_space() >= self.node_record_size(key) + SLOT_SIZE
    }

    // -- search -------------------------------------------------------------

    /// Binary search over slots 1..=nrecs. `Ok(slot)` on an exact match,
    /// `Err(slot)` with the insertion position otherwise (the slot index a
    /// new record with this key would take).
    pub fn search(&self, key: &BTreeKey) -> Result<usize, usize> {
        let suffix = self.key_suffix_of(key);
        let pmk = Self::make_poormkey(suffix);
        let mut lo = 1usize;
        let mut hi = self.nrecs() + 1;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mid_pmk = self.poormkey(mid);
            let ord = if mid_pmk != pmk {
                mid_pmk.cmp(&pmk)
            } else {
                // poor-man's keys match: now touch the record
                self.record_suffix(mid).cmp(suffix)
            };
            match ord {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    fn record_suffix(&self, slot: usize) -> &[u8] {
        let off = self.record_off(slot);
        if self.is_leaf() {
            let key_len = self.read_u16(off + 2) as usize;
            &self.bytes[off + 6..off + 6 + key_len]
        } else {
            let key_len = self.read_u16(off + 14) as usize;
            &self.bytes[off + 16..off + 16 + key_len]
        }
    }

    pub fn key_at(&self, slot: usize) -> BTreeKey {
        let prefix = &self.fence_low().serialized()[..self.prefix_len()].to_vec();
        BTreeKey::from_prefix_and_suffix(prefix, self.record_suffix(slot))
    }

    // -- leaf records -------------------------------------------------------

    pub fn leaf_value(&self, slot: usize) -> &[u8] {
        debug_assert!(self.is_leaf());
        let off = self.record_off(slot);
        let key_len = self.read_u16(off + 2) as usize;
        let val_len = self.read_u16(off + 4) as usize;
        &self.bytes[off + 6 + key_len..off + 6 + key_len + val_len]
    }

    /// Total bytes reserved for this record; a ghost can be reused by any
    /// record that fits.
    pub fn record_reserved_len(&self, slot: usize) -> usize {
        debug_assert!(self.is_leaf());
        let off = self.record_off(slot);
        self.read_u16(off) as usize
    }

    /// Insert a record at `slot`, shifting later slots right.
    pub fn leaf_insert(
        &mut self,
        slot: usize,
        key: &BTreeKey,
        value: &[u8],
        ghost: bool,
    ) -> DbResult {
        debug_assert!(self.is_leaf());
        debug_assert!(slot >= 1 && slot <= self.nrecs() + 1);
        let suffix = self.key_suffix_of(key).to_vec();
        let rec_len = self.leaf_record_size(key, value.len());
        if self.free_space() < rec_len + SLOT_SIZE {
            return Err(db_error!(
                ErrorCode::RecWontFit,
                "leaf record of {} bytes does not fit",
                rec_len
            ));
        }
        let off = self.rec_area_start() - rec_len;
        self.write_u16(off, rec_len as u16);
        self.write_u16(off + 2, suffix.len() as u16);
        self.write_u16(off + 4, value.len() as u16);
        self.bytes[off + 6..off + 6 + suffix.len()].copy_from_slice(&suffix);
        self.bytes[off + 6 + suffix.len()..off + 6 + suffix.len() + value.len()]
            .copy_from_slice(value);
        self.write_u16(OFF_REC_AREA_START, off as u16);
        self.open_slot(slot);
        let word = (off / 8) as i16;
        self.set_slot_word(slot, if ghost { -word } else { word });
        self.set_poormkey(slot, Self::make_poormkey(&suffix));
        Ok(())
    }

    /// Replace the value of an existing record in place. The new value
    /// must fit in the record's reserved space.
    pub fn leaf_replace_value(&mut self, slot: usize, value: &[u8]) -> DbResult {
        debug_assert!(self.is_leaf());
        let off = self.record_off(slot);
        let rec_len = self.read_u16(off) as usize;
        let key_len = self.read_u16(off + 2) as usize;
        if 6 + key_len + value.len() > rec_len {
            return Err(db_error!(
                ErrorCode::RecWontFit,
                "value of {} bytes exceeds reserved {}",
                value.len(),
                rec_len
            ));
        }
        self.write_u16(off + 4, value.len() as u16);
        self.bytes[off + 6 + key_len..off + 6 + key_len + value.len()].copy_from_slice(value);
        Ok(())
    }

    /// Splice `bytes` into the value at `at`.
    pub fn leaf_overwrite_value(&mut self, slot: usize, at: usize, new_bytes: &[u8]) -> DbResult {
        debug_assert!(self.is_leaf());
        let off = self.record_off(slot);
        let key_len = self.read_u16(off + 2) as usize;
        let val_len = self.read_u16(off + 4) as usize;
        if at + new_bytes.len() > val_len {
            return Err(db_error!(
                ErrorCode::BadArgument,
                "overwrite range {}+{} exceeds value length {}",
                at,
                new_bytes.len(),
                val_len
            ));
        }
        let start = off + 6 + key_len + at;
        self.bytes[start..start + new_bytes.len()].copy_from_slice(new_bytes);
        Ok(())
    }

    // -- node records -------------------------------------------------------

    pub fn node_child(&self, slot: usize) -> PageId {
        debug_assert!(self.is_node());
        self.read_u32(self.record_off(slot))
    }

    pub fn set_node_child(&mut self, slot: usize, pid: PageId) {
        debug_assert!(self.is_node());
        let off = self.record_off(slot);
        self.write_u32(off, pid);
    }

    pub fn node_emlsn(&self, slot: usize) -> Lsn {
        debug_assert!(self.is_node());
        Lsn::from_u64(self.read_u64(self.record_off(slot) + 4))
    }

    pub fn set_node_emlsn(&mut self, slot: usize, lsn: Lsn) {
        debug_assert!(self.is_node());
        let off = self.record_off(slot);
        self.write_u64(off + 4, lsn.to_u64());
    }

    /// The expected-minimum LSN this page records for a child pointer,
    /// bounding single-page recovery of that child. pid0 carries no EMLSN
    /// slot; null means "no bound".
    pub fn emlsn_for_child(&self, pid: PageId) -> Lsn {
        if self.foster() == pid {
            return self.foster_emlsn();
        }
        if self.is_node() {
            for slot in 1..=self.nrecs() {
                if self.node_child(slot) == pid {
                    return self.node_emlsn(slot);
                }
            }
        }
        Lsn::NULL
    }

    pub fn node_insert(
        &mut self,
        slot: usize,
        key: &BTreeKey,
        child: PageId,
        emlsn: Lsn,
    ) -> DbResult {
        debug_assert!(self.is_node());
        let suffix = self.key_suffix_of(key).to_vec();
        let rec_len = self.node_record_size(key);
        if self.free_space() < rec_len + SLOT_SIZE {
            return Err(db_error!(
                ErrorCode::RecWontFit,
                "node record of {} bytes does not fit",
                rec_len
            ));
        }
        let off = self.rec_area_start() - rec_len;
        self.write_u32(off, child);
        self.write_u64(off + 4, emlsn.to_u64());
        self.write_u16(off + 12, rec_len as u16);
        self.write_u16(off + 14, suffix.len() as u16);
        self.bytes[off + 16..off + 16 + suffix.len()].copy_from_slice(&suffix);
        self.write_u16(OFF_REC_AREA_START, off as u16);
        self.open_slot(slot);
        self.set_slot_word(slot, (off / 8) as i16);
        self.set_poormkey(slot, Self::make_poormkey(&suffix));
        Ok(())
    }

    /// The child covering `key`: pid0 below the first separator, otherwise
    /// the child of the last separator <= key. Returns (slot, child); slot 0
    /// means pid0.
    pub fn node_child_for(&self, key: &BTreeKey) -> (usize, PageId) {
        match self.search(key) {
            Ok(slot) => (slot, self.node_child(slot)),
            Err(pos) => {
                if pos <= 1 {
                    (0, self.pid0())
                } else {
                    (pos - 1, self.node_child(pos - 1))
                }
            }
        }
    }

    /// The child whose separator is >= key (backward-cursor positioning).
    pub fn node_child_for_high(&self, key: &BTreeKey) -> (usize, PageId) {
        let n = self.nrecs();
        if n == 0 {
            return (0, self.pid0());
        }
        match self.search(key) {
            Ok(slot) | Err(slot) => {
                if slot > n {
                    (n, self.node_child(n))
                } else {
                    (slot, self.node_child(slot))
                }
            }
        }
    }

    // -- slot shifting and removal -----------------------------------------

    fn open_slot(&mut self, slot: usize) {
        let n = self.nslots();
        debug_assert!(slot >= 1 && slot <= n);
        // shift slots [slot, n) up by one
        for i in (slot..n).rev() {
            let w = self.slot_word(i);
            let p = self.poormkey(i);
            self.set_slot_word(i + 1, w);
            self.set_poormkey(i + 1, p);
        }
        self.write_u16(OFF_NSLOTS, (n + 1) as u16);
    }

    /// Drop a slot entirely (used when rebuilding and by de-adopt). The
    /// record bytes stay behind as garbage until a defrag pass.
    pub fn remove_slot(&mut self, slot: usize) {
        let n = self.nslots();
        debug_assert!(slot >= 1 && slot < n);
        for i in slot + 1..n {
            let w = self.slot_word(i);
            let p = self.poormkey(i);
            self.set_slot_word(i - 1, w);
            self.set_poormkey(i - 1, p);
        }
        self.write_u16(OFF_NSLOTS, (n - 1) as u16);
    }

    // -- bulk record movement (structure modifications) ---------------------

    /// Lift records in `slots` (ascending, 1-based) off the page.
    pub fn collect_records(&self, from_slot: usize, to_slot: usize) -> Vec<MovedRecord> {
        let mut out = Vec::new();
        for slot in from_slot..to_slot {
            let key = self.key_at(slot);
            let body = if self.is_leaf() {
                RecordBody::Leaf {
                    value: self.leaf_value(slot).to_vec(),
                    ghost: self.is_ghost(slot),
                }
            } else {
                RecordBody::Node {
                    child: self.node_child(slot),
                    emlsn: self.node_emlsn(slot),
                }
            };
            out.push(MovedRecord { key, body });
        }
        out
    }

    /// Append records assuming ascending key order (rebuild path).
    pub fn append_records(&mut self, records: &[MovedRecord]) -> DbResult {
        for r in records {
            let slot = self.nrecs() + 1;
            match &r.body {
                RecordBody::Leaf { value, ghost } => {
                    self.leaf_insert(slot, &r.key, value, *ghost)?;
                }
                RecordBody::Node { child, emlsn } => {
                    self.node_insert(slot, &r.key, *child, *emlsn)?;
                }
            }
        }
        Ok(())
    }

    /// Rewrite this page with new fences and the given records. Used by
    /// rebalance, merge and defrag application; the caller supplies the
    /// surviving records in order.
    #[allow(clippy::too_many_arguments)]
    pub fn rebuild(
        &mut self,
        low: &BTreeKey,
        high: &BTreeKey,
        chain_high: Option<&BTreeKey>,
        pid0: PageId,
        foster: PageId,
        foster_emlsn: Lsn,
        records: &[MovedRecord],
    ) -> DbResult {
        let pid = self.pid();
        let store = self.store_id();
        let root = self.root_pid();
        let level = self.level();
        let lsn = self.page_lsn();
        let skew = self.skew_counter();
        self.format(
            pid,
            store,
            root,
            level,
            pid0,
            foster,
            foster_emlsn,
            low,
            high,
            chain_high,
        );
        self.set_page_lsn(lsn);
        self.write_i16(OFF_SKEW, skew);
        self.append_records(records)
    }

    /// Reclaim the space of ghost records. Returns the number reclaimed.
    pub fn defrag(&mut self) -> DbResult<usize> {
        let live: Vec<MovedRecord> = (1..=self.nrecs())
            .filter(|s| !self.is_ghost(*s))
            .map(|s| MovedRecord {
                key: self.key_at(s),
                body: if self.is_leaf() {
                    RecordBody::Leaf {
                        value: self.leaf_value(s).to_vec(),
                        ghost: false,
                    }
                } else {
                    RecordBody::Node {
                        child: self.node_child(s),
                        emlsn: self.node_emlsn(s),
                    }
                },
            })
            .collect();
        let reclaimed = self.nrecs() - live.len();
        let low = self.fence_low();
        let high = self.fence_high();
        let chain = if self.has_chain_fence_high() {
            Some(self.chain_fence_high())
        } else {
            None
        };
        let (pid0, foster, femlsn) = (self.pid0(), self.foster(), self.foster_emlsn());
        self.rebuild(&low, &high, chain.as_ref(), pid0, foster, femlsn, &live)?;
        Ok(reclaimed)
    }

    // -- split pivot --------------------------------------------------------

    /// Choose the first slot that moves to the foster child and the
    /// separator key. Extreme right skew keeps the new page nearly empty so
    /// appends land there; left skew is symmetric; otherwise the record
    /// giving the shortest separator near the middle wins.
    pub fn suggest_fence_for_split(&self, triggering_key: &BTreeKey) -> (usize, BTreeKey) {
        let n = self.nrecs();
        debug_assert!(n >= 2);
        if self.is_insertion_extremely_skewed_right() {
            // everything stays; only keys >= the trigger move
            let pos = match self.search(triggering_key) {
                Ok(s) => s,
                Err(s) => s,
            };
            let pos = pos.max(n.saturating_sub(1)).min(n);
            let sep = BTreeKey::shortest_separator(&self.key_at(pos - 1), &self.key_at(pos));
            return (pos, sep);
        }
        if self.is_insertion_skewed_left() {
            let pos = 2.min(n);
            let sep = BTreeKey::shortest_separator(&self.key_at(pos - 1), &self.key_at(pos));
            return (pos, sep);
        }
        // search the middle third for the shortest separator
        let lo = (n / 3).max(1);
        let hi = (2 * n / 3).max(lo + 1).min(n);
        let mut best = lo + 1;
        let mut best_len = usize::MAX;
        for pos in lo + 1..=hi {
            let sep = BTreeKey::shortest_separator(&self.key_at(pos - 1), &self.key_at(pos));
            if sep.serialized_len() < best_len {
                best_len = sep.serialized_len();
                best = pos;
            }
        }
        let sep = BTreeKey::shortest_separator(&self.key_at(best - 1), &self.key_at(best));
        (best, sep)
    }

    // -- consistency --------------------------------------------------------

    /// Structural self-check: ordered keys, fences honored, offsets sane.
    pub fn is_consistent(&self) -> bool {
        if !self.lsn_consistent() {
            return false;
        }
        let slots_end = HEADER_SIZE + self.nslots() * SLOT_SIZE;
        if self.rec_area_start() < slots_end || self.rec_area_start() > REC_AREA_END {
            return false;
        }
        let low = self.fence_low();
        let high = self.fence_high();
        let prefix = low.common_leading_bytes(&high);
        if prefix != self.prefix_len() {
            return false;
        }
        let mut prev: Option<BTreeKey> = None;
        for slot in 1..=self.nrecs() {
            let key = self.key_at(slot);
            if key < low {
                return false;
            }
            if !high.is_pos_inf() && key >= high {
                return false;
            }
            if let Some(p) = &prev {
                if p >= &key {
                    return false;
                }
            }
            prev = Some(key);
        }
        true
    }
}

impl Default for PageData {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_page() -> PageData {
        let mut p = PageData::new();
        p.format(
            5,
            1,
            5,
            1,
            0,
            0,
            Lsn::NULL,
            &BTreeKey::neg_inf(),
            &BTreeKey::pos_inf(),
            None,
        );
        p
    }

    #[test]
    fn test_format_fences() {
        let p = leaf_page();
        assert!(p.fence_low().is_neg_inf());
        assert!(p.fence_high().is_pos_inf());
        assert_eq!(p.prefix_len(), 0);
        assert_eq!(p.nrecs(), 0);
        assert!(p.is_consistent());
    }

    #[test]
    fn test_insert_search() {
        let mut p = leaf_page();
        for k in ["aa1", "aa3", "aa5"].iter() {
            let key = BTreeKey::regular(k.as_bytes());
            let pos = p.search(&key).unwrap_err();
            p.leaf_insert(pos, &key, b"d", false).unwrap();
        }
        assert_eq!(p.nrecs(), 3);
        assert!(p.search(&BTreeKey::regular(b"aa3")).is_ok());
        assert_eq!(p.search(&BTreeKey::regular(b"aa2")), Err(2));
        assert_eq!(p.search(&BTreeKey::regular(b"aa0")), Err(1));
        assert_eq!(p.search(&BTreeKey::regular(b"zz")), Err(4));
        assert_eq!(p.key_at(2), BTreeKey::regular(b"aa3"));
        assert!(p.is_consistent());
    }

    #[test]
    fn test_out_of_order_insert_positions() {
        let mut p = leaf_page();
        let keys = ["m", "c", "x", "a", "t"];
        for k in keys.iter() {
            let key = BTreeKey::regular(k.as_bytes());
            let pos = p.search(&key).unwrap_err();
            p.leaf_insert(pos, &key, k.as_bytes(), false).unwrap();
        }
        let mut collected = Vec::new();
        for s in 1..=p.nrecs() {
            collected.push(p.key_at(s));
        }
        let mut sorted = collected.clone();
        sorted.sort();
        assert_eq!(collected, sorted);
        assert!(p.is_consistent());
    }

    #[test]
    fn test_prefix_truncation() {
        let mut p = PageData::new();
        p.format(
            9,
            1,
            9,
            1,
            0,
            0,
            Lsn::NULL,
            &BTreeKey::regular(b"000000100"),
            &BTreeKey::regular(b"000000999"),
            None,
        );
        // sign byte + 6 zeros + "" == 7 common bytes
        assert_eq!(p.prefix_len(), 7);
        let key = BTreeKey::regular(b"000000500");
        let pos = p.search(&key).unwrap_err();
        p.leaf_insert(pos, &key, b"v", false).unwrap();
        // round trip through the truncated storage
        assert_eq!(p.key_at(1), key);
        // suffix stored is only the distinguishing tail
        let reserved = p.record_reserved_len(1);
        assert!(reserved <= align8(6 + 3 + 1));
    }

    #[test]
    fn test_ghost_mark_and_convert() {
        let mut p = leaf_page();
        let key = BTreeKey::regular(b"k1");
        p.leaf_insert(1, &key, b"value1", false).unwrap();
        assert!(!p.is_ghost(1));
        p.set_ghost(1);
        assert!(p.is_ghost(1));
        // a ghost still occupies its slot and keeps its key
        assert_eq!(p.key_at(1), key);
        p.clear_ghost(1);
        p.leaf_replace_value(1, b"val2").unwrap();
        assert_eq!(p.leaf_value(1), b"val2");
    }

    #[test]
    fn test_replace_respects_reserved_space() {
        let mut p = leaf_page();
        let key = BTreeKey::regular(b"k");
        p.leaf_insert(1, &key, b"12345", false).unwrap();
        // the 8-byte alignment slack is usable
        assert!(p.leaf_replace_value(1, b"12345678").is_ok());
        assert!(p
            .leaf_replace_value(1, &vec![b'x'; 64])
            .unwrap_err()
            .code()
            == ErrorCode::RecWontFit);
    }

    #[test]
    fn test_fill_until_wont_fit() {
        let mut p = leaf_page();
        let value = vec![7u8; 64];
        let mut count = 0;
        loop {
            let key = BTreeKey::regular(format!("key{:06}", count).as_bytes());
            if !p.check_space_for_leaf_insert(&key, value.len()) {
                break;
            }
            let pos = p.search(&key).unwrap_err();
            p.leaf_insert(pos, &key, &value, false).unwrap();
            count += 1;
        }
        assert!(count > 50);
        let key = BTreeKey::regular(b"zzz");
        assert_eq!(
            p.leaf_insert(p.nrecs() + 1, &key, &value, false)
                .unwrap_err()
                .code(),
            ErrorCode::RecWontFit
        );
        assert!(p.is_consistent());
    }

    #[test]
    fn test_defrag_reclaims_ghosts() {
        let mut p = leaf_page();
        for i in 0..10 {
            let key = BTreeKey::regular(format!("k{:02}", i).as_bytes());
            p.leaf_insert(i + 1, &key, b"some value", false).unwrap();
        }
        let before = p.free_space();
        p.set_ghost(3);
        p.set_ghost(7);
        let reclaimed = p.defrag().unwrap();
        assert_eq!(reclaimed, 2);
        assert_eq!(p.nrecs(), 8);
        assert!(p.free_space() > before);
        assert!(p.is_consistent());
    }

    #[test]
    fn test_node_children() {
        let mut p = PageData::new();
        p.format(
            3,
            1,
            3,
            2,
            100,
            0,
            Lsn::NULL,
            &BTreeKey::neg_inf(),
            &BTreeKey::pos_inf(),
            None,
        );
        p.node_insert(1, &BTreeKey::regular(b"g"), 101, Lsn::NULL)
            .unwrap();
        p.node_insert(2, &BTreeKey::regular(b"p"), 102, Lsn::NULL)
            .unwrap();
        assert_eq!(p.node_child_for(&BTreeKey::regular(b"a")).1, 100);
        assert_eq!(p.node_child_for(&BTreeKey::regular(b"g")).1, 101);
        assert_eq!(p.node_child_for(&BTreeKey::regular(b"m")).1, 101);
        assert_eq!(p.node_child_for(&BTreeKey::regular(b"q")).1, 102);
        assert!(p.is_consistent());
    }

    #[test]
    fn test_moved_records_round_trip() {
        let records = vec![
            MovedRecord {
                key: BTreeKey::regular(b"aa"),
                body: RecordBody::Leaf {
                    value: b"v1".to_vec(),
                    ghost: false,
                },
            },
            MovedRecord {
                key: BTreeKey::regular(b"bb"),
                body: RecordBody::Leaf {
                    value: vec![],
                    ghost: true,
                },
            },
            MovedRecord {
                key: BTreeKey::regular(b"cc"),
                body: RecordBody::Node {
                    child: 42,
                    emlsn: Lsn::new(1, 128),
                },
            },
        ];
        let bytes = encode_records(&records);
        assert_eq!(decode_records(&bytes), records);
    }

    #[test]
    fn test_skew_tracking() {
        let mut p = leaf_page();
        for i in 0..SKEW_THRESHOLD as usize + 1 {
            let key = BTreeKey::regular(format!("k{:04}", i).as_bytes());
            let pos = p.search(&key).unwrap_err();
            p.leaf_insert(pos, &key, b"v", false).unwrap();
            p.track_insertion_skew(pos);
        }
        assert!(p.is_insertion_extremely_skewed_right());
        // one out-of-order insert resets the counter
        let key = BTreeKey::regular(b"k0000a");
        let pos = p.search(&key).unwrap_err();
        p.leaf_insert(pos, &key, b"v", false).unwrap();
        p.track_insertion_skew(pos);
        assert!(!p.is_insertion_extremely_skewed_right());
    }

    #[test]
    fn test_lsn_footer_duplicate() {
        let mut p = leaf_page();
        p.set_page_lsn(Lsn::new(4, 96));
        assert!(p.lsn_consistent());
        assert_eq!(p.page_lsn(), Lsn::new(4, 96));
        // simulate a torn write
        let mut torn = p.clone();
        torn.bytes[PAGE_SIZE - 1] ^= 0x1;
        assert!(!torn.lsn_consistent());
    }

    #[test]
    fn test_checksum() {
        let mut p = leaf_page();
        p.leaf_insert(1, &BTreeKey::regular(b"x"), b"y", false)
            .unwrap();
        p.update_checksum();
        assert!(p.verify_checksum());
        let mut bad = p.clone();
        bad.bytes[2000] ^= 0xFF;
        assert!(!bad.verify_checksum());
    }
}
