//! Log record framing and typed payloads.
//!
//! On disk every record is
//! `{u16 len, u8 kind, u8 flags, u32 xct, u64 prev_lsn, u64 page_prev_lsn,
//!   u32 page_id, u16 payload_len, payload, u16 len_dup}`.
//! The duplicated length trailer lets a backward scan find record starts
//! and doubles as a torn-write check. A record touching two pages (the
//! structure modifications) carries the second page id at the head of its
//! payload.

use bytes::BufMut;

use crate::{
    btree::key::BTreeKey,
    log::lsn::Lsn,
    types::{PageId, TransactionId},
};

pub const LOG_HEADER_SIZE: usize = 30;
pub const LOG_TRAILER_SIZE: usize = 2;

/// Smallest legal record: a bare skip.
pub const MIN_RECORD_SIZE: usize = LOG_HEADER_SIZE + LOG_TRAILER_SIZE;

pub const FLAG_SSX: u8 = 0x01;
pub const FLAG_CLR: u8 = 0x02;
pub const FLAG_UNDOABLE: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordKind {
    /// Fills the tail of a block or partition; never applied.
    Skip = 0,

    XctBegin = 1,
    XctCommit = 2,
    XctAbort = 3,
    XctEnd = 4,

    Insert = 5,
    GhostReserve = 6,
    GhostMark = 7,
    GhostUnmark = 8,
    Update = 9,
    Overwrite = 10,

    PageImgFormat = 11,
    NorecAlloc = 12,
    FosterRebalance = 13,
    FosterMerge = 14,
    FosterAdopt = 15,
    FosterDeadopt = 16,
    TreeGrow = 17,
    TreeShrink = 18,
    DefragPage = 19,

    StoreCreate = 20,
    CheckpointBegin = 21,
    CheckpointEnd = 22,

    /// Pure compensation: no redo effect, only an undo-next jump. Written
    /// by compensation anchors to make a record range atomic for rollback.
    Compensate = 23,
}

impl LogRecordKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        use LogRecordKind::*;
        Some(match v {
            0 => Skip,
            1 => XctBegin,
            2 => XctCommit,
            3 => XctAbort,
            4 => XctEnd,
            5 => Insert,
            6 => GhostReserve,
            7 => GhostMark,
            8 => GhostUnmark,
            9 => Update,
            10 => Overwrite,
            11 => PageImgFormat,
            12 => NorecAlloc,
            13 => FosterRebalance,
            14 => FosterMerge,
            15 => FosterAdopt,
            16 => FosterDeadopt,
            17 => TreeGrow,
            18 => TreeShrink,
            19 => DefragPage,
            20 => StoreCreate,
            21 => CheckpointBegin,
            22 => CheckpointEnd,
            23 => Compensate,
            _ => return None,
        })
    }

    /// Records whose redo mutates a page image.
    pub fn is_page_record(&self) -> bool {
        use LogRecordKind::*;
        matches!(
            self,
            Insert
                | GhostReserve
                | GhostMark
                | GhostUnmark
                | Update
                | Overwrite
                | PageImgFormat
                | NorecAlloc
                | FosterRebalance
                | FosterMerge
                | FosterAdopt
                | FosterDeadopt
                | TreeGrow
                | TreeShrink
                | DefragPage
        )
    }
}

#[derive(Clone)]
pub struct LogRecord {
    pub kind: LogRecordKind,
    pub flags: u8,
    pub xct_id: TransactionId,

    /// Previous record of the same transaction; heads the undo chain.
    pub prev_lsn: Lsn,

    /// The page's LSN before this update, forming the per-page chain that
    /// single-page recovery follows.
    pub page_prev_lsn: Lsn,

    pub page_id: PageId,
    pub payload: Vec<u8>,

    /// Where this record lives; assigned by the log manager on insert and
    /// by the scanner on read.
    pub lsn: Lsn,
}

impl LogRecord {
    pub fn new(kind: LogRecordKind, xct_id: TransactionId, page_id: PageId) -> Self {
        Self {
            kind,
            flags: 0,
            xct_id,
            prev_lsn: Lsn::NULL,
            page_prev_lsn: Lsn::NULL,
            page_id,
            payload: Vec::new(),
            lsn: Lsn::NULL,
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_ssx(&self) -> bool {
        self.flags & FLAG_SSX != 0
    }

    pub fn is_clr(&self) -> bool {
        self.flags & FLAG_CLR != 0
    }

    pub fn is_undoable(&self) -> bool {
        self.flags & FLAG_UNDOABLE != 0
    }

    pub fn total_len(&self) -> usize {
        LOG_HEADER_SIZE + self.payload.len() + LOG_TRAILER_SIZE
    }

    /// For a CLR, the LSN undo resumes from (stored at the payload head).
    pub fn undo_next(&self) -> Lsn {
        debug_assert!(self.is_clr());
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.payload[..8]);
        Lsn::from_u64(u64::from_le_bytes(b))
    }

    /// Payload bytes past the CLR undo-next prefix (if any).
    pub fn body(&self) -> &[u8] {
        if self.is_clr() {
            &self.payload[8..]
        } else {
            &self.payload
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let total = self.total_len();
        debug_assert!(total <= u16::MAX as usize);
        let mut buf = Vec::with_capacity(total);
        buf.put_u16_le(total as u16);
        buf.put_u8(self.kind as u8);
        buf.put_u8(self.flags);
        buf.put_u32_le(self.xct_id);
        buf.put_u64_le(self.prev_lsn.to_u64());
        buf.put_u64_le(self.page_prev_lsn.to_u64());
        buf.put_u32_le(self.page_id);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.put_u16_le(total as u16);
        buf
    }

    /// Decode one record from the start of `bytes`. Returns the record and
    /// its total length, or None on a malformed frame.
    pub fn decode(bytes: &[u8]) -> Option<(LogRecord, usize)> {
        if bytes.len() < MIN_RECORD_SIZE {
            return None;
        }
        let total = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        if total < MIN_RECORD_SIZE || total > bytes.len() {
            return None;
        }
        let kind = LogRecordKind::from_u8(bytes[2])?;
        let flags = bytes[3];
        let xct_id = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut u64buf = [0u8; 8];
        u64buf.copy_from_slice(&bytes[8..16]);
        let prev_lsn = Lsn::from_u64(u64::from_le_bytes(u64buf));
        u64buf.copy_from_slice(&bytes[16..24]);
        let page_prev_lsn = Lsn::from_u64(u64::from_le_bytes(u64buf));
        let page_id = u32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
        let payload_len = u16::from_le_bytes([bytes[28], bytes[29]]) as usize;
        if LOG_HEADER_SIZE + payload_len + LOG_TRAILER_SIZE != total {
            return None;
        }
        // torn-write check
        let dup = u16::from_le_bytes([bytes[total - 2], bytes[total - 1]]) as usize;
        if dup != total {
            return None;
        }
        let payload = bytes[LOG_HEADER_SIZE..LOG_HEADER_SIZE + payload_len].to_vec();
        Some((
            LogRecord {
                kind,
                flags,
                xct_id,
                prev_lsn,
                page_prev_lsn,
                page_id,
                payload,
                lsn: Lsn::NULL,
            },
            total,
        ))
    }

    /// A skip record padding exactly `len` bytes.
    pub fn skip(len: usize) -> LogRecord {
        debug_assert!(len >= MIN_RECORD_SIZE && len <= u16::MAX as usize);
        LogRecord::new(LogRecordKind::Skip, 0, 0)
            .with_payload(vec![0u8; len - MIN_RECORD_SIZE])
    }
}

// ---------------------------------------------------------------------------
// typed payloads
// ---------------------------------------------------------------------------

fn put_key(buf: &mut Vec<u8>, key: &BTreeKey) {
    buf.put_u16_le(key.serialized_len() as u16);
    buf.put_slice(key.serialized());
}

fn get_key(bytes: &[u8], pos: &mut usize) -> BTreeKey {
    let len = u16::from_le_bytes([bytes[*pos], bytes[*pos + 1]]) as usize;
    *pos += 2;
    let key = BTreeKey::from_serialized(&bytes[*pos..*pos + len]);
    *pos += len;
    key
}

fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.put_u16_le(data.len() as u16);
    buf.put_slice(data);
}

fn get_bytes<'a>(bytes: &'a [u8], pos: &mut usize) -> &'a [u8] {
    let len = u16::from_le_bytes([bytes[*pos], bytes[*pos + 1]]) as usize;
    *pos += 2;
    let out = &bytes[*pos..*pos + len];
    *pos += len;
    out
}

/// `Insert`, `GhostMark`, `GhostUnmark`: a key plus (for insert) the value.
/// The store id makes logical undo independent of page boundaries.
pub struct KeyValuePayload {
    pub store: u32,
    pub key: BTreeKey,
    pub value: Vec<u8>,
}

impl KeyValuePayload {
    pub fn encode(store: u32, key: &BTreeKey, value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32_le(store);
        put_key(&mut buf, key);
        put_bytes(&mut buf, value);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let store = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut pos = 4;
        let key = get_key(bytes, &mut pos);
        let value = get_bytes(bytes, &mut pos).to_vec();
        Self { store, key, value }
    }
}

/// `GhostReserve`: key plus the record space to reserve.
pub struct GhostReservePayload {
    pub key: BTreeKey,
    pub value_len: u16,
}

impl GhostReservePayload {
    pub fn encode(key: &BTreeKey, value_len: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        put_key(&mut buf, key);
        buf.put_u16_le(value_len);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut pos = 0;
        let key = get_key(bytes, &mut pos);
        let value_len = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
        Self { key, value_len }
    }
}

/// `Update`: key, old value (for undo), new value (for redo).
pub struct UpdatePayload {
    pub store: u32,
    pub key: BTreeKey,
    pub old_value: Vec<u8>,
    pub new_value: Vec<u8>,
}

impl UpdatePayload {
    pub fn encode(store: u32, key: &BTreeKey, old_value: &[u8], new_value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32_le(store);
        put_key(&mut buf, key);
        put_bytes(&mut buf, old_value);
        put_bytes(&mut buf, new_value);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let store = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut pos = 4;
        let key = get_key(bytes, &mut pos);
        let old_value = get_bytes(bytes, &mut pos).to_vec();
        let new_value = get_bytes(bytes, &mut pos).to_vec();
        Self {
            store,
            key,
            old_value,
            new_value,
        }
    }
}

/// `Overwrite`: a byte-range splice within the value.
pub struct OverwritePayload {
    pub store: u32,
    pub key: BTreeKey,
    pub offset: u16,
    pub old_bytes: Vec<u8>,
    pub new_bytes: Vec<u8>,
}

impl OverwritePayload {
    pub fn encode(
        store: u32,
        key: &BTreeKey,
        offset: u16,
        old_bytes: &[u8],
        new_bytes: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32_le(store);
        put_key(&mut buf, key);
        buf.put_u16_le(offset);
        put_bytes(&mut buf, old_bytes);
        put_bytes(&mut buf, new_bytes);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let store = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut pos = 4;
        let key = get_key(bytes, &mut pos);
        let offset = u16::from_le_bytes([bytes[pos], bytes[pos + 1]]);
        pos += 2;
        let old_bytes = get_bytes(bytes, &mut pos).to_vec();
        let new_bytes = get_bytes(bytes, &mut pos).to_vec();
        Self {
            store,
            key,
            offset,
            old_bytes,
            new_bytes,
        }
    }
}

/// `NorecAlloc`: the parent reserves an empty foster child. Self-contained:
/// replays on either page.
pub struct NorecAllocPayload {
    pub new_page_id: PageId,
    pub store_id: u32,
    pub root_id: PageId,
    pub level: u16,
    pub fence: BTreeKey,
    pub chain_high: BTreeKey,
    /// Foster pointer the new page inherits from the parent.
    pub inherited_foster: PageId,
}

impl NorecAllocPayload {
    #[allow(clippy::too_many_arguments)]
    pub fn encode(
        new_page_id: PageId,
        store_id: u32,
        root_id: PageId,
        level: u16,
        fence: &BTreeKey,
        chain_high: &BTreeKey,
        inherited_foster: PageId,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32_le(new_page_id);
        buf.put_u32_le(store_id);
        buf.put_u32_le(root_id);
        buf.put_u16_le(level);
        buf.put_u32_le(inherited_foster);
        put_key(&mut buf, fence);
        put_key(&mut buf, chain_high);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut pos = 0;
        let new_page_id = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let store_id = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let root_id = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        let level = u16::from_le_bytes([bytes[12], bytes[13]]);
        let inherited_foster = u32::from_le_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]);
        pos += 18;
        let fence = get_key(bytes, &mut pos);
        let chain_high = get_key(bytes, &mut pos);
        Self {
            new_page_id,
            store_id,
            root_id,
            level,
            fence,
            chain_high,
            inherited_foster,
        }
    }
}

/// `FosterRebalance`: moves the tail of the source page into its foster
/// child. The full byte image of the moved records makes the record
/// self-contained for single-page recovery of either side.
pub struct FosterRebalancePayload {
    pub foster_pid: PageId,
    pub move_count: u16,
    /// New fence between the pair (source high = foster low).
    pub separator: BTreeKey,
    /// High fence of the foster child.
    pub foster_high: BTreeKey,
    pub chain_high: BTreeKey,
    /// pid0 of the foster child when rebalancing a node level.
    pub new_pid0: PageId,
    pub new_pid0_emlsn: Lsn,
    /// Serialized (key, value-or-child) pairs of the moved records.
    pub moved: Vec<u8>,
}

impl FosterRebalancePayload {
    #[allow(clippy::too_many_arguments)]
    pub fn encode(
        foster_pid: PageId,
        move_count: u16,
        separator: &BTreeKey,
        foster_high: &BTreeKey,
        chain_high: &BTreeKey,
        new_pid0: PageId,
        new_pid0_emlsn: Lsn,
        moved: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32_le(foster_pid);
        buf.put_u16_le(move_count);
        buf.put_u32_le(new_pid0);
        buf.put_u64_le(new_pid0_emlsn.to_u64());
        put_key(&mut buf, separator);
        put_key(&mut buf, foster_high);
        put_key(&mut buf, chain_high);
        buf.put_u32_le(moved.len() as u32);
        buf.put_slice(moved);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let foster_pid = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let move_count = u16::from_le_bytes([bytes[4], bytes[5]]);
        let new_pid0 = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        let mut u64buf = [0u8; 8];
        u64buf.copy_from_slice(&bytes[10..18]);
        let new_pid0_emlsn = Lsn::from_u64(u64::from_le_bytes(u64buf));
        let mut pos = 18;
        let separator = get_key(bytes, &mut pos);
        let foster_high = get_key(bytes, &mut pos);
        let chain_high = get_key(bytes, &mut pos);
        let mut u32buf = [0u8; 4];
        u32buf.copy_from_slice(&bytes[pos..pos + 4]);
        let moved_len = u32::from_le_bytes(u32buf) as usize;
        pos += 4;
        let moved = bytes[pos..pos + moved_len].to_vec();
        Self {
            foster_pid,
            move_count,
            separator,
            foster_high,
            chain_high,
            new_pid0,
            new_pid0_emlsn,
            moved,
        }
    }
}

/// `FosterMerge`: absorb the foster child back into its predecessor.
pub struct FosterMergePayload {
    pub foster_pid: PageId,
    /// Foster pointer and chain fence the merged page takes over.
    pub new_foster: PageId,
    pub new_foster_emlsn: Lsn,
    pub new_high: BTreeKey,
    pub new_chain_high: BTreeKey,
    /// Serialized records of the absorbed page.
    pub absorbed: Vec<u8>,
}

impl FosterMergePayload {
    pub fn encode(
        foster_pid: PageId,
        new_foster: PageId,
        new_foster_emlsn: Lsn,
        new_high: &BTreeKey,
        new_chain_high: &BTreeKey,
        absorbed: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32_le(foster_pid);
        buf.put_u32_le(new_foster);
        buf.put_u64_le(new_foster_emlsn.to_u64());
        put_key(&mut buf, new_high);
        put_key(&mut buf, new_chain_high);
        buf.put_u32_le(absorbed.len() as u32);
        buf.put_slice(absorbed);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let foster_pid = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let new_foster = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut u64buf = [0u8; 8];
        u64buf.copy_from_slice(&bytes[8..16]);
        let new_foster_emlsn = Lsn::from_u64(u64::from_le_bytes(u64buf));
        let mut pos = 16;
        let new_high = get_key(bytes, &mut pos);
        let new_chain_high = get_key(bytes, &mut pos);
        let mut u32buf = [0u8; 4];
        u32buf.copy_from_slice(&bytes[pos..pos + 4]);
        let absorbed_len = u32::from_le_bytes(u32buf) as usize;
        pos += 4;
        let absorbed = bytes[pos..pos + absorbed_len].to_vec();
        Self {
            foster_pid,
            new_foster,
            new_foster_emlsn,
            new_high,
            new_chain_high,
            absorbed,
        }
    }
}

/// `FosterAdopt` on the parent / `FosterDeadopt` reversal.
pub struct AdoptPayload {
    /// The page whose foster edge moves.
    pub child_pid: PageId,
    /// The foster child being adopted (or re-fostered).
    pub foster_pid: PageId,
    pub separator: BTreeKey,
    /// chain fence the child keeps (deadopt) or clears (adopt).
    pub chain_high: BTreeKey,
    pub foster_emlsn: Lsn,
}

impl AdoptPayload {
    pub fn encode(
        child_pid: PageId,
        foster_pid: PageId,
        separator: &BTreeKey,
        chain_high: &BTreeKey,
        foster_emlsn: Lsn,
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32_le(child_pid);
        buf.put_u32_le(foster_pid);
        buf.put_u64_le(foster_emlsn.to_u64());
        put_key(&mut buf, separator);
        put_key(&mut buf, chain_high);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let child_pid = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let foster_pid = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut u64buf = [0u8; 8];
        u64buf.copy_from_slice(&bytes[8..16]);
        let foster_emlsn = Lsn::from_u64(u64::from_le_bytes(u64buf));
        let mut pos = 16;
        let separator = get_key(bytes, &mut pos);
        let chain_high = get_key(bytes, &mut pos);
        Self {
            child_pid,
            foster_pid,
            separator,
            chain_high,
            foster_emlsn,
        }
    }
}

/// `TreeGrow` / `TreeShrink`: the other page involved plus a full page
/// image, making the single record self-contained for either page.
pub struct TreeImgPayload {
    pub other_pid: PageId,
    pub image: Vec<u8>,
}

impl TreeImgPayload {
    pub fn encode(other_pid: PageId, image: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + image.len());
        buf.put_u32_le(other_pid);
        buf.put_slice(image);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            other_pid: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            image: bytes[4..].to_vec(),
        }
    }
}

/// `StoreCreate`: a new store and its root page.
pub struct StoreCreatePayload {
    pub store_id: u32,
    pub root_pid: PageId,
}

impl StoreCreatePayload {
    pub fn encode(store_id: u32, root_pid: PageId) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u32_le(store_id);
        buf.put_u32_le(root_pid);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            store_id: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            root_pid: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let mut rec = LogRecord::new(LogRecordKind::Insert, 42, 7)
            .with_flags(FLAG_UNDOABLE)
            .with_payload(KeyValuePayload::encode(3, &BTreeKey::regular(b"aa1"), b"d1"));
        rec.prev_lsn = Lsn::new(1, 64);
        rec.page_prev_lsn = Lsn::new(1, 32);

        let bytes = rec.encode();
        assert_eq!(bytes.len(), rec.total_len());

        let (back, len) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(len, bytes.len());
        assert_eq!(back.kind, LogRecordKind::Insert);
        assert_eq!(back.xct_id, 42);
        assert_eq!(back.page_id, 7);
        assert_eq!(back.prev_lsn, Lsn::new(1, 64));
        assert_eq!(back.page_prev_lsn, Lsn::new(1, 32));
        assert!(back.is_undoable());

        let kv = KeyValuePayload::decode(back.body());
        assert_eq!(kv.store, 3);
        assert_eq!(kv.key, BTreeKey::regular(b"aa1"));
        assert_eq!(kv.value, b"d1");
    }

    #[test]
    fn test_torn_trailer_rejected() {
        let rec = LogRecord::new(LogRecordKind::XctCommit, 1, 0);
        let mut bytes = rec.encode();
        let n = bytes.len();
        bytes[n - 1] ^= 0xFF;
        assert!(LogRecord::decode(&bytes).is_none());
    }

    #[test]
    fn test_skip_padding() {
        let rec = LogRecord::skip(100);
        assert_eq!(rec.total_len(), 100);
        let bytes = rec.encode();
        let (back, len) = LogRecord::decode(&bytes).unwrap();
        assert_eq!(len, 100);
        assert_eq!(back.kind, LogRecordKind::Skip);
    }

    #[test]
    fn test_clr_undo_next() {
        let mut payload = Lsn::new(2, 96).to_u64().to_le_bytes().to_vec();
        payload.extend_from_slice(&KeyValuePayload::encode(
            1,
            &BTreeKey::regular(b"k"),
            b"",
        ));
        let rec = LogRecord::new(LogRecordKind::GhostMark, 9, 3)
            .with_flags(FLAG_CLR)
            .with_payload(payload);
        assert_eq!(rec.undo_next(), Lsn::new(2, 96));
        let kv = KeyValuePayload::decode(rec.body());
        assert_eq!(kv.key, BTreeKey::regular(b"k"));
    }
}
