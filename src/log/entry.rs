//! Log record framing and payload types.
//!
//! Every durable fact in the engine is one self-describing record in the
//! append-only log:
//!
//! ```text
//! [magic u8][type u8][size u32][entry-id u64][txn-id u64][prev-offset u64][crc32 u32][payload…]
//! ```
//!
//! - `magic` is [`LOG_MAGIC`]; anything else means a bad seek or corruption.
//! - `type` carries the record type in the low 7 bits; the high bit is the
//!   **provisional** flag. A provisional record is skipped by recovery's
//!   forward passes and only takes effect when a later non-provisional
//!   record (a parent image, a root record) refers to its LSN — the
//!   mechanism that makes splits atomic with respect to recovery.
//! - `size` is the payload length in bytes.
//! - `txn-id` is zero for non-transactional records.
//! - `prev-offset` is the offset of the previous record in the *same*
//!   segment file ([`NULL_PREV`] for the first record), forming the chain
//!   the reverse iterator walks.
//! - `crc32` covers the header (with the checksum field zeroed) plus the
//!   payload.

use std::fmt;

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::log::LogError;

/// First byte of every record.
pub const LOG_MAGIC: u8 = 0xDB;

/// High bit of the type byte: record is provisional.
pub const PROVISIONAL_BIT: u8 = 0x80;

/// `prev-offset` value meaning "first record in this file".
pub const NULL_PREV: u64 = u64::MAX;

/// Fixed header size in bytes.
pub const HEADER_SIZE: usize = 1 + 1 + 4 + 8 + 8 + 8 + 4;

// ------------------------------------------------------------------------------------------------
// Lsn
// ------------------------------------------------------------------------------------------------

/// Log sequence number: (segment file number, byte offset), totally ordered
/// lexicographically. Identifies exactly one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn {
    /// Segment file number.
    pub file: u64,
    /// Byte offset of the record header within the file.
    pub offset: u64,
}

impl Lsn {
    /// Construct an LSN.
    pub fn new(file: u64, offset: u64) -> Self {
        Self { file, offset }
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}/{:#x}", self.file, self.offset)
    }
}

impl Encode for Lsn {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.file.encode(out)?;
        self.offset.encode(out)
    }
}

impl Decode for Lsn {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (file, mut at) = u64::decode(buf)?;
        let (offset, n) = u64::decode(&buf[at..])?;
        at += n;
        Ok((Self { file, offset }, at))
    }
}

// ------------------------------------------------------------------------------------------------
// Record types
// ------------------------------------------------------------------------------------------------

/// Record type codes (low 7 bits of the type byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogEntryType {
    /// Ordinary leaf record (one key/value version).
    Ln = 1,
    /// Duplicate-count record at a duplicate subtree root.
    DupCountLn = 2,
    /// Database-name mapping record.
    NameLn = 3,
    /// Per-file utilization summary record.
    FileSummaryLn = 4,
    /// Bottom internal node image.
    Bin = 5,
    /// Internal node image.
    In = 6,
    /// Duplicate bottom internal node image.
    Dbin = 7,
    /// Duplicate internal node image.
    Din = 8,
    /// Partial BIN image: only the slots dirtied since the last full image.
    BinDelta = 9,
    /// Tree-root pointer for one database.
    Root = 10,
    /// Transaction begin.
    TxnBegin = 11,
    /// Transaction commit.
    TxnCommit = 12,
    /// Transaction abort.
    TxnAbort = 13,
    /// Transaction prepare.
    TxnPrepare = 14,
    /// Checkpoint start marker.
    CheckpointStart = 15,
    /// Checkpoint end with recovery metadata.
    CheckpointEnd = 16,
}

impl LogEntryType {
    /// Decode a type code (provisional bit already stripped).
    pub fn from_code(code: u8) -> Result<Self, LogError> {
        use LogEntryType::*;
        Ok(match code {
            1 => Ln,
            2 => DupCountLn,
            3 => NameLn,
            4 => FileSummaryLn,
            5 => Bin,
            6 => In,
            7 => Dbin,
            8 => Din,
            9 => BinDelta,
            10 => Root,
            11 => TxnBegin,
            12 => TxnCommit,
            13 => TxnAbort,
            14 => TxnPrepare,
            15 => CheckpointStart,
            16 => CheckpointEnd,
            other => return Err(LogError::UnknownType(other)),
        })
    }

    /// `true` for IN/BIN/DIN/DBIN images.
    pub fn is_node_image(self) -> bool {
        matches!(
            self,
            LogEntryType::Bin | LogEntryType::In | LogEntryType::Dbin | LogEntryType::Din
        )
    }

    /// `true` for leaf-record types counted as LN bytes by the utilization
    /// tracker.
    pub fn is_ln(self) -> bool {
        matches!(
            self,
            LogEntryType::Ln
                | LogEntryType::DupCountLn
                | LogEntryType::NameLn
                | LogEntryType::FileSummaryLn
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Record header
// ------------------------------------------------------------------------------------------------

/// Decoded fixed header of one log record.
#[derive(Debug, Clone, Copy)]
pub struct RecordHeader {
    /// Record type.
    pub ty: LogEntryType,
    /// Provisional flag (high bit of the type byte).
    pub provisional: bool,
    /// Payload size in bytes.
    pub size: u32,
    /// Monotonic entry id.
    pub entry_id: u64,
    /// Owning transaction id; zero for non-transactional records.
    pub txn_id: u64,
    /// Offset of the previous record in the same file, or [`NULL_PREV`].
    pub prev_offset: u64,
    /// CRC32 over header (checksum field zeroed) + payload.
    pub checksum: u32,
}

impl RecordHeader {
    /// Serialize with the checksum field zeroed; the caller patches the
    /// checksum in after computing it over header + payload.
    pub fn to_bytes_unchecksummed(&self) -> [u8; HEADER_SIZE] {
        let mut b = [0u8; HEADER_SIZE];
        b[0] = LOG_MAGIC;
        b[1] = self.ty as u8 | if self.provisional { PROVISIONAL_BIT } else { 0 };
        b[2..6].copy_from_slice(&self.size.to_le_bytes());
        b[6..14].copy_from_slice(&self.entry_id.to_le_bytes());
        b[14..22].copy_from_slice(&self.txn_id.to_le_bytes());
        b[22..30].copy_from_slice(&self.prev_offset.to_le_bytes());
        // b[30..34] stays zero; checksum patched by the log writer.
        b
    }

    /// Patch a computed checksum into serialized header bytes.
    pub fn patch_checksum(bytes: &mut [u8; HEADER_SIZE], checksum: u32) {
        bytes[30..34].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Decode a header from the front of `buf`.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, LogError> {
        if buf.len() < HEADER_SIZE {
            return Err(LogError::Truncated {
                needed: HEADER_SIZE,
                available: buf.len(),
            });
        }
        if buf[0] != LOG_MAGIC {
            return Err(LogError::BadHeader(format!(
                "bad magic byte {:#04x}",
                buf[0]
            )));
        }
        let ty_byte = buf[1];
        let ty = LogEntryType::from_code(ty_byte & !PROVISIONAL_BIT)?;
        let mut u4 = [0u8; 4];
        let mut u8b = [0u8; 8];
        u4.copy_from_slice(&buf[2..6]);
        let size = u32::from_le_bytes(u4);
        u8b.copy_from_slice(&buf[6..14]);
        let entry_id = u64::from_le_bytes(u8b);
        u8b.copy_from_slice(&buf[14..22]);
        let txn_id = u64::from_le_bytes(u8b);
        u8b.copy_from_slice(&buf[22..30]);
        let prev_offset = u64::from_le_bytes(u8b);
        u4.copy_from_slice(&buf[30..34]);
        let checksum = u32::from_le_bytes(u4);
        Ok(Self {
            ty,
            provisional: ty_byte & PROVISIONAL_BIT != 0,
            size,
            entry_id,
            txn_id,
            prev_offset,
            checksum,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Payload structs
// ------------------------------------------------------------------------------------------------

/// One key/value version. For duplicate-capable databases the `value` is
/// also the ordering key inside the duplicate subtree.
#[derive(Debug, Clone, PartialEq)]
pub struct LnEntry {
    /// Owning database id.
    pub db_id: u64,
    /// Leaf node id — the lock-table key for this record.
    pub node_id: u64,
    /// User key.
    pub key: Vec<u8>,
    /// User value.
    pub value: Vec<u8>,
    /// Logical deletion flag.
    pub deleted: bool,
    /// Pre-image LSN for transactional rollback; `None` for an insert.
    pub abort_lsn: Option<Lsn>,
    /// Pre-image known-deleted state, reinstated on rollback.
    pub abort_known_deleted: bool,
}

impl Encode for LnEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.db_id.encode(out)?;
        self.node_id.encode(out)?;
        self.key.encode(out)?;
        self.value.encode(out)?;
        self.deleted.encode(out)?;
        self.abort_lsn.encode(out)?;
        self.abort_known_deleted.encode(out)
    }
}

impl Decode for LnEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (db_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (node_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (key, n) = Vec::<u8>::decode(&buf[at..])?;
        at += n;
        let (value, n) = Vec::<u8>::decode(&buf[at..])?;
        at += n;
        let (deleted, n) = bool::decode(&buf[at..])?;
        at += n;
        let (abort_lsn, n) = Option::<Lsn>::decode(&buf[at..])?;
        at += n;
        let (abort_known_deleted, n) = bool::decode(&buf[at..])?;
        at += n;
        Ok((
            Self {
                db_id,
                node_id,
                key,
                value,
                deleted,
                abort_lsn,
                abort_known_deleted,
            },
            at,
        ))
    }
}

/// Duplicate count for one duplicate subtree, keyed by the primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct DupCountEntry {
    /// Owning database id.
    pub db_id: u64,
    /// Node id of the DupCount record — the lock-table key for the
    /// duplicate set as a whole.
    pub node_id: u64,
    /// Primary key owning the duplicate subtree.
    pub key: Vec<u8>,
    /// Number of live duplicates.
    pub count: u32,
    /// Pre-image LSN for transactional rollback.
    pub abort_lsn: Option<Lsn>,
}

impl Encode for DupCountEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.db_id.encode(out)?;
        self.node_id.encode(out)?;
        self.key.encode(out)?;
        self.count.encode(out)?;
        self.abort_lsn.encode(out)
    }
}

impl Decode for DupCountEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (db_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (node_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (key, n) = Vec::<u8>::decode(&buf[at..])?;
        at += n;
        let (count, n) = u32::decode(&buf[at..])?;
        at += n;
        let (abort_lsn, n) = Option::<Lsn>::decode(&buf[at..])?;
        at += n;
        Ok((
            Self {
                db_id,
                node_id,
                key,
                count,
                abort_lsn,
            },
            at,
        ))
    }
}

/// Database-name mapping record. The newest record per name wins; a
/// `deleted` record retires the name.
#[derive(Debug, Clone, PartialEq)]
pub struct NameEntry {
    /// Database id the name maps to.
    pub db_id: u64,
    /// Database name.
    pub name: String,
    /// Name retired (database removed or renamed away).
    pub deleted: bool,
    /// Persistent per-database flag: duplicates permitted.
    pub sorted_duplicates: bool,
}

impl Encode for NameEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.db_id.encode(out)?;
        self.name.encode(out)?;
        self.deleted.encode(out)?;
        self.sorted_duplicates.encode(out)
    }
}

impl Decode for NameEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (db_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (name, n) = String::decode(&buf[at..])?;
        at += n;
        let (deleted, n) = bool::decode(&buf[at..])?;
        at += n;
        let (sorted_duplicates, n) = bool::decode(&buf[at..])?;
        at += n;
        Ok((
            Self {
                db_id,
                name,
                deleted,
                sorted_duplicates,
            },
            at,
        ))
    }
}

/// Per-file utilization counters, all 32-bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileSummary {
    /// Records written to the file.
    pub total_count: u32,
    /// Bytes written to the file.
    pub total_size: u32,
    /// Internal-node records written.
    pub in_count: u32,
    /// Internal-node bytes written.
    pub in_size: u32,
    /// Leaf records written.
    pub ln_count: u32,
    /// Leaf bytes written.
    pub ln_size: u32,
    /// Reserved for format evolution; always zero.
    pub reserved: u32,
    /// Leaf records in this file known to be obsolete.
    pub obsolete_ln_count: u32,
}

impl FileSummary {
    /// Fold another summary (a delta) into this one.
    pub fn add(&mut self, other: &FileSummary) {
        self.total_count = self.total_count.saturating_add(other.total_count);
        self.total_size = self.total_size.saturating_add(other.total_size);
        self.in_count = self.in_count.saturating_add(other.in_count);
        self.in_size = self.in_size.saturating_add(other.in_size);
        self.ln_count = self.ln_count.saturating_add(other.ln_count);
        self.ln_size = self.ln_size.saturating_add(other.ln_size);
        self.obsolete_ln_count = self.obsolete_ln_count.saturating_add(other.obsolete_ln_count);
    }

    /// `true` when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.total_count == 0 && self.obsolete_ln_count == 0
    }
}

impl Encode for FileSummary {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.total_count.encode(out)?;
        self.total_size.encode(out)?;
        self.in_count.encode(out)?;
        self.in_size.encode(out)?;
        self.ln_count.encode(out)?;
        self.ln_size.encode(out)?;
        self.reserved.encode(out)?;
        self.obsolete_ln_count.encode(out)
    }
}

impl Decode for FileSummary {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (total_count, n) = u32::decode(&buf[at..])?;
        at += n;
        let (total_size, n) = u32::decode(&buf[at..])?;
        at += n;
        let (in_count, n) = u32::decode(&buf[at..])?;
        at += n;
        let (in_size, n) = u32::decode(&buf[at..])?;
        at += n;
        let (ln_count, n) = u32::decode(&buf[at..])?;
        at += n;
        let (ln_size, n) = u32::decode(&buf[at..])?;
        at += n;
        let (reserved, n) = u32::decode(&buf[at..])?;
        at += n;
        let (obsolete_ln_count, n) = u32::decode(&buf[at..])?;
        at += n;
        Ok((
            Self {
                total_count,
                total_size,
                in_count,
                in_size,
                ln_count,
                ln_size,
                reserved,
                obsolete_ln_count,
            },
            at,
        ))
    }
}

/// Durable utilization summary for one segment file. Newest per file wins.
#[derive(Debug, Clone, PartialEq)]
pub struct FileSummaryEntry {
    /// File number this summary describes. Encoded big-endian so the key
    /// bytes sort in file order.
    pub file_num: u64,
    /// The counters.
    pub summary: FileSummary,
}

impl Encode for FileSummaryEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.file_num.to_be_bytes().encode(out)?;
        self.summary.encode(out)
    }
}

impl Decode for FileSummaryEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (key, mut at) = <[u8; 8]>::decode(buf)?;
        let (summary, n) = FileSummary::decode(&buf[at..])?;
        at += n;
        Ok((
            Self {
                file_num: u64::from_be_bytes(key),
                summary,
            },
            at,
        ))
    }
}

/// Kind tag inside a node image (the record type already carries it; the
/// image repeats it so a payload is self-describing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ImageKind {
    /// Internal node.
    In = 0,
    /// Bottom internal node.
    Bin = 1,
    /// Duplicate internal node.
    Din = 2,
    /// Duplicate bottom internal node.
    Dbin = 3,
}

impl ImageKind {
    fn from_tag(tag: u8) -> Result<Self, EncodingError> {
        Ok(match tag {
            0 => ImageKind::In,
            1 => ImageKind::Bin,
            2 => ImageKind::Din,
            3 => ImageKind::Dbin,
            other => {
                return Err(EncodingError::InvalidTag {
                    tag: other,
                    type_name: "ImageKind",
                });
            }
        })
    }

    /// The record type that carries this image kind.
    pub fn entry_type(self) -> LogEntryType {
        match self {
            ImageKind::In => LogEntryType::In,
            ImageKind::Bin => LogEntryType::Bin,
            ImageKind::Din => LogEntryType::Din,
            ImageKind::Dbin => LogEntryType::Dbin,
        }
    }
}

/// One slot of a persisted node image: (key, child node id, child LSN,
/// known-deleted).
#[derive(Debug, Clone, PartialEq)]
pub struct SlotImage {
    /// Slot key (for a BIN, the record key; for an IN, the subtree bound).
    pub key: Vec<u8>,
    /// Child node id (LN node id for BIN slots, child IN/BIN id otherwise).
    pub child_id: u64,
    /// Child's last logged LSN; `None` for a never-logged child.
    pub lsn: Option<Lsn>,
    /// Slot is logically deleted, awaiting compression.
    pub known_deleted: bool,
}

impl Encode for SlotImage {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.key.encode(out)?;
        self.child_id.encode(out)?;
        self.lsn.encode(out)?;
        self.known_deleted.encode(out)
    }
}

impl Decode for SlotImage {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (key, n) = Vec::<u8>::decode(&buf[at..])?;
        at += n;
        let (child_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (lsn, n) = Option::<Lsn>::decode(&buf[at..])?;
        at += n;
        let (known_deleted, n) = bool::decode(&buf[at..])?;
        at += n;
        Ok((
            Self {
                key,
                child_id,
                lsn,
                known_deleted,
            },
            at,
        ))
    }
}

/// Duplicate-count slot carried by a DIN-root image.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DupCountRef {
    /// DupCount record node id (lock key for the duplicate set).
    pub node_id: u64,
    /// Cached live-duplicate count.
    pub count: u32,
    /// LSN of the newest DupCount record.
    pub lsn: Option<Lsn>,
}

impl Encode for DupCountRef {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.node_id.encode(out)?;
        self.count.encode(out)?;
        self.lsn.encode(out)
    }
}

impl Decode for DupCountRef {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (node_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (count, n) = u32::decode(&buf[at..])?;
        at += n;
        let (lsn, n) = Option::<Lsn>::decode(&buf[at..])?;
        at += n;
        Ok((
            Self {
                node_id,
                count,
                lsn,
            },
            at,
        ))
    }
}

/// Persistent image of an IN/BIN/DIN/DBIN.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeImage {
    /// Owning database id.
    pub db_id: u64,
    /// Node id.
    pub node_id: u64,
    /// Node kind.
    pub kind: ImageKind,
    /// Tree level (1 = bottom).
    pub level: u8,
    /// For duplicate-subtree nodes, the primary key owning the subtree;
    /// empty for main-tree nodes.
    pub owner_key: Vec<u8>,
    /// Identifier key used for parent re-location (a duplicate value for
    /// duplicate-subtree nodes).
    pub identifier_key: Vec<u8>,
    /// Slots in key order.
    pub slots: Vec<SlotImage>,
    /// Duplicate-count slot; present only on a DIN subtree root.
    pub dup_count: Option<DupCountRef>,
}

impl Encode for NodeImage {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.db_id.encode(out)?;
        self.node_id.encode(out)?;
        (self.kind as u8).encode(out)?;
        self.level.encode(out)?;
        self.owner_key.encode(out)?;
        self.identifier_key.encode(out)?;
        encoding::encode_seq(&self.slots, out)?;
        self.dup_count.encode(out)
    }
}

impl Decode for NodeImage {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (db_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (node_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (kind_tag, n) = u8::decode(&buf[at..])?;
        at += n;
        let (level, n) = u8::decode(&buf[at..])?;
        at += n;
        let (owner_key, n) = Vec::<u8>::decode(&buf[at..])?;
        at += n;
        let (identifier_key, n) = Vec::<u8>::decode(&buf[at..])?;
        at += n;
        let (slots, n) = encoding::decode_seq::<SlotImage>(&buf[at..])?;
        at += n;
        let (dup_count, n) = Option::<DupCountRef>::decode(&buf[at..])?;
        at += n;
        Ok((
            Self {
                db_id,
                node_id,
                kind: ImageKind::from_tag(kind_tag)?,
                level,
                owner_key,
                identifier_key,
                slots,
                dup_count,
            },
            at,
        ))
    }
}

/// Partial BIN image: the slots dirtied since `last_full_lsn`.
#[derive(Debug, Clone, PartialEq)]
pub struct BinDeltaEntry {
    /// Owning database id.
    pub db_id: u64,
    /// The BIN this delta applies to.
    pub node_id: u64,
    /// LSN of the most recent full image of the BIN.
    pub last_full_lsn: Lsn,
    /// Changed slots.
    pub slots: Vec<SlotImage>,
}

impl Encode for BinDeltaEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.db_id.encode(out)?;
        self.node_id.encode(out)?;
        self.last_full_lsn.encode(out)?;
        encoding::encode_seq(&self.slots, out)
    }
}

impl Decode for BinDeltaEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (db_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (node_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (last_full_lsn, n) = Lsn::decode(&buf[at..])?;
        at += n;
        let (slots, n) = encoding::decode_seq::<SlotImage>(&buf[at..])?;
        at += n;
        Ok((
            Self {
                db_id,
                node_id,
                last_full_lsn,
                slots,
            },
            at,
        ))
    }
}

/// Tree-root pointer for one database. Newest per database wins.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RootEntry {
    /// Database id.
    pub db_id: u64,
    /// Root node id; zero for an empty tree.
    pub node_id: u64,
    /// LSN of the root node image; `None` for an empty tree.
    pub lsn: Option<Lsn>,
}

impl Encode for RootEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.db_id.encode(out)?;
        self.node_id.encode(out)?;
        self.lsn.encode(out)
    }
}

impl Decode for RootEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (db_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (node_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (lsn, n) = Option::<Lsn>::decode(&buf[at..])?;
        at += n;
        Ok((Self { db_id, node_id, lsn }, at))
    }
}

/// Begin/abort/prepare marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TxnRecord {
    /// Transaction id.
    pub id: u64,
}

impl Encode for TxnRecord {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode(out)
    }
}

impl Decode for TxnRecord {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (id, n) = u64::decode(buf)?;
        Ok((Self { id }, n))
    }
}

/// Commit marker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommitRecord {
    /// Transaction id.
    pub id: u64,
    /// Wall-clock commit time, milliseconds since the epoch.
    pub time: i64,
}

impl Encode for CommitRecord {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode(out)?;
        self.time.encode(out)
    }
}

impl Decode for CommitRecord {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (time, n) = i64::decode(&buf[at..])?;
        at += n;
        Ok((Self { id, time }, at))
    }
}

/// Checkpoint start marker.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointStartEntry {
    /// Checkpoint id.
    pub id: u64,
    /// Who asked for the checkpoint (`"daemon"`, `"api"`, …).
    pub invoker: String,
    /// Wall-clock start time, milliseconds since the epoch.
    pub time: i64,
}

impl Encode for CheckpointStartEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode(out)?;
        self.invoker.encode(out)?;
        self.time.encode(out)
    }
}

impl Decode for CheckpointStartEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (invoker, n) = String::decode(&buf[at..])?;
        at += n;
        let (time, n) = i64::decode(&buf[at..])?;
        at += n;
        Ok((Self { id, invoker, time }, at))
    }
}

/// Checkpoint end: everything recovery needs to restart cheaply.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointEndEntry {
    /// Who asked for the checkpoint.
    pub invoker: String,
    /// Wall-clock end time, milliseconds since the epoch.
    pub time: i64,
    /// LSN of the matching checkpoint-start record.
    pub start_lsn: Lsn,
    /// LSN of the last root record written by this checkpoint, if any.
    pub root_lsn: Option<Lsn>,
    /// Oldest LSN still needed by an in-flight transaction.
    pub first_active_lsn: Option<Lsn>,
    /// Node-id allocator high-water mark.
    pub last_node_id: u64,
    /// Database-id allocator high-water mark.
    pub last_db_id: u64,
    /// Transaction-id allocator high-water mark.
    pub last_txn_id: u64,
    /// Checkpoint id.
    pub id: u64,
}

impl Encode for CheckpointEndEntry {
    fn encode(&self, out: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.invoker.encode(out)?;
        self.time.encode(out)?;
        self.start_lsn.encode(out)?;
        self.root_lsn.encode(out)?;
        self.first_active_lsn.encode(out)?;
        self.last_node_id.encode(out)?;
        self.last_db_id.encode(out)?;
        self.last_txn_id.encode(out)?;
        self.id.encode(out)
    }
}

impl Decode for CheckpointEndEntry {
    fn decode(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut at = 0;
        let (invoker, n) = String::decode(&buf[at..])?;
        at += n;
        let (time, n) = i64::decode(&buf[at..])?;
        at += n;
        let (start_lsn, n) = Lsn::decode(&buf[at..])?;
        at += n;
        let (root_lsn, n) = Option::<Lsn>::decode(&buf[at..])?;
        at += n;
        let (first_active_lsn, n) = Option::<Lsn>::decode(&buf[at..])?;
        at += n;
        let (last_node_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (last_db_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (last_txn_id, n) = u64::decode(&buf[at..])?;
        at += n;
        let (id, n) = u64::decode(&buf[at..])?;
        at += n;
        Ok((
            Self {
                invoker,
                time,
                start_lsn,
                root_lsn,
                first_active_lsn,
                last_node_id,
                last_db_id,
                last_txn_id,
                id,
            },
            at,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// LogEntry
// ------------------------------------------------------------------------------------------------

/// A fully decoded log record payload.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    /// Leaf record.
    Ln(LnEntry),
    /// Duplicate-count record.
    DupCount(DupCountEntry),
    /// Database-name mapping record.
    Name(NameEntry),
    /// Per-file utilization summary.
    FileSummary(FileSummaryEntry),
    /// IN/BIN/DIN/DBIN image.
    Node(NodeImage),
    /// Partial BIN image.
    BinDelta(BinDeltaEntry),
    /// Tree-root pointer.
    Root(RootEntry),
    /// Transaction begin.
    TxnBegin(TxnRecord),
    /// Transaction commit.
    TxnCommit(CommitRecord),
    /// Transaction abort.
    TxnAbort(TxnRecord),
    /// Transaction prepare.
    TxnPrepare(TxnRecord),
    /// Checkpoint start.
    CheckpointStart(CheckpointStartEntry),
    /// Checkpoint end.
    CheckpointEnd(CheckpointEndEntry),
}

impl LogEntry {
    /// The record type this payload is framed with.
    pub fn entry_type(&self) -> LogEntryType {
        match self {
            LogEntry::Ln(_) => LogEntryType::Ln,
            LogEntry::DupCount(_) => LogEntryType::DupCountLn,
            LogEntry::Name(_) => LogEntryType::NameLn,
            LogEntry::FileSummary(_) => LogEntryType::FileSummaryLn,
            LogEntry::Node(image) => image.kind.entry_type(),
            LogEntry::BinDelta(_) => LogEntryType::BinDelta,
            LogEntry::Root(_) => LogEntryType::Root,
            LogEntry::TxnBegin(_) => LogEntryType::TxnBegin,
            LogEntry::TxnCommit(_) => LogEntryType::TxnCommit,
            LogEntry::TxnAbort(_) => LogEntryType::TxnAbort,
            LogEntry::TxnPrepare(_) => LogEntryType::TxnPrepare,
            LogEntry::CheckpointStart(_) => LogEntryType::CheckpointStart,
            LogEntry::CheckpointEnd(_) => LogEntryType::CheckpointEnd,
        }
    }

    /// Serialize the payload (header framing is the log writer's job).
    pub fn encode_payload(&self) -> Result<Vec<u8>, EncodingError> {
        match self {
            LogEntry::Ln(e) => encoding::to_vec(e),
            LogEntry::DupCount(e) => encoding::to_vec(e),
            LogEntry::Name(e) => encoding::to_vec(e),
            LogEntry::FileSummary(e) => encoding::to_vec(e),
            LogEntry::Node(e) => encoding::to_vec(e),
            LogEntry::BinDelta(e) => encoding::to_vec(e),
            LogEntry::Root(e) => encoding::to_vec(e),
            LogEntry::TxnBegin(e) | LogEntry::TxnAbort(e) | LogEntry::TxnPrepare(e) => {
                encoding::to_vec(e)
            }
            LogEntry::TxnCommit(e) => encoding::to_vec(e),
            LogEntry::CheckpointStart(e) => encoding::to_vec(e),
            LogEntry::CheckpointEnd(e) => encoding::to_vec(e),
        }
    }

    /// Decode a payload framed with the given record type.
    pub fn decode_payload(ty: LogEntryType, payload: &[u8]) -> Result<Self, LogError> {
        let entry = match ty {
            LogEntryType::Ln => LogEntry::Ln(encoding::from_slice::<LnEntry>(payload)?.0),
            LogEntryType::DupCountLn => {
                LogEntry::DupCount(encoding::from_slice::<DupCountEntry>(payload)?.0)
            }
            LogEntryType::NameLn => LogEntry::Name(encoding::from_slice::<NameEntry>(payload)?.0),
            LogEntryType::FileSummaryLn => {
                LogEntry::FileSummary(encoding::from_slice::<FileSummaryEntry>(payload)?.0)
            }
            LogEntryType::Bin | LogEntryType::In | LogEntryType::Dbin | LogEntryType::Din => {
                LogEntry::Node(encoding::from_slice::<NodeImage>(payload)?.0)
            }
            LogEntryType::BinDelta => {
                LogEntry::BinDelta(encoding::from_slice::<BinDeltaEntry>(payload)?.0)
            }
            LogEntryType::Root => LogEntry::Root(encoding::from_slice::<RootEntry>(payload)?.0),
            LogEntryType::TxnBegin => {
                LogEntry::TxnBegin(encoding::from_slice::<TxnRecord>(payload)?.0)
            }
            LogEntryType::TxnCommit => {
                LogEntry::TxnCommit(encoding::from_slice::<CommitRecord>(payload)?.0)
            }
            LogEntryType::TxnAbort => {
                LogEntry::TxnAbort(encoding::from_slice::<TxnRecord>(payload)?.0)
            }
            LogEntryType::TxnPrepare => {
                LogEntry::TxnPrepare(encoding::from_slice::<TxnRecord>(payload)?.0)
            }
            LogEntryType::CheckpointStart => {
                LogEntry::CheckpointStart(encoding::from_slice::<CheckpointStartEntry>(payload)?.0)
            }
            LogEntryType::CheckpointEnd => {
                LogEntry::CheckpointEnd(encoding::from_slice::<CheckpointEndEntry>(payload)?.0)
            }
        };
        Ok(entry)
    }
}
