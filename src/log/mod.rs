//! The append-only log manager — the engine's only durable medium.
//!
//! Every node image, leaf record, transaction marker and checkpoint is one
//! checksummed record appended to a numbered segment file (see [`entry`] for
//! the framing). Appends serialize under a single **write latch**; the order
//! of LSNs handed out there is the total order every other subsystem relies
//! on.
//!
//! ## Write path
//!
//! Records accumulate in an in-memory write buffer and are pushed to the OS
//! when the buffer fills, when a reader needs bytes that were still
//! buffered, or when a commit demands durability ([`LogManager::sync`]).
//! When the current segment reaches `file_max` the buffer is flushed, the
//! file is synced and a new segment begins.
//!
//! ## Read path
//!
//! [`LogManager::read`] serves a record by LSN from, in order of
//! preference: the write buffer, a positional read on the current segment,
//! or a cached read-only memory map of a closed (immutable) segment.
//! Checksums are verified on every read; a mismatch is
//! [`LogError::Checksum`], which callers treat as fatal corruption.
//!
//! ## Crash tail
//!
//! On open, the tail of the newest segment is scanned; a torn final record
//! is truncated away. Interior corruption surfaces later, as a checksum
//! failure on whichever read first touches it.

pub mod entry;
pub mod files;
pub mod reader;

#[cfg(test)]
mod tests;

use std::io;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::cleaner::profile::UtilizationTracker;
use crate::encoding::EncodingError;

pub use entry::{
    BinDeltaEntry, CheckpointEndEntry, CheckpointStartEntry, CommitRecord, DupCountEntry,
    DupCountRef, FileSummary, FileSummaryEntry, HEADER_SIZE, ImageKind, LnEntry, LogEntry,
    LogEntryType, Lsn, NULL_PREV, NameEntry, NodeImage, RecordHeader, RootEntry, SlotImage,
    TxnRecord,
};
pub use files::FileManager;
pub use reader::{LogIter, RevLogIter};

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors raised by the log layer.
#[derive(Debug, Error)]
pub enum LogError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Payload encoding or decoding failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Record checksum did not match its contents.
    #[error("checksum mismatch at {file:#x}/{offset:#x}")]
    Checksum {
        /// Segment file number.
        file: u64,
        /// Record offset.
        offset: u64,
    },

    /// Malformed record header or segment name.
    #[error("bad log header: {0}")]
    BadHeader(String),

    /// Unrecognised record type code.
    #[error("unknown record type code {0}")]
    UnknownType(u8),

    /// Fewer bytes available than the record claims.
    #[error("truncated record (need {needed} bytes, have {available})")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// The environment directory is locked by another process.
    #[error("environment directory locked by another process")]
    Locked,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tunables of the log layer.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Target segment size; a record that would overflow it starts the next
    /// segment.
    pub file_max: u64,
    /// Read-buffer size for sequential scans.
    pub read_size: usize,
    /// Write-buffer size; appends beyond this force a flush to the OS.
    pub write_buffer: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            file_max: 10 * 1024 * 1024,
            read_size: 8 * 1024,
            write_buffer: 1024 * 1024,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Write state
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct WriteState {
    /// Segment currently being appended.
    file: u64,
    /// Next append offset — the logical end of the log.
    offset: u64,
    /// Offset of the last record appended to this segment, or [`NULL_PREV`].
    last_offset: u64,
    /// Pending bytes not yet pushed to the OS.
    buf: Vec<u8>,
    /// File offset of `buf[0]`.
    buf_start: u64,
    /// Write handle; `None` until the segment is created.
    fd: Option<std::fs::File>,
}

/// The log manager. One per environment.
#[derive(Debug)]
pub struct LogManager {
    files: FileManager,
    /// The write latch: the single serialization point for appends.
    state: Mutex<WriteState>,
    next_entry_id: AtomicU64,
    tracker: Arc<UtilizationTracker>,
    cfg: LogConfig,
    read_only: bool,
}

impl LogManager {
    /// Open the log over an already-locked directory, repairing a torn tail
    /// on the newest segment when writable.
    pub fn open(
        files: FileManager,
        cfg: LogConfig,
        tracker: Arc<UtilizationTracker>,
        read_only: bool,
    ) -> Result<Self, LogError> {
        let segments = files.list_segments()?;
        let state = match segments.last().copied() {
            None => WriteState {
                file: 0,
                offset: 0,
                last_offset: NULL_PREV,
                buf: Vec::new(),
                buf_start: 0,
                fd: None,
            },
            Some(last) => {
                let len = files.segment_size(last)?;
                let (end, last_offset) = scan_tail(&files, last, len)?;
                if end < len {
                    if read_only {
                        info!(file = last, end, len, "torn tail ignored (read-only)");
                    } else {
                        info!(file = last, end, len, "truncating torn log tail");
                        files.truncate_segment(last, end)?;
                    }
                }
                let fd = if read_only {
                    None
                } else {
                    Some(files.open_segment_append(last, end)?.0)
                };
                WriteState {
                    file: last,
                    offset: end,
                    last_offset,
                    buf: Vec::new(),
                    buf_start: end,
                    fd,
                }
            }
        };

        debug!(
            file = state.file,
            offset = state.offset,
            "log opened"
        );

        Ok(Self {
            files,
            state: Mutex::new(state),
            next_entry_id: AtomicU64::new(1),
            tracker,
            cfg,
            read_only,
        })
    }

    /// Underlying file manager.
    pub fn files(&self) -> &FileManager {
        &self.files
    }

    /// Seed the entry-id allocator (recovery hands back the high-water mark).
    pub fn set_next_entry_id(&self, id: u64) {
        self.next_entry_id.store(id, Ordering::SeqCst);
    }

    /// Total size of one record with the given payload length.
    pub fn record_size(payload_len: usize) -> u64 {
        (HEADER_SIZE + payload_len) as u64
    }

    /// Append one record and return its LSN.
    ///
    /// Serializes under the write latch; durability is deferred to
    /// [`LogManager::flush`] / [`LogManager::sync`] per commit policy.
    pub fn append(&self, record: &LogEntry, provisional: bool, txn_id: u64) -> Result<Lsn, LogError> {
        if self.read_only {
            return Err(LogError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "append to read-only log",
            )));
        }
        let payload = record.encode_payload()?;
        let ty = record.entry_type();
        let rec_len = HEADER_SIZE + payload.len();

        let mut st = self.lock_state();

        // Roll to the next segment if this record would overflow the
        // current one (never leave a segment empty).
        if st.offset > 0 && st.offset + rec_len as u64 > self.cfg.file_max {
            self.roll_segment(&mut st)?;
        }
        if st.fd.is_none() {
            st.fd = Some(self.files.create_segment(st.file)?);
        }

        let entry_id = self.next_entry_id.fetch_add(1, Ordering::SeqCst);
        let header = RecordHeader {
            ty,
            provisional,
            size: payload.len() as u32,
            entry_id,
            txn_id,
            prev_offset: st.last_offset,
            checksum: 0,
        };
        let mut head = header.to_bytes_unchecksummed();
        let crc = compute_crc(&[&head, &payload]);
        RecordHeader::patch_checksum(&mut head, crc);

        st.buf.extend_from_slice(&head);
        st.buf.extend_from_slice(&payload);

        let lsn = Lsn::new(st.file, st.offset);
        st.last_offset = st.offset;
        st.offset += rec_len as u64;

        self.tracker.note_append(lsn.file, ty, rec_len as u64);
        trace!(%lsn, ?ty, provisional, txn = txn_id, len = rec_len, "record appended");

        if st.buf.len() >= self.cfg.write_buffer {
            self.flush_locked(&mut st)?;
        }
        Ok(lsn)
    }

    /// Push buffered bytes to the OS (no fsync).
    pub fn flush(&self) -> Result<(), LogError> {
        let mut st = self.lock_state();
        self.flush_locked(&mut st)
    }

    /// Push buffered bytes to the OS and fsync the current segment.
    pub fn sync(&self) -> Result<(), LogError> {
        let mut st = self.lock_state();
        self.flush_locked(&mut st)?;
        if let Some(fd) = st.fd.as_ref() {
            fd.sync_all()?;
        }
        Ok(())
    }

    /// The LSN the next append will receive.
    pub fn end_of_log(&self) -> Lsn {
        let st = self.lock_state();
        Lsn::new(st.file, st.offset)
    }

    /// Segment currently being appended.
    pub fn current_file(&self) -> u64 {
        self.lock_state().file
    }

    /// Read and verify the record at `lsn`.
    pub fn read(&self, lsn: Lsn) -> Result<(RecordHeader, Vec<u8>), LogError> {
        // Fast path: still in the write buffer.
        {
            let st = self.lock_state();
            if lsn.file == st.file {
                if lsn.offset >= st.buf_start && (lsn.offset - st.buf_start) < st.buf.len() as u64
                {
                    let rel = (lsn.offset - st.buf_start) as usize;
                    return read_record_from(&st.buf[..], rel, lsn);
                }
                drop(st);
                let fd = self.files.open_reader(lsn.file)?;
                return read_record_file(&fd, lsn);
            }
        }
        // Closed segment: immutable, served through the map cache.
        let map = self.files.map_segment(lsn.file)?;
        read_record_from(&map[..], lsn.offset as usize, lsn)
    }

    /// Read, verify and decode the record at `lsn`.
    pub fn read_entry(&self, lsn: Lsn) -> Result<(RecordHeader, LogEntry), LogError> {
        let (header, payload) = self.read(lsn)?;
        let entry = LogEntry::decode_payload(header.ty, &payload)?;
        Ok((header, entry))
    }

    /// Header-only read (no checksum verification) for structure walks.
    pub(crate) fn read_header(&self, lsn: Lsn) -> Result<RecordHeader, LogError> {
        {
            let st = self.lock_state();
            if lsn.file == st.file {
                if lsn.offset >= st.buf_start && (lsn.offset - st.buf_start) < st.buf.len() as u64
                {
                    let rel = (lsn.offset - st.buf_start) as usize;
                    return RecordHeader::from_bytes(&st.buf[rel..]);
                }
                drop(st);
                let fd = self.files.open_reader(lsn.file)?;
                let mut head = [0u8; HEADER_SIZE];
                read_exact_at(&fd, &mut head, lsn.offset)?;
                return RecordHeader::from_bytes(&head);
            }
        }
        let map = self.files.map_segment(lsn.file)?;
        let at = lsn.offset as usize;
        if at + HEADER_SIZE > map.len() {
            return Err(LogError::Truncated {
                needed: HEADER_SIZE,
                available: map.len().saturating_sub(at),
            });
        }
        RecordHeader::from_bytes(&map[at..])
    }

    /// Known end of one segment (logical end for the write segment).
    pub(crate) fn segment_end(&self, file: u64) -> Result<u64, LogError> {
        let st = self.lock_state();
        if file == st.file {
            Ok(st.offset)
        } else {
            drop(st);
            self.files.segment_size(file)
        }
    }

    /// Forward iterator over records, starting at `from` (or the first
    /// record of the oldest segment).
    pub fn iter_from(&self, from: Option<Lsn>) -> Result<LogIter<'_>, LogError> {
        LogIter::new(self, from)
    }

    /// Reverse iterator from the end of the log, walking previous-offset
    /// chains.
    pub fn iter_reverse(&self) -> Result<RevLogIter<'_>, LogError> {
        RevLogIter::new(self)
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn lock_state(&self) -> std::sync::MutexGuard<'_, WriteState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn flush_locked(&self, st: &mut WriteState) -> Result<(), LogError> {
        if st.buf.is_empty() {
            return Ok(());
        }
        let fd = st.fd.as_mut().ok_or_else(|| {
            LogError::Io(io::Error::other("flush with no open segment"))
        })?;
        use std::io::Write;
        fd.write_all(&st.buf)?;
        st.buf_start += st.buf.len() as u64;
        st.buf.clear();
        Ok(())
    }

    fn roll_segment(&self, st: &mut WriteState) -> Result<(), LogError> {
        self.flush_locked(st)?;
        if let Some(fd) = st.fd.take() {
            fd.sync_all()?;
        }
        debug!(closed = st.file, next = st.file + 1, "segment rolled");
        st.file += 1;
        st.offset = 0;
        st.buf_start = 0;
        st.last_offset = NULL_PREV;
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Record-reading helpers
// ------------------------------------------------------------------------------------------------

/// CRC32 over a list of byte slices.
pub(crate) fn compute_crc(parts: &[&[u8]]) -> u32 {
    let mut hasher = Crc32::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

fn verify_record(head: &[u8; HEADER_SIZE], payload: &[u8], expected: u32, lsn: Lsn) -> Result<(), LogError> {
    let mut unchecksummed = *head;
    unchecksummed[30..34].copy_from_slice(&[0, 0, 0, 0]);
    if compute_crc(&[&unchecksummed, payload]) != expected {
        return Err(LogError::Checksum {
            file: lsn.file,
            offset: lsn.offset,
        });
    }
    Ok(())
}

fn read_record_from(buf: &[u8], at: usize, lsn: Lsn) -> Result<(RecordHeader, Vec<u8>), LogError> {
    if at + HEADER_SIZE > buf.len() {
        return Err(LogError::Truncated {
            needed: HEADER_SIZE,
            available: buf.len().saturating_sub(at),
        });
    }
    let header = RecordHeader::from_bytes(&buf[at..])?;
    let body_at = at + HEADER_SIZE;
    let size = header.size as usize;
    if body_at + size > buf.len() {
        return Err(LogError::Truncated {
            needed: size,
            available: buf.len() - body_at,
        });
    }
    let mut head = [0u8; HEADER_SIZE];
    head.copy_from_slice(&buf[at..body_at]);
    let payload = buf[body_at..body_at + size].to_vec();
    verify_record(&head, &payload, header.checksum, lsn)?;
    Ok((header, payload))
}

fn read_exact_at(fd: &std::fs::File, buf: &mut [u8], offset: u64) -> Result<(), LogError> {
    use std::os::unix::fs::FileExt;
    fd.read_exact_at(buf, offset)?;
    Ok(())
}

fn read_record_file(fd: &std::fs::File, lsn: Lsn) -> Result<(RecordHeader, Vec<u8>), LogError> {
    let mut head = [0u8; HEADER_SIZE];
    read_exact_at(fd, &mut head, lsn.offset)?;
    let header = RecordHeader::from_bytes(&head)?;
    let mut payload = vec![0u8; header.size as usize];
    read_exact_at(fd, &mut payload, lsn.offset + HEADER_SIZE as u64)?;
    verify_record(&head, &payload, header.checksum, lsn)?;
    Ok((header, payload))
}

/// Walk the newest segment to find the end of the valid record chain.
///
/// Returns `(end_offset, last_record_offset)`; bytes past `end_offset` are a
/// torn tail from a crash mid-append.
fn scan_tail(files: &FileManager, file: u64, len: u64) -> Result<(u64, u64), LogError> {
    let fd = files.open_reader(file)?;
    let mut at = 0u64;
    let mut last = NULL_PREV;
    loop {
        if at + HEADER_SIZE as u64 > len {
            break;
        }
        let mut head = [0u8; HEADER_SIZE];
        if read_exact_at(&fd, &mut head, at).is_err() {
            break;
        }
        let header = match RecordHeader::from_bytes(&head) {
            Ok(h) => h,
            Err(_) => break,
        };
        let body_end = at + HEADER_SIZE as u64 + header.size as u64;
        if body_end > len {
            break;
        }
        let mut payload = vec![0u8; header.size as usize];
        if read_exact_at(&fd, &mut payload, at + HEADER_SIZE as u64).is_err() {
            break;
        }
        if verify_record(&head, &payload, header.checksum, Lsn::new(file, at)).is_err() {
            break;
        }
        last = at;
        at = body_end;
    }
    Ok((at, last))
}
