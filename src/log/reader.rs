//! Sequential log iteration, forward and reverse.
//!
//! The forward iterator drives recovery's passes and the cleaner's per-file
//! scans; the reverse iterator walks previous-offset chains from the end of
//! the log, which is how recovery finds the last checkpoint-end record
//! without scanning everything.
//!
//! Both iterators snapshot the segment list and log end at construction;
//! records appended afterwards are not visited.

use std::collections::VecDeque;

use tracing::trace;

use crate::log::entry::{HEADER_SIZE, Lsn, NULL_PREV, RecordHeader};
use crate::log::{LogError, LogManager};

/// Item yielded by both iterators.
pub type LogItem = (Lsn, RecordHeader, Vec<u8>);

// ------------------------------------------------------------------------------------------------
// Forward iterator
// ------------------------------------------------------------------------------------------------

/// Forward record iterator, restartable from any LSN.
pub struct LogIter<'a> {
    log: &'a LogManager,
    /// Segments still to visit, ascending.
    files: VecDeque<u64>,
    /// (file, next offset, end offset) of the segment being walked.
    cur: Option<(u64, u64, u64)>,
    /// Set once an error has been yielded; iteration then ends.
    failed: bool,
}

impl<'a> LogIter<'a> {
    pub(crate) fn new(log: &'a LogManager, from: Option<Lsn>) -> Result<Self, LogError> {
        let mut files: VecDeque<u64> = log.files().list_segments()?.into();
        let mut cur = None;
        if let Some(from) = from {
            while let Some(&f) = files.front() {
                if f < from.file {
                    files.pop_front();
                } else {
                    break;
                }
            }
            if files.front() == Some(&from.file) {
                files.pop_front();
                let end = log.segment_end(from.file)?;
                cur = Some((from.file, from.offset, end));
            }
        }
        Ok(Self {
            log,
            files,
            cur,
            failed: false,
        })
    }

    fn advance_file(&mut self) -> Result<bool, LogError> {
        match self.files.pop_front() {
            None => Ok(false),
            Some(f) => {
                let end = self.log.segment_end(f)?;
                self.cur = Some((f, 0, end));
                Ok(true)
            }
        }
    }
}

impl Iterator for LogIter<'_> {
    type Item = Result<LogItem, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            match self.cur {
                None => match self.advance_file() {
                    Ok(true) => continue,
                    Ok(false) => return None,
                    Err(e) => {
                        self.failed = true;
                        return Some(Err(e));
                    }
                },
                Some((file, offset, end)) => {
                    if offset >= end {
                        self.cur = None;
                        continue;
                    }
                    let lsn = Lsn::new(file, offset);
                    match self.log.read(lsn) {
                        Ok((header, payload)) => {
                            let next = offset + HEADER_SIZE as u64 + header.size as u64;
                            self.cur = Some((file, next, end));
                            trace!(%lsn, ty = ?header.ty, "log iter record");
                            return Some(Ok((lsn, header, payload)));
                        }
                        Err(e) => {
                            self.failed = true;
                            return Some(Err(e));
                        }
                    }
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Reverse iterator
// ------------------------------------------------------------------------------------------------

/// Reverse record iterator from the end of the log.
///
/// Within a segment it follows each record's previous-offset back-pointer;
/// crossing to the preceding segment re-anchors on that segment's last
/// record (found with one header-chain walk).
pub struct RevLogIter<'a> {
    log: &'a LogManager,
    /// Segments still to visit, ascending; popped from the back.
    files: Vec<u64>,
    /// (file, offset of the record to yield next).
    cur: Option<(u64, u64)>,
    failed: bool,
}

impl<'a> RevLogIter<'a> {
    pub(crate) fn new(log: &'a LogManager) -> Result<Self, LogError> {
        let files = log.files().list_segments()?;
        Ok(Self {
            log,
            files,
            cur: None,
            failed: false,
        })
    }

    /// Find the offset of the last record in `file` by walking headers.
    fn last_offset(&self, file: u64) -> Result<Option<u64>, LogError> {
        let end = self.log.segment_end(file)?;
        let mut at = 0u64;
        let mut last = None;
        while at + HEADER_SIZE as u64 <= end {
            let header = self.log.read_header(Lsn::new(file, at))?;
            let next = at + HEADER_SIZE as u64 + header.size as u64;
            if next > end {
                break;
            }
            last = Some(at);
            at = next;
        }
        Ok(last)
    }

    fn step_file(&mut self) -> Result<bool, LogError> {
        while let Some(f) = self.files.pop() {
            if let Some(off) = self.last_offset(f)? {
                self.cur = Some((f, off));
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl Iterator for RevLogIter<'_> {
    type Item = Result<LogItem, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.cur.is_none() {
            match self.step_file() {
                Ok(true) => {}
                Ok(false) => return None,
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        let (file, offset) = self.cur.take()?;
        let lsn = Lsn::new(file, offset);
        match self.log.read(lsn) {
            Ok((header, payload)) => {
                if header.prev_offset != NULL_PREV {
                    self.cur = Some((file, header.prev_offset));
                }
                Some(Ok((lsn, header, payload)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
