//! Segment-file bookkeeping and process exclusion.
//!
//! An environment directory holds numbered segment files (`NNNNNNNN.jdb`,
//! eight hex digits), possibly some cleaned-but-kept files (`NNNNNNNN.del`),
//! and a lock file. The lock file carries an exclusive `fs2` advisory lock
//! for the life of the process; a second open of the same directory fails
//! rather than corrupting the log.
//!
//! Read handles are cached here: segment files that are no longer appended
//! to are immutable, so they are served through read-only memory maps; the
//! file currently being written is served through positional reads on a
//! plain handle.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use memmap2::Mmap;
use tracing::{debug, info, warn};

use crate::log::LogError;

/// Name of the environment lock file.
pub const LOCK_FILE: &str = "arbor.lck";

/// Segment file extension.
pub const SEGMENT_SUFFIX: &str = "jdb";

/// Extension given to cleaned files when deletion is disabled.
pub const RECLAIMED_SUFFIX: &str = "del";

/// OS-level file handling for one environment directory.
#[derive(Debug)]
pub struct FileManager {
    dir: PathBuf,
    read_only: bool,
    /// Held for the process lifetime; the advisory lock dies with it.
    _lock_file: File,
    /// Read-only maps of immutable (closed) segments.
    maps: Mutex<HashMap<u64, Arc<Mmap>>>,
    /// Plain read handles, used for the segment still being appended.
    readers: Mutex<HashMap<u64, Arc<File>>>,
}

impl FileManager {
    /// Open the directory, creating it when allowed, and take the
    /// environment lock.
    pub fn open(dir: &Path, read_only: bool, allow_create: bool) -> Result<Self, LogError> {
        if !dir.exists() {
            if !allow_create || read_only {
                return Err(LogError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("environment directory {} does not exist", dir.display()),
                )));
            }
            fs::create_dir_all(dir)?;
        }

        let lock_path = dir.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            warn!(dir = %dir.display(), "environment already locked");
            return Err(LogError::Locked);
        }

        info!(dir = %dir.display(), read_only, "environment directory locked");

        Ok(Self {
            dir: dir.to_path_buf(),
            read_only,
            _lock_file: lock_file,
            maps: Mutex::new(HashMap::new()),
            readers: Mutex::new(HashMap::new()),
        })
    }

    /// The environment directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of segment `n`.
    pub fn segment_path(&self, n: u64) -> PathBuf {
        self.dir.join(format!("{n:08x}.{SEGMENT_SUFFIX}"))
    }

    fn reclaimed_path(&self, n: u64) -> PathBuf {
        self.dir.join(format!("{n:08x}.{RECLAIMED_SUFFIX}"))
    }

    /// All live segment numbers, ascending.
    pub fn list_segments(&self) -> Result<Vec<u64>, LogError> {
        let mut out = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_SUFFIX) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match u64::from_str_radix(stem, 16) {
                Ok(n) => out.push(n),
                Err(_) => {
                    return Err(LogError::BadHeader(format!(
                        "unparseable segment name {}",
                        path.display()
                    )));
                }
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Create segment `n`; fails if it already exists.
    pub fn create_segment(&self, n: u64) -> Result<File, LogError> {
        let path = self.segment_path(n);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        debug!(file = n, path = %path.display(), "segment created");
        Ok(file)
    }

    /// Open an existing segment for continued appending; returns the handle
    /// positioned at `offset` plus the current file length.
    pub fn open_segment_append(&self, n: u64, offset: u64) -> Result<(File, u64), LogError> {
        let path = self.segment_path(n);
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(offset))?;
        Ok((file, len))
    }

    /// Truncate segment `n` to `len` bytes (crash-tail repair).
    pub fn truncate_segment(&self, n: u64, len: u64) -> Result<(), LogError> {
        let file = OpenOptions::new().write(true).open(self.segment_path(n))?;
        file.set_len(len)?;
        file.sync_all()?;
        Ok(())
    }

    /// Size of segment `n` in bytes.
    pub fn segment_size(&self, n: u64) -> Result<u64, LogError> {
        Ok(fs::metadata(self.segment_path(n))?.len())
    }

    /// Read-only map of an immutable segment (cached).
    pub fn map_segment(&self, n: u64) -> Result<Arc<Mmap>, LogError> {
        let mut maps = self
            .maps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(m) = maps.get(&n) {
            return Ok(Arc::clone(m));
        }
        let file = File::open(self.segment_path(n))?;
        // The segment is immutable from here on: the writer has moved to a
        // later file and only the cleaner may delete it, which evicts this
        // map first.
        let map = unsafe { Mmap::map(&file)? };
        let map = Arc::new(map);
        maps.insert(n, Arc::clone(&map));
        Ok(map)
    }

    /// Plain cached read handle for segment `n`.
    pub fn open_reader(&self, n: u64) -> Result<Arc<File>, LogError> {
        let mut readers = self
            .readers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(f) = readers.get(&n) {
            return Ok(Arc::clone(f));
        }
        let file = Arc::new(File::open(self.segment_path(n))?);
        readers.insert(n, Arc::clone(&file));
        Ok(file)
    }

    fn evict_handles(&self, n: u64) {
        self.maps
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&n);
        self.readers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&n);
    }

    /// Remove a reclaimed segment: delete it outright, or rename it to the
    /// `.del` suffix when deletion is disabled.
    pub fn retire_segment(&self, n: u64, remove: bool) -> Result<(), LogError> {
        self.evict_handles(n);
        let path = self.segment_path(n);
        if remove {
            fs::remove_file(&path)?;
            info!(file = n, "segment deleted");
        } else {
            let target = self.reclaimed_path(n);
            fs::rename(&path, &target)?;
            info!(file = n, target = %target.display(), "segment renamed");
        }
        Ok(())
    }

    /// Total bytes across live segment files.
    pub fn live_size(&self) -> Result<u64, LogError> {
        let mut total = 0;
        for n in self.list_segments()? {
            total += self.segment_size(n)?;
        }
        Ok(total)
    }

    /// Fsync the directory entry itself, making renames/deletes durable.
    pub fn sync_dir(&self) -> Result<(), LogError> {
        if !self.read_only {
            File::open(&self.dir)?.sync_all()?;
        }
        Ok(())
    }
}
