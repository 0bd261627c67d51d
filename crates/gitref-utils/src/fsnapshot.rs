use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Worst-case filesystem timestamp resolution. A snapshot whose read time
/// falls within this window of the file's mtime cannot rule out a same-mtime
/// rewrite and must be treated as modified.
const RACY_WINDOW: Duration = Duration::from_millis(2500);

/// A compact record of a file's state at the moment it was read.
///
/// Used to answer "did this file change under me?" by re-statting instead of
/// re-reading content. A missing file is represented with `mtime == None`, so
/// missing-then-still-missing compares as unmodified.
#[derive(Debug, Clone, Copy)]
pub struct FileSnapshot {
    mtime: Option<SystemTime>,
    size: u64,
    last_read: SystemTime,
}

impl FileSnapshot {
    /// Capture the current state of `path`.
    pub fn save(path: &Path) -> Self {
        let last_read = SystemTime::now();
        match fs::metadata(path) {
            Ok(meta) => Self {
                mtime: meta.modified().ok(),
                size: meta.len(),
                last_read,
            },
            Err(_) => Self {
                mtime: None,
                size: 0,
                last_read,
            },
        }
    }

    /// Snapshot of a file known not to exist.
    pub fn missing() -> Self {
        Self {
            mtime: None,
            size: 0,
            last_read: SystemTime::now(),
        }
    }

    /// Whether this snapshot was taken of an absent file.
    pub fn is_missing_file(&self) -> bool {
        self.mtime.is_none()
    }

    /// Re-stat `path` and report whether it may differ from this snapshot.
    ///
    /// Returns true on any mtime or size difference, and also while the
    /// snapshot is still inside the timestamp-resolution window where a
    /// same-mtime rewrite could hide.
    pub fn is_modified(&self, path: &Path) -> bool {
        let (cur_mtime, cur_size) = match fs::metadata(path) {
            Ok(meta) => (meta.modified().ok(), meta.len()),
            Err(_) => (None, 0),
        };
        if self.mtime != cur_mtime || self.size != cur_size {
            return true;
        }
        self.is_racy_clean()
    }

    fn is_racy_clean(&self) -> bool {
        match self.mtime {
            Some(mtime) => self
                .last_read
                .duration_since(mtime)
                .map(|age| age <= RACY_WINDOW)
                .unwrap_or(true),
            None => false,
        }
    }

    /// Adopt the read time of a fresher snapshot whose content compared
    /// equal, so the next `is_modified` check can trust the mtime again.
    pub fn set_clean(&mut self, fresh: &FileSnapshot) {
        self.last_read = fresh.last_read;
    }
}

/// Equality covers what was on disk (mtime and size); the read time is an
/// observation detail, not part of the file's state.
impl PartialEq for FileSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.mtime == other.mtime && self.size == other.size
    }
}

impl Eq for FileSnapshot {}
