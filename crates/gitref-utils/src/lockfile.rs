use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::error::{LockError, UtilError};
use crate::fsnapshot::FileSnapshot;
use crate::Result;

const LOCK_SUFFIX: &str = ".lock";

/// How long to sleep between attempts to nudge the lock file's mtime past
/// the target's, and how many rounds to try before giving up.
const STAT_POLL: Duration = Duration::from_millis(25);
const STAT_ROUNDS: u32 = 40;

/// RAII lock file guard. Creates a `.lock` file on construction,
/// atomically renames onto the target on commit, removes on drop if not
/// committed.
///
/// This is C git's lock file protocol:
/// - Create `<path>.lock` with O_CREAT|O_EXCL
/// - Write new contents to the lock file
/// - Atomically rename `.lock` onto the target on commit
/// - Remove `.lock` on drop if not committed (rollback)
pub struct LockFile {
    /// The target file path (without .lock suffix).
    path: PathBuf,
    /// The lock file path (with .lock suffix).
    lock_path: PathBuf,
    /// The open file handle for writing.
    file: Option<File>,
    /// Whether commit() or rollback() has run.
    done: bool,
    /// Flush with fsync before the commit rename.
    fsync: bool,
    /// Capture a FileSnapshot of the written content at commit time.
    need_snapshot: bool,
}

impl LockFile {
    /// Acquire a lock on the given path. Creates `path.lock` using
    /// O_CREAT|O_EXCL semantics.
    ///
    /// Fails with `LockError::AlreadyLocked` if another writer holds the
    /// lock, or `LockError::Create` if the file cannot be created.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock_path = PathBuf::from(format!("{}{}", path.display(), LOCK_SUFFIX));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    debug!(lock = %lock_path.display(), "lock contention");
                    UtilError::Lock(LockError::AlreadyLocked {
                        path: lock_path.clone(),
                    })
                } else {
                    UtilError::Lock(LockError::Create {
                        path: lock_path.clone(),
                        source: e,
                    })
                }
            })?;

        Ok(Self {
            path,
            lock_path,
            file: Some(file),
            done: false,
            fsync: false,
            need_snapshot: false,
        })
    }

    /// Try to acquire without surfacing contention as an error. Returns
    /// Ok(None) if already locked, Ok(Some(lock)) on success.
    pub fn try_acquire(path: impl AsRef<Path>) -> Result<Option<Self>> {
        match Self::acquire(path) {
            Ok(lk) => Ok(Some(lk)),
            Err(UtilError::Lock(LockError::AlreadyLocked { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Force a durable flush of the written content before the commit rename.
    pub fn set_fsync(&mut self, on: bool) {
        self.fsync = on;
    }

    /// Capture a `FileSnapshot` of the lock file at commit time; `commit`
    /// returns it so callers can seed their caches with the exact state
    /// that landed on disk.
    pub fn set_need_snapshot(&mut self, on: bool) {
        self.need_snapshot = on;
    }

    /// Get the path of the target file (without .lock).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the path of the lock file (with .lock).
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Ensure the lock file's mtime differs from the target's, so observers
    /// that stat the target can see the commit even on filesystems with
    /// coarse timestamps. Sleeps in short rounds, nudging the lock file's
    /// mtime forward, and gives up after a bounded number of attempts (the
    /// rename itself stays atomic either way).
    pub fn wait_for_stat_change(&mut self) -> Result<()> {
        let target_mtime = match fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(_) => return Ok(()), // no target yet; any mtime differs
        };
        for _ in 0..STAT_ROUNDS {
            let lock_mtime = fs::metadata(&self.lock_path).and_then(|m| m.modified())?;
            if lock_mtime != target_mtime {
                return Ok(());
            }
            std::thread::sleep(STAT_POLL);
            if let Some(file) = &self.file {
                file.set_modified(SystemTime::now())?;
            }
        }
        debug!(lock = %self.lock_path.display(), "stat change wait exhausted");
        Ok(())
    }

    /// Commit: flush, optionally fsync, and atomically rename `.lock` onto
    /// the target. Returns the commit snapshot when `set_need_snapshot(true)`
    /// was called.
    pub fn commit(mut self) -> Result<Option<FileSnapshot>> {
        if let Some(file) = &mut self.file {
            file.flush().map_err(|e| {
                UtilError::Lock(LockError::Commit {
                    path: self.lock_path.clone(),
                    source: e,
                })
            })?;
            if self.fsync {
                file.sync_all().map_err(|e| {
                    UtilError::Lock(LockError::Commit {
                        path: self.lock_path.clone(),
                        source: e,
                    })
                })?;
            }
        }
        // Close the handle before rename; snapshot the content that is
        // about to become the target (rename preserves mtime and size).
        self.file.take();
        let snapshot = self
            .need_snapshot
            .then(|| FileSnapshot::save(&self.lock_path));

        fs::rename(&self.lock_path, &self.path).map_err(|e| {
            UtilError::Lock(LockError::Commit {
                path: self.lock_path.clone(),
                source: e,
            })
        })?;

        self.done = true;
        Ok(snapshot)
    }

    /// Rollback: remove the `.lock` file without touching the target (also
    /// happens on Drop).
    pub fn rollback(mut self) -> Result<()> {
        self.file.take();
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path)?;
        }
        self.done = true;
        Ok(())
    }
}

impl Write for LockFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already closed"))?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("lock file already closed"))?
            .flush()
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if !self.done {
            self.file.take();
            let _ = fs::remove_file(&self.lock_path);
        }
    }
}
