use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use bstr::ByteSlice;
use gitref_hash::ObjectId;
use gitref_utils::FileSnapshot;
use tracing::debug;

use crate::error::RefError;
use crate::list::RefItem;
use crate::name::RefName;
use crate::{Ref, Storage};

/// Loose ref files larger than this are never valid; a symbolic ref that
/// fills the whole buffer may have been truncated and reads as "no value".
pub(crate) const READ_LIMIT: usize = 4096;

/// A loose ref paired with the snapshot of the file that produced it, so
/// "is my cached value still current?" is a stat, not a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LooseRef {
    pub(crate) snapshot: FileSnapshot,
    pub(crate) value: Ref,
}

impl RefItem for LooseRef {
    fn name(&self) -> &str {
        self.value.name().as_str()
    }
}

/// Outcome of re-examining one loose ref file against a cached entry.
#[derive(Debug)]
pub(crate) enum Scanned {
    /// Snapshot says the file is unchanged; the cached entry is current.
    Unmodified,
    /// Content re-read and equal; the entry only adopted a fresher read
    /// time. Installing it is not an observed change.
    Refreshed(LooseRef),
    /// A (new) value was read from disk.
    Changed(LooseRef),
    /// No usable value: absent, empty, a directory, or possibly truncated.
    Missing,
}

/// Filesystem path of a loose ref.
pub(crate) fn loose_path(git_dir: &Path, name: &str) -> PathBuf {
    git_dir.join(name)
}

/// Examine the loose file for `name`, reusing `cached` when its snapshot
/// still matches the file.
pub(crate) fn scan_ref(
    git_dir: &Path,
    cached: Option<&LooseRef>,
    name: &RefName,
) -> Result<Scanned, RefError> {
    let path = loose_path(git_dir, name.as_str());

    if let Some(cached) = cached {
        if !cached.snapshot.is_modified(&path) {
            return Ok(Scanned::Unmodified);
        }
    }

    if path.is_dir() {
        return Ok(Scanned::Missing);
    }
    let fresh = FileSnapshot::save(&path);
    let buf = match read_head(&path, READ_LIMIT) {
        Ok(buf) => buf,
        // NotADirectory: a path component of `name` exists as a file.
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
            ) =>
        {
            return Ok(Scanned::Missing)
        }
        Err(source) => return Err(RefError::IoPath { path, source }),
    };

    if buf.is_empty() {
        return Ok(Scanned::Missing);
    }

    if buf.starts_with(b"ref: ") {
        if buf.len() == READ_LIMIT {
            // A full buffer cannot prove we saw the whole target name.
            debug!(name = %name, "symbolic ref fills read buffer, possibly truncated");
            return Ok(Scanned::Missing);
        }
        let target = buf[5..].trim();
        let target_str = std::str::from_utf8(target).map_err(|_| malformed(&path, &buf))?;
        let target_name = RefName::new(target_str).map_err(|_| malformed(&path, &buf))?;

        if let Some(cached) = cached {
            if let Some(cached_target) = cached.value.target() {
                if cached_target.name() == &target_name {
                    let mut snapshot = cached.snapshot;
                    snapshot.set_clean(&fresh);
                    return Ok(Scanned::Refreshed(LooseRef {
                        snapshot,
                        value: cached.value.clone(),
                    }));
                }
            }
        }
        return Ok(Scanned::Changed(LooseRef {
            snapshot: fresh,
            value: Ref::Symbolic {
                storage: Storage::Loose,
                name: name.clone(),
                target: Box::new(Ref::Unpeeled {
                    storage: Storage::New,
                    name: target_name,
                    id: None,
                }),
            },
        }));
    }

    if buf.len() < ObjectId::HEX_LEN {
        return Err(malformed(&path, &buf));
    }
    let id = ObjectId::from_hex_bytes(&buf[..ObjectId::HEX_LEN])
        .map_err(|_| malformed(&path, &buf))?;

    if let Some(cached) = cached {
        if !cached.value.is_symbolic() && cached.value.object_id() == Some(id) {
            // Same id as the cached direct ref: keep it (including any
            // memoized peel state), just adopt the fresher read time.
            let mut snapshot = cached.snapshot;
            snapshot.set_clean(&fresh);
            return Ok(Scanned::Refreshed(LooseRef {
                snapshot,
                value: cached.value.clone(),
            }));
        }
    }

    Ok(Scanned::Changed(LooseRef {
        snapshot: fresh,
        value: Ref::Unpeeled {
            storage: Storage::Loose,
            name: name.clone(),
            id: Some(id),
        },
    }))
}

fn malformed(path: &Path, buf: &[u8]) -> RefError {
    let prefix = &buf[..buf.len().min(32)];
    RefError::Malformed {
        path: path.to_path_buf(),
        content: String::from_utf8_lossy(prefix).into_owned(),
    }
}

/// Read up to `limit` bytes from the head of `path`.
fn read_head(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; limit];
    let mut n = 0;
    while n < limit {
        let read = file.read(&mut buf[n..])?;
        if read == 0 {
            break;
        }
        n += read;
    }
    buf.truncate(n);
    Ok(buf)
}

/// Delete `path` if present, then prune up to `levels` now-empty parent
/// directories. Pruning stops at the first non-empty directory.
pub(crate) fn delete_with_prune(path: &Path, levels: usize) -> Result<(), RefError> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(RefError::IoPath {
                path: path.to_path_buf(),
                source,
            })
        }
    }
    let mut dir = path.parent();
    for _ in 0..levels {
        match dir {
            Some(d) if fs::remove_dir(d).is_ok() => dir = d.parent(),
            _ => break,
        }
    }
    Ok(())
}
