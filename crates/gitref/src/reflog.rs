//! Reflog writing: one append-only log per ref under `logs/`.
//!
//! The database writes and deletes logs when told; interpreting their
//! contents belongs to higher layers.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bstr::{BStr, BString, ByteSlice, ByteVec};
use gitref_hash::ObjectId;
use gitref_utils::date::Signature;

use crate::error::RefError;
use crate::files::loose::delete_with_prune;

/// A single reflog line recording a ref value change.
///
/// Format: `<old-oid> SP <new-oid> SP <ident>\t<message>\n`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReflogEntry {
    pub old_id: ObjectId,
    pub new_id: ObjectId,
    pub identity: Signature,
    pub message: BString,
}

impl ReflogEntry {
    /// Parse one reflog line.
    pub fn parse(line: &BStr) -> Result<Self, RefError> {
        let line = line.as_bytes();
        let hex = ObjectId::HEX_LEN;

        // Two hex ids and their separating spaces at minimum.
        if line.len() < hex * 2 + 2 {
            return Err(RefError::Reflog(format!(
                "reflog line too short: {} bytes",
                line.len()
            )));
        }
        if line[hex] != b' ' || line[hex * 2 + 1] != b' ' {
            return Err(RefError::Reflog("malformed reflog line".into()));
        }

        let old_id = ObjectId::from_hex_bytes(&line[..hex])?;
        let new_id = ObjectId::from_hex_bytes(&line[hex + 1..hex * 2 + 1])?;

        let rest = &line[hex * 2 + 2..];
        let (ident_part, message) = match rest.find_byte(b'\t') {
            Some(tab) => (&rest[..tab], &rest[tab + 1..]),
            None => (rest, &b""[..]),
        };
        let identity = Signature::parse(ident_part.as_bstr())
            .map_err(|e| RefError::Reflog(format!("invalid identity in reflog: {e}")))?;

        let message = message.strip_suffix(b"\n").unwrap_or(message);
        Ok(Self {
            old_id,
            new_id,
            identity,
            message: BString::from(message),
        })
    }

    /// Serialize to the line format (without trailing newline).
    pub fn to_bytes(&self) -> BString {
        let mut out = BString::new(Vec::with_capacity(128));
        out.push_str(self.old_id.to_hex().as_bytes());
        out.push(b' ');
        out.push_str(self.new_id.to_hex().as_bytes());
        out.push(b' ');
        out.push_str(self.identity.to_bytes());
        out.push(b'\t');
        out.push_str(&self.message);
        out
    }
}

/// Writes reflogs for a reference database rooted at one repository
/// directory.
pub struct ReflogWriter<'a> {
    git_dir: &'a Path,
}

impl<'a> ReflogWriter<'a> {
    pub(crate) fn new(git_dir: &'a Path) -> Self {
        Self { git_dir }
    }

    /// Initialize the `logs/` tree.
    pub fn create(&self) -> Result<(), RefError> {
        let path = self.git_dir.join("logs/refs/heads");
        fs::create_dir_all(&path).map_err(|source| RefError::IoPath { path, source })
    }

    /// The log file path for `name`.
    pub fn log_for(&self, name: &str) -> PathBuf {
        self.git_dir.join("logs").join(name)
    }

    /// Logs spring into existence for these on first write; elsewhere an
    /// entry is only appended when the log file already exists.
    fn auto_creates(name: &str) -> bool {
        name == "HEAD" || name.starts_with("refs/heads/") || name.starts_with("refs/remotes/")
    }

    /// Append one entry to the log for `name`.
    pub fn log(
        &self,
        name: &str,
        old_id: ObjectId,
        new_id: ObjectId,
        identity: &Signature,
        message: &str,
    ) -> Result<(), RefError> {
        let path = self.log_for(name);
        if !path.is_file() && !Self::auto_creates(name) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| RefError::IoPath {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let entry = ReflogEntry {
            old_id,
            new_id,
            identity: identity.clone(),
            // Newlines would corrupt the line-oriented format.
            message: BString::from(message.replace(['\n', '\r'], " ")),
        };
        let mut line = entry.to_bytes();
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| RefError::IoPath {
                path: path.clone(),
                source,
            })?;
        file.write_all(&line)
            .map_err(|source| RefError::WriteFailed { path, source })
    }

    /// Read all entries for `name`, newest first.
    pub fn read(&self, name: &str) -> Result<Vec<ReflogEntry>, RefError> {
        let path = self.log_for(name);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(RefError::IoPath { path, source }),
        };

        let mut entries = Vec::new();
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            entries.push(ReflogEntry::parse(line.as_bstr())?);
        }
        entries.reverse();
        Ok(entries)
    }

    /// Remove the log for `name` and prune now-empty parent directories.
    pub fn delete(&self, name: &str) -> Result<(), RefError> {
        let path = self.log_for(name);
        let levels = name.matches('/').count().saturating_sub(2);
        delete_with_prune(&path, levels)
    }
}
