use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use tracing::trace;

use crate::error::RefError;
use crate::files::loose::{self, LooseRef, Scanned};
use crate::list::{RefItem, RefList, RefListBuilder};
use crate::name::RefName;
use crate::Ref;

/// Result of reconciling the cached loose list with the on-disk tree.
pub(crate) struct ScanOutcome {
    /// Replacement list, or `None` when nothing diverged from the cache.
    pub new_loose: Option<RefList<LooseRef>>,
    /// Symbolic refs encountered inside the scanned prefix.
    pub symbolic: Vec<Ref>,
    /// Whether any entry was added, removed, or changed value. A pure
    /// snapshot refresh produces a new list without setting this.
    pub value_changed: bool,
}

/// Walks `HEAD` plus the `refs/` tree (or one subtree), merging what is on
/// disk with a previously cached sorted list in name order.
///
/// Directory entries sort after their flat siblings by appending `/` before
/// sorting, which makes the walk order equal full-name order, so a single
/// cursor into the cached list suffices. The replacement builder is
/// allocated lazily at the first divergence.
pub(crate) struct LooseScanner<'a> {
    git_dir: &'a Path,
    cur: &'a RefList<LooseRef>,
    cur_idx: usize,
    new_loose: Option<RefListBuilder<LooseRef>>,
    symbolic: Vec<Ref>,
    value_changed: bool,
}

impl<'a> LooseScanner<'a> {
    pub(crate) fn new(git_dir: &'a Path, cur: &'a RefList<LooseRef>) -> Self {
        Self {
            git_dir,
            cur,
            cur_idx: 0,
            new_loose: None,
            symbolic: Vec::new(),
            value_changed: false,
        }
    }

    /// Scan everything (`prefix == ""`) or one `refs/…/` subtree. Cached
    /// entries outside a subtree prefix are preserved unchanged.
    pub(crate) fn scan(&mut self, prefix: &str) -> Result<(), RefError> {
        if prefix.is_empty() {
            self.scan_one("HEAD")?;
            let refs_dir = self.git_dir.join("refs");
            self.scan_tree("refs/", &refs_dir)?;
            if self.cur_idx < self.cur.len() {
                // Cached entries sorted after everything on disk: deleted.
                self.ensure_builder();
                self.value_changed = true;
                self.cur_idx = self.cur.len();
            }
        } else {
            debug_assert!(prefix.starts_with("refs/") && prefix.ends_with('/'));
            self.cur_idx = match self.cur.find(prefix) {
                Ok(i) | Err(i) => i,
            };
            let dir = self.git_dir.join(&prefix[..prefix.len() - 1]);
            self.scan_tree(prefix, &dir)?;
            // Cached entries still inside the prefix were deleted on disk.
            while self.cur_idx < self.cur.len() {
                if !RefItem::name(self.cur.at(self.cur_idx)).starts_with(prefix) {
                    break;
                }
                self.ensure_builder();
                self.value_changed = true;
                self.cur_idx += 1;
            }
            // Entries past the prefix are outside this scan; keep them.
            if self.new_loose.is_some() {
                while self.cur_idx < self.cur.len() {
                    let entry = self.cur.at(self.cur_idx).clone();
                    self.push(entry);
                    self.cur_idx += 1;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> ScanOutcome {
        ScanOutcome {
            new_loose: self.new_loose.map(|mut b| {
                b.sort();
                b.to_ref_list()
            }),
            symbolic: self.symbolic,
            value_changed: self.value_changed,
        }
    }

    fn scan_tree(&mut self, prefix: &str, dir: &Path) -> Result<(), RefError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(RefError::IoPath {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut names: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| RefError::IoPath {
                path: dir.to_path_buf(),
                source,
            })?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if name.ends_with(".lock") {
                continue;
            }
            if entry.path().is_dir() {
                names.push(format!("{name}/"));
            } else {
                names.push(name.to_string());
            }
        }
        names.sort_unstable();

        for name in names {
            if let Some(dir_name) = name.strip_suffix('/') {
                self.scan_tree(&format!("{prefix}{name}"), &dir.join(dir_name))?;
            } else {
                self.scan_one(&format!("{prefix}{name}"))?;
            }
        }
        Ok(())
    }

    fn scan_one(&mut self, name: &str) -> Result<(), RefError> {
        let Ok(ref_name) = RefName::new(name) else {
            trace!(name, "skipping invalid ref name on disk");
            return Ok(());
        };

        // Cached entries sorted before this disk entry have no file anymore.
        let mut cached: Option<LooseRef> = None;
        while self.cur_idx < self.cur.len() {
            match RefItem::name(self.cur.at(self.cur_idx)).cmp(name) {
                Ordering::Less => {
                    self.ensure_builder();
                    self.value_changed = true;
                    self.cur_idx += 1;
                }
                Ordering::Equal => {
                    cached = Some(self.cur.at(self.cur_idx).clone());
                    break;
                }
                Ordering::Greater => break,
            }
        }

        match loose::scan_ref(self.git_dir, cached.as_ref(), &ref_name)? {
            Scanned::Unmodified => {
                if let Some(entry) = cached {
                    self.cur_idx += 1;
                    self.push(entry);
                }
            }
            Scanned::Refreshed(entry) => {
                self.ensure_builder();
                self.cur_idx += 1;
                self.push(entry);
            }
            Scanned::Changed(entry) => {
                self.ensure_builder();
                if cached.is_some() {
                    self.cur_idx += 1;
                }
                self.value_changed = true;
                self.push(entry);
            }
            Scanned::Missing => {
                if cached.is_some() {
                    self.ensure_builder();
                    self.value_changed = true;
                    self.cur_idx += 1;
                }
            }
        }
        Ok(())
    }

    /// Emit one entry of the scan result, tracking symbolic refs.
    fn push(&mut self, entry: LooseRef) {
        if entry.value.is_symbolic() {
            self.symbolic.push(entry.value.clone());
        }
        if let Some(builder) = &mut self.new_loose {
            builder.push(entry);
        }
    }

    /// Seed the replacement builder with everything emitted so far, which —
    /// before the first divergence — is exactly the cached prefix.
    fn ensure_builder(&mut self) {
        if self.new_loose.is_none() {
            self.new_loose = Some(self.cur.copy_first(self.cur_idx));
        }
    }
}
