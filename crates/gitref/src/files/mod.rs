pub(crate) mod loose;
pub(crate) mod packed;
pub mod rename;
pub(crate) mod scan;
pub mod update;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use gitref_utils::date::Signature;
use gitref_utils::{FileSnapshot, LockFile};
use tracing::debug;

use crate::error::RefError;
use crate::list::RefList;
use crate::name::{self, RefName};
use crate::reflog::ReflogWriter;
use crate::{ObjectPeeler, Ref, RefReader, Storage};

use self::loose::{LooseRef, Scanned};
use self::packed::PackedRefList;
use self::rename::RefRename;
use self::scan::LooseScanner;
use self::update::RefUpdate;

/// Prefixes tried in order when resolving a short name; first match wins.
pub const SEARCH_PATH: [&str; 5] = ["", "refs/", "refs/tags/", "refs/heads/", "refs/remotes/"];

/// Maximum depth of a symbolic ref chain; deeper chains read as
/// "does not exist".
pub(crate) const MAX_SYMBOLIC_DEPTH: usize = 5;

/// Pseudo-refs living next to `HEAD`. Read on demand, never cached, never
/// packed.
pub(crate) const ADDITIONAL_REF_NAMES: [&str; 4] =
    ["MERGE_HEAD", "FETCH_HEAD", "ORIG_HEAD", "CHERRY_PICK_HEAD"];

/// The filesystem-backed reference database: loose files under `refs/` plus
/// the `packed-refs` file, presented as one namespace where loose wins.
///
/// Reads are lock-free. Each cache is an immutable snapshot in an atomic
/// cell, revalidated by [`FileSnapshot`] stats and replaced by
/// compare-and-set; a losing writer simply discards its result. On-disk
/// mutations serialize through `.lock` files committed by atomic rename.
pub struct RefDatabase {
    git_dir: PathBuf,
    packed_refs_path: PathBuf,
    /// Cached loose refs, sorted by name.
    loose: ArcSwap<RefList<LooseRef>>,
    /// Cached parse of `packed-refs`.
    packed: ArcSwap<PackedRefList>,
    /// Bumped on every observed change, internal or external.
    mod_count: AtomicU64,
    /// Last `mod_count` value for which listeners were notified.
    last_notified: AtomicU64,
    listeners: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    committer: Option<Signature>,
}

impl RefDatabase {
    /// Create a database over `git_dir`. No I/O happens until the first
    /// operation.
    pub fn new(git_dir: impl AsRef<Path>) -> Self {
        let git_dir = git_dir.as_ref().to_path_buf();
        let packed_refs_path = git_dir.join("packed-refs");
        Self {
            git_dir,
            packed_refs_path,
            loose: ArcSwap::from_pointee(RefList::empty()),
            packed: ArcSwap::from_pointee(PackedRefList::none()),
            mod_count: AtomicU64::new(0),
            last_notified: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            committer: None,
        }
    }

    /// Set the identity reflog entries are written with. Without one, reflog
    /// writes are skipped.
    pub fn set_committer(&mut self, sig: Signature) {
        self.committer = Some(sig);
    }

    pub(crate) fn committer(&self) -> Option<&Signature> {
        self.committer.as_ref()
    }

    /// The repository directory this database lives in.
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// The reflog writer for this database.
    pub fn reflog(&self) -> ReflogWriter<'_> {
        ReflogWriter::new(&self.git_dir)
    }

    /// Initialize the on-disk layout: `refs/`, `refs/heads/`, `refs/tags/`
    /// and the reflog directory.
    pub fn create(&self) -> Result<(), RefError> {
        for dir in ["refs/heads", "refs/tags"] {
            let path = self.git_dir.join(dir);
            fs::create_dir_all(&path).map_err(|source| RefError::IoPath { path, source })?;
        }
        self.reflog().create()
    }

    /// Drop both caches; the next read fully rescans.
    pub fn refresh(&self) {
        self.loose.store(Arc::new(RefList::empty()));
        self.packed.store(Arc::new(PackedRefList::none()));
    }

    /// Register a callback fired when the set of refs changes. Exactly one
    /// notification fires per observed transition; the initial population of
    /// a fresh database is suppressed.
    pub fn add_refs_changed_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(listener));
    }

    /// Current value of the modification counter (monotonic non-decreasing).
    pub fn modification_count(&self) -> u64 {
        self.mod_count.load(Ordering::SeqCst)
    }

    /// Search for `name` along [`SEARCH_PATH`] and resolve the first match.
    pub fn get_ref(&self, name: &str) -> Result<Option<Ref>, RefError> {
        let packed = self.get_packed_refs()?;
        let mut result = None;
        for prefix in SEARCH_PATH {
            let full = format!("{prefix}{name}");
            if let Some(r) = self.read_one(&full, &packed)? {
                result = self.resolve(&r, 0, None, &packed)?;
                break;
            }
        }
        self.fire_refs_changed();
        Ok(result)
    }

    /// Look up exactly `name` (no search path) and resolve it.
    pub fn exact_ref(&self, name: &str) -> Result<Option<Ref>, RefError> {
        let packed = self.get_packed_refs()?;
        let result = match self.read_one(name, &packed)? {
            Some(r) => self.resolve(&r, 0, None, &packed)?,
            None => None,
        };
        self.fire_refs_changed();
        Ok(result)
    }

    /// All refs whose names start with `prefix` (`""` for everything,
    /// including `HEAD`), as a map keyed by full name. Symbolic refs are
    /// resolved to their leaves; broken ones are omitted. For shared names
    /// the loose value wins.
    pub fn get_refs(&self, prefix: &str) -> Result<BTreeMap<String, Ref>, RefError> {
        // A refs/…/ prefix scans just that subtree; anything else rescans
        // everything and filters below.
        let scan_prefix = if prefix.starts_with("refs/") && prefix.ends_with('/') {
            prefix
        } else {
            ""
        };

        let cur_loose = self.loose.load_full();
        let packed = self.get_packed_refs()?;

        let mut scanner = LooseScanner::new(&self.git_dir, &cur_loose);
        scanner.scan(scan_prefix)?;
        let outcome = scanner.finish();

        let mut loose_list: RefList<LooseRef> = match outcome.new_loose {
            Some(list) => {
                if self.cas_loose(&cur_loose, list.clone()) && outcome.value_changed {
                    self.mod_count.fetch_add(1, Ordering::SeqCst);
                }
                list
            }
            None => (*cur_loose).clone(),
        };
        self.fire_refs_changed();

        // Resolve the symbolic refs against the view we just scanned.
        let mut resolved = Vec::new();
        for sym in &outcome.symbolic {
            match self.resolve(sym, 0, Some((scan_prefix, &loose_list)), &packed)? {
                Some(r) if r.object_id().is_some() => resolved.push(r),
                _ => {
                    // Missing leaf or over-deep chain: leave it out.
                    if let Ok(idx) = loose_list.find(sym.name().as_str()) {
                        loose_list = loose_list.remove(idx);
                    }
                }
            }
        }

        let mut map = BTreeMap::new();
        for r in packed.list.iter() {
            if r.name().as_str().starts_with(prefix) {
                map.insert(r.name().as_str().to_string(), r.clone());
            }
        }
        for entry in loose_list.iter() {
            let r = &entry.value;
            if !r.is_symbolic() && r.name().as_str().starts_with(prefix) {
                map.insert(r.name().as_str().to_string(), r.clone());
            }
        }
        for r in resolved {
            if r.name().as_str().starts_with(prefix) {
                map.insert(r.name().as_str().to_string(), r);
            }
        }
        Ok(map)
    }

    /// The subset of the pseudo-refs (`MERGE_HEAD`, `FETCH_HEAD`,
    /// `ORIG_HEAD`, `CHERRY_PICK_HEAD`) that currently exist.
    pub fn get_additional_refs(&self) -> Result<Vec<Ref>, RefError> {
        let mut out = Vec::new();
        for name in ADDITIONAL_REF_NAMES {
            let ref_name = RefName::new_unchecked(name);
            match loose::scan_ref(&self.git_dir, None, &ref_name)? {
                Scanned::Changed(entry) | Scanned::Refreshed(entry) => out.push(entry.value),
                _ => {}
            }
        }
        Ok(out)
    }

    /// Whether `name` nests under an existing ref or an existing ref nests
    /// under `name`. `refs/heads/a` blocks both `refs/heads/a/b` and
    /// `refs/heads`.
    pub fn is_name_conflicting(&self, name: &str) -> Result<bool, RefError> {
        let packed = self.get_packed_refs()?;

        // An existing ref may not be an ancestor path component of `name`.
        let mut end = name.len();
        while let Some(pos) = name[..end].rfind('/') {
            let needle = &name[..pos];
            if self.read_one(needle, &packed)?.is_some() {
                return Ok(true);
            }
            end = pos;
        }

        // Nor may `name` contain an existing ref beneath it.
        let prefix = format!("{name}/");
        Ok(!self.get_refs(&prefix)?.is_empty())
    }

    /// Peel `r`'s leaf through the object graph: tags to their non-tag
    /// target, anything else to itself. The peeled value is memoized into
    /// the loose cache only if the leaf is still the cached value.
    pub fn peel(&self, objects: &dyn ObjectPeeler, r: &Ref) -> Result<Ref, RefError> {
        let leaf = r.leaf();
        if leaf.is_peeled() {
            return Ok(r.clone());
        }
        let Some(id) = leaf.object_id() else {
            return Ok(r.clone());
        };

        let mut cursor = id;
        let mut hops = 0usize;
        while let Some(next) = objects.tag_target(&cursor)? {
            cursor = next;
            hops += 1;
        }
        let new_leaf = if hops > 0 {
            Ref::PeeledTag {
                storage: leaf.storage(),
                name: leaf.name().clone(),
                id,
                peeled: cursor,
            }
        } else {
            Ref::PeeledNonTag {
                storage: leaf.storage(),
                name: leaf.name().clone(),
                id,
            }
        };

        if leaf.storage().is_loose() {
            let cur = self.loose.load_full();
            if let Ok(idx) = cur.find(leaf.name().as_str()) {
                let entry = cur.at(idx);
                if entry.value == *leaf {
                    let peeled = LooseRef {
                        snapshot: entry.snapshot,
                        value: new_leaf.clone(),
                    };
                    // A losing CAS means someone replaced the entry; their
                    // value is at least as fresh as ours.
                    let _ = self.cas_loose(&cur, cur.set(idx, peeled));
                }
            }
        }

        Ok(recreate(r, new_leaf))
    }

    /// Construct an update handle for `name`. With `detach`, a symbolic ref
    /// is replaced by a direct ref at commit instead of writing through to
    /// its leaf.
    pub fn new_update(&self, name: &str, detach: bool) -> Result<RefUpdate<'_>, RefError> {
        let ref_name = RefName::new(name)?;
        let packed = self.get_packed_refs()?;
        let reference = match self.read_one(name, &packed)? {
            Some(r) => self.resolve(&r, 0, None, &packed)?,
            None => None,
        };
        let reference = match reference {
            None => Ref::Unpeeled {
                storage: Storage::New,
                name: ref_name,
                id: None,
            },
            Some(r) if detach && r.is_symbolic() => Ref::Unpeeled {
                storage: Storage::Loose,
                name: ref_name,
                id: r.object_id(),
            },
            Some(r) => r,
        };
        self.fire_refs_changed();
        Ok(RefUpdate::new(self, reference))
    }

    /// Construct a rename of `from` onto `to`.
    pub fn new_rename(&self, from: &str, to: &str) -> Result<RefRename<'_>, RefError> {
        Ok(RefRename::new(self, RefName::new(from)?, RefName::new(to)?))
    }

    /// Move the named loose refs into `packed-refs` and delete their loose
    /// files. Each ref is peeled through `objects` first, since the packed
    /// format records peel state. Symbolic refs cannot be packed.
    pub fn pack_refs(&self, objects: &dyn ObjectPeeler, names: &[&str]) -> Result<(), RefError> {
        let old_packed = self.get_packed_refs()?;
        let lock = LockFile::acquire(&self.packed_refs_path)?;
        // Re-read under the lock; the cached copy may trail an external edit.
        let mut list = packed::read_packed_refs(&self.packed_refs_path)?.list;

        let mut moved: Vec<RefName> = Vec::new();
        for &name in names {
            let ref_name = RefName::new(name)?;
            let entry = match loose::scan_ref(&self.git_dir, None, &ref_name)? {
                Scanned::Changed(entry) | Scanned::Refreshed(entry) => entry,
                _ => continue, // not loose; nothing to move
            };
            if entry.value.is_symbolic() {
                return Err(RefError::PackedRefs(format!(
                    "cannot pack symbolic ref {name}"
                )));
            }
            let Some(id) = entry.value.object_id() else {
                continue;
            };
            let packed_ref = match self.peel(objects, &entry.value)? {
                Ref::PeeledTag { id, peeled, .. } => Ref::PeeledTag {
                    storage: Storage::Packed,
                    name: ref_name.clone(),
                    id,
                    peeled,
                },
                _ => Ref::PeeledNonTag {
                    storage: Storage::Packed,
                    name: ref_name.clone(),
                    id,
                },
            };
            list = list.put(packed_ref);
            moved.push(ref_name);
        }

        if moved.is_empty() {
            return lock.rollback().map_err(RefError::from);
        }
        self.commit_packed_refs(lock, list, &old_packed)?;

        for name in &moved {
            self.uncache_loose(name.as_str());
            let path = loose::loose_path(&self.git_dir, name.as_str());
            loose::delete_with_prune(&path, name.levels().saturating_sub(2))?;
        }
        debug!(count = moved.len(), "packed loose refs");
        self.bump_mod_count();
        self.fire_refs_changed();
        Ok(())
    }

    // ---- internals ----------------------------------------------------

    /// Return the cached packed list if its snapshot is still current,
    /// re-parsing and installing otherwise. Counts as an observed change
    /// only when the content actually differs.
    pub(crate) fn get_packed_refs(&self) -> Result<Arc<PackedRefList>, RefError> {
        let cur = self.packed.load_full();
        if !cur.snapshot.is_modified(&self.packed_refs_path) {
            return Ok(cur);
        }
        let fresh = Arc::new(packed::read_packed_refs(&self.packed_refs_path)?);
        let prev = self.packed.compare_and_swap(&cur, fresh.clone());
        if Arc::ptr_eq(&*prev, &cur) && cur.list != fresh.list {
            debug!(
                refs = fresh.list.len(),
                "packed-refs changed on disk, cache replaced"
            );
            self.mod_count.fetch_add(1, Ordering::SeqCst);
        }
        Ok(fresh)
    }

    /// Read one ref by exact name: loose cache first (revalidated against
    /// disk, repaired by CAS), packed list as fallback. Pseudo-refs are
    /// served without entering the cache.
    pub(crate) fn read_one(
        &self,
        name: &str,
        packed: &PackedRefList,
    ) -> Result<Option<Ref>, RefError> {
        if name::validate(name.as_bytes()).is_err() {
            return Ok(None);
        }
        let ref_name = RefName::new_unchecked(name);
        let cur = self.loose.load_full();
        match cur.find(name) {
            Ok(idx) => {
                let cached = cur.at(idx).clone();
                match loose::scan_ref(&self.git_dir, Some(&cached), &ref_name)? {
                    Scanned::Unmodified => Ok(Some(cached.value)),
                    Scanned::Refreshed(entry) => {
                        let value = entry.value.clone();
                        let _ = self.cas_loose(&cur, cur.set(idx, entry));
                        Ok(Some(value))
                    }
                    Scanned::Changed(entry) => {
                        let value = entry.value.clone();
                        if self.cas_loose(&cur, cur.set(idx, entry)) {
                            self.mod_count.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(Some(value))
                    }
                    Scanned::Missing => {
                        if self.cas_loose(&cur, cur.remove(idx)) {
                            self.mod_count.fetch_add(1, Ordering::SeqCst);
                        }
                        Ok(packed.list.get(name).cloned())
                    }
                }
            }
            Err(idx) => match loose::scan_ref(&self.git_dir, None, &ref_name)? {
                Scanned::Changed(entry) | Scanned::Refreshed(entry) => {
                    let value = entry.value.clone();
                    if ADDITIONAL_REF_NAMES.contains(&name) {
                        return Ok(Some(value));
                    }
                    if self.cas_loose(&cur, cur.add(idx, entry)) {
                        self.mod_count.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(Some(value))
                }
                _ => Ok(packed.list.get(name).cloned()),
            },
        }
    }

    /// Follow a symbolic chain, bounded at [`MAX_SYMBOLIC_DEPTH`].
    ///
    /// With a `scan` view, targets inside the scanned prefix resolve against
    /// that already-consistent snapshot; otherwise each hop re-reads disk.
    /// Over-deep chains yield `None`; an unresolvable target returns the
    /// ref unchanged.
    pub(crate) fn resolve(
        &self,
        r: &Ref,
        depth: usize,
        scan: Option<(&str, &RefList<LooseRef>)>,
        packed: &PackedRefList,
    ) -> Result<Option<Ref>, RefError> {
        let Ref::Symbolic {
            storage,
            name,
            target,
        } = r
        else {
            return Ok(Some(r.clone()));
        };
        if depth >= MAX_SYMBOLIC_DEPTH {
            debug!(name = %name, "symbolic ref chain too deep");
            return Ok(None);
        }

        let target_name = target.name().as_str();
        let dst = match scan {
            Some((prefix, loose_list)) if target_name.starts_with(prefix) => {
                if let Some(entry) = loose_list.get(target_name) {
                    entry.value.clone()
                } else if let Some(p) = packed.list.get(target_name) {
                    p.clone()
                } else {
                    return Ok(Some(r.clone()));
                }
            }
            _ => match self.read_one(target_name, packed)? {
                Some(dst) => dst,
                None => return Ok(Some(r.clone())),
            },
        };

        match self.resolve(&dst, depth + 1, scan, packed)? {
            Some(resolved) => Ok(Some(Ref::Symbolic {
                storage: *storage,
                name: name.clone(),
                target: Box::new(resolved),
            })),
            None => Ok(None),
        }
    }

    /// Serialize `refs` into the lock file and commit it, installing the
    /// result (with its commit snapshot) into the packed cache. A losing
    /// CAS is ignored.
    pub(crate) fn commit_packed_refs(
        &self,
        mut lock: LockFile,
        refs: RefList<Ref>,
        old: &Arc<PackedRefList>,
    ) -> Result<(), RefError> {
        use std::io::Write as _;

        lock.set_fsync(true);
        lock.set_need_snapshot(true);
        let mut content = Vec::new();
        packed::write_packed_refs(&refs, &mut content)?;
        lock.write_all(&content)
            .map_err(|source| RefError::WriteFailed {
                path: self.packed_refs_path.clone(),
                source,
            })?;
        lock.wait_for_stat_change()?;
        let snapshot = lock.commit()?.unwrap_or_else(FileSnapshot::missing);
        debug!(refs = refs.len(), "packed-refs committed");

        let fresh = Arc::new(PackedRefList {
            list: refs,
            snapshot,
        });
        let _ = self.packed.compare_and_swap(old, fresh);
        Ok(())
    }

    /// Rewrite `packed-refs` without `name`, under the packed lock. The
    /// file is re-read under the lock so a concurrent external edit is not
    /// lost.
    pub(crate) fn remove_packed_ref(&self, name: &str) -> Result<(), RefError> {
        let old = self.get_packed_refs()?;
        if !old.list.contains(name) {
            return Ok(());
        }
        let lock = LockFile::acquire(&self.packed_refs_path)?;
        let fresh = packed::read_packed_refs(&self.packed_refs_path)?;
        match fresh.list.find(name) {
            Ok(idx) => self.commit_packed_refs(lock, fresh.list.remove(idx), &old),
            Err(_) => lock.rollback().map_err(RefError::from),
        }
    }

    /// Install a just-written loose ref into the cache (retrying the CAS;
    /// a store must not be lost) and notify. Pseudo-refs stay uncached.
    pub(crate) fn put_loose(&self, entry: LooseRef) {
        if !ADDITIONAL_REF_NAMES.contains(&entry.value.name().as_str()) {
            loop {
                let cur = self.loose.load_full();
                let next = cur.put(entry.clone());
                if self.cas_loose(&cur, next) {
                    break;
                }
            }
        }
        self.mod_count.fetch_add(1, Ordering::SeqCst);
        self.fire_refs_changed();
    }

    /// Remove `name` from the loose cache. Callers account for the change
    /// themselves.
    pub(crate) fn uncache_loose(&self, name: &str) {
        loop {
            let cur = self.loose.load_full();
            let Ok(idx) = cur.find(name) else { return };
            if self.cas_loose(&cur, cur.remove(idx)) {
                return;
            }
        }
    }

    pub(crate) fn bump_mod_count(&self) {
        self.mod_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Notify listeners if the modification counter advanced past the last
    /// notified value. The CAS guarantees one notification per transition;
    /// the initial `0 → n` transition of a fresh database is suppressed.
    pub(crate) fn fire_refs_changed(&self) {
        let last = self.last_notified.load(Ordering::SeqCst);
        let curr = self.mod_count.load(Ordering::SeqCst);
        if last != curr
            && self
                .last_notified
                .compare_exchange(last, curr, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            && last != 0
        {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            for listener in listeners.iter() {
                listener();
            }
        }
    }

    fn cas_loose(&self, old: &Arc<RefList<LooseRef>>, next: RefList<LooseRef>) -> bool {
        let prev = self.loose.compare_and_swap(old, Arc::new(next));
        Arc::ptr_eq(&*prev, old)
    }
}

impl RefReader for RefDatabase {
    fn read_ref(&self, name: &str) -> Result<Option<Ref>, RefError> {
        self.get_ref(name)
    }

    fn read_refs(&self, prefix: &str) -> Result<BTreeMap<String, Ref>, RefError> {
        self.get_refs(prefix)
    }
}

/// Rebuild a (possibly symbolic) ref around a freshly peeled leaf.
fn recreate(r: &Ref, leaf: Ref) -> Ref {
    match r {
        Ref::Symbolic {
            storage,
            name,
            target,
        } => Ref::Symbolic {
            storage: *storage,
            name: name.clone(),
            target: Box::new(recreate(target, leaf)),
        },
        _ => leaf,
    }
}
