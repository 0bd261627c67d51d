use std::fs;
use std::io::Write;

use gitref_hash::ObjectId;
use gitref_utils::{FileSnapshot, LockFile};
use tracing::debug;

use crate::error::RefError;
use crate::files::loose::{self, LooseRef};
use crate::files::RefDatabase;
use crate::name::RefName;
use crate::{Ref, Storage};

/// Outcome of a ref update, delete, link or rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    /// The ref did not exist and was created.
    New,
    /// The ref already had the requested value.
    NoChange,
    /// An existing ref was overwritten.
    Forced,
    /// The ref was removed.
    Deleted,
    /// The ref was moved to a new name.
    Renamed,
    /// The `.lock` could not be acquired, or the value on disk no longer
    /// matched the expected old value.
    LockFailure,
    /// The update is not permitted (name conflict, or an overwrite that was
    /// neither forced nor guarded by an expected old value).
    Rejected,
    /// Deleting the branch `HEAD` currently points at is not permitted.
    RejectedCurrentBranch,
}

/// A single-ref update handle obtained from
/// [`RefDatabase::new_update`](crate::RefDatabase::new_update).
///
/// The commit protocol: take the `.lock`, re-read the current value under
/// it, write the new content, wait out coarse mtimes, rename into place,
/// install the result into the loose cache by compare-and-set, then log.
pub struct RefUpdate<'db> {
    db: &'db RefDatabase,
    /// The ref as read when the handle was created (leaf resolved), or a
    /// `Storage::New` placeholder.
    reference: Ref,
    new_id: Option<ObjectId>,
    /// `Some(None)` requires the ref to be absent; `Some(Some(id))`
    /// requires it to currently equal `id`.
    expected_old: Option<Option<ObjectId>>,
    force: bool,
    reflog_message: Option<String>,
}

impl<'db> RefUpdate<'db> {
    pub(crate) fn new(db: &'db RefDatabase, reference: Ref) -> Self {
        Self {
            db,
            reference,
            new_id: None,
            expected_old: None,
            force: false,
            reflog_message: None,
        }
    }

    /// The name this handle was created for.
    pub fn name(&self) -> &RefName {
        self.reference.name()
    }

    /// The name actually written: the leaf for symbolic refs (unless the
    /// handle was created detaching), the ref itself otherwise.
    pub fn destination(&self) -> &RefName {
        self.reference.leaf().name()
    }

    /// The value observed when the handle was created.
    pub fn old_id(&self) -> Option<ObjectId> {
        self.reference.object_id()
    }

    pub fn set_new_id(&mut self, id: ObjectId) -> &mut Self {
        self.new_id = Some(id);
        self
    }

    /// Require the ref to hold `expected` (or, with `None`, to not exist)
    /// at commit time.
    pub fn set_expected_old_id(&mut self, expected: Option<ObjectId>) -> &mut Self {
        self.expected_old = Some(expected);
        self
    }

    pub fn set_force(&mut self, force: bool) -> &mut Self {
        self.force = force;
        self
    }

    pub fn set_reflog_message(&mut self, message: impl Into<String>) -> &mut Self {
        self.reflog_message = Some(message.into());
        self
    }

    /// Write the new object id.
    ///
    /// # Panics
    ///
    /// Panics if [`set_new_id`](Self::set_new_id) has not been called; that
    /// is a programming error, not an I/O condition.
    pub fn update(&mut self) -> Result<UpdateResult, RefError> {
        let new_id = self.new_id.expect("set_new_id must be called before update");
        let name = self.destination().clone();

        if self.reference.storage() == Storage::New
            && self.db.is_name_conflicting(name.as_str())?
        {
            return Ok(UpdateResult::Rejected);
        }

        let path = loose::loose_path(self.db.git_dir(), name.as_str());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| RefError::IoPath {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let Some(mut lock) = LockFile::try_acquire(&path)? else {
            return Ok(UpdateResult::LockFailure);
        };

        // What is on disk now that we hold the lock.
        let packed = self.db.get_packed_refs()?;
        let cur_id = match self.db.read_one(name.as_str(), &packed)? {
            Some(r) => match self.db.resolve(&r, 0, None, &packed)? {
                Some(resolved) => resolved.object_id(),
                None => None,
            },
            None => None,
        };

        if let Some(expected) = self.expected_old {
            if expected != cur_id {
                return Ok(UpdateResult::LockFailure);
            }
        }
        if cur_id == Some(new_id) {
            return Ok(UpdateResult::NoChange);
        }
        if cur_id.is_some() && !self.force && self.expected_old.is_none() {
            // Overwriting without either a guard or force is refused; there
            // is no object graph here to prove a fast-forward.
            return Ok(UpdateResult::Rejected);
        }

        lock.set_need_snapshot(true);
        lock.write_all(format!("{}\n", new_id.to_hex()).as_bytes())
            .map_err(|source| RefError::WriteFailed {
                path: path.clone(),
                source,
            })?;
        lock.wait_for_stat_change()?;
        let snapshot = lock.commit()?.unwrap_or_else(FileSnapshot::missing);

        self.db.put_loose(LooseRef {
            snapshot,
            value: Ref::Unpeeled {
                storage: Storage::Loose,
                name: name.clone(),
                id: Some(new_id),
            },
        });
        debug!(name = %name, id = %new_id, "ref updated");

        self.log(&name, cur_id.unwrap_or(ObjectId::ZERO), new_id)?;
        Ok(if cur_id.is_none() {
            UpdateResult::New
        } else {
            UpdateResult::Forced
        })
    }

    /// Remove the ref: from `packed-refs` under its lock if packed, from
    /// the loose cache, then the loose file itself, pruning now-empty
    /// parent directories and the reflog.
    pub fn delete(&mut self) -> Result<UpdateResult, RefError> {
        let name = self.destination().clone();

        // Deleting the current branch out from under HEAD is refused.
        if name.is_branch() {
            if let Some(head) = self.db.exact_ref("HEAD")? {
                let mut cursor = &head;
                while let Some(target) = cursor.target() {
                    if target.name() == &name {
                        return Ok(UpdateResult::RejectedCurrentBranch);
                    }
                    cursor = target;
                }
            }
        }

        let path = loose::loose_path(self.db.git_dir(), name.as_str());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| RefError::IoPath {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let Some(lock) = LockFile::try_acquire(&path)? else {
            return Ok(UpdateResult::LockFailure);
        };

        let packed = self.db.get_packed_refs()?;
        let cur_id = match self.db.read_one(name.as_str(), &packed)? {
            Some(r) => match self.db.resolve(&r, 0, None, &packed)? {
                Some(resolved) => resolved.object_id(),
                None => None,
            },
            None => None,
        };
        if let Some(expected) = self.expected_old {
            if expected != cur_id {
                return Ok(UpdateResult::LockFailure);
            }
        }

        let had_loose = path.is_file();

        self.db.remove_packed_ref(name.as_str())?;
        self.db.uncache_loose(name.as_str());

        // Release our lock before removing the file it guards.
        lock.rollback()?;
        if had_loose {
            loose::delete_with_prune(&path, name.levels().saturating_sub(2))?;
        }
        self.db.reflog().delete(name.as_str())?;

        self.db.bump_mod_count();
        self.db.fire_refs_changed();
        debug!(name = %name, "ref deleted");
        Ok(UpdateResult::Deleted)
    }

    /// Store a symbolic ref: `name` will point at `target` by name. Used
    /// for `HEAD` retargeting; never dereferences.
    pub fn link(&mut self, target: &str) -> Result<UpdateResult, RefError> {
        let target_name = RefName::new(target)?;
        let name = self.reference.name().clone();

        let path = loose::loose_path(self.db.git_dir(), name.as_str());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| RefError::IoPath {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let Some(mut lock) = LockFile::try_acquire(&path)? else {
            return Ok(UpdateResult::LockFailure);
        };

        lock.set_need_snapshot(true);
        lock.write_all(format!("ref: {target_name}\n").as_bytes())
            .map_err(|source| RefError::WriteFailed {
                path: path.clone(),
                source,
            })?;
        lock.wait_for_stat_change()?;
        let snapshot = lock.commit()?.unwrap_or_else(FileSnapshot::missing);

        let value = Ref::Symbolic {
            storage: Storage::Loose,
            name: name.clone(),
            target: Box::new(Ref::Unpeeled {
                storage: Storage::New,
                name: target_name.clone(),
                id: None,
            }),
        };
        self.db.put_loose(LooseRef {
            snapshot,
            value,
        });
        debug!(name = %name, target = %target_name, "symbolic ref stored");

        if self.reflog_message.is_some() {
            let new_id = self
                .db
                .exact_ref(target_name.as_str())?
                .and_then(|r| r.object_id())
                .unwrap_or(ObjectId::ZERO);
            let old_id = self.old_id().unwrap_or(ObjectId::ZERO);
            self.log_one(name.as_str(), old_id, new_id)?;
        }

        Ok(if self.reference.storage() == Storage::New {
            UpdateResult::New
        } else {
            UpdateResult::Forced
        })
    }

    /// Append reflog entries for a committed update: the leaf, and the
    /// symbolic ref it was reached through, if any.
    fn log(&self, leaf: &RefName, old_id: ObjectId, new_id: ObjectId) -> Result<(), RefError> {
        if self.reference.is_symbolic() {
            self.log_one(self.reference.name().as_str(), old_id, new_id)?;
        }
        self.log_one(leaf.as_str(), old_id, new_id)
    }

    fn log_one(&self, name: &str, old_id: ObjectId, new_id: ObjectId) -> Result<(), RefError> {
        let (Some(ident), Some(message)) = (self.db.committer(), &self.reflog_message) else {
            return Ok(());
        };
        self.db.reflog().log(name, old_id, new_id, ident, message)
    }
}
