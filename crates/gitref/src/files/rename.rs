use std::fs;

use tracing::debug;

use crate::error::RefError;
use crate::files::update::UpdateResult;
use crate::files::RefDatabase;
use crate::name::RefName;

/// A rename of one reference onto a new name, obtained from
/// [`RefDatabase::new_rename`](crate::RefDatabase::new_rename).
///
/// The move is delete-then-create under the usual per-ref locks, carrying
/// the reflog across and retargeting a `HEAD` that pointed at the source.
/// If the create fails after the delete, the source is restored.
pub struct RefRename<'db> {
    db: &'db RefDatabase,
    from: RefName,
    to: RefName,
    message: String,
}

impl<'db> RefRename<'db> {
    pub(crate) fn new(db: &'db RefDatabase, from: RefName, to: RefName) -> Self {
        let message = format!("Branch: renamed {from} to {to}");
        Self {
            db,
            from,
            to,
            message,
        }
    }

    pub fn source(&self) -> &RefName {
        &self.from
    }

    pub fn destination(&self) -> &RefName {
        &self.to
    }

    /// Override the reflog message recorded for the rename.
    pub fn set_reflog_message(&mut self, message: impl Into<String>) -> &mut Self {
        self.message = message.into();
        self
    }

    pub fn rename(&mut self) -> Result<UpdateResult, RefError> {
        let from = self.from.clone();
        let to = self.to.clone();

        let Some(source) = self.db.exact_ref(from.as_str())? else {
            return Ok(UpdateResult::Rejected);
        };
        let Some(id) = source.object_id() else {
            return Ok(UpdateResult::Rejected);
        };
        if self.destination_conflicts()? {
            return Ok(UpdateResult::Rejected);
        }

        let head_points_at_source = match self.db.exact_ref("HEAD")? {
            Some(head) => {
                let mut cursor = &head;
                let mut hit = false;
                while let Some(target) = cursor.target() {
                    if target.name() == &from {
                        hit = true;
                        break;
                    }
                    cursor = target;
                }
                hit
            }
            None => false,
        };

        // Keep the source's reflog; delete() below removes the file.
        let old_log = fs::read(self.db.reflog().log_for(from.as_str())).ok();

        // Point HEAD at the destination first so deleting the source is not
        // rejected as the current branch.
        if head_points_at_source {
            let mut head = self.db.new_update("HEAD", true)?;
            head.set_reflog_message(self.message.clone());
            match head.link(to.as_str())? {
                UpdateResult::New | UpdateResult::Forced => {}
                other => return Ok(other),
            }
        }

        let mut delete = self.db.new_update(from.as_str(), true)?;
        delete.set_expected_old_id(Some(id));
        match delete.delete()? {
            UpdateResult::Deleted => {}
            other => {
                if head_points_at_source {
                    self.relink_head(&from)?;
                }
                return Ok(other);
            }
        }

        // Seed the destination's reflog with the carried-over history before
        // the create appends its own entry.
        if let Some(content) = &old_log {
            let log_path = self.db.reflog().log_for(to.as_str());
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent).map_err(|source| RefError::IoPath {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
            fs::write(&log_path, content).map_err(|source| RefError::WriteFailed {
                path: log_path.clone(),
                source,
            })?;
        }

        let mut create = self.db.new_update(to.as_str(), false)?;
        create
            .set_new_id(id)
            .set_force(true)
            .set_reflog_message(self.message.clone());
        match create.update()? {
            UpdateResult::New | UpdateResult::Forced | UpdateResult::NoChange => {}
            other => {
                // Put the source back; the rename did not happen.
                let mut restore = self.db.new_update(from.as_str(), true)?;
                restore.set_new_id(id).set_force(true);
                restore.update()?;
                if let Some(content) = &old_log {
                    let log_path = self.db.reflog().log_for(from.as_str());
                    if let Some(parent) = log_path.parent() {
                        let _ = fs::create_dir_all(parent);
                    }
                    let _ = fs::write(log_path, content);
                }
                if head_points_at_source {
                    self.relink_head(&from)?;
                }
                return Ok(other);
            }
        }

        debug!(from = %from, to = %to, "ref renamed");
        Ok(UpdateResult::Renamed)
    }

    /// Whether `to` nests under or contains a ref other than the source
    /// (which is about to go away).
    fn destination_conflicts(&self) -> Result<bool, RefError> {
        let to = self.to.as_str();
        let from = self.from.as_str();
        let packed = self.db.get_packed_refs()?;

        let mut end = to.len();
        while let Some(pos) = to[..end].rfind('/') {
            let needle = &to[..pos];
            if needle != from && self.db.read_one(needle, &packed)?.is_some() {
                return Ok(true);
            }
            end = pos;
        }

        let prefix = format!("{to}/");
        for name in self.db.get_refs(&prefix)?.keys() {
            if name != from {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn relink_head(&self, target: &RefName) -> Result<(), RefError> {
        let mut head = self.db.new_update("HEAD", true)?;
        head.link(target.as_str())?;
        Ok(())
    }
}
