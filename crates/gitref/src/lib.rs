//! Filesystem-backed reference database for git-compatible repositories.
//!
//! References map human-readable names (`refs/heads/main`, `HEAD`) to object
//! identifiers. This crate persists them the way C git's files backend does:
//! loose files under `refs/` plus the line-oriented `packed-refs` file, unified
//! into one logical namespace in which loose values win.
//!
//! [`RefDatabase`] serves concurrent readers without locks — both caches are
//! immutable snapshots behind atomic cells, refreshed by cheap stat-based
//! change detection and installed by compare-and-set — while writers serialize
//! on per-file `.lock` files committed by atomic rename.

mod error;
pub mod files;
mod list;
mod name;
pub mod reflog;

use std::collections::BTreeMap;

use gitref_hash::ObjectId;

pub use error::RefError;
pub use files::rename::RefRename;
pub use files::update::{RefUpdate, UpdateResult};
pub use files::{RefDatabase, SEARCH_PATH};
pub use list::{RefItem, RefList, RefListBuilder};
pub use name::RefName;
pub use reflog::{ReflogEntry, ReflogWriter};

/// How a reference is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    /// Not yet written to disk.
    New,
    /// A file under `refs/` (or a top-level file like `HEAD`).
    Loose,
    /// A line in `packed-refs`.
    Packed,
    /// Present both loose and packed; the loose value wins for reads.
    LoosePacked,
    /// Advertised by a remote; never on local disk.
    Network,
}

impl Storage {
    /// Whether a loose file can exist for this ref.
    pub fn is_loose(self) -> bool {
        matches!(self, Storage::New | Storage::Loose | Storage::LoosePacked)
    }

    /// Whether a `packed-refs` line can exist for this ref.
    pub fn is_packed(self) -> bool {
        matches!(self, Storage::Packed | Storage::LoosePacked)
    }
}

/// A named, immutable reference value.
///
/// Direct refs carry an object id and a peel state; a symbolic ref carries the
/// reference it points at (possibly a whole resolved chain). Values are
/// snapshots: updates replace them, never edit them in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ref {
    /// Direct ref whose peeled target is unknown. `id` is `None` for an
    /// unborn target (e.g. `HEAD`'s target before the first commit).
    Unpeeled {
        storage: Storage,
        name: RefName,
        id: Option<ObjectId>,
    },
    /// Direct ref to an annotated tag, with the tag's peeled (non-tag) target.
    PeeledTag {
        storage: Storage,
        name: RefName,
        id: ObjectId,
        peeled: ObjectId,
    },
    /// Direct ref known not to point at a tag; its own id is its peel.
    PeeledNonTag {
        storage: Storage,
        name: RefName,
        id: ObjectId,
    },
    /// Symbolic ref pointing at another reference by name.
    Symbolic {
        storage: Storage,
        name: RefName,
        target: Box<Ref>,
    },
}

impl Ref {
    /// The reference's own name.
    pub fn name(&self) -> &RefName {
        match self {
            Ref::Unpeeled { name, .. }
            | Ref::PeeledTag { name, .. }
            | Ref::PeeledNonTag { name, .. }
            | Ref::Symbolic { name, .. } => name,
        }
    }

    /// How this reference is stored.
    pub fn storage(&self) -> Storage {
        match self {
            Ref::Unpeeled { storage, .. }
            | Ref::PeeledTag { storage, .. }
            | Ref::PeeledNonTag { storage, .. }
            | Ref::Symbolic { storage, .. } => *storage,
        }
    }

    pub fn is_symbolic(&self) -> bool {
        matches!(self, Ref::Symbolic { .. })
    }

    /// The immediate target of a symbolic ref.
    pub fn target(&self) -> Option<&Ref> {
        match self {
            Ref::Symbolic { target, .. } => Some(target),
            _ => None,
        }
    }

    /// The terminal direct reference reached by following symbolic targets.
    pub fn leaf(&self) -> &Ref {
        let mut cur = self;
        while let Ref::Symbolic { target, .. } = cur {
            cur = target;
        }
        cur
    }

    /// The leaf's object id, if known.
    pub fn object_id(&self) -> Option<ObjectId> {
        match self.leaf() {
            Ref::Unpeeled { id, .. } => *id,
            Ref::PeeledTag { id, .. } | Ref::PeeledNonTag { id, .. } => Some(*id),
            Ref::Symbolic { .. } => unreachable!("leaf is never symbolic"),
        }
    }

    /// The leaf's peeled object id: the non-tag object a tag chain ends at.
    pub fn peeled_id(&self) -> Option<ObjectId> {
        match self.leaf() {
            Ref::PeeledTag { peeled, .. } => Some(*peeled),
            Ref::PeeledNonTag { id, .. } => Some(*id),
            _ => None,
        }
    }

    /// Whether the leaf's peel state is known.
    pub fn is_peeled(&self) -> bool {
        matches!(
            self.leaf(),
            Ref::PeeledTag { .. } | Ref::PeeledNonTag { .. }
        )
    }
}

impl RefItem for Ref {
    fn name(&self) -> &str {
        Ref::name(self).as_str()
    }
}

/// Access to the object graph, just wide enough for peeling tags.
///
/// The object store is an external collaborator; the database only ever asks
/// one question of it.
pub trait ObjectPeeler {
    /// If `id` names an annotated tag object, return the object it tags;
    /// `None` for any other object kind.
    fn tag_target(&self, id: &ObjectId) -> Result<Option<ObjectId>, RefError>;
}

/// The narrow read surface transport-facing code consumes.
///
/// `ls-remote` style callers list and resolve refs; they are not permitted to
/// mutate the database, and this trait gives them no way to.
pub trait RefReader {
    /// Search for `name` along the standard search path and resolve it.
    fn read_ref(&self, name: &str) -> Result<Option<Ref>, RefError>;

    /// All refs whose names start with `prefix`, symbolic refs resolved to
    /// their leaves, broken symbolic refs omitted.
    fn read_refs(&self, prefix: &str) -> Result<BTreeMap<String, Ref>, RefError>;
}
