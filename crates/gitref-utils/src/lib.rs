//! Shared plumbing for the gitref reference database.
//!
//! Provides the filesystem lock-file protocol, cheap file-change snapshots,
//! and the identity types reflog entries are written with.

pub mod date;
pub mod error;
pub mod fsnapshot;
pub mod lockfile;

pub use error::{LockError, UtilError};
pub use fsnapshot::FileSnapshot;
pub use lockfile::LockFile;

pub type Result<T> = std::result::Result<T, UtilError>;
