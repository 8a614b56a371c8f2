//! File system storage management
//!
//! Path jail, per-path locks, and the filesystem gateway built on them.

pub mod filesystem;
pub mod flags;
pub mod jail;
pub mod locks;

pub use filesystem::{DirHandle, FileHandle, FileStat, Filesystem};
pub use flags::OpenFlags;
pub use locks::{PathLockGuard, PathLockTable};
