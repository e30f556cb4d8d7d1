//! Filesystem-level types: inode identities, the name cache, and the VFS façade.

/// Directory entry cache mapping `(parent, name)` to an inode identity.
pub mod dcache;
/// In-memory filesystem used by the harness and tests.
pub mod memfs;
/// Path resolution and file handles on top of the two caches.
pub mod vfs;

pub use dcache::{DCache, NameLookup};
pub use vfs::{Filesystem, OpenFile, Vfs};

use std::fmt;

/// Type representing an inode number within one filesystem.
pub type InodeAddr = u64;

/// Type representing a file handle.
pub type FileHandle = u64;

/// Identifies one mounted filesystem instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FsId(pub u32);

impl fmt::Display for FsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fs{}", self.0)
    }
}

/// The unique key of a backing-store object: the filesystem it lives on plus its inode number.
///
/// Equality and hashing are structural. An identity never changes once assigned to an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identity {
    /// The filesystem this inode belongs to.
    pub fs: FsId,
    /// The inode number within `fs`.
    pub addr: InodeAddr,
}

impl Identity {
    /// Build an identity from its parts.
    #[must_use]
    pub const fn new(fs: FsId, addr: InodeAddr) -> Self {
        Self { fs, addr }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.fs, self.addr)
    }
}

/// The type of an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum InodeKind {
    /// A regular file.
    File,
    /// A directory.
    Directory,
}
