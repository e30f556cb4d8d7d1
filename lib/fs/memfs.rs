//! An in-memory filesystem.
//!
//! Directory entries live in the filesystem itself and are consulted on every lookup; inode
//! payloads carry only the kind and the file contents. Unlinked inodes are reclaimed when the
//! cache destroys them, and dirty file contents are written back at the same point.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::io;

use rustc_hash::FxHashMap;
use tracing::trace;

use crate::cache::{BackingStore, Destroyed, Loaded};
use crate::fs::vfs::Filesystem;
use crate::fs::{FsId, Identity, InodeAddr, InodeKind};
use crate::sync::{Mutex, lock};

/// Inode number of the root directory.
pub const ROOT_ADDR: InodeAddr = 1;

/// The body of a loaded [`MemFs`] inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemNode {
    /// File or directory.
    pub kind: InodeKind,
    /// File contents. Empty for directories.
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct StoredNode {
    kind: InodeKind,
    link_count: u32,
    data: Vec<u8>,
    /// Only populated for directories.
    entries: BTreeMap<OsString, InodeAddr>,
}

impl StoredNode {
    fn new(kind: InodeKind, data: Vec<u8>) -> Self {
        Self {
            kind,
            link_count: 1,
            data,
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
struct MemState {
    nodes: FxHashMap<InodeAddr, StoredNode>,
    next_addr: InodeAddr,
    loads: FxHashMap<InodeAddr, usize>,
    destroyed: Vec<Destroyed<MemNode>>,
}

/// A filesystem held entirely in memory, identified by a single [`FsId`].
#[derive(Debug)]
pub struct MemFs {
    fs: FsId,
    state: Mutex<MemState>,
}

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

impl MemFs {
    /// Create a filesystem containing only an empty root directory at [`ROOT_ADDR`].
    #[must_use]
    pub fn new(fs: FsId) -> Self {
        let mut nodes = FxHashMap::default();
        nodes.insert(ROOT_ADDR, StoredNode::new(InodeKind::Directory, Vec::new()));
        Self {
            fs,
            state: Mutex::new(MemState {
                nodes,
                next_addr: ROOT_ADDR + 1,
                loads: FxHashMap::default(),
                destroyed: Vec::new(),
            }),
        }
    }

    /// Identity of the root directory.
    #[must_use]
    pub fn root(&self) -> Identity {
        Identity::new(self.fs, ROOT_ADDR)
    }

    /// Identity of the inode numbered `addr` on this filesystem.
    #[must_use]
    pub fn identity(&self, addr: InodeAddr) -> Identity {
        Identity::new(self.fs, addr)
    }

    fn add(&self, parent: InodeAddr, name: &OsStr, node: StoredNode) -> io::Result<InodeAddr> {
        let mut state = lock(&self.state);
        let addr = state.next_addr;
        let dir = state.nodes.get_mut(&parent).ok_or_else(|| errno(libc::ENOENT))?;
        if dir.kind != InodeKind::Directory {
            return Err(errno(libc::ENOTDIR));
        }
        if dir.entries.contains_key(name) {
            return Err(errno(libc::EEXIST));
        }
        dir.entries.insert(name.to_os_string(), addr);
        state.nodes.insert(addr, node);
        state.next_addr += 1;
        Ok(addr)
    }

    /// Create an empty directory `name` in the directory `parent`.
    ///
    /// # Errors
    ///
    /// `ENOENT` if `parent` does not exist, `ENOTDIR` if it is not a directory, `EEXIST` if the
    /// name is taken.
    pub fn mkdir(&self, parent: InodeAddr, name: impl AsRef<OsStr>) -> io::Result<InodeAddr> {
        self.add(
            parent,
            name.as_ref(),
            StoredNode::new(InodeKind::Directory, Vec::new()),
        )
    }

    /// Create a regular file `name` in `parent` holding `data`.
    ///
    /// # Errors
    ///
    /// As for [`MemFs::mkdir`].
    pub fn create(
        &self,
        parent: InodeAddr,
        name: impl AsRef<OsStr>,
        data: &[u8],
    ) -> io::Result<InodeAddr> {
        self.add(
            parent,
            name.as_ref(),
            StoredNode::new(InodeKind::File, data.to_vec()),
        )
    }

    /// Create a directory that no name refers to, to serve as the root of a mount.
    #[must_use]
    pub fn detached_dir(&self) -> Identity {
        let mut state = lock(&self.state);
        let addr = state.next_addr;
        state
            .nodes
            .insert(addr, StoredNode::new(InodeKind::Directory, Vec::new()));
        state.next_addr += 1;
        Identity::new(self.fs, addr)
    }

    /// Whether the inode still has storage.
    #[must_use]
    pub fn exists(&self, addr: InodeAddr) -> bool {
        lock(&self.state).nodes.contains_key(&addr)
    }

    /// The stored contents of a file, as last written back.
    #[must_use]
    pub fn contents(&self, addr: InodeAddr) -> Option<Vec<u8>> {
        lock(&self.state).nodes.get(&addr).map(|n| n.data.clone())
    }

    /// How many times `addr` was loaded.
    #[must_use]
    pub fn loads(&self, addr: InodeAddr) -> usize {
        lock(&self.state).loads.get(&addr).copied().unwrap_or(0)
    }

    /// Total loads across all inodes.
    #[must_use]
    pub fn total_loads(&self) -> usize {
        lock(&self.state).loads.values().sum()
    }

    /// Every destroy notification received so far, in order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<Destroyed<MemNode>> {
        lock(&self.state).destroyed.clone()
    }

    /// How many times `addr` was destroyed.
    #[must_use]
    pub fn destroys(&self, addr: InodeAddr) -> usize {
        lock(&self.state)
            .destroyed
            .iter()
            .filter(|d| d.identity.addr == addr)
            .count()
    }
}

impl BackingStore for MemFs {
    type Payload = MemNode;

    fn load(&self, identity: Identity) -> Result<Loaded<MemNode>, io::Error> {
        if identity.fs != self.fs {
            return Err(errno(libc::ENOENT));
        }
        let mut state = lock(&self.state);
        *state.loads.entry(identity.addr).or_default() += 1;
        let node = state
            .nodes
            .get(&identity.addr)
            .ok_or_else(|| errno(libc::ENOENT))?;
        trace!(%identity, kind = ?node.kind, "loading inode");
        Ok(Loaded::new(MemNode {
            kind: node.kind,
            data: node.data.clone(),
        })
        .with_link_count(node.link_count))
    }

    fn destroy(&self, destroyed: Destroyed<MemNode>) {
        let mut state = lock(&self.state);
        let addr = destroyed.identity.addr;
        if destroyed.link_count == 0 {
            trace!(identity = %destroyed.identity, "reclaiming unlinked inode");
            state.nodes.remove(&addr);
        } else if destroyed.dirty
            && let Some(node) = state.nodes.get_mut(&addr)
        {
            node.data.clone_from(&destroyed.payload.data);
        }
        state.destroyed.push(destroyed);
    }
}

impl Filesystem for MemFs {
    fn lookup(&self, dir: Identity, name: &OsStr) -> io::Result<Option<InodeAddr>> {
        let state = lock(&self.state);
        let node = state
            .nodes
            .get(&dir.addr)
            .ok_or_else(|| errno(libc::ENOENT))?;
        if node.kind != InodeKind::Directory {
            return Err(errno(libc::ENOTDIR));
        }
        Ok(node.entries.get(name).copied())
    }

    fn kind(&self, payload: &MemNode) -> InodeKind {
        payload.kind
    }

    fn unlink(&self, dir: Identity, name: &OsStr) -> io::Result<()> {
        let mut state = lock(&self.state);
        let target = state
            .nodes
            .get(&dir.addr)
            .and_then(|n| n.entries.get(name).copied())
            .ok_or_else(|| errno(libc::ENOENT))?;
        let node = state
            .nodes
            .get_mut(&target)
            .ok_or_else(|| errno(libc::ENOENT))?;
        if !node.entries.is_empty() {
            return Err(errno(libc::ENOTEMPTY));
        }
        node.link_count = node.link_count.saturating_sub(1);
        if let Some(parent) = state.nodes.get_mut(&dir.addr) {
            parent.entries.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_entries_are_found_by_lookup() {
        let fs = MemFs::new(FsId(1));
        let dir = fs.mkdir(ROOT_ADDR, "etc").expect("mkdir");
        let file = fs.create(dir, "motd", b"hello").expect("create");

        assert_eq!(
            fs.lookup(fs.root(), OsStr::new("etc")).expect("lookup"),
            Some(dir)
        );
        assert_eq!(
            fs.lookup(fs.root(), OsStr::new("nope")).expect("lookup"),
            None
        );
        assert_eq!(
            fs.lookup(fs.identity(file), OsStr::new("x"))
                .expect_err("not a directory")
                .raw_os_error(),
            Some(libc::ENOTDIR)
        );
        assert_eq!(fs.contents(file).as_deref(), Some(&b"hello"[..]));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let fs = MemFs::new(FsId(1));
        fs.mkdir(ROOT_ADDR, "a").expect("mkdir");
        let err = fs.create(ROOT_ADDR, "a", b"").expect_err("name is taken");
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
    }

    #[test]
    fn foreign_identities_are_not_found() {
        let fs = MemFs::new(FsId(1));
        let err = fs.load(Identity::new(FsId(2), ROOT_ADDR)).expect_err("other fs");
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn destroy_reclaims_unlinked_and_writes_back_dirty() {
        let fs = MemFs::new(FsId(1));
        let a = fs.create(ROOT_ADDR, "a", b"old").expect("create");
        let b = fs.create(ROOT_ADDR, "b", b"keep").expect("create");

        fs.destroy(Destroyed {
            identity: fs.identity(a),
            payload: MemNode {
                kind: InodeKind::File,
                data: b"new".to_vec(),
            },
            link_count: 1,
            dirty: true,
        });
        assert_eq!(fs.contents(a).as_deref(), Some(&b"new"[..]));

        fs.unlink(fs.root(), OsStr::new("b")).expect("unlink");
        fs.destroy(Destroyed {
            identity: fs.identity(b),
            payload: MemNode {
                kind: InodeKind::File,
                data: b"keep".to_vec(),
            },
            link_count: 0,
            dirty: false,
        });
        assert!(!fs.exists(b));
        assert_eq!(fs.destroyed().len(), 2);
    }

    #[test]
    fn non_empty_directories_cannot_be_unlinked() {
        let fs = MemFs::new(FsId(1));
        let dir = fs.mkdir(ROOT_ADDR, "d").expect("mkdir");
        fs.create(dir, "f", b"").expect("create");
        let err = fs
            .unlink(fs.root(), OsStr::new("d"))
            .expect_err("directory is not empty");
        assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));
    }
}
