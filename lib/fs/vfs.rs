//! Path resolution and open files on top of the inode and name caches.
//!
//! [`Vfs`] owns one [`ICache`] and one [`DCache`], wired so that evicting an inode purges the
//! names bound to it. Every path component is resolved through the name cache first and falls
//! back to the filesystem on a miss, recording both positive and negative results.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Component, Path};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};

use crate::cache::{BackingStore, ICache, InodeRef};
use crate::config::CacheConfig;
use crate::fs::dcache::{DCache, NameLookup};
use crate::fs::{FileHandle, Identity, InodeAddr, InodeKind};
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Mutex, lock};

/// A backing store that also knows how its inodes are named.
pub trait Filesystem: BackingStore {
    /// Find `name` in the directory `dir`.
    ///
    /// Returns `Ok(None)` if the name does not exist. May block on backing I/O; it is never called
    /// with a cache or inode lock held.
    fn lookup(&self, dir: Identity, name: &OsStr) -> io::Result<Option<InodeAddr>>;

    /// The kind of a loaded inode.
    fn kind(&self, payload: &Self::Payload) -> InodeKind;

    /// Remove `name` from the directory `dir`. The target's storage is reclaimed later, when the
    /// cache destroys it with a link count of zero.
    fn unlink(&self, dir: Identity, name: &OsStr) -> io::Result<()>;
}

/// A handle held on an inode for as long as the file stays open.
pub struct OpenFile<F: Filesystem> {
    fh: FileHandle,
    inode: InodeRef<Arc<F>>,
}

impl<F: Filesystem> OpenFile<F> {
    /// The file handle number. Unique for the lifetime of the [`Vfs`].
    #[must_use]
    pub fn fh(&self) -> FileHandle {
        self.fh
    }

    /// The referenced inode.
    #[must_use]
    pub fn inode(&self) -> &InodeRef<Arc<F>> {
        &self.inode
    }

    /// Close the file, releasing its reference.
    pub fn close(self) {
        trace!(fh = self.fh, identity = %self.inode.identity(), "closing file");
    }
}

impl<F: Filesystem> std::fmt::Debug for OpenFile<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("fh", &self.fh)
            .field("identity", &self.inode.identity())
            .finish()
    }
}

type MountKey = (Identity, OsString);

fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Split `path` into its parent directory and final name.
fn split_last(path: &Path) -> io::Result<(&Path, &OsStr)> {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(errno(libc::EINVAL)),
    }
}

/// The VFS.
pub struct Vfs<F: Filesystem> {
    fs: Arc<F>,
    dcache: Arc<DCache>,
    icache: ICache<Arc<F>>,
    /// Pinned for the lifetime of the VFS.
    root: InodeRef<Arc<F>>,
    /// Pinned mount roots, by the name they are mounted over.
    mounts: Mutex<FxHashMap<MountKey, InodeRef<Arc<F>>>>,
    next_fh: AtomicU64,
}

impl<F: Filesystem> Vfs<F> {
    /// Build the caches described by `config` in front of `fs` and pin `root`.
    ///
    /// # Errors
    ///
    /// `InvalidInput` if the configuration does not validate, any error from loading the root,
    /// and `ENOTDIR` if the root is not a directory.
    pub fn new(fs: Arc<F>, config: &CacheConfig, root: Identity) -> io::Result<Self> {
        config
            .validate()
            .map_err(|errors| io::Error::new(io::ErrorKind::InvalidInput, errors.join(" ")))?;

        let dcache = Arc::new(DCache::new(config.dcache.capacity));
        let icache = ICache::new(
            Arc::clone(&fs),
            &config.icache,
            Arc::clone(&dcache) as Arc<dyn crate::cache::Evictable>,
        );
        let root = icache.get_or_load(root)?;
        if root.with_payload(|p| fs.kind(p)) != InodeKind::Directory {
            return Err(errno(libc::ENOTDIR));
        }
        info!(root = %root.identity(), icache = icache.capacity(), dcache = dcache.capacity(), "vfs ready");

        Ok(Self {
            fs,
            dcache,
            icache,
            root,
            mounts: Mutex::new(FxHashMap::default()),
            next_fh: AtomicU64::new(1),
        })
    }

    /// The filesystem behind the caches.
    #[must_use]
    pub fn filesystem(&self) -> &F {
        &self.fs
    }

    /// The inode cache.
    #[must_use]
    pub fn icache(&self) -> &ICache<Arc<F>> {
        &self.icache
    }

    /// The name cache.
    #[must_use]
    pub fn dcache(&self) -> &DCache {
        &self.dcache
    }

    /// Identity of the root directory.
    #[must_use]
    pub fn root(&self) -> Identity {
        self.root.identity()
    }

    fn is_dir(&self, inode: &InodeRef<Arc<F>>) -> bool {
        inode.with_payload(|p| self.fs.kind(p)) == InodeKind::Directory
    }

    fn mounted_at(&self, parent: Identity, name: &OsStr) -> Option<Identity> {
        lock(&self.mounts)
            .get(&(parent, name.to_os_string()))
            .map(InodeRef::identity)
    }

    /// Resolve a single `name` inside the directory `dir`.
    fn resolve_child(&self, dir: &InodeRef<Arc<F>>, name: &OsStr) -> io::Result<InodeRef<Arc<F>>> {
        if !self.is_dir(dir) {
            return Err(errno(libc::ENOTDIR));
        }
        let parent = dir.identity();

        match self.dcache.lookup(parent, name) {
            NameLookup::Hit(target) => return Ok(self.icache.get_or_load(target)?),
            NameLookup::Negative => return Err(errno(libc::ENOENT)),
            NameLookup::Miss => {}
        }

        if let Some(target) = self.mounted_at(parent, name) {
            trace!(%parent, ?name, %target, "restoring mount binding");
            self.dcache.insert(parent, name, Some(target), true);
            return Ok(self.icache.get_or_load(target)?);
        }

        let Some(addr) = self.fs.lookup(parent, name)? else {
            self.dcache.insert(parent, name, None, false);
            return Err(errno(libc::ENOENT));
        };
        let target = Identity::new(parent.fs, addr);
        let child = self.icache.get_or_load(target)?;
        // Bound while the child is referenced, so it cannot be evicted before the name exists.
        self.dcache.insert(parent, name, Some(target), false);
        Ok(child)
    }

    /// Resolve `path` from the root and return a handle to the inode it names.
    ///
    /// Empty and `.` components are ignored and `..` steps back to the previous directory,
    /// stopping at the root.
    ///
    /// # Errors
    ///
    /// `ENOENT` if a component does not exist, `ENOTDIR` if a component other than the last is
    /// not a directory, or any cache error converted to [`io::Error`].
    pub fn lookup(&self, path: impl AsRef<Path>) -> io::Result<InodeRef<Arc<F>>> {
        let path = path.as_ref();
        let mut current = self.root.clone();
        let mut ancestors: Vec<Identity> = Vec::new();

        for component in path.components() {
            match component {
                Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
                Component::ParentDir => {
                    if let Some(parent) = ancestors.pop() {
                        current = self.icache.get_or_load(parent)?;
                    }
                }
                Component::Normal(name) => {
                    let child = self.resolve_child(&current, name)?;
                    ancestors.push(current.identity());
                    current = child;
                }
            }
        }
        trace!(?path, identity = %current.identity(), "resolved path");
        Ok(current)
    }

    /// Resolve `path` and hold a reference on it until the returned file is closed.
    ///
    /// # Errors
    ///
    /// As for [`Vfs::lookup`].
    pub fn open(&self, path: impl AsRef<Path>) -> io::Result<OpenFile<F>> {
        let inode = self.lookup(path)?;
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        trace!(fh, identity = %inode.identity(), "opened file");
        Ok(OpenFile { fh, inode })
    }

    /// Remove the name `path`.
    ///
    /// The inode stays usable through handles that are already open; it is destroyed as soon as
    /// the last of them is dropped.
    ///
    /// # Errors
    ///
    /// `EINVAL` for a path without a final name, `EBUSY` for a mount point, and any lookup or
    /// filesystem error.
    pub fn unlink(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let (dir_path, name) = split_last(path.as_ref())?;
        let dir = self.lookup(dir_path)?;
        let parent = dir.identity();
        if self.mounted_at(parent, name).is_some() {
            return Err(errno(libc::EBUSY));
        }
        let target = self.resolve_child(&dir, name)?;

        self.fs.unlink(parent, name)?;
        self.dcache.unlink(parent, name);
        let remaining = target.unlink();
        debug!(%parent, ?name, identity = %target.identity(), remaining, "unlinked");
        Ok(())
    }

    /// Mount the directory `root` over the existing directory at `path`.
    ///
    /// The mount root stays referenced until [`Vfs::unmount`].
    ///
    /// # Errors
    ///
    /// `EINVAL` for the root path, `ENOTDIR` if either side is not a directory, `EBUSY` if
    /// something is already mounted there, and any lookup or load error.
    pub fn mount(&self, path: impl AsRef<Path>, root: Identity) -> io::Result<()> {
        let path = path.as_ref();
        let (dir_path, name) = split_last(path)?;
        let dir = self.lookup(dir_path)?;
        let point = self.resolve_child(&dir, name)?;
        if !self.is_dir(&point) {
            return Err(errno(libc::ENOTDIR));
        }

        let parent = dir.identity();
        let key = (parent, name.to_os_string());
        if lock(&self.mounts).contains_key(&key) {
            return Err(errno(libc::EBUSY));
        }
        // Loaded before the mount table is locked: the load may wait for a free slot.
        let pinned = self.icache.get_or_load(root)?;
        if !self.is_dir(&pinned) {
            return Err(errno(libc::ENOTDIR));
        }

        let mut mounts = lock(&self.mounts);
        if mounts.contains_key(&key) {
            drop(mounts);
            return Err(errno(libc::EBUSY));
        }
        self.dcache.insert(parent, name, Some(root), true);
        mounts.insert(key, pinned);
        drop(mounts);
        info!(?path, %root, "mounted");
        Ok(())
    }

    /// Detach whatever is mounted at `path` and evict everything no longer referenced.
    ///
    /// Only references to the mount root itself make the mount busy. Files below it that are
    /// still open stay usable through their handles but can no longer be reached by path. They
    /// become evictable once their last handle is dropped.
    ///
    /// # Errors
    ///
    /// `EINVAL` if nothing is mounted at `path`, `EBUSY` if the mount root is still referenced
    /// from outside the VFS, and any lookup error for the parent directory.
    pub fn unmount(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let path = path.as_ref();
        let (dir_path, name) = split_last(path)?;
        let parent = self.lookup(dir_path)?.identity();
        let key = (parent, name.to_os_string());

        let pinned = {
            let mut mounts = lock(&self.mounts);
            let pinned = mounts.get(&key).ok_or_else(|| errno(libc::EINVAL))?;
            // The cache and the pin itself.
            if pinned.refcount() > 2 {
                return Err(errno(libc::EBUSY));
            }
            mounts.remove(&key)
        };
        self.dcache.remove(parent, name);
        drop(pinned);

        let purged = self.icache.purge();
        info!(?path, purged, "unmounted");
        Ok(())
    }
}

impl<F: Filesystem> std::fmt::Debug for Vfs<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vfs")
            .field("root", &self.root())
            .field("icache", &self.icache)
            .field("dcache", &self.dcache)
            .finish_non_exhaustive()
    }
}
