//! Capabilities the inode cache consumes: the backing store and the name-cache purge hook.

use crate::fs::Identity;

/// An object freshly read from the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loaded<P> {
    /// Filesystem-specific body of the inode. Opaque to the cache.
    pub payload: P,
    /// Number of durable name bindings to the object.
    pub link_count: u32,
}

impl<P> Loaded<P> {
    /// A loaded object with a single name binding.
    pub fn new(payload: P) -> Self {
        Self {
            payload,
            link_count: 1,
        }
    }

    /// Override the link count reported by the store.
    #[must_use]
    pub fn with_link_count(mut self, link_count: u32) -> Self {
        self.link_count = link_count;
        self
    }
}

/// Everything the store gets back when an inode leaves the cache for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destroyed<P> {
    /// Identity of the destroyed inode.
    pub identity: Identity,
    /// The payload originally produced by [`BackingStore::load`], as last mutated.
    pub payload: P,
    /// Link count at destruction. Zero means the storage may be reclaimed.
    pub link_count: u32,
    /// Whether the payload was mutated through a handle since it was loaded.
    pub dirty: bool,
}

/// Filesystem-specific logic that fills in inode bodies and tears them down.
///
/// Neither method is ever called while a cache lock is held, so both may block on device I/O.
pub trait BackingStore: Send + Sync + 'static {
    /// The filesystem-specific inode body.
    type Payload: Send + 'static;

    /// Read the object identified by `identity`.
    ///
    /// Called at most once concurrently per identity. A missing object should be reported as
    /// [`std::io::ErrorKind::NotFound`].
    fn load(&self, identity: Identity) -> Result<Loaded<Self::Payload>, std::io::Error>;

    /// Release an object that is no longer reachable from the cache.
    ///
    /// Called exactly once per successfully loaded object. This is where dirty bodies are written
    /// back and unlinked objects have their storage reclaimed.
    fn destroy(&self, destroyed: Destroyed<Self::Payload>);
}

impl<T: BackingStore> BackingStore for std::sync::Arc<T> {
    type Payload = T::Payload;

    fn load(&self, identity: Identity) -> Result<Loaded<Self::Payload>, std::io::Error> {
        (**self).load(identity)
    }

    fn destroy(&self, destroyed: Destroyed<Self::Payload>) {
        (**self).destroy(destroyed);
    }
}

/// A cache holding bindings that target inodes, which must forget an inode before it is evicted.
///
/// The inode cache calls this with its own lock held. Implementors must never call back into the
/// inode cache from here.
pub trait Evictable: Send + Sync {
    /// Drop every binding whose target is `target`. Returns how many were removed.
    fn purge_references_to(&self, target: Identity) -> usize;
}

/// An [`Evictable`] for caches that run without a name cache in front of them.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNames;

impl Evictable for NoNames {
    fn purge_references_to(&self, _target: Identity) -> usize {
        0
    }
}
