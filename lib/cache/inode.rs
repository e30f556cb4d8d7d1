//! The cache-resident inode: an identity, its counts, and a body behind a separate lock.

use crate::cache::traits::{Destroyed, Loaded};
use crate::fs::Identity;
use crate::sync::{Mutex, MutexGuard, lock};

/// Counts and flags of a [`CachedInode`], guarded by the inode's own lock.
///
/// This lock is only ever held for a few field updates, never while running caller code, so the
/// cache may take it under the table lock.
#[derive(Debug)]
pub(crate) struct InodeState {
    /// Explicit reference count: one for the cache while the inode is cached, plus one per
    /// outstanding handle. Zero means the inode has been retired.
    pub(crate) refcount: u32,
    pub(crate) link_count: u32,
    pub(crate) dirty: bool,
}

/// One loaded backing-store object.
///
/// The cache and every [`InodeRef`](crate::cache::icache::InodeRef) share the allocation; the
/// explicit `refcount` in [`InodeState`], not the `Arc` count, governs when the object is
/// destroyed.
///
/// The payload sits behind its own lock. Only handle holders take it, so a slow closure over the
/// body never blocks the cache, which only looks at the state.
#[derive(Debug)]
pub struct CachedInode<P> {
    identity: Identity,
    state: Mutex<InodeState>,
    /// `None` once the payload was handed to the store.
    body: Mutex<Option<P>>,
}

impl<P> CachedInode<P> {
    /// Wrap a freshly loaded object. The refcount starts at two: the cache and the loading caller.
    pub(crate) fn new(identity: Identity, loaded: Loaded<P>) -> Self {
        Self {
            identity,
            state: Mutex::new(InodeState {
                refcount: 2,
                link_count: loaded.link_count,
                dirty: false,
            }),
            body: Mutex::new(Some(loaded.payload)),
        }
    }

    /// The identity this inode was loaded for.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.identity
    }

    /// Take the inode lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, InodeState> {
        lock(&self.state)
    }

    /// Take the body lock. Only callers holding a reference may do so.
    pub(crate) fn body(&self) -> MutexGuard<'_, Option<P>> {
        lock(&self.body)
    }

    /// Add a caller reference to an inode found in the cache.
    ///
    /// Must be called with the cache lock held, which keeps the inode from being retired between
    /// the lookup and the increment.
    pub(crate) fn acquire_cached(&self) -> u32 {
        let mut state = self.lock();
        assert!(
            state.refcount >= 1,
            "cached inode {} has no cache reference",
            self.identity
        );
        state.refcount += 1;
        state.refcount
    }

    /// Drop the cache's own reference and take the payload out for destruction. `state` is this
    /// inode's locked state.
    ///
    /// With only the cache's reference left, no handle can be holding the body lock.
    ///
    /// # Panics
    ///
    /// Panics if anything but the cache still references the inode, or if the inode was already
    /// retired. Either means the cache lost track of its references.
    pub(crate) fn retire(&self, state: &mut InodeState) -> Destroyed<P> {
        assert_eq!(
            state.refcount, 1,
            "retiring inode {} that is still referenced",
            self.identity
        );
        let Some(payload) = self.body().take() else {
            panic!("inode {} destroyed twice", self.identity);
        };
        state.refcount = 0;
        Destroyed {
            identity: self.identity,
            payload,
            link_count: state.link_count,
            dirty: state.dirty,
        }
    }
}
