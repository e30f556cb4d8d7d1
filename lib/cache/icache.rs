//! Fixed-capacity inode cache with deduplicated loads and refcount-driven eviction.
//!
//! The cache owns a table of at most `capacity` slots. A slot is either `Pending` (a load for
//! that identity is in flight) or `Occupied` (the inode is loaded). Free slots are implicit: the
//! table simply has fewer than `capacity` entries. The table is kept in least-recently-used order,
//! oldest at the front.
//!
//! # Reference protocol
//!
//! A cached inode carries one reference for the cache itself plus one per outstanding
//! [`InodeRef`]. An inode is only ever retired once the cache's reference is the last one, which
//! happens either when eviction needs the slot, or eagerly when the last handle to an unlinked
//! inode is dropped. Retiring hands the payload to [`BackingStore::destroy`] exactly once, with no
//! lock held.
//!
//! # Lock order
//!
//! Table lock, then inode lock, then the name cache's lock (through [`Evictable`]). Dropping a
//! handle takes the inode lock alone and releases it before touching the table. The body lock
//! is only taken by handle holders, and never together with the table lock.
//!
//! # Retiring
//!
//! An evicted inode gives up its slot at once, but its identity stays marked as retiring until
//! [`BackingStore::destroy`] returns. Loads of that identity wait for the marker to clear, so
//! they see whatever the destroy wrote back.

use std::fmt;
use std::time::{Duration, Instant};

use hashlink::LinkedHashMap;
use rustc_hash::{FxBuildHasher, FxHashMap};
use tracing::{debug, trace, warn};

use crate::cache::error::ICacheError;
use crate::cache::inode::CachedInode;
use crate::cache::traits::{BackingStore, Destroyed, Evictable, NoNames};
use crate::config::{ExhaustionPolicy, ICacheConfig};
use crate::fs::Identity;
use crate::sync::atomic::{AtomicU64, Ordering};
use crate::sync::{Arc, Condvar, Mutex, MutexGuard, lock};

/// State of an entry in the cache table.
enum Slot<P> {
    /// A load is in flight. Waiters block on the condition variable, which the loader signals once
    /// the slot resolves either way.
    Pending(Arc<Condvar>),
    /// The inode is loaded and holds the cache's reference.
    Occupied(Arc<CachedInode<P>>),
}

/// The slots plus the inodes on their way out, under one lock.
struct Table<P> {
    /// Pending and occupied slots, least recently used first.
    slots: LinkedHashMap<Identity, Slot<P>, FxBuildHasher>,
    /// Inodes that left `slots` but whose destroy has not returned yet. They hold no slot.
    retiring: FxHashMap<Identity, Arc<Condvar>>,
}

impl<P> Table<P> {
    fn new() -> Self {
        Self {
            slots: LinkedHashMap::with_hasher(FxBuildHasher),
            retiring: FxHashMap::default(),
        }
    }

    /// Free the slot of a retired inode and mark its identity as retiring.
    fn start_retiring(&mut self, identity: Identity) {
        self.slots.remove(&identity);
        let previous = self.retiring.insert(identity, Arc::new(Condvar::new()));
        debug_assert!(previous.is_none(), "inode {identity} retiring twice");
    }
}

/// Counters behind [`ICache::stats`].
#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    pending_waits: AtomicU64,
    evictions: AtomicU64,
    eager_removals: AtomicU64,
    load_failures: AtomicU64,
    exhaustions: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ICacheStats {
        ICacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            pending_waits: self.pending_waits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            eager_removals: self.eager_removals.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            exhaustions: self.exhaustions.load(Ordering::Relaxed),
        }
    }
}

/// A snapshot of the cache's activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ICacheStats {
    /// Lookups served from an occupied slot.
    pub hits: u64,
    /// Lookups that reserved a slot and called [`BackingStore::load`].
    pub misses: u64,
    /// Times a caller blocked on another caller's in-flight load or destroy of the same identity.
    pub pending_waits: u64,
    /// Inodes retired to free a slot (or by [`ICache::purge`]).
    pub evictions: u64,
    /// Unlinked inodes retired as soon as their last handle was dropped.
    pub eager_removals: u64,
    /// Loads that returned an error.
    pub load_failures: u64,
    /// Lookups refused with [`ICacheError::ResourceExhausted`].
    pub exhaustions: u64,
}

/// State of one entry in a [`DumpEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// A load is in flight.
    Pending,
    /// The inode is loaded.
    Live {
        /// References held, including the cache's own.
        refcount: u32,
        /// Durable name bindings.
        link_count: u32,
        /// Whether the body was mutated since it was loaded.
        dirty: bool,
    },
}

/// One row of [`ICache::dump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpEntry {
    /// The identity the slot is reserved for.
    pub identity: Identity,
    /// Whether it is loaded, and if so its counts.
    pub state: EntryState,
}

struct Inner<S: BackingStore> {
    store: S,
    names: std::sync::Arc<dyn Evictable>,
    capacity: usize,
    exhaustion: ExhaustionPolicy,
    pending_timeout: Option<Duration>,
    table: Mutex<Table<S::Payload>>,
    /// Signalled whenever a slot is released or an inode becomes evictable.
    slot_freed: Condvar,
    counters: Counters,
}

impl<S: BackingStore> Inner<S> {
    /// Block on `cv` until signalled or until `deadline` passes.
    ///
    /// Returns `None` if the deadline had already passed; spurious wakeups are left to the
    /// caller's retry loop.
    fn wait_until<'a>(
        cv: &Condvar,
        table: MutexGuard<'a, Table<S::Payload>>,
        deadline: Option<Instant>,
    ) -> Option<MutexGuard<'a, Table<S::Payload>>> {
        let Some(deadline) = deadline else {
            return Some(
                cv.wait(table)
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
            );
        };
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let (table, _) = cv
            .wait_timeout(table, deadline - now)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Some(table)
    }

    /// Retire up to `limit` inodes that only the cache references, least recently used first.
    ///
    /// Pending slots and inodes with outstanding handles are skipped. Name bindings targeting a
    /// retired inode are purged before its slot is released. The returned payloads must be
    /// handed to [`BackingStore::destroy`] after the table lock is dropped.
    fn evict_unreferenced(
        &self,
        table: &mut Table<S::Payload>,
        limit: usize,
    ) -> Vec<Destroyed<S::Payload>> {
        let mut retired = Vec::new();
        for slot in table.slots.values() {
            if retired.len() >= limit {
                break;
            }
            let Slot::Occupied(inode) = slot else {
                continue;
            };
            let mut state = inode.lock();
            if state.refcount > 1 {
                continue;
            }
            retired.push(inode.retire(&mut state));
        }

        for destroyed in &retired {
            table.start_retiring(destroyed.identity);
            let purged = self.names.purge_references_to(destroyed.identity);
            Counters::bump(&self.counters.evictions);
            trace!(identity = %destroyed.identity, purged, "evicting inode");
        }
        retired
    }

    /// Retire `inode` if the cache still holds it, it is unlinked, and only the cache references
    /// it. Returns `None` if any of that stopped being true since the caller dropped its lock.
    fn take_unlinked(&self, inode: &Arc<CachedInode<S::Payload>>) -> Option<Destroyed<S::Payload>> {
        let identity = inode.identity();
        let mut table = lock(&self.table);
        match table.slots.get(&identity) {
            Some(Slot::Occupied(cached)) if Arc::ptr_eq(cached, inode) => {}
            // Already evicted by a sweep, possibly reloaded since.
            _ => return None,
        }
        let destroyed = {
            let mut state = inode.lock();
            if state.refcount != 1 || state.link_count != 0 {
                return None;
            }
            inode.retire(&mut state)
        };
        table.start_retiring(identity);
        let purged = self.names.purge_references_to(identity);
        drop(table);

        self.slot_freed.notify_all();
        Counters::bump(&self.counters.eager_removals);
        trace!(%identity, purged, "removing unlinked inode");
        Some(destroyed)
    }

    /// Wake callers blocked on a full cache, now that an inode can be evicted.
    fn announce_evictable(&self) {
        if self.exhaustion.block_timeout().is_none() {
            return;
        }
        // A waiter checks for victims and starts waiting under the table lock, so taking it here
        // orders this wakeup after the check.
        drop(lock(&self.table));
        self.slot_freed.notify_all();
    }

    fn destroy_all(&self, retired: Vec<Destroyed<S::Payload>>) {
        for destroyed in retired {
            let _retiring = RetiringGuard {
                inner: self,
                identity: destroyed.identity,
            };
            trace!(identity = %destroyed.identity, dirty = destroyed.dirty, "destroying inode");
            self.store.destroy(destroyed);
        }
    }
}

/// Clears an identity's retiring marker once its destroy returns or unwinds, and wakes the
/// callers waiting to reload it.
struct RetiringGuard<'a, S: BackingStore> {
    inner: &'a Inner<S>,
    identity: Identity,
}

impl<S: BackingStore> Drop for RetiringGuard<'_, S> {
    fn drop(&mut self) {
        let cv = lock(&self.inner.table).retiring.remove(&self.identity);
        if let Some(cv) = cv {
            cv.notify_all();
        }
    }
}

impl<S: BackingStore> Drop for Inner<S> {
    /// No handle can outlive the cache, so every remaining inode is referenced by the cache alone
    /// and can be handed back to the store.
    fn drop(&mut self) {
        let table = std::mem::replace(&mut *lock(&self.table), Table::new());
        for (identity, slot) in table.slots {
            if let Slot::Occupied(inode) = slot {
                let destroyed = inode.retire(&mut inode.lock());
                self.names.purge_references_to(identity);
                self.store.destroy(destroyed);
            }
        }
    }
}

/// Releases a pending slot if the loader bails out before publishing the inode.
///
/// Covers both a load error and a panic inside [`BackingStore::load`], so the identity is never
/// left stuck in the pending state. Defuse after the slot has been promoted.
struct PendingGuard<'a, S: BackingStore> {
    inner: &'a Inner<S>,
    identity: Identity,
    cv: Arc<Condvar>,
    armed: bool,
}

impl<S: BackingStore> PendingGuard<'_, S> {
    fn defuse(&mut self) {
        self.armed = false;
    }
}

impl<S: BackingStore> Drop for PendingGuard<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut table = lock(&self.inner.table);
        if matches!(table.slots.get(&self.identity), Some(Slot::Pending(cv)) if Arc::ptr_eq(cv, &self.cv))
        {
            table.slots.remove(&self.identity);
        }
        drop(table);
        self.cv.notify_all();
        self.inner.slot_freed.notify_all();
    }
}

/// The inode cache.
///
/// Cloning is cheap and yields another handle to the same cache.
pub struct ICache<S: BackingStore> {
    inner: Arc<Inner<S>>,
}

impl<S: BackingStore> Clone for ICache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: BackingStore> fmt::Debug for ICache<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ICache")
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl<S: BackingStore> ICache<S> {
    /// Create a cache of `capacity` slots in front of `store`, with no name cache attached and
    /// the default policies.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(store: S, capacity: usize) -> Self {
        Self::new(
            store,
            &ICacheConfig::with_capacity(capacity),
            std::sync::Arc::new(NoNames),
        )
    }

    /// Create a cache configured by `config`.
    ///
    /// `names` is consulted whenever an inode leaves the cache, so that it can drop the bindings
    /// that target it.
    ///
    /// # Panics
    ///
    /// Panics if `config.capacity` is zero.
    #[must_use]
    pub fn new(store: S, config: &ICacheConfig, names: std::sync::Arc<dyn Evictable>) -> Self {
        assert!(config.capacity > 0, "inode cache needs at least one slot");
        Self {
            inner: Arc::new(Inner {
                store,
                names,
                capacity: config.capacity,
                exhaustion: config.exhaustion,
                pending_timeout: config.pending_timeout(),
                table: Mutex::new(Table::new()),
                slot_freed: Condvar::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// The backing store this cache loads from.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Maximum number of occupied plus pending slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of occupied plus pending slots.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.inner.table).slots.len()
    }

    /// Returns `true` if no slot is in use.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `identity` is loaded. Pending loads do not count.
    #[must_use]
    pub fn contains(&self, identity: Identity) -> bool {
        matches!(
            lock(&self.inner.table).slots.get(&identity),
            Some(Slot::Occupied(_))
        )
    }

    /// Return a referenced handle to the inode for `identity`, loading it if necessary.
    ///
    /// Concurrent callers for the same identity share a single [`BackingStore::load`]: the first
    /// one reserves a pending slot and loads, the rest wait for it to resolve. When the table is
    /// full, the least recently used inode that only the cache references is evicted to make
    /// room; referenced and pending inodes are never evicted.
    ///
    /// # Errors
    ///
    /// - [`ICacheError::Load`] if the backing store fails. Nothing is cached for the identity.
    /// - [`ICacheError::ResourceExhausted`] if no slot could be freed (after waiting, under the
    ///   [`ExhaustionPolicy::Block`] policy).
    /// - [`ICacheError::PendingTimeout`] if another caller's load of the same identity outlasted
    ///   the configured pending timeout.
    pub fn get_or_load(&self, identity: Identity) -> Result<InodeRef<S>, ICacheError> {
        let inner = &*self.inner;
        let pending_deadline = inner.pending_timeout.map(|t| Instant::now() + t);
        let mut capacity_deadline = None;

        let mut table = lock(&inner.table);
        let (cv, victims) = loop {
            match table.slots.get(&identity) {
                Some(Slot::Occupied(inode)) => {
                    let inode = Arc::clone(inode);
                    let refcount = inode.acquire_cached();
                    // Move to the most recently used end.
                    if let Some(slot) = table.slots.remove(&identity) {
                        table.slots.insert(identity, slot);
                    }
                    drop(table);
                    Counters::bump(&inner.counters.hits);
                    trace!(%identity, refcount, "cache hit");
                    return Ok(InodeRef {
                        cache: Arc::clone(&self.inner),
                        inode,
                    });
                }
                Some(Slot::Pending(cv)) => {
                    let cv = Arc::clone(cv);
                    Counters::bump(&inner.counters.pending_waits);
                    debug!(%identity, "inode is pending, waiting");
                    table = Inner::<S>::wait_until(&cv, table, pending_deadline).ok_or_else(
                        || {
                            warn!(%identity, "timed out waiting for pending inode");
                            ICacheError::PendingTimeout { identity }
                        },
                    )?;
                    continue;
                }
                None => {}
            }

            if let Some(cv) = table.retiring.get(&identity) {
                let cv = Arc::clone(cv);
                Counters::bump(&inner.counters.pending_waits);
                debug!(%identity, "inode is being destroyed, waiting");
                table = Inner::<S>::wait_until(&cv, table, pending_deadline).ok_or_else(|| {
                    warn!(%identity, "timed out waiting for inode to be destroyed");
                    ICacheError::PendingTimeout { identity }
                })?;
                continue;
            }

            let victims = if table.slots.len() < inner.capacity {
                Vec::new()
            } else {
                inner.evict_unreferenced(&mut table, 1)
            };

            if table.slots.len() >= inner.capacity {
                let Some(timeout) = inner.exhaustion.block_timeout() else {
                    Counters::bump(&inner.counters.exhaustions);
                    warn!(%identity, capacity = inner.capacity, "inode cache exhausted");
                    return Err(ICacheError::ResourceExhausted {
                        capacity: inner.capacity,
                    });
                };
                let deadline = *capacity_deadline.get_or_insert_with(|| Instant::now() + timeout);
                debug!(%identity, "inode cache full, waiting for a free slot");
                table = Inner::<S>::wait_until(&inner.slot_freed, table, Some(deadline))
                    .ok_or_else(|| {
                        Counters::bump(&inner.counters.exhaustions);
                        warn!(%identity, capacity = inner.capacity, "inode cache exhausted");
                        ICacheError::ResourceExhausted {
                            capacity: inner.capacity,
                        }
                    })?;
                // Someone else may have loaded the identity while we slept.
                continue;
            }

            let cv = Arc::new(Condvar::new());
            table.slots.insert(identity, Slot::Pending(Arc::clone(&cv)));
            break (cv, victims);
        };
        drop(table);

        Counters::bump(&inner.counters.misses);
        trace!(%identity, "cache miss");
        inner.destroy_all(victims);

        let mut guard = PendingGuard {
            inner,
            identity,
            cv,
            armed: true,
        };

        let loaded = match inner.store.load(identity) {
            Ok(loaded) => loaded,
            Err(source) => {
                Counters::bump(&inner.counters.load_failures);
                debug!(%identity, error = %source, "failed to load inode");
                // Dropping the guard frees the pending slot and wakes the waiters.
                drop(guard);
                return Err(ICacheError::Load { identity, source });
            }
        };

        let inode = Arc::new(CachedInode::new(identity, loaded));
        let mut table = lock(&inner.table);
        let Some(slot) = table.slots.get_mut(&identity) else {
            unreachable!("pending slot for {identity} vanished during its load");
        };
        assert!(
            matches!(&*slot, Slot::Pending(cv) if Arc::ptr_eq(cv, &guard.cv)),
            "pending slot for {identity} was replaced during its load"
        );
        *slot = Slot::Occupied(Arc::clone(&inode));
        guard.defuse();
        drop(table);
        guard.cv.notify_all();

        Ok(InodeRef {
            cache: Arc::clone(&self.inner),
            inode,
        })
    }

    /// Evict every inode that only the cache references. Returns how many were destroyed.
    ///
    /// Pending loads and inodes with outstanding handles are left alone.
    pub fn purge(&self) -> usize {
        let inner = &*self.inner;
        let mut table = lock(&inner.table);
        let retired = inner.evict_unreferenced(&mut table, usize::MAX);
        drop(table);

        let count = retired.len();
        if count > 0 {
            inner.slot_freed.notify_all();
        }
        debug!(count, "purged inode cache");
        inner.destroy_all(retired);
        count
    }

    /// Snapshot the table, most recently used first.
    ///
    /// Purely diagnostic: the table may change as soon as the snapshot is taken.
    #[must_use]
    pub fn dump(&self) -> Vec<DumpEntry> {
        let table = lock(&self.inner.table);
        table
            .slots
            .iter()
            .rev()
            .map(|(identity, slot)| DumpEntry {
                identity: *identity,
                state: match slot {
                    Slot::Pending(_) => EntryState::Pending,
                    Slot::Occupied(inode) => {
                        let state = inode.lock();
                        EntryState::Live {
                            refcount: state.refcount,
                            link_count: state.link_count,
                            dirty: state.dirty,
                        }
                    }
                },
            })
            .collect()
    }

    /// Current activity counters.
    #[must_use]
    pub fn stats(&self) -> ICacheStats {
        self.inner.counters.snapshot()
    }
}

/// A referenced handle to a cached inode.
///
/// Holding an `InodeRef` keeps the inode in the cache. Cloning adds a reference; dropping removes
/// one. Dropping the last handle to an inode whose link count is zero destroys it immediately
/// instead of waiting for eviction.
pub struct InodeRef<S: BackingStore> {
    cache: Arc<Inner<S>>,
    inode: Arc<CachedInode<S::Payload>>,
}

impl<S: BackingStore> InodeRef<S> {
    /// The identity of the referenced inode.
    #[must_use]
    pub fn identity(&self) -> Identity {
        self.inode.identity()
    }

    /// References currently held on the inode, including the cache's own.
    #[must_use]
    pub fn refcount(&self) -> u32 {
        self.inode.lock().refcount
    }

    /// Durable name bindings to the inode.
    #[must_use]
    pub fn link_count(&self) -> u32 {
        self.inode.lock().link_count
    }

    /// Overwrite the link count.
    pub fn set_link_count(&self, link_count: u32) {
        self.inode.lock().link_count = link_count;
    }

    /// Remove one name binding. Returns the remaining link count.
    pub fn unlink(&self) -> u32 {
        let mut state = self.inode.lock();
        state.link_count = state.link_count.saturating_sub(1);
        state.link_count
    }

    /// Flag the body as needing write-back.
    pub fn mark_dirty(&self) {
        self.inode.lock().dirty = true;
    }

    /// Whether the body was mutated since it was loaded.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inode.lock().dirty
    }

    /// Read the payload under the body lock.
    ///
    /// Only other accesses to the same body wait for `f`; the cache never does.
    pub fn with_payload<T>(&self, f: impl FnOnce(&S::Payload) -> T) -> T {
        let body = self.inode.body();
        let payload = body
            .as_ref()
            .unwrap_or_else(|| unreachable!("live handle on destroyed inode"));
        f(payload)
    }

    /// Mutate the payload under the body lock. Marks the inode dirty.
    pub fn with_payload_mut<T>(&self, f: impl FnOnce(&mut S::Payload) -> T) -> T {
        self.mark_dirty();
        let mut body = self.inode.body();
        let payload = body
            .as_mut()
            .unwrap_or_else(|| unreachable!("live handle on destroyed inode"));
        f(payload)
    }

    /// Whether both handles reference the same inode object.
    #[must_use]
    pub fn same_inode(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inode, &other.inode)
    }
}

impl<S: BackingStore> Clone for InodeRef<S> {
    fn clone(&self) -> Self {
        {
            let mut state = self.inode.lock();
            // A live handle plus the cache's own reference.
            assert!(
                state.refcount >= 2,
                "referencing dead inode {}",
                self.inode.identity()
            );
            state.refcount += 1;
        }
        Self {
            cache: Arc::clone(&self.cache),
            inode: Arc::clone(&self.inode),
        }
    }
}

impl<S: BackingStore> Drop for InodeRef<S> {
    fn drop(&mut self) {
        let (evictable, unlinked) = {
            let mut state = self.inode.lock();
            assert!(
                state.refcount >= 2,
                "dereferencing inode {} with refcount {}",
                self.inode.identity(),
                state.refcount
            );
            state.refcount -= 1;
            (state.refcount == 1, state.link_count == 0)
        };
        // The inode lock is released before the table lock is taken.
        if !evictable {
            return;
        }
        if unlinked {
            if let Some(destroyed) = self.cache.take_unlinked(&self.inode) {
                self.cache.destroy_all(vec![destroyed]);
            }
        } else {
            self.cache.announce_evictable();
        }
    }
}

impl<S: BackingStore> fmt::Debug for InodeRef<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InodeRef")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::cache::traits::Loaded;
    use crate::fs::FsId;

    /// Loads `addr * 10` for every addr except 404.
    struct TenTimes {
        destroyed: Mutex<Vec<Destroyed<u64>>>,
    }

    impl TenTimes {
        fn new() -> Self {
            Self {
                destroyed: Mutex::new(Vec::new()),
            }
        }

        fn destroyed(&self) -> Vec<Identity> {
            lock(&self.destroyed).iter().map(|d| d.identity).collect()
        }
    }

    impl BackingStore for TenTimes {
        type Payload = u64;

        fn load(&self, identity: Identity) -> Result<Loaded<u64>, io::Error> {
            if identity.addr == 404 {
                return Err(io::Error::from_raw_os_error(libc::ENOENT));
            }
            Ok(Loaded::new(identity.addr * 10))
        }

        fn destroy(&self, destroyed: Destroyed<u64>) {
            lock(&self.destroyed).push(destroyed);
        }
    }

    fn id(addr: u64) -> Identity {
        Identity::new(FsId(0), addr)
    }

    #[test]
    fn hit_moves_entry_to_front_of_dump() {
        let cache = ICache::with_capacity(TenTimes::new(), 4);
        drop(cache.get_or_load(id(1)).expect("load 1"));
        drop(cache.get_or_load(id(2)).expect("load 2"));
        drop(cache.get_or_load(id(1)).expect("hit 1"));

        let order: Vec<_> = cache.dump().iter().map(|e| e.identity).collect();
        assert_eq!(order, vec![id(1), id(2)]);
    }

    #[test]
    fn eviction_prefers_least_recently_used() {
        let cache = ICache::with_capacity(TenTimes::new(), 2);
        drop(cache.get_or_load(id(1)).expect("load 1"));
        drop(cache.get_or_load(id(2)).expect("load 2"));
        drop(cache.get_or_load(id(1)).expect("touch 1"));
        drop(cache.get_or_load(id(3)).expect("load 3"));

        assert!(cache.contains(id(1)));
        assert!(!cache.contains(id(2)), "2 was least recently used");
        assert_eq!(cache.store().destroyed(), vec![id(2)]);
    }

    #[test]
    fn payload_mutation_marks_dirty_and_reaches_destroy() {
        let cache = ICache::with_capacity(TenTimes::new(), 1);
        let handle = cache.get_or_load(id(5)).expect("load");
        assert_eq!(handle.with_payload(|p| *p), 50);
        assert!(!handle.is_dirty());
        handle.with_payload_mut(|p| *p += 1);
        assert!(handle.is_dirty());
        drop(handle);

        assert_eq!(cache.purge(), 1);
        let destroyed = lock(&cache.store().destroyed);
        assert_eq!(destroyed.len(), 1);
        assert_eq!(destroyed[0].payload, 51);
        assert!(destroyed[0].dirty);
    }

    #[test]
    fn failed_load_frees_the_slot() {
        let cache = ICache::with_capacity(TenTimes::new(), 1);
        let err = cache.get_or_load(id(404)).expect_err("404 is missing");
        assert!(err.is_not_found());
        assert!(cache.is_empty());
        assert_eq!(cache.stats().load_failures, 1);
        // The slot is usable again.
        drop(cache.get_or_load(id(1)).expect("load 1"));
    }

    #[test]
    fn clone_and_drop_balance_refcount() {
        let cache = ICache::with_capacity(TenTimes::new(), 2);
        let a = cache.get_or_load(id(1)).expect("load");
        assert_eq!(a.refcount(), 2);
        let b = a.clone();
        assert_eq!(a.refcount(), 3);
        assert!(a.same_inode(&b));
        drop(b);
        assert_eq!(a.refcount(), 2);
        drop(a);
        assert_eq!(
            cache.dump()[0].state,
            EntryState::Live {
                refcount: 1,
                link_count: 1,
                dirty: false
            }
        );
    }

    #[test]
    fn dropping_the_cache_destroys_what_is_left() {
        let store = std::sync::Arc::new(TenTimes::new());
        let cache = ICache::with_capacity(std::sync::Arc::clone(&store), 3);
        drop(cache.get_or_load(id(1)).expect("load 1"));
        drop(cache.get_or_load(id(2)).expect("load 2"));
        drop(cache);

        let mut destroyed = store.destroyed();
        destroyed.sort();
        assert_eq!(destroyed, vec![id(1), id(2)]);
    }
}
