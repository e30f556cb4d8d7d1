//! Directory entry cache.
//!
//! Caches the resolution of `(parent, name)` to an inode identity, including negative results for
//! names known not to exist. Bindings are non-owning: they record an [`Identity`], never a
//! reference on the inode, so the inode cache is free to evict a named inode. When it does, it
//! calls [`Evictable::purge_references_to`] so that no binding outlives its target.
//!
//! The cache is bounded. When full, inserting a new binding evicts the least recently used
//! negative binding, falling back to the least recently used non-permanent positive binding and
//! only then to a permanent one.

use std::ffi::{OsStr, OsString};
use std::fmt;

use hashlink::LinkedHashMap;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};
use tracing::{debug, trace};

use crate::cache::Evictable;
use crate::fs::Identity;
use crate::sync::{Mutex, lock};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DentryKey {
    parent: Identity,
    name: OsString,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Binding {
    /// `None` for a negative binding.
    target: Option<Identity>,
    /// Mount points. Survive [`DCache::purge_old_entries`] and are evicted last.
    permanent: bool,
}

/// Result of [`DCache::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameLookup {
    /// The name resolves to this inode.
    Hit(Identity),
    /// The name is known not to exist.
    Negative,
    /// Nothing is cached for the name.
    Miss,
}

/// One row of [`DCache::dump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DentryDump {
    /// The directory containing the name.
    pub parent: Identity,
    /// The name within `parent`.
    pub name: OsString,
    /// What the name resolves to, or `None` for a negative binding.
    pub target: Option<Identity>,
    /// Whether the binding is a mount point.
    pub permanent: bool,
}

#[derive(Default)]
struct Bindings {
    /// Least recently used at the front.
    entries: LinkedHashMap<DentryKey, Binding, FxBuildHasher>,
    /// Reverse index: target inode -> keys of the positive bindings naming it.
    by_target: FxHashMap<Identity, FxHashSet<DentryKey>>,
}

impl Bindings {
    fn unindex(&mut self, key: &DentryKey, target: Option<Identity>) {
        let Some(target) = target else {
            return;
        };
        if let Some(keys) = self.by_target.get_mut(&target) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_target.remove(&target);
            }
        }
    }

    fn take(&mut self, key: &DentryKey) -> Option<Binding> {
        let binding = self.entries.remove(key)?;
        self.unindex(key, binding.target);
        Some(binding)
    }

    fn put(&mut self, key: DentryKey, binding: Binding) {
        if let Some(target) = binding.target {
            self.by_target.entry(target).or_default().insert(key.clone());
        }
        self.entries.insert(key, binding);
    }

    /// Pick the binding to drop when the cache is full.
    fn victim(&self) -> Option<DentryKey> {
        let mut positive = None;
        let mut permanent = None;
        for (key, binding) in &self.entries {
            match binding {
                Binding { target: None, .. } => return Some(key.clone()),
                Binding {
                    permanent: false, ..
                } if positive.is_none() => positive = Some(key),
                Binding {
                    permanent: true, ..
                } if permanent.is_none() => permanent = Some(key),
                Binding { .. } => {}
            }
        }
        positive.or(permanent).cloned()
    }
}

/// Bounded `(parent, name) -> inode` cache with negative entries.
pub struct DCache {
    capacity: usize,
    bindings: Mutex<Bindings>,
}

impl fmt::Debug for DCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DCache")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

impl DCache {
    /// Creates an empty cache holding at most `capacity` bindings.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "name cache needs at least one binding");
        Self {
            capacity,
            bindings: Mutex::new(Bindings::default()),
        }
    }

    /// Maximum number of bindings.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bindings, positive and negative.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.bindings).entries.len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bind `name` in `parent` to `target`, or record that it does not exist if `target` is
    /// `None`. Replaces any previous binding for the name.
    ///
    /// `permanent` bindings are reserved for mount points.
    pub fn insert(&self, parent: Identity, name: &OsStr, target: Option<Identity>, permanent: bool) {
        let key = DentryKey {
            parent,
            name: name.to_os_string(),
        };
        let mut bindings = lock(&self.bindings);
        if bindings.take(&key).is_none()
            && bindings.entries.len() >= self.capacity
            && let Some(victim) = bindings.victim()
        {
            let evicted = bindings.take(&victim);
            trace!(
                parent = %victim.parent,
                name = ?victim.name,
                evicted = ?evicted,
                "evicting name binding"
            );
        }
        trace!(%parent, ?name, ?target, permanent, "binding name");
        bindings.put(key, Binding { target, permanent });
    }

    /// Resolve `name` in `parent`. A hit or a negative result marks the binding as recently used.
    #[must_use]
    pub fn lookup(&self, parent: Identity, name: &OsStr) -> NameLookup {
        let key = DentryKey {
            parent,
            name: name.to_os_string(),
        };
        let mut bindings = lock(&self.bindings);
        let Some(binding) = bindings.entries.remove(&key) else {
            return NameLookup::Miss;
        };
        bindings.entries.insert(key, binding);
        match binding.target {
            Some(target) => NameLookup::Hit(target),
            None => NameLookup::Negative,
        }
    }

    /// Turn the binding for `name` negative, as after the name was removed from `parent`.
    ///
    /// The binding stops being permanent. Returns the identity it used to resolve to, if any.
    pub fn unlink(&self, parent: Identity, name: &OsStr) -> Option<Identity> {
        let key = DentryKey {
            parent,
            name: name.to_os_string(),
        };
        let mut bindings = lock(&self.bindings);
        let previous = bindings.take(&key)?;
        bindings.put(
            key,
            Binding {
                target: None,
                permanent: false,
            },
        );
        trace!(%parent, ?name, previous = ?previous.target, "unlinked name");
        previous.target
    }

    /// Forget the binding for `name` entirely. Returns `true` if one existed.
    pub fn remove(&self, parent: Identity, name: &OsStr) -> bool {
        let key = DentryKey {
            parent,
            name: name.to_os_string(),
        };
        lock(&self.bindings).take(&key).is_some()
    }

    /// Drop every binding that is not permanent. Returns how many were removed.
    pub fn purge_old_entries(&self) -> usize {
        let mut bindings = lock(&self.bindings);
        let stale: Vec<_> = bindings
            .entries
            .iter()
            .filter(|(_, binding)| !binding.permanent)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            bindings.take(key);
        }
        debug!(count = stale.len(), "purged name cache");
        stale.len()
    }

    /// Snapshot every binding, most recently used first.
    #[must_use]
    pub fn dump(&self) -> Vec<DentryDump> {
        let bindings = lock(&self.bindings);
        bindings
            .entries
            .iter()
            .rev()
            .map(|(key, binding)| DentryDump {
                parent: key.parent,
                name: key.name.clone(),
                target: binding.target,
                permanent: binding.permanent,
            })
            .collect()
    }
}

impl Evictable for DCache {
    /// Remove every binding, permanent ones included, that resolves to `target`.
    fn purge_references_to(&self, target: Identity) -> usize {
        let mut bindings = lock(&self.bindings);
        let Some(keys) = bindings.by_target.remove(&target) else {
            return 0;
        };
        for key in &keys {
            bindings.entries.remove(key);
        }
        keys.len()
    }
}
