//! Model checks of the pending-load protocol. Run with `RUSTFLAGS="--cfg loom" cargo test --test
//! icache_loom --release`.
#![cfg(loom)]
#![allow(clippy::unwrap_used, missing_docs)]

use std::io;

use loom::sync::Mutex;
use loom::sync::atomic::{AtomicUsize, Ordering};
use loom::thread;

use ananas_vfs::cache::{BackingStore, Destroyed, ICache, Loaded};
use ananas_vfs::fs::{FsId, Identity};

struct CountingStore {
    loads: AtomicUsize,
    destroyed: Mutex<Vec<Identity>>,
}

impl CountingStore {
    fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            loads: AtomicUsize::new(0),
            destroyed: Mutex::new(Vec::new()),
        })
    }
}

impl BackingStore for CountingStore {
    type Payload = u64;

    fn load(&self, identity: Identity) -> Result<Loaded<u64>, io::Error> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Loaded::new(identity.addr))
    }

    fn destroy(&self, destroyed: Destroyed<u64>) {
        self.destroyed.lock().unwrap().push(destroyed.identity);
    }
}

fn id(addr: u64) -> Identity {
    Identity::new(FsId(0), addr)
}

#[test]
fn racing_lookups_load_once() {
    loom::model(|| {
        let store = CountingStore::new();
        let cache = ICache::with_capacity(std::sync::Arc::clone(&store), 2);

        let other = {
            let cache = cache.clone();
            thread::spawn(move || {
                let handle = cache.get_or_load(id(1)).unwrap();
                handle.identity()
            })
        };
        let mine = cache.get_or_load(id(1)).unwrap();
        assert_eq!(other.join().unwrap(), id(1));

        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        assert_eq!(mine.refcount(), 2);
    });
}

#[test]
fn eviction_and_release_destroy_once() {
    loom::model(|| {
        let store = CountingStore::new();
        let cache = ICache::with_capacity(std::sync::Arc::clone(&store), 1);
        drop(cache.get_or_load(id(1)).unwrap());

        let other = {
            let cache = cache.clone();
            thread::spawn(move || cache.get_or_load(id(2)).map(|h| h.identity()).ok())
        };
        let mine = cache.get_or_load(id(1)).map(|h| h.identity()).ok();
        let theirs = other.join().unwrap();
        assert!(mine.is_some() || theirs.is_some());

        let loads = store.loads.load(Ordering::SeqCst);
        drop(cache);
        assert_eq!(store.destroyed.lock().unwrap().len(), loads);
    });
}
