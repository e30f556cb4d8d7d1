#![allow(dead_code, missing_docs, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use ananas_vfs::cache::{BackingStore, Destroyed, Loaded};
use ananas_vfs::fs::{FsId, Identity};

/// Identity on filesystem 0.
pub fn id(addr: u64) -> Identity {
    Identity::new(FsId(0), addr)
}

/// Holds a load or destroy in flight until opened.
#[derive(Default)]
pub struct Gate {
    state: Mutex<GateState>,
    cv: Condvar,
}

#[derive(Default)]
struct GateState {
    entered: bool,
    open: bool,
}

impl Gate {
    /// Let the held call finish.
    pub fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.cv.notify_all();
    }

    /// Block until a call has reached the gate.
    pub fn wait_entered(&self) {
        let state = self.state.lock().unwrap();
        let (state, timeout) = self
            .cv
            .wait_timeout_while(state, Duration::from_secs(5), |s| !s.entered)
            .unwrap();
        assert!(!timeout.timed_out() && state.entered, "nothing reached the gate");
    }

    /// Mark the gate as reached and wait until it is opened.
    pub fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.entered = true;
        self.cv.notify_all();
        let (state, timeout) = self
            .cv
            .wait_timeout_while(state, Duration::from_secs(5), |s| !s.open)
            .unwrap();
        assert!(!timeout.timed_out() && state.open, "gate was never opened");
    }
}

/// A backing store whose payload for `addr` is `addr * 10`, until a dirty destroy writes
/// another value back.
///
/// Counts loads per identity, records every destroy, and can be told to fail, panic, or hold a
/// load or a destroy at a [`Gate`].
#[derive(Default)]
pub struct MockStore {
    loads: Mutex<HashMap<Identity, usize>>,
    destroyed: Mutex<Vec<Destroyed<u64>>>,
    missing: Mutex<HashSet<Identity>>,
    fail_once: Mutex<HashSet<Identity>>,
    panic_once: Mutex<HashSet<Identity>>,
    link_counts: Mutex<HashMap<Identity, u32>>,
    gates: Mutex<HashMap<Identity, Arc<Gate>>>,
    destroy_gates: Mutex<HashMap<Identity, Arc<Gate>>>,
    written: Mutex<HashMap<Identity, u64>>,
}

impl MockStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Loads of `identity` report `NotFound`.
    pub fn set_missing(&self, identity: Identity) {
        self.missing.lock().unwrap().insert(identity);
    }

    /// The next load of `identity` fails with `EIO`.
    pub fn fail_once(&self, identity: Identity) {
        self.fail_once.lock().unwrap().insert(identity);
    }

    /// The next load of `identity` panics.
    pub fn panic_once(&self, identity: Identity) {
        self.panic_once.lock().unwrap().insert(identity);
    }

    /// Loads of `identity` report this link count.
    pub fn set_link_count(&self, identity: Identity, link_count: u32) {
        self.link_counts.lock().unwrap().insert(identity, link_count);
    }

    /// The next load of `identity` waits at the returned gate.
    pub fn hold(&self, identity: Identity) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates
            .lock()
            .unwrap()
            .insert(identity, Arc::clone(&gate));
        gate
    }

    /// The next destroy of `identity` waits at the returned gate.
    pub fn hold_destroy(&self, identity: Identity) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.destroy_gates
            .lock()
            .unwrap()
            .insert(identity, Arc::clone(&gate));
        gate
    }

    /// The value last written back for `identity`.
    pub fn written(&self, identity: Identity) -> Option<u64> {
        self.written.lock().unwrap().get(&identity).copied()
    }

    pub fn loads(&self, identity: Identity) -> usize {
        self.loads
            .lock()
            .unwrap()
            .get(&identity)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.loads.lock().unwrap().values().sum()
    }

    pub fn destroyed(&self) -> Vec<Destroyed<u64>> {
        self.destroyed.lock().unwrap().clone()
    }

    pub fn destroyed_ids(&self) -> Vec<Identity> {
        self.destroyed
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.identity)
            .collect()
    }

    pub fn destroys(&self, identity: Identity) -> usize {
        self.destroyed
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.identity == identity)
            .count()
    }
}

impl BackingStore for MockStore {
    type Payload = u64;

    fn load(&self, identity: Identity) -> Result<Loaded<u64>, io::Error> {
        *self.loads.lock().unwrap().entry(identity).or_default() += 1;

        let gate = self.gates.lock().unwrap().remove(&identity);
        if let Some(gate) = gate {
            gate.pass();
        }

        if self.panic_once.lock().unwrap().remove(&identity) {
            panic!("load of {identity} panicked");
        }
        if self.fail_once.lock().unwrap().remove(&identity) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        if self.missing.lock().unwrap().contains(&identity) {
            return Err(io::Error::from_raw_os_error(libc::ENOENT));
        }

        let link_count = self
            .link_counts
            .lock()
            .unwrap()
            .get(&identity)
            .copied()
            .unwrap_or(1);
        let payload = self.written(identity).unwrap_or(identity.addr * 10);
        Ok(Loaded::new(payload).with_link_count(link_count))
    }

    fn destroy(&self, destroyed: Destroyed<u64>) {
        let gate = self.destroy_gates.lock().unwrap().remove(&destroyed.identity);
        if let Some(gate) = gate {
            gate.pass();
        }
        if destroyed.dirty && destroyed.link_count > 0 {
            self.written
                .lock()
                .unwrap()
                .insert(destroyed.identity, destroyed.payload);
        }
        self.destroyed.lock().unwrap().push(destroyed);
    }
}

/// Poll `cond` until it holds, or panic after five seconds.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
