//! Synchronization primitives.
//!
//! Shims between loom and std synchronization primitives. Everything in the caches that locks,
//! waits, or counts goes through here so the pending-load protocol can be model-checked with
//! `RUSTFLAGS="--cfg loom"`.
pub mod atomic;

#[cfg(loom)]
pub use loom::sync::{Arc, Condvar, Mutex, MutexGuard};

#[cfg(not(loom))]
pub use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Lock `mutex`, recovering the guard if a previous holder panicked.
///
/// The caches never leave their tables half-updated across a panic point, so a poisoned lock
/// still protects consistent data.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
