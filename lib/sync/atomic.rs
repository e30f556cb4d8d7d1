//! Re-export of atomics, so that we can use loom's atomics when testing with loom.

#[cfg(loom)]
pub use loom::sync::atomic::{AtomicU64, Ordering};

#[cfg(not(loom))]
pub use std::sync::atomic::{AtomicU64, Ordering};
