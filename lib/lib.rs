//! ananas-vfs shared library.
//!
//! A bounded inode cache with deduplicated loads, a directory entry cache that cooperates with
//! it on eviction, and a small VFS layer that resolves paths through both.

/// The inode cache.
pub mod cache;
/// Cache configuration.
pub mod config;
/// Filesystem abstractions and the name cache.
pub mod fs;
/// Synchronization primitives, swappable for loom models.
pub mod sync;
