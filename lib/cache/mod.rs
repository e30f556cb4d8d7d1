//! The inode cache and the capabilities it is built on.

/// Errors returned by the inode cache.
pub mod error;
/// The fixed-capacity inode cache and its reference handle.
pub mod icache;
/// The cache-resident inode object.
pub mod inode;
/// Backing store and name-cache capabilities.
pub mod traits;

pub use error::ICacheError;
pub use icache::{DumpEntry, EntryState, ICache, ICacheStats, InodeRef};
pub use inode::CachedInode;
pub use traits::{BackingStore, Destroyed, Evictable, Loaded, NoNames};
