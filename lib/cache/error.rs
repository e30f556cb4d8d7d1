//! Errors returned by the inode cache.

use thiserror::Error;

use crate::fs::Identity;

/// Why [`ICache::get_or_load`](super::icache::ICache::get_or_load) could not produce a handle.
///
/// None of these leave state behind in the cache: a failed load frees its pending slot before the
/// error is returned.
#[derive(Debug, Error)]
pub enum ICacheError {
    /// The backing store failed to load the inode.
    #[error("failed to load inode {identity}: {source}")]
    Load {
        /// The inode that was being loaded.
        identity: Identity,
        /// The error reported by the backing store, propagated verbatim.
        #[source]
        source: std::io::Error,
    },

    /// Every slot holds a referenced or in-flight inode, so nothing could be evicted.
    #[error("inode cache exhausted: all {capacity} slots are in use")]
    ResourceExhausted {
        /// The configured capacity of the cache.
        capacity: usize,
    },

    /// Another caller's load of the same inode did not finish within the pending timeout.
    #[error("timed out waiting for the pending load of inode {identity}")]
    PendingTimeout {
        /// The inode whose load is still in flight.
        identity: Identity,
    },
}

impl ICacheError {
    /// Whether the backing store reported that the inode does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Load { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<ICacheError> for std::io::Error {
    fn from(err: ICacheError) -> Self {
        match err {
            ICacheError::Load { source, .. } => source,
            ICacheError::ResourceExhausted { .. } => Self::from_raw_os_error(libc::ENFILE),
            ICacheError::PendingTimeout { .. } => Self::from_raw_os_error(libc::ETIMEDOUT),
        }
    }
}
