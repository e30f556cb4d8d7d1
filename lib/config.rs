//! Cache configuration.
//!
//! Every field has a default, so an empty TOML table is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of inode slots when nothing else is configured.
pub const DEFAULT_ICACHE_CAPACITY: usize = 32;

/// Number of name bindings when nothing else is configured.
pub const DEFAULT_DCACHE_CAPACITY: usize = 64;

fn default_icache_capacity() -> usize {
    DEFAULT_ICACHE_CAPACITY
}

fn default_dcache_capacity() -> usize {
    DEFAULT_DCACHE_CAPACITY
}

/// What [`ICache::get_or_load`](crate::cache::icache::ICache::get_or_load) does when every slot is
/// referenced and nothing can be evicted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum ExhaustionPolicy {
    /// Return [`ICacheError::ResourceExhausted`](crate::cache::ICacheError::ResourceExhausted)
    /// immediately.
    #[default]
    Fail,
    /// Wait for a slot to be freed, giving up after `timeout_ms`.
    Block {
        /// How long to wait for capacity, in milliseconds.
        timeout_ms: u64,
    },
}

impl ExhaustionPolicy {
    /// How long a caller may wait for a slot, or `None` to fail immediately.
    #[must_use]
    pub fn block_timeout(self) -> Option<Duration> {
        match self {
            Self::Fail => None,
            Self::Block { timeout_ms } => Some(Duration::from_millis(timeout_ms)),
        }
    }
}

/// The inode cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ICacheConfig {
    /// Maximum number of occupied plus pending slots.
    #[serde(default = "default_icache_capacity")]
    pub capacity: usize,

    /// Behaviour when no slot can be freed.
    #[serde(default)]
    pub exhaustion: ExhaustionPolicy,

    /// How long to wait for another caller's in-flight load of the same inode. Waits forever if
    /// not specified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_timeout_ms: Option<u64>,
}

impl ICacheConfig {
    /// A configuration with the given capacity and default policies.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// The pending-wait timeout as a [`Duration`].
    #[must_use]
    pub fn pending_timeout(&self) -> Option<Duration> {
        self.pending_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ICacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_ICACHE_CAPACITY,
            exhaustion: ExhaustionPolicy::default(),
            pending_timeout_ms: None,
        }
    }
}

/// The directory entry cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DCacheConfig {
    /// Maximum number of name bindings, positive and negative.
    #[serde(default = "default_dcache_capacity")]
    pub capacity: usize,
}

impl Default for DCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_DCACHE_CAPACITY,
        }
    }
}

/// Configuration of both caches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// The inode cache.
    #[serde(default)]
    pub icache: ICacheConfig,

    /// The directory entry cache.
    #[serde(default)]
    pub dcache: DCacheConfig,
}

impl CacheConfig {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.icache.capacity == 0 {
            errors.push("icache.capacity must be at least 1.".to_owned());
        }

        if self.dcache.capacity == 0 {
            errors.push("dcache.capacity must be at least 1.".to_owned());
        }

        // Every cached inode should be nameable from the dcache.
        if self.dcache.capacity < self.icache.capacity {
            errors.push(format!(
                "dcache.capacity ({}) must not be smaller than icache.capacity ({}).",
                self.dcache.capacity, self.icache.capacity
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_yields_defaults() {
        let config: CacheConfig = toml::from_str("").expect("empty config parses");
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.icache.capacity, DEFAULT_ICACHE_CAPACITY);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parses_block_policy_and_timeouts() {
        let config: CacheConfig = toml::from_str(
            r#"
            [icache]
            capacity = 8
            pending-timeout-ms = 250
            exhaustion = { block = { timeout-ms = 100 } }

            [dcache]
            capacity = 16
            "#,
        )
        .expect("config parses");
        assert_eq!(config.icache.capacity, 8);
        assert_eq!(
            config.icache.pending_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            config.icache.exhaustion.block_timeout(),
            Some(Duration::from_millis(100))
        );
        assert_eq!(config.dcache.capacity, 16);
    }

    #[test]
    fn parses_fail_policy() {
        let config: ICacheConfig =
            toml::from_str(r#"exhaustion = "fail""#).expect("config parses");
        assert_eq!(config.exhaustion, ExhaustionPolicy::Fail);
        assert_eq!(config.exhaustion.block_timeout(), None);
    }

    #[test]
    fn rejects_dcache_smaller_than_icache() {
        let config = CacheConfig {
            icache: ICacheConfig::with_capacity(10),
            dcache: DCacheConfig { capacity: 4 },
        };
        let errors = config.validate().expect_err("should be invalid");
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("dcache.capacity"));
    }

    #[test]
    fn rejects_zero_capacity() {
        let config = CacheConfig {
            icache: ICacheConfig::with_capacity(0),
            dcache: DCacheConfig { capacity: 0 },
        };
        let errors = config.validate().expect_err("should be invalid");
        assert_eq!(errors.len(), 2);
    }
}
