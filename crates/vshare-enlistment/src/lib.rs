//! # vshare-enlistment
//!
//! Everything between an enlistment directory and the shared cache root:
//!
//! - [`CacheKeyStore`]: origin → cache key mapping, append-only, lock guarded
//! - [`RepoMetadata`]: per-enlistment key/value state
//! - [`LayoutMigrator`]: ordered disk layout upgrades
//! - [`mount::prepare`], [`clone::clone`], [`status::status`]
//! - [`repair`]: detect/fix jobs for damaged persisted state
//!
//! No process-wide state lives here. The cache root, lock policy and retry
//! policy arrive through [`EnlistmentOptions`].

pub mod cache_key;
pub mod clone;
pub mod enlistment;
pub mod error;
pub mod layout;
pub mod metadata;
pub mod mount;
pub mod records;
pub mod repair;
pub mod status;

pub use cache_key::CacheKeyStore;
pub use clone::{clone, CloneReport};
pub use enlistment::Enlistment;
pub use error::{EnlistmentError, Result};
pub use layout::{DiskLayoutVersion, LayoutMigrator, UpgradeReport};
pub use metadata::RepoMetadata;
pub use mount::{prepare, MountSession};
pub use repair::{repair_cache_root, repair_enlistment, RepairReport};
pub use status::{status, MountStatus, StatusReport};

use std::path::PathBuf;
use std::time::Duration;

use vshare_config::Config;
use vshare_lock::LockOptions;

/// Bounded retry for hydration after transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first
    pub retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Settings threaded through every operation
#[derive(Debug, Clone)]
pub struct EnlistmentOptions {
    /// Cache root used when an enlistment has none recorded yet
    pub cache_root: PathBuf,
    pub lock: LockOptions,
    pub hydration: RetryPolicy,
}

impl EnlistmentOptions {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            lock: LockOptions::default(),
            hydration: RetryPolicy::default(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_root: config.cache_root(),
            lock: LockOptions::from(&config.lock),
            hydration: RetryPolicy {
                retries: config.mount.hydration_retries,
                delay: Duration::from_millis(config.mount.hydration_retry_delay_ms),
            },
        }
    }
}
