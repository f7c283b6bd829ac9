//! # vshare-config
//!
//! Configuration management for vshare.
//!
//! Loads configuration from:
//! 1. `~/.vshare/config.toml` (global)
//! 2. `.vshare/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! There is no process-wide config instance. The binary loads a [`Config`]
//! once at startup and threads it through every component call, so tests can
//! run several simulated cache roots side by side in one process.

pub mod logging;
pub mod path;
pub mod testing;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default shared cache root, relative to the home directory.
pub const DEFAULT_CACHE_ROOT: &str = "~/.vshare/cache";

/// Environment variable overriding `[cache] root`.
pub const ENV_CACHE_ROOT: &str = "VSHARE_CACHE_ROOT";

/// Environment variable overriding `[lock] timeout_ms` (in seconds).
pub const ENV_LOCK_TIMEOUT: &str = "VSHARE_LOCK_TIMEOUT";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub lock: LockConfig,
    pub mount: MountConfig,
}

impl Config {
    /// Load config from standard locations, relative to the current directory.
    pub fn load() -> Result<Self, ConfigError> {
        let project = std::env::current_dir()?.join(".vshare/config.toml");
        let mut config = Self::load_from(Self::global_config_path().as_deref(), Some(&project))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load config from explicit global and project files, without env overrides.
    ///
    /// Missing files are skipped.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = global {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        if let Some(project_path) = project {
            if project_path.exists() {
                debug!("Loading project config from {:?}", project_path);
                let contents = std::fs::read_to_string(project_path)?;
                let project_config: PartialConfig = toml::from_str(&contents)?;
                config.merge(project_config);
            }
        }

        Ok(config)
    }

    /// Global config path: ~/.vshare/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".vshare/config.toml"))
    }

    /// Project values replace global ones only where the project file sets them.
    fn merge(&mut self, other: PartialConfig) {
        if let Some(cache) = other.cache {
            if let Some(root) = cache.root {
                self.cache.root = root;
            }
        }
        if let Some(lock) = other.lock {
            if let Some(v) = lock.timeout_ms {
                self.lock.timeout_ms = v;
            }
            if let Some(v) = lock.initial_backoff_ms {
                self.lock.initial_backoff_ms = v;
            }
            if let Some(v) = lock.max_backoff_ms {
                self.lock.max_backoff_ms = v;
            }
        }
        if let Some(mount) = other.mount {
            if let Some(v) = mount.hydration_retries {
                self.mount.hydration_retries = v;
            }
            if let Some(v) = mount.hydration_retry_delay_ms {
                self.mount.hydration_retry_delay_ms = v;
            }
        }
    }

    /// Apply environment variable overrides using the given lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_CACHE_ROOT) {
            self.cache.root = PathBuf::from(root);
        }
        if let Some(secs) = lookup(ENV_LOCK_TIMEOUT).and_then(|s| s.parse::<u64>().ok()) {
            self.lock.timeout_ms = secs.saturating_mul(1000);
        }
    }

    /// The configured cache root with `~` expanded.
    pub fn cache_root(&self) -> PathBuf {
        path::expand_tilde(&self.cache.root)
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Shared cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory holding the mapping store and per-key object roots
    pub root: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_CACHE_ROOT),
        }
    }
}

/// Lock contention policy for the mapping-store lock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Give up acquiring after this long
    pub timeout_ms: u64,
    /// First sleep between attempts
    pub initial_backoff_ms: u64,
    /// Upper bound for the doubling backoff
    pub max_backoff_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            initial_backoff_ms: 25,
            max_backoff_ms: 500,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Hydration retry policy used while mounted
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Extra attempts after a transient hydration failure
    pub hydration_retries: u32,
    /// Fixed delay between hydration attempts
    pub hydration_retry_delay_ms: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            hydration_retries: 3,
            hydration_retry_delay_ms: 100,
        }
    }
}

/// Project-level overlay: every field optional so unset keys keep the global value.
#[derive(Debug, Default, Deserialize)]
struct PartialConfig {
    cache: Option<PartialCache>,
    lock: Option<PartialLock>,
    mount: Option<PartialMount>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialCache {
    root: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialLock {
    timeout_ms: Option<u64>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct PartialMount {
    hydration_retries: Option<u32>,
    hydration_retry_delay_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.cache.root, PathBuf::from(DEFAULT_CACHE_ROOT));
        assert_eq!(config.lock.timeout_ms, 30_000);
        assert!(config.lock.initial_backoff_ms <= config.lock.max_backoff_ms);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("[lock]"));
        assert!(toml_str.contains("[mount]"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env_overrides(|key| match key {
            ENV_CACHE_ROOT => Some("/srv/cache".to_string()),
            ENV_LOCK_TIMEOUT => Some("5".to_string()),
            _ => None,
        });
        assert_eq!(config.cache.root, PathBuf::from("/srv/cache"));
        assert_eq!(config.lock.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_env_override_ignores_garbage_timeout() {
        let mut config = Config::default();
        config.apply_env_overrides(|key| (key == ENV_LOCK_TIMEOUT).then(|| "soon".to_string()));
        assert_eq!(config.lock.timeout_ms, 30_000);
    }

    #[test]
    fn test_cache_root_expands_home() {
        let config = Config::default();
        let root = config.cache_root();
        if dirs::home_dir().is_some() {
            assert!(!root.starts_with("~"));
            assert!(root.ends_with(".vshare/cache"));
        }
    }
}
