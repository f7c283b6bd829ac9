//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary shared cache root
//! - Any number of enlistment directories next to it
//! - A `Config` pointing at both with short lock timeouts
//!
//! # Usage
//!
//! ```ignore
//! use vshare_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new().unwrap();
//! let first = env.enlistment_root("first");
//! let second = env.enlistment_root("second");
//! // both clone against env.cache_root
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with a private cache root and enlistment area
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Parent of the cache root, so tests can delete and recreate the root
    pub cache_parent: PathBuf,
    /// Isolated shared cache root
    pub cache_root: PathBuf,
    /// Directory that enlistments are created under
    pub enlistments_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;

        let cache_parent = root.join(format!("cache-parent-{}", test_id));
        let cache_root = cache_parent.join(".customVshareCache");
        let enlistments_dir = root.join("enlistments");

        std::fs::create_dir_all(&cache_root)?;
        std::fs::create_dir_all(&enlistments_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            cache_parent,
            cache_root,
            enlistments_dir,
            test_id,
        })
    }

    /// Path for a named enlistment (not created)
    pub fn enlistment_root(&self, name: &str) -> PathBuf {
        self.enlistments_dir.join(name)
    }

    /// Config pointing at this environment's cache root.
    ///
    /// Lock timeouts are shortened so contention bugs fail fast in tests.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.cache.root = self.cache_root.clone();
        cfg.lock.timeout_ms = 10_000;
        cfg.lock.initial_backoff_ms = 5;
        cfg.lock.max_backoff_ms = 50;
        cfg.mount.hydration_retry_delay_ms = 10;
        cfg
    }

    /// List every file under the cache root, sorted
    pub fn cache_files(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if !self.cache_root.exists() {
            return Ok(files);
        }
        for entry in WalkDir::new(&self.cache_root).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_dir() {
                files.push(entry.into_path());
            }
        }
        Ok(files)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.cache_root.exists());
        assert!(env.enlistments_dir.exists());
        assert!(env.cache_root.starts_with(&env.cache_parent));
    }

    #[test]
    fn test_environment_roots_are_unique() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.cache_root, env2.cache_root);
    }

    #[test]
    fn test_config_points_at_cache_root() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config();
        assert_eq!(cfg.cache_root(), env.cache_root);
    }

    #[test]
    fn test_cache_files_lists_nested() {
        let env = TestEnvironment::new().unwrap();
        std::fs::create_dir_all(env.cache_root.join("a/b")).unwrap();
        std::fs::write(env.cache_root.join("a/b/file"), b"x").unwrap();
        std::fs::write(env.cache_root.join("top"), b"y").unwrap();
        let files = env.cache_files().unwrap();
        assert_eq!(files.len(), 2);
    }
}
