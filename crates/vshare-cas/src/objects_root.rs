//! Derivation and (re)creation of per-key object roots.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{CacheKey, CasError, Result};

/// Directory under `<cache root>/<key>/` holding git objects
pub const OBJECTS_DIR_NAME: &str = "gitObjects";

/// Directory under `<cache root>/<key>/` holding the SizeIndex environment
pub const SIZE_INDEX_DIR_NAME: &str = "sizeIndex";

/// Maps cache keys to directories inside one cache root
#[derive(Debug, Clone)]
pub struct ObjectsRootManager {
    cache_root: PathBuf,
}

impl ObjectsRootManager {
    /// The cache root is made absolute so derived paths can be persisted.
    pub fn new<P: AsRef<Path>>(cache_root: P) -> Result<Self> {
        let cache_root = std::path::absolute(cache_root.as_ref())?;
        Ok(Self { cache_root })
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// `<cache root>/<key>`
    pub fn key_dir(&self, key: &CacheKey) -> PathBuf {
        self.cache_root.join(key.as_str())
    }

    /// `<cache root>/<key>/gitObjects`, whether or not it exists
    pub fn objects_root_for(&self, key: &CacheKey) -> PathBuf {
        self.key_dir(key).join(OBJECTS_DIR_NAME)
    }

    /// `<cache root>/<key>/sizeIndex`, whether or not it exists
    pub fn size_index_root_for(&self, key: &CacheKey) -> PathBuf {
        self.key_dir(key).join(SIZE_INDEX_DIR_NAME)
    }

    /// Create the ObjectsRoot for `key` if absent and return its path.
    ///
    /// Safe to call from many processes at once: a concurrent creator winning
    /// the race is success, not an error.
    pub fn ensure_objects_root(&self, key: &CacheKey) -> Result<PathBuf> {
        let root = self.objects_root_for(key);
        create_dir_racy(&root.join("pack"))?;
        if root.exists() && !root.is_dir() {
            return Err(CasError::NotADirectory(root));
        }
        debug!("Objects root ready at {:?}", root);
        Ok(root)
    }

    /// Recover the cache key from an ObjectsRoot path produced by this layout
    pub fn key_from_objects_root(objects_root: &Path) -> Option<CacheKey> {
        if objects_root.file_name()?.to_str()? != OBJECTS_DIR_NAME {
            return None;
        }
        let key = objects_root.parent()?.file_name()?.to_str()?;
        CacheKey::parse(key).ok()
    }

    /// Sibling SizeIndex directory for a persisted ObjectsRoot path
    pub fn size_index_root_beside(objects_root: &Path) -> Option<PathBuf> {
        objects_root.parent().map(|p| p.join(SIZE_INDEX_DIR_NAME))
    }
}

/// `create_dir_all` that tolerates the tree being created or briefly removed
/// by another process between our checks.
pub(crate) fn create_dir_racy(path: &Path) -> io::Result<()> {
    const ATTEMPTS: usize = 3;
    let mut last_err = None;
    for _ in 0..ATTEMPTS {
        match fs::create_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::NotFound)))
}
