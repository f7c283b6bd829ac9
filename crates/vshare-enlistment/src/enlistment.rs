//! Enlistment directory layout.
//!
//! ```text
//! <root>/
//! ├── .vshare/
//! │   ├── RepoMetadata.dat
//! │   ├── MountState
//! │   ├── databases/BlobSizes      # legacy, layouts < 14
//! │   └── gitObjectCache/          # legacy, layouts < 13
//! └── src/
//!     └── .git/objects/info/alternates
//! ```

use std::path::{Path, PathBuf};

use vshare_index::LegacySizeStore;

pub const DOT_DIR_NAME: &str = ".vshare";
pub const METADATA_FILE_NAME: &str = "RepoMetadata.dat";
pub const MOUNT_STATE_FILE_NAME: &str = "MountState";
pub const DATABASES_DIR_NAME: &str = "databases";
pub const LEGACY_OBJECTS_DIR_NAME: &str = "gitObjectCache";
pub const WORKING_DIR_NAME: &str = "src";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enlistment {
    root: PathBuf,
}

impl Enlistment {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dot_dir(&self) -> PathBuf {
        self.root.join(DOT_DIR_NAME)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dot_dir().join(METADATA_FILE_NAME)
    }

    pub fn mount_state_path(&self) -> PathBuf {
        self.dot_dir().join(MOUNT_STATE_FILE_NAME)
    }

    pub fn databases_dir(&self) -> PathBuf {
        self.dot_dir().join(DATABASES_DIR_NAME)
    }

    pub fn legacy_objects_dir(&self) -> PathBuf {
        self.dot_dir().join(LEGACY_OBJECTS_DIR_NAME)
    }

    pub fn legacy_size_store(&self) -> LegacySizeStore {
        LegacySizeStore::in_databases_dir(self.databases_dir())
    }

    pub fn working_dir(&self) -> PathBuf {
        self.root.join(WORKING_DIR_NAME)
    }

    pub fn git_dir(&self) -> PathBuf {
        self.working_dir().join(".git")
    }

    /// Has enlistment metadata on disk
    pub fn exists(&self) -> bool {
        self.metadata_path().is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let e = Enlistment::new("/work/repo");
        assert_eq!(e.metadata_path(), PathBuf::from("/work/repo/.vshare/RepoMetadata.dat"));
        assert_eq!(e.git_dir(), PathBuf::from("/work/repo/src/.git"));
        assert_eq!(
            e.legacy_size_store().path(),
            Path::new("/work/repo/.vshare/databases/BlobSizes")
        );
        assert!(!e.exists());
    }
}
