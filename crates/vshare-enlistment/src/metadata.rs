//! Per-enlistment key/value state in `.vshare/RepoMetadata.dat`.
//!
//! Only the owning enlistment writes this file, so it is rewritten whole
//! (temp file + rename) rather than appended to. Any line that fails to
//! parse, torn or not, makes the metadata corrupt.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use vshare_config::path::persisted_form;

use crate::layout::DiskLayoutVersion;
use crate::records::{self, Record};
use crate::{EnlistmentError, Result};

pub mod keys {
    pub const DISK_LAYOUT_VERSION: &str = "DiskLayoutVersion";
    pub const DISK_LAYOUT_MINOR_VERSION: &str = "DiskLayoutMinorVersion";
    pub const LOCAL_CACHE_ROOT: &str = "LocalCacheRoot";
    pub const GIT_OBJECTS_ROOT: &str = "GitObjectsRoot";
    pub const BLOB_SIZES_ROOT: &str = "BlobSizesRoot";
    pub const ENLISTMENT_ID: &str = "EnlistmentId";
    pub const ORIGIN_URL: &str = "OriginUrl";
}

#[derive(Debug, Clone)]
pub struct RepoMetadata {
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl RepoMetadata {
    /// Empty metadata that will be written to `path` on [`save`](Self::save)
    pub fn create<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            values: BTreeMap::new(),
        }
    }

    /// Read existing metadata. A missing file means there is no enlistment.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let root = path
                    .parent()
                    .and_then(Path::parent)
                    .unwrap_or(&path)
                    .to_path_buf();
                return Err(EnlistmentError::NotAnEnlistment(root));
            }
            Err(e) => return Err(e.into()),
        };

        let parsed = records::parse(&contents).map_err(|e| EnlistmentError::CorruptMetadata {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        if parsed.torn_tail {
            return Err(EnlistmentError::CorruptMetadata {
                path,
                reason: "truncated final record".to_string(),
            });
        }

        Ok(Self {
            values: parsed.to_map(),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Atomically replace the file with the current values
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension(format!("{}.tmp", std::process::id()));
        let written = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            for (key, value) in &self.values {
                file.write_all(Record::add(key.as_str(), value.as_str()).render().as_bytes())?;
            }
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Persisted layout version; required on every enlistment
    pub fn disk_layout_version(&self) -> Result<DiskLayoutVersion> {
        let major = self
            .get(keys::DISK_LAYOUT_VERSION)
            .ok_or_else(|| self.corrupt("missing DiskLayoutVersion"))?;
        let major = major
            .trim()
            .parse()
            .map_err(|_| self.corrupt(format!("DiskLayoutVersion {:?} is not an integer", major)))?;
        let minor = match self.get(keys::DISK_LAYOUT_MINOR_VERSION) {
            Some(minor) => minor.trim().parse().map_err(|_| {
                self.corrupt(format!("DiskLayoutMinorVersion {:?} is not an integer", minor))
            })?,
            None => 0,
        };
        Ok(DiskLayoutVersion::new(major, minor))
    }

    pub fn set_disk_layout_version(&mut self, version: DiskLayoutVersion) {
        self.set(keys::DISK_LAYOUT_VERSION, version.major.to_string());
        self.set(keys::DISK_LAYOUT_MINOR_VERSION, version.minor.to_string());
    }

    pub fn local_cache_root(&self) -> Option<PathBuf> {
        self.get(keys::LOCAL_CACHE_ROOT).map(PathBuf::from)
    }

    pub fn set_local_cache_root(&mut self, path: &Path) {
        self.set(keys::LOCAL_CACHE_ROOT, persisted_form(path));
    }

    pub fn git_objects_root(&self) -> Option<PathBuf> {
        self.get(keys::GIT_OBJECTS_ROOT).map(PathBuf::from)
    }

    pub fn set_git_objects_root(&mut self, path: &Path) {
        self.set(keys::GIT_OBJECTS_ROOT, persisted_form(path));
    }

    pub fn blob_sizes_root(&self) -> Option<PathBuf> {
        self.get(keys::BLOB_SIZES_ROOT).map(PathBuf::from)
    }

    pub fn set_blob_sizes_root(&mut self, path: &Path) {
        self.set(keys::BLOB_SIZES_ROOT, persisted_form(path));
    }

    pub fn enlistment_id(&self) -> Option<&str> {
        self.get(keys::ENLISTMENT_ID)
    }

    pub fn origin_url(&self) -> Option<&str> {
        self.get(keys::ORIGIN_URL)
    }

    /// `GitObjectsRoot`, or a corruption error naming the missing key
    pub fn require_git_objects_root(&self) -> Result<PathBuf> {
        self.git_objects_root()
            .ok_or_else(|| self.corrupt("missing GitObjectsRoot"))
    }

    pub fn require_origin_url(&self) -> Result<String> {
        self.origin_url()
            .map(str::to_string)
            .ok_or_else(|| self.corrupt("missing OriginUrl"))
    }

    pub(crate) fn corrupt(&self, reason: impl Into<String>) -> EnlistmentError {
        EnlistmentError::CorruptMetadata {
            path: self.path.clone(),
            reason: reason.into(),
        }
    }
}
