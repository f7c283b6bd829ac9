//! Enlistment status report.

use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use vshare_cas::{SharedObjectStore, StoreStats};
use vshare_index::{SizeIndex, SizeIndexError};

use crate::layout::DiskLayoutVersion;
use crate::metadata::RepoMetadata;
use crate::mount::MOUNT_STATE_READY;
use crate::{Enlistment, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountStatus {
    Ready,
    NotMounted,
}

impl fmt::Display for MountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountStatus::Ready => f.write_str("Ready"),
            MountStatus::NotMounted => f.write_str("Not mounted"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub enlistment: PathBuf,
    pub mount_status: MountStatus,
    pub layout_version: DiskLayoutVersion,
    pub cache_root: Option<PathBuf>,
    pub objects_root: Option<PathBuf>,
    /// `Err` carries the reason the index could not be read
    pub size_entries: std::result::Result<u64, String>,
    /// Loose objects under the objects root, when it exists
    pub cached_objects: Option<StoreStats>,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(not set)".to_string())
        };
        writeln!(f, "Enlistment root: {}", self.enlistment.display())?;
        writeln!(f, "Mount status: {}", self.mount_status)?;
        writeln!(f, "Disk layout version: {}", self.layout_version)?;
        writeln!(f, "Local cache root: {}", show(&self.cache_root))?;
        writeln!(f, "Git objects root: {}", show(&self.objects_root))?;
        match &self.size_entries {
            Ok(n) => writeln!(f, "Size index entries: {}", n)?,
            Err(reason) => writeln!(f, "Size index entries: unavailable ({})", reason)?,
        }
        if let Some(stats) = &self.cached_objects {
            writeln!(
                f,
                "Cached objects: {} ({} bytes)",
                stats.object_count, stats.total_bytes
            )?;
        }
        Ok(())
    }
}

/// Gather the status of `enlistment`
pub fn status(enlistment: &Enlistment) -> Result<StatusReport> {
    let metadata = RepoMetadata::load(enlistment.metadata_path())?;
    let layout_version = metadata.disk_layout_version()?;

    let mount_status = match fs::read_to_string(enlistment.mount_state_path()) {
        Ok(state) if state.trim() == MOUNT_STATE_READY => MountStatus::Ready,
        Ok(_) => MountStatus::NotMounted,
        Err(e) if e.kind() == io::ErrorKind::NotFound => MountStatus::NotMounted,
        Err(e) => return Err(e.into()),
    };

    // Read only: a missing index stays missing until the next mount
    let size_entries = match metadata.blob_sizes_root() {
        Some(root) => match SizeIndex::open_existing(&root) {
            Ok(index) => index.len().map_err(|e| e.to_string()),
            Err(SizeIndexError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                Err("size index missing".to_string())
            }
            Err(e) => Err(e.to_string()),
        },
        None => Err("not recorded".to_string()),
    };

    let objects_root = metadata.git_objects_root();
    let cached_objects = match &objects_root {
        Some(root) if root.is_dir() => Some(SharedObjectStore::new(root).stats()?),
        _ => None,
    };

    Ok(StatusReport {
        enlistment: enlistment.root().to_path_buf(),
        mount_status,
        layout_version,
        cache_root: metadata.local_cache_root(),
        objects_root,
        size_entries,
        cached_objects,
    })
}
