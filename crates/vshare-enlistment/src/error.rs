use std::io;
use std::path::PathBuf;

use thiserror::Error;
use vshare_cas::CasError;
use vshare_index::SizeIndexError;
use vshare_lock::LockError;

use crate::layout::DiskLayoutVersion;

/// Errors surfaced by enlistment operations
#[derive(Error, Debug)]
pub enum EnlistmentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Cas(#[from] CasError),

    #[error(transparent)]
    SizeIndex(SizeIndexError),

    #[error("Cache index {path} is corrupt: {reason}. Run `vshare repair` or delete the file")]
    CorruptCacheIndex { path: PathBuf, reason: String },

    #[error("Size index at {path} is corrupt: {reason}. Run `vshare repair` to rebuild it")]
    CorruptSizeIndex { path: PathBuf, reason: String },

    #[error("Legacy size store {path} is unreadable: {reason}")]
    CorruptLegacySizes { path: PathBuf, reason: String },

    #[error("Repo metadata {path} is corrupt: {reason}")]
    CorruptMetadata { path: PathBuf, reason: String },

    #[error("Not a vshare enlistment: {0}")]
    NotAnEnlistment(PathBuf),

    #[error("Enlistment root already exists and is not empty: {0}")]
    AlreadyExists(PathBuf),

    #[error("Disk layout {found} is newer than this build supports (up to {supported}); upgrade vshare")]
    UnsupportedLayoutVersion {
        found: DiskLayoutVersion,
        supported: DiskLayoutVersion,
    },

    #[error("Disk layout {found} is older than {oldest} and cannot be upgraded; re-clone the enlistment")]
    LayoutTooOld {
        found: DiskLayoutVersion,
        oldest: DiskLayoutVersion,
    },

    #[error("Disk layout upgrade {from} -> {to} failed: {source}")]
    UpgradeStepFailed {
        from: DiskLayoutVersion,
        to: DiskLayoutVersion,
        #[source]
        source: Box<EnlistmentError>,
    },

    #[error("Failed to hydrate {oid} after {attempts} attempt(s): {source}")]
    Hydration {
        oid: String,
        attempts: u32,
        #[source]
        source: Box<EnlistmentError>,
    },
}

impl From<SizeIndexError> for EnlistmentError {
    fn from(err: SizeIndexError) -> Self {
        match err {
            SizeIndexError::Corrupt { path, reason } => {
                EnlistmentError::CorruptSizeIndex { path, reason }
            }
            SizeIndexError::CorruptLegacy { path, reason } => {
                EnlistmentError::CorruptLegacySizes { path, reason }
            }
            SizeIndexError::Io(e) => EnlistmentError::Io(e),
            other => EnlistmentError::SizeIndex(other),
        }
    }
}

impl EnlistmentError {
    /// Transient contention a caller may retry.
    ///
    /// Corruption and version errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            EnlistmentError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::PermissionDenied
            ),
            EnlistmentError::Lock(LockError::Timeout { .. }) => true,
            EnlistmentError::Cas(e) => e.is_transient(),
            EnlistmentError::UpgradeStepFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Persisted state is damaged and needs Repair or manual deletion
    pub fn is_corruption(&self) -> bool {
        match self {
            EnlistmentError::CorruptCacheIndex { .. }
            | EnlistmentError::CorruptSizeIndex { .. }
            | EnlistmentError::CorruptLegacySizes { .. }
            | EnlistmentError::CorruptMetadata { .. } => true,
            EnlistmentError::UpgradeStepFailed { source, .. } => source.is_corruption(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EnlistmentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupt_size_index_maps_to_distinct_variant() {
        let err: EnlistmentError = SizeIndexError::Corrupt {
            path: PathBuf::from("/cache/k/sizeIndex"),
            reason: "bad header".into(),
        }
        .into();
        assert!(matches!(err, EnlistmentError::CorruptSizeIndex { .. }));
        assert!(err.is_corruption());
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("vshare repair"));
    }

    #[test]
    fn test_step_failure_keeps_source_classification() {
        let err = EnlistmentError::UpgradeStepFailed {
            from: DiskLayoutVersion::new(13, 0),
            to: DiskLayoutVersion::new(14, 0),
            source: Box::new(EnlistmentError::Io(io::Error::from(io::ErrorKind::Interrupted))),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("13.0 -> 14.0"));
    }

    #[test]
    fn test_version_errors_are_fatal() {
        let err = EnlistmentError::UnsupportedLayoutVersion {
            found: DiskLayoutVersion::new(15, 0),
            supported: DiskLayoutVersion::new(14, 1),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_corruption());
    }
}
