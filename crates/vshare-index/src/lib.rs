//! # vshare-index
//!
//! Object-size metadata shared by every enlistment on one cache key.
//!
//! - [`SizeIndex`]: LMDB environment at `<cache root>/<key>/sizeIndex/`,
//!   multi-process readers and writers, immutable entries.
//! - [`LegacySizeStore`]: the per-enlistment bincode file used by disk
//!   layouts before 14, read once during upgrade and then deleted.

pub mod legacy;
pub mod size_index;

pub use legacy::LegacySizeStore;
pub use size_index::SizeIndex;

use std::path::PathBuf;

use thiserror::Error;

/// Size index errors
#[derive(Error, Debug)]
pub enum SizeIndexError {
    #[error("LMDB error: {0}")]
    Heed(#[from] heed::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Size index at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Legacy size store at {path} is unreadable: {reason}")]
    CorruptLegacy { path: PathBuf, reason: String },
}

impl SizeIndexError {
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            SizeIndexError::Corrupt { .. } | SizeIndexError::CorruptLegacy { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SizeIndexError>;
