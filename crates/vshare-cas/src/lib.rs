//! # vshare-cas
//!
//! Shared object storage for enlistments of the same origin.
//!
//! ## Directory Layout
//!
//! ```text
//! <cache root>/
//! └── <cache key>/            # 32 hex chars, one per origin
//!     ├── gitObjects/         # ObjectsRoot, referenced by every alternates file
//!     │   ├── pack/
//!     │   └── ab/
//!     │       └── cdef0123...  # loose object, remaining 38 hex chars
//!     └── sizeIndex/          # SizeIndex environment (vshare-index)
//! ```
//!
//! Enlistments never own anything in here. They point at an ObjectsRoot via
//! `.git/objects/info/alternates` (see [`alternates`]).

pub mod alternates;
pub mod objects_root;
pub mod store;

pub use alternates::{alternates_path, read_alternates, write_alternates};
pub use objects_root::{ObjectsRootManager, OBJECTS_DIR_NAME, SIZE_INDEX_DIR_NAME};
pub use store::{ObjectFetcher, SharedObjectStore, StoreStats};

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Errors that can occur during shared object operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Object not found: {oid}")]
    NotFound { oid: String },

    #[error("Size mismatch for {oid}: expected {expected} bytes, found {actual}")]
    SizeMismatch {
        oid: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid object id: {0:?}")]
    InvalidObjectId(String),

    #[error("Invalid cache key: {0:?}")]
    InvalidCacheKey(String),

    #[error("Fetch failed for {oid}: {source}")]
    Fetch {
        oid: String,
        #[source]
        source: io::Error,
    },

    #[error("Objects root is not a directory: {0}")]
    NotADirectory(PathBuf),
}

impl CasError {
    /// Failures a caller can retry: the object or its directory vanished
    /// underneath a read, or the filesystem reported momentary contention.
    pub fn is_transient(&self) -> bool {
        match self {
            CasError::NotFound { .. } | CasError::Fetch { .. } => true,
            CasError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::NotFound
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, CasError>;

/// 160-bit content hash identifying a git object
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 20]);

impl ObjectId {
    pub const HEX_LEN: usize = 40;

    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != Self::HEX_LEN {
            return Err(CasError::InvalidObjectId(s.to_string()));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| CasError::InvalidObjectId(s.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl FromStr for ObjectId {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Opaque 128-bit key naming one origin's slot in a cache root.
///
/// Rendered as 32 lowercase hex characters; that string is the directory name.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// A fresh random key
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn parse(s: &str) -> Result<Self> {
        let valid = s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(CasError::InvalidCacheKey(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.0)
    }
}

impl FromStr for CacheKey {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
