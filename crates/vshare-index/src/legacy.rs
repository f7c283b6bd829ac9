//! Per-enlistment size store from disk layouts before 14.
//!
//! A bincode-encoded map written next to the enlistment's other private
//! databases. Nothing writes it at runtime anymore; the 13 → 14 upgrade reads
//! it into the shared [`SizeIndex`](crate::SizeIndex) and deletes it.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vshare_cas::ObjectId;

use crate::{Result, SizeIndexError};

/// File name under `<enlistment>/.vshare/databases/`
pub const LEGACY_FILE_NAME: &str = "BlobSizes";

#[derive(Debug, Default, Serialize, Deserialize)]
struct LegacySizes {
    sizes: BTreeMap<ObjectId, u64>,
}

/// Handle on a legacy size store file
#[derive(Debug, Clone)]
pub struct LegacySizeStore {
    path: PathBuf,
}

impl LegacySizeStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// `<databases dir>/BlobSizes`
    pub fn in_databases_dir<P: AsRef<Path>>(databases_dir: P) -> Self {
        Self::new(databases_dir.as_ref().join(LEGACY_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// All recorded pairs; an absent file reads as empty
    pub fn load(&self) -> Result<Vec<(ObjectId, u64)>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let legacy: LegacySizes =
            bincode::deserialize_from(BufReader::new(file)).map_err(|e| {
                SizeIndexError::CorruptLegacy {
                    path: self.path.clone(),
                    reason: e.to_string(),
                }
            })?;
        Ok(legacy.sizes.into_iter().collect())
    }

    /// Replace the file's contents
    pub fn save<I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (ObjectId, u64)>,
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let legacy = LegacySizes {
            sizes: entries.into_iter().collect(),
        };

        let tmp = self.path.with_extension(format!("{}.tmp", std::process::id()));
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            bincode::serialize_into(&mut writer, &legacy).map_err(io::Error::other)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Delete the file; already gone is fine
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
