//! LMDB-backed object-id → size index.
//!
//! LMDB serializes write transactions across processes and gives readers a
//! consistent snapshot, which is exactly the cross-process contract the
//! index needs. Entries never change once written, so lookups are memoized
//! in a per-handle `DashMap`.
//!
//! Within one process every handle on a directory shares a single
//! environment. It is closed when the last handle drops, so a later open
//! reads the files again instead of a mapping of a file that has since been
//! replaced.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::DashMap;
use heed::byteorder::BigEndian;
use heed::types::{Bytes, U64};
use heed::{Database, Env, EnvClosingEvent, EnvOpenOptions, MdbError};
use once_cell::sync::Lazy;
use vshare_cas::ObjectId;
use vshare_config::{log_index_debug, log_index_error};

use crate::{Result, SizeIndexError};

const SIZES_DB_NAME: &str = "sizes";

/// LMDB data file inside the index directory
pub const DATA_FILE_NAME: &str = "data.mdb";

/// `mm_magic` of an LMDB meta page
const META_MAGIC: u32 = 0xBEEF_C0DE;

/// Meta fields start after the page header: page number, pad, flags, bounds
const META_MAGIC_OFFSET: usize = std::mem::size_of::<usize>() + 8;

/// Two meta pages of the smallest page size LMDB uses
const MIN_DATA_FILE_LEN: u64 = 2 * 4096;

type SizesDb = Database<Bytes, U64<BigEndian>>;

#[derive(Default)]
struct Registry {
    open: HashMap<PathBuf, Weak<SharedEnv>>,
    closing: HashMap<PathBuf, EnvClosingEvent>,
}

static REGISTRY: Lazy<Mutex<Registry>> = Lazy::new(Mutex::default);

fn registry() -> MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The environment behind every handle on one directory
struct SharedEnv {
    dir: PathBuf,
    env: Env,
    sizes: SizesDb,
}

impl Drop for SharedEnv {
    fn drop(&mut self) {
        let mut registry = registry();
        if registry
            .open
            .get(&self.dir)
            .is_some_and(|weak| weak.strong_count() == 0)
        {
            registry.open.remove(&self.dir);
        }
        // The map closes once `self.env` drops right after this
        let closing = self.env.clone().prepare_for_closing();
        registry.closing.insert(self.dir.clone(), closing);
        log_index_debug!("Closing size index", path = self.dir.display().to_string());
    }
}

/// Handle on one cache key's size index
pub struct SizeIndex {
    path: PathBuf,
    shared: Arc<SharedEnv>,
    cache: Arc<DashMap<ObjectId, u64>>,
}

impl SizeIndex {
    /// Default LMDB map size: 1GB (sparse on disk)
    const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;

    /// Maximum concurrent readers across all processes
    const MAX_READERS: u32 = 128;

    /// Open or create the index at `path`, verifying every entry.
    ///
    /// Any sign of damage is reported as [`SizeIndexError::Corrupt`]. The
    /// store is never wiped here; that is Repair's job.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let index = Self::open_unchecked(path)?;
        index.verify()?;
        Ok(index)
    }

    /// Open without walking the entries. Used by writers that will not serve
    /// reads, such as migration.
    pub fn open_unchecked<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Self::acquire(path, true)
    }

    /// Open an index that already exists, for reporting.
    ///
    /// Nothing is created: a missing directory or data file is an
    /// [`io::ErrorKind::NotFound`] error.
    pub fn open_existing<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.join(DATA_FILE_NAME).is_file() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no size index at {}", path.display()),
            )
            .into());
        }
        Self::acquire(path, false)
    }

    fn acquire(path: PathBuf, create: bool) -> Result<Self> {
        let dir = path.canonicalize()?;
        let mut registry = registry();

        let shared = match registry.open.get(&dir).and_then(Weak::upgrade) {
            Some(shared) => shared,
            None => {
                if let Some(closing) = registry.closing.remove(&dir) {
                    closing.wait();
                }
                check_data_file(&path)?;
                let shared = Arc::new(open_env(&path, dir.clone(), create)?);
                registry.open.insert(dir, Arc::downgrade(&shared));
                log_index_debug!("Opened size index", path = path.display().to_string());
                shared
            }
        };

        Ok(Self {
            path,
            shared,
            cache: Arc::new(DashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk every entry and check its shape
    pub fn verify(&self) -> Result<()> {
        let rtxn = self.read_txn()?;
        let iter = self
            .shared
            .sizes
            .iter(&rtxn)
            .map_err(|e| classify(&self.path, e))?;
        for item in iter {
            let (key, _size) = item.map_err(|e| classify(&self.path, e))?;
            if key.len() != 20 {
                return Err(self.corrupt(format!("key of {} bytes", key.len())));
            }
        }
        Ok(())
    }

    /// Size of `oid`, or `None` when never recorded
    pub fn get(&self, oid: &ObjectId) -> Result<Option<u64>> {
        if let Some(size) = self.cache.get(oid) {
            return Ok(Some(*size));
        }

        let rtxn = self.read_txn()?;
        let size = self
            .shared
            .sizes
            .get(&rtxn, &oid.as_bytes()[..])
            .map_err(|e| classify(&self.path, e))?;
        if let Some(size) = size {
            self.cache.insert(*oid, size);
        }
        Ok(size)
    }

    /// Record a size. Re-recording an existing id is a no-op.
    pub fn put(&self, oid: &ObjectId, size: u64) -> Result<()> {
        self.put_batch(std::iter::once((*oid, size)))?;
        Ok(())
    }

    /// Record many sizes in one transaction; returns how many were new.
    ///
    /// Concurrent batches from different processes commute: ids already
    /// present keep their first value.
    pub fn put_batch<I>(&self, entries: I) -> Result<usize>
    where
        I: IntoIterator<Item = (ObjectId, u64)>,
    {
        let mut wtxn = self
            .shared
            .env
            .write_txn()
            .map_err(|e| classify(&self.path, e))?;
        let mut added = 0;
        let mut written = Vec::new();

        for (oid, size) in entries {
            let key = &oid.as_bytes()[..];
            let recorded = self
                .shared
                .sizes
                .get(&wtxn, key)
                .map_err(|e| classify(&self.path, e))?;
            match recorded {
                Some(existing) => {
                    if existing != size {
                        log_index_error!(
                            "Conflicting size for object, keeping recorded value",
                            oid = oid.to_hex(),
                            recorded = existing,
                            offered = size
                        );
                    }
                    written.push((oid, existing));
                }
                None => {
                    self.shared
                        .sizes
                        .put(&mut wtxn, key, &size)
                        .map_err(|e| classify(&self.path, e))?;
                    written.push((oid, size));
                    added += 1;
                }
            }
        }

        wtxn.commit().map_err(|e| classify(&self.path, e))?;
        for (oid, size) in written {
            self.cache.insert(oid, size);
        }
        Ok(added)
    }

    pub fn len(&self) -> Result<u64> {
        let rtxn = self.read_txn()?;
        Ok(self
            .shared
            .sizes
            .len(&rtxn)
            .map_err(|e| classify(&self.path, e))?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// All entries in id order
    pub fn entries(&self) -> Result<Vec<(ObjectId, u64)>> {
        let rtxn = self.read_txn()?;
        let mut entries = Vec::new();
        let iter = self
            .shared
            .sizes
            .iter(&rtxn)
            .map_err(|e| classify(&self.path, e))?;
        for item in iter {
            let (key, size) = item.map_err(|e| classify(&self.path, e))?;
            let bytes: [u8; 20] = key
                .try_into()
                .map_err(|_| self.corrupt(format!("key of {} bytes", key.len())))?;
            entries.push((ObjectId::from_bytes(bytes), size));
        }
        Ok(entries)
    }

    /// Flush to disk
    pub fn sync(&self) -> Result<()> {
        self.shared.env.force_sync().map_err(|e| classify(&self.path, e))?;
        Ok(())
    }

    fn read_txn(&self) -> Result<heed::RoTxn<'_>> {
        self.shared
            .env
            .read_txn()
            .map_err(|e| classify(&self.path, e))
    }

    fn corrupt(&self, reason: String) -> SizeIndexError {
        SizeIndexError::Corrupt {
            path: self.path.clone(),
            reason,
        }
    }
}

impl std::fmt::Debug for SizeIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeIndex")
            .field("path", &self.path)
            .field("cached", &self.cache.len())
            .finish()
    }
}

/// Whether a heed error means the on-disk environment is damaged
pub fn is_corruption(err: &heed::Error) -> bool {
    matches!(
        err,
        heed::Error::Mdb(
            MdbError::Invalid
                | MdbError::Corrupted
                | MdbError::PageNotFound
                | MdbError::VersionMismatch
                | MdbError::Incompatible
                | MdbError::BadValSize
        ) | heed::Error::Decoding(_)
    )
}

/// Reject a data file LMDB would map without validating.
///
/// An empty file is a fresh environment and passes.
fn check_data_file(dir: &Path) -> Result<()> {
    let data_file = dir.join(DATA_FILE_NAME);
    let mut file = match File::open(&data_file) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(());
    }

    let corrupt = |reason: String| {
        log_index_error!(
            "Size index failed integrity check",
            path = dir.display().to_string(),
            error = reason.clone()
        );
        SizeIndexError::Corrupt {
            path: dir.to_path_buf(),
            reason,
        }
    };
    if len < MIN_DATA_FILE_LEN {
        return Err(corrupt(format!("data file is only {} bytes", len)));
    }
    let mut header = [0u8; META_MAGIC_OFFSET + 4];
    file.read_exact(&mut header)?;
    let mut magic = [0u8; 4];
    magic.copy_from_slice(&header[META_MAGIC_OFFSET..]);
    let magic = u32::from_ne_bytes(magic);
    if magic != META_MAGIC {
        return Err(corrupt(format!("bad meta page magic {:#010x}", magic)));
    }
    Ok(())
}

fn open_env(path: &Path, dir: PathBuf, create: bool) -> Result<SharedEnv> {
    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(SizeIndex::DEFAULT_MAP_SIZE)
            .max_readers(SizeIndex::MAX_READERS)
            .max_dbs(1)
            .open(path)
    }
    .map_err(|e| classify(path, e))?;

    match open_sizes_db(path, &env, create) {
        Ok(sizes) => Ok(SharedEnv { dir, env, sizes }),
        Err(e) => {
            env.prepare_for_closing().wait();
            Err(e)
        }
    }
}

fn open_sizes_db(path: &Path, env: &Env, create: bool) -> Result<SizesDb> {
    if create {
        let mut wtxn = env.write_txn().map_err(|e| classify(path, e))?;
        let sizes = env
            .create_database(&mut wtxn, Some(SIZES_DB_NAME))
            .map_err(|e| classify(path, e))?;
        wtxn.commit().map_err(|e| classify(path, e))?;
        return Ok(sizes);
    }

    let rtxn = env.read_txn().map_err(|e| classify(path, e))?;
    let sizes = env
        .open_database(&rtxn, Some(SIZES_DB_NAME))
        .map_err(|e| classify(path, e))?;
    rtxn.commit().map_err(|e| classify(path, e))?;
    sizes.ok_or_else(|| SizeIndexError::Corrupt {
        path: path.to_path_buf(),
        reason: format!("no {} database", SIZES_DB_NAME),
    })
}

fn classify(path: &Path, err: heed::Error) -> SizeIndexError {
    if is_corruption(&err) {
        log_index_error!(
            "Size index failed integrity check",
            path = path.display().to_string(),
            error = err.to_string()
        );
        SizeIndexError::Corrupt {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    } else {
        SizeIndexError::Heed(err)
    }
}
