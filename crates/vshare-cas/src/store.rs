//! Loose object storage inside an ObjectsRoot.
//!
//! Objects are stored uncompressed under a git-style 2-char fan-out
//! (`ab/cdef...`). Writes go through a temp file and a rename so a reader
//! never sees a partially written object, and two writers racing on the same
//! id both succeed with identical content.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};
use walkdir::WalkDir;

use crate::objects_root::create_dir_racy;
use crate::{CasError, ObjectId, Result};

/// Source of object bytes for ids missing from the shared store.
///
/// Implemented by the transport layer; the store only decides *whether* to
/// fetch.
pub trait ObjectFetcher: Send + Sync {
    fn fetch(&self, oid: &ObjectId) -> io::Result<Vec<u8>>;
}

/// Loose objects under one ObjectsRoot
#[derive(Debug, Clone)]
pub struct SharedObjectStore {
    root: PathBuf,
}

/// Counts gathered by [`SharedObjectStore::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub object_count: u64,
    pub total_bytes: u64,
}

impl SharedObjectStore {
    /// Open a store rooted at an ObjectsRoot. Nothing is created until the
    /// first write.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/ab/cdef...`
    pub fn object_path(&self, oid: &ObjectId) -> PathBuf {
        let hex = oid.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    pub fn contains(&self, oid: &ObjectId) -> bool {
        self.object_path(oid).is_file()
    }

    /// Store `data` under `oid`. Returns `false` when the object was already
    /// present.
    ///
    /// Missing parent directories, including the ObjectsRoot itself, are
    /// recreated.
    #[instrument(skip(self, data), level = "debug")]
    pub fn write(&self, oid: &ObjectId, data: &[u8]) -> Result<bool> {
        let path = self.object_path(oid);
        if path.exists() {
            return Ok(false);
        }

        if let Some(parent) = path.parent() {
            create_dir_racy(parent)?;
        }

        let temp_name = format!(
            "{}.{}.{:?}.tmp",
            oid.to_hex(),
            std::process::id(),
            std::thread::current().id()
        );
        let temp_path = path.with_file_name(temp_name);

        let written = (|| -> io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(CasError::Io(e));
        }

        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            // Another writer got there first with the same content
            if path.exists() {
                return Ok(false);
            }
            return Err(CasError::Io(e));
        }

        Ok(true)
    }

    /// Read an object, checking its length against `expected_size` when known.
    ///
    /// A length mismatch is reported instead of serving the bytes.
    #[instrument(skip(self), level = "debug")]
    pub fn read(&self, oid: &ObjectId, expected_size: Option<u64>) -> Result<Vec<u8>> {
        let path = self.object_path(oid);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CasError::NotFound { oid: oid.to_hex() })
            }
            Err(e) => return Err(CasError::Io(e)),
        };

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if let Some(expected) = expected_size {
            let actual = data.len() as u64;
            if actual != expected {
                return Err(CasError::SizeMismatch {
                    oid: oid.to_hex(),
                    expected,
                    actual,
                });
            }
        }
        Ok(data)
    }

    /// Length of a stored object without reading it
    pub fn size_of(&self, oid: &ObjectId) -> Result<u64> {
        match fs::metadata(self.object_path(oid)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(CasError::NotFound { oid: oid.to_hex() })
            }
            Err(e) => Err(CasError::Io(e)),
        }
    }

    /// Make sure `oid` is present, fetching it if not.
    ///
    /// Returns the object's size and whether a download happened.
    pub fn ensure_object(&self, oid: &ObjectId, fetcher: &dyn ObjectFetcher) -> Result<(u64, bool)> {
        if let Ok(size) = self.size_of(oid) {
            return Ok((size, false));
        }

        let data = fetcher.fetch(oid).map_err(|source| CasError::Fetch {
            oid: oid.to_hex(),
            source,
        })?;
        let downloaded = self.write(oid, &data)?;
        debug!("Fetched {} ({} bytes, new={})", oid, data.len(), downloaded);
        Ok((data.len() as u64, true))
    }

    /// Every loose object with its on-disk size.
    ///
    /// Files that disappear during the walk are skipped.
    pub fn list(&self) -> Result<Vec<(ObjectId, u64)>> {
        let mut objects = Vec::new();
        if !self.root.exists() {
            return Ok(objects);
        }

        for entry in WalkDir::new(&self.root).min_depth(2).max_depth(2) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                    continue
                }
                Err(e) => return Err(CasError::Io(e.into())),
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(oid) = loose_object_id(entry.path()) else {
                continue;
            };
            match entry.metadata() {
                Ok(meta) => objects.push((oid, meta.len())),
                Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {}
                Err(e) => return Err(CasError::Io(e.into())),
            }
        }
        objects.sort();
        Ok(objects)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let objects = self.list()?;
        Ok(StoreStats {
            object_count: objects.len() as u64,
            total_bytes: objects.iter().map(|(_, size)| size).sum(),
        })
    }
}

/// A local store can stand in for an origin, e.g. a directory of loose
/// objects exported from another machine.
impl ObjectFetcher for SharedObjectStore {
    fn fetch(&self, oid: &ObjectId) -> io::Result<Vec<u8>> {
        match self.read(oid, None) {
            Ok(data) => Ok(data),
            Err(CasError::Io(e)) => Err(e),
            Err(e) => Err(io::Error::new(io::ErrorKind::NotFound, e.to_string())),
        }
    }
}

/// Parse `<root>/ab/cdef...` back into an id; temp files and packs are ignored.
fn loose_object_id(path: &Path) -> Option<ObjectId> {
    let name = path.file_name()?.to_str()?;
    let prefix = path.parent()?.file_name()?.to_str()?;
    if prefix.len() != 2 || name.len() != ObjectId::HEX_LEN - 2 {
        return None;
    }
    ObjectId::from_hex(&format!("{}{}", prefix, name)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn oid(fill: char) -> ObjectId {
        ObjectId::from_hex(&fill.to_string().repeat(40)).unwrap()
    }

    struct CountingFetcher {
        calls: AtomicUsize,
    }

    impl ObjectFetcher for CountingFetcher {
        fn fetch(&self, oid: &ObjectId) -> io::Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(oid.to_hex().into_bytes())
        }
    }

    #[test]
    fn test_fanout_path_format() {
        let store = SharedObjectStore::new("/objects");
        let id = ObjectId::from_hex("b407df4e21261e2bf022ef7031fabcf21ee0e14d").unwrap();
        assert_eq!(
            store.object_path(&id),
            PathBuf::from("/objects/b4/07df4e21261e2bf022ef7031fabcf21ee0e14d")
        );
    }

    #[test]
    fn test_write_and_read() {
        let temp = TempDir::new().unwrap();
        let store = SharedObjectStore::new(temp.path().join("gitObjects"));

        assert!(store.write(&oid('1'), b"hello").unwrap());
        assert!(!store.write(&oid('1'), b"hello").unwrap());
        assert_eq!(store.read(&oid('1'), Some(5)).unwrap(), b"hello");
        assert_eq!(store.read(&oid('1'), None).unwrap(), b"hello");
    }

    #[test]
    fn test_read_refuses_wrong_size() {
        let temp = TempDir::new().unwrap();
        let store = SharedObjectStore::new(temp.path());
        store.write(&oid('2'), b"truncated").unwrap();

        match store.read(&oid('2'), Some(100)) {
            Err(CasError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 100);
                assert_eq!(actual, 9);
            }
            other => panic!("expected size mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_object_is_transient() {
        let temp = TempDir::new().unwrap();
        let store = SharedObjectStore::new(temp.path().join("gone"));
        let err = store.read(&oid('3'), None).unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_write_recreates_deleted_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("gitObjects");
        let store = SharedObjectStore::new(&root);

        store.write(&oid('4'), b"a").unwrap();
        fs::remove_dir_all(&root).unwrap();
        assert!(store.write(&oid('5'), b"b").unwrap());
        assert!(store.contains(&oid('5')));
    }

    #[test]
    fn test_ensure_object_fetches_once() {
        let temp = TempDir::new().unwrap();
        let store = SharedObjectStore::new(temp.path());
        let fetcher = CountingFetcher {
            calls: AtomicUsize::new(0),
        };

        let (size, fetched) = store.ensure_object(&oid('6'), &fetcher).unwrap();
        assert!(fetched);
        assert_eq!(size, 40);
        let (size, fetched) = store.ensure_object(&oid('6'), &fetcher).unwrap();
        assert!(!fetched);
        assert_eq!(size, 40);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_list_skips_temp_and_pack_files() {
        let temp = TempDir::new().unwrap();
        let store = SharedObjectStore::new(temp.path());
        store.write(&oid('7'), b"seven").unwrap();
        store.write(&oid('8'), b"eight!").unwrap();
        fs::create_dir_all(temp.path().join("pack")).unwrap();
        fs::write(temp.path().join("pack").join("pack-1.idx"), b"x").unwrap();
        fs::write(temp.path().join("77").join("junk.tmp"), b"x").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![(oid('7'), 5), (oid('8'), 6)]);
        assert_eq!(
            store.stats().unwrap(),
            StoreStats {
                object_count: 2,
                total_bytes: 11
            }
        );
    }

    #[test]
    fn test_store_serves_as_fetcher() {
        let origin_dir = TempDir::new().unwrap();
        let cache_dir = TempDir::new().unwrap();
        let origin = SharedObjectStore::new(origin_dir.path());
        let cache = SharedObjectStore::new(cache_dir.path());

        origin.write(&oid('c'), b"from origin").unwrap();
        assert_eq!(cache.ensure_object(&oid('c'), &origin).unwrap(), (11, true));
        assert_eq!(cache.read(&oid('c'), Some(11)).unwrap(), b"from origin");

        let err = origin.fetch(&oid('d')).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
