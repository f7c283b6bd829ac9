//! Origin → cache key mapping for one cache root.
//!
//! The store is an append-only record file at `<cache root>/mapping-store`.
//! Lookups read it without locking; any mutation happens under
//! `mapping-store.lock`. Entries are never rewritten once appended, so an
//! unlocked reader sees either no entry for an origin or a complete one.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use vshare_cas::CacheKey;
use vshare_config::{log_cache_debug, log_cache_info, log_cache_warn};
use vshare_lock::{LockCoordinator, LockGuard, LockOptions};

use crate::records::{self, Parsed, Record};
use crate::{EnlistmentError, Result};

pub const MAPPING_FILE_NAME: &str = "mapping-store";

#[derive(Debug)]
pub struct CacheKeyStore {
    cache_root: PathBuf,
    path: PathBuf,
    lock: LockCoordinator,
}

impl CacheKeyStore {
    pub fn new<P: AsRef<Path>>(cache_root: P, lock: LockOptions) -> Self {
        let cache_root = cache_root.as_ref().to_path_buf();
        let path = cache_root.join(MAPPING_FILE_NAME);
        let lock = LockCoordinator::for_resource(&path, lock);
        Self {
            cache_root,
            path,
            lock,
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        self.lock.path()
    }

    /// Take the mapping-store lock, creating the cache root if needed
    pub fn lock(&self, purpose: &str) -> Result<LockGuard> {
        fs::create_dir_all(&self.cache_root)?;
        Ok(self.lock.acquire(purpose)?)
    }

    /// Key for `origin`, without taking the lock
    pub fn lookup(&self, origin: &str) -> Result<Option<CacheKey>> {
        Ok(self.entries()?.remove(origin))
    }

    /// Every mapped origin
    pub fn entries(&self) -> Result<BTreeMap<String, CacheKey>> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let parsed = self.parse(&contents)?;
        self.to_keys(&parsed)
    }

    /// Key for `origin`, creating and persisting a fresh one on first use.
    ///
    /// A miss is re-checked under the lock so racing enlistments agree on a
    /// single key.
    pub fn resolve_or_create(&self, origin: &str) -> Result<CacheKey> {
        if let Some(key) = self.lookup(origin)? {
            log_cache_debug!("Cache key found", origin = origin, key = key.as_str());
            return Ok(key);
        }

        let guard = self.lock(&format!("resolve cache key for {}", origin))?;
        let key = self.resolve_locked(&guard, origin)?;
        guard.release()?;
        Ok(key)
    }

    /// Lookup-or-create for a caller already holding the lock
    pub fn resolve_locked(&self, guard: &LockGuard, origin: &str) -> Result<CacheKey> {
        if let Some(key) = self.lookup(origin)? {
            return Ok(key);
        }

        let key = CacheKey::generate();
        self.append(guard, origin, &key)?;

        log_cache_info!(
            "Created cache key",
            origin = origin,
            key = key.as_str(),
            cache_root = self.cache_root.display().to_string()
        );
        Ok(key)
    }

    /// Append one mapping. The guard proves the caller holds the lock.
    pub fn append(&self, _guard: &LockGuard, origin: &str, key: &CacheKey) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        let mut contents = Vec::new();
        file.read_to_end(&mut contents)?;
        let parsed = self.parse(&contents)?;
        if parsed.torn_tail {
            log_cache_warn!(
                "Dropping torn record from interrupted writer",
                path = self.path.display().to_string(),
                bytes = (contents.len() - parsed.complete_len) as u64
            );
            file.set_len(parsed.complete_len as u64)?;
        }

        file.seek(SeekFrom::End(0))?;
        file.write_all(Record::add(origin, key.as_str()).render().as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Complete, well-formed entries only; damaged lines are skipped
    pub fn salvage(&self) -> Result<BTreeMap<String, CacheKey>> {
        let contents = match fs::read(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = BTreeMap::new();
        for line in contents.split(|&b| b == b'\n') {
            let mut framed = line.to_vec();
            framed.push(b'\n');
            let Ok(parsed) = records::parse(&framed) else {
                continue;
            };
            for (origin, value) in parsed.to_map() {
                if let Ok(key) = CacheKey::parse(&value) {
                    keys.insert(origin, key);
                }
            }
        }
        Ok(keys)
    }

    /// Move the current file out of the way, returning where it went
    pub fn move_aside(&self, _guard: &LockGuard, suffix: &str) -> Result<Option<PathBuf>> {
        let target = self
            .path
            .with_file_name(format!("{}.corrupt-{}", MAPPING_FILE_NAME, suffix));
        match fs::rename(&self.path, &target) {
            Ok(()) => Ok(Some(target)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the whole file with `entries`
    pub fn rebuild(&self, _guard: &LockGuard, entries: &BTreeMap<String, CacheKey>) -> Result<()> {
        let tmp = self
            .path
            .with_file_name(format!("{}.{}.tmp", MAPPING_FILE_NAME, std::process::id()));
        let written = (|| -> io::Result<()> {
            let mut file = File::create(&tmp)?;
            for (origin, key) in entries {
                file.write_all(Record::add(origin.as_str(), key.as_str()).render().as_bytes())?;
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

    fn parse(&self, contents: &[u8]) -> Result<Parsed> {
        records::parse(contents).map_err(|e| EnlistmentError::CorruptCacheIndex {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }

    fn to_keys(&self, parsed: &Parsed) -> Result<BTreeMap<String, CacheKey>> {
        parsed
            .to_map()
            .into_iter()
            .map(|(origin, value)| {
                let key = CacheKey::parse(&value).map_err(|e| EnlistmentError::CorruptCacheIndex {
                    path: self.path.clone(),
                    reason: format!("entry for {}: {}", origin, e),
                })?;
                Ok((origin, key))
            })
            .collect()
    }
}
