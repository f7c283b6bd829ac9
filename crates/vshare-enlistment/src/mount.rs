//! Mount preparation and the object-serving session.
//!
//! [`prepare`] brings an enlistment to a servable state: layout upgraded,
//! cache directories present, alternates pointing at the right ObjectsRoot
//! and the SizeIndex open and verified. The resulting [`MountSession`] is
//! what the virtualization layer reads through.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

use vshare_cas::{write_alternates, CacheKey, CasError, ObjectFetcher, ObjectId, ObjectsRootManager, SharedObjectStore};
use vshare_config::{log_mount_info, log_mount_warn};
use vshare_index::SizeIndex;

use crate::cache_key::CacheKeyStore;
use crate::layout::{DiskLayoutVersion, LayoutMigrator};
use crate::metadata::RepoMetadata;
use crate::{Enlistment, EnlistmentError, EnlistmentOptions, Result, RetryPolicy};

/// Contents of the mount state file while mounted
pub const MOUNT_STATE_READY: &str = "Ready";

/// A prepared, servable enlistment
#[derive(Debug)]
pub struct MountSession {
    enlistment: Enlistment,
    version: DiskLayoutVersion,
    manager: ObjectsRootManager,
    key: CacheKey,
    store: SharedObjectStore,
    sizes: SizeIndex,
    retry: RetryPolicy,
}

/// Run the full mount sequence for `enlistment`
pub fn prepare(enlistment: &Enlistment, options: &EnlistmentOptions) -> Result<MountSession> {
    let mut metadata = RepoMetadata::load(enlistment.metadata_path())?;
    clear_mount_state(enlistment)?;

    let report = LayoutMigrator::new(options).upgrade_metadata(enlistment, &mut metadata)?;
    if !report.is_noop() {
        log_mount_info!(
            "Disk layout upgraded",
            from = report.from.to_string(),
            to = report.to.to_string()
        );
    }

    let (manager, key, objects_root) = ensure_cache_health(&mut metadata, options)?;
    write_alternates(&enlistment.git_dir(), &objects_root)?;

    let index_root = match metadata.blob_sizes_root() {
        Some(root) => root,
        None => {
            let root = manager.size_index_root_for(&key);
            metadata.set_blob_sizes_root(&root);
            metadata.save()?;
            root
        }
    };
    let sizes = SizeIndex::open(&index_root)?;

    fs::write(enlistment.mount_state_path(), MOUNT_STATE_READY)?;
    log_mount_info!(
        "Mount status: Ready",
        enlistment = enlistment.root().display().to_string(),
        objects_root = objects_root.display().to_string()
    );

    Ok(MountSession {
        enlistment: enlistment.clone(),
        version: report.to,
        manager,
        key,
        store: SharedObjectStore::new(&objects_root),
        sizes,
        retry: options.hydration,
    })
}

/// Recreate whatever part of the shared cache went missing since the last
/// mount, persisting any path that changed.
///
/// - cache root gone: recreate it and map the origin to a fresh key
/// - ObjectsRoot gone: recreate it under the key its recorded path names
fn ensure_cache_health(
    metadata: &mut RepoMetadata,
    options: &EnlistmentOptions,
) -> Result<(ObjectsRootManager, CacheKey, PathBuf)> {
    let cache_root = metadata
        .local_cache_root()
        .unwrap_or_else(|| options.cache_root.clone());
    let recorded_root = metadata.require_git_objects_root()?;

    if !cache_root.is_dir() {
        log_mount_warn!(
            "Local cache root missing, recreating",
            cache_root = cache_root.display().to_string()
        );
        fs::create_dir_all(&cache_root)?;
        let manager = ObjectsRootManager::new(&cache_root)?;
        let origin = metadata.require_origin_url()?;
        let key = CacheKeyStore::new(&cache_root, options.lock).resolve_or_create(&origin)?;
        return persist_objects_root(metadata, manager, key, &recorded_root);
    }

    let manager = ObjectsRootManager::new(&cache_root)?;
    let key = match ObjectsRootManager::key_from_objects_root(&recorded_root) {
        Some(key) => key,
        None => {
            // Not a path this layout produced; the origin's mapping decides
            let origin = metadata.origin_url().map(str::to_string).ok_or_else(|| {
                metadata.corrupt(format!(
                    "GitObjectsRoot {} is not inside a cache key directory",
                    recorded_root.display()
                ))
            })?;
            CacheKeyStore::new(&cache_root, options.lock).resolve_or_create(&origin)?
        }
    };
    if !recorded_root.is_dir() {
        log_mount_warn!(
            "Objects root missing, recreating",
            objects_root = recorded_root.display().to_string(),
            cache_key = key.to_string()
        );
    }
    persist_objects_root(metadata, manager, key, &recorded_root)
}

fn persist_objects_root(
    metadata: &mut RepoMetadata,
    manager: ObjectsRootManager,
    key: CacheKey,
    recorded_root: &Path,
) -> Result<(ObjectsRootManager, CacheKey, PathBuf)> {
    let objects_root = manager.ensure_objects_root(&key)?;
    if objects_root != *recorded_root || metadata.local_cache_root().is_none() {
        metadata.set_local_cache_root(manager.cache_root());
        metadata.set_git_objects_root(&objects_root);
        metadata.set_blob_sizes_root(&manager.size_index_root_for(&key));
        metadata.save()?;
    }

    Ok((manager, key, objects_root))
}

impl MountSession {
    pub fn enlistment(&self) -> &Enlistment {
        &self.enlistment
    }

    pub fn layout_version(&self) -> DiskLayoutVersion {
        self.version
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    pub fn objects_root(&self) -> &Path {
        self.store.root()
    }

    pub fn store(&self) -> &SharedObjectStore {
        &self.store
    }

    pub fn size_index(&self) -> &SizeIndex {
        &self.sizes
    }

    /// Size of `oid` as recorded in the shared index
    pub fn object_size(&self, oid: &ObjectId) -> Result<Option<u64>> {
        Ok(self.sizes.get(oid)?)
    }

    /// Bytes of `oid`, fetching it if the shared store lacks it.
    ///
    /// Transient failures, such as the ObjectsRoot being deleted underneath
    /// us, are retried with the session's policy. Content whose length
    /// disagrees with the index is never returned.
    pub fn hydrate(&self, oid: &ObjectId, fetcher: &dyn ObjectFetcher) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.try_hydrate(oid, fetcher) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_retryable() && attempt < self.retry.retries => {
                    attempt += 1;
                    log_mount_warn!(
                        "Hydration failed, retrying",
                        oid = oid.to_hex(),
                        attempt = attempt,
                        error = e.to_string()
                    );
                    thread::sleep(self.retry.delay);
                }
                Err(e) => {
                    return Err(EnlistmentError::Hydration {
                        oid: oid.to_hex(),
                        attempts: attempt + 1,
                        source: Box::new(e),
                    })
                }
            }
        }
    }

    fn try_hydrate(&self, oid: &ObjectId, fetcher: &dyn ObjectFetcher) -> Result<Vec<u8>> {
        let known = self.sizes.get(oid)?;
        match self.store.read(oid, known) {
            Ok(data) => {
                if known.is_none() {
                    self.sizes.put(oid, data.len() as u64)?;
                }
                return Ok(data);
            }
            Err(CasError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        self.manager.ensure_objects_root(&self.key)?;
        let (size, _) = self.store.ensure_object(oid, fetcher)?;
        if known.is_none() {
            self.sizes.put(oid, size)?;
        }
        Ok(self.store.read(oid, Some(known.unwrap_or(size)))?)
    }

    /// Clear the mount state; the session is consumed
    pub fn unmount(self) -> Result<()> {
        clear_mount_state(&self.enlistment)
    }
}

/// Remove the mount state file, if any
pub fn clear_mount_state(enlistment: &Enlistment) -> Result<()> {
    match fs::remove_file(enlistment.mount_state_path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
