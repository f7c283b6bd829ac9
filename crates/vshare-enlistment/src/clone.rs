//! Creating a new enlistment against the shared cache.

use std::fs;
use std::path::PathBuf;

use vshare_cas::{write_alternates, CacheKey, ObjectFetcher, ObjectId, ObjectsRootManager, SharedObjectStore};
use vshare_config::log_cache_info;
use vshare_config::path::compute_enlistment_id;
use vshare_index::SizeIndex;

use crate::cache_key::CacheKeyStore;
use crate::layout::LayoutMigrator;
use crate::metadata::{keys, RepoMetadata};
use crate::{Enlistment, EnlistmentError, EnlistmentOptions, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneReport {
    pub cache_key: CacheKey,
    pub objects_root: PathBuf,
    /// Objects fetched through the transport
    pub downloaded: usize,
    /// Objects another enlistment had already brought into the cache
    pub already_present: usize,
}

/// Create `enlistment` for `origin`, fetching only the `wanted` objects the
/// shared cache does not have yet.
///
/// Metadata is written last, so an interrupted clone never looks like a
/// usable enlistment.
pub fn clone(
    origin: &str,
    enlistment: &Enlistment,
    options: &EnlistmentOptions,
    fetcher: &dyn ObjectFetcher,
    wanted: &[ObjectId],
) -> Result<CloneReport> {
    let root = enlistment.root();
    if root.exists() && fs::read_dir(root)?.next().is_some() {
        return Err(EnlistmentError::AlreadyExists(root.to_path_buf()));
    }

    fs::create_dir_all(enlistment.databases_dir())?;
    fs::create_dir_all(enlistment.git_dir().join("objects").join("info"))?;

    // Held across key resolution, ObjectsRoot creation and the alternates write
    let keys_store = CacheKeyStore::new(&options.cache_root, options.lock);
    let guard = keys_store.lock(&format!("clone {}", root.display()))?;
    let key = keys_store.resolve_locked(&guard, origin)?;
    let manager = ObjectsRootManager::new(&options.cache_root)?;
    let objects_root = manager.ensure_objects_root(&key)?;
    write_alternates(&enlistment.git_dir(), &objects_root)?;
    guard.release()?;

    let index_root = manager.size_index_root_for(&key);
    let sizes = SizeIndex::open(&index_root)?;
    let store = SharedObjectStore::new(&objects_root);

    let mut downloaded = 0;
    let mut recorded = Vec::with_capacity(wanted.len());
    for oid in wanted {
        let (size, fetched) = store.ensure_object(oid, fetcher)?;
        if fetched {
            downloaded += 1;
        }
        recorded.push((*oid, size));
    }
    sizes.put_batch(recorded)?;
    sizes.sync()?;

    let mut metadata = RepoMetadata::create(enlistment.metadata_path());
    metadata.set_disk_layout_version(LayoutMigrator::current_version());
    metadata.set_local_cache_root(manager.cache_root());
    metadata.set_git_objects_root(&objects_root);
    metadata.set_blob_sizes_root(&index_root);
    metadata.set(keys::ORIGIN_URL, origin);
    metadata.set(keys::ENLISTMENT_ID, compute_enlistment_id(root));
    metadata.save()?;

    log_cache_info!(
        "Clone complete",
        origin = origin,
        key = key.as_str(),
        downloaded = downloaded as u64,
        already_present = (wanted.len() - downloaded) as u64
    );

    Ok(CloneReport {
        cache_key: key,
        objects_root,
        downloaded,
        already_present: wanted.len() - downloaded,
    })
}
