//! Disk layout versions and the upgrade ladder.
//!
//! Each step takes an enlistment from exactly one version to the next. Steps
//! are idempotent and the persisted version is bumped only after the step's
//! data has been committed, so an interrupted upgrade simply reruns the same
//! step on the next mount.

use std::fmt;
use std::fs;
use std::io;

use vshare_cas::{write_alternates, ObjectsRootManager, SharedObjectStore};
use vshare_config::path::compute_enlistment_id;
use vshare_config::{log_migrate_debug, log_migrate_info};
use vshare_index::SizeIndex;

use crate::cache_key::CacheKeyStore;
use crate::metadata::{keys, RepoMetadata};
use crate::{Enlistment, EnlistmentError, EnlistmentOptions, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiskLayoutVersion {
    pub major: u32,
    pub minor: u32,
}

impl DiskLayoutVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DiskLayoutVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Oldest layout the ladder can start from
pub const OLDEST_UPGRADABLE: DiskLayoutVersion = DiskLayoutVersion::new(12, 0);

type StepFn = fn(&StepContext<'_>, &mut RepoMetadata) -> Result<()>;

/// One rung of the ladder
pub struct UpgradeStep {
    pub from: DiskLayoutVersion,
    pub to: DiskLayoutVersion,
    pub description: &'static str,
    run: StepFn,
}

impl fmt::Debug for UpgradeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeStep")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("description", &self.description)
            .finish()
    }
}

static STEPS: [UpgradeStep; 3] = [
    UpgradeStep {
        from: DiskLayoutVersion::new(12, 0),
        to: DiskLayoutVersion::new(13, 0),
        description: "move enlistment objects into the shared cache",
        run: relocate_objects_to_shared_cache,
    },
    UpgradeStep {
        from: DiskLayoutVersion::new(13, 0),
        to: DiskLayoutVersion::new(14, 0),
        description: "move blob sizes into the shared size index",
        run: migrate_sizes_to_shared_index,
    },
    UpgradeStep {
        from: DiskLayoutVersion::new(14, 0),
        to: DiskLayoutVersion::new(14, 1),
        description: "record enlistment id",
        run: stamp_enlistment_id,
    },
];

/// What [`LayoutMigrator::upgrade`] did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeReport {
    pub from: DiskLayoutVersion,
    pub to: DiskLayoutVersion,
    pub applied: Vec<(DiskLayoutVersion, DiskLayoutVersion)>,
}

impl UpgradeReport {
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

struct StepContext<'a> {
    enlistment: &'a Enlistment,
    options: &'a EnlistmentOptions,
}

#[derive(Debug, Clone)]
pub struct LayoutMigrator {
    options: EnlistmentOptions,
}

impl LayoutMigrator {
    pub fn new(options: &EnlistmentOptions) -> Self {
        Self {
            options: options.clone(),
        }
    }

    /// Layout written by this build
    pub fn current_version() -> DiskLayoutVersion {
        STEPS[STEPS.len() - 1].to
    }

    pub fn steps() -> &'static [UpgradeStep] {
        &STEPS
    }

    /// Persisted version of `enlistment`
    pub fn persisted_version(enlistment: &Enlistment) -> Result<DiskLayoutVersion> {
        RepoMetadata::load(enlistment.metadata_path())?.disk_layout_version()
    }

    /// Whether `version` can be used without upgrading.
    ///
    /// Newer minors on the current major are additive and accepted.
    pub fn check_supported(version: DiskLayoutVersion) -> Result<()> {
        let current = Self::current_version();
        if version.major > current.major {
            return Err(EnlistmentError::UnsupportedLayoutVersion {
                found: version,
                supported: current,
            });
        }
        if version.major < OLDEST_UPGRADABLE.major {
            return Err(EnlistmentError::LayoutTooOld {
                found: version,
                oldest: OLDEST_UPGRADABLE,
            });
        }
        Ok(())
    }

    /// Run every pending step on `enlistment`
    pub fn upgrade(&self, enlistment: &Enlistment) -> Result<UpgradeReport> {
        let mut metadata = RepoMetadata::load(enlistment.metadata_path())?;
        self.upgrade_metadata(enlistment, &mut metadata)
    }

    pub(crate) fn upgrade_metadata(
        &self,
        enlistment: &Enlistment,
        metadata: &mut RepoMetadata,
    ) -> Result<UpgradeReport> {
        let start = metadata.disk_layout_version()?;
        Self::check_supported(start)?;

        let ctx = StepContext {
            enlistment,
            options: &self.options,
        };
        let mut version = start;
        let mut applied = Vec::new();

        while version < Self::current_version() {
            let step = STEPS
                .iter()
                .find(|s| s.from.major == version.major && version < s.to)
                .ok_or(EnlistmentError::UnsupportedLayoutVersion {
                    found: version,
                    supported: Self::current_version(),
                })?;

            log_migrate_info!(
                "Upgrading disk layout",
                from = version.to_string(),
                to = step.to.to_string(),
                step = step.description,
                enlistment = enlistment.root().display().to_string()
            );

            (step.run)(&ctx, metadata).map_err(|e| EnlistmentError::UpgradeStepFailed {
                from: version,
                to: step.to,
                source: Box::new(e),
            })?;

            metadata.set_disk_layout_version(step.to);
            metadata.save().map_err(|e| EnlistmentError::UpgradeStepFailed {
                from: version,
                to: step.to,
                source: Box::new(e),
            })?;

            applied.push((version, step.to));
            version = step.to;
        }

        Ok(UpgradeReport {
            from: start,
            to: version,
            applied,
        })
    }
}

/// 12.0 → 13.0: objects leave the enlistment for `<cache root>/<key>/gitObjects`
fn relocate_objects_to_shared_cache(ctx: &StepContext<'_>, metadata: &mut RepoMetadata) -> Result<()> {
    let origin = metadata.require_origin_url()?;
    let cache_root = metadata
        .local_cache_root()
        .unwrap_or_else(|| ctx.options.cache_root.clone());

    let keys_store = CacheKeyStore::new(&cache_root, ctx.options.lock);
    let key = keys_store.resolve_or_create(&origin)?;
    let manager = ObjectsRootManager::new(&cache_root)?;
    let objects_root = manager.ensure_objects_root(&key)?;

    let legacy = SharedObjectStore::new(ctx.enlistment.legacy_objects_dir());
    let shared = SharedObjectStore::new(&objects_root);
    let mut moved = 0u64;
    for (oid, _) in legacy.list()? {
        let data = legacy.read(&oid, None)?;
        if shared.write(&oid, &data)? {
            moved += 1;
        }
    }

    metadata.set_local_cache_root(manager.cache_root());
    metadata.set_git_objects_root(&objects_root);
    metadata.save()?;
    write_alternates(&ctx.enlistment.git_dir(), &objects_root)?;

    match fs::remove_dir_all(ctx.enlistment.legacy_objects_dir()) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    log_migrate_debug!(
        "Relocated enlistment objects",
        moved = moved,
        objects_root = objects_root.display().to_string()
    );
    Ok(())
}

/// 13.0 → 14.0: the per-enlistment size store merges into the shared index
fn migrate_sizes_to_shared_index(ctx: &StepContext<'_>, metadata: &mut RepoMetadata) -> Result<()> {
    let objects_root = metadata.require_git_objects_root()?;
    let index_root = ObjectsRootManager::size_index_root_beside(&objects_root)
        .ok_or_else(|| metadata.corrupt("GitObjectsRoot has no parent directory"))?;

    let legacy = ctx.enlistment.legacy_size_store();
    let entries = legacy.load()?;
    let index = SizeIndex::open(&index_root)?;
    let added = index.put_batch(entries.iter().copied())?;
    index.sync()?;

    metadata.set_blob_sizes_root(&index_root);
    metadata.save()?;
    legacy.remove()?;

    log_migrate_debug!(
        "Migrated legacy sizes",
        entries = entries.len() as u64,
        added = added as u64,
        index = index_root.display().to_string()
    );
    Ok(())
}

/// 14.0 → 14.1: stable id for the enlistment root
fn stamp_enlistment_id(ctx: &StepContext<'_>, metadata: &mut RepoMetadata) -> Result<()> {
    if metadata.enlistment_id().is_none() {
        metadata.set(keys::ENLISTMENT_ID, compute_enlistment_id(ctx.enlistment.root()));
    }
    Ok(())
}
