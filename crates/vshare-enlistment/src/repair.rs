//! Operator repair of damaged persisted state.
//!
//! Repair is a list of jobs. Each job can tell whether its piece of state is
//! healthy and knows how to fix it. Healthy state is left untouched, so
//! running repair on a good enlistment is a no-op. All jobs run while the
//! mapping-store lock is held.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use vshare_cas::{read_alternates, write_alternates, CacheKey, ObjectsRootManager, SharedObjectStore};
use vshare_config::path::persisted_form;
use vshare_config::{log_repair_info, log_repair_warn};
use vshare_index::SizeIndex;
use vshare_lock::LockGuard;

use crate::cache_key::CacheKeyStore;
use crate::metadata::RepoMetadata;
use crate::{Enlistment, EnlistmentError, EnlistmentOptions, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Broken(String),
}

/// One repairable piece of state
pub trait RepairJob {
    fn name(&self) -> &'static str;

    fn detect(&self) -> Result<Health>;

    /// Fix what `detect` reported; returns a description of the action.
    /// The guard proves the mapping-store lock is held.
    fn fix(&self, guard: &LockGuard) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Healthy,
    Fixed { problem: String, action: String },
    Failed { problem: String, error: String },
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub name: &'static str,
    pub outcome: JobOutcome,
}

#[derive(Debug, Clone, Default)]
pub struct RepairReport {
    pub jobs: Vec<JobResult>,
}

impl RepairReport {
    /// Every job ended healthy or fixed
    pub fn is_success(&self) -> bool {
        !self
            .jobs
            .iter()
            .any(|j| matches!(j.outcome, JobOutcome::Failed { .. }))
    }

    pub fn fixed_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|j| matches!(j.outcome, JobOutcome::Fixed { .. }))
            .count()
    }
}

impl fmt::Display for RepairReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for job in &self.jobs {
            match &job.outcome {
                JobOutcome::Healthy => writeln!(f, "{}: healthy", job.name)?,
                JobOutcome::Fixed { problem, action } => {
                    writeln!(f, "{}: fixed ({}): {}", job.name, problem, action)?
                }
                JobOutcome::Failed { problem, error } => {
                    writeln!(f, "{}: FAILED ({}): {}", job.name, problem, error)?
                }
            }
        }
        Ok(())
    }
}

/// Suffix for state moved out of the way
fn corrupt_suffix() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

/// Rebuilds a size index that fails its integrity check from the loose
/// objects actually present in the ObjectsRoot.
pub struct SizeIndexJob {
    pub index_root: PathBuf,
    pub objects_root: PathBuf,
}

impl RepairJob for SizeIndexJob {
    fn name(&self) -> &'static str {
        "size index"
    }

    fn detect(&self) -> Result<Health> {
        if !self.index_root.exists() {
            return Ok(Health::Healthy);
        }
        match SizeIndex::open(&self.index_root) {
            Ok(_) => Ok(Health::Healthy),
            Err(e) if e.is_corrupt() => Ok(Health::Broken(e.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn fix(&self, _guard: &LockGuard) -> Result<String> {
        let file_name = self
            .index_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "sizeIndex".to_string());
        let aside = self
            .index_root
            .with_file_name(format!("{}.corrupt-{}", file_name, corrupt_suffix()));
        fs::rename(&self.index_root, &aside)?;

        let entries = SharedObjectStore::new(&self.objects_root).list()?;
        let index = SizeIndex::open(&self.index_root)?;
        let added = index.put_batch(entries)?;
        index.sync()?;

        Ok(format!(
            "moved damaged index to {} and rebuilt {} entries",
            aside.display(),
            added
        ))
    }
}

/// Rebuilds an unparseable mapping store, and re-adds this enlistment's
/// origin when its entry went missing.
pub struct CacheKeyStoreJob {
    pub store: CacheKeyStore,
    /// Mapping the enlistment relies on, when repairing an enlistment
    pub expected: Option<(String, CacheKey)>,
}

impl RepairJob for CacheKeyStoreJob {
    fn name(&self) -> &'static str {
        "cache key store"
    }

    fn detect(&self) -> Result<Health> {
        match self.store.entries() {
            Ok(entries) => match &self.expected {
                Some((origin, _)) if !entries.contains_key(origin) => {
                    Ok(Health::Broken(format!("no entry for {}", origin)))
                }
                _ => Ok(Health::Healthy),
            },
            Err(e @ EnlistmentError::CorruptCacheIndex { .. }) => Ok(Health::Broken(e.to_string())),
            Err(e) => Err(e),
        }
    }

    fn fix(&self, guard: &LockGuard) -> Result<String> {
        let corrupt = self.store.entries().is_err();
        let mut entries = self.store.salvage()?;
        if let Some((origin, key)) = &self.expected {
            entries.entry(origin.clone()).or_insert_with(|| key.clone());
        }

        let mut action = String::new();
        if corrupt {
            if let Some(aside) = self.store.move_aside(guard, &corrupt_suffix())? {
                action = format!("moved damaged store to {}; ", aside.display());
            }
        }
        self.store.rebuild(guard, &entries)?;
        action.push_str(&format!("rewrote {} entries", entries.len()));
        Ok(action)
    }
}

/// Points the enlistment's alternates file back at its ObjectsRoot
pub struct AlternatesJob {
    pub git_dir: PathBuf,
    pub objects_root: PathBuf,
}

impl RepairJob for AlternatesJob {
    fn name(&self) -> &'static str {
        "alternates"
    }

    fn detect(&self) -> Result<Health> {
        let expected = persisted_form(&self.objects_root);
        match read_alternates(&self.git_dir)? {
            Some(actual) if actual == expected => Ok(Health::Healthy),
            Some(actual) => Ok(Health::Broken(format!("points at {:?}", actual))),
            None => Ok(Health::Broken("missing".to_string())),
        }
    }

    fn fix(&self, _guard: &LockGuard) -> Result<String> {
        write_alternates(&self.git_dir, &self.objects_root)?;
        Ok(format!("rewrote pointer to {}", self.objects_root.display()))
    }
}

/// Run `jobs` in order under `guard`
pub fn run_jobs(jobs: &[Box<dyn RepairJob>], guard: &LockGuard) -> RepairReport {
    let mut report = RepairReport::default();
    for job in jobs {
        let outcome = match job.detect() {
            Ok(Health::Healthy) => JobOutcome::Healthy,
            Ok(Health::Broken(problem)) => {
                log_repair_warn!("Repairing", job = job.name(), problem = problem.as_str());
                match job.fix(guard) {
                    Ok(action) => {
                        log_repair_info!("Repaired", job = job.name(), action = action.as_str());
                        JobOutcome::Fixed { problem, action }
                    }
                    Err(e) => JobOutcome::Failed {
                        problem,
                        error: e.to_string(),
                    },
                }
            }
            Err(e) => JobOutcome::Failed {
                problem: "could not inspect".to_string(),
                error: e.to_string(),
            },
        };
        report.jobs.push(JobResult {
            name: job.name(),
            outcome,
        });
    }
    report
}

/// Repair everything `enlistment` depends on
pub fn repair_enlistment(enlistment: &Enlistment, options: &EnlistmentOptions) -> Result<RepairReport> {
    let metadata = RepoMetadata::load(enlistment.metadata_path())?;
    let cache_root = metadata
        .local_cache_root()
        .unwrap_or_else(|| options.cache_root.clone());
    let objects_root = metadata.require_git_objects_root()?;
    let index_root = metadata
        .blob_sizes_root()
        .or_else(|| ObjectsRootManager::size_index_root_beside(&objects_root))
        .ok_or_else(|| metadata.corrupt("GitObjectsRoot has no parent directory"))?;

    let expected = match (
        metadata.origin_url(),
        ObjectsRootManager::key_from_objects_root(&objects_root),
    ) {
        (Some(origin), Some(key)) => Some((origin.to_string(), key)),
        _ => None,
    };

    let store = CacheKeyStore::new(&cache_root, options.lock);
    let guard = store.lock("repair")?;

    let jobs: Vec<Box<dyn RepairJob>> = vec![
        Box::new(CacheKeyStoreJob { store, expected }),
        Box::new(SizeIndexJob {
            index_root,
            objects_root: objects_root.clone(),
        }),
        Box::new(AlternatesJob {
            git_dir: enlistment.git_dir(),
            objects_root,
        }),
    ];
    let report = run_jobs(&jobs, &guard);
    guard.release()?;

    log_repair_info!(
        "Repair finished",
        enlistment = enlistment.root().display().to_string(),
        fixed = report.fixed_count() as u64,
        success = report.is_success()
    );
    Ok(report)
}

/// Repair shared state under `cache_root`: the mapping store and every
/// key's size index.
pub fn repair_cache_root(cache_root: &Path, options: &EnlistmentOptions) -> Result<RepairReport> {
    let manager = ObjectsRootManager::new(cache_root)?;
    let store = CacheKeyStore::new(manager.cache_root(), options.lock);
    let guard = store.lock("repair")?;

    let mut jobs: Vec<Box<dyn RepairJob>> = Vec::new();
    for entry in fs::read_dir(manager.cache_root())? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(key) = name.to_str().and_then(|n| CacheKey::parse(n).ok()) else {
            continue;
        };
        if !entry.file_type()?.is_dir() {
            continue;
        }
        jobs.push(Box::new(SizeIndexJob {
            index_root: manager.size_index_root_for(&key),
            objects_root: manager.objects_root_for(&key),
        }));
    }
    jobs.insert(
        0,
        Box::new(CacheKeyStoreJob {
            store,
            expected: None,
        }),
    );

    let report = run_jobs(&jobs, &guard);
    guard.release()?;
    Ok(report)
}
