//! # vshare-lock
//!
//! Filesystem-visible advisory locks shared by independent processes.
//!
//! A lock is a file next to the resource it guards (`mapping-store.lock`
//! guards `mapping-store`). Its presence means "owned". The file holds a JSON
//! [`LockOwner`] record, and the owning process keeps an exclusive `flock` on
//! it for as long as the [`LockGuard`] lives.
//!
//! ## Staleness
//!
//! A process that crashes or is killed leaves the file behind but the kernel
//! drops its `flock`. A contender that can take the `flock` on an existing
//! artifact therefore knows the owner is gone, removes the artifact and
//! retries. On filesystems without `flock` support the recorded pid is
//! checked instead.
//!
//! ## Creation
//!
//! The record is written to a private temp file which is then hard-linked to
//! the lock path, so the artifact never exists in a half-written state.
//! Where hard links are unsupported the file is created in place instead.
//! That empty file can be reclaimed before its creator flocks it, so the
//! creator only claims the lock if the path still names its file afterwards.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use vshare_config::{log_lock_debug, log_lock_warn, LockConfig};

/// Immediate create/reclaim rounds inside one `try_acquire`
const MAX_RECLAIM_ROUNDS: usize = 4;

/// How long an empty artifact without a record counts as being created
const CREATION_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Timed out after {waited:?} waiting for lock {path} (held by {owner})")]
    Timeout {
        path: PathBuf,
        waited: Duration,
        owner: String,
    },
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Retry policy for a contended lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Total time to keep retrying before `LockError::Timeout`
    pub timeout: Duration,
    /// First sleep after a failed attempt
    pub initial_backoff: Duration,
    /// Cap for the doubling sleep
    pub max_backoff: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms.max(1)),
            max_backoff: Duration::from_millis(config.max_backoff_ms.max(config.initial_backoff_ms.max(1))),
        }
    }
}

/// Doubling backoff capped at `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(options: &LockOptions) -> Self {
        Self {
            current: options.initial_backoff,
            max: options.max_backoff,
        }
    }

    /// Delay to sleep now; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

/// Who holds a lock, as recorded in the artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub hostname: String,
    pub created_at: DateTime<Utc>,
    pub purpose: String,
}

impl LockOwner {
    fn current(purpose: &str) -> Self {
        Self {
            pid: std::process::id(),
            hostname: current_hostname(),
            created_at: Utc::now(),
            purpose: purpose.to_string(),
        }
    }

    /// Whether the recorded process still runs.
    ///
    /// Owners on another host cannot be checked and count as alive.
    pub fn is_alive(&self) -> bool {
        if self.hostname != current_hostname() {
            return true;
        }
        is_process_alive(self.pid)
    }

    pub fn describe(&self) -> String {
        format!(
            "pid {} on {} since {} ({})",
            self.pid,
            self.hostname,
            self.created_at.to_rfc3339(),
            self.purpose
        )
    }
}

/// Observed state of a lock artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    /// No artifact present
    Free,
    /// Artifact present and its owner is alive
    Held(Option<LockOwner>),
    /// Artifact present but abandoned
    Stale(Option<LockOwner>),
}

enum Probe {
    Gone,
    Live(Option<LockOwner>),
    Stale { owner: Option<LockOwner>, file: File },
}

/// Acquires and reclaims one lock artifact
#[derive(Debug, Clone)]
pub struct LockCoordinator {
    path: PathBuf,
    options: LockOptions,
}

impl LockCoordinator {
    /// Coordinator for an explicit lock file path
    pub fn new<P: AsRef<Path>>(path: P, options: LockOptions) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            options,
        }
    }

    /// Coordinator guarding `resource`, using `<resource>.lock` as the artifact
    pub fn for_resource<P: AsRef<Path>>(resource: P, options: LockOptions) -> Self {
        let resource = resource.as_ref();
        let mut name = resource
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".lock");
        Self::new(resource.with_file_name(name), options)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquire the lock, retrying with backoff while a live owner holds it.
    pub fn acquire(&self, purpose: &str) -> Result<LockGuard> {
        let start = Instant::now();
        let mut backoff = Backoff::new(&self.options);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            if let Some(guard) = self.try_acquire(purpose)? {
                log_lock_debug!(
                    "Lock acquired",
                    path = self.path.display().to_string(),
                    attempts = attempts,
                    purpose = purpose,
                );
                return Ok(guard);
            }

            let waited = start.elapsed();
            if waited >= self.options.timeout {
                let owner = match self.inspect() {
                    Ok(LockState::Held(Some(owner))) => owner.describe(),
                    _ => "unknown owner".to_string(),
                };
                return Err(LockError::Timeout {
                    path: self.path.clone(),
                    waited,
                    owner,
                });
            }

            let delay = backoff.next_delay().min(self.options.timeout - waited);
            log_lock_debug!(
                "Lock contended, backing off",
                path = self.path.display().to_string(),
                delay_ms = delay.as_millis() as u64,
            );
            thread::sleep(delay);
        }
    }

    /// Single non-blocking attempt. Stale artifacts are reclaimed on the way.
    ///
    /// Returns `Ok(None)` when a live owner holds the lock.
    pub fn try_acquire(&self, purpose: &str) -> Result<Option<LockGuard>> {
        for _ in 0..MAX_RECLAIM_ROUNDS {
            if let Some(guard) = self.try_create(purpose)? {
                return Ok(Some(guard));
            }

            match self.probe()? {
                Probe::Gone => continue,
                Probe::Live(_) => return Ok(None),
                Probe::Stale { owner, file } => {
                    if self.reclaim(&file)? {
                        log_lock_warn!(
                            "Reclaimed stale lock",
                            path = self.path.display().to_string(),
                            owner = owner
                                .as_ref()
                                .map(LockOwner::describe)
                                .unwrap_or_else(|| "unreadable record".to_string()),
                        );
                    }
                }
            }
        }
        Ok(None)
    }

    /// Report the current state without taking or removing anything
    pub fn inspect(&self) -> Result<LockState> {
        Ok(match self.probe()? {
            Probe::Gone => LockState::Free,
            Probe::Live(owner) => LockState::Held(owner),
            Probe::Stale { owner, .. } => LockState::Stale(owner),
        })
    }

    fn try_create(&self, purpose: &str) -> Result<Option<LockGuard>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "lock".to_string());
        let tmp_path = self.path.with_file_name(format!(
            "{}.{}.{}.tmp",
            file_name,
            std::process::id(),
            Uuid::new_v4().simple()
        ));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        // Unsupported flock is tolerated: contenders fall back to the pid.
        let _ = file.try_lock_exclusive();
        let written = write_owner(&mut file, &LockOwner::current(purpose));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }

        let linked = fs::hard_link(&tmp_path, &self.path);
        let _ = fs::remove_file(&tmp_path);
        match linked {
            Ok(()) => Ok(Some(LockGuard::new(self.path.clone(), file))),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => {
                log_lock_debug!(
                    "Hard link unavailable, creating lock in place",
                    error = e.to_string(),
                );
                drop(file);
                self.try_create_in_place(purpose)
            }
        }
    }

    fn try_create_in_place(&self, purpose: &str) -> Result<Option<LockGuard>> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.claim_in_place(file, purpose)
    }

    /// Finish an in-place creation. Until the record is written the artifact
    /// is an empty file, which a contender may already be reclaiming.
    fn claim_in_place(&self, mut file: File, purpose: &str) -> Result<Option<LockGuard>> {
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                log_lock_debug!(
                    "New lock file taken by a contender",
                    path = self.path.display().to_string(),
                );
                return Ok(None);
            }
            Err(_) => {}
        }
        write_owner(&mut file, &LockOwner::current(purpose))?;
        if !is_linked_at(&file, &self.path)? {
            return Ok(None);
        }
        Ok(Some(LockGuard::new(self.path.clone(), file)))
    }

    fn probe(&self) -> Result<Probe> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Probe::Gone),
            Err(e) => return Err(e.into()),
        };
        let owner = read_owner(&mut file);

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Probe::Stale { owner, file }),
            Err(e) if is_contended(&e) => Ok(Probe::Live(owner)),
            Err(e) => {
                log_lock_debug!("flock unsupported, checking owner pid", error = e.to_string());
                let alive = match &owner {
                    Some(owner) => owner.is_alive(),
                    None => is_being_created(&file)?,
                };
                if alive {
                    Ok(Probe::Live(owner))
                } else {
                    Ok(Probe::Stale { owner, file })
                }
            }
        }
    }

    /// Remove the artifact `stale` was opened from, unless it has since been
    /// replaced by a new owner.
    fn reclaim(&self, stale: &File) -> Result<bool> {
        if !is_linked_at(stale, &self.path)? {
            return Ok(false);
        }

        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Held lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    file: Option<File>,
}

impl LockGuard {
    fn new(path: PathBuf, file: File) -> Self {
        Self {
            path,
            file: Some(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release explicitly, surfacing removal errors
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // Remove while the flock is still held so no contender can mistake
        // the artifact for stale and race the removal.
        let removed = fs::remove_file(&self.path);
        let _ = FileExt::unlock(&file);
        drop(file);

        match removed {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            log_lock_warn!(
                "Failed to release lock",
                path = self.path.display().to_string(),
                error = e.to_string(),
            );
        }
    }
}

fn write_owner(file: &mut File, owner: &LockOwner) -> io::Result<()> {
    let record = serde_json::to_vec(owner).map_err(io::Error::other)?;
    file.write_all(&record)?;
    file.sync_all()
}

fn read_owner(file: &mut File) -> Option<LockOwner> {
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Whether `path` still names the file `file` was opened from
fn is_linked_at(file: &File, path: &Path) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let held = file.metadata()?;
        match fs::metadata(path) {
            Ok(current) => Ok(current.ino() == held.ino() && current.dev() == held.dev()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(path.exists())
    }
}

/// An empty artifact younger than [`CREATION_GRACE`]: its creator is still
/// writing the record.
fn is_being_created(file: &File) -> io::Result<bool> {
    let meta = file.metadata()?;
    if meta.len() != 0 {
        return Ok(false);
    }
    let age = meta.modified()?.elapsed().unwrap_or_default();
    Ok(age < CREATION_GRACE)
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn current_hostname() -> String {
    #[cfg(unix)]
    {
        nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
    #[cfg(not(unix))]
    {
        String::new()
    }
}

/// Whether a process with this pid exists on the local host
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_process_alive(_pid: u32) -> bool {
    true
}
