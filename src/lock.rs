//! Advisory per-project process lock.
//!
//! The lock file holds the owning pid, or `disowned` when the owner gave it up after a
//! failure. A lock whose owner is gone or disowned is taken over, and the caller is told
//! so it can discard possibly half-written cache state.

use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::error::{CacheError, IoResultExt, Result};
use crate::hash::short_hex;

const DISOWNED: &str = "disowned";
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const WAIT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockResult {
    /// Free, or released by its owner while waiting.
    AcquiredClean,
    AcquiredAlreadyOwned,
    AcquiredPreviousOwnerMissing,
    AcquiredPreviousOwnerDisowned,
}

impl LockResult {
    pub fn needs_cache_reset(self) -> bool {
        self != LockResult::AcquiredClean
    }
}

/// One hour, or one minute on CI where a stuck lock is unlikely to clear.
pub fn default_timeout() -> Duration {
    if std::env::var_os("CI").is_some() {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(60 * 60)
    }
}

#[derive(Debug, Clone)]
pub struct ProjectLock {
    path: PathBuf,
}

impl ProjectLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<cache_dir>/.<hash of project_dir>.lock`
    pub fn for_project(cache_dir: &Path, project_dir: &Path) -> Self {
        let key = short_hex(project_dir.to_string_lossy().as_bytes());
        Self::new(cache_dir.join(format!(".{key}.lock")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the lock file, waiting while a live process owns it.
    ///
    /// The owner is re-read on every poll, so an owner that dies or disowns the lock
    /// while we wait is taken over right away.
    pub fn acquire(&self, timeout: Duration) -> Result<LockResult> {
        let current = std::process::id();
        let started = Instant::now();
        let mut next_report = WAIT_REPORT_INTERVAL;
        let mut outcome = LockResult::AcquiredClean;
        let mut waiting_on = None;

        loop {
            if self.try_create(current)? {
                return Ok(outcome);
            }

            let Some(owner) = self.read_owner()? else {
                continue;
            };
            if owner == DISOWNED {
                info!(lock = %self.path.display(), "previous process disowned the lock");
                self.remove_if_owner(&owner)?;
                outcome = LockResult::AcquiredPreviousOwnerDisowned;
                continue;
            }
            match owner.parse::<u32>() {
                Ok(pid) if pid == current => return Ok(LockResult::AcquiredAlreadyOwned),
                Ok(pid) if process_exists(pid) => {
                    if waiting_on != Some(pid) {
                        info!(lock = %self.path.display(), pid, "waiting for lock to be released");
                        waiting_on = Some(pid);
                    }
                    let waited = started.elapsed();
                    if waited >= timeout {
                        return Err(CacheError::LockTimeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    if waited >= next_report {
                        info!(
                            lock = %self.path.display(),
                            pid,
                            minutes = waited.as_secs() / 60,
                            "still waiting for lock"
                        );
                        next_report += WAIT_REPORT_INTERVAL;
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                _ => {
                    warn!(
                        lock = %self.path.display(),
                        owner,
                        "locking process does not exist, assuming abrupt termination"
                    );
                    self.remove_if_owner(&owner)?;
                    outcome = LockResult::AcquiredPreviousOwnerMissing;
                }
            }
        }
    }

    pub fn acquire_default(&self) -> Result<LockResult> {
        self.acquire(default_timeout())
    }

    /// Atomically creates the lock file holding `pid`. `false` if it already exists.
    fn try_create(&self, pid: u32) -> Result<bool> {
        let parent = self.lock_dir();
        std::fs::create_dir_all(parent).at_path(parent)?;
        let mut staged = NamedTempFile::new_in(parent).at_path(parent)?;
        staged
            .write_all(pid.to_string().as_bytes())
            .at_path(staged.path())?;
        match staged.persist_noclobber(&self.path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(CacheError::io(&self.path, e.error)),
        }
    }

    /// Trimmed lock file content, or `None` if the file vanished.
    fn read_owner(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(owner) => Ok(Some(owner.trim().to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(&self.path, e)),
        }
    }

    /// Removes a stale lock unless another process replaced it since `owner` was read.
    fn remove_if_owner(&self, owner: &str) -> Result<()> {
        if self.read_owner()?.as_deref() == Some(owner) {
            remove_lock_file(&self.path)?;
        }
        Ok(())
    }

    fn lock_dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// Releases the lock so the next run can start without waiting for this process to exit.
    pub fn disown(&self) -> Result<()> {
        let parent = self.lock_dir();
        let mut staged = NamedTempFile::new_in(parent).at_path(parent)?;
        staged.write_all(DISOWNED.as_bytes()).at_path(staged.path())?;
        staged
            .persist(&self.path)
            .map_err(|e| CacheError::io(&self.path, e.error))?;
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        remove_lock_file(&self.path)
    }
}

fn remove_lock_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: Signal 0 only checks that the process exists and may be signalled.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jar::test_support::temp_path;

    #[test]
    fn fresh_lock_is_clean_then_owned() -> Result<()> {
        let dir = temp_path("lock_fresh");
        let lock = ProjectLock::for_project(&dir, Path::new("/projects/demo"));
        assert!(lock.path().file_name().unwrap().to_string_lossy().starts_with('.'));

        assert_eq!(lock.acquire_default()?, LockResult::AcquiredClean);
        assert_eq!(
            std::fs::read_to_string(lock.path()).unwrap(),
            std::process::id().to_string()
        );
        assert_eq!(lock.acquire_default()?, LockResult::AcquiredAlreadyOwned);

        lock.release()?;
        assert!(!lock.path().exists());
        std::fs::remove_dir_all(dir).unwrap();
        Ok(())
    }

    #[test]
    fn disowned_and_missing_owners_are_taken_over() -> Result<()> {
        let dir = temp_path("lock_takeover");
        let lock = ProjectLock::for_project(&dir, Path::new("/projects/other"));
        lock.acquire_default()?;

        lock.disown()?;
        let result = lock.acquire_default()?;
        assert_eq!(result, LockResult::AcquiredPreviousOwnerDisowned);
        assert!(result.needs_cache_reset());

        std::fs::write(lock.path(), "not a pid").unwrap();
        assert_eq!(
            lock.acquire_default()?,
            LockResult::AcquiredPreviousOwnerMissing
        );

        lock.release()?;
        std::fs::remove_dir_all(dir).unwrap();
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn owner_dying_during_wait_is_taken_over() -> Result<()> {
        let dir = temp_path("lock_owner_exits");
        std::fs::create_dir_all(&dir).unwrap();
        let lock = ProjectLock::new(dir.join(".exiting.lock"));

        let mut child = std::process::Command::new("sleep").arg("0.3").spawn().unwrap();
        std::fs::write(lock.path(), child.id().to_string()).unwrap();
        let reaper = std::thread::spawn(move || child.wait());

        let started = Instant::now();
        let result = lock.acquire(Duration::from_secs(30))?;
        assert_eq!(result, LockResult::AcquiredPreviousOwnerMissing);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            std::fs::read_to_string(lock.path()).unwrap(),
            std::process::id().to_string()
        );
        reaper.join().unwrap().unwrap();

        std::fs::remove_dir_all(dir).unwrap();
        Ok(())
    }

    #[test]
    fn concurrent_acquirers_get_one_owner() -> Result<()> {
        let dir = temp_path("lock_race");
        let lock = ProjectLock::new(dir.join(".race.lock"));

        let created: Vec<bool> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| lock.try_create(std::process::id())))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Result<_>>()
        })?;
        assert_eq!(created.iter().filter(|c| **c).count(), 1);

        lock.release()?;
        std::fs::remove_dir_all(dir).unwrap();
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn live_owner_times_out() -> Result<()> {
        let dir = temp_path("lock_wait");
        std::fs::create_dir_all(&dir).unwrap();
        let lock = ProjectLock::new(dir.join(".held.lock"));
        // pid 1 always exists on unix.
        std::fs::write(lock.path(), "1").unwrap();

        let result = lock.acquire(Duration::from_millis(300));
        assert!(matches!(result, Err(CacheError::LockTimeout { .. })));

        std::fs::remove_dir_all(dir).unwrap();
        Ok(())
    }
}
