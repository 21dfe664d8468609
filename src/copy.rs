//! Local game file provisioning: verified, resumable copies run on a bounded pool.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::attributes::{read_attribute, write_attribute};
use crate::error::{CacheError, IoResultExt, Result};
use crate::hash::sha1_file;

pub const HASH_ATTRIBUTE: &str = "ContentHash";
const MAX_COPY_THREADS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Copied,
    UpToDate,
}

#[derive(Debug, Clone)]
pub struct CopyGameFile {
    source: PathBuf,
    expected_hash: Option<String>,
    max_age: Duration,
    forced: bool,
}

impl CopyGameFile {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            expected_hash: None,
            max_age: Duration::ZERO,
            forced: false,
        }
    }

    /// `sha1:<hex>`
    pub fn expected_hash(mut self, hash: impl Into<String>) -> Self {
        self.expected_hash = Some(hash.into());
        self
    }

    /// An existing output younger than this is kept. Zero always copies.
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn forced(mut self, forced: bool) -> Self {
        self.forced = forced;
        self
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn copy_to(&self, output: &Path) -> Result<CopyOutcome> {
        if !self.requires_copy(output)? {
            debug!(output = %output.display(), "game file up to date");
            return Ok(CopyOutcome::UpToDate);
        }

        match self.do_copy(output) {
            Ok(()) => Ok(CopyOutcome::Copied),
            Err(e) => {
                for path in [output.to_path_buf(), lock_path(output), part_path(output)] {
                    let _ = std::fs::remove_file(path);
                }
                Err(e)
            }
        }
    }

    fn requires_copy(&self, output: &Path) -> Result<bool> {
        let locked = take_lock(output)?;

        if self.forced || !output.exists() {
            return Ok(true);
        }

        if locked {
            warn!(
                output = %output.display(),
                "forcing copy as an existing lock file was found, the previous run was interrupted"
            );
            return Ok(true);
        }

        if let Some(expected) = &self.expected_hash {
            let recorded = read_attribute(output, HASH_ATTRIBUTE)
                .ok()
                .flatten()
                .unwrap_or_default();
            if expected.eq_ignore_ascii_case(&recorded) {
                return Ok(false);
            }
            if hash_matches(expected, output)? {
                write_attribute(output, HASH_ATTRIBUTE, expected)?;
                return Ok(false);
            }
            info!(output = %output.display(), "existing game file has an unexpected hash");
        }

        if !self.max_age.is_zero() && !is_outdated(output, self.max_age)? {
            return Ok(false);
        }
        Ok(true)
    }

    fn do_copy(&self, output: &Path) -> Result<()> {
        if let Some(parent) = output.parent() {
            std::fs::create_dir_all(parent).at_path(parent)?;
        }

        let lock = lock_path(output);
        std::fs::File::create(&lock).at_path(&lock)?;

        let part = part_path(output);
        for stale in [output, part.as_path()] {
            match std::fs::remove_file(stale) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(stale, e)),
            }
        }

        let expected_len = std::fs::metadata(&self.source)
            .at_path(&self.source)?
            .len();
        let copied = std::fs::copy(&self.source, &part).at_path(&part)?;
        if copied != expected_len {
            return Err(CacheError::io(
                &part,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("unexpected file length of {copied} bytes, expected {expected_len} bytes"),
                ),
            ));
        }
        std::fs::rename(&part, output).at_path(output)?;

        if let Some(expected) = &self.expected_hash {
            if !hash_matches(expected, output)? {
                let actual = sha1_file(output).unwrap_or_else(|_| "unknown hash".to_string());
                return Err(CacheError::io(
                    output,
                    std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!(
                            "copied {} with expected hash {expected}, got sha1:{actual}",
                            self.source.display()
                        ),
                    ),
                ));
            }
            write_attribute(output, HASH_ATTRIBUTE, expected)?;
        }

        std::fs::remove_file(&lock).at_path(&lock)?;
        Ok(())
    }
}

fn sibling_with_suffix(output: &Path, suffix: &str) -> PathBuf {
    let mut os = output.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

fn part_path(output: &Path) -> PathBuf {
    sibling_with_suffix(output, ".part")
}

fn lock_path(output: &Path) -> PathBuf {
    sibling_with_suffix(output, ".lock")
}

/// Removes a leftover lock file, returning whether there was one.
fn take_lock(output: &Path) -> Result<bool> {
    let lock = lock_path(output);
    match std::fs::remove_file(&lock) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::io(lock, e)),
    }
}

fn hash_matches(expected: &str, path: &Path) -> Result<bool> {
    let Some((algorithm, hash)) = expected.split_once(':') else {
        return Err(CacheError::invalid(format!("hash without algorithm: {expected}")));
    };
    if algorithm != "sha1" {
        return Err(CacheError::invalid(format!(
            "unsupported hash algorithm ({algorithm})"
        )));
    }
    Ok(sha1_file(path)?.eq_ignore_ascii_case(hash))
}

fn is_outdated(path: &Path, max_age: Duration) -> Result<bool> {
    let modified = std::fs::metadata(path).at_path(path)?.modified().at_path(path)?;
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    Ok(age > max_age)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    pub copied: usize,
    pub up_to_date: usize,
    /// Tasks not attempted because an earlier task failed.
    pub skipped: usize,
}

/// Runs copy tasks concurrently; the first failure stops tasks that have not started.
pub struct CopyExecutor {
    threads: usize,
}

impl CopyExecutor {
    pub fn new(threads: usize) -> Self {
        Self {
            threads: threads.max(1),
        }
    }

    pub fn with_default_threads() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(cores.min(MAX_COPY_THREADS))
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn run(&self, tasks: &[(CopyGameFile, PathBuf)]) -> Result<CopyReport> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .map_err(|e| CacheError::IllegalState(format!("failed to build copy pool: {e}")))?;

        let failed = AtomicBool::new(false);
        let copied = AtomicUsize::new(0);
        let up_to_date = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let errors: Mutex<Vec<CacheError>> = Mutex::new(Vec::new());

        pool.scope(|scope| {
            for (task, output) in tasks {
                let (failed, copied, up_to_date, skipped, errors) =
                    (&failed, &copied, &up_to_date, &skipped, &errors);
                scope.spawn(move |_| {
                    if failed.load(Ordering::SeqCst) {
                        skipped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    match task.copy_to(output) {
                        Ok(CopyOutcome::Copied) => {
                            copied.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(CopyOutcome::UpToDate) => {
                            up_to_date.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            failed.store(true, Ordering::SeqCst);
                            warn!(source = %task.source().display(), error = %e, "game file copy failed");
                            errors
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .push(e);
                        }
                    }
                });
            }
        });

        let errors = errors
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(error) = CacheError::aggregate(errors) {
            return Err(error);
        }

        Ok(CopyReport {
            copied: copied.into_inner(),
            up_to_date: up_to_date.into_inner(),
            skipped: skipped.into_inner(),
        })
    }
}
