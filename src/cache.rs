//! Persistent, bounded store for decompiled sources keyed by content hash.
//!
//! Values are [`CachedData`] serialized as JSON. Each entry carries a last-access timestamp
//! used by [`PersistentEntryStore::prune`] to enforce [`CacheRules`]. The default backend is
//! a single-file LMDB environment (via heed); [`crate::dir_backend::DirBackend`] stores the
//! same data as a directory tree.

use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions, MdbError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::config::lmdb_lock_path;
use crate::dir_backend::DirBackend;
use crate::error::{CacheError, IoResultExt, Result};
use crate::linemap::ClassLineEntry;

pub const ENTRIES_DB: &str = "entries";
pub const ENTRY_TIMES_DB: &str = "entry_times";

const DEFAULT_MAP_SIZE: usize = 1024 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 4;
/// Map size doublings tried for one write before giving up.
const MAX_MAP_GROWTHS: u32 = 8;
const DAY: Duration = Duration::from_secs(24 * 60 * 60);

type StrDb = Database<Str, Str>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Single-file LMDB environment.
    #[default]
    Lmdb,
    /// One file per entry under a directory.
    Dir,
}

/// Bounds enforced by [`PersistentEntryStore::prune`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheRules {
    pub max_entries: usize,
    pub max_age: Duration,
}

impl CacheRules {
    pub fn new(max_entries: usize, max_age_days: u64) -> Self {
        Self {
            max_entries,
            max_age: Duration::from_secs(DAY.as_secs().saturating_mul(max_age_days)),
        }
    }
}

impl Default for CacheRules {
    fn default() -> Self {
        Self::new(50_000, 90)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedData {
    pub class_name: String,
    pub sources: String,
    pub line_numbers: Option<ClassLineEntry>,
}

impl CachedData {
    pub fn new(
        class_name: impl Into<String>,
        sources: impl Into<String>,
        line_numbers: Option<ClassLineEntry>,
    ) -> Result<Self> {
        let class_name = class_name.into();
        if let Some(entry) = &line_numbers
            && entry.class_name != class_name
        {
            return Err(CacheError::invalid(format!(
                "line number class name {} does not match {class_name}",
                entry.class_name
            )));
        }
        Ok(Self {
            class_name,
            sources: sources.into(),
            line_numbers,
        })
    }
}

/// Storage seam under [`PersistentEntryStore`]. Values are opaque strings and timestamps are
/// milliseconds since the unix epoch.
pub trait EntryBackend: Send {
    fn kind(&self) -> &'static str;
    fn location(&self) -> &Path;
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str, stamp: u64) -> Result<()>;
    /// Updates the timestamp of each existing key. Unknown keys are ignored.
    fn touch(&self, keys: &[String], stamp: u64) -> Result<()>;
    fn stamps(&self) -> Result<Vec<(String, u64)>>;
    fn remove(&self, keys: &[String]) -> Result<()>;
}

pub struct LmdbBackend {
    env: Env,
    path: PathBuf,
    entries: StrDb,
    times: StrDb,
    /// Transactions hold it shared; a map resize holds it exclusively.
    txn_gate: RwLock<()>,
}

impl LmdbBackend {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_map_size(path, DEFAULT_MAP_SIZE)
    }

    /// `map_size` must be a multiple of the OS page size.
    pub(crate) fn open_with_map_size(path: &Path, map_size: usize) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).at_path(parent)?;
        }

        let env = open_env(path, map_size)?;
        let mut wtxn = env.write_txn()?;
        let entries = env.create_database::<Str, Str>(&mut wtxn, Some(ENTRIES_DB))?;
        let times = env.create_database::<Str, Str>(&mut wtxn, Some(ENTRY_TIMES_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            path: path.to_path_buf(),
            entries,
            times,
            txn_gate: RwLock::new(()),
        })
    }

    pub fn map_size(&self) -> usize {
        self.env.info().map_size
    }

    fn shared(&self) -> std::sync::RwLockReadGuard<'_, ()> {
        self.txn_gate
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs a write transaction, doubling the map size each time it reports `MapFull`.
    fn write_growing<F>(&self, mut op: F) -> Result<()>
    where
        F: FnMut(&mut heed::RwTxn<'_>) -> heed::Result<()>,
    {
        let mut growths = 0;
        loop {
            let outcome = {
                let _gate = self.shared();
                let mut wtxn = self.env.write_txn()?;
                op(&mut wtxn).and_then(|()| wtxn.commit())
            };
            match outcome {
                Err(heed::Error::Mdb(MdbError::MapFull)) if growths < MAX_MAP_GROWTHS => {
                    growths += 1;
                    self.grow()?;
                }
                other => return Ok(other?),
            }
        }
    }

    fn grow(&self) -> Result<()> {
        let _gate = self
            .txn_gate
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = self.map_size();
        let next = current.saturating_mul(2);
        warn!(path = %self.path.display(), current, next, "cache map is full, growing it");
        // SAFETY: the exclusive gate means no transaction of this environment is open.
        unsafe { self.env.resize(next)? };
        Ok(())
    }

    /// Reads every timestamp back, which fails on a damaged environment.
    pub fn validate(&self) -> Result<()> {
        let _gate = self.shared();
        let rtxn = self.env.read_txn()?;
        let entries = self.entries.len(&rtxn)?;
        let mut times = 0u64;
        for item in self.times.iter(&rtxn)? {
            let (key, value) = item?;
            parse_stamp(key, value)?;
            times += 1;
        }
        if entries != times {
            return Err(CacheError::invalid(format!(
                "{entries} entries but {times} timestamps"
            )));
        }
        Ok(())
    }
}

impl EntryBackend for LmdbBackend {
    fn kind(&self) -> &'static str {
        "lmdb"
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        let _gate = self.shared();
        let rtxn = self.env.read_txn()?;
        Ok(self.entries.get(&rtxn, key)?.map(str::to_string))
    }

    fn write(&self, key: &str, value: &str, stamp: u64) -> Result<()> {
        let stamp = stamp.to_string();
        self.write_growing(|wtxn| {
            self.entries.put(wtxn, key, value)?;
            self.times.put(wtxn, key, stamp.as_str())
        })
    }

    fn touch(&self, keys: &[String], stamp: u64) -> Result<()> {
        let stamp = stamp.to_string();
        self.write_growing(|wtxn| {
            for key in keys {
                if self.times.get(&*wtxn, key.as_str())?.is_some() {
                    self.times.put(wtxn, key.as_str(), stamp.as_str())?;
                }
            }
            Ok(())
        })
    }

    fn stamps(&self) -> Result<Vec<(String, u64)>> {
        let _gate = self.shared();
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for item in self.times.iter(&rtxn)? {
            let (key, value) = item?;
            out.push((key.to_string(), parse_stamp(key, value)?));
        }
        Ok(out)
    }

    fn remove(&self, keys: &[String]) -> Result<()> {
        let _gate = self.shared();
        let mut wtxn = self.env.write_txn()?;
        for key in keys {
            self.entries.delete(&mut wtxn, key.as_str())?;
            self.times.delete(&mut wtxn, key.as_str())?;
        }
        wtxn.commit()?;
        Ok(())
    }
}

fn open_env(path: &Path, map_size: usize) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(map_size);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: Default LMDB locking stays on. NO_SUB_DIR keeps the store a single file
    // next to its `-lock` file.
    let env = unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options.open(path)?
    };
    Ok(env)
}

fn parse_stamp(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| CacheError::invalid(format!("corrupt timestamp for {key}: {value}")))
}

pub(crate) fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub expired: usize,
    pub evicted: usize,
    pub remaining: usize,
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub path: String,
    pub backend: &'static str,
    pub entries: usize,
    pub oldest_access_ms: Option<u64>,
    pub newest_access_ms: Option<u64>,
    pub max_entries: usize,
    pub max_age_days: u64,
}

pub struct PersistentEntryStore {
    backend: Box<dyn EntryBackend>,
    rules: CacheRules,
    touched: Mutex<BTreeSet<String>>,
}

impl PersistentEntryStore {
    pub fn new(backend: Box<dyn EntryBackend>, rules: CacheRules) -> Self {
        Self {
            backend,
            rules,
            touched: Mutex::new(BTreeSet::new()),
        }
    }

    /// Opens the LMDB store at `path`, creating it if missing.
    pub fn open(path: &Path, rules: CacheRules) -> Result<Self> {
        Ok(Self::new(Box::new(LmdbBackend::open(path)?), rules))
    }

    /// Like [`Self::open`], but a store that cannot be opened or read back is deleted and
    /// recreated empty.
    pub fn open_validated(path: &Path, rules: CacheRules) -> Result<Self> {
        let opened = LmdbBackend::open(path).and_then(|backend| {
            backend.validate()?;
            Ok(backend)
        });

        let backend = match opened {
            Ok(backend) => backend,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "decompile cache is unreadable, recreating it"
                );
                clear(path)?;
                LmdbBackend::open(path)?
            }
        };
        Ok(Self::new(Box::new(backend), rules))
    }

    /// Opens a store of the given kind, recreating it when unreadable.
    pub fn open_kind(kind: StoreKind, path: &Path, rules: CacheRules) -> Result<Self> {
        match kind {
            StoreKind::Lmdb => Self::open_validated(path, rules),
            StoreKind::Dir => Ok(Self::new(Box::new(DirBackend::open(path)?), rules)),
        }
    }

    pub fn rules(&self) -> CacheRules {
        self.rules
    }

    pub fn location(&self) -> &Path {
        self.backend.location()
    }

    /// `None` is a cache miss. A hit refreshes the entry's access time.
    pub fn get_entry(&self, hash: &str) -> Result<Option<CachedData>> {
        validate_key(hash)?;
        let Some(raw) = self.backend.read(hash)? else {
            return Ok(None);
        };
        let data: CachedData = match serde_json::from_str(&raw) {
            Ok(data) => data,
            Err(err) => {
                warn!(key = hash, error = %err, "dropping undecodable cache entry");
                self.backend.remove(&[hash.to_string()])?;
                self.touched_keys().remove(hash);
                return Ok(None);
            }
        };
        self.touched_keys().insert(hash.to_string());
        Ok(Some(data))
    }

    pub fn put_entry(&self, hash: &str, data: &CachedData) -> Result<()> {
        self.put_entry_at(hash, data, SystemTime::now())
    }

    pub(crate) fn put_entry_at(&self, hash: &str, data: &CachedData, now: SystemTime) -> Result<()> {
        validate_key(hash)?;
        let raw = serde_json::to_string(data)?;
        self.backend.write(hash, &raw, unix_millis(now))?;
        self.touched_keys().remove(hash);
        debug!(hash, class = %data.class_name, "stored cache entry");
        Ok(())
    }

    /// Writes pending access-time refreshes.
    pub fn flush(&self) -> Result<()> {
        self.flush_at(SystemTime::now())
    }

    fn flush_at(&self, now: SystemTime) -> Result<()> {
        let keys: Vec<String> = std::mem::take(&mut *self.touched_keys())
            .into_iter()
            .collect();
        if keys.is_empty() {
            return Ok(());
        }
        self.backend.touch(&keys, unix_millis(now))
    }

    /// Drops entries older than the age bound, then the oldest entries until the count
    /// bound holds.
    pub fn prune(&self) -> Result<PruneReport> {
        self.prune_at(SystemTime::now())
    }

    pub(crate) fn prune_at(&self, now: SystemTime) -> Result<PruneReport> {
        self.flush_at(now)?;

        let now_ms = unix_millis(now);
        let max_age_ms = self.rules.max_age.as_millis() as u64;
        let (expired, mut live): (Vec<_>, Vec<_>) = self
            .backend
            .stamps()?
            .into_iter()
            .partition(|(_, stamp)| now_ms.saturating_sub(*stamp) > max_age_ms);

        let expired: Vec<String> = expired.into_iter().map(|(key, _)| key).collect();
        self.backend.remove(&expired)?;

        let mut evicted = Vec::new();
        if live.len() > self.rules.max_entries {
            live.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            let excess = live.len() - self.rules.max_entries;
            evicted = live.drain(..excess).map(|(key, _)| key).collect();
            self.backend.remove(&evicted)?;
        }

        let report = PruneReport {
            expired: expired.len(),
            evicted: evicted.len(),
            remaining: live.len(),
        };
        info!(
            expired = report.expired,
            evicted = report.evicted,
            remaining = report.remaining,
            "pruned decompile cache"
        );
        Ok(report)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.flush()?;
        let stamps = self.backend.stamps()?;
        Ok(StoreStats {
            path: self.location().to_string_lossy().to_string(),
            backend: self.backend.kind(),
            entries: stamps.len(),
            oldest_access_ms: stamps.iter().map(|(_, s)| *s).min(),
            newest_access_ms: stamps.iter().map(|(_, s)| *s).max(),
            max_entries: self.rules.max_entries,
            max_age_days: self.rules.max_age.as_secs() / DAY.as_secs(),
        })
    }

    fn touched_keys(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.touched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for PersistentEntryStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!(error = %e, "failed to record cache access times");
        }
    }
}

/// Deletes the store at `path` (file and lock file, or a directory store). Returns whether
/// anything was removed.
pub fn clear(path: &Path) -> Result<bool> {
    if path.is_dir() {
        std::fs::remove_dir_all(path).at_path(path)?;
        return Ok(true);
    }
    let mut removed = false;
    for file in [path.to_path_buf(), lmdb_lock_path(path)] {
        match std::fs::remove_file(&file) {
            Ok(()) => removed = true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(file, e)),
        }
    }
    Ok(removed)
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.split('/').any(|part| part == "..") {
        return Err(CacheError::invalid(format!("invalid cache key: {key:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jar::test_support::temp_path;
    use std::collections::BTreeMap;

    fn data(class_name: &str) -> CachedData {
        CachedData::new(class_name, format!("class {class_name} {{}}"), None).unwrap()
    }

    fn open(name: &str, rules: CacheRules) -> (PathBuf, PersistentEntryStore) {
        let path = temp_path(name);
        let store = PersistentEntryStore::open(&path, rules).unwrap();
        (path, store)
    }

    fn cleanup(path: &Path) {
        let _ = clear(path);
    }

    #[test]
    fn cached_data_rejects_mismatched_line_numbers() {
        let entry = ClassLineEntry {
            class_name: "p/Other".to_string(),
            max_line: 1,
            max_line_dest: 1,
            line_map: BTreeMap::new(),
        };
        assert!(CachedData::new("p/A", "src", Some(entry.clone())).is_err());

        let entry = ClassLineEntry {
            class_name: "p/A".to_string(),
            ..entry
        };
        assert!(CachedData::new("p/A", "src", Some(entry)).is_ok());
    }

    #[test]
    fn put_then_get() -> Result<()> {
        let (path, store) = open("store_basic.lmdb", CacheRules::default());

        assert_eq!(store.get_entry("v1/abc")?, None);
        store.put_entry("v1/abc", &data("p/A"))?;
        assert_eq!(store.get_entry("v1/abc")?, Some(data("p/A")));
        assert_eq!(store.stats()?.entries, 1);

        drop(store);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn undecodable_entry_is_a_miss_and_removed() -> Result<()> {
        let path = temp_path("store_truncated.lmdb");
        let backend = LmdbBackend::open(&path)?;
        backend.write("v1/abc", r#"{"class_name":"p/A""#, unix_millis(SystemTime::now()))?;
        let store = PersistentEntryStore::new(Box::new(backend), CacheRules::default());

        assert_eq!(store.get_entry("v1/abc")?, None);
        assert_eq!(store.stats()?.entries, 0);

        store.put_entry("v1/abc", &data("p/A"))?;
        assert_eq!(store.get_entry("v1/abc")?, Some(data("p/A")));

        drop(store);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn full_map_grows_instead_of_failing() -> Result<()> {
        let path = temp_path("store_small_map.lmdb");
        let initial = 128 * 1024;
        let backend = LmdbBackend::open_with_map_size(&path, initial)?;
        let big = "x".repeat(64 * 1024);
        for i in 0..8 {
            backend.write(&format!("v1/{i}"), &big, 1)?;
        }
        assert!(backend.map_size() > initial);
        for i in 0..8 {
            assert_eq!(backend.read(&format!("v1/{i}"))?.as_deref(), Some(big.as_str()));
        }

        drop(backend);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn rejects_escaping_keys() {
        let (path, store) = open("store_keys.lmdb", CacheRules::default());
        assert!(store.get_entry("").is_err());
        assert!(store.get_entry("/abs").is_err());
        assert!(store.put_entry("v1/../x", &data("p/A")).is_err());
        drop(store);
        cleanup(&path);
    }

    #[test]
    fn prune_removes_expired_entries() -> Result<()> {
        let (path, store) = open("store_age.lmdb", CacheRules::new(100, 10));
        let now = SystemTime::now();

        store.put_entry_at("v1/old", &data("p/Old"), now - DAY * 11)?;
        store.put_entry_at("v1/new", &data("p/New"), now - DAY * 2)?;

        let report = store.prune_at(now)?;
        assert_eq!(report.expired, 1);
        assert_eq!(report.remaining, 1);
        assert_eq!(store.get_entry("v1/old")?, None);
        assert!(store.get_entry("v1/new")?.is_some());

        drop(store);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn prune_evicts_oldest_over_count() -> Result<()> {
        let (path, store) = open("store_count.lmdb", CacheRules::new(2, 90));
        let now = SystemTime::now();

        for (i, key) in ["v1/a", "v1/b", "v1/c", "v1/d"].iter().enumerate() {
            let age = Duration::from_secs(60 * (10 - i as u64));
            store.put_entry_at(key, &data("p/X"), now - age)?;
        }

        let report = store.prune_at(now)?;
        assert_eq!(report.evicted, 2);
        assert_eq!(report.remaining, 2);
        assert_eq!(store.get_entry("v1/a")?, None);
        assert_eq!(store.get_entry("v1/b")?, None);
        assert!(store.get_entry("v1/c")?.is_some());
        assert!(store.get_entry("v1/d")?.is_some());

        drop(store);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn reads_refresh_access_time() -> Result<()> {
        let (path, store) = open("store_touch.lmdb", CacheRules::new(100, 10));
        let now = SystemTime::now();

        store.put_entry_at("v1/read", &data("p/Read"), now - DAY * 20)?;
        store.put_entry_at("v1/idle", &data("p/Idle"), now - DAY * 20)?;
        assert!(store.get_entry("v1/read")?.is_some());

        let report = store.prune_at(now)?;
        assert_eq!(report.expired, 1);
        assert!(store.get_entry("v1/read")?.is_some());
        assert_eq!(store.get_entry("v1/idle")?, None);

        drop(store);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn entries_survive_reopen() -> Result<()> {
        let (path, store) = open("store_reopen.lmdb", CacheRules::default());
        store.put_entry("v1/keep", &data("p/Keep"))?;
        drop(store);

        let store = PersistentEntryStore::open_validated(&path, CacheRules::default())?;
        assert_eq!(store.get_entry("v1/keep")?, Some(data("p/Keep")));

        drop(store);
        cleanup(&path);
        Ok(())
    }

    #[test]
    fn corrupt_store_is_recreated() -> Result<()> {
        let path = temp_path("store_corrupt.lmdb");
        std::fs::write(&path, vec![0x5a; 512]).unwrap();

        let store = PersistentEntryStore::open_validated(&path, CacheRules::default())?;
        assert_eq!(store.get_entry("v1/any")?, None);
        store.put_entry("v1/any", &data("p/Any"))?;
        assert!(store.get_entry("v1/any")?.is_some());

        drop(store);
        cleanup(&path);
        Ok(())
    }
}
