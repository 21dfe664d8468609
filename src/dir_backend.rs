//! Directory-tree entry backend: one file per key, last access kept as the file's mtime.

use filetime::FileTime;
use ignore::WalkBuilder;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::cache::EntryBackend;
use crate::error::{CacheError, IoResultExt, Result};

const PART_SUFFIX: &str = ".part";

pub struct DirBackend {
    root: PathBuf,
}

impl DirBackend {
    /// Opens (creating if needed) the store rooted at `root`. A plain file in the way is
    /// replaced by an empty store.
    pub fn open(root: &Path) -> Result<Self> {
        if root.exists() && !root.is_dir() {
            warn!(path = %root.display(), "cache location is not a directory, recreating it");
            std::fs::remove_file(root).at_path(root)?;
        }
        std::fs::create_dir_all(root).at_path(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl EntryBackend for DirBackend {
    fn kind(&self) -> &'static str {
        "dir"
    }

    fn location(&self) -> &Path {
        &self.root
    }

    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.entry_path(key);
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(path, e)),
        }
    }

    fn write(&self, key: &str, value: &str, stamp: u64) -> Result<()> {
        let path = self.entry_path(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).at_path(parent)?;
        }

        let mut part_os = path.as_os_str().to_os_string();
        part_os.push(PART_SUFFIX);
        let part = PathBuf::from(part_os);
        std::fs::write(&part, value).at_path(&part)?;
        filetime::set_file_mtime(&part, to_file_time(stamp)).at_path(&part)?;
        std::fs::rename(&part, &path).at_path(&path)?;
        Ok(())
    }

    fn touch(&self, keys: &[String], stamp: u64) -> Result<()> {
        for key in keys {
            let path = self.entry_path(key);
            if path.is_file() {
                filetime::set_file_mtime(&path, to_file_time(stamp)).at_path(&path)?;
            }
        }
        Ok(())
    }

    fn stamps(&self) -> Result<Vec<(String, u64)>> {
        let mut out = Vec::new();
        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .build();

        for entry in walker {
            let entry = entry.map_err(|e| {
                CacheError::io(&self.root, std::io::Error::other(e.to_string()))
            })?;
            let path = entry.path();
            if !entry.file_type().is_some_and(|t| t.is_file())
                || path.to_string_lossy().ends_with(PART_SUFFIX)
            {
                continue;
            }

            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let metadata = entry.metadata().map_err(|e| {
                CacheError::io(path, std::io::Error::other(e.to_string()))
            })?;
            out.push((key, from_file_time(FileTime::from_last_modification_time(&metadata))));
        }
        Ok(out)
    }

    fn remove(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            let path = self.entry_path(key);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(path, e)),
            }
            // Empty hash prefix directories are removed, non-empty ones stay.
            if let Some(parent) = path.parent()
                && parent != self.root
            {
                let _ = std::fs::remove_dir(parent);
            }
        }
        Ok(())
    }
}

fn to_file_time(millis: u64) -> FileTime {
    FileTime::from_unix_time((millis / 1000) as i64, ((millis % 1000) * 1_000_000) as u32)
}

fn from_file_time(time: FileTime) -> u64 {
    let seconds = time.unix_seconds().max(0) as u64;
    seconds * 1000 + u64::from(time.nanoseconds()) / 1_000_000
}
