//! Per-file string attributes stored in sidecar files next to the file they describe.

use std::path::{Path, PathBuf};

use crate::error::{CacheError, IoResultExt, Result};

pub const ATTRIBUTE_SUFFIX: &str = ".att";

pub fn attribute_path(path: &Path, key: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(format!(".{key}{ATTRIBUTE_SUFFIX}"));
    PathBuf::from(os)
}

pub fn read_attribute(path: &Path, key: &str) -> Result<Option<String>> {
    let sidecar = attribute_path(path, key);
    match std::fs::read_to_string(&sidecar) {
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::io(sidecar, e)),
    }
}

pub fn write_attribute(path: &Path, key: &str, value: &str) -> Result<()> {
    let sidecar = attribute_path(path, key);
    std::fs::write(&sidecar, value).at_path(sidecar)
}
