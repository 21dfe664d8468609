//! Error types for the decompile cache.
//!
//! Library modules return [`Result`]; the CLI wraps these in `anyhow` for reporting.

use std::path::{Path, PathBuf};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// A value violated a naming or format invariant at construction time.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("zip error in {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("invalid class file {path}: {reason}")]
    InvalidClassFile { path: String, reason: String },

    /// Hierarchy hashing was asked for a class whose own hash was never computed.
    #[error("hash for own class not found: {0}")]
    MissingHash(String),

    /// A collaborator broke its contract, e.g. the decompiler produced an unexpected file.
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("entry store error: {0}")]
    Store(#[from] heed::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("decompiler failed: {0}")]
    Decompiler(String),

    #[error("timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("failed to copy game files: {first} ({} more suppressed)", .suppressed.len())]
    CopyFailed {
        first: Box<CacheError>,
        suppressed: Vec<CacheError>,
    },
}

impl CacheError {
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn zip(path: impl AsRef<Path>, source: zip::result::ZipError) -> Self {
        Self::Zip {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    /// Folds a batch of failures into one error, keeping the first as the cause.
    pub fn aggregate(mut errors: Vec<CacheError>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let first = errors.remove(0);
        Some(Self::CopyFailed {
            first: Box::new(first),
            suppressed: errors,
        })
    }
}

/// Attaches a path to a bare `std::io::Error`.
pub trait IoResultExt<T> {
    fn at_path(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn at_path(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|e| CacheError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_carries_path() {
        let err = CacheError::io(
            "/tmp/cache/entries.lmdb",
            std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
        );
        let msg = err.to_string();
        assert!(msg.contains("entries.lmdb"));
        assert!(msg.contains("file not found"));
    }

    #[test]
    fn aggregate_keeps_first_and_counts_rest() {
        let errors = vec![
            CacheError::invalid("a"),
            CacheError::invalid("b"),
            CacheError::invalid("c"),
        ];
        let err = CacheError::aggregate(errors).unwrap();
        let msg = err.to_string();
        assert!(msg.contains("invalid argument: a"));
        assert!(msg.contains("2 more suppressed"));
        assert!(CacheError::aggregate(Vec::new()).is_none());
    }
}
