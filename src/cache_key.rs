//! The base hash salting every cache key with the decompiler's identity.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::Result;
use crate::hash::{sha1_file, sha1_hex, sha256_hex, short_hex};

#[derive(Debug, Clone)]
pub struct DecompilerCacheKey {
    pub decompiler_name: String,
    /// Files whose content affects decompiler output, e.g. the decompiler jar and libraries.
    pub classpath: Vec<PathBuf>,
    pub options: BTreeMap<String, String>,
}

impl DecompilerCacheKey {
    /// sha256 of `name,classpathFingerprint,key=value,...`. Changing the decompiler, its
    /// inputs or its options yields a different base hash.
    pub fn base_hash(&self) -> Result<String> {
        Ok(sha256_hex(self.material()?.as_bytes()))
    }

    /// Eight hex chars, for file names.
    pub fn short_key(&self) -> Result<String> {
        Ok(short_hex(self.material()?.as_bytes()))
    }

    fn material(&self) -> Result<String> {
        let mut parts = vec![self.decompiler_name.clone(), self.classpath_fingerprint()?];
        parts.extend(self.options.iter().map(|(k, v)| format!("{k}={v}")));
        Ok(parts.join(","))
    }

    fn classpath_fingerprint(&self) -> Result<String> {
        let mut digests = Vec::with_capacity(self.classpath.len());
        for path in &self.classpath {
            digests.push(sha1_file(path)?);
        }
        Ok(sha1_hex(digests.join(",").as_bytes()))
    }
}
