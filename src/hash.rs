//! Content digests.
//!
//! Two strengths are used: sha256 for class identity and cache keys, and sha1 for
//! file-change detection and short keys.

use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{IoResultExt, Result};

const SHORT_KEY_LENGTH: usize = 8;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha1_file(path: &Path) -> Result<String> {
    digest_file::<Sha1>(path)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    digest_file::<Sha256>(path)
}

/// First eight hex chars of the sha1 digest.
pub fn short_hex(bytes: &[u8]) -> String {
    let mut full = sha1_hex(bytes);
    full.truncate(SHORT_KEY_LENGTH);
    full
}

fn digest_file<D: Digest>(path: &Path) -> Result<String> {
    let mut file = File::open(path).at_path(path)?;
    let mut hasher = D::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).at_path(path)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
