use anyhow::{Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::info;

use crate::cache::{CacheRules, StoreKind};
use crate::cli::Cli;

pub const CACHE_FILE_ENV: &str = "DECOMP_CACHE_FILE";
pub const MAX_FILES_ENV: &str = "DECOMP_CACHE_MAX_FILES";
pub const MAX_AGE_ENV: &str = "DECOMP_CACHE_MAX_AGE";

const CACHE_NAME: &str = "decompile-cache-v1";

pub fn resolve_cache_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.cache.clone() {
        return Ok(p);
    }

    if let Ok(p) = env::var(CACHE_FILE_ENV) {
        return Ok(PathBuf::from(p));
    }

    default_cache_path(StoreKind::from(cli.store))
}

pub fn default_cache_path(kind: StoreKind) -> Result<PathBuf> {
    let home = decomp_cache_home()?;
    Ok(match kind {
        StoreKind::Lmdb => home.join(format!("{CACHE_NAME}.lmdb")),
        StoreKind::Dir => home.join(CACHE_NAME),
    })
}

pub fn resolve_rules(cli: &Cli) -> Result<CacheRules> {
    let defaults = CacheRules::default();
    let max_entries = match cli.max_cached_files {
        Some(n) => n,
        None => env_value(MAX_FILES_ENV)?.unwrap_or(defaults.max_entries),
    };
    let max_age_days = match cli.max_cache_age {
        Some(days) => days,
        None => env_value(MAX_AGE_ENV)?.unwrap_or(defaults.max_age.as_secs() / 86_400),
    };
    Ok(CacheRules::new(max_entries, max_age_days))
}

pub fn resolve_cfr_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = cli.cfr.clone() {
        return Ok(p);
    }

    if let Ok(p) = env::var("CFR_JAR") {
        return Ok(PathBuf::from(p));
    }

    let default_path = decomp_cache_home()?.join("tools").join("cfr.jar");
    if default_path.exists() {
        return Ok(default_path);
    }

    install_cfr_if_missing(&default_path)?;
    Ok(default_path)
}

/// The LMDB environment keeps its reader table next to the data file when opened with
/// `NO_SUB_DIR`.
pub fn lmdb_lock_path(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_os_string();
    os.push("-lock");
    PathBuf::from(os)
}

fn env_value<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("Invalid value for {name}: {raw}")),
        Err(_) => Ok(None),
    }
}

fn decomp_cache_home() -> Result<PathBuf> {
    let base = dirs::data_local_dir()
        .or_else(dirs::cache_dir)
        .or_else(dirs::home_dir)
        .ok_or_else(|| anyhow::anyhow!("Failed to resolve data directory"))?;
    Ok(base.join("decomp-cache"))
}

fn install_cfr_if_missing(target_path: &Path) -> Result<()> {
    if target_path.exists() {
        return Ok(());
    }

    let url = "https://github.com/leibnitz27/cfr/releases/download/0.152/cfr-0.152.jar";
    if let Some(parent) = target_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    info!(path = %target_path.display(), "CFR not found, downloading");
    let status = std::process::Command::new("curl")
        .args([
            "-L",
            "--fail",
            "--silent",
            "--show-error",
            "-o",
            target_path
                .to_str()
                .context("cfr.jar target path is not valid UTF-8")?,
            url,
        ])
        .status()
        .context(
            "Failed to execute curl (ensure curl is installed, or use --cfr to specify cfr.jar)",
        )?;

    if !status.success() {
        anyhow::bail!("Failed to download CFR ({status}). You can use --cfr to specify local cfr.jar");
    }

    Ok(())
}
