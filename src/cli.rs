use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::cache::StoreKind;

#[derive(Debug, Clone, Parser)]
#[command(name = "decomp-cache")]
#[command(about = "Decompile class jars to source jars, reusing cached sources for unchanged classes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Cache location. An LMDB file, or a directory with `--store dir`.
    #[arg(long, value_name = "PATH")]
    pub cache: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = StoreArg::Lmdb)]
    pub store: StoreArg,

    #[arg(long, value_name = "FILE")]
    pub cfr: Option<PathBuf>,

    #[arg(long, value_name = "N")]
    pub max_cached_files: Option<usize>,

    #[arg(long, value_name = "DAYS")]
    pub max_cache_age: Option<u64>,

    /// Raise log verbosity (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short = 'v', long, action = ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Decompile a classes jar into a sources jar.
    GenSources {
        input: PathBuf,

        #[arg(short = 'o', long, value_name = "JAR")]
        output: PathBuf,

        #[arg(long, value_name = "FILE")]
        line_map: Option<PathBuf>,

        #[arg(long = "library", value_name = "JAR")]
        libraries: Vec<PathBuf>,

        /// Decompiler option, passed through as `--KEY VALUE`.
        #[arg(long = "option", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        options: Vec<(String, String)>,

        #[arg(long, value_name = "N")]
        threads: Option<usize>,

        #[arg(long)]
        no_cache: bool,

        #[arg(long)]
        reset_cache: bool,

        /// Serialize runs for this project through a lock file next to the cache.
        #[arg(long, value_name = "DIR")]
        project: Option<PathBuf>,
    },
    /// Evict expired and excess cache entries.
    Prune,
    Stats,
    Clear,
    /// Split a client and a server jar into client-only and common jars.
    Split {
        client: PathBuf,

        server: PathBuf,

        #[arg(long, value_name = "JAR")]
        client_only: PathBuf,

        #[arg(long, value_name = "JAR")]
        common: PathBuf,

        #[arg(long = "shared", value_name = "ENTRY")]
        shared: Vec<String>,

        #[arg(long = "force-client", value_name = "ENTRY")]
        forced_client: Vec<String>,
    },
    /// List the regular entries of a jar.
    Entries {
        jar: PathBuf,

        #[arg(long)]
        hashes: bool,
    },
    CopyGameFiles {
        /// `SRC=DEST`, optionally followed by `=sha1:HEX`.
        #[arg(long = "file", value_name = "SRC=DEST[=HASH]", value_parser = parse_copy_task, required = true)]
        files: Vec<CopyTaskArg>,

        #[arg(long, value_name = "DAYS", default_value_t = 0)]
        max_age_days: u64,

        #[arg(long)]
        force: bool,

        #[arg(long, value_name = "N")]
        threads: Option<usize>,
    },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum StoreArg {
    Lmdb,
    Dir,
}

impl From<StoreArg> for StoreKind {
    fn from(value: StoreArg) -> Self {
        match value {
            StoreArg::Lmdb => StoreKind::Lmdb,
            StoreArg::Dir => StoreKind::Dir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTaskArg {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub expected_hash: Option<String>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty option name in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_copy_task(raw: &str) -> Result<CopyTaskArg, String> {
    let mut parts = raw.splitn(3, '=');
    let source = parts.next().filter(|s| !s.is_empty());
    let destination = parts.next().filter(|s| !s.is_empty());
    let (Some(source), Some(destination)) = (source, destination) else {
        return Err(format!("expected SRC=DEST[=HASH], got `{raw}`"));
    };
    let expected_hash = match parts.next() {
        Some(hash) if hash.starts_with("sha1:") => Some(hash.to_string()),
        Some(hash) => return Err(format!("unsupported hash `{hash}`, expected sha1:HEX")),
        None => None,
    };
    Ok(CopyTaskArg {
        source: PathBuf::from(source),
        destination: PathBuf::from(destination),
        expected_hash,
    })
}
