use anyhow::{Context, Result};
use clap::Parser;
use decomp_cache::cache::{PersistentEntryStore, StoreKind, clear};
use decomp_cache::cfr::Cfr;
use decomp_cache::cli::{Cli, Commands, CopyTaskArg};
use decomp_cache::config::{resolve_cache_path, resolve_cfr_path, resolve_rules};
use decomp_cache::copy::{CopyExecutor, CopyGameFile};
use decomp_cache::generate::{GenerateOptions, GenerateReport, SourcesGenerator};
use decomp_cache::jar::{list_regular_entries, list_regular_entries_with_hashes};
use decomp_cache::lock::{LockResult, ProjectLock};
use decomp_cache::split::JarSplitter;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.clone() {
        Commands::Clear => {
            let cache_path = resolve_cache_path(&cli)?;
            let removed = clear(&cache_path)
                .with_context(|| format!("Failed to clear cache: {}", cache_path.display()))?;
            print_json(&ClearResult {
                path: cache_path.to_string_lossy().to_string(),
                removed,
            })?;
        }
        Commands::Stats => {
            let store = open_store(&cli)?;
            print_json(&store.stats()?)?;
        }
        Commands::Prune => {
            let store = open_store(&cli)?;
            print_json(&store.prune()?)?;
        }
        Commands::GenSources {
            input,
            output,
            line_map,
            libraries,
            options,
            threads,
            no_cache,
            reset_cache,
            project,
        } => {
            let cfr_jar = resolve_cfr_path(&cli)?;
            let options = GenerateOptions {
                input_jar: input,
                output_jar: output,
                line_map,
                libraries,
                decompiler_options: options.into_iter().collect(),
                max_threads: threads.unwrap_or_else(default_threads),
                use_cache: !no_cache,
                reset_cache,
                cache_path: resolve_cache_path(&cli)?,
                store_kind: StoreKind::from(cli.store),
                rules: resolve_rules(&cli)?,
                key_files: vec![cfr_jar.clone()],
            };
            let result = gen_sources(&Cfr::new(cfr_jar), options, project.as_deref())?;
            print_json(&result)?;
        }
        Commands::Split {
            client,
            server,
            client_only,
            common,
            shared,
            forced_client,
        } => {
            let mut splitter = JarSplitter::new(client, server);
            for entry in shared {
                splitter.shared_entry(entry);
            }
            for entry in forced_client {
                splitter.forced_client_entry(entry);
            }
            let report = splitter
                .split(&client_only, &common)
                .context("Failed to split jars")?;
            print_json(&report)?;
        }
        Commands::Entries { jar, hashes } => {
            if hashes {
                print_json(&list_regular_entries_with_hashes(&jar)?)?;
            } else {
                print_json(&list_regular_entries(&jar)?)?;
            }
        }
        Commands::CopyGameFiles {
            files,
            max_age_days,
            force,
            threads,
        } => {
            let executor = match threads {
                Some(n) => CopyExecutor::new(n),
                None => CopyExecutor::with_default_threads(),
            };
            let tasks = copy_tasks(files, max_age_days, force);
            let start = Instant::now();
            let report = executor.run(&tasks).context("Failed to copy game files")?;
            info!(
                copied = report.copied,
                up_to_date = report.up_to_date,
                duration_ms = start.elapsed().as_millis() as u64,
                "copied game files"
            );
            print_json(&report)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_store(cli: &Cli) -> Result<PersistentEntryStore> {
    let cache_path = resolve_cache_path(cli)?;
    PersistentEntryStore::open_kind(StoreKind::from(cli.store), &cache_path, resolve_rules(cli)?)
        .with_context(|| format!("Failed to open cache: {}", cache_path.display()))
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Serialize)]
struct ClearResult {
    path: String,
    removed: bool,
}

#[derive(Debug, Serialize)]
struct GenSourcesResult {
    #[serde(flatten)]
    report: GenerateReport,
    lock: Option<LockResult>,
    duration_ms: u64,
}

fn gen_sources(cfr: &Cfr, mut options: GenerateOptions, project: Option<&Path>) -> Result<GenSourcesResult> {
    let start = Instant::now();

    let lock = project.map(|project| {
        let lock_dir = options
            .cache_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        ProjectLock::for_project(&lock_dir, project)
    });

    let lock_result = match &lock {
        Some(lock) => {
            let result = lock.acquire_default()?;
            if result.needs_cache_reset() && options.use_cache {
                warn!(?result, "previous run did not finish cleanly, resetting decompile cache");
                options.reset_cache = true;
            }
            Some(result)
        }
        None => None,
    };

    let input = options.input_jar.clone();
    let generated = SourcesGenerator::new(cfr, options).run();

    if let Some(lock) = &lock {
        if generated.is_ok() {
            lock.release()?;
        } else {
            lock.disown()?;
        }
    }

    let report =
        generated.with_context(|| format!("Failed to generate sources for {}", input.display()))?;
    Ok(GenSourcesResult {
        report,
        lock: lock_result,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn copy_tasks(files: Vec<CopyTaskArg>, max_age_days: u64, force: bool) -> Vec<(CopyGameFile, PathBuf)> {
    let max_age = Duration::from_secs(max_age_days.saturating_mul(86_400));
    files
        .into_iter()
        .map(|task| {
            let mut copy = CopyGameFile::new(task.source).max_age(max_age).forced(force);
            if let Some(hash) = task.expected_hash {
                copy = copy.expected_hash(hash);
            }
            (copy, task.destination)
        })
        .collect()
}
