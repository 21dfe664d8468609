//! Sources jar generation, with or without the decompile cache.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cache::{CacheRules, PersistentEntryStore, PruneReport, StoreKind, clear};
use crate::cache_key::DecompilerCacheKey;
use crate::decompiler::{DecompilationMetadata, Decompiler};
use crate::error::{CacheError, Result};
use crate::jar::remove_if_exists;
use crate::linemap::ClassLineNumbers;
use crate::processor::{CacheStats, CachedJarProcessor};

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub input_jar: PathBuf,
    pub output_jar: PathBuf,
    /// Where to write the merged line map, if wanted.
    pub line_map: Option<PathBuf>,
    pub libraries: Vec<PathBuf>,
    pub decompiler_options: BTreeMap<String, String>,
    pub max_threads: usize,
    pub use_cache: bool,
    pub reset_cache: bool,
    pub cache_path: PathBuf,
    pub store_kind: StoreKind,
    pub rules: CacheRules,
    /// Files whose content is folded into the base hash, e.g. the decompiler jar.
    pub key_files: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
pub struct GenerateReport {
    pub output_jar: String,
    pub cached: bool,
    pub base_hash: Option<String>,
    pub job: Option<&'static str>,
    pub stats: Option<CacheStats>,
    pub stored_entries: usize,
    pub line_numbers: usize,
    pub prune: Option<PruneReport>,
}

pub struct SourcesGenerator<'d> {
    decompiler: &'d dyn Decompiler,
    options: GenerateOptions,
}

impl<'d> SourcesGenerator<'d> {
    pub fn new(decompiler: &'d dyn Decompiler, options: GenerateOptions) -> Self {
        Self {
            decompiler,
            options,
        }
    }

    pub fn run(&self) -> Result<GenerateReport> {
        if self.options.use_cache {
            self.run_cached()
        } else {
            self.run_uncached()
        }
    }

    fn metadata(&self, extra_libraries: Option<&Path>) -> DecompilationMetadata {
        let mut libraries = self.options.libraries.clone();
        libraries.extend(extra_libraries.map(Path::to_path_buf));
        DecompilationMetadata {
            max_threads: self.options.max_threads,
            libraries,
            options: self.options.decompiler_options.clone(),
        }
    }

    /// Runs the decompiler and reads back the line map it wrote, if any.
    fn decompile(
        &self,
        input: &Path,
        output: &Path,
        extra_libraries: Option<&Path>,
    ) -> Result<Option<ClassLineNumbers>> {
        let line_map = sibling(output, ".linemap");
        remove_if_exists(&line_map)?;

        info!(input = %input.display(), decompiler = %self.decompiler.name(), "decompiling");
        self.decompiler.decompile(
            input,
            output,
            &line_map,
            &self.metadata(extra_libraries),
            &mut |line| debug!(target: "decompiler", "{line}"),
        )?;

        if !output.exists() {
            return Err(CacheError::IllegalState(format!(
                "decompiler did not produce an output jar at {}",
                output.display()
            )));
        }

        if !line_map.exists() {
            return Ok(None);
        }
        let numbers = ClassLineNumbers::read(&line_map)?;
        remove_if_exists(&line_map)?;
        Ok(Some(numbers))
    }

    fn run_uncached(&self) -> Result<GenerateReport> {
        let numbers = self.decompile(&self.options.input_jar, &self.options.output_jar, None)?;
        let line_numbers = self.write_line_map(numbers)?;
        Ok(GenerateReport {
            output_jar: self.options.output_jar.to_string_lossy().to_string(),
            cached: false,
            base_hash: None,
            job: None,
            stats: None,
            stored_entries: 0,
            line_numbers,
            prune: None,
        })
    }

    fn run_cached(&self) -> Result<GenerateReport> {
        let options = &self.options;
        if options.reset_cache && clear(&options.cache_path)? {
            info!(path = %options.cache_path.display(), "reset decompile cache");
        }

        let store = PersistentEntryStore::open_kind(options.store_kind, &options.cache_path, options.rules)?;
        let key = DecompilerCacheKey {
            decompiler_name: self.decompiler.name(),
            classpath: options.key_files.clone(),
            options: options.decompiler_options.clone(),
        };
        let base_hash = key.base_hash()?;

        let processor = CachedJarProcessor::new(&store, base_hash.clone());
        let request = processor.prepare_job(&options.input_jar)?;
        info!(
            hits = request.stats.hits,
            misses = request.stats.misses,
            job = request.job.kind(),
            "decompile cache stats"
        );

        let job_kind = request.job.kind();
        let work = request
            .job
            .incomplete()
            .zip(request.job.output())
            .map(|(incomplete, produced)| (incomplete.to_path_buf(), produced.to_path_buf()));
        let existing_classes = request.job.existing_classes().map(Path::to_path_buf);

        let new_numbers = match work {
            Some((incomplete, produced)) => {
                match self.decompile(&incomplete, &produced, existing_classes.as_deref()) {
                    Ok(numbers) => numbers,
                    Err(e) => {
                        request.job.discard();
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        let stored_entries =
            processor.complete_job(&options.output_jar, request.job, new_numbers.as_ref())?;
        let merged = ClassLineNumbers::merge(request.line_numbers, new_numbers)?;
        let line_numbers = self.write_line_map(merged)?;
        let prune = store.prune()?;

        Ok(GenerateReport {
            output_jar: options.output_jar.to_string_lossy().to_string(),
            cached: true,
            base_hash: Some(base_hash),
            job: Some(job_kind),
            stats: Some(request.stats),
            stored_entries,
            line_numbers,
            prune: Some(prune),
        })
    }

    /// Writes the line map when one was asked for. A stale file from an earlier run is removed
    /// when there is nothing to write.
    fn write_line_map(&self, numbers: Option<ClassLineNumbers>) -> Result<usize> {
        let Some(path) = &self.options.line_map else {
            return Ok(0);
        };
        match numbers {
            Some(numbers) => {
                numbers.write(path)?;
                Ok(numbers.len())
            }
            None => {
                remove_if_exists(path)?;
                Ok(0)
            }
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}
