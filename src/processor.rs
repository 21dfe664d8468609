//! Splits a classes jar into cached and uncached work, then folds decompiler output back
//! into the cache and the final sources jar.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::cache::{CachedData, PersistentEntryStore};
use crate::class_entry::{ClassEntry, SOURCE_SUFFIX};
use crate::error::{CacheError, IoResultExt, Result};
use crate::jar::{Jar, JarBuilder, remove_if_exists, replace_file};
use crate::linemap::{ClassLineEntry, ClassLineNumbers};
use crate::walker::find_classes;

const META_INF: &str = "META-INF/";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
}

/// What is left to do after consulting the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkJob {
    /// Every class was cached; `completed` already is the final sources jar.
    Completed { completed: PathBuf },
    /// Some classes were cached. Only `incomplete` has to be decompiled, into `output`;
    /// `existing_classes` is useful as extra classpath for that run.
    Partial {
        incomplete: PathBuf,
        existing_sources: PathBuf,
        existing_classes: PathBuf,
        output: PathBuf,
        /// Source file name to cache key.
        output_name_map: BTreeMap<String, String>,
    },
    /// Nothing was cached. `incomplete` is the input jar itself.
    Full {
        incomplete: PathBuf,
        output: PathBuf,
        output_name_map: BTreeMap<String, String>,
    },
}

impl WorkJob {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkJob::Completed { .. } => "completed",
            WorkJob::Partial { .. } => "partial",
            WorkJob::Full { .. } => "full",
        }
    }

    /// The jar the decompiler has to process, if any.
    pub fn incomplete(&self) -> Option<&Path> {
        match self {
            WorkJob::Completed { .. } => None,
            WorkJob::Partial { incomplete, .. } | WorkJob::Full { incomplete, .. } => {
                Some(incomplete)
            }
        }
    }

    /// The jar the decompiler has to write, if any.
    pub fn output(&self) -> Option<&Path> {
        match self {
            WorkJob::Completed { .. } => None,
            WorkJob::Partial { output, .. } | WorkJob::Full { output, .. } => Some(output),
        }
    }

    pub fn existing_classes(&self) -> Option<&Path> {
        match self {
            WorkJob::Partial {
                existing_classes, ..
            } => Some(existing_classes),
            _ => None,
        }
    }

    /// Best-effort removal of the intermediate jars of an abandoned job. The input jar of a
    /// full job is left alone.
    pub fn discard(self) {
        let paths = match self {
            WorkJob::Completed { completed } => vec![completed],
            WorkJob::Partial {
                incomplete,
                existing_sources,
                existing_classes,
                output,
                ..
            } => vec![incomplete, existing_sources, existing_classes, output],
            WorkJob::Full { output, .. } => vec![output],
        };
        for path in paths {
            let _ = remove_if_exists(&path);
        }
    }
}

#[derive(Debug)]
pub struct WorkRequest {
    pub job: WorkJob,
    pub stats: CacheStats,
    /// Line numbers of the cached classes.
    pub line_numbers: Option<ClassLineNumbers>,
}

pub struct CachedJarProcessor<'a> {
    store: &'a PersistentEntryStore,
    base_hash: String,
    work_dir: PathBuf,
}

struct TempJars {
    incomplete: PathBuf,
    existing_sources: PathBuf,
    existing_classes: PathBuf,
}

impl TempJars {
    fn discard(&self) {
        for path in [&self.incomplete, &self.existing_sources, &self.existing_classes] {
            let _ = remove_if_exists(path);
        }
    }
}

struct Partition {
    stats: CacheStats,
    output_name_map: BTreeMap<String, String>,
    line_numbers: BTreeMap<String, ClassLineEntry>,
}

impl<'a> CachedJarProcessor<'a> {
    pub fn new(store: &'a PersistentEntryStore, base_hash: impl Into<String>) -> Self {
        Self {
            store,
            base_hash: base_hash.into(),
            work_dir: std::env::temp_dir(),
        }
    }

    /// Directory for the intermediate jars.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn base_hash(&self) -> &str {
        &self.base_hash
    }

    pub fn prepare_job(&self, input_jar: &Path) -> Result<WorkRequest> {
        std::fs::create_dir_all(&self.work_dir).at_path(&self.work_dir)?;
        let temps = TempJars {
            incomplete: self.temp_jar("decomp-cache-incomplete")?,
            existing_sources: self.temp_jar("decomp-cache-existing-sources")?,
            existing_classes: self.temp_jar("decomp-cache-existing-classes")?,
        };

        let partition = match self.partition(input_jar, &temps) {
            Ok(partition) => partition,
            Err(e) => {
                temps.discard();
                return Err(e);
            }
        };

        let output = self.temp_jar("decomp-cache-output")?;
        remove_if_exists(&output)?;

        let Partition {
            stats,
            output_name_map,
            line_numbers,
        } = partition;
        let line_numbers =
            (!line_numbers.is_empty()).then(|| ClassLineNumbers::new(line_numbers));

        let job = if stats.misses > 0 && stats.hits == 0 {
            temps.discard();
            info!("no cached entries found, processing the whole jar");
            WorkJob::Full {
                incomplete: input_jar.to_path_buf(),
                output,
                output_name_map,
            }
        } else if stats.misses > 0 {
            info!("some cached entries found, using partial work job");
            WorkJob::Partial {
                incomplete: temps.incomplete,
                existing_sources: temps.existing_sources,
                existing_classes: temps.existing_classes,
                output,
                output_name_map,
            }
        } else {
            info!("all cached entries found, using completed work job");
            remove_if_exists(&temps.incomplete)?;
            remove_if_exists(&temps.existing_classes)?;
            WorkJob::Completed {
                completed: temps.existing_sources,
            }
        };

        Ok(WorkRequest {
            job,
            stats,
            line_numbers,
        })
    }

    fn partition(&self, input_jar: &Path, temps: &TempJars) -> Result<Partition> {
        let mut input = Jar::open(input_jar)?;
        let mut incomplete = JarBuilder::create(&temps.incomplete)?;
        let mut existing_sources = JarBuilder::create(&temps.existing_sources)?;
        let mut existing_classes = JarBuilder::create(&temps.existing_classes)?;

        let classes = find_classes(&mut input)?;
        let raw_hashes = entry_hashes(&classes, &mut input)?;

        let mut partition = Partition {
            stats: CacheStats::default(),
            output_name_map: BTreeMap::new(),
            line_numbers: BTreeMap::new(),
        };

        for entry in &classes {
            let output_file_name = entry.sources_file_name();
            let full_hash = format!(
                "{}/{}",
                self.base_hash,
                entry.hash_super_hierarchy(&raw_hashes)?
            );

            match self.store.get_entry(&full_hash)? {
                None => {
                    entry.copy_to(&mut input, &mut incomplete)?;
                    debug!(hash = %full_hash, file = %output_file_name, "cache miss");
                    partition
                        .output_name_map
                        .insert(output_file_name, full_hash);
                    partition.stats.misses += 1;
                }
                Some(data) => {
                    existing_sources.write(&output_file_name, data.sources.as_bytes())?;
                    entry.copy_to(&mut input, &mut existing_classes)?;
                    match data.line_numbers {
                        Some(lines) => {
                            partition.line_numbers.insert(data.class_name, lines);
                        }
                        None => debug!(file = %output_file_name, "cached entry has no line numbers"),
                    }
                    debug!(hash = %full_hash, file = %output_file_name, "cache hit");
                    partition.stats.hits += 1;
                }
            }
        }

        incomplete.finish()?;
        existing_sources.finish()?;
        existing_classes.finish()?;
        Ok(partition)
    }

    /// Stores the freshly decompiled sources and moves the final jar to `output`. Returns
    /// the number of entries written to the cache.
    pub fn complete_job(
        &self,
        output: &Path,
        job: WorkJob,
        line_numbers: Option<&ClassLineNumbers>,
    ) -> Result<usize> {
        match job {
            WorkJob::Completed { completed } => {
                replace_file(&completed, output)?;
                Ok(0)
            }
            WorkJob::Full {
                output: produced,
                output_name_map,
                ..
            } => {
                let stored = self.store_outputs(&produced, &output_name_map, line_numbers)?;
                replace_file(&produced, output)?;
                Ok(stored)
            }
            WorkJob::Partial {
                incomplete,
                existing_sources,
                existing_classes,
                output: produced,
                output_name_map,
            } => {
                let stored = self.store_outputs(&produced, &output_name_map, line_numbers)?;

                let mut merged_os = produced.as_os_str().to_os_string();
                merged_os.push(".merged");
                let merged_path = PathBuf::from(merged_os);
                if let Err(err) = merge_jars(&[&produced, &existing_sources], &merged_path) {
                    remove_if_exists(&merged_path)?;
                    return Err(err);
                }

                for path in [&existing_sources, &existing_classes, &incomplete, &produced] {
                    remove_if_exists(path)?;
                }
                replace_file(&merged_path, output)?;
                Ok(stored)
            }
        }
    }

    fn store_outputs(
        &self,
        produced: &Path,
        output_name_map: &BTreeMap<String, String>,
        line_numbers: Option<&ClassLineNumbers>,
    ) -> Result<usize> {
        let mut jar = Jar::open(produced)?;
        let names: Vec<String> = jar
            .entries()
            .filter(|name| !name.starts_with(META_INF))
            .map(str::to_string)
            .collect();

        for name in &names {
            let hash = output_name_map.get(name).ok_or_else(|| {
                CacheError::IllegalState(format!(
                    "unexpected output: {name} in {}",
                    produced.display()
                ))
            })?;
            let class_name = name.strip_suffix(SOURCE_SUFFIX).unwrap_or(name);
            let sources = jar.read_to_string(name)?;

            let lines = line_numbers.and_then(|l| l.get(class_name)).cloned();
            if lines.is_none() {
                debug!(class = class_name, "no line numbers generated");
            }

            let data = CachedData::new(class_name, sources, lines)?;
            self.store.put_entry(hash, &data)?;
            debug!(hash = %hash, file = %name, "saved processed entry to cache");
        }
        Ok(names.len())
    }

    fn temp_jar(&self, prefix: &str) -> Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(".jar")
            .tempfile_in(&self.work_dir)
            .at_path(&self.work_dir)?;
        file.into_temp_path()
            .keep()
            .map_err(|e| CacheError::io(&self.work_dir, e.error))
    }
}

/// Own hash of every outer class, shared by its inner classes.
fn entry_hashes(classes: &[ClassEntry], jar: &mut Jar) -> Result<HashMap<String, String>> {
    let mut hashes = HashMap::new();
    for entry in classes {
        let hash = entry.hash(jar)?;
        for member in entry.members() {
            hashes.insert(member.to_string(), hash.clone());
        }
    }
    Ok(hashes)
}

/// Writes every regular entry of `inputs` into a new jar at `target`. Only the first
/// `META-INF/` copy of a name is kept; any other name present twice is `IllegalState`.
fn merge_jars(inputs: &[&Path], target: &Path) -> Result<()> {
    let mut merged = JarBuilder::create(target)?;
    for input in inputs {
        let mut jar = Jar::open(input)?;
        let names: Vec<String> = jar.entries().map(str::to_string).collect();
        for name in names {
            if merged.contains(&name) {
                if name.starts_with(META_INF) {
                    continue;
                }
                return Err(CacheError::IllegalState(format!(
                    "{name} from {} is already in the merged sources",
                    input.display()
                )));
            }
            debug!(entry = %name, from = %input.display(), "merging entry");
            merged.copy_entry(&mut jar, &name)?;
        }
    }
    merged.finish()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Stands in for a decompiler: one `.java` file per outer class, whose text embeds the
    /// digest of the class bytes.
    pub fn fake_decompile(input: &Path, output: &Path) -> Result<()> {
        let mut jar = Jar::open(input)?;
        let mut out = JarBuilder::create(output)?;
        let names: Vec<String> = jar
            .entries()
            .filter(|n| n.ends_with(".class") && !n.contains('$'))
            .map(str::to_string)
            .collect();
        for name in names {
            let bytes = jar.read(&name)?;
            let stem = name.trim_end_matches(".class");
            let text = format!(
                "// {stem}\nclass X {{}} // {}\n",
                crate::hash::sha256_hex(&bytes)
            );
            out.write(&format!("{stem}.java"), text.as_bytes())?;
        }
        out.finish()?;
        Ok(())
    }
}
