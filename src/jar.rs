//! Jar (zip) entry access.
//!
//! [`Jar`] is a read-only, memory-mapped view over a jar's regular entries, and
//! [`JarBuilder`] writes a new jar, creating parent directory entries on demand the way a
//! zip filesystem would. The free functions implement entry listing and subset copying.

use memmap2::Mmap;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::File;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::attributes::ATTRIBUTE_SUFFIX;
use crate::error::{CacheError, IoResultExt, Result};

pub const MANIFEST_PATH: &str = "META-INF/MANIFEST.MF";
pub const SPLIT_ENV_ATTRIBUTE: &str = "Split-Environment-Name";
/// Sidecar attribute key recording a previously computed entry hash.
pub const HASH_ATTRIBUTE: &str = "EntryHash";

/// Strips the leading `/` some tools write into entry names.
pub fn normalize_entry_name(name: &str) -> &str {
    name.trim_start_matches('/')
}

pub struct Jar {
    path: PathBuf,
    archive: ZipArchive<Cursor<Mmap>>,
    regular: BTreeMap<String, usize>,
}

impl Jar {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).at_path(path)?;
        // SAFETY: The file is opened read-only and the map is owned by the archive, so it
        // outlives every entry read from it.
        let mmap = unsafe { Mmap::map(&file) }.at_path(path)?;
        let mut archive =
            ZipArchive::new(Cursor::new(mmap)).map_err(|e| CacheError::zip(path, e))?;

        let mut regular = BTreeMap::new();
        for i in 0..archive.len() {
            let entry = archive.by_index(i).map_err(|e| CacheError::zip(path, e))?;
            if entry.is_dir() {
                continue;
            }
            regular.insert(normalize_entry_name(entry.name()).to_string(), i);
        }

        Ok(Self {
            path: path.to_path_buf(),
            archive,
            regular,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Regular entry names in lexical order.
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.regular.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.regular.contains_key(normalize_entry_name(name))
    }

    pub fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        let index = self.index_of(name)?;
        let mut entry = self
            .archive
            .by_index(index)
            .map_err(|e| CacheError::zip(&self.path, e))?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut buf)
            .at_path(self.path.join(name))?;
        Ok(buf)
    }

    pub fn read_to_string(&mut self, name: &str) -> Result<String> {
        let bytes = self.read(name)?;
        String::from_utf8(bytes).map_err(|e| {
            CacheError::io(
                self.path.join(name),
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.regular
            .get(normalize_entry_name(name))
            .copied()
            .ok_or_else(|| {
                CacheError::io(
                    self.path.join(name),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "jar entry not found"),
                )
            })
    }
}

pub struct JarBuilder {
    path: PathBuf,
    writer: ZipWriter<File>,
    written: HashSet<String>,
}

impl JarBuilder {
    /// Creates (or truncates) the jar at `path`, creating its parent directory.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).at_path(parent)?;
        }
        let file = File::create(path).at_path(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: ZipWriter::new(file),
            written: HashSet::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, name: &str) -> bool {
        self.written.contains(normalize_entry_name(name))
    }

    pub fn write(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let name = self.claim(name)?;
        self.writer
            .start_file(name.as_str(), file_options())
            .map_err(|e| CacheError::zip(&self.path, e))?;
        self.writer.write_all(bytes).at_path(&self.path)?;
        Ok(())
    }

    /// Copies one entry without recompressing, keeping its timestamps and permissions.
    pub fn copy_entry(&mut self, from: &mut Jar, name: &str) -> Result<()> {
        let index = from.index_of(name)?;
        let name = self.claim(name)?;
        let entry = from
            .archive
            .by_index(index)
            .map_err(|e| CacheError::zip(&from.path, e))?;
        self.writer
            .raw_copy_file_rename(entry, name.as_str())
            .map_err(|e| CacheError::zip(&self.path, e))?;
        Ok(())
    }

    pub fn write_manifest(&mut self, env: Option<&str>) -> Result<()> {
        let mut manifest = String::from("Manifest-Version: 1.0\r\n");
        if let Some(env) = env {
            manifest.push_str(&format!("{SPLIT_ENV_ATTRIBUTE}: {env}\r\n"));
        }
        manifest.push_str("\r\n");
        self.write(MANIFEST_PATH, manifest.as_bytes())
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer
            .finish()
            .map_err(|e| CacheError::zip(&self.path, e))?;
        Ok(self.path)
    }

    fn claim(&mut self, name: &str) -> Result<String> {
        let name = normalize_entry_name(name).to_string();
        if !self.written.insert(name.clone()) {
            return Err(CacheError::invalid(format!(
                "duplicate entry {name} in {}",
                self.path.display()
            )));
        }
        self.ensure_parents(&name)?;
        Ok(name)
    }

    fn ensure_parents(&mut self, name: &str) -> Result<()> {
        let mut end = 0;
        while let Some(pos) = name[end..].find('/') {
            end += pos + 1;
            let dir = &name[..end];
            if self.written.insert(dir.to_string()) {
                self.writer
                    .add_directory(dir, file_options())
                    .map_err(|e| CacheError::zip(&self.path, e))?;
            }
        }
        Ok(())
    }
}

fn file_options() -> FileOptions {
    FileOptions::default().compression_method(CompressionMethod::Deflated)
}

/// Every regular (non-directory) entry of the jar.
pub fn list_regular_entries(jar_path: &Path) -> Result<BTreeSet<String>> {
    let jar = Jar::open(jar_path)?;
    Ok(jar.entries().map(str::to_string).collect())
}

/// Every regular entry mapped to its recorded hash, or `""` when none was recorded.
/// The sidecar attribute entries themselves are left out.
pub fn list_regular_entries_with_hashes(jar_path: &Path) -> Result<BTreeMap<String, String>> {
    let mut jar = Jar::open(jar_path)?;
    let names: Vec<String> = jar.entries().map(str::to_string).collect();

    let mut entries = BTreeMap::new();
    for name in names {
        if name.ends_with(ATTRIBUTE_SUFFIX) {
            continue;
        }
        let sidecar = format!("{name}.{HASH_ATTRIBUTE}{ATTRIBUTE_SUFFIX}");
        let hash = if jar.contains(&sidecar) {
            jar.read_to_string(&sidecar)?.trim().to_string()
        } else {
            String::new()
        };
        entries.insert(name, hash);
    }
    Ok(entries)
}

/// Replaces `output_jar` with a jar holding the listed entries of `input_jar` plus a fresh
/// manifest, optionally tagged with an environment label. Returns the number of entries
/// copied, manifest excluded.
///
/// A listed entry missing from the input is a `NotFound` error and leaves `output_jar`
/// untouched. The listed manifest is always replaced, so it need not exist.
pub fn copy_entries<'a>(
    entries: impl IntoIterator<Item = &'a String>,
    input_jar: &Path,
    output_jar: &Path,
    env: Option<&str>,
) -> Result<usize> {
    let mut input = Jar::open(input_jar)?;

    let mut sorted: Vec<&String> = entries
        .into_iter()
        .filter(|entry| normalize_entry_name(entry) != MANIFEST_PATH)
        .collect();
    sorted.sort();
    if let Some(missing) = sorted.iter().find(|entry| !input.contains(entry)) {
        return Err(CacheError::io(
            input_jar,
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("entry {missing} not found in jar"),
            ),
        ));
    }

    remove_if_exists(output_jar)?;
    let mut output = JarBuilder::create(output_jar)?;
    for entry in &sorted {
        output.copy_entry(&mut input, entry)?;
    }

    output.write_manifest(env)?;
    output.finish()?;
    Ok(sorted.len())
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

/// Moves `from` onto `to`, replacing it. Falls back to copy-then-rename when the two
/// paths are on different filesystems, so `to` is never observed half written.
pub fn replace_file(from: &Path, to: &Path) -> Result<()> {
    if let Some(parent) = to.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).at_path(parent)?;
    }

    match std::fs::rename(from, to) {
        Ok(()) => return Ok(()),
        Err(e) if !is_cross_device(&e) => return Err(CacheError::io(to, e)),
        Err(_) => {}
    }

    let mut tmp_os = to.as_os_str().to_os_string();
    tmp_os.push(".tmp");
    let tmp = PathBuf::from(tmp_os);
    std::fs::copy(from, &tmp).at_path(&tmp)?;
    remove_if_exists(to)?;
    std::fs::rename(&tmp, to).at_path(to)?;
    remove_if_exists(from)?;
    Ok(())
}

#[cfg(unix)]
fn is_cross_device(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_e: &std::io::Error) -> bool {
    true
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    pub fn temp_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "decomp_cache_test_{}_{}_{}_{}",
            std::process::id(),
            nanos,
            n,
            name
        ))
    }

    pub fn write_jar(path: &Path, entries: &[(&str, &[u8])]) -> Result<()> {
        let mut jar = JarBuilder::create(path)?;
        for (name, content) in entries {
            jar.write(name, content)?;
        }
        jar.finish()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn lists_regular_entries_without_directories() -> Result<()> {
        let jar = temp_path("list.jar");
        write_jar(
            &jar,
            &[
                ("org/example/A.class", b"a"),
                ("org/example/sub/B.class", b"b"),
                ("readme.txt", b"hi"),
            ],
        )?;

        let entries = list_regular_entries(&jar)?;
        let expected: BTreeSet<String> = ["org/example/A.class", "org/example/sub/B.class", "readme.txt"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(entries, expected);

        std::fs::remove_file(jar).unwrap();
        Ok(())
    }

    #[test]
    fn hashes_come_from_sidecar_entries() -> Result<()> {
        let jar = temp_path("hashes.jar");
        write_jar(
            &jar,
            &[
                ("a/A.class", b"a"),
                ("a/A.class.EntryHash.att", b"abc123"),
                ("a/B.class", b"b"),
            ],
        )?;

        let entries = list_regular_entries_with_hashes(&jar)?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries["a/A.class"], "abc123");
        assert_eq!(entries["a/B.class"], "");

        std::fs::remove_file(jar).unwrap();
        Ok(())
    }

    #[test]
    fn copy_entries_writes_subset_and_manifest() -> Result<()> {
        let input = temp_path("copy_in.jar");
        let output = temp_path("copy_out.jar");
        write_jar(
            &input,
            &[
                ("a/A.class", b"a"),
                ("a/B.class", b"b"),
                (MANIFEST_PATH, b"Manifest-Version: 1.0\r\nOld: yes\r\n\r\n"),
            ],
        )?;
        std::fs::write(&output, b"stale").unwrap();

        let wanted: BTreeSet<String> = ["a/A.class", MANIFEST_PATH]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(copy_entries(&wanted, &input, &output, Some("client"))?, 1);

        let mut out = Jar::open(&output)?;
        assert_eq!(out.read("a/A.class")?, b"a");
        assert!(!out.contains("a/B.class"));
        let manifest = out.read_to_string(MANIFEST_PATH)?;
        assert!(manifest.contains("Split-Environment-Name: client"));
        assert!(!manifest.contains("Old"));

        std::fs::remove_file(input).unwrap();
        std::fs::remove_file(output).unwrap();
        Ok(())
    }

    #[test]
    fn copy_entries_fails_on_missing_entry() -> Result<()> {
        let input = temp_path("copy_missing_in.jar");
        let output = temp_path("copy_missing_out.jar");
        write_jar(&input, &[("a/A.class", b"a")])?;
        std::fs::write(&output, b"previous").unwrap();

        let wanted: BTreeSet<String> = ["a/A.class", "a/Missing.class"]
            .into_iter()
            .map(String::from)
            .collect();
        let err = copy_entries(&wanted, &input, &output, None).unwrap_err();
        match err {
            CacheError::Io { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
                assert!(source.to_string().contains("a/Missing.class"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(std::fs::read(&output).unwrap(), b"previous");

        std::fs::remove_file(input).unwrap();
        std::fs::remove_file(output).unwrap();
        Ok(())
    }

    #[test]
    fn builder_rejects_duplicate_entries() -> Result<()> {
        let path = temp_path("dup.jar");
        let mut jar = JarBuilder::create(&path)?;
        jar.write("a/A.java", b"x")?;
        assert!(jar.write("/a/A.java", b"y").is_err());
        jar.finish()?;
        std::fs::remove_file(path).unwrap();
        Ok(())
    }

    #[test]
    fn replace_file_overwrites_target() -> Result<()> {
        let from = temp_path("from.bin");
        let to = temp_path("to.bin");
        std::fs::write(&from, b"new").unwrap();
        std::fs::write(&to, b"old").unwrap();

        replace_file(&from, &to)?;
        assert_eq!(std::fs::read(&to).unwrap(), b"new");
        assert!(!from.exists());

        std::fs::remove_file(to).unwrap();
        Ok(())
    }
}
