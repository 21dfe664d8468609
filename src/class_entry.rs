//! Class identity: one outer class file, its inner classes and its immediate parents.

use std::collections::HashMap;
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::hash::sha256_hex;
use crate::jar::{Jar, JarBuilder};

pub const CLASS_SUFFIX: &str = ".class";
pub const SOURCE_SUFFIX: &str = ".java";
const PLATFORM_PREFIX: &str = "java/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassEntry {
    name: String,
    inner_classes: Vec<String>,
    super_classes: Vec<String>,
}

impl ClassEntry {
    /// `name` is the class file path inside the jar, e.g. `net/example/Foo.class`.
    /// `super_classes` holds the super class and interfaces of the class and all of its inner
    /// classes, each as a class file path.
    pub fn new(
        name: impl Into<String>,
        inner_classes: Vec<String>,
        super_classes: Vec<String>,
    ) -> Result<Self> {
        let name = name.into();
        let Some(class_name) = name.strip_suffix(CLASS_SUFFIX) else {
            return Err(CacheError::invalid(format!(
                "class name must end with '{CLASS_SUFFIX}': {name}"
            )));
        };
        if !name.contains('/') {
            return Err(CacheError::invalid(format!(
                "class name must be in a package: {name}"
            )));
        }

        for inner in &inner_classes {
            if !inner.ends_with(CLASS_SUFFIX) {
                return Err(CacheError::invalid(format!(
                    "inner class name must end with '{CLASS_SUFFIX}': {inner}"
                )));
            }
            if !inner.starts_with(class_name) {
                return Err(CacheError::invalid(format!(
                    "inner class {inner} does not have the outer class name as a prefix: {name}"
                )));
            }
        }

        if let Some(bad) = super_classes.iter().find(|s| !s.ends_with(CLASS_SUFFIX)) {
            return Err(CacheError::invalid(format!(
                "super class name must end with '{CLASS_SUFFIX}': {bad}"
            )));
        }

        Ok(Self {
            name,
            inner_classes,
            super_classes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inner_classes(&self) -> &[String] {
        &self.inner_classes
    }

    pub fn super_classes(&self) -> &[String] {
        &self.super_classes
    }

    /// The outer class followed by its inner classes.
    pub fn members(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.inner_classes.iter().map(String::as_str))
    }

    /// sha256 over the comma-joined sha256 digests of the class and each inner class.
    pub fn hash(&self, jar: &mut Jar) -> Result<String> {
        let mut digests = Vec::with_capacity(1 + self.inner_classes.len());
        for member in self.members() {
            digests.push(sha256_hex(&jar.read(member)?));
        }
        Ok(sha256_hex(digests.join(",").as_bytes()))
    }

    /// Folds the hashes of every known parent into this class's own hash, so a change in a
    /// parent changes the identity of its children.
    pub fn hash_super_hierarchy(&self, hashes: &HashMap<String, String>) -> Result<String> {
        let self_hash = hashes
            .get(&self.name)
            .ok_or_else(|| CacheError::MissingHash(self.name.clone()))?;

        if self.super_classes.is_empty() {
            return Ok(self_hash.clone());
        }

        let mut parts = vec![self_hash.as_str()];
        for parent in &self.super_classes {
            match hashes.get(parent) {
                Some(hash) => parts.push(hash),
                None if parent.starts_with(PLATFORM_PREFIX) => {}
                None => warn!(class = %self.name, parent = %parent, "hash for super class not found"),
            }
        }
        Ok(sha256_hex(parts.join(",").as_bytes()))
    }

    /// Copies the class and its inner classes into `target`.
    pub fn copy_to(&self, source: &mut Jar, target: &mut JarBuilder) -> Result<()> {
        debug!(
            class = %self.name,
            from = %source.path().display(),
            to = %target.path().display(),
            "copying class entry"
        );
        for member in self.members() {
            target.copy_entry(source, member)?;
        }
        Ok(())
    }

    pub fn sources_file_name(&self) -> String {
        let stem = self
            .name
            .strip_suffix(CLASS_SUFFIX)
            .unwrap_or(self.name.as_str());
        format!("{stem}{SOURCE_SUFFIX}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jar::test_support::{temp_path, write_jar};

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rejects_broken_names() {
        assert!(ClassEntry::new("net/example/Foo", vec![], vec![]).is_err());
        assert!(ClassEntry::new("Foo.class", vec![], vec![]).is_err());
        assert!(
            ClassEntry::new("net/example/Foo.class", strings(&["net/example/Foo$1"]), vec![])
                .is_err()
        );
        assert!(
            ClassEntry::new("net/example/Foo.class", strings(&["net/example/Bar$1.class"]), vec![])
                .is_err()
        );
        assert!(
            ClassEntry::new("net/example/Foo.class", vec![], strings(&["java/lang/Object"]))
                .is_err()
        );

        let ok = ClassEntry::new(
            "net/example/Foo.class",
            strings(&["net/example/Foo$Inner.class"]),
            strings(&["java/lang/Object.class"]),
        );
        assert!(ok.is_ok());
    }

    #[test]
    fn sources_file_name_swaps_suffix() -> Result<()> {
        let entry = ClassEntry::new("net/example/Foo.class", vec![], vec![])?;
        assert_eq!(entry.sources_file_name(), "net/example/Foo.java");
        Ok(())
    }

    #[test]
    fn hash_covers_inner_classes() -> Result<()> {
        let a = temp_path("hash_a.jar");
        let b = temp_path("hash_b.jar");
        write_jar(&a, &[("p/Foo.class", b"outer"), ("p/Foo$1.class", b"inner")])?;
        write_jar(&b, &[("p/Foo.class", b"outer"), ("p/Foo$1.class", b"changed")])?;

        let entry = ClassEntry::new("p/Foo.class", strings(&["p/Foo$1.class"]), vec![])?;
        let hash_a = entry.hash(&mut Jar::open(&a)?)?;
        let hash_b = entry.hash(&mut Jar::open(&b)?)?;
        assert_ne!(hash_a, hash_b);

        let expected = sha256_hex(
            format!("{},{}", sha256_hex(b"outer"), sha256_hex(b"inner")).as_bytes(),
        );
        assert_eq!(hash_a, expected);

        std::fs::remove_file(a).unwrap();
        std::fs::remove_file(b).unwrap();
        Ok(())
    }

    #[test]
    fn hash_fails_on_missing_member() -> Result<()> {
        let path = temp_path("hash_missing.jar");
        write_jar(&path, &[("p/Foo.class", b"outer")])?;
        let entry = ClassEntry::new("p/Foo.class", strings(&["p/Foo$1.class"]), vec![])?;
        assert!(matches!(
            entry.hash(&mut Jar::open(&path)?),
            Err(CacheError::Io { .. })
        ));
        std::fs::remove_file(path).unwrap();
        Ok(())
    }

    #[test]
    fn hierarchy_hash_follows_parents() -> Result<()> {
        let entry = ClassEntry::new(
            "p/B.class",
            vec![],
            strings(&["p/A.class", "java/lang/Runnable.class", "q/Elsewhere.class"]),
        )?;

        let mut hashes = HashMap::new();
        hashes.insert("p/A.class".to_string(), "aaa".to_string());
        hashes.insert("p/B.class".to_string(), "bbb".to_string());

        let first = entry.hash_super_hierarchy(&hashes)?;
        assert_eq!(first, entry.hash_super_hierarchy(&hashes)?);
        assert_eq!(first, sha256_hex(b"bbb,aaa"));

        hashes.insert("p/A.class".to_string(), "aab".to_string());
        assert_ne!(first, entry.hash_super_hierarchy(&hashes)?);
        Ok(())
    }

    #[test]
    fn hierarchy_hash_without_parents_is_own_hash() -> Result<()> {
        let entry = ClassEntry::new("p/A.class", vec![], vec![])?;
        let hashes = HashMap::from([("p/A.class".to_string(), "aaa".to_string())]);
        assert_eq!(entry.hash_super_hierarchy(&hashes)?, "aaa");

        assert!(matches!(
            entry.hash_super_hierarchy(&HashMap::new()),
            Err(CacheError::MissingHash(_))
        ));
        Ok(())
    }

    #[test]
    fn copy_to_moves_outer_and_inner() -> Result<()> {
        let input = temp_path("copy_src.jar");
        let output = temp_path("copy_dst.jar");
        write_jar(
            &input,
            &[
                ("p/Foo.class", b"outer"),
                ("p/Foo$1.class", b"inner"),
                ("p/Other.class", b"other"),
            ],
        )?;

        let entry = ClassEntry::new("p/Foo.class", strings(&["p/Foo$1.class"]), vec![])?;
        let mut source = Jar::open(&input)?;
        let mut target = JarBuilder::create(&output)?;
        entry.copy_to(&mut source, &mut target)?;
        target.finish()?;

        let copied = Jar::open(&output)?;
        let names: Vec<&str> = copied.entries().collect();
        assert_eq!(names, vec!["p/Foo$1.class", "p/Foo.class"]);

        std::fs::remove_file(input).unwrap();
        std::fs::remove_file(output).unwrap();
        Ok(())
    }
}
