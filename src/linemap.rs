//! Bytecode-line to source-line mappings produced by the decompiler.
//!
//! The text form has one header line per class, `class\tmaxLine\tmaxLineDest`, followed by
//! one `\tsrc\tdst` line per mapped line.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{CacheError, IoResultExt, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLineEntry {
    pub class_name: String,
    pub max_line: u32,
    pub max_line_dest: u32,
    pub line_map: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassLineNumbers {
    entries: BTreeMap<String, ClassLineEntry>,
}

impl ClassLineNumbers {
    pub fn new(entries: BTreeMap<String, ClassLineEntry>) -> Self {
        Self { entries }
    }

    pub fn get(&self, class_name: &str) -> Option<&ClassLineEntry> {
        self.entries.get(class_name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &BTreeMap<String, ClassLineEntry> {
        &self.entries
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).at_path(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        let mut current: Option<ClassLineEntry> = None;

        for (index, line) in text.lines().enumerate() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }

            if let Some(mapping) = line.strip_prefix('\t') {
                let Some(entry) = current.as_mut() else {
                    return Err(malformed(index, "mapping before any class header"));
                };
                let (src, dst) = mapping
                    .split_once('\t')
                    .ok_or_else(|| malformed(index, "expected two columns"))?;
                entry
                    .line_map
                    .insert(parse_line(index, src)?, parse_line(index, dst)?);
                continue;
            }

            let parts: Vec<&str> = line.split('\t').collect();
            let [class_name, max_line, max_line_dest] = parts.as_slice() else {
                return Err(malformed(index, "expected three columns in class header"));
            };
            if let Some(done) = current.take() {
                entries.insert(done.class_name.clone(), done);
            }
            current = Some(ClassLineEntry {
                class_name: class_name.to_string(),
                max_line: parse_line(index, max_line)?,
                max_line_dest: parse_line(index, max_line_dest)?,
                line_map: BTreeMap::new(),
            });
        }
        if let Some(done) = current {
            entries.insert(done.class_name.clone(), done);
        }

        Ok(Self { entries })
    }

    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for entry in self.entries.values() {
            out.push_str(&format!(
                "{}\t{}\t{}\n",
                entry.class_name, entry.max_line, entry.max_line_dest
            ));
            for (src, dst) in &entry.line_map {
                out.push_str(&format!("\t{src}\t{dst}\n"));
            }
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_text()).at_path(path)
    }

    /// Union of two optional mappings. A class present in both is an error.
    pub fn merge(a: Option<Self>, b: Option<Self>) -> Result<Option<Self>> {
        match (a, b) {
            (None, None) => Ok(None),
            (Some(only), None) | (None, Some(only)) => Ok(Some(only)),
            (Some(mut a), Some(b)) => {
                for (name, entry) in b.entries {
                    if a.entries.contains_key(&name) {
                        return Err(CacheError::IllegalState(format!(
                            "duplicate line numbers for class {name}"
                        )));
                    }
                    a.entries.insert(name, entry);
                }
                Ok(Some(a))
            }
        }
    }
}

fn parse_line(index: usize, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| malformed(index, &format!("not a line number: {value}")))
}

fn malformed(index: usize, reason: &str) -> CacheError {
    CacheError::invalid(format!("malformed line map at line {}: {reason}", index + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "p/A\t12\t20\n\t3\t5\n\t7\t9\np/B\t4\t4\n";

    #[test]
    fn parses_headers_and_mappings() -> Result<()> {
        let numbers = ClassLineNumbers::parse(SAMPLE)?;
        assert_eq!(numbers.len(), 2);

        let a = numbers.get("p/A").unwrap();
        assert_eq!(a.max_line, 12);
        assert_eq!(a.max_line_dest, 20);
        assert_eq!(a.line_map.get(&7), Some(&9));
        assert!(numbers.get("p/B").unwrap().line_map.is_empty());

        assert_eq!(numbers.to_text(), SAMPLE);
        Ok(())
    }

    #[test]
    fn rejects_orphan_mapping_lines() {
        assert!(ClassLineNumbers::parse("\t1\t2\n").is_err());
        assert!(ClassLineNumbers::parse("p/A\t1\n").is_err());
        assert!(ClassLineNumbers::parse("p/A\tx\t1\n").is_err());
    }

    #[test]
    fn merge_rejects_duplicate_classes() -> Result<()> {
        let a = ClassLineNumbers::parse("p/A\t1\t1\n")?;
        let b = ClassLineNumbers::parse("p/B\t2\t2\n")?;

        let merged = ClassLineNumbers::merge(Some(a.clone()), Some(b))?.unwrap();
        assert_eq!(merged.len(), 2);

        assert_eq!(ClassLineNumbers::merge(None, Some(a.clone()))?, Some(a.clone()));
        assert_eq!(ClassLineNumbers::merge(None, None)?, None);
        assert!(matches!(
            ClassLineNumbers::merge(Some(a.clone()), Some(a)),
            Err(CacheError::IllegalState(_))
        ));
        Ok(())
    }
}
