//! Groups the class files of a jar into [`ClassEntry`] values.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::class_entry::{CLASS_SUFFIX, ClassEntry};
use crate::classfile::parse_header;
use crate::error::Result;
use crate::jar::Jar;

const META_INF: &str = "META-INF/";
const MODULE_INFO: &str = "module-info.class";

/// Finds every class in the jar, with inner classes grouped under their outer class.
/// The result is sorted by outer class name.
pub fn find_classes(jar: &mut Jar) -> Result<Vec<ClassEntry>> {
    let classes: BTreeSet<String> = jar
        .entries()
        .filter(|name| is_class_entry(name))
        .map(str::to_string)
        .collect();

    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for name in &classes {
        match outer_class_of(name) {
            Some(outer) if classes.contains(&outer) => {
                groups.entry(outer).or_default().push(name.clone());
            }
            Some(_) => {
                debug!(class = %name, "inner class without outer class, treating as standalone");
                groups.entry(name.clone()).or_default();
            }
            None => {
                groups.entry(name.clone()).or_default();
            }
        }
    }

    let mut entries = Vec::with_capacity(groups.len());
    for (outer, mut inner) in groups {
        inner.sort();
        let super_classes = collect_parents(jar, &outer, &inner)?;
        entries.push(ClassEntry::new(outer, inner, super_classes)?);
    }
    Ok(entries)
}

fn is_class_entry(name: &str) -> bool {
    if !name.ends_with(CLASS_SUFFIX) || name.starts_with(META_INF) {
        return false;
    }
    let file_name = name.rsplit('/').next().unwrap_or(name);
    file_name != MODULE_INFO
}

/// `p/Foo$Bar$1.class` -> `p/Foo.class`. `None` for top level classes.
fn outer_class_of(name: &str) -> Option<String> {
    let (dir, file) = match name.rfind('/') {
        Some(pos) => name.split_at(pos + 1),
        None => ("", name),
    };
    let dollar = file.find('$')?;
    if dollar == 0 {
        return None;
    }
    Some(format!("{dir}{}{CLASS_SUFFIX}", &file[..dollar]))
}

fn collect_parents(jar: &mut Jar, outer: &str, inner: &[String]) -> Result<Vec<String>> {
    let members: Vec<&str> = std::iter::once(outer)
        .chain(inner.iter().map(String::as_str))
        .collect();
    let group: BTreeSet<&str> = members.iter().copied().collect();

    let mut seen = BTreeSet::new();
    let mut parents = Vec::new();
    for member in members {
        let bytes = jar.read(member)?;
        let header = parse_header(member, &bytes)?;
        for parent in header.parents() {
            let file = format!("{parent}{CLASS_SUFFIX}");
            if group.contains(file.as_str()) || !seen.insert(file.clone()) {
                continue;
            }
            parents.push(file);
        }
    }
    Ok(parents)
}
