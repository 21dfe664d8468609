//! JVM class file header reader.
//!
//! Headers are parsed with `jclassfile`. Class files it rejects, and names it could not
//! decode, go through a minimal constant-pool walk that stops after the interfaces.
//! Both paths decode names as modified UTF-8.

use crate::error::{CacheError, Result};
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use tracing::debug;

const MAGIC: u32 = 0xCAFE_BABE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassHeader {
    /// Internal name, e.g. `net/example/Foo`.
    pub name: String,
    pub super_name: Option<String>,
    pub interfaces: Vec<String>,
}

impl ClassHeader {
    /// Super class followed by interfaces, in declaration order.
    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.super_name
            .iter()
            .map(String::as_str)
            .chain(self.interfaces.iter().map(String::as_str))
    }

    fn has_replacement_chars(&self) -> bool {
        std::iter::once(self.name.as_str())
            .chain(self.parents())
            .any(|name| name.contains(char::REPLACEMENT_CHARACTER))
    }
}

#[derive(Clone)]
enum PoolEntry {
    Utf8(String),
    Class(u16),
    Other,
}

struct Reader<'a> {
    data: &'a [u8],
    offset: usize,
    path: &'a str,
}

impl<'a> Reader<'a> {
    fn fail(&self, reason: impl Into<String>) -> CacheError {
        CacheError::InvalidClassFile {
            path: self.path.to_string(),
            reason: reason.into(),
        }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.offset + len;
        let slice = self
            .data
            .get(self.offset..end)
            .ok_or_else(|| self.fail("class file out of bounds"))?;
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Parses the header of a class file. `path` is only used for error messages.
pub fn parse_header(path: &str, data: &[u8]) -> Result<ClassHeader> {
    match parse_with_jclassfile(data) {
        Ok(header) if !header.has_replacement_chars() => Ok(header),
        Ok(_) => {
            debug!(path, "class names were decoded lossily, re-reading constant pool");
            parse_header_minimal(path, data)
        }
        Err(reason) => {
            debug!(path, %reason, "falling back to minimal class header reader");
            parse_header_minimal(path, data)
        }
    }
}

fn parse_with_jclassfile(data: &[u8]) -> std::result::Result<ClassHeader, String> {
    let class_file = class_file::parse(data).map_err(|err| format!("{err}"))?;
    let constant_pool = class_file.constant_pool();

    let name = resolve_class_name(constant_pool, class_file.this_class())?;
    let super_name = match class_file.super_class() {
        0 => None,
        index => Some(resolve_class_name(constant_pool, index)?),
    };
    let mut interfaces = Vec::new();
    for interface in class_file.interfaces() {
        interfaces.push(resolve_class_name(constant_pool, *interface)?);
    }

    Ok(ClassHeader {
        name,
        super_name,
        interfaces,
    })
}

fn resolve_class_name(constant_pool: &[ConstantPool], index: u16) -> std::result::Result<String, String> {
    match constant_pool.get(index as usize) {
        Some(ConstantPool::Class { name_index }) => match constant_pool.get(*name_index as usize) {
            Some(ConstantPool::Utf8 { value }) => Ok(value.clone()),
            _ => Err(format!("constant {name_index} is not a utf8 entry")),
        },
        _ => Err(format!("constant {index} is not a class")),
    }
}

fn parse_header_minimal(path: &str, data: &[u8]) -> Result<ClassHeader> {
    let mut reader = Reader {
        data,
        offset: 0,
        path,
    };

    if reader.u32()? != MAGIC {
        return Err(reader.fail("invalid class file magic"));
    }
    let _minor = reader.u16()?;
    let _major = reader.u16()?;
    let pool = read_constant_pool(&mut reader)?;
    let _access_flags = reader.u16()?;
    let this_class = reader.u16()?;
    let super_class = reader.u16()?;

    let name = resolve_class(&reader, &pool, this_class)?;
    let super_name = match super_class {
        0 => None,
        index => Some(resolve_class(&reader, &pool, index)?),
    };

    let count = reader.u16()? as usize;
    let mut interfaces = Vec::with_capacity(count);
    for _ in 0..count {
        let index = reader.u16()?;
        interfaces.push(resolve_class(&reader, &pool, index)?);
    }

    Ok(ClassHeader {
        name,
        super_name,
        interfaces,
    })
}

fn read_constant_pool(reader: &mut Reader<'_>) -> Result<Vec<PoolEntry>> {
    let count = reader.u16()?;
    let mut entries = Vec::with_capacity(count as usize);
    entries.push(PoolEntry::Other);

    let mut index = 1u16;
    while index < count {
        let tag = reader.u8()?;
        match tag {
            1 => {
                let len = reader.u16()? as usize;
                let bytes = reader.bytes(len)?;
                let value = cesu8::from_java_cesu8(bytes)
                    .map_err(|_| reader.fail("invalid modified utf-8 constant"))?;
                entries.push(PoolEntry::Utf8(value.into_owned()));
            }
            7 => {
                let name_index = reader.u16()?;
                entries.push(PoolEntry::Class(name_index));
            }
            // Long and Double take two slots.
            5 | 6 => {
                reader.bytes(8)?;
                entries.push(PoolEntry::Other);
                entries.push(PoolEntry::Other);
                index += 1;
            }
            3 | 4 | 9 | 10 | 11 | 12 | 17 | 18 => {
                reader.bytes(4)?;
                entries.push(PoolEntry::Other);
            }
            15 => {
                reader.bytes(3)?;
                entries.push(PoolEntry::Other);
            }
            8 | 16 | 19 | 20 => {
                reader.bytes(2)?;
                entries.push(PoolEntry::Other);
            }
            _ => return Err(reader.fail(format!("unsupported constant pool tag: {tag}"))),
        }
        index += 1;
    }
    Ok(entries)
}

fn resolve_class(reader: &Reader<'_>, pool: &[PoolEntry], index: u16) -> Result<String> {
    let Some(PoolEntry::Class(name_index)) = pool.get(index as usize) else {
        return Err(reader.fail(format!("constant {index} is not a class")));
    };
    match pool.get(*name_index as usize) {
        Some(PoolEntry::Utf8(value)) => Ok(value.clone()),
        _ => Err(reader.fail(format!("constant {name_index} is not a utf8 entry"))),
    }
}

/// Test helper that assembles a header-only class file. Names are written as modified
/// UTF-8, the way javac emits them.
#[cfg(test)]
pub(crate) fn synthesize(name: &str, super_name: Option<&str>, interfaces: &[&str], marker: &str) -> Vec<u8> {
    fn utf8_entry(value: &str) -> Vec<u8> {
        let encoded = cesu8::to_java_cesu8(value);
        let mut entry = vec![1u8];
        entry.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        entry.extend_from_slice(&encoded);
        entry
    }

    fn add_class(pool: &mut Vec<Vec<u8>>, value: &str) -> u16 {
        pool.push(utf8_entry(value));
        let utf8_index = pool.len() as u16;
        let mut class = vec![7u8];
        class.extend_from_slice(&utf8_index.to_be_bytes());
        pool.push(class);
        pool.len() as u16
    }

    let mut pool: Vec<Vec<u8>> = Vec::new();

    let this_index = add_class(&mut pool, name);
    let super_index = super_name.map(|s| add_class(&mut pool, s)).unwrap_or(0);
    let interface_indices: Vec<u16> = interfaces.iter().map(|i| add_class(&mut pool, i)).collect();

    pool.push(utf8_entry(marker));

    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.extend_from_slice(&61u16.to_be_bytes());
    out.extend_from_slice(&((pool.len() + 1) as u16).to_be_bytes());
    for entry in &pool {
        out.extend_from_slice(entry);
    }
    out.extend_from_slice(&0x0021u16.to_be_bytes());
    out.extend_from_slice(&this_index.to_be_bytes());
    out.extend_from_slice(&super_index.to_be_bytes());
    out.extend_from_slice(&(interface_indices.len() as u16).to_be_bytes());
    for index in interface_indices {
        out.extend_from_slice(&index.to_be_bytes());
    }
    // fields, methods, attributes
    out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    out
}
