//! The entry model shared by every backing implementation.

use camino::{Utf8Component, Utf8Path};
use chrono::{DateTime, Utc};

use crate::result::*;

/// The compression method used to store an entry
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CompressionMethod {
    /// The entry is uncompressed
    None,
    /// The entry is [DEFLATE](https://en.wikipedia.org/wiki/DEFLATE)d.
    /// This is the most common format used by ZIP archives.
    Deflate,
    /// The entry is compressed with a yet-unsupported format.
    /// (The u16 indicates the internal format code.)
    Unsupported(u16),
}

/// How hard to try when compressing a newly-created entry
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum CompressionLevel {
    /// Smallest output, slowest.
    #[default]
    Maximum,
    /// Quickest compression.
    Fastest,
    /// Store the bytes as-is.
    NoCompression,
}

/// Metadata for a file or directory in an archive.
///
/// Entries are snapshots: they're produced by the archive handle
/// (when enumerating or creating), and operations that take one
/// look it up again by name.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct Entry {
    /// The archive-relative path of the entry, separated by forward slashes.
    pub name: String,

    /// Uncompressed size of the entry in bytes
    pub length: u64,

    /// Compressed size of the entry in bytes
    pub compressed_length: u64,

    /// When the entry was last modified
    pub last_modified: DateTime<Utc>,

    /// Compression algorithm used to store the entry
    pub compression_method: CompressionMethod,

    /// The CRC-32 of the uncompressed entry
    pub crc32: u32,

    /// True if the entry is encrypted (decryption is unsupported)
    pub encrypted: bool,
}

impl Entry {
    pub(crate) fn new(name: String, compression_method: CompressionMethod) -> Self {
        Self {
            name,
            length: 0,
            compressed_length: 0,
            last_modified: Utc::now(),
            compression_method,
            crc32: 0,
            encrypted: false,
        }
    }

    /// Returns true if the given entry is a directory
    pub fn is_dir(&self) -> bool {
        self.length == 0 && self.name.ends_with('/')
    }

    /// Returns true if the given entry is a file
    pub fn is_file(&self) -> bool {
        !self.is_dir()
    }
}

/// Checks an entry name, returning it in canonical form:
/// forward-slash separated, with no `.` or empty components.
/// A trailing slash (marking a directory) is kept.
pub(crate) fn normalize_name(name: &str) -> ArchiveResult<String> {
    let invalid = |reason| ArchiveError::InvalidName {
        name: name.to_owned(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.len() > u16::MAX as usize {
        return Err(invalid("name is too long"));
    }
    if name.contains('\0') {
        return Err(invalid("name contains a NUL byte"));
    }

    let normalized = name.replace('\\', "/");
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(invalid("name starts with a drive letter"));
    }

    let mut parts = Vec::new();
    for component in Utf8Path::new(&normalized).components() {
        match component {
            Utf8Component::Prefix(_) | Utf8Component::RootDir => {
                return Err(invalid("name is absolute"));
            }
            Utf8Component::ParentDir => {
                return Err(invalid("name escapes the archive root"));
            }
            Utf8Component::CurDir => {}
            Utf8Component::Normal(part) => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(invalid("name has no components"));
    }

    let mut canonical = parts.join("/");
    if normalized.ends_with('/') {
        canonical.push('/');
    }
    Ok(canonical)
}

#[cfg(test)]
mod test {
    use super::*;

    fn reason(name: &str) -> &'static str {
        match normalize_name(name) {
            Err(ArchiveError::InvalidName { reason, .. }) => reason,
            other => panic!("Expected an invalid name error for {name:?}, got {other:?}"),
        }
    }

    #[test]
    fn accepts_relative_names() {
        assert_eq!(normalize_name("a.txt").unwrap(), "a.txt");
        assert_eq!(normalize_name("dir/sub/a.txt").unwrap(), "dir/sub/a.txt");
        assert_eq!(normalize_name("dir/").unwrap(), "dir/");
        assert_eq!(normalize_name(r"dir\a.txt").unwrap(), "dir/a.txt");
        // Dots inside a component are fine.
        assert_eq!(normalize_name("a..b").unwrap(), "a..b");
    }

    #[test]
    fn drops_empty_and_current_dir_components() {
        assert_eq!(normalize_name("a/./b").unwrap(), "a/b");
        assert_eq!(normalize_name("./a/b").unwrap(), "a/b");
        assert_eq!(normalize_name("a//b").unwrap(), "a/b");
        assert_eq!(normalize_name(r"a\.").unwrap(), "a/b/");
        assert_eq!(normalize_name("dir/./").unwrap(), "dir/");
    }

    #[test]
    fn rejects_escaping_names() {
        assert_eq!(reason(""), "name is empty");
        assert_eq!(reason("/etc/passwd"), "name is absolute");
        assert_eq!(reason(r"\windows"), "name is absolute");
        assert_eq!(reason("C:/boot.ini"), "name starts with a drive letter");
        assert_eq!(reason("../nope"), "name escapes the archive root");
        assert_eq!(reason("a/../../nope"), "name escapes the archive root");
        assert_eq!(reason("a\0b"), "name contains a NUL byte");
        assert_eq!(reason("/"), "name is absolute");
        assert_eq!(reason("./"), "name has no components");
    }

    #[test]
    fn directories() {
        let mut dir = Entry::new("dir/".to_owned(), CompressionMethod::None);
        assert!(dir.is_dir());
        dir.length = 3;
        assert!(dir.is_file());
        assert!(Entry::new("file".to_owned(), CompressionMethod::None).is_file());
    }
}
