//! The ZIP backing implementation.
//!
//! A [`ZipArchive`] owns its stream for as long as it's open.
//! In Read and Update mode the whole container is read into memory up front,
//! so entries can be decompressed straight out of that buffer.
//! Changes made in Write and Update mode are kept in memory too,
//! and written to the stream in a single pass when the archive is closed:
//! any data prepended to the archive, untouched entries (copied as-is,
//! without recompressing them), new entries, and finally the central directory.
//!
//! Entry names are case-sensitive.

use std::fmt;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;

use log::*;

use crate::access::*;
use crate::arch::usize;
use crate::detect::Format;
use crate::entry::{normalize_name, CompressionLevel, CompressionMethod, Entry};
use crate::registry::{Implementation, Rejected};
use crate::result::*;

mod codec;
mod verify;
mod records;

pub use codec::{Codec, Deflate, Stored};

use verify::VerifyingReader;
use records::*;

/// Where an entry's data lives
enum Source {
    /// In the archive we opened, at this local header offset
    /// (relative to the start of the archive proper).
    Existing { header_offset: usize, flags: u16 },
    /// In the record's `data`, waiting to be committed.
    Pending { level: CompressionLevel },
}

struct Record {
    entry: Entry,
    source: Source,
    /// Compressed contents of pending entries
    data: Vec<u8>,
}

/// A ZIP archive, backed by the codec `C`.
pub struct ZipArchive<'a, C: Codec> {
    /// `None` once the archive is closed.
    stream: Option<Box<dyn ByteStream + 'a>>,
    mode: AccessMode,
    /// Everything the stream held when we opened it (empty in Write mode).
    mapping: Vec<u8>,
    /// How far the archive's own offsets are shifted from the start of `mapping`.
    archive_offset: usize,
    /// Bytes before the first entry, preserved on rewrite.
    prefix_length: usize,
    /// Entries in archive order, followed by new ones in creation order.
    records: Vec<Record>,
    dirty: bool,
    codec: PhantomData<C>,
}

/// The archive as laid out in the stream we opened
struct Loaded {
    mapping: Vec<u8>,
    archive_offset: usize,
    prefix_length: usize,
    records: Vec<Record>,
}

impl<'a, C: Codec> ZipArchive<'a, C> {
    /// Opens a ZIP archive in the given stream.
    ///
    /// In Write mode, whatever the stream held is replaced when the
    /// archive is closed. In Update mode, an empty stream is treated
    /// as an empty archive.
    pub fn new(stream: Box<dyn ByteStream + 'a>, mode: AccessMode) -> ArchiveResult<Self> {
        Self::try_new(stream, mode).map_err(|rejected| rejected.error)
    }

    /// Like [`new()`](ZipArchive::new), but hands the stream back on failure.
    pub fn try_new(
        mut stream: Box<dyn ByteStream + 'a>,
        mode: AccessMode,
    ) -> Result<Self, Rejected<'a>> {
        match Self::load(&mut *stream, mode) {
            Ok(loaded) => {
                debug!(
                    "Opened ZIP archive ({:?}, {:?} mode) with {} entries",
                    C::IMPLEMENTATION,
                    mode,
                    loaded.records.len()
                );
                Ok(Self {
                    stream: Some(stream),
                    mode,
                    mapping: loaded.mapping,
                    archive_offset: loaded.archive_offset,
                    prefix_length: loaded.prefix_length,
                    records: loaded.records,
                    dirty: false,
                    codec: PhantomData,
                })
            }
            Err(error) => Err(Rejected { error, stream }),
        }
    }

    fn load(stream: &mut (dyn ByteStream + 'a), mode: AccessMode) -> ArchiveResult<Loaded> {
        let mut mapping = Vec::new();
        if mode.reads_existing() {
            stream.seek(SeekFrom::Start(0))?;
            stream.read_to_end(&mut mapping)?;
        }
        if mapping.is_empty() && mode != AccessMode::Read {
            return Ok(Loaded {
                mapping,
                archive_offset: 0,
                prefix_length: 0,
                records: Vec::new(),
            });
        }

        let directory = parse_central_directory(&mapping)?;

        let mut records: Vec<Record> = Vec::with_capacity(directory.entries.len());
        for mut metadata in directory.entries {
            // Names from the archive follow the same rules as names we create.
            metadata.entry.name = normalize_name(&metadata.entry.name)?;
            if records.iter().any(|r| r.entry.name == metadata.entry.name) {
                return Err(ArchiveError::DuplicateEntry(metadata.entry.name));
            }
            records.push(Record {
                entry: metadata.entry,
                source: Source::Existing {
                    header_offset: metadata.header_offset,
                    flags: metadata.flags,
                },
                data: Vec::new(),
            });
        }

        // Self-extractors and the like put a stub before the first entry.
        let first_entry = records
            .iter()
            .filter_map(|r| match r.source {
                Source::Existing { header_offset, .. } => Some(header_offset),
                Source::Pending { .. } => None,
            })
            .min()
            .unwrap_or(directory.central_directory_offset);
        let prefix_length = directory
            .archive_offset
            .checked_add(first_entry)
            .filter(|&p| p <= mapping.len())
            .ok_or(ArchiveError::CorruptArchive("Invalid local header offset"))?;
        if prefix_length > 0 {
            debug!("Archive is prepended with {} bytes", prefix_length);
        }

        Ok(Loaded {
            mapping,
            archive_offset: directory.archive_offset,
            prefix_length,
            records,
        })
    }

    fn ensure_open(&self) -> ArchiveResult<()> {
        if self.stream.is_none() {
            return Err(ArchiveError::Closed);
        }
        Ok(())
    }

    fn ensure_can_modify(&self, operation: &'static str) -> ArchiveResult<()> {
        self.ensure_open()?;
        if !self.mode.can_modify() {
            return Err(ArchiveError::InvalidMode {
                operation,
                mode: self.mode,
            });
        }
        Ok(())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.records.iter().position(|r| r.entry.name == name)
    }

    fn needs_commit(&self) -> bool {
        match self.mode {
            AccessMode::Read => false,
            AccessMode::Write => true,
            AccessMode::Update => self.dirty,
        }
    }

    /// Finds the compressed bytes of an entry from the archive we opened,
    /// after checking its local header.
    fn existing_data(&self, entry: &Entry, header_offset: usize) -> ArchiveResult<&[u8]> {
        let mut file_slice = self
            .archive_offset
            .checked_add(header_offset)
            .and_then(|start| self.mapping.get(start..))
            .ok_or(ArchiveError::CorruptArchive("Invalid local header offset"))?;
        let local_header = LocalFileHeader::parse_and_consume(&mut file_slice)?;
        trace!("{:?}", local_header);

        if cfg!(feature = "check-local-metadata") && !local_matches(&local_header, entry)? {
            return Err(ArchiveError::CorruptArchive(
                "Central directory entry doesn't match local file header",
            ));
        }

        file_slice
            .get(..usize(entry.compressed_length)?)
            .ok_or(ArchiveError::CorruptArchive("Truncated entry data"))
    }

    /// Lays out the whole archive in memory: prefix, entries, and central directory.
    fn serialize(&self) -> ArchiveResult<Vec<u8>> {
        let mut writer = ArchiveWriter::new(Vec::with_capacity(self.mapping.len()));
        writer.write_prefix(&self.mapping[..self.prefix_length])?;

        for record in &self.records {
            let entry = &record.entry;
            let (flags, data) = match record.source {
                Source::Existing {
                    header_offset,
                    flags,
                } => {
                    // With bit 3 set, an encrypted entry's password check byte
                    // comes from its modification time, so it keeps its descriptor.
                    let descriptor = if entry.encrypted {
                        flags & FLAG_DATA_DESCRIPTOR
                    } else {
                        0
                    };
                    let flags = ((flags | FLAG_UTF8) & !FLAG_DATA_DESCRIPTOR) | descriptor;
                    (flags, self.existing_data(entry, header_offset)?)
                }
                Source::Pending { .. } => (FLAG_UTF8, record.data.as_slice()),
            };
            writer.add(
                &EntryHeader {
                    name: &entry.name,
                    flags,
                    compression_method: entry.compression_method.to_u16(),
                    last_modified: to_msdos(&entry.last_modified),
                    crc32: entry.crc32,
                    size: entry.length,
                    compressed_size: entry.compressed_length,
                    is_dir: entry.is_dir(),
                },
                data,
            )?;
        }

        let (bytes, _length) = writer.finish()?;
        Ok(bytes)
    }

    /// Writes the archive back out to `stream`, replacing its contents.
    ///
    /// Nothing touches the stream until the new archive is fully built,
    /// so a corrupt entry can't leave it half-overwritten.
    fn commit(&self, stream: &mut (dyn ByteStream + 'a)) -> ArchiveResult<()> {
        let bytes = self.serialize()?;
        let length = bytes.len() as u64;
        stream.seek(SeekFrom::Start(0))?;
        stream.write_all(&bytes)?;
        stream.set_len(length)?;
        stream.flush()?;
        info!(
            "Committed {} entries ({} bytes) to ZIP archive",
            self.records.len(),
            length
        );
        Ok(())
    }
}

/// Returns a reader that decompresses an entry and checks its CRC.
fn reader<'s, C: Codec>(entry: &Entry, compressed: &'s [u8]) -> ArchiveResult<Box<dyn Read + 's>> {
    if entry.encrypted {
        return Err(ArchiveError::UnsupportedArchive(format!(
            "Can't read encrypted file {}",
            entry.name
        )));
    }
    let decoder = C::decoder(entry.compression_method, compressed)?;
    Ok(Box::new(VerifyingReader::new(
        decoder,
        entry.crc32,
        entry.length,
    )))
}

/// Compares what the central directory said about an entry
/// against its local file header.
fn local_matches(local: &LocalFileHeader, entry: &Entry) -> ArchiveResult<bool> {
    let local_name = normalize_name(&decode_name(local.path, local.flags)?).ok();
    if local_name.as_deref() != Some(entry.name.as_str())
        || CompressionMethod::from_u16(local.compression_method) != entry.compression_method
    {
        return Ok(false);
    }
    // Sizes and CRC come after the data; nothing else to compare.
    if local.flags & FLAG_DATA_DESCRIPTOR != 0 {
        return Ok(true);
    }
    let mut sizes = Zip64Sizes {
        size: local.uncompressed_size as u64,
        compressed_size: local.compressed_size as u64,
        header_offset: 0,
    };
    sizes.parse_extra_field(local.extra_field)?;
    Ok(local.crc32 == entry.crc32
        && sizes.size == entry.length
        && sizes.compressed_size == entry.compressed_length)
}

/// Everything in the central directory, and where we found it
struct CentralDirectory {
    archive_offset: usize,
    central_directory_offset: usize,
    entries: Vec<CentralMetadata>,
}

/// Finds and parses the central directory.
///
/// Zip files can be prepended by arbitrary junk,
/// so all the positions they give might be off by some amount.
/// We figure out that amount (the archive offset) along the way.
fn parse_central_directory(mapping: &[u8]) -> ArchiveResult<CentralDirectory> {
    let eocdr_posit = find_eocdr(mapping)?;
    let eocdr = EndOfCentralDirectory::parse(&mapping[eocdr_posit..])?;
    trace!("{:?}", eocdr);

    if eocdr.disk_number != eocdr.disk_with_central_directory {
        return Err(ArchiveError::UnsupportedArchive(format!(
            "No support for multi-disk archives: disk ({}) != disk with central directory ({})",
            eocdr.disk_number, eocdr.disk_with_central_directory
        )));
    }
    if eocdr.entries != eocdr.entries_on_this_disk {
        return Err(ArchiveError::UnsupportedArchive(format!(
            "No support for multi-disk archives: entries ({}) != entries this disk ({})",
            eocdr.entries, eocdr.entries_on_this_disk
        )));
    }

    let nominal_central_directory_offset: usize;
    let entry_count: u64;
    let archive_offset;

    // An empty archive has no room for a Zip64 locator before its EOCDR.
    let zip64_eocdr_locator = eocdr_posit
        .checked_sub(Zip64EndOfCentralDirectoryLocator::size_in_file())
        .and_then(|posit| {
            Zip64EndOfCentralDirectoryLocator::parse(&mapping[posit..]).map(|l| (posit, l))
        });

    if let Some((zip64_eocdr_locator_posit, zip64_eocdr_locator)) = zip64_eocdr_locator {
        trace!("{:?}", zip64_eocdr_locator);

        if eocdr.disk_number as u32 != zip64_eocdr_locator.disk_with_central_directory {
            return Err(ArchiveError::UnsupportedArchive(format!(
                "No support for multi-disk archives: disk ({}) != disk with zip64 central directory ({})",
                eocdr.disk_number, zip64_eocdr_locator.disk_with_central_directory
            )));
        }
        if zip64_eocdr_locator.disks != 1 {
            return Err(ArchiveError::UnsupportedArchive(format!(
                "No support for multi-disk archives: Zip64 EOCDR locator reports {} disks",
                zip64_eocdr_locator.disks
            )));
        }

        // Search for the zip64 EOCDR, from its nominal starting position
        // to the end of where it could be.
        let zip64_eocdr_search_start = usize(zip64_eocdr_locator.zip64_eocdr_offset)?;
        let zip64_eocdr_search_space = mapping
            .get(zip64_eocdr_search_start..zip64_eocdr_locator_posit)
            .ok_or(ArchiveError::CorruptArchive(
                "Invalid Zip64 End Of Central Directory Record offset",
            ))?;

        let zip64_eocdr_posit = find_zip64_eocdr(zip64_eocdr_search_space)?;
        // Since we're searching starting at the provided offset,
        // the returned position is the archive offset.
        archive_offset = zip64_eocdr_posit;
        let zip64_eocdr =
            Zip64EndOfCentralDirectory::parse(&zip64_eocdr_search_space[zip64_eocdr_posit..])?;
        trace!("{:?}", zip64_eocdr);

        nominal_central_directory_offset = usize(zip64_eocdr.central_directory_offset)?;
        entry_count = zip64_eocdr.entries;
    } else {
        // The offset is the actual position versus the stored one.
        let actual_cdr_posit = eocdr_posit.checked_sub(usize(eocdr.central_directory_size)?);
        let nominal_offset = usize(eocdr.central_directory_offset)?;
        archive_offset = actual_cdr_posit
            .and_then(|off| off.checked_sub(nominal_offset))
            .ok_or(ArchiveError::CorruptArchive(
                "Invalid central directory size or offset",
            ))?;
        nominal_central_directory_offset = nominal_offset;
        entry_count = eocdr.entries as u64;
    }

    trace!(
        "{} entries at nominal offset {}, archive offset {}",
        entry_count,
        nominal_central_directory_offset,
        archive_offset
    );

    let mut central_directory = archive_offset
        .checked_add(nominal_central_directory_offset)
        .and_then(|start| mapping.get(start..))
        .ok_or(ArchiveError::CorruptArchive(
            "Invalid central directory offset",
        ))?;

    // Don't trust the count for the allocation: each entry takes at least 46 bytes.
    let capacity = usize(entry_count)?.min(central_directory.len() / 46);
    let mut entries = Vec::with_capacity(capacity);

    for _ in 0..entry_count {
        let dir_entry = CentralDirectoryEntry::parse_and_consume(&mut central_directory)?;
        trace!("{:?}", dir_entry);

        let metadata = CentralMetadata::from_cde(&dir_entry)?;
        debug!("{:?}", metadata.entry);
        entries.push(metadata);
    }

    Ok(CentralDirectory {
        archive_offset,
        central_directory_offset: nominal_central_directory_offset,
        entries,
    })
}

/// The compression level that best matches an existing entry being replaced.
fn replacement_level(method: CompressionMethod) -> CompressionLevel {
    match method {
        CompressionMethod::None => CompressionLevel::NoCompression,
        _ => CompressionLevel::Maximum,
    }
}

impl<'a, C: Codec> ArchiveAccess for ZipArchive<'a, C> {
    fn is_compressed(&self) -> bool {
        C::COMPRESSES
    }

    fn format(&self) -> Format {
        Format::Zip
    }

    fn implementation(&self) -> Implementation {
        C::IMPLEMENTATION
    }

    fn mode(&self) -> AccessMode {
        self.mode
    }

    fn entries(&self) -> ArchiveResult<Box<dyn Iterator<Item = Entry> + '_>> {
        self.ensure_open()?;
        Ok(Box::new(self.records.iter().map(|r| r.entry.clone())))
    }

    fn find_entry(&self, name: &str) -> ArchiveResult<Option<Entry>> {
        self.ensure_open()?;
        Ok(self.position(name).map(|i| self.records[i].entry.clone()))
    }

    fn default_direction(&self, entry: &Entry) -> Direction {
        match self.mode {
            AccessMode::Read => Direction::Read,
            AccessMode::Write => Direction::Write,
            AccessMode::Update => match self.position(&entry.name).map(|i| &self.records[i].source) {
                Some(Source::Pending { .. }) => Direction::Write,
                _ => Direction::Read,
            },
        }
    }

    fn open_entry_as(
        &mut self,
        entry: &Entry,
        direction: Direction,
    ) -> ArchiveResult<EntryStream<'_>> {
        self.ensure_open()?;
        let (allowed, operation) = match direction {
            Direction::Read => (self.mode.reads_existing(), "read entries from"),
            Direction::Write => (self.mode.can_modify(), "write entries to"),
        };
        if !allowed {
            return Err(ArchiveError::InvalidMode {
                operation,
                mode: self.mode,
            });
        }
        let index = self
            .position(&entry.name)
            .ok_or_else(|| ArchiveError::EntryNotFound(entry.name.clone()))?;

        match direction {
            Direction::Read => {
                let record = &self.records[index];
                debug!("Reading {:?}", record.entry);
                let compressed = match record.source {
                    Source::Existing { header_offset, .. } => {
                        self.existing_data(&record.entry, header_offset)?
                    }
                    Source::Pending { .. } => record.data.as_slice(),
                };
                Ok(EntryStream::Reader(reader::<C>(&record.entry, compressed)?))
            }
            Direction::Write => {
                self.dirty = true;
                let record = &mut self.records[index];
                let level = match record.source {
                    Source::Pending { level } => level,
                    Source::Existing { .. } => {
                        debug!("Replacing {}", record.entry.name);
                        replacement_level(record.entry.compression_method)
                    }
                };
                record.source = Source::Pending { level };
                record.entry.compression_method = C::method_for(level);
                record.entry.encrypted = false;
                record.entry.last_modified = msdos_now();
                Ok(EntryStream::Writer(EntryWriter::new(
                    &mut record.entry,
                    &mut record.data,
                    C::encoder(level),
                )))
            }
        }
    }

    fn create_entry_with(&mut self, name: &str, level: CompressionLevel) -> ArchiveResult<Entry> {
        self.ensure_can_modify("create entries in")?;
        let name = normalize_name(name)?;
        if self.position(&name).is_some() {
            return Err(ArchiveError::DuplicateEntry(name));
        }

        let mut entry = Entry::new(name, C::method_for(level));
        // Match what the timestamp will read back as once committed.
        entry.last_modified = msdos_now();
        // Even an empty entry needs a valid (compressed) stream.
        let data = C::encoder(level).finish()?;
        entry.compressed_length = data.len() as u64;
        debug!("Created {:?}", entry);

        self.records.push(Record {
            entry: entry.clone(),
            source: Source::Pending { level },
            data,
        });
        self.dirty = true;
        Ok(entry)
    }

    fn delete_entry(&mut self, name: &str) -> ArchiveResult<bool> {
        self.ensure_can_modify("delete entries from")?;
        match self.position(name) {
            Some(index) => {
                self.records.remove(index);
                self.dirty = true;
                debug!("Deleted {}", name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn close(&mut self) -> ArchiveResult<()> {
        let Some(mut stream) = self.stream.take() else {
            return Ok(());
        };
        let result = if self.needs_commit() {
            self.commit(&mut *stream)
        } else {
            Ok(())
        };
        // Release the stream (and whatever file handle it holds)
        // whether or not the commit worked.
        drop(stream);
        self.records.clear();
        self.mapping = Vec::new();
        debug!("Closed ZIP archive");
        result.map_err(|e| ArchiveError::CommitFailure(Box::new(e)))
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl<C: Codec> Drop for ZipArchive<'_, C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            match std::error::Error::source(&e) {
                Some(cause) => error!("Lost changes to ZIP archive: {e}: {cause}"),
                None => error!("Lost changes to ZIP archive: {e}"),
            }
        }
    }
}

impl<C: Codec> fmt::Debug for ZipArchive<'_, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZipArchive")
            .field("implementation", &C::IMPLEMENTATION)
            .field("mode", &self.mode)
            .field("entries", &self.records.len())
            .field("dirty", &self.dirty)
            .field("closed", &self.stream.is_none())
            .finish()
    }
}

/// [`Registry`](crate::Registry) factory for ZIP archives backed by `C`.
pub fn open<'a, C: Codec>(
    stream: Box<dyn ByteStream + 'a>,
    mode: AccessMode,
) -> Result<Box<dyn ArchiveAccess + 'a>, Rejected<'a>> {
    Ok(Box::new(ZipArchive::<C>::try_new(stream, mode)?))
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Cursor;

    use chrono::Utc;

    fn build(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buffer = Vec::new();
        {
            let mut archive =
                ZipArchive::<Deflate>::new(Box::new(Cursor::new(&mut buffer)), AccessMode::Write)
                    .unwrap();
            for (name, contents) in entries {
                let entry = archive.create_entry(name).unwrap();
                let mut stream = archive.open_entry(&entry).unwrap();
                stream.write_all(contents).unwrap();
                stream.finish().unwrap();
            }
            archive.close().unwrap();
        }
        buffer
    }

    fn read_all(archive: &mut dyn ArchiveAccess, name: &str) -> Vec<u8> {
        let entry = archive.find_entry(name).unwrap().unwrap();
        let mut out = Vec::new();
        archive
            .open_entry_as(&entry, Direction::Read)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    #[test]
    fn empty_archive() {
        let buffer = build(&[]);
        assert_eq!(buffer.len(), 22);

        let archive =
            ZipArchive::<Deflate>::new(Box::new(Cursor::new(buffer)), AccessMode::Read).unwrap();
        assert_eq!(archive.entries().unwrap().count(), 0);
    }

    #[test]
    fn empty_stream_in_read_mode() {
        let err = ZipArchive::<Deflate>::new(Box::new(Cursor::new(Vec::new())), AccessMode::Read)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::CorruptArchive(_)));
    }

    #[test]
    fn pending_entries_are_readable_in_update_mode() {
        let mut archive =
            ZipArchive::<Deflate>::new(Box::new(Cursor::new(Vec::new())), AccessMode::Update)
                .unwrap();
        let entry = archive.create_entry("notes.txt").unwrap();
        assert_eq!(archive.default_direction(&entry), Direction::Write);
        {
            let mut stream = archive.open_entry(&entry).unwrap();
            stream.write_all(b"pending").unwrap();
        }
        assert_eq!(read_all(&mut archive, "notes.txt"), b"pending");
        let entry = archive.find_entry("notes.txt").unwrap().unwrap();
        assert_eq!(entry.length, 7);
        assert_eq!(entry.crc32, crc32fast::hash(b"pending"));
    }

    #[test]
    fn prefix_survives_a_rewrite() {
        let mut buffer = b"#!/bin/sh\nexit 0\n".to_vec();
        let prefix_length = buffer.len();
        buffer.extend_from_slice(&build(&[("a", b"alpha"), ("b", b"beta")]));

        {
            let mut archive =
                ZipArchive::<Deflate>::new(Box::new(Cursor::new(&mut buffer)), AccessMode::Update)
                    .unwrap();
            assert!(archive.delete_entry("a").unwrap());
            archive.close().unwrap();
        }
        assert!(buffer.starts_with(b"#!/bin/sh\nexit 0\n"));

        let mut archive =
            ZipArchive::<Deflate>::new(Box::new(Cursor::new(buffer)), AccessMode::Read).unwrap();
        assert_eq!(archive.prefix_length, prefix_length);
        assert_eq!(archive.find_entry("a").unwrap(), None);
        assert_eq!(read_all(&mut archive, "b"), b"beta");
    }

    #[test]
    fn untouched_update_leaves_stream_alone() {
        let original = build(&[("a", b"alpha")]);
        let mut buffer = original.clone();
        {
            let mut archive =
                ZipArchive::<Deflate>::new(Box::new(Cursor::new(&mut buffer)), AccessMode::Update)
                    .unwrap();
            assert_eq!(read_all(&mut archive, "a"), b"alpha");
            archive.close().unwrap();
        }
        assert_eq!(buffer, original);
    }

    #[test]
    fn replacing_an_existing_entry() {
        let mut buffer = build(&[("a", b"alpha"), ("b", b"beta")]);
        {
            let mut archive =
                ZipArchive::<Deflate>::new(Box::new(Cursor::new(&mut buffer)), AccessMode::Update)
                    .unwrap();
            let entry = archive.find_entry("a").unwrap().unwrap();
            assert_eq!(archive.default_direction(&entry), Direction::Read);
            let mut stream = archive.open_entry_as(&entry, Direction::Write).unwrap();
            stream.write_all(b"something else entirely").unwrap();
            stream.finish().unwrap();
        }

        let mut archive =
            ZipArchive::<Deflate>::new(Box::new(Cursor::new(buffer)), AccessMode::Read).unwrap();
        let names: Vec<String> = archive.entries().unwrap().map(|e| e.name).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(read_all(&mut archive, "a"), b"something else entirely");
        assert_eq!(read_all(&mut archive, "b"), b"beta");
    }

    #[cfg(feature = "check-local-metadata")]
    #[test]
    fn mismatched_local_header() {
        let mut buffer = build(&[("a", b"alpha")]);
        // The local header's name starts right after its 30 fixed bytes.
        assert_eq!(buffer[30], b'a');
        buffer[30] = b'z';

        let mut archive =
            ZipArchive::<Deflate>::new(Box::new(Cursor::new(buffer)), AccessMode::Read).unwrap();
        let entry = archive.find_entry("a").unwrap().unwrap();
        assert!(matches!(
            archive.open_entry(&entry),
            Err(ArchiveError::CorruptArchive(_))
        ));
    }

    #[test]
    fn stored_backing_writes_stored_entries() {
        let mut buffer = Vec::new();
        {
            let mut archive =
                ZipArchive::<Stored>::new(Box::new(Cursor::new(&mut buffer)), AccessMode::Write)
                    .unwrap();
            assert!(!archive.is_compressed());
            let entry = archive.create_entry("plain").unwrap();
            assert_eq!(entry.compression_method, CompressionMethod::None);
            archive.open_entry(&entry).unwrap().write_all(b"plain text").unwrap();
        }
        let mut archive =
            ZipArchive::<Deflate>::new(Box::new(Cursor::new(buffer)), AccessMode::Read).unwrap();
        let entry = archive.find_entry("plain").unwrap().unwrap();
        assert_eq!(entry.compressed_length, 10);
        assert_eq!(read_all(&mut archive, "plain"), b"plain text");
    }

    fn raw_archive(names: &[&str]) -> Vec<u8> {
        let mut writer = ArchiveWriter::new(Vec::new());
        for &name in names {
            writer
                .add(
                    &EntryHeader {
                        name,
                        flags: FLAG_UTF8,
                        compression_method: 0,
                        last_modified: to_msdos(&Utc::now()),
                        crc32: crc32fast::hash(b"payload"),
                        size: 7,
                        compressed_size: 7,
                        is_dir: name.ends_with('/'),
                    },
                    b"payload",
                )
                .unwrap();
        }
        writer.finish().unwrap().0
    }

    #[test]
    fn names_escaping_the_root_are_refused() {
        for hostile in ["../evil.txt", "/etc/passwd", "a/../../b", r"..\evil.txt"] {
            let buffer = raw_archive(&["fine.txt", hostile]);
            let err = ZipArchive::<Deflate>::new(Box::new(Cursor::new(buffer)), AccessMode::Read)
                .unwrap_err();
            assert!(
                matches!(err, ArchiveError::InvalidName { .. }),
                "{} gave {:?}",
                hostile,
                err
            );
        }
    }

    #[test]
    fn stored_names_come_back_canonical() {
        let buffer = raw_archive(&["a/./b.txt", "dir//"]);
        let mut archive =
            ZipArchive::<Deflate>::new(Box::new(Cursor::new(buffer)), AccessMode::Read).unwrap();
        let names: Vec<String> = archive.entries().unwrap().map(|e| e.name).collect();
        assert_eq!(names, ["a/b.txt", "dir/"]);
        assert_eq!(read_all(&mut archive, "a/b.txt"), b"payload");
    }

    #[test]
    fn failed_commit_leaves_the_original_intact() {
        let mut buffer = build(&[("a", b"alpha"), ("b", b"beta"), ("c", b"gamma")]);
        // Break the last entry's local header so it can't be copied over.
        let last_header = memchr::memmem::rfind(&buffer, b"PK\x03\x04").unwrap();
        buffer[last_header + 2] = 0;
        let original = buffer.clone();

        {
            let mut archive =
                ZipArchive::<Deflate>::new(Box::new(Cursor::new(&mut buffer)), AccessMode::Update)
                    .unwrap();
            assert!(archive.delete_entry("a").unwrap());
            let err = archive.close().unwrap_err();
            assert!(matches!(err, ArchiveError::CommitFailure(_)), "{:?}", err);
        }
        assert_eq!(buffer, original);
    }

    #[test]
    fn timestamps_survive_a_commit() {
        let mut buffer = Vec::new();
        let written = {
            let mut archive =
                ZipArchive::<Deflate>::new(Box::new(Cursor::new(&mut buffer)), AccessMode::Write)
                    .unwrap();
            let created = archive.create_entry("new").unwrap();
            assert_eq!(created.last_modified.timestamp_subsec_nanos(), 0);
            assert_eq!(created.last_modified.timestamp() % 2, 0);
            archive.open_entry(&created).unwrap().write_all(b"fresh").unwrap();
            let written = archive.find_entry("new").unwrap().unwrap();
            archive.close().unwrap();
            written
        };

        let archive =
            ZipArchive::<Deflate>::new(Box::new(Cursor::new(buffer)), AccessMode::Read).unwrap();
        let committed = archive.find_entry("new").unwrap().unwrap();
        assert_eq!(committed.last_modified, written.last_modified);
    }
}
