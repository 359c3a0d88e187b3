//! The uniform archive handle, and the streams it hands out.
//!
//! Every backing implementation (see [`Registry`](crate::Registry))
//! produces a `Box<dyn ArchiveAccess>`, so callers never need to know
//! which library is doing the work.
//!
//! Handles are single-owner and hold no locks.
//! Enumeration borrows the handle, so the compiler won't let you
//! create or delete entries while an enumeration is still alive.

use std::fmt;
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use crc32fast::Hasher;
use log::*;

use crate::detect::Format;
use crate::entry::{CompressionLevel, Entry};
use crate::registry::Implementation;
use crate::result::*;

/// What a handle was opened to do
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Enumerate and read existing entries.
    Read,
    /// Build a new archive from scratch, discarding whatever the stream held.
    Write,
    /// Read existing entries, add new ones, and delete old ones.
    /// Changes are written back when the handle is closed.
    Update,
}

impl AccessMode {
    /// True if existing entries are visible in this mode.
    pub fn reads_existing(&self) -> bool {
        !matches!(self, AccessMode::Write)
    }

    /// True if entries can be created or deleted in this mode.
    pub fn can_modify(&self) -> bool {
        !matches!(self, AccessMode::Read)
    }
}

/// The direction of an [`EntryStream`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// The byte stream an archive lives in.
///
/// Besides reading, writing, and seeking, rewriting an archive in place
/// means we need to cut off whatever used to be past its new end.
pub trait ByteStream: Read + Write + Seek {
    /// Truncates (or extends) the stream to `len` bytes.
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl ByteStream for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

fn resize(buffer: &mut Vec<u8>, len: u64) -> io::Result<()> {
    let len = usize::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length exceeds usize"))?;
    buffer.resize(len, 0);
    Ok(())
}

impl ByteStream for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        resize(self.get_mut(), len)
    }
}

impl ByteStream for Cursor<&mut Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        resize(self.get_mut(), len)
    }
}

/// Adapts a read-only source (like `Cursor<&[u8]>`) into a [`ByteStream`]
/// whose writes always fail.
///
/// Fine for [`AccessMode::Read`], which never writes.
pub struct ReadOnly<R>(pub R);

fn read_only() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "stream is read-only")
}

impl<R: Read> Read for ReadOnly<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl<R: Seek> Seek for ReadOnly<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl<R> Write for ReadOnly<R> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(read_only())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<R: Read + Seek> ByteStream for ReadOnly<R> {
    fn set_len(&mut self, _len: u64) -> io::Result<()> {
        Err(read_only())
    }
}

/// The capabilities every archive handle provides.
pub trait ArchiveAccess {
    /// True for real archive backings.
    fn is_archive(&self) -> bool {
        true
    }

    /// True if the backing compresses entry data.
    fn is_compressed(&self) -> bool;

    /// The container format of the archive.
    fn format(&self) -> Format;

    /// Which backing implementation produced this handle.
    fn implementation(&self) -> Implementation;

    /// The mode the handle was opened in.
    fn mode(&self) -> AccessMode;

    /// Iterates over the entries as they currently stand,
    /// including any created or deleted since the handle was opened.
    ///
    /// Each call starts a new pass.
    fn entries(&self) -> ArchiveResult<Box<dyn Iterator<Item = Entry> + '_>>;

    /// Looks up an entry by its exact name.
    fn find_entry(&self, name: &str) -> ArchiveResult<Option<Entry>>;

    /// Opens an entry in the given direction.
    ///
    /// Fails with [`ArchiveError::EntryNotFound`] if the entry is gone,
    /// or [`ArchiveError::InvalidMode`] if the handle's mode doesn't allow
    /// that direction.
    fn open_entry_as(&mut self, entry: &Entry, direction: Direction)
        -> ArchiveResult<EntryStream<'_>>;

    /// Creates a new, empty entry, compressed at the given level.
    fn create_entry_with(&mut self, name: &str, level: CompressionLevel) -> ArchiveResult<Entry>;

    /// Deletes the entry with the given name,
    /// returning false if there was no such entry.
    fn delete_entry(&mut self, name: &str) -> ArchiveResult<bool>;

    /// Commits any pending changes and releases the underlying stream.
    ///
    /// Calling this more than once is harmless; later calls do nothing.
    /// If committing fails, the stream is still released.
    fn close(&mut self) -> ArchiveResult<()>;

    /// True once [`close()`](ArchiveAccess::close) has been called.
    fn is_closed(&self) -> bool;

    /// The direction [`open_entry()`](ArchiveAccess::open_entry) picks:
    /// reads in Read mode, writes in Write mode,
    /// and in Update mode, writes for entries created since the handle was
    /// opened and reads for everything else.
    fn default_direction(&self, entry: &Entry) -> Direction;

    /// Opens an entry in its default direction.
    fn open_entry(&mut self, entry: &Entry) -> ArchiveResult<EntryStream<'_>> {
        let direction = self.default_direction(entry);
        self.open_entry_as(entry, direction)
    }

    /// Creates a new, empty entry with maximum compression.
    fn create_entry(&mut self, name: &str) -> ArchiveResult<Entry> {
        self.create_entry_with(name, CompressionLevel::default())
    }
}

impl fmt::Debug for dyn ArchiveAccess + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveAccess")
            .field("format", &self.format())
            .field("implementation", &self.implementation())
            .field("mode", &self.mode())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A stream over one entry's data, positioned at its start.
///
/// Implements both [`Read`] and [`Write`];
/// the direction it wasn't opened in fails with [`io::ErrorKind::Unsupported`].
pub enum EntryStream<'a> {
    Reader(Box<dyn Read + 'a>),
    Writer(EntryWriter<'a>),
}

impl EntryStream<'_> {
    pub fn direction(&self) -> Direction {
        match self {
            EntryStream::Reader(_) => Direction::Read,
            EntryStream::Writer(_) => Direction::Write,
        }
    }

    /// Finishes writing, if this is a writer. A no-op for readers.
    pub fn finish(self) -> ArchiveResult<()> {
        match self {
            EntryStream::Reader(_) => Ok(()),
            EntryStream::Writer(w) => w.finish(),
        }
    }
}

impl fmt::Debug for EntryStream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStream::Reader(_) => f.write_str("EntryStream::Reader"),
            EntryStream::Writer(w) => write!(f, "EntryStream::Writer({})", w.entry.name),
        }
    }
}

fn wrong_direction(opened: Direction) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("entry stream was opened for {opened:?}"),
    )
}

impl Read for EntryStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            EntryStream::Reader(r) => r.read(buf),
            EntryStream::Writer(_) => Err(wrong_direction(Direction::Write)),
        }
    }
}

impl Write for EntryStream<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            EntryStream::Reader(_) => Err(wrong_direction(Direction::Read)),
            EntryStream::Writer(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            EntryStream::Reader(_) => Err(wrong_direction(Direction::Read)),
            EntryStream::Writer(w) => w.flush(),
        }
    }
}

/// Compresses an entry's bytes into a buffer.
pub trait Encoder: Write {
    /// Flushes any remaining output and returns the compressed bytes.
    fn finish(self: Box<Self>) -> io::Result<Vec<u8>>;
}

/// Writes (and compresses) an entry's contents.
///
/// The entry's length, compressed length, and CRC-32 are updated
/// when the writer finishes, either through [`finish()`](EntryWriter::finish)
/// or when it's dropped.
pub struct EntryWriter<'a> {
    entry: &'a mut Entry,
    data: &'a mut Vec<u8>,
    encoder: Option<Box<dyn Encoder>>,
    hasher: Hasher,
    written: u64,
}

impl<'a> EntryWriter<'a> {
    pub(crate) fn new(entry: &'a mut Entry, data: &'a mut Vec<u8>, encoder: Box<dyn Encoder>) -> Self {
        Self {
            entry,
            data,
            encoder: Some(encoder),
            hasher: Hasher::new(),
            written: 0,
        }
    }

    /// Finishes compressing the entry.
    pub fn finish(mut self) -> ArchiveResult<()> {
        self.finish_in_place()
    }

    fn finish_in_place(&mut self) -> ArchiveResult<()> {
        let Some(encoder) = self.encoder.take() else {
            return Ok(());
        };
        *self.data = encoder.finish()?;
        self.entry.length = self.written;
        self.entry.compressed_length = self.data.len() as u64;
        self.entry.crc32 = self.hasher.clone().finalize();
        debug!(
            "Wrote {} ({} bytes, {} compressed)",
            self.entry.name, self.entry.length, self.entry.compressed_length
        );
        Ok(())
    }
}

impl Write for EntryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "entry writer is finished"))?;
        let count = encoder.write(buf)?;
        self.hasher.update(&buf[..count]);
        self.written += count as u64;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.encoder.as_mut() {
            Some(encoder) => encoder.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for EntryWriter<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finish_in_place() {
            error!("Couldn't finish writing {}: {e}", self.entry.name);
        }
    }
}
