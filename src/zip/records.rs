//! Code specific to the ZIP file format's records.
//!
//! We try to keep the nitty gritty here,
//! and higher-level stuff in the [`zip`](super) module.
//!
//! Most comments quote [`APPNOTE.TXT`].
//!
//! [`APPNOTE.TXT`]: https://pkware.cachefly.net/webdocs/APPNOTE/APPNOTE-6.3.6.TXT

use std::borrow::Cow;
use std::convert::TryInto;
use std::io::{self, Write};

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use codepage_437::*;
use memchr::memmem;

use crate::arch::usize;
use crate::entry::{CompressionMethod, Entry};
use crate::result::*;

// Magic numbers denoting various sections of a ZIP archive

/// End of central directory magic number
const EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 5, 6];
/// Zip64 end of central directory magic number
const ZIP64_EOCDR_MAGIC: [u8; 4] = [b'P', b'K', 6, 6];
/// Zip64 end of central directory locator magic number
const ZIP64_EOCDR_LOCATOR_MAGIC: [u8; 4] = [b'P', b'K', 6, 7];
/// Central directory magic number
const CENTRAL_DIRECTORY_MAGIC: [u8; 4] = [b'P', b'K', 1, 2];
/// Local file header magic number
const LOCAL_FILE_HEADER_MAGIC: [u8; 4] = [b'P', b'K', 3, 4];
/// Data descriptor magic number
const DATA_DESCRIPTOR_MAGIC: [u8; 4] = [b'P', b'K', 7, 8];

/// Header ID of the Zip64 extended information extra field
const ZIP64_EXTRA_FIELD: u16 = 0x0001;

/// 32-bit fields holding this value defer to a Zip64 record.
const ZIP64_MARKER_32: u32 = u32::MAX;
/// 16-bit fields holding this value defer to a Zip64 record.
const ZIP64_MARKER_16: u16 = u16::MAX;

/// "Version made by" for records we write: MS-DOS attributes, APPNOTE version 2.0
const VERSION_MADE_BY: u16 = 20;
/// Minimum extract version for deflate or stored data
const VERSION_DEFAULT: u16 = 20;
/// Minimum extract version for Zip64 records
const VERSION_ZIP64: u16 = 45;

/// Bit 0: If set, indicates that the file is encrypted
pub const FLAG_ENCRYPTED: u16 = 1;
/// Bit 3: sizes and CRC are in a data descriptor after the data
pub const FLAG_DATA_DESCRIPTOR: u16 = 1 << 3;
/// Bit 11: Language encoding flag (EFS).  If this bit is set,
/// the filename and comment fields for this file
/// MUST be encoded using UTF-8. (see APPENDIX D)
pub const FLAG_UTF8: u16 = 1 << 11;

/// MS-DOS directory attribute, for external file attributes
const DOS_DIRECTORY_ATTRIBUTE: u32 = 0x10;

impl CompressionMethod {
    pub(crate) fn from_u16(u: u16) -> Self {
        match u {
            0 => CompressionMethod::None,
            8 => CompressionMethod::Deflate,
            v => CompressionMethod::Unsupported(v),
        }
    }

    pub(crate) fn to_u16(self) -> u16 {
        match self {
            CompressionMethod::None => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unsupported(v) => v,
        }
    }
}

// Straight from the Rust docs:

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
fn read_u64(input: &mut &[u8]) -> u64 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    u64::from_le_bytes(int_bytes.try_into().expect("less than eight bytes for u64"))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

/// Splits `len` bytes off the front of the slice,
/// or complains that the archive is cut short.
fn take<'a>(input: &mut &'a [u8], len: usize, what: &'static str) -> ArchiveResult<&'a [u8]> {
    if input.len() < len {
        return Err(ArchiveError::CorruptArchive(what));
    }
    let (taken, rest) = input.split_at(len);
    *input = rest;
    Ok(taken)
}

/// Data from the End of central directory record
///
/// Found at the back of the ZIP archive and provides offsets for finding
/// its central directory, along with lots of stuff that stopped being relevant
/// when we stopped breaking ZIP archives onto multiple floppies.
#[derive(Debug)]
pub struct EndOfCentralDirectory<'a> {
    pub disk_number: u16,
    pub disk_with_central_directory: u16,
    pub entries_on_this_disk: u16,
    pub entries: u16,
    pub central_directory_size: u32,
    pub central_directory_offset: u32,
    pub file_comment: &'a [u8],
}

impl<'a> EndOfCentralDirectory<'a> {
    pub fn parse(mut eocdr: &'a [u8]) -> ArchiveResult<Self> {
        // 4.3.16  End of central directory record:
        //
        // end of central dir signature    4 bytes  (0x06054b50)
        // number of this disk             2 bytes
        // number of the disk with the
        // start of the central directory  2 bytes
        // total number of entries in
        // the central dir on this disk    2 bytes
        // total number of entries in
        // the central dir                 2 bytes
        // size of the central directory   4 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        4 bytes
        // zipfile comment length          2 bytes
        let mut fixed = take(
            &mut eocdr,
            Self::fixed_size_in_file(),
            "Truncated End Of Central Directory Record",
        )?;
        if fixed[..4] != EOCDR_MAGIC {
            return Err(ArchiveError::CorruptArchive(
                "Invalid End Of Central Directory Record",
            ));
        }
        fixed = &fixed[4..];
        let disk_number = read_u16(&mut fixed);
        let disk_with_central_directory = read_u16(&mut fixed);
        let entries_on_this_disk = read_u16(&mut fixed);
        let entries = read_u16(&mut fixed);
        let central_directory_size = read_u32(&mut fixed);
        let central_directory_offset = read_u32(&mut fixed);
        let comment_length = usize(read_u16(&mut fixed))?;
        let file_comment = take(&mut eocdr, comment_length, "Truncated archive comment")?;

        Ok(Self {
            disk_number,
            disk_with_central_directory,
            entries_on_this_disk,
            entries,
            central_directory_size,
            central_directory_offset,
            file_comment,
        })
    }

    pub fn fixed_size_in_file() -> usize {
        22
    }
}

/// Searches backward through `mapping` to find the
/// End of central directory record.
///
/// It should be right at the end of the file,
/// but its variable size means we can't jump to a known offset.
pub fn find_eocdr(mapping: &[u8]) -> ArchiveResult<usize> {
    memmem::rfind(mapping, &EOCDR_MAGIC).ok_or(ArchiveError::CorruptArchive(
        "Couldn't find End Of Central Directory Record",
    ))
}

/// Data from the Zip64 end of central directory locator
///
/// This should immediately precede the End of central directory record
/// on Zip64 files and tell us where to find the Zip64 end of central directory record.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectoryLocator {
    pub disk_with_central_directory: u32,
    pub zip64_eocdr_offset: u64,
    pub disks: u32,
}

impl Zip64EndOfCentralDirectoryLocator {
    pub fn parse(mut mapping: &[u8]) -> Option<Self> {
        // 4.3.15 Zip64 end of central directory locator
        //
        // zip64 end of central dir locator
        // signature                       4 bytes  (0x07064b50)
        // number of the disk with the
        // start of the zip64 end of
        // central directory               4 bytes
        // relative offset of the zip64
        // end of central directory record 8 bytes
        // total number of disks           4 bytes
        if mapping.len() < Self::size_in_file() || mapping[..4] != ZIP64_EOCDR_LOCATOR_MAGIC {
            return None;
        }
        mapping = &mapping[4..];
        let disk_with_central_directory = read_u32(&mut mapping);
        let zip64_eocdr_offset = read_u64(&mut mapping);
        let disks = read_u32(&mut mapping);

        Some(Self {
            disk_with_central_directory,
            zip64_eocdr_offset,
            disks,
        })
    }

    pub fn size_in_file() -> usize {
        20
    }
}

/// Data from the Zip64 end of central directory record
///
/// Precedes the Zip64 EOCDR locator (and the "classic" EOCDR)
/// and holds the 64-bit versions of its fields.
#[derive(Debug)]
pub struct Zip64EndOfCentralDirectory<'a> {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub disk_number: u32,
    pub disk_with_central_directory: u32,
    pub entries_on_this_disk: u64,
    pub entries: u64,
    pub central_directory_size: u64,
    pub central_directory_offset: u64,
    pub extensible_data: &'a [u8],
}

impl<'a> Zip64EndOfCentralDirectory<'a> {
    pub fn parse(mut eocdr: &'a [u8]) -> ArchiveResult<Self> {
        // 4.3.14  Zip64 end of central directory record
        //
        // zip64 end of central dir
        // signature                       4 bytes  (0x06064b50)
        // size of zip64 end of central
        // directory record                8 bytes
        // version made by                 2 bytes
        // version needed to extract       2 bytes
        // number of this disk             4 bytes
        // number of the disk with the
        // start of the central directory  4 bytes
        // total number of entries in the
        // central directory on this disk  8 bytes
        // total number of entries in the
        // central directory               8 bytes
        // size of the central directory   8 bytes
        // offset of start of central
        // directory with respect to
        // the starting disk number        8 bytes
        // zip64 extensible data sector    (variable size)
        let mut fixed = take(
            &mut eocdr,
            Self::fixed_size_in_file(),
            "Truncated Zip64 End Of Central Directory Record",
        )?;
        if fixed[..4] != ZIP64_EOCDR_MAGIC {
            return Err(ArchiveError::CorruptArchive(
                "Invalid Zip64 End Of Central Directory Record",
            ));
        }
        fixed = &fixed[4..];
        let eocdr_size = read_u64(&mut fixed);
        let source_version = read_u16(&mut fixed);
        let minimum_extract_version = read_u16(&mut fixed);
        let disk_number = read_u32(&mut fixed);
        let disk_with_central_directory = read_u32(&mut fixed);
        let entries_on_this_disk = read_u64(&mut fixed);
        let entries = read_u64(&mut fixed);
        let central_directory_size = read_u64(&mut fixed);
        let central_directory_offset = read_u64(&mut fixed);

        // 4.3.14.1 The value stored into the "size of zip64 end of central
        // directory record" SHOULD be the size of the remaining
        // record and SHOULD NOT include the leading 12 bytes.
        //
        // Size = SizeOfFixedFields + SizeOfVariableData - 12.
        // (SizeOfVariableData = Size - SizeOfFixedFields + 12)
        let extensible_data_length = usize(eocdr_size)?
            .checked_add(12)
            .and_then(|s| s.checked_sub(Self::fixed_size_in_file()))
            .ok_or(ArchiveError::CorruptArchive(
                "Invalid extensible data length in Zip64 End Of Central Directory Record",
            ))?;
        // We should be left with just the extensible data:
        let extensible_data = take(
            &mut eocdr,
            extensible_data_length,
            "Invalid extensible data length in Zip64 End Of Central Directory Record",
        )?;

        Ok(Self {
            source_version,
            minimum_extract_version,
            disk_number,
            disk_with_central_directory,
            entries,
            entries_on_this_disk,
            central_directory_size,
            central_directory_offset,
            extensible_data,
        })
    }

    fn fixed_size_in_file() -> usize {
        56
    }
}

/// Finds the Zip64 end of central directory record in the given slice.
///
/// The slice should start at the Zip64 EOCDR's nominal location,
/// but we might have to do some searching since ZIP archives can have
/// arbitrary junk up front.
pub fn find_zip64_eocdr(mapping: &[u8]) -> ArchiveResult<usize> {
    memmem::find(mapping, &ZIP64_EOCDR_MAGIC).ok_or(ArchiveError::CorruptArchive(
        "Couldn't find zip64 End Of Central Directory Record",
    ))
}

/// Data from a central directory entry
///
/// Each of these records contians information about a file or folder
/// stored in the ZIP archive.
#[derive(Debug)]
pub struct CentralDirectoryEntry<'a> {
    pub source_version: u16,
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub disk_number: u16,
    pub internal_file_attributes: u16,
    pub external_file_attributes: u32,
    pub header_offset: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
    pub file_comment: &'a [u8],
}

impl<'a> CentralDirectoryEntry<'a> {
    pub fn parse_and_consume(entry: &mut &'a [u8]) -> ArchiveResult<Self> {
        // 4.3.12  Central directory structure:
        //
        //   central file header signature   4 bytes  (0x02014b50)
        //   version made by                 2 bytes
        //   version needed to extract       2 bytes
        //   general purpose bit flag        2 bytes
        //   compression method              2 bytes
        //   last mod file time              2 bytes
        //   last mod file date              2 bytes
        //   crc-32                          4 bytes
        //   compressed size                 4 bytes
        //   uncompressed size               4 bytes
        //   file name length                2 bytes
        //   extra field length              2 bytes
        //   file comment length             2 bytes
        //   disk number start               2 bytes
        //   internal file attributes        2 bytes
        //   external file attributes        4 bytes
        //   relative offset of local header 4 bytes
        //
        //   file name (variable size)
        //   extra field (variable size)
        //   file comment (variable size)
        let mut fixed = take(entry, 46, "Truncated central directory entry")?;
        if fixed[..4] != CENTRAL_DIRECTORY_MAGIC {
            return Err(ArchiveError::CorruptArchive(
                "Invalid central directory entry",
            ));
        }
        fixed = &fixed[4..];
        let source_version = read_u16(&mut fixed);
        let minimum_extract_version = read_u16(&mut fixed);
        let flags = read_u16(&mut fixed);
        let compression_method = read_u16(&mut fixed);
        let last_modified_time = read_u16(&mut fixed);
        let last_modified_date = read_u16(&mut fixed);
        let crc32 = read_u32(&mut fixed);
        let compressed_size = read_u32(&mut fixed);
        let uncompressed_size = read_u32(&mut fixed);
        let path_length = usize(read_u16(&mut fixed))?;
        let extra_field_length = usize(read_u16(&mut fixed))?;
        let file_comment_length = usize(read_u16(&mut fixed))?;
        let disk_number = read_u16(&mut fixed);
        let internal_file_attributes = read_u16(&mut fixed);
        let external_file_attributes = read_u32(&mut fixed);
        let header_offset = read_u32(&mut fixed);
        let path = take(entry, path_length, "Truncated central directory entry path")?;
        let extra_field = take(
            entry,
            extra_field_length,
            "Truncated central directory entry extra field",
        )?;
        let file_comment = take(
            entry,
            file_comment_length,
            "Truncated central directory entry comment",
        )?;

        Ok(Self {
            source_version,
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            disk_number,
            internal_file_attributes,
            external_file_attributes,
            header_offset,
            path,
            extra_field,
            file_comment,
        })
    }
}

/// Data from a local file header
///
/// Each files' actual contents is preceded by this header.
/// These headers alllow for "streaming" decompression without
/// the use of the central directory,
/// but we only use them to find where the data starts
/// (and to double-check the central directory).
#[derive(Debug)]
pub struct LocalFileHeader<'a> {
    pub minimum_extract_version: u16,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified_time: u16,
    pub last_modified_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub path: &'a [u8],
    pub extra_field: &'a [u8],
}

impl<'a> LocalFileHeader<'a> {
    pub fn parse_and_consume(header: &mut &'a [u8]) -> ArchiveResult<Self> {
        // 4.3.7  Local file header:
        //
        // local file header signature     4 bytes  (0x04034b50)
        // version needed to extract       2 bytes
        // general purpose bit flag        2 bytes
        // compression method              2 bytes
        // last mod file time              2 bytes
        // last mod file date              2 bytes
        // crc-32                          4 bytes
        // compressed size                 4 bytes
        // uncompressed size               4 bytes
        // file name length                2 bytes
        // extra field length              2 bytes
        //
        // file name (variable size)
        // extra field (variable size)
        let mut fixed = take(header, 30, "Truncated local file header")?;
        if fixed[..4] != LOCAL_FILE_HEADER_MAGIC {
            return Err(ArchiveError::CorruptArchive("Invalid local file header"));
        }
        fixed = &fixed[4..];
        let minimum_extract_version = read_u16(&mut fixed);
        let flags = read_u16(&mut fixed);
        let compression_method = read_u16(&mut fixed);
        let last_modified_time = read_u16(&mut fixed);
        let last_modified_date = read_u16(&mut fixed);
        let crc32 = read_u32(&mut fixed);
        let compressed_size = read_u32(&mut fixed);
        let uncompressed_size = read_u32(&mut fixed);
        let path_length = usize(read_u16(&mut fixed))?;
        let extra_field_length = usize(read_u16(&mut fixed))?;
        let path = take(header, path_length, "Truncated local file header path")?;
        let extra_field = take(
            header,
            extra_field_length,
            "Truncated local file header extra field",
        )?;

        Ok(Self {
            minimum_extract_version,
            flags,
            compression_method,
            last_modified_time,
            last_modified_date,
            crc32,
            compressed_size,
            uncompressed_size,
            path,
            extra_field,
        })
    }
}

/// Extracts the "is this text UTF-8?" bit from the 16-bit flags field.
///
/// If false, text is assumped to be CP437.
fn is_utf8(flags: u16) -> bool {
    flags & FLAG_UTF8 != 0
}

/// Extracts the "is this file encrypted?" bit from the 16-bit flags field.
fn is_encrypted(flags: u16) -> bool {
    flags & FLAG_ENCRYPTED != 0
}

/// Decodes a file name as UTF-8 or CP437, per the flags,
/// and normalizes its separators.
pub fn decode_name(raw: &[u8], flags: u16) -> ArchiveResult<String> {
    let name: Cow<str> = if is_utf8(flags) {
        Cow::Borrowed(std::str::from_utf8(raw).map_err(ArchiveError::Encoding)?)
    } else {
        Cow::borrow_from_cp437(raw, &CP437_CONTROL)
    };
    Ok(name.replace('\\', "/"))
}

/// What we learn about an entry from its central directory record
#[derive(Debug)]
pub struct CentralMetadata {
    pub entry: Entry,
    pub flags: u16,
    pub header_offset: usize,
}

impl CentralMetadata {
    /// Extracts entry metadata from a central directory entry
    pub fn from_cde(cde: &CentralDirectoryEntry) -> ArchiveResult<Self> {
        let name = decode_name(cde.path, cde.flags)?;

        if cde.disk_number != 0 {
            return Err(ArchiveError::UnsupportedArchive(format!(
                "No support for multi-disk archives: file {} claims to be on disk {}",
                name, cde.disk_number,
            )));
        }

        let mut sizes = Zip64Sizes {
            size: cde.uncompressed_size as u64,
            compressed_size: cde.compressed_size as u64,
            header_offset: cde.header_offset as u64,
        };
        sizes.parse_extra_field(cde.extra_field)?;

        let mut entry = Entry::new(name, CompressionMethod::from_u16(cde.compression_method));
        entry.length = sizes.size;
        entry.compressed_length = sizes.compressed_size;
        entry.last_modified = parse_msdos(cde.last_modified_time, cde.last_modified_date);
        entry.crc32 = cde.crc32;
        entry.encrypted = is_encrypted(cde.flags);

        Ok(Self {
            entry,
            flags: cde.flags,
            header_offset: usize(sizes.header_offset)?,
        })
    }
}

/// Sizes that might be pushed into the Zip64 extra field
#[derive(Debug, PartialEq, Eq)]
pub struct Zip64Sizes {
    pub size: u64,
    pub compressed_size: u64,
    pub header_offset: u64,
}

impl Zip64Sizes {
    /// Parses the "extra fields" found in central directory entries
    /// and local file headers.
    ///
    /// Currently we just look for Zip64 info (64-bit values for files > 2^32 in size)
    pub fn parse_extra_field(&mut self, mut extra_field: &[u8]) -> ArchiveResult<()> {
        // 4.5.1 In order to allow different programs and different types
        // of information to be stored in the 'extra' field in .ZIP
        // files, the following structure MUST be used for all
        // programs storing data in this field:
        //
        //     header1+data1 + header2+data2 . . .
        //
        // Each header MUST consist of:
        //
        //     Header ID - 2 bytes
        //     Data Size - 2 bytes
        while !extra_field.is_empty() {
            let mut header = take(&mut extra_field, 4, "Truncated extra field header")?;
            let kind = read_u16(&mut header);
            let field_len = usize(read_u16(&mut header))?;
            let mut field = take(&mut extra_field, field_len, "Truncated extra field")?;

            // Zip64 extended information extra field
            if kind == ZIP64_EXTRA_FIELD {
                for value in [
                    &mut self.size,
                    &mut self.compressed_size,
                    &mut self.header_offset,
                ] {
                    if *value == ZIP64_MARKER_32 as u64 {
                        let mut bytes = take(&mut field, 8, "Truncated Zip64 extra field")?;
                        *value = read_u64(&mut bytes);
                    }
                }
                // Anything left would be the disk number, and
                // we already checked that this isn't a multi-disk archive.
            }
        }
        Ok(())
    }

    fn needs_zip64(&self) -> bool {
        self.size >= ZIP64_MARKER_32 as u64
            || self.compressed_size >= ZIP64_MARKER_32 as u64
            || self.header_offset >= ZIP64_MARKER_32 as u64
    }
}

/// Converts an MS-DOS date and time to UTC.
///
/// (ZIP doesn't store time zones, so UTC is as good a guess as any.)
/// Garbage dates become the MS-DOS epoch.
pub fn parse_msdos(time: u16, date: u16) -> DateTime<Utc> {
    let seconds = (0b0000_0000_0001_1111 & time) as u32 * 2; // MSDOS uses 2-second precision
    let minutes = (0b0000_0111_1110_0000 & time) as u32 >> 5;
    let hours = (0b1111_1000_0000_0000 & time) as u32 >> 11;

    let days = (0b0000_0000_0001_1111 & date) as u32;
    let months = (0b0000_0001_1110_0000 & date) as u32 >> 5;
    // MSDOS uses years since 1980; Always interpreted as a positive value
    let years = ((0b1111_1110_0000_0000 & date) >> 9) as i32 + 1980;

    NaiveDate::from_ymd_opt(years, months, days)
        .and_then(|d| d.and_hms_opt(hours, minutes, seconds.min(59)))
        .unwrap_or_else(msdos_epoch)
        .and_utc()
}

fn msdos_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1980, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .expect("1980-01-01 is a valid date")
}

/// Converts a UTC timestamp to an MS-DOS (time, date) pair,
/// clamping it to the range MS-DOS can represent.
pub fn to_msdos(when: &DateTime<Utc>) -> (u16, u16) {
    let when = when.naive_utc();
    if when.year() < 1980 {
        return (0, (1 << 5) | 1);
    }
    if when.year() > 2107 {
        return (
            (23 << 11) | (59 << 5) | 29,
            (127 << 9) | (12 << 5) | 31,
        );
    }
    let time = (when.hour() << 11) | (when.minute() << 5) | (when.second() / 2);
    let date = ((when.year() as u32 - 1980) << 9) | (when.month() << 5) | when.day();
    (time as u16, date as u16)
}

/// The current time, rounded down to what an MS-DOS timestamp can hold
pub fn msdos_now() -> DateTime<Utc> {
    let (time, date) = to_msdos(&Utc::now());
    parse_msdos(time, date)
}

/// Everything we need to write an entry's headers
#[derive(Debug)]
pub struct EntryHeader<'a> {
    pub name: &'a str,
    pub flags: u16,
    pub compression_method: u16,
    pub last_modified: (u16, u16),
    pub crc32: u32,
    pub size: u64,
    pub compressed_size: u64,
    pub is_dir: bool,
}

/// What the central directory needs to remember about a written entry
#[derive(Debug)]
struct WrittenEntry {
    name: Vec<u8>,
    flags: u16,
    compression_method: u16,
    last_modified: (u16, u16),
    crc32: u32,
    sizes: Zip64Sizes,
    external_file_attributes: u32,
}

/// Writes a ZIP archive, one entry at a time.
///
/// Entry data is written as it comes;
/// the central directory waits until [`finish()`](ArchiveWriter::finish).
pub struct ArchiveWriter<W: Write> {
    writer: W,
    offset: u64,
    entries: Vec<WrittenEntry>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            offset: 0,
            entries: Vec::new(),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Writes data that precedes the archive proper,
    /// like a self-extractor stub.
    pub fn write_prefix(&mut self, prefix: &[u8]) -> ArchiveResult<()> {
        assert!(self.entries.is_empty(), "prefix written after entries");
        self.write_all(prefix)?;
        Ok(())
    }

    /// Writes a local file header followed by the (already compressed) data.
    pub fn add(&mut self, header: &EntryHeader, data: &[u8]) -> ArchiveResult<()> {
        let name = header.name.as_bytes();
        if name.len() > u16::MAX as usize {
            return Err(ArchiveError::InvalidName {
                name: header.name.to_owned(),
                reason: "name is too long",
            });
        }
        let sizes = Zip64Sizes {
            size: header.size,
            compressed_size: header.compressed_size,
            header_offset: self.offset,
        };
        let zip64 = sizes.size >= ZIP64_MARKER_32 as u64
            || sizes.compressed_size >= ZIP64_MARKER_32 as u64;
        let descriptor = header.flags & FLAG_DATA_DESCRIPTOR != 0;

        // 4.5.3 ... If one of the size or offset fields in the Local or
        // Central directory record is too small to hold the required data,
        // a Zip64 extended information record is created. The order of
        // the fields in the zip64 extended information record is fixed,
        //
        // When present in the local header, both sizes MUST be included.
        let mut extra = Vec::new();
        if zip64 {
            extra.extend_from_slice(&ZIP64_EXTRA_FIELD.to_le_bytes());
            extra.extend_from_slice(&16u16.to_le_bytes());
            extra.extend_from_slice(&sizes.size.to_le_bytes());
            extra.extend_from_slice(&sizes.compressed_size.to_le_bytes());
        }
        let (crc32, size_32, compressed_size_32) = if descriptor {
            (0, 0, 0)
        } else if zip64 {
            (header.crc32, ZIP64_MARKER_32, ZIP64_MARKER_32)
        } else {
            (
                header.crc32,
                sizes.size as u32,
                sizes.compressed_size as u32,
            )
        };

        let mut record = Vec::with_capacity(30 + name.len() + extra.len());
        record.extend_from_slice(&LOCAL_FILE_HEADER_MAGIC);
        let version = if zip64 { VERSION_ZIP64 } else { VERSION_DEFAULT };
        record.extend_from_slice(&version.to_le_bytes());
        record.extend_from_slice(&header.flags.to_le_bytes());
        record.extend_from_slice(&header.compression_method.to_le_bytes());
        record.extend_from_slice(&header.last_modified.0.to_le_bytes());
        record.extend_from_slice(&header.last_modified.1.to_le_bytes());
        record.extend_from_slice(&crc32.to_le_bytes());
        record.extend_from_slice(&compressed_size_32.to_le_bytes());
        record.extend_from_slice(&size_32.to_le_bytes());
        record.extend_from_slice(&(name.len() as u16).to_le_bytes());
        record.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        record.extend_from_slice(name);
        record.extend_from_slice(&extra);
        self.write_all(&record)?;
        self.write_all(data)?;

        if descriptor {
            // 4.3.9  Data descriptor:
            //
            //     crc-32                          4 bytes
            //     compressed size                 4 bytes
            //     uncompressed size               4 bytes
            //
            // (Zip64 archives use 8-byte sizes.)
            let mut record = Vec::with_capacity(24);
            record.extend_from_slice(&DATA_DESCRIPTOR_MAGIC);
            record.extend_from_slice(&header.crc32.to_le_bytes());
            if zip64 {
                record.extend_from_slice(&sizes.compressed_size.to_le_bytes());
                record.extend_from_slice(&sizes.size.to_le_bytes());
            } else {
                record.extend_from_slice(&(sizes.compressed_size as u32).to_le_bytes());
                record.extend_from_slice(&(sizes.size as u32).to_le_bytes());
            }
            self.write_all(&record)?;
        }

        self.entries.push(WrittenEntry {
            name: name.to_vec(),
            flags: header.flags,
            compression_method: header.compression_method,
            last_modified: header.last_modified,
            crc32: header.crc32,
            sizes,
            external_file_attributes: if header.is_dir {
                DOS_DIRECTORY_ATTRIBUTE
            } else {
                0
            },
        });
        Ok(())
    }

    /// Writes the central directory and end records,
    /// returning the writer and the archive's total length.
    pub fn finish(mut self) -> ArchiveResult<(W, u64)> {
        let central_directory_offset = self.offset;
        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            self.write_central_directory_entry(entry)?;
        }
        let central_directory_size = self.offset - central_directory_offset;
        let entry_count = entries.len() as u64;

        let needs_zip64 = entry_count >= ZIP64_MARKER_16 as u64
            || central_directory_size >= ZIP64_MARKER_32 as u64
            || central_directory_offset >= ZIP64_MARKER_32 as u64;

        if needs_zip64 {
            let zip64_eocdr_offset = self.offset;
            let mut record = Vec::with_capacity(56 + 20);
            record.extend_from_slice(&ZIP64_EOCDR_MAGIC);
            // Size of the remaining record, not including the leading 12 bytes
            record.extend_from_slice(&44u64.to_le_bytes());
            record.extend_from_slice(&VERSION_MADE_BY.to_le_bytes());
            record.extend_from_slice(&VERSION_ZIP64.to_le_bytes());
            record.extend_from_slice(&0u32.to_le_bytes());
            record.extend_from_slice(&0u32.to_le_bytes());
            record.extend_from_slice(&entry_count.to_le_bytes());
            record.extend_from_slice(&entry_count.to_le_bytes());
            record.extend_from_slice(&central_directory_size.to_le_bytes());
            record.extend_from_slice(&central_directory_offset.to_le_bytes());

            record.extend_from_slice(&ZIP64_EOCDR_LOCATOR_MAGIC);
            record.extend_from_slice(&0u32.to_le_bytes());
            record.extend_from_slice(&zip64_eocdr_offset.to_le_bytes());
            record.extend_from_slice(&1u32.to_le_bytes());
            self.write_all(&record)?;
        }

        let entry_count_16 = entry_count.min(ZIP64_MARKER_16 as u64) as u16;
        let clamp_32 = |v: u64| v.min(ZIP64_MARKER_32 as u64) as u32;

        let mut record = Vec::with_capacity(EndOfCentralDirectory::fixed_size_in_file());
        record.extend_from_slice(&EOCDR_MAGIC);
        record.extend_from_slice(&0u16.to_le_bytes());
        record.extend_from_slice(&0u16.to_le_bytes());
        record.extend_from_slice(&entry_count_16.to_le_bytes());
        record.extend_from_slice(&entry_count_16.to_le_bytes());
        record.extend_from_slice(&clamp_32(central_directory_size).to_le_bytes());
        record.extend_from_slice(&clamp_32(central_directory_offset).to_le_bytes());
        // No comment
        record.extend_from_slice(&0u16.to_le_bytes());
        self.write_all(&record)?;

        self.writer.flush()?;
        Ok((self.writer, self.offset))
    }

    fn write_central_directory_entry(&mut self, entry: &WrittenEntry) -> ArchiveResult<()> {
        let sizes = &entry.sizes;
        let mut extra = Vec::new();
        if sizes.needs_zip64() {
            // Only the fields that overflowed, in this order.
            let mut values = Vec::new();
            if sizes.size >= ZIP64_MARKER_32 as u64 {
                values.push(sizes.size);
            }
            if sizes.compressed_size >= ZIP64_MARKER_32 as u64 {
                values.push(sizes.compressed_size);
            }
            if sizes.header_offset >= ZIP64_MARKER_32 as u64 {
                values.push(sizes.header_offset);
            }
            extra.extend_from_slice(&ZIP64_EXTRA_FIELD.to_le_bytes());
            extra.extend_from_slice(&((values.len() * 8) as u16).to_le_bytes());
            for value in values {
                extra.extend_from_slice(&value.to_le_bytes());
            }
        }
        let clamp_32 = |v: u64| v.min(ZIP64_MARKER_32 as u64) as u32;
        let version = if sizes.needs_zip64() {
            VERSION_ZIP64
        } else {
            VERSION_DEFAULT
        };

        let mut record = Vec::with_capacity(46 + entry.name.len() + extra.len());
        record.extend_from_slice(&CENTRAL_DIRECTORY_MAGIC);
        record.extend_from_slice(&VERSION_MADE_BY.to_le_bytes());
        record.extend_from_slice(&version.to_le_bytes());
        record.extend_from_slice(&entry.flags.to_le_bytes());
        record.extend_from_slice(&entry.compression_method.to_le_bytes());
        record.extend_from_slice(&entry.last_modified.0.to_le_bytes());
        record.extend_from_slice(&entry.last_modified.1.to_le_bytes());
        record.extend_from_slice(&entry.crc32.to_le_bytes());
        record.extend_from_slice(&clamp_32(sizes.compressed_size).to_le_bytes());
        record.extend_from_slice(&clamp_32(sizes.size).to_le_bytes());
        record.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
        record.extend_from_slice(&(extra.len() as u16).to_le_bytes());
        // File comment length, disk number start, internal attributes
        record.extend_from_slice(&0u16.to_le_bytes());
        record.extend_from_slice(&0u16.to_le_bytes());
        record.extend_from_slice(&0u16.to_le_bytes());
        record.extend_from_slice(&entry.external_file_attributes.to_le_bytes());
        record.extend_from_slice(&clamp_32(sizes.header_offset).to_le_bytes());
        record.extend_from_slice(&entry.name);
        record.extend_from_slice(&extra);
        self.write_all(&record)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn msdos_round_trip() {
        let when = Utc.with_ymd_and_hms(2021, 7, 14, 13, 37, 42).unwrap();
        let (time, date) = to_msdos(&when);
        assert_eq!(parse_msdos(time, date), when);

        // Odd seconds get rounded down.
        let odd = Utc.with_ymd_and_hms(2021, 7, 14, 13, 37, 43).unwrap();
        let (time, date) = to_msdos(&odd);
        assert_eq!(parse_msdos(time, date), when);
    }

    #[test]
    fn msdos_clamps() {
        let ancient = Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap();
        let (time, date) = to_msdos(&ancient);
        assert_eq!(parse_msdos(time, date), msdos_epoch().and_utc());

        // Month zero is nonsense.
        assert_eq!(parse_msdos(0, 0), msdos_epoch().and_utc());
    }

    #[test]
    fn truncated_records() {
        let mut short: &[u8] = &CENTRAL_DIRECTORY_MAGIC;
        assert!(matches!(
            CentralDirectoryEntry::parse_and_consume(&mut short),
            Err(ArchiveError::CorruptArchive(_))
        ));

        let mut eocdr = EOCDR_MAGIC.to_vec();
        eocdr.extend_from_slice(&[0; 16]);
        // Claim a comment that isn't there.
        eocdr.extend_from_slice(&10u16.to_le_bytes());
        assert!(matches!(
            EndOfCentralDirectory::parse(&eocdr),
            Err(ArchiveError::CorruptArchive(_))
        ));
    }

    #[test]
    fn zip64_extra_field() {
        let mut sizes = Zip64Sizes {
            size: ZIP64_MARKER_32 as u64,
            compressed_size: 1234,
            header_offset: ZIP64_MARKER_32 as u64,
        };
        let mut extra = Vec::new();
        // Some other field we don't care about
        extra.extend_from_slice(&0x5455u16.to_le_bytes());
        extra.extend_from_slice(&1u16.to_le_bytes());
        extra.push(0);
        extra.extend_from_slice(&ZIP64_EXTRA_FIELD.to_le_bytes());
        extra.extend_from_slice(&16u16.to_le_bytes());
        extra.extend_from_slice(&(5u64 << 32).to_le_bytes());
        extra.extend_from_slice(&(6u64 << 32).to_le_bytes());
        sizes.parse_extra_field(&extra).unwrap();
        assert_eq!(
            sizes,
            Zip64Sizes {
                size: 5 << 32,
                compressed_size: 1234,
                header_offset: 6 << 32,
            }
        );
    }

    #[test]
    fn cp437_names() {
        // 0x82 is é in CP437
        assert_eq!(decode_name(b"caf\x82.txt", 0).unwrap(), "café.txt");
        assert_eq!(
            decode_name("café.txt".as_bytes(), FLAG_UTF8).unwrap(),
            "café.txt"
        );
        assert!(decode_name(b"\xff", FLAG_UTF8).is_err());
        assert_eq!(decode_name(b"dir\\file", FLAG_UTF8).unwrap(), "dir/file");
    }

    #[test]
    fn written_records_parse() {
        let mut writer = ArchiveWriter::new(Vec::new());
        let (time, date) = to_msdos(&Utc.with_ymd_and_hms(2000, 1, 2, 3, 4, 6).unwrap());
        writer
            .add(
                &EntryHeader {
                    name: "hi.txt",
                    flags: FLAG_UTF8,
                    compression_method: 0,
                    last_modified: (time, date),
                    crc32: crc32fast::hash(b"hi"),
                    size: 2,
                    compressed_size: 2,
                    is_dir: false,
                },
                b"hi",
            )
            .unwrap();
        let (bytes, len) = writer.finish().unwrap();
        assert_eq!(bytes.len() as u64, len);

        let eocdr_posit = find_eocdr(&bytes).unwrap();
        let eocdr = EndOfCentralDirectory::parse(&bytes[eocdr_posit..]).unwrap();
        assert_eq!(eocdr.entries, 1);

        let mut central = &bytes[eocdr.central_directory_offset as usize..];
        let cde = CentralDirectoryEntry::parse_and_consume(&mut central).unwrap();
        let metadata = CentralMetadata::from_cde(&cde).unwrap();
        assert_eq!(metadata.entry.name, "hi.txt");
        assert_eq!(metadata.entry.length, 2);
        assert_eq!(metadata.header_offset, 0);

        let mut local = &bytes[..];
        let header = LocalFileHeader::parse_and_consume(&mut local).unwrap();
        assert_eq!(header.path, b"hi.txt");
        assert_eq!(&local[..2], b"hi");
    }
}
