//! Archive format detection.
//!
//! We look at the leading bytes of a stream first,
//! and only fall back to the file's extension when those bytes
//! are inconclusive (or can't be read back at all).

use std::io::{self, Read, Seek, SeekFrom};

use camino::Utf8Path;
use log::*;

/// Archive and compressed-stream formats we can recognize.
///
/// Recognizing a format doesn't mean we can open it;
/// that depends on what's in the [`Registry`](crate::Registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Format {
    /// ZIP archive (.zip, .jar, ...)
    Zip,
    /// GZIP compressed stream (.gz, .tgz)
    Gzip,
    /// TAR archive (.tar)
    Tar,
    /// Bzip2 compressed stream (.bz2)
    Bzip2,
    /// XZ compressed stream (.xz)
    Xz,
    /// 7-Zip archive (.7z)
    SevenZip,
    /// Zstandard compressed stream (.zst)
    Zstd,
}

/// Enough bytes to see tar's `ustar` magic at offset 257.
const SNIFF_LENGTH: usize = 262;

impl Format {
    /// Identifies a format from the first bytes of a stream.
    pub fn from_magic(magic: &[u8]) -> Option<Self> {
        match magic {
            // Local file header, end of central directory (empty archive),
            // or a spanning marker.
            [b'P', b'K', 3, 4, ..] | [b'P', b'K', 5, 6, ..] | [b'P', b'K', 7, 8, ..] => {
                Some(Format::Zip)
            }
            [0x1F, 0x8B, ..] => Some(Format::Gzip),
            [0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C, ..] => Some(Format::SevenZip),
            [0xFD, b'7', b'z', b'X', b'Z', 0x00, ..] => Some(Format::Xz),
            [b'B', b'Z', b'h', ..] => Some(Format::Bzip2),
            [0x28, 0xB5, 0x2F, 0xFD, ..] => Some(Format::Zstd),
            _ if magic.len() >= SNIFF_LENGTH && &magic[257..262] == b"ustar" => Some(Format::Tar),
            _ => None,
        }
    }

    /// Guesses a format from a file name's extension.
    pub fn from_extension(path: &Utf8Path) -> Option<Self> {
        let extension = path.extension()?.to_ascii_lowercase();
        match extension.as_str() {
            "zip" | "jar" | "apk" | "epub" => Some(Format::Zip),
            "gz" | "tgz" => Some(Format::Gzip),
            "tar" => Some(Format::Tar),
            "bz2" => Some(Format::Bzip2),
            "xz" => Some(Format::Xz),
            "7z" => Some(Format::SevenZip),
            "zst" => Some(Format::Zstd),
            _ => None,
        }
    }

    /// The typical file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Zip => "zip",
            Format::Gzip => "gz",
            Format::Tar => "tar",
            Format::Bzip2 => "bz2",
            Format::Xz => "xz",
            Format::SevenZip => "7z",
            Format::Zstd => "zst",
        }
    }

    /// True if the format holds multiple named entries
    /// (as opposed to a single compressed stream).
    pub fn is_container(&self) -> bool {
        matches!(self, Format::Zip | Format::Tar | Format::SevenZip)
    }
}

/// Reads the leading bytes of the stream and rewinds it.
fn sniff<S: Read + Seek + ?Sized>(stream: &mut S) -> io::Result<Vec<u8>> {
    stream.seek(SeekFrom::Start(0))?;
    let mut magic = Vec::with_capacity(SNIFF_LENGTH);
    (&mut *stream)
        .take(SNIFF_LENGTH as u64)
        .read_to_end(&mut magic)?;
    stream.seek(SeekFrom::Start(0))?;
    Ok(magic)
}

/// Detects the format of `stream`, using `name` as a hint
/// if the signature doesn't match anything we know.
pub fn detect<S: Read + Seek + ?Sized>(stream: &mut S, name: Option<&Utf8Path>) -> Option<Format> {
    match sniff(stream) {
        Ok(magic) => {
            if let Some(format) = Format::from_magic(&magic) {
                debug!("Detected {format:?} from signature");
                return Some(format);
            }
            trace!("No known signature in {} leading bytes", magic.len());
        }
        Err(e) => {
            debug!("Couldn't sniff stream signature ({e}), trying its name");
        }
    }

    let format = name.and_then(Format::from_extension);
    if let Some(format) = format {
        debug!("Detected {format:?} from extension");
    }
    format
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn signatures() {
        assert_eq!(Format::from_magic(b"PK\x03\x04rest"), Some(Format::Zip));
        assert_eq!(Format::from_magic(b"PK\x05\x06"), Some(Format::Zip));
        assert_eq!(Format::from_magic(&[0x1F, 0x8B, 8]), Some(Format::Gzip));
        assert_eq!(Format::from_magic(b"BZh91AY"), Some(Format::Bzip2));
        assert_eq!(
            Format::from_magic(&[0xFD, b'7', b'z', b'X', b'Z', 0]),
            Some(Format::Xz)
        );
        assert_eq!(Format::from_magic(b"PK"), None);
        assert_eq!(Format::from_magic(b"Hello, world!"), None);
        assert_eq!(Format::from_magic(b""), None);

        let mut tar = vec![0u8; 512];
        tar[257..262].copy_from_slice(b"ustar");
        assert_eq!(Format::from_magic(&tar), Some(Format::Tar));
    }

    #[test]
    fn extensions() {
        assert_eq!(
            Format::from_extension(Utf8Path::new("a/b/Thing.ZIP")),
            Some(Format::Zip)
        );
        assert_eq!(
            Format::from_extension(Utf8Path::new("x.tgz")),
            Some(Format::Gzip)
        );
        assert_eq!(Format::from_extension(Utf8Path::new("notes.txt")), None);
        assert_eq!(Format::from_extension(Utf8Path::new("zip")), None);
    }

    #[test]
    fn signature_beats_extension() {
        let mut gzip = Cursor::new(vec![0x1F, 0x8B, 8, 0]);
        assert_eq!(
            detect(&mut gzip, Some(Utf8Path::new("lies.zip"))),
            Some(Format::Gzip)
        );
        // And we rewound.
        assert_eq!(gzip.position(), 0);
    }

    #[test]
    fn empty_stream_falls_back_to_extension() {
        let mut empty = Cursor::new(Vec::new());
        assert_eq!(
            detect(&mut empty, Some(Utf8Path::new("new.zip"))),
            Some(Format::Zip)
        );
        assert_eq!(detect(&mut empty, None), None);

        let mut text = Cursor::new(b"just some text".to_vec());
        assert_eq!(detect(&mut text, None), None);
    }
}
