//! How entry data gets (de)compressed.
//!
//! The ZIP container code is the same for every backing;
//! what differs is which compression methods a backing can produce and read.

use std::io::{self, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::access::Encoder;
use crate::entry::{CompressionLevel, CompressionMethod};
use crate::registry::Implementation;
use crate::result::*;

/// The compression half of a ZIP backing.
pub trait Codec: 'static {
    /// Which registry slot this codec's backing fills.
    const IMPLEMENTATION: Implementation;

    /// True if this codec ever compresses data.
    const COMPRESSES: bool;

    /// The method used to store entries created at the given level.
    fn method_for(level: CompressionLevel) -> CompressionMethod;

    /// Returns an encoder for an entry created at the given level.
    fn encoder(level: CompressionLevel) -> Box<dyn Encoder>;

    /// Returns a reader that decompresses `compressed`.
    fn decoder<'a>(
        method: CompressionMethod,
        compressed: &'a [u8],
    ) -> ArchiveResult<Box<dyn Read + 'a>>;
}

/// Copies bytes straight through.
struct StoreEncoder(Vec<u8>);

impl Write for StoreEncoder {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Encoder for StoreEncoder {
    fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
        Ok(self.0)
    }
}

impl Encoder for DeflateEncoder<Vec<u8>> {
    fn finish(self: Box<Self>) -> io::Result<Vec<u8>> {
        DeflateEncoder::finish(*self)
    }
}

fn unsupported(method: CompressionMethod) -> ArchiveError {
    ArchiveError::UnsupportedArchive(format!("Compression method {method:?} not supported"))
}

/// DEFLATE via [`flate2`].
///
/// This is the default backing for ZIP archives, and the only one that
/// compresses.
#[derive(Debug)]
pub struct Deflate;

impl Codec for Deflate {
    const IMPLEMENTATION: Implementation = Implementation::ThirdPartyLibrary;
    const COMPRESSES: bool = true;

    fn method_for(level: CompressionLevel) -> CompressionMethod {
        match level {
            CompressionLevel::Maximum | CompressionLevel::Fastest => CompressionMethod::Deflate,
            CompressionLevel::NoCompression => CompressionMethod::None,
        }
    }

    fn encoder(level: CompressionLevel) -> Box<dyn Encoder> {
        let compression = match level {
            CompressionLevel::Maximum => Compression::best(),
            CompressionLevel::Fastest => Compression::fast(),
            CompressionLevel::NoCompression => return Box::new(StoreEncoder(Vec::new())),
        };
        Box::new(DeflateEncoder::new(Vec::new(), compression))
    }

    fn decoder<'a>(
        method: CompressionMethod,
        compressed: &'a [u8],
    ) -> ArchiveResult<Box<dyn Read + 'a>> {
        match method {
            CompressionMethod::None => Ok(Box::new(compressed)),
            CompressionMethod::Deflate => Ok(Box::new(DeflateDecoder::new(compressed))),
            other => Err(unsupported(other)),
        }
    }
}

/// Stores everything uncompressed, and only reads stored entries.
///
/// Useful where pulling in a compression library isn't an option,
/// or for archives whose entries are already compressed (images, etc.).
#[derive(Debug)]
pub struct Stored;

impl Codec for Stored {
    const IMPLEMENTATION: Implementation = Implementation::Other;
    const COMPRESSES: bool = false;

    fn method_for(_level: CompressionLevel) -> CompressionMethod {
        CompressionMethod::None
    }

    fn encoder(_level: CompressionLevel) -> Box<dyn Encoder> {
        Box::new(StoreEncoder(Vec::new()))
    }

    fn decoder<'a>(
        method: CompressionMethod,
        compressed: &'a [u8],
    ) -> ArchiveResult<Box<dyn Read + 'a>> {
        match method {
            CompressionMethod::None => Ok(Box::new(compressed)),
            other => Err(unsupported(other)),
        }
    }
}
