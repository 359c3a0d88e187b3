//! Checks decompressed entry data against what the central directory promised.
//!
//! The CRC half is borrowed from zip-rs:
//! <https://github.com/mvdnes/zip-rs/commit/b3c836d9c32efa120cdd5366280f940d3c3b985c>

use std::io::{self, Read};

use crc32fast::Hasher;

/// Wraps an entry's decoder and fails at EOF if the data came out wrong.
pub struct VerifyingReader<R> {
    inner: R,
    hasher: Hasher,
    expected_crc32: u32,
    expected_length: u64,
    seen: u64,
}

impl<R> VerifyingReader<R> {
    pub fn new(inner: R, expected_crc32: u32, expected_length: u64) -> Self {
        Self {
            inner,
            hasher: Hasher::new(),
            expected_crc32,
            expected_length,
            seen: 0,
        }
    }

    fn verify(&self) -> io::Result<()> {
        if self.seen != self.expected_length {
            return Err(invalid(format!(
                "Invalid length: expected {} bytes, got {}",
                self.expected_length, self.seen
            )));
        }
        let actual = self.hasher.clone().finalize();
        if actual != self.expected_crc32 {
            return Err(invalid(format!(
                "Invalid checksum: expected {:08x}, got {:08x}",
                self.expected_crc32, actual
            )));
        }
        Ok(())
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = self.inner.read(buf)?;
        // A zero-length read of an empty buffer says nothing about EOF.
        if count == 0 && !buf.is_empty() {
            self.verify()?;
        }
        self.hasher.update(&buf[..count]);
        self.seen += count as u64;
        Ok(count)
    }
}
