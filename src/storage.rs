//! Plain storage, for callers that don't care if a location is an archive.

use std::fs::{self, File, OpenOptions};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use log::*;

use crate::access::{AccessMode, ByteStream, ReadOnly};
use crate::result::*;

/// Somewhere byte streams live, addressed by location.
pub trait Storage {
    /// Opens the location as a stream suitable for `mode`.
    fn open(&self, location: &Utf8Path, mode: AccessMode) -> ArchiveResult<Box<dyn ByteStream>>;

    fn exists(&self, location: &Utf8Path) -> bool;

    /// The size of what's at the location, in bytes.
    fn size(&self, location: &Utf8Path) -> ArchiveResult<u64>;

    fn last_write_time_utc(&self, location: &Utf8Path) -> ArchiveResult<DateTime<Utc>>;

    /// True if the location names something that holds other things,
    /// like a directory.
    fn is_location_a_container(&self, location: &Utf8Path) -> bool;
}

/// [`Storage`] backed by the local file system
#[derive(Debug, Default, Copy, Clone)]
pub struct FileSystemStorage;

impl Storage for FileSystemStorage {
    fn open(&self, location: &Utf8Path, mode: AccessMode) -> ArchiveResult<Box<dyn ByteStream>> {
        debug!("Opening {} for {:?}", location, mode);
        Ok(match mode {
            AccessMode::Read => Box::new(ReadOnly(File::open(location)?)),
            AccessMode::Write => Box::new(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(location)?,
            ),
            AccessMode::Update => Box::new(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(location)?,
            ),
        })
    }

    fn exists(&self, location: &Utf8Path) -> bool {
        location.exists()
    }

    fn size(&self, location: &Utf8Path) -> ArchiveResult<u64> {
        Ok(fs::metadata(location)?.len())
    }

    fn last_write_time_utc(&self, location: &Utf8Path) -> ArchiveResult<DateTime<Utc>> {
        Ok(fs::metadata(location)?.modified()?.into())
    }

    fn is_location_a_container(&self, location: &Utf8Path) -> bool {
        location.as_str().ends_with(['/', '\\']) || location.is_dir()
    }
}
