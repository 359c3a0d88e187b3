//! parc opens archives through one uniform handle,
//! whichever backing implementation does the work:
//!
//! ```no_run
//! # use std::io;
//! # use camino::Utf8Path;
//! # use parc::*;
//! let storage = FileSystemStorage;
//! let mut archive = Registry::global().open_location(
//!     &storage,
//!     Utf8Path::new("foo.zip"),
//!     AccessMode::Read,
//!     Implementation::Default,
//! )?;
//!
//! // Entries are snapshots; collect them so we can borrow the archive again.
//! let entries: Vec<Entry> = archive.entries()?.collect();
//! for entry in entries.iter().filter(|e| e.is_file()) {
//!     let mut reader = archive.open_entry(entry)?;
//!     io::copy(&mut reader, &mut io::sink())?;
//! }
//! archive.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Writing works the same way. Changes are kept in memory and written out
//! in one go when the handle is closed (or dropped):
//! ```no_run
//! # use std::io::Write;
//! # use camino::Utf8Path;
//! # use parc::*;
//! let mut archive = Registry::global().open_location(
//!     &FileSystemStorage,
//!     Utf8Path::new("foo.zip"),
//!     AccessMode::Update,
//!     Implementation::Default,
//! )?;
//! archive.delete_entry("stale.txt")?;
//! let entry = archive.create_entry("fresh.txt")?;
//! archive.open_entry(&entry)?.write_all(b"Hello, world!")?;
//! archive.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Which backing opens an archive is up to the [`Registry`].
//! Out of the box, ZIP archives go to a DEFLATE backing built on
//! [`flate2`](https://docs.rs/flate2), with a store-only backing as a fallback.
//! Programs can register their own backings (or turn archive access off
//! entirely) once at startup with [`Registry::install()`].

pub mod access;
pub mod detect;
pub mod entry;
pub mod registry;
pub mod result;
pub mod storage;
pub mod zip;

pub use access::{AccessMode, ArchiveAccess, ByteStream, Direction, EntryStream, ReadOnly};
pub use detect::Format;
pub use entry::{CompressionLevel, CompressionMethod, Entry};
pub use registry::{Backing, Implementation, Registry};
pub use result::{ArchiveError, ArchiveResult};
pub use storage::{FileSystemStorage, Storage};
pub use zip::ZipArchive;

mod arch;
