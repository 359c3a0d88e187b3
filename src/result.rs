//! Error types and the related `Result<T>`

use thiserror::Error;

use crate::access::AccessMode;
use crate::detect::Format;
use crate::registry::Implementation;

pub type ArchiveResult<T> = Result<T, ArchiveError>;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// An error from underlying I/O
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    /// The stream's signature (and name, if given) matched no known format.
    #[error("Unrecognized archive format")]
    UnsupportedFormat,

    /// No backing implementation is registered for the format,
    /// or the requested one is missing.
    #[error("No {implementation:?} implementation available for {format:?} archives")]
    ImplementationUnavailable {
        format: Format,
        implementation: Implementation,
    },

    /// Archive access was disabled by configuration.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(&'static str),

    /// The handle's access mode forbids the operation.
    #[error("Can't {operation} an archive opened in {mode:?} mode")]
    InvalidMode {
        operation: &'static str,
        mode: AccessMode,
    },

    /// No entry in the archive has the given name
    #[error("No entry in the archive named {0}")]
    EntryNotFound(String),

    /// An entry with the given name already exists
    #[error("Duplicate entry named {0}")]
    DuplicateEntry(String),

    /// A user-provided entry name was empty, absolute, or escaped the archive root.
    #[error("Invalid entry name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// The ZIP archive contained invalid data per APPNOTE.TXT.
    #[error("Corrupt archive: {0}")]
    CorruptArchive(&'static str),

    /// Decoding a UTF-8 name failed
    #[error("Invalid UTF-8")]
    Encoding(#[from] std::str::Utf8Error),

    /// The ZIP archive uses an unsupported feature
    #[error("Unsupported Zip archive: {0}")]
    UnsupportedArchive(String),

    /// A cast from a 64-bit int to a usize failed,
    /// probably on a 32-bit system.
    #[error("Zip archive too large for address space")]
    InsufficientAddressSpace,

    /// Pending changes couldn't be written back when the handle was closed.
    /// The underlying stream was still released.
    #[error("Couldn't commit archive changes")]
    CommitFailure(#[source] Box<ArchiveError>),

    /// The handle was already closed.
    #[error("Archive handle is closed")]
    Closed,
}
