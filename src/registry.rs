//! Which backing implementation handles which format.
//!
//! A [`Registry`] maps each [`Format`] to the backings that can open it,
//! keyed by [`Backing`].
//! Most programs just use the process-wide one from [`Registry::global()`],
//! optionally configuring it once at startup with [`Registry::install()`].

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Seek};
use std::sync::OnceLock;

use camino::Utf8Path;
use log::*;

use crate::access::{AccessMode, ArchiveAccess, ByteStream};
use crate::detect::{self, Format};
use crate::result::*;
use crate::storage::Storage;
use crate::zip::{self, Deflate, Stored};

/// Which backing implementation to use for a format
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Implementation {
    /// Archive access is disabled.
    None,
    /// A backing written specifically for this crate's platform.
    Native,
    /// A backing built on a third-party compression library.
    ThirdPartyLibrary,
    /// Some other backing.
    Other,
    /// Whatever the registry's default is for the format.
    Default,
    /// Try each backing in turn, in the order
    /// [`Native`](Implementation::Native),
    /// [`ThirdPartyLibrary`](Implementation::ThirdPartyLibrary),
    /// [`Other`](Implementation::Other).
    Any,
}

impl Implementation {
    /// The backing this names, or `None` for the variants
    /// that are a policy for picking one.
    pub fn backing(&self) -> Option<Backing> {
        match self {
            Implementation::Native => Some(Backing::Native),
            Implementation::ThirdPartyLibrary => Some(Backing::ThirdPartyLibrary),
            Implementation::Other => Some(Backing::Other),
            Implementation::None | Implementation::Default | Implementation::Any => None,
        }
    }
}

/// An actual backing a [`Registry`] can hold:
/// the [`Implementation`]s that aren't policies.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Backing {
    Native,
    ThirdPartyLibrary,
    Other,
}

impl From<Backing> for Implementation {
    fn from(backing: Backing) -> Self {
        match backing {
            Backing::Native => Implementation::Native,
            Backing::ThirdPartyLibrary => Implementation::ThirdPartyLibrary,
            Backing::Other => Implementation::Other,
        }
    }
}

/// The order [`Implementation::Any`] tries backings in
const FALLBACK_ORDER: [Backing; 3] = [Backing::Native, Backing::ThirdPartyLibrary, Backing::Other];

fn disabled() -> ArchiveError {
    ArchiveError::UnsupportedOperation("archive access is disabled")
}

/// A backing that couldn't open a stream, and the stream it was given,
/// so something else can have a go at it.
pub struct Rejected<'a> {
    pub error: ArchiveError,
    pub stream: Box<dyn ByteStream + 'a>,
}

impl fmt::Debug for Rejected<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl From<Rejected<'_>> for ArchiveError {
    fn from(rejected: Rejected<'_>) -> Self {
        rejected.error
    }
}

/// Opens an archive of a given format in a stream.
pub type Factory = for<'a> fn(
    Box<dyn ByteStream + 'a>,
    AccessMode,
) -> Result<Box<dyn ArchiveAccess + 'a>, Rejected<'a>>;

/// A table of backing implementations
#[derive(Clone)]
pub struct Registry {
    factories: HashMap<(Format, Backing), Factory>,
    defaults: HashMap<Format, Backing>,
    preference: Implementation,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Registry {
    /// A registry with no backings at all.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            defaults: HashMap::new(),
            preference: Implementation::Default,
        }
    }

    /// The built-in backings:
    /// ZIP via DEFLATE (third-party library, the default) and store-only ZIP (other).
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Format::Zip, Backing::ThirdPartyLibrary, zip::open::<Deflate>);
        registry.register(Format::Zip, Backing::Other, zip::open::<Stored>);
        registry.set_default(Format::Zip, Backing::ThirdPartyLibrary);
        registry
    }

    /// Adds (or replaces) the backing for a format.
    pub fn register(&mut self, format: Format, backing: Backing, factory: Factory) -> &mut Self {
        self.factories.insert((format, backing), factory);
        self
    }

    /// Sets which backing [`Implementation::Default`] resolves to for a format.
    pub fn set_default(&mut self, format: Format, backing: Backing) -> &mut Self {
        self.defaults.insert(format, backing);
        self
    }

    /// Sets the preference [`open()`](Registry::open) uses.
    pub fn set_preference(&mut self, preference: Implementation) -> &mut Self {
        self.preference = preference;
        self
    }

    pub fn preference(&self) -> Implementation {
        self.preference
    }

    /// The default backing for a format, if there is one.
    pub fn default_for(&self, format: Format) -> Option<Backing> {
        self.defaults.get(&format).copied()
    }

    /// True if that backing is registered for the format.
    pub fn has(&self, format: Format, backing: Backing) -> bool {
        self.factories.contains_key(&(format, backing))
    }

    /// The process-wide registry.
    ///
    /// Unless something was [installed](Registry::install) first,
    /// this is [`Registry::with_defaults()`].
    pub fn global() -> &'static Registry {
        GLOBAL.get_or_init(Registry::with_defaults)
    }

    /// Makes this the process-wide registry.
    ///
    /// This only works once, and only before anything has used
    /// [`Registry::global()`]. Otherwise the registry is handed back.
    pub fn install(self) -> Result<(), Registry> {
        GLOBAL.set(self)
    }

    /// Opens an archive using this registry's preference.
    ///
    /// The format is detected from the stream's leading bytes,
    /// falling back to `name`'s extension.
    pub fn open<'a>(
        &self,
        stream: Box<dyn ByteStream + 'a>,
        name: Option<&Utf8Path>,
        mode: AccessMode,
    ) -> ArchiveResult<Box<dyn ArchiveAccess + 'a>> {
        self.open_with(stream, name, mode, self.preference)
    }

    /// Opens an archive with a given backing preference.
    pub fn open_with<'a>(
        &self,
        mut stream: Box<dyn ByteStream + 'a>,
        name: Option<&Utf8Path>,
        mode: AccessMode,
        preference: Implementation,
    ) -> ArchiveResult<Box<dyn ArchiveAccess + 'a>> {
        if preference == Implementation::None {
            return Err(disabled());
        }
        let format = self.detect_format(&mut *stream, name, mode)?;
        self.open_format(stream, format, mode, preference)
    }

    /// Opens an archive of a known format.
    pub fn open_format<'a>(
        &self,
        stream: Box<dyn ByteStream + 'a>,
        format: Format,
        mode: AccessMode,
        preference: Implementation,
    ) -> ArchiveResult<Box<dyn ArchiveAccess + 'a>> {
        let unavailable = |implementation| ArchiveError::ImplementationUnavailable {
            format,
            implementation,
        };
        let chosen = match preference {
            Implementation::None => return Err(disabled()),
            Implementation::Any => return self.open_any(stream, format, mode),
            Implementation::Default => self
                .default_for(format)
                .ok_or_else(|| unavailable(Implementation::Default))?,
            Implementation::Native => Backing::Native,
            Implementation::ThirdPartyLibrary => Backing::ThirdPartyLibrary,
            Implementation::Other => Backing::Other,
        };
        let factory = self
            .factories
            .get(&(format, chosen))
            .ok_or_else(|| unavailable(chosen.into()))?;
        debug!("Opening {:?} archive with {:?} backing", format, chosen);
        Ok(factory(stream, mode)?)
    }

    /// Opens a location in `storage`, using its name as the format hint.
    ///
    /// When the location would be created or truncated, its name alone
    /// picks the format, and everything is checked before it's touched.
    pub fn open_location(
        &self,
        storage: &dyn Storage,
        location: &Utf8Path,
        mode: AccessMode,
        preference: Implementation,
    ) -> ArchiveResult<Box<dyn ArchiveAccess + 'static>> {
        let replaces = match mode {
            AccessMode::Read => false,
            AccessMode::Write => true,
            AccessMode::Update => !storage.exists(location),
        };
        if replaces {
            let format = Format::from_extension(location).ok_or(ArchiveError::UnsupportedFormat)?;
            self.ensure_available(format, preference)?;
        }
        let stream = storage.open(location, mode)?;
        self.open_with(stream, Some(location), mode, preference)
    }

    /// Checks that something is registered to open `format` under `preference`.
    fn ensure_available(&self, format: Format, preference: Implementation) -> ArchiveResult<()> {
        let available = match preference {
            Implementation::None => return Err(disabled()),
            Implementation::Any => FALLBACK_ORDER.iter().any(|b| self.has(format, *b)),
            Implementation::Default => self
                .default_for(format)
                .is_some_and(|b| self.has(format, b)),
            concrete => concrete.backing().is_some_and(|b| self.has(format, b)),
        };
        if available {
            Ok(())
        } else {
            Err(ArchiveError::ImplementationUnavailable {
                format,
                implementation: preference,
            })
        }
    }

    fn open_any<'a>(
        &self,
        mut stream: Box<dyn ByteStream + 'a>,
        format: Format,
        mode: AccessMode,
    ) -> ArchiveResult<Box<dyn ArchiveAccess + 'a>> {
        let mut last_error = None;
        for backing in FALLBACK_ORDER {
            let Some(factory) = self.factories.get(&(format, backing)) else {
                continue;
            };
            match factory(stream, mode) {
                Ok(archive) => {
                    debug!("Opened {:?} archive with {:?} backing", format, backing);
                    return Ok(archive);
                }
                Err(rejected) => {
                    debug!(
                        "{:?} backing couldn't open {:?} archive: {}",
                        backing, format, rejected.error
                    );
                    last_error = Some(rejected.error);
                    stream = rejected.stream;
                }
            }
        }
        Err(last_error.unwrap_or(ArchiveError::ImplementationUnavailable {
            format,
            implementation: Implementation::Any,
        }))
    }

    /// Figures out what's in the stream.
    ///
    /// A stream that's empty, or opened in Write mode, has nothing to sniff,
    /// so only its name can tell us.
    fn detect_format<S: Read + Seek + ?Sized>(
        &self,
        stream: &mut S,
        name: Option<&Utf8Path>,
        mode: AccessMode,
    ) -> ArchiveResult<Format> {
        let format = if mode.reads_existing() {
            detect::detect(stream, name)
        } else {
            name.and_then(Format::from_extension)
        };
        match format {
            Some(f) => {
                trace!("Detected {:?} for {:?}", f, name);
                Ok(f)
            }
            None => Err(ArchiveError::UnsupportedFormat),
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut backings: Vec<_> = self.factories.keys().collect();
        backings.sort();
        f.debug_struct("Registry")
            .field("backings", &backings)
            .field("defaults", &self.defaults)
            .field("preference", &self.preference)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::{Cursor, Write};

    use crate::storage::FileSystemStorage;

    fn zip_bytes() -> Vec<u8> {
        let mut buffer = Vec::new();
        let mut archive = Registry::with_defaults()
            .open_format(
                Box::new(Cursor::new(&mut buffer)),
                Format::Zip,
                AccessMode::Write,
                Implementation::Default,
            )
            .unwrap();
        let entry = archive.create_entry("hello.txt").unwrap();
        archive
            .open_entry(&entry)
            .unwrap()
            .write_all(b"Hello, world!")
            .unwrap();
        archive.close().unwrap();
        drop(archive);
        buffer
    }

    #[test]
    fn defaults() {
        let registry = Registry::with_defaults();
        assert_eq!(
            registry.default_for(Format::Zip),
            Some(Backing::ThirdPartyLibrary)
        );
        assert!(registry.has(Format::Zip, Backing::Other));
        assert!(!registry.has(Format::Zip, Backing::Native));
        assert_eq!(registry.preference(), Implementation::Default);
    }

    #[test]
    fn default_resolves_to_third_party() {
        let archive = Registry::with_defaults()
            .open(Box::new(Cursor::new(zip_bytes())), None, AccessMode::Read)
            .unwrap();
        assert_eq!(archive.implementation(), Implementation::ThirdPartyLibrary);
        assert_eq!(archive.format(), Format::Zip);
        assert!(archive.is_compressed());
    }

    #[test]
    fn none_is_refused() {
        let err = Registry::with_defaults()
            .open_with(
                Box::new(Cursor::new(zip_bytes())),
                None,
                AccessMode::Read,
                Implementation::None,
            )
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedOperation(_)));
    }

    #[test]
    fn native_is_unavailable() {
        let err = Registry::with_defaults()
            .open_with(
                Box::new(Cursor::new(zip_bytes())),
                None,
                AccessMode::Read,
                Implementation::Native,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::ImplementationUnavailable {
                format: Format::Zip,
                implementation: Implementation::Native
            }
        ));
    }

    #[test]
    fn any_falls_back() {
        // Deflated data is beyond the store-only backing,
        // but it can still open the archive.
        let mut registry = Registry::empty();
        registry.register(Format::Zip, Backing::Other, zip::open::<Stored>);
        let archive = registry
            .open_with(
                Box::new(Cursor::new(zip_bytes())),
                None,
                AccessMode::Read,
                Implementation::Any,
            )
            .unwrap();
        assert_eq!(archive.implementation(), Implementation::Other);
    }

    fn always_fails<'a>(
        stream: Box<dyn ByteStream + 'a>,
        _mode: AccessMode,
    ) -> Result<Box<dyn ArchiveAccess + 'a>, Rejected<'a>> {
        Err(Rejected {
            error: ArchiveError::UnsupportedArchive("not today".to_owned()),
            stream,
        })
    }

    #[test]
    fn any_passes_the_stream_along() {
        let mut registry = Registry::with_defaults();
        registry.register(Format::Zip, Backing::Native, always_fails);
        let archive = registry
            .open_with(
                Box::new(Cursor::new(zip_bytes())),
                None,
                AccessMode::Read,
                Implementation::Any,
            )
            .unwrap();
        assert_eq!(archive.implementation(), Implementation::ThirdPartyLibrary);
        assert_eq!(archive.entries().unwrap().count(), 1);
    }

    #[test]
    fn any_reports_the_last_failure() {
        let mut registry = Registry::empty();
        registry.register(Format::Zip, Backing::Native, always_fails);
        let err = registry
            .open_with(
                Box::new(Cursor::new(zip_bytes())),
                None,
                AccessMode::Read,
                Implementation::Any,
            )
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedArchive(_)));

        let err = Registry::empty()
            .open_format(
                Box::new(Cursor::new(zip_bytes())),
                Format::Zip,
                AccessMode::Read,
                Implementation::Any,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::ImplementationUnavailable { .. }
        ));
    }

    #[test]
    fn unknown_formats() {
        let err = Registry::with_defaults()
            .open(
                Box::new(Cursor::new(b"Just some text".to_vec())),
                Some(Utf8Path::new("notes.txt")),
                AccessMode::Read,
            )
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedFormat));

        // Recognized, but nothing can open it.
        let err = Registry::with_defaults()
            .open(
                Box::new(Cursor::new(Vec::new())),
                Some(Utf8Path::new("backup.tar")),
                AccessMode::Write,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::ImplementationUnavailable {
                format: Format::Tar,
                implementation: Implementation::Default
            }
        ));
    }

    #[test]
    fn write_mode_uses_the_name() {
        let mut buffer = b"stale contents".to_vec();
        let archive = Registry::with_defaults()
            .open(
                Box::new(Cursor::new(&mut buffer)),
                Some(Utf8Path::new("fresh.zip")),
                AccessMode::Write,
            )
            .unwrap();
        drop(archive);
        assert_eq!(&buffer[..4], b"PK\x05\x06");
        assert_eq!(buffer.len(), 22);
    }

    #[test]
    fn only_backings_can_be_registered() {
        for backing in FALLBACK_ORDER {
            let implementation = Implementation::from(backing);
            assert_eq!(implementation.backing(), Some(backing));
        }
        for policy in [Implementation::None, Implementation::Default, Implementation::Any] {
            assert_eq!(policy.backing(), None);
        }

        let mut registry = Registry::empty();
        registry
            .register(Format::Tar, Backing::Other, always_fails)
            .set_default(Format::Tar, Backing::Other);
        assert_eq!(registry.default_for(Format::Tar), Some(Backing::Other));
        assert!(registry.has(Format::Tar, Backing::Other));
    }

    fn temp_dir() -> (tempfile::TempDir, camino::Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, path)
    }

    #[test]
    fn refused_locations_are_left_untouched() {
        let (_dir, path) = temp_dir();
        let registry = Registry::with_defaults();

        let notes = path.join("notes.txt");
        std::fs::write(&notes, "precious notes").unwrap();
        let err = registry
            .open_location(&FileSystemStorage, &notes, AccessMode::Write, Implementation::Default)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedFormat));
        assert_eq!(std::fs::read_to_string(&notes).unwrap(), "precious notes");

        let backup = path.join("backup.tar");
        std::fs::write(&backup, "tarball").unwrap();
        let err = registry
            .open_location(&FileSystemStorage, &backup, AccessMode::Write, Implementation::Any)
            .unwrap_err();
        assert!(matches!(
            err,
            ArchiveError::ImplementationUnavailable {
                format: Format::Tar,
                implementation: Implementation::Any
            }
        ));
        assert_eq!(std::fs::read_to_string(&backup).unwrap(), "tarball");

        let zipped = path.join("keep.zip");
        std::fs::write(&zipped, "not yet a zip").unwrap();
        let err = registry
            .open_location(&FileSystemStorage, &zipped, AccessMode::Write, Implementation::None)
            .unwrap_err();
        assert!(matches!(err, ArchiveError::UnsupportedOperation(_)));
        assert_eq!(std::fs::read_to_string(&zipped).unwrap(), "not yet a zip");
    }

    #[test]
    fn refused_updates_create_nothing() {
        let (_dir, path) = temp_dir();
        let registry = Registry::with_defaults();

        for name in ["new.tar", "new.txt"] {
            let missing = path.join(name);
            assert!(registry
                .open_location(
                    &FileSystemStorage,
                    &missing,
                    AccessMode::Update,
                    Implementation::Default
                )
                .is_err());
            assert!(!missing.exists(), "{} was created", missing);
        }

        let missing = path.join("new.zip");
        let mut archive = registry
            .open_location(
                &FileSystemStorage,
                &missing,
                AccessMode::Update,
                Implementation::Default,
            )
            .unwrap();
        assert_eq!(archive.entries().unwrap().count(), 0);
        archive.close().unwrap();
        assert!(missing.exists());
    }
}
