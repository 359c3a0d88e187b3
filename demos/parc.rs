use std::fs::{self, File};
use std::io;

use anyhow::*;
use camino::Utf8PathBuf;
use log::*;
use structopt::*;

use parc::*;

#[derive(Debug, StructOpt)]
#[structopt(name = "parc", about = "Lists, extracts, and edits archives")]
struct Opt {
    /// Pass multiple times for additional verbosity (info, debug, trace)
    #[structopt(short, long, parse(from_occurrences))]
    verbosity: usize,

    /// Which backing to use: default, any, native, third-party, or other
    #[structopt(short, long, default_value = "default", parse(try_from_str = parse_implementation))]
    implementation: Implementation,

    #[structopt(name("archive"))]
    archive_path: Utf8PathBuf,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Lists the archive's entries
    List,
    /// Extracts every entry into the given directory
    Extract {
        #[structopt(default_value = ".")]
        directory: Utf8PathBuf,
    },
    /// Adds files to the archive (creating it if needed)
    Add {
        /// Store files without compressing them
        #[structopt(long)]
        store: bool,

        files: Vec<Utf8PathBuf>,
    },
    /// Deletes entries from the archive
    Delete { names: Vec<String> },
}

fn parse_implementation(s: &str) -> Result<Implementation> {
    Ok(match s {
        "default" => Implementation::Default,
        "any" => Implementation::Any,
        "native" => Implementation::Native,
        "third-party" => Implementation::ThirdPartyLibrary,
        "other" => Implementation::Other,
        "none" => Implementation::None,
        wut => bail!("Unknown implementation {}", wut),
    })
}

fn main() -> Result<()> {
    let args = Opt::from_args();

    let mut errlog = stderrlog::new();
    errlog.verbosity(args.verbosity + 1);
    errlog.init()?;

    let mode = match args.command {
        Command::List | Command::Extract { .. } => AccessMode::Read,
        Command::Add { .. } | Command::Delete { .. } => AccessMode::Update,
    };

    let mut archive = Registry::global()
        .open_location(&FileSystemStorage, &args.archive_path, mode, args.implementation)
        .with_context(|| format!("Couldn't open {}", args.archive_path))?;
    info!(
        "Opened {} as {:?} with {:?} backing",
        args.archive_path,
        archive.format(),
        archive.implementation()
    );

    match args.command {
        Command::List => list(&*archive)?,
        Command::Extract { directory } => extract(&mut *archive, &directory)?,
        Command::Add { store, files } => add(&mut *archive, store, &files)?,
        Command::Delete { names } => {
            for name in &names {
                if !archive.delete_entry(name)? {
                    warn!("No entry named {}", name);
                }
            }
        }
    }

    archive
        .close()
        .with_context(|| format!("Couldn't save {}", args.archive_path))
}

fn list(archive: &dyn ArchiveAccess) -> Result<()> {
    for entry in archive.entries()? {
        println!(
            "{:>10} {:>10} {} {}",
            entry.length,
            entry.compressed_length,
            entry.last_modified.format("%Y-%m-%d %H:%M"),
            entry.name
        );
    }
    Ok(())
}

fn extract(archive: &mut dyn ArchiveAccess, directory: &Utf8PathBuf) -> Result<()> {
    let entries: Vec<Entry> = archive.entries()?.collect();
    for entry in entries {
        // Archive names are normalized on open, so they stay under `directory`.
        let path = directory.join(&entry.name);
        if entry.is_dir() {
            fs::create_dir_all(&path)
                .with_context(|| format!("Couldn't create directory {}", path))?;
            continue;
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Couldn't create directory {}", parent))?;
        }
        let mut reader = archive.open_entry_as(&entry, Direction::Read)?;
        let mut sink =
            File::create(&path).with_context(|| format!("Couldn't create file {}", path))?;
        io::copy(&mut reader, &mut sink).with_context(|| format!("Couldn't extract {}", path))?;
        debug!("Extracted {}", path);
    }
    Ok(())
}

fn add(archive: &mut dyn ArchiveAccess, store: bool, files: &[Utf8PathBuf]) -> Result<()> {
    let level = if store {
        CompressionLevel::NoCompression
    } else {
        CompressionLevel::Maximum
    };
    for file in files {
        // Writing to an existing entry replaces it.
        let entry = match archive.find_entry(file.as_str())? {
            Some(existing) => existing,
            None => archive.create_entry_with(file.as_str(), level)?,
        };
        let mut source = File::open(file).with_context(|| format!("Couldn't open {}", file))?;
        let mut stream = archive.open_entry_as(&entry, Direction::Write)?;
        io::copy(&mut source, &mut stream)?;
        stream.finish()?;
        debug!("Added {}", file);
    }
    Ok(())
}
