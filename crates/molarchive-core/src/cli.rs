//! `molarc` command line.

use crate::archive::MoleculeArchive;
use crate::config::ArchiveConfig;
use crate::encoding::Encoding;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use molarchive_kv::{FsStore, KvStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "molarc")]
#[command(about = "Molecule archive maintenance tool", long_about = None)]
pub struct Cli {
    /// Engine configuration (TOML or JSON).
    #[arg(short, long, global = true, env = "MOLARC_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print counts, type and property unions of an archive.
    Info {
        /// Archive file or virtual store directory.
        archive: PathBuf,
    },
    /// Rebuild the index and properties of a virtual store.
    RebuildIndex {
        /// Virtual store directory.
        store: PathBuf,
    },
    /// Write an archive as a single file.
    Export {
        /// Archive file or virtual store directory.
        archive: PathBuf,
        /// Destination file.
        dest: PathBuf,
        /// Write JSON instead of the binary encoding.
        #[arg(long)]
        text: bool,
    },
    /// Write an archive as a new virtual store directory.
    ExportVirtual {
        /// Archive file or virtual store directory.
        archive: PathBuf,
        /// Destination directory; must not hold an archive.
        dest: PathBuf,
        /// Write JSON instead of the binary encoding.
        #[arg(long)]
        text: bool,
    },
}

fn encoding_flag(text: bool) -> Encoding {
    if text {
        Encoding::Text
    } else {
        Encoding::Binary
    }
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let config = self.load_config()?;
        match self.command {
            Command::Info { ref archive } => info(&open_any(archive, config)?),
            Command::RebuildIndex { ref store } => rebuild_index(store, config),
            Command::Export {
                ref archive,
                ref dest,
                text,
            } => {
                let archive = open_any(archive, config)?;
                archive
                    .save_as(dest, encoding_flag(text))
                    .with_context(|| format!("writing {}", dest.display()))?;
                println!("Wrote {} molecules to {}", archive.number_of_molecules(), dest.display());
                Ok(())
            }
            Command::ExportVirtual {
                ref archive,
                ref dest,
                text,
            } => {
                let archive = open_any(archive, config)?;
                let store: Arc<dyn KvStore> = Arc::new(FsStore::create(dest)?);
                let report = archive.save_as_virtual_store(store, encoding_flag(text))?;
                println!(
                    "Exported {} molecules, {} metadata ({} failed) to {}",
                    report.molecules,
                    report.metadata,
                    report.failed,
                    dest.display()
                );
                Ok(())
            }
        }
    }

    fn load_config(&self) -> Result<ArchiveConfig> {
        match &self.config {
            Some(path) => ArchiveConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display())),
            None => Ok(ArchiveConfig::default()),
        }
    }
}

fn open_any(path: &Path, config: ArchiveConfig) -> Result<MoleculeArchive> {
    let archive = if path.is_dir() {
        let store: Arc<dyn KvStore> = Arc::new(FsStore::open(path)?);
        MoleculeArchive::open_virtual(store, config)
    } else {
        MoleculeArchive::open_file(path, config)
    };
    archive.with_context(|| format!("opening {}", path.display()))
}

fn rebuild_index(path: &Path, config: ArchiveConfig) -> Result<()> {
    if !path.is_dir() {
        anyhow::bail!("{} is not a virtual store directory", path.display());
    }
    let config = ArchiveConfig {
        index_on_open: false,
        ..config
    };
    let archive = open_any(path, config)?;
    let report = archive.rebuild_indexes()?;
    println!(
        "Indexed {} molecules, {} metadata ({} failed)",
        report.molecules, report.metadata, report.failed
    );
    Ok(())
}

fn info(archive: &MoleculeArchive) -> Result<()> {
    let props = archive.properties();
    println!("Archive: {}", archive.name());
    println!("Type: {}", archive.archive_type().name());
    println!("Mode: {:?}", archive.mode());
    println!("Encoding: {}", archive.encoding());
    println!("Molecules: {}", archive.number_of_molecules());
    println!("Metadata: {}", archive.number_of_metadata());
    println!("Tags: {}", props.tags().join(", "));
    println!("Parameters: {}", props.parameters().join(", "));
    println!("Columns: {}", props.columns().join(", "));
    let channels: Vec<String> = props.channels().iter().map(i32::to_string).collect();
    println!("Channels: {}", channels.join(", "));
    let comments = props.comments();
    if !comments.is_empty() {
        println!("\n{comments}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_export() {
        let cli = Cli::parse_from(["molarc", "export", "in.sml", "out.json", "--text", "--config", "c.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("c.toml")));
        match cli.command {
            Command::Export { dest, text, .. } => {
                assert_eq!(dest, PathBuf::from("out.json"));
                assert!(text);
            }
            _ => panic!("expected export"),
        }
    }

    #[test]
    fn test_export_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let src = dir.path().join("src.json");
        let archive = MoleculeArchive::new_in_memory("src", crate::kind::ArchiveKind::SingleMolecule);
        archive.put_molecule(crate::molecule::Molecule::new("m1")).unwrap();
        archive.save_as(&src, Encoding::Text).unwrap();

        let virt = dir.path().join("virt");
        Cli::parse_from(["molarc", "export-virtual", src.to_str().unwrap(), virt.to_str().unwrap()])
            .run()
            .unwrap();
        assert!(virt.join("Molecules/m1.sml").is_file());

        Cli::parse_from(["molarc", "rebuild-index", virt.to_str().unwrap()])
            .run()
            .unwrap();
        let out = dir.path().join("out.sml");
        Cli::parse_from(["molarc", "export", virt.to_str().unwrap(), out.to_str().unwrap()])
            .run()
            .unwrap();
        let back = MoleculeArchive::open_file(&out, ArchiveConfig::default()).unwrap();
        assert_eq!(back.molecule_uids(), vec!["m1"]);
    }
}
