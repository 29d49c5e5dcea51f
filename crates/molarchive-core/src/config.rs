//! Engine configuration, loaded from TOML or JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::path::Path;

use crate::encoding::Encoding;
use crate::error::{ArchiveError, ArchiveResult};
use crate::kind::ArchiveTypeRegistry;

/// Archive engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Encoding for newly created archives and exports.
    pub encoding: Encoding,
    /// Bulk worker pool size; `None` uses every available CPU.
    pub worker_threads: Option<usize>,
    /// Rebuild the index when a virtual store has no index file.
    pub index_on_open: bool,
    /// Extra archive type aliases, mapped to a registered tag.
    pub archive_type_aliases: BTreeMap<String, String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::Binary,
            worker_threads: None,
            index_on_open: true,
            archive_type_aliases: BTreeMap::new(),
        }
    }
}

impl ArchiveConfig {
    /// Loads a config file; the format follows the extension.
    pub fn from_file(path: &Path) -> ArchiveResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ArchiveError::Config(e.to_string())),
            "json" => {
                let config: ArchiveConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => Err(ArchiveError::Config(format!(
                "Unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Worker count for bulk operations.
    pub fn workers(&self) -> usize {
        match self.worker_threads {
            Some(n) if n > 0 => n,
            _ => std::thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(1),
        }
    }

    /// Standard type registry extended with the configured aliases.
    pub fn type_registry(&self) -> ArchiveResult<ArchiveTypeRegistry> {
        let mut registry = ArchiveTypeRegistry::standard();
        for (alias, target) in &self.archive_type_aliases {
            let kind = registry.resolve(target)?;
            registry.register(alias, kind);
        }
        Ok(registry)
    }
}
