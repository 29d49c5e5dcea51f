//! Archive type tags.
//!
//! The type of an archive is persisted as a string in its properties and
//! resolved against an explicit registry on load.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};

/// Kind of archive; decides how downstream tools interpret its molecules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ArchiveKind {
    /// Generic single-molecule traces.
    #[default]
    SingleMolecule,
    /// Archaeal helicase / motor traces.
    Arch,
    /// DNA molecules.
    Dna,
}

impl ArchiveKind {
    /// Every kind.
    pub const ALL: [ArchiveKind; 3] = [ArchiveKind::SingleMolecule, ArchiveKind::Arch, ArchiveKind::Dna];

    /// Canonical tag written to properties.
    pub fn name(self) -> &'static str {
        match self {
            ArchiveKind::SingleMolecule => "SingleMoleculeArchive",
            ArchiveKind::Arch => "ArchMoleculeArchive",
            ArchiveKind::Dna => "DnaMoleculeArchive",
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            ArchiveKind::SingleMolecule => "single",
            ArchiveKind::Arch => "arch",
            ArchiveKind::Dna => "dna",
        }
    }
}

impl fmt::Display for ArchiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Maps type tags (canonical names and aliases) to [`ArchiveKind`].
#[derive(Debug, Clone)]
pub struct ArchiveTypeRegistry {
    names: HashMap<String, ArchiveKind>,
}

impl ArchiveTypeRegistry {
    /// Registry with the canonical names and their short aliases.
    pub fn standard() -> Self {
        let mut registry = Self {
            names: HashMap::new(),
        };
        for kind in ArchiveKind::ALL {
            registry.register(kind.name(), kind);
            registry.register(kind.short_name(), kind);
        }
        registry
    }

    /// Adds (or overrides) an alias.
    pub fn register(&mut self, alias: &str, kind: ArchiveKind) {
        self.names.insert(alias.to_ascii_lowercase(), kind);
    }

    /// Resolves a tag. Qualified tags (`a.b.Name`) resolve by their last
    /// segment when the full tag is not registered.
    pub fn resolve(&self, tag: &str) -> ArchiveResult<ArchiveKind> {
        let key = tag.trim().to_ascii_lowercase();
        let found = self.names.get(&key).copied().or_else(|| {
            key.rsplit_once('.')
                .and_then(|(_, last)| self.names.get(last).copied())
        });
        match found {
            Some(kind) => {
                debug!(tag, kind = %kind, "resolved archive type");
                Ok(kind)
            }
            None => Err(ArchiveError::UnknownArchiveType {
                name: tag.to_string(),
            }),
        }
    }

    /// Number of registered tags.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl Default for ArchiveTypeRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
