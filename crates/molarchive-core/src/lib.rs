#![warn(missing_docs)]

//! molarchive core: molecule and metadata records, the field serialization
//! protocol, archive index and properties, and the archive orchestrator
//! over in-memory or virtual (key-value) storage.

pub mod archive;
#[allow(missing_docs)]
pub mod cli;
pub mod config;
pub mod encoding;
pub mod error;
pub mod index;
pub mod kind;
pub mod layout;
pub mod metadata;
pub mod molecule;
pub mod properties;
pub mod protocol;
pub mod record;
pub mod table;

pub use archive::{BulkReport, MoleculeArchive, StorageMode, WindowGuard, WindowLock};
pub use config::ArchiveConfig;
pub use encoding::Encoding;
pub use error::{ArchiveError, ArchiveResult};
pub use index::{ArchiveIndex, IndexSnapshot};
pub use kind::{ArchiveKind, ArchiveTypeRegistry};
pub use layout::VirtualLayout;
pub use metadata::Metadata;
pub use molecule::Molecule;
pub use properties::{ArchiveProperties, PropertiesSnapshot};
pub use record::{ArchiveRecord, Parameters, RecordCore, RecordKind, TagSet};
pub use table::{DataTable, SegmentKey};
