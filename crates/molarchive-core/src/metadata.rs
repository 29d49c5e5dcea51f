//! Image metadata records.

use std::sync::LazyLock;

use crate::error::ArchiveResult;
use crate::protocol::{FieldRegistry, FieldValue, Protocol, Value};
use crate::record::{fields, generate_uid, ArchiveRecord, RecordCore, RecordKind};

/// Acquisition metadata shared by the molecules of one image stack.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    /// Shared record fields.
    pub core: RecordCore,
    /// Microscope name.
    pub microscope: String,
    /// Directory the images were read from.
    pub source_directory: String,
    /// Collection date as recorded by the acquisition software.
    pub collection_date: String,
    /// Processing log.
    pub log: String,
}

impl Metadata {
    /// Creates an empty record with the given UID.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            core: RecordCore::with_uid(uid),
            ..Self::default()
        }
    }

    /// Creates an empty record with a fresh UID.
    pub fn with_random_uid() -> Self {
        Self::new(generate_uid())
    }

    /// Appends a line to the log.
    pub fn log_line(&mut self, line: &str) {
        if !self.log.is_empty() && !self.log.ends_with('\n') {
            self.log.push('\n');
        }
        self.log.push_str(line);
    }
}

impl ArchiveRecord for Metadata {
    const KIND: RecordKind = RecordKind::Metadata;

    fn core(&self) -> &RecordCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RecordCore {
        &mut self.core
    }
}

fn text(value: &str) -> Option<FieldValue<'_>> {
    (!value.is_empty()).then_some(FieldValue::Str(value))
}

fn write_microscope(m: &Metadata) -> Option<FieldValue<'_>> {
    text(&m.microscope)
}

fn read_microscope(m: &mut Metadata, v: Value) -> ArchiveResult<()> {
    m.microscope = v.into_string("Microscope")?;
    Ok(())
}

fn write_source_directory(m: &Metadata) -> Option<FieldValue<'_>> {
    text(&m.source_directory)
}

fn read_source_directory(m: &mut Metadata, v: Value) -> ArchiveResult<()> {
    m.source_directory = v.into_string("SourceDirectory")?;
    Ok(())
}

fn write_collection_date(m: &Metadata) -> Option<FieldValue<'_>> {
    text(&m.collection_date)
}

fn read_collection_date(m: &mut Metadata, v: Value) -> ArchiveResult<()> {
    m.collection_date = v.into_string("CollectionDate")?;
    Ok(())
}

fn write_log(m: &Metadata) -> Option<FieldValue<'_>> {
    text(&m.log)
}

fn read_log(m: &mut Metadata, v: Value) -> ArchiveResult<()> {
    m.log = v.into_string("Log")?;
    Ok(())
}

static METADATA_FIELDS: LazyLock<FieldRegistry<Metadata>> = LazyLock::new(|| {
    let registry = fields::leading(FieldRegistry::new())
        .field("Microscope", write_microscope, read_microscope)
        .field("SourceDirectory", write_source_directory, read_source_directory)
        .field("CollectionDate", write_collection_date, read_collection_date)
        .alias("CollectionTime", "CollectionDate");
    fields::table(registry)
        .field("Log", write_log, read_log)
        .alias("log", "Log")
});

impl Protocol for Metadata {
    const NAME: &'static str = "metadata";

    fn registry() -> &'static FieldRegistry<Self> {
        &METADATA_FIELDS
    }
}
