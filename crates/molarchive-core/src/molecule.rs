//! Molecule records.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::error::{ArchiveError, ArchiveResult};
use crate::protocol::{FieldRegistry, FieldValue, Protocol, Value};
use crate::record::{fields, generate_uid, ArchiveRecord, RecordCore, RecordKind};
use crate::table::{DataTable, SegmentKey};

/// One molecule: a trace table plus derived segment tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Molecule {
    /// Shared record fields.
    pub core: RecordCore,
    /// UID of the metadata record this molecule was extracted from.
    pub metadata_uid: String,
    /// Acquisition channel, if known.
    pub channel: Option<i32>,
    /// Image (field of view) number, if known.
    pub image: Option<i32>,
    /// Segment tables keyed by the column pair they were fit on.
    pub segment_tables: BTreeMap<SegmentKey, DataTable>,
}

impl Molecule {
    /// Creates an empty molecule with the given UID.
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            core: RecordCore::with_uid(uid),
            ..Self::default()
        }
    }

    /// Creates an empty molecule with a fresh UID.
    pub fn with_random_uid() -> Self {
        Self::new(generate_uid())
    }

    /// Builder: sets the metadata reference.
    pub fn with_metadata_uid(mut self, uid: &str) -> Self {
        self.metadata_uid = uid.to_string();
        self
    }

    /// Returns the segment table fit on `(x_column, y_column)`.
    pub fn segment_table(&self, x_column: &str, y_column: &str) -> Option<&DataTable> {
        self.segment_tables.get(&SegmentKey::new(x_column, y_column))
    }

    /// Stores a segment table, replacing any existing one for the pair.
    pub fn put_segment_table(&mut self, x_column: &str, y_column: &str, table: DataTable) {
        self.segment_tables
            .insert(SegmentKey::new(x_column, y_column), table);
    }

    /// Removes a segment table.
    pub fn remove_segment_table(&mut self, x_column: &str, y_column: &str) -> Option<DataTable> {
        self.segment_tables
            .remove(&SegmentKey::new(x_column, y_column))
    }
}

impl ArchiveRecord for Molecule {
    const KIND: RecordKind = RecordKind::Molecule;

    fn core(&self) -> &RecordCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut RecordCore {
        &mut self.core
    }
}

fn write_metadata_uid(m: &Molecule) -> Option<FieldValue<'_>> {
    (!m.metadata_uid.is_empty()).then_some(FieldValue::Str(&m.metadata_uid))
}

fn read_metadata_uid(m: &mut Molecule, v: Value) -> ArchiveResult<()> {
    m.metadata_uid = v.into_string("MetadataUID")?;
    Ok(())
}

fn write_channel(m: &Molecule) -> Option<FieldValue<'_>> {
    m.channel.map(|c| FieldValue::Int(i64::from(c)))
}

fn read_channel(m: &mut Molecule, v: Value) -> ArchiveResult<()> {
    m.channel = Some(v.to_i32("Channel")?);
    Ok(())
}

fn write_image(m: &Molecule) -> Option<FieldValue<'_>> {
    m.image.map(|i| FieldValue::Int(i64::from(i)))
}

fn read_image(m: &mut Molecule, v: Value) -> ArchiveResult<()> {
    m.image = Some(v.to_i32("Image")?);
    Ok(())
}

fn write_segment_tables(m: &Molecule) -> Option<FieldValue<'_>> {
    if m.segment_tables.is_empty() {
        return None;
    }
    let entries = m
        .segment_tables
        .iter()
        .map(|(key, table)| {
            FieldValue::Object(vec![
                ("xColumn", FieldValue::Str(&key.x_column)),
                ("yColumn", FieldValue::Str(&key.y_column)),
                ("Table", table.to_field()),
            ])
        })
        .collect();
    Some(FieldValue::List(entries))
}

fn read_segment_tables(m: &mut Molecule, v: Value) -> ArchiveResult<()> {
    const FIELD: &str = "SegmentTables";
    let mut tables = BTreeMap::new();
    for entry in v.into_array(FIELD)? {
        let mut entry_fields = entry.into_object(FIELD)?;
        let key = SegmentKey::from_fields(FIELD, &mut entry_fields)?;
        let table = entry_fields
            .into_iter()
            .find(|(k, _)| k == "Table")
            .map(|(_, v)| DataTable::from_value(FIELD, v))
            .transpose()?
            .ok_or_else(|| ArchiveError::field(FIELD, "segment entry without Table"))?;
        tables.insert(key, table);
    }
    m.segment_tables = tables;
    Ok(())
}

static MOLECULE_FIELDS: LazyLock<FieldRegistry<Molecule>> = LazyLock::new(|| {
    let registry = fields::leading(FieldRegistry::new())
        .field("MetadataUID", write_metadata_uid, read_metadata_uid)
        .alias("ImageMetadataUID", "MetadataUID")
        .field("Channel", write_channel, read_channel)
        .field("Image", write_image, read_image);
    fields::table(registry).field("SegmentTables", write_segment_tables, read_segment_tables)
});

impl Protocol for Molecule {
    const NAME: &'static str = "molecule";

    fn registry() -> &'static FieldRegistry<Self> {
        &MOLECULE_FIELDS
    }
}
