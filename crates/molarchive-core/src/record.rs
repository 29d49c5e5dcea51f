//! State shared by every record type.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::ArchiveResult;
use crate::protocol::{FieldRegistry, FieldValue, Protocol, Value};
use crate::table::{same_double, DataTable};

/// The two kinds of record an archive stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// A single-molecule trace record.
    Molecule,
    /// An image metadata record.
    Metadata,
}

impl RecordKind {
    /// Directory of this kind in a virtual store.
    pub fn directory(self) -> &'static str {
        match self {
            RecordKind::Molecule => "Molecules",
            RecordKind::Metadata => "Metadata",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Molecule => write!(f, "molecule"),
            RecordKind::Metadata => write!(f, "metadata"),
        }
    }
}

/// Set of tags that remembers insertion order for serialization.
///
/// Equality ignores order.
#[derive(Debug, Clone, Default)]
pub struct TagSet(Vec<String>);

impl TagSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tag; returns false if it was already present.
    pub fn insert(&mut self, tag: &str) -> bool {
        if self.contains(tag) {
            return false;
        }
        self.0.push(tag.to_string());
        true
    }

    /// Removes a tag; returns true if it was present.
    pub fn remove(&mut self, tag: &str) -> bool {
        let before = self.0.len();
        self.0.retain(|t| t != tag);
        before != self.0.len()
    }

    /// Membership test.
    pub fn contains(&self, tag: &str) -> bool {
        self.0.iter().any(|t| t == tag)
    }

    /// Tags in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.iter().map(String::as_str)
    }

    /// Tags in insertion order, as a slice.
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for TagSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().all(|t| other.contains(t))
    }
}

impl Eq for TagSet {}

impl<S: AsRef<str>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = TagSet::new();
        for tag in iter {
            set.insert(tag.as_ref());
        }
        set
    }
}

/// Named numeric parameters, ordered by name. NaN equals NaN.
#[derive(Debug, Clone, Default)]
pub struct Parameters(BTreeMap<String, f64>);

impl Parameters {
    /// Sets a parameter.
    pub fn set(&mut self, name: &str, value: f64) {
        self.0.insert(name.to_string(), value);
    }

    /// Reads a parameter.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Removes a parameter.
    pub fn remove(&mut self, name: &str) -> Option<f64> {
        self.0.remove(name)
    }

    /// Parameter names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.keys().map(String::as_str)
    }

    /// Underlying map.
    pub fn as_map(&self) -> &BTreeMap<String, f64> {
        &self.0
    }

    /// Number of parameters.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for Parameters {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|((ka, va), (kb, vb))| ka == kb && same_double(*va, *vb))
    }
}

/// Fields every record carries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordCore {
    /// Globally unique id; immutable once the record is stored.
    pub uid: String,
    /// Free text notes; empty means none.
    pub notes: String,
    /// Tags.
    pub tags: TagSet,
    /// Named parameters.
    pub parameters: Parameters,
    /// Primary data table.
    pub table: DataTable,
}

impl RecordCore {
    /// Creates a core with the given UID.
    pub fn with_uid(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            ..Self::default()
        }
    }
}

/// Generates a fresh record UID.
pub fn generate_uid() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Capabilities the archive needs from a record type.
pub trait ArchiveRecord: Protocol + Clone + Default + Send + Sync {
    /// Which kind of record this is.
    const KIND: RecordKind;

    /// Shared fields.
    fn core(&self) -> &RecordCore;

    /// Shared fields, mutably.
    fn core_mut(&mut self) -> &mut RecordCore;

    /// Record UID.
    fn uid(&self) -> &str {
        &self.core().uid
    }

    /// Notes, if any.
    fn notes(&self) -> Option<&str> {
        let notes = &self.core().notes;
        (!notes.is_empty()).then_some(notes.as_str())
    }

    /// Replaces the notes.
    fn set_notes(&mut self, notes: &str) {
        self.core_mut().notes = notes.to_string();
    }

    /// Tags.
    fn tags(&self) -> &TagSet {
        &self.core().tags
    }

    /// Adds a tag.
    fn add_tag(&mut self, tag: &str) -> bool {
        self.core_mut().tags.insert(tag)
    }

    /// Removes a tag.
    fn remove_tag(&mut self, tag: &str) -> bool {
        self.core_mut().tags.remove(tag)
    }

    /// Tag membership.
    fn has_tag(&self, tag: &str) -> bool {
        self.core().tags.contains(tag)
    }

    /// Parameters.
    fn parameters(&self) -> &Parameters {
        &self.core().parameters
    }

    /// Reads one parameter.
    fn parameter(&self, name: &str) -> Option<f64> {
        self.core().parameters.get(name)
    }

    /// Sets one parameter.
    fn set_parameter(&mut self, name: &str, value: f64) {
        self.core_mut().parameters.set(name, value);
    }

    /// Primary data table.
    fn table(&self) -> &DataTable {
        &self.core().table
    }

    /// Replaces the primary data table.
    fn set_table(&mut self, table: DataTable) {
        self.core_mut().table = table;
    }
}

pub(crate) mod fields {
    //! Field readers and writers for [`RecordCore`], shared by record types.

    use super::*;

    pub(crate) fn write_uid<R: ArchiveRecord>(r: &R) -> Option<FieldValue<'_>> {
        Some(FieldValue::Str(&r.core().uid))
    }

    pub(crate) fn read_uid<R: ArchiveRecord>(r: &mut R, v: Value) -> ArchiveResult<()> {
        r.core_mut().uid = v.into_string("UID")?;
        Ok(())
    }

    pub(crate) fn write_notes<R: ArchiveRecord>(r: &R) -> Option<FieldValue<'_>> {
        r.notes().map(FieldValue::Str)
    }

    pub(crate) fn read_notes<R: ArchiveRecord>(r: &mut R, v: Value) -> ArchiveResult<()> {
        r.core_mut().notes = v.into_string("Notes")?;
        Ok(())
    }

    pub(crate) fn write_tags<R: ArchiveRecord>(r: &R) -> Option<FieldValue<'_>> {
        let tags = &r.core().tags;
        (!tags.is_empty()).then_some(FieldValue::Strings(tags.as_slice()))
    }

    pub(crate) fn read_tags<R: ArchiveRecord>(r: &mut R, v: Value) -> ArchiveResult<()> {
        r.core_mut().tags = v.into_strings("Tags")?.into_iter().collect();
        Ok(())
    }

    pub(crate) fn write_parameters<R: ArchiveRecord>(r: &R) -> Option<FieldValue<'_>> {
        let params = &r.core().parameters;
        (!params.is_empty()).then_some(FieldValue::NamedDoubles(params.as_map()))
    }

    pub(crate) fn read_parameters<R: ArchiveRecord>(r: &mut R, v: Value) -> ArchiveResult<()> {
        let mut params = Parameters::default();
        for (name, value) in v.into_object("Parameters")? {
            params.set(&name, value.to_f64("Parameters")?);
        }
        r.core_mut().parameters = params;
        Ok(())
    }

    pub(crate) fn write_table<R: ArchiveRecord>(r: &R) -> Option<FieldValue<'_>> {
        let table = &r.core().table;
        (!table.is_empty()).then(|| table.to_field())
    }

    pub(crate) fn read_table<R: ArchiveRecord>(r: &mut R, v: Value) -> ArchiveResult<()> {
        r.core_mut().table = DataTable::from_value("Table", v)?;
        Ok(())
    }

    /// UID, Notes, Tags and Parameters, in that order.
    pub(crate) fn leading<R: ArchiveRecord>(registry: FieldRegistry<R>) -> FieldRegistry<R> {
        registry
            .field("UID", write_uid::<R>, read_uid::<R>)
            .field("Notes", write_notes::<R>, read_notes::<R>)
            .field("Tags", write_tags::<R>, read_tags::<R>)
            .field("Parameters", write_parameters::<R>, read_parameters::<R>)
    }

    /// The primary table.
    pub(crate) fn table<R: ArchiveRecord>(registry: FieldRegistry<R>) -> FieldRegistry<R> {
        registry
            .field("Table", write_table::<R>, read_table::<R>)
            .alias("DataTable", "Table")
    }
}
