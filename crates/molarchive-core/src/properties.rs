//! Archive-wide properties: record counts, unions of every value seen across
//! records, the archive type and free-form named documents.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};
use crate::kind::{ArchiveKind, ArchiveTypeRegistry};
use crate::metadata::Metadata;
use crate::molecule::Molecule;
use crate::protocol::{FieldRegistry, FieldValue, Protocol, Value};
use crate::record::ArchiveRecord;
use crate::table::SegmentKey;

/// Name of the document holding archive comments.
pub const COMMENTS: &str = "Comments";

/// Live archive properties. All mutators take `&self`.
#[derive(Debug, Default)]
pub struct ArchiveProperties {
    archive_type: RwLock<ArchiveKind>,
    molecule_count: AtomicU64,
    metadata_count: AtomicU64,
    tags: RwLock<BTreeSet<String>>,
    parameters: RwLock<BTreeSet<String>>,
    columns: RwLock<BTreeSet<String>>,
    channels: RwLock<BTreeSet<i32>>,
    segment_tables: RwLock<BTreeSet<SegmentKey>>,
    documents: RwLock<BTreeMap<String, String>>,
}

fn union<T: Ord + Clone>(set: &RwLock<BTreeSet<T>>, items: impl IntoIterator<Item = T>) {
    let mut items = items.into_iter().peekable();
    if items.peek().is_none() {
        return;
    }
    set.write().extend(items);
}

impl ArchiveProperties {
    /// Empty properties for an archive of `kind`.
    pub fn new(kind: ArchiveKind) -> Self {
        let props = Self::default();
        *props.archive_type.write() = kind;
        props
    }

    /// Archive type.
    pub fn archive_type(&self) -> ArchiveKind {
        *self.archive_type.read()
    }

    /// Changes the archive type.
    pub fn set_archive_type(&self, kind: ArchiveKind) {
        *self.archive_type.write() = kind;
    }

    /// Number of molecules.
    pub fn number_of_molecules(&self) -> u64 {
        self.molecule_count.load(Ordering::Acquire)
    }

    /// Sets the number of molecules.
    pub fn set_number_of_molecules(&self, count: u64) {
        self.molecule_count.store(count, Ordering::Release);
    }

    /// Number of metadata records.
    pub fn number_of_metadata(&self) -> u64 {
        self.metadata_count.load(Ordering::Acquire)
    }

    /// Sets the number of metadata records.
    pub fn set_number_of_metadata(&self, count: u64) {
        self.metadata_count.store(count, Ordering::Release);
    }

    /// Adds tags to the union.
    pub fn add_all_tags<'a>(&self, tags: impl IntoIterator<Item = &'a str>) {
        union(&self.tags, tags.into_iter().map(str::to_string));
    }

    /// Adds parameter names to the union.
    pub fn add_all_parameters<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        union(&self.parameters, names.into_iter().map(str::to_string));
    }

    /// Adds table column names to the union.
    pub fn add_all_columns<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        union(&self.columns, names.into_iter().map(str::to_string));
    }

    /// Adds a channel to the union.
    pub fn add_channel(&self, channel: i32) {
        if !self.channels.read().contains(&channel) {
            self.channels.write().insert(channel);
        }
    }

    /// Adds segment table keys to the union.
    pub fn add_all_segment_table_names<'a>(&self, keys: impl IntoIterator<Item = &'a SegmentKey>) {
        union(&self.segment_tables, keys.into_iter().cloned());
    }

    /// Unions every value of a molecule.
    pub fn absorb_molecule(&self, molecule: &Molecule) {
        self.add_all_tags(molecule.tags().iter());
        self.add_all_parameters(molecule.parameters().names());
        self.add_all_columns(molecule.table().column_names());
        if let Some(channel) = molecule.channel {
            self.add_channel(channel);
        }
        self.add_all_segment_table_names(molecule.segment_tables.keys());
    }

    /// Unions every value of a metadata record.
    pub fn absorb_metadata(&self, metadata: &Metadata) {
        self.add_all_tags(metadata.tags().iter());
        self.add_all_parameters(metadata.parameters().names());
        self.add_all_columns(metadata.table().column_names());
    }

    /// Sorted tag union.
    pub fn tags(&self) -> Vec<String> {
        self.tags.read().iter().cloned().collect()
    }

    /// Sorted parameter name union.
    pub fn parameters(&self) -> Vec<String> {
        self.parameters.read().iter().cloned().collect()
    }

    /// Sorted column name union.
    pub fn columns(&self) -> Vec<String> {
        self.columns.read().iter().cloned().collect()
    }

    /// Sorted channel union.
    pub fn channels(&self) -> Vec<i32> {
        self.channels.read().iter().copied().collect()
    }

    /// Sorted segment key union.
    pub fn segment_table_names(&self) -> Vec<SegmentKey> {
        self.segment_tables.read().iter().cloned().collect()
    }

    /// Replaces the tag union.
    pub fn set_tags(&self, tags: BTreeSet<String>) {
        *self.tags.write() = tags;
    }

    /// Replaces the parameter union.
    pub fn set_parameters(&self, names: BTreeSet<String>) {
        *self.parameters.write() = names;
    }

    /// Replaces the column union.
    pub fn set_columns(&self, names: BTreeSet<String>) {
        *self.columns.write() = names;
    }

    /// Replaces the channel union.
    pub fn set_channels(&self, channels: BTreeSet<i32>) {
        *self.channels.write() = channels;
    }

    /// Replaces the segment key union.
    pub fn set_segment_table_names(&self, keys: BTreeSet<SegmentKey>) {
        *self.segment_tables.write() = keys;
    }

    /// Replaces every union set and both counts with those of `other`.
    /// Type and documents are kept.
    pub fn replace_sets_from(&self, other: &ArchiveProperties) {
        self.set_tags(other.tags.read().clone());
        self.set_parameters(other.parameters.read().clone());
        self.set_columns(other.columns.read().clone());
        self.set_channels(other.channels.read().clone());
        self.set_segment_table_names(other.segment_tables.read().clone());
        self.set_number_of_molecules(other.number_of_molecules());
        self.set_number_of_metadata(other.number_of_metadata());
    }

    /// Empties counts, union sets and documents.
    pub fn clear(&self) {
        self.set_number_of_molecules(0);
        self.set_number_of_metadata(0);
        self.tags.write().clear();
        self.parameters.write().clear();
        self.columns.write().clear();
        self.channels.write().clear();
        self.segment_tables.write().clear();
        self.documents.write().clear();
    }

    /// Reads a named document.
    pub fn document(&self, name: &str) -> Option<String> {
        self.documents.read().get(name).cloned()
    }

    /// Stores a named document.
    pub fn set_document(&self, name: &str, content: &str) {
        self.documents
            .write()
            .insert(name.to_string(), content.to_string());
    }

    /// Names of all documents.
    pub fn document_names(&self) -> Vec<String> {
        self.documents.read().keys().cloned().collect()
    }

    /// Archive comments (empty if none).
    pub fn comments(&self) -> String {
        self.document(COMMENTS).unwrap_or_default()
    }

    /// Replaces the archive comments.
    pub fn set_comments(&self, comments: &str) {
        self.set_document(COMMENTS, comments);
    }

    /// Unions every set of `other` into this one.
    pub fn union_from(&self, other: &ArchiveProperties) {
        union(&self.tags, other.tags());
        union(&self.parameters, other.parameters());
        union(&self.columns, other.columns());
        union(&self.channels, other.channels());
        union(&self.segment_tables, other.segment_table_names());
    }

    /// Appends `comments` under a `# <label>` heading.
    pub fn append_comments(&self, label: &str, comments: &str) {
        if comments.trim().is_empty() {
            return;
        }
        let mut docs = self.documents.write();
        let current = docs.entry(COMMENTS.to_string()).or_default();
        if !current.is_empty() && !current.ends_with('\n') {
            current.push('\n');
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(&format!("# {label}\n{comments}"));
    }

    /// Folds another archive's properties into these: counts add, sets
    /// union, comments are appended under `label`.
    pub fn merge(&self, other: &ArchiveProperties, label: &str) {
        self.molecule_count
            .fetch_add(other.number_of_molecules(), Ordering::AcqRel);
        self.metadata_count
            .fetch_add(other.number_of_metadata(), Ordering::AcqRel);
        self.union_from(other);
        self.append_comments(label, &other.comments());
        debug!(label, "merged properties");
    }

    /// Copies the properties into their serializable form.
    pub fn snapshot(&self) -> PropertiesSnapshot {
        PropertiesSnapshot {
            archive_type: self.archive_type().name().to_string(),
            molecule_count: self.number_of_molecules(),
            metadata_count: self.number_of_metadata(),
            tags: self.tags(),
            parameters: self.parameters(),
            columns: self.columns(),
            channels: self.channels(),
            segment_tables: self.segment_table_names(),
            documents: self.documents.read().clone(),
        }
    }

    /// Builds live properties from a snapshot, resolving the archive type.
    /// A snapshot without a type tag yields the default kind.
    pub fn from_snapshot(snapshot: PropertiesSnapshot, types: &ArchiveTypeRegistry) -> ArchiveResult<Self> {
        let kind = if snapshot.archive_type.is_empty() {
            ArchiveKind::default()
        } else {
            types.resolve(&snapshot.archive_type)?
        };
        let props = Self::new(kind);
        props.set_number_of_molecules(snapshot.molecule_count);
        props.set_number_of_metadata(snapshot.metadata_count);
        props.set_tags(snapshot.tags.into_iter().collect());
        props.set_parameters(snapshot.parameters.into_iter().collect());
        props.set_columns(snapshot.columns.into_iter().collect());
        props.set_channels(snapshot.channels.into_iter().collect());
        props.set_segment_table_names(snapshot.segment_tables.into_iter().collect());
        *props.documents.write() = snapshot.documents;
        Ok(props)
    }
}

/// Serializable copy of [`ArchiveProperties`], written to
/// `MoleculeArchiveProperties.{ext}` and the `properties` section of a
/// single-file archive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertiesSnapshot {
    /// Archive type tag.
    pub archive_type: String,
    /// Number of molecules.
    pub molecule_count: u64,
    /// Number of metadata records.
    pub metadata_count: u64,
    /// Tag union.
    pub tags: Vec<String>,
    /// Parameter name union.
    pub parameters: Vec<String>,
    /// Column name union.
    pub columns: Vec<String>,
    /// Channel union.
    pub channels: Vec<i32>,
    /// Segment key union.
    pub segment_tables: Vec<SegmentKey>,
    /// Named documents.
    pub documents: BTreeMap<String, String>,
}

fn count(value: u64) -> FieldValue<'static> {
    FieldValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
}

fn strings(values: &[String]) -> Option<FieldValue<'_>> {
    (!values.is_empty()).then_some(FieldValue::Strings(values))
}

fn write_archive_type(s: &PropertiesSnapshot) -> Option<FieldValue<'_>> {
    Some(FieldValue::Str(&s.archive_type))
}

fn read_archive_type(s: &mut PropertiesSnapshot, v: Value) -> ArchiveResult<()> {
    s.archive_type = v.into_string("archiveType")?;
    Ok(())
}

fn write_molecule_count(s: &PropertiesSnapshot) -> Option<FieldValue<'_>> {
    Some(count(s.molecule_count))
}

fn read_molecule_count(s: &mut PropertiesSnapshot, v: Value) -> ArchiveResult<()> {
    s.molecule_count = v.to_u64("numberOfMolecules")?;
    Ok(())
}

fn write_metadata_count(s: &PropertiesSnapshot) -> Option<FieldValue<'_>> {
    Some(count(s.metadata_count))
}

fn read_metadata_count(s: &mut PropertiesSnapshot, v: Value) -> ArchiveResult<()> {
    s.metadata_count = v.to_u64("numberOfMetadata")?;
    Ok(())
}

fn write_tags(s: &PropertiesSnapshot) -> Option<FieldValue<'_>> {
    strings(&s.tags)
}

fn read_tags(s: &mut PropertiesSnapshot, v: Value) -> ArchiveResult<()> {
    s.tags = v.into_strings("tagSet")?;
    Ok(())
}

fn write_parameters(s: &PropertiesSnapshot) -> Option<FieldValue<'_>> {
    strings(&s.parameters)
}

fn read_parameters(s: &mut PropertiesSnapshot, v: Value) -> ArchiveResult<()> {
    s.parameters = v.into_strings("parameterSet")?;
    Ok(())
}

fn write_columns(s: &PropertiesSnapshot) -> Option<FieldValue<'_>> {
    strings(&s.columns)
}

fn read_columns(s: &mut PropertiesSnapshot, v: Value) -> ArchiveResult<()> {
    s.columns = v.into_strings("columnSet")?;
    Ok(())
}

fn write_channels(s: &PropertiesSnapshot) -> Option<FieldValue<'_>> {
    (!s.channels.is_empty()).then(|| {
        FieldValue::List(s.channels.iter().map(|c| FieldValue::Int(i64::from(*c))).collect())
    })
}

fn read_channels(s: &mut PropertiesSnapshot, v: Value) -> ArchiveResult<()> {
    s.channels = v
        .into_array("channelSet")?
        .iter()
        .map(|c| c.to_i32("channelSet"))
        .collect::<ArchiveResult<_>>()?;
    Ok(())
}

fn write_segment_tables(s: &PropertiesSnapshot) -> Option<FieldValue<'_>> {
    (!s.segment_tables.is_empty())
        .then(|| FieldValue::List(s.segment_tables.iter().map(SegmentKey::to_field).collect()))
}

fn read_segment_tables(s: &mut PropertiesSnapshot, v: Value) -> ArchiveResult<()> {
    const FIELD: &str = "segmentTableNames";
    s.segment_tables = v
        .into_array(FIELD)?
        .into_iter()
        .map(|entry| SegmentKey::from_fields(FIELD, &mut entry.into_object(FIELD)?))
        .collect::<ArchiveResult<_>>()?;
    Ok(())
}

fn write_documents(s: &PropertiesSnapshot) -> Option<FieldValue<'_>> {
    (!s.documents.is_empty()).then(|| {
        FieldValue::Object(
            s.documents
                .iter()
                .map(|(name, content)| (name.as_str(), FieldValue::Str(content)))
                .collect(),
        )
    })
}

fn read_documents(s: &mut PropertiesSnapshot, v: Value) -> ArchiveResult<()> {
    for (name, content) in v.into_object("documents")? {
        s.documents.insert(name, content.into_string("documents")?);
    }
    Ok(())
}

fn read_legacy_comments(s: &mut PropertiesSnapshot, v: Value) -> ArchiveResult<()> {
    let comments = v.into_string("comments")?;
    if comments.is_empty() {
        return Err(ArchiveError::field("comments", "empty"));
    }
    s.documents.entry(COMMENTS.to_string()).or_insert(comments);
    Ok(())
}

static PROPERTIES_FIELDS: LazyLock<FieldRegistry<PropertiesSnapshot>> = LazyLock::new(|| {
    FieldRegistry::new()
        .field("archiveType", write_archive_type, read_archive_type)
        .field("numberOfMolecules", write_molecule_count, read_molecule_count)
        .alias("numMolecules", "numberOfMolecules")
        .field("numberOfMetadata", write_metadata_count, read_metadata_count)
        .alias("numberOfImageMetadataRecords", "numberOfMetadata")
        .alias("numImageMetadata", "numberOfMetadata")
        .field("tagSet", write_tags, read_tags)
        .field("parameterSet", write_parameters, read_parameters)
        .field("columnSet", write_columns, read_columns)
        .alias("moleculeDataTableColumnSet", "columnSet")
        .field("channelSet", write_channels, read_channels)
        .field("segmentTableNames", write_segment_tables, read_segment_tables)
        .alias("moleculeSegmentTableNames", "segmentTableNames")
        .field("documents", write_documents, read_documents)
        .read_only("comments", read_legacy_comments)
});

impl Protocol for PropertiesSnapshot {
    const NAME: &'static str = "properties";

    fn registry() -> &'static FieldRegistry<Self> {
        &PROPERTIES_FIELDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Encoding;
    use crate::protocol::{decode, encode};
    use crate::table::DataTable;

    fn molecule() -> Molecule {
        let mut m = Molecule::new("m1");
        m.add_tag("good");
        m.set_parameter("rate", 1.0);
        m.channel = Some(3);
        m.set_table(DataTable::new().with_doubles("T", vec![0.0]));
        m.put_segment_table("T", "X", DataTable::new());
        m
    }

    #[test]
    fn test_absorb_molecule() {
        let props = ArchiveProperties::new(ArchiveKind::Dna);
        props.absorb_molecule(&molecule());
        assert_eq!(props.tags(), vec!["good"]);
        assert_eq!(props.parameters(), vec!["rate"]);
        assert_eq!(props.columns(), vec!["T"]);
        assert_eq!(props.channels(), vec![3]);
        assert_eq!(props.segment_table_names(), vec![SegmentKey::new("T", "X")]);
        assert_eq!(props.archive_type(), ArchiveKind::Dna);
    }

    #[test]
    fn test_absorb_metadata() {
        let props = ArchiveProperties::default();
        let mut md = Metadata::new("md");
        md.add_tag("cal");
        md.set_parameter("exposure", 0.05);
        props.absorb_metadata(&md);
        assert_eq!(props.tags(), vec!["cal"]);
        assert_eq!(props.parameters(), vec!["exposure"]);
    }

    #[test]
    fn test_merge() {
        let a = ArchiveProperties::default();
        a.set_number_of_molecules(2);
        a.set_comments("first run");
        a.add_all_tags(["x"]);
        let b = ArchiveProperties::default();
        b.set_number_of_molecules(3);
        b.set_number_of_metadata(1);
        b.set_comments("second run");
        b.add_all_tags(["y"]);
        a.merge(&b, "run2");
        assert_eq!(a.number_of_molecules(), 5);
        assert_eq!(a.number_of_metadata(), 1);
        assert_eq!(a.tags(), vec!["x", "y"]);
        assert_eq!(a.comments(), "first run\n\n# run2\nsecond run");
    }

    #[test]
    fn test_merge_into_empty_comments() {
        let a = ArchiveProperties::default();
        let b = ArchiveProperties::default();
        b.set_comments("notes");
        a.merge(&b, "b");
        assert_eq!(a.comments(), "# b\nnotes");
        let c = ArchiveProperties::default();
        a.merge(&c, "c");
        assert_eq!(a.comments(), "# b\nnotes");
    }

    #[test]
    fn test_clear() {
        let props = ArchiveProperties::default();
        props.absorb_molecule(&molecule());
        props.set_number_of_molecules(1);
        props.set_comments("c");
        props.clear();
        assert!(props.tags().is_empty());
        assert!(props.channels().is_empty());
        assert_eq!(props.number_of_molecules(), 0);
        assert!(props.document(COMMENTS).is_none());
    }

    #[test]
    fn test_snapshot_round_trip_both_encodings() {
        let props = ArchiveProperties::new(ArchiveKind::Arch);
        props.absorb_molecule(&molecule());
        props.set_number_of_molecules(1);
        props.set_document("Protocol", "flow 50 ul/min");
        let snapshot = props.snapshot();
        for encoding in Encoding::ALL {
            let bytes = encode(&snapshot, encoding).unwrap();
            let back: PropertiesSnapshot = decode(&bytes[..], encoding, "test").unwrap();
            assert_eq!(back, snapshot);
            let live = ArchiveProperties::from_snapshot(back, &ArchiveTypeRegistry::standard()).unwrap();
            assert_eq!(live.archive_type(), ArchiveKind::Arch);
            assert_eq!(live.document("Protocol").as_deref(), Some("flow 50 ul/min"));
            assert_eq!(live.number_of_molecules(), 1);
        }
    }

    #[test]
    fn test_legacy_fields() {
        let json = br#"{
            "archiveType": "dna",
            "numImageMetadata": 4,
            "moleculeDataTableColumnSet": ["T", "X"],
            "comments": "old style",
            "unknownThing": {"a": 1}
        }"#;
        let snapshot: PropertiesSnapshot = decode(&json[..], Encoding::Text, "test").unwrap();
        let props = ArchiveProperties::from_snapshot(snapshot, &ArchiveTypeRegistry::standard()).unwrap();
        assert_eq!(props.archive_type(), ArchiveKind::Dna);
        assert_eq!(props.number_of_metadata(), 4);
        assert_eq!(props.columns(), vec!["T", "X"]);
        assert_eq!(props.comments(), "old style");
    }

    #[test]
    fn test_unknown_archive_type_rejected() {
        let snapshot = PropertiesSnapshot {
            archive_type: "Mystery".into(),
            ..PropertiesSnapshot::default()
        };
        let err = ArchiveProperties::from_snapshot(snapshot, &ArchiveTypeRegistry::standard()).unwrap_err();
        assert!(matches!(err, ArchiveError::UnknownArchiveType { .. }));
    }
}
