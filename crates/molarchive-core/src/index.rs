//! In-memory archive index.
//!
//! Answers "which UIDs exist" and the per-UID lookups (tags, channel,
//! image, metadata reference) without touching the backend.
//!
//! Adds fill the per-UID maps before the UID set, removes clear the set
//! first, so a reader that finds a UID in the set also finds its entries.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{ArchiveError, ArchiveResult};
use crate::metadata::Metadata;
use crate::molecule::Molecule;
use crate::protocol::{FieldRegistry, FieldValue, Protocol, Value};
use crate::record::{ArchiveRecord, TagSet};

/// Concurrent UID sets plus per-UID lookup maps.
#[derive(Debug, Default)]
pub struct ArchiveIndex {
    molecule_uids: RwLock<BTreeSet<String>>,
    metadata_uids: RwLock<BTreeSet<String>>,
    molecule_tags: DashMap<String, TagSet>,
    molecule_channel: DashMap<String, i32>,
    molecule_image: DashMap<String, i32>,
    molecule_metadata: DashMap<String, String>,
    metadata_tags: DashMap<String, TagSet>,
}

impl ArchiveIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes a molecule, replacing any previous entries for its UID.
    pub fn add_molecule(&self, molecule: &Molecule) {
        let uid = molecule.uid();
        set_or_clear(&self.molecule_tags, uid, (!molecule.tags().is_empty()).then(|| molecule.tags().clone()));
        set_or_clear(&self.molecule_channel, uid, molecule.channel);
        set_or_clear(&self.molecule_image, uid, molecule.image);
        set_or_clear(
            &self.molecule_metadata,
            uid,
            (!molecule.metadata_uid.is_empty()).then(|| molecule.metadata_uid.clone()),
        );
        self.molecule_uids.write().insert(uid.to_string());
    }

    /// Drops a molecule and its entries. Returns true if it was indexed.
    pub fn remove_molecule(&self, uid: &str) -> bool {
        let removed = self.molecule_uids.write().remove(uid);
        self.molecule_tags.remove(uid);
        self.molecule_channel.remove(uid);
        self.molecule_image.remove(uid);
        self.molecule_metadata.remove(uid);
        removed
    }

    /// Indexes a metadata record, replacing any previous entries.
    pub fn add_metadata(&self, metadata: &Metadata) {
        let uid = metadata.uid();
        set_or_clear(&self.metadata_tags, uid, (!metadata.tags().is_empty()).then(|| metadata.tags().clone()));
        self.metadata_uids.write().insert(uid.to_string());
    }

    /// Drops a metadata record and its entries. Returns true if it was indexed.
    pub fn remove_metadata(&self, uid: &str) -> bool {
        let removed = self.metadata_uids.write().remove(uid);
        self.metadata_tags.remove(uid);
        removed
    }

    /// Registers a molecule UID with no lookup entries.
    pub fn insert_molecule_uid(&self, uid: &str) {
        self.molecule_uids.write().insert(uid.to_string());
    }

    /// Registers a metadata UID with no lookup entries.
    pub fn insert_metadata_uid(&self, uid: &str) {
        self.metadata_uids.write().insert(uid.to_string());
    }

    /// O(log n) membership test.
    pub fn contains_molecule_uid(&self, uid: &str) -> bool {
        self.molecule_uids.read().contains(uid)
    }

    /// O(log n) membership test.
    pub fn contains_metadata_uid(&self, uid: &str) -> bool {
        self.metadata_uids.read().contains(uid)
    }

    /// Sorted molecule UIDs.
    pub fn molecule_uids(&self) -> Vec<String> {
        self.molecule_uids.read().iter().cloned().collect()
    }

    /// Sorted metadata UIDs.
    pub fn metadata_uids(&self) -> Vec<String> {
        self.metadata_uids.read().iter().cloned().collect()
    }

    /// Number of indexed molecules.
    pub fn molecule_count(&self) -> usize {
        self.molecule_uids.read().len()
    }

    /// Number of indexed metadata records.
    pub fn metadata_count(&self) -> usize {
        self.metadata_uids.read().len()
    }

    /// Tags of a molecule.
    pub fn molecule_tags(&self, uid: &str) -> Option<TagSet> {
        self.molecule_tags.get(uid).map(|t| t.clone())
    }

    /// Channel of a molecule.
    pub fn molecule_channel(&self, uid: &str) -> Option<i32> {
        self.molecule_channel.get(uid).map(|c| *c)
    }

    /// Image number of a molecule.
    pub fn molecule_image(&self, uid: &str) -> Option<i32> {
        self.molecule_image.get(uid).map(|i| *i)
    }

    /// Metadata UID a molecule refers to.
    pub fn molecule_metadata_uid(&self, uid: &str) -> Option<String> {
        self.molecule_metadata.get(uid).map(|m| m.clone())
    }

    /// Tags of a metadata record.
    pub fn metadata_tags(&self, uid: &str) -> Option<TagSet> {
        self.metadata_tags.get(uid).map(|t| t.clone())
    }

    /// Sorted molecule UIDs carrying `tag`.
    pub fn molecule_uids_with_tag(&self, tag: &str) -> Vec<String> {
        self.molecule_uids
            .read()
            .iter()
            .filter(|uid| {
                self.molecule_tags
                    .get(uid.as_str())
                    .is_some_and(|tags| tags.contains(tag))
            })
            .cloned()
            .collect()
    }

    /// Sorted molecule UIDs referring to `metadata_uid`.
    pub fn molecule_uids_for_metadata(&self, metadata_uid: &str) -> Vec<String> {
        self.molecule_uids
            .read()
            .iter()
            .filter(|uid| {
                self.molecule_metadata
                    .get(uid.as_str())
                    .is_some_and(|m| m.as_str() == metadata_uid)
            })
            .cloned()
            .collect()
    }

    /// Empties the index.
    pub fn clear(&self) {
        self.molecule_uids.write().clear();
        self.metadata_uids.write().clear();
        self.molecule_tags.clear();
        self.molecule_channel.clear();
        self.molecule_image.clear();
        self.molecule_metadata.clear();
        self.metadata_tags.clear();
    }

    /// Replaces this index's contents with a copy of `other`.
    pub fn replace_with(&self, other: &ArchiveIndex) {
        self.clear();
        for entry in other.molecule_tags.iter() {
            self.molecule_tags.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in other.molecule_channel.iter() {
            self.molecule_channel.insert(entry.key().clone(), *entry.value());
        }
        for entry in other.molecule_image.iter() {
            self.molecule_image.insert(entry.key().clone(), *entry.value());
        }
        for entry in other.molecule_metadata.iter() {
            self.molecule_metadata.insert(entry.key().clone(), entry.value().clone());
        }
        for entry in other.metadata_tags.iter() {
            self.metadata_tags.insert(entry.key().clone(), entry.value().clone());
        }
        *self.molecule_uids.write() = other.molecule_uids.read().clone();
        *self.metadata_uids.write() = other.metadata_uids.read().clone();
        debug!(
            molecules = self.molecule_count(),
            metadata = self.metadata_count(),
            "index replaced"
        );
    }

    /// Copies the index into its serializable form.
    pub fn snapshot(&self) -> IndexSnapshot {
        let metadata = self
            .metadata_uids()
            .into_iter()
            .map(|uid| MetadataEntry {
                tags: self.metadata_tags(&uid).unwrap_or_default(),
                uid,
            })
            .collect();
        let molecules = self
            .molecule_uids()
            .into_iter()
            .map(|uid| MoleculeEntry {
                tags: self.molecule_tags(&uid).unwrap_or_default(),
                channel: self.molecule_channel(&uid),
                image: self.molecule_image(&uid),
                metadata_uid: self.molecule_metadata_uid(&uid),
                uid,
            })
            .collect();
        IndexSnapshot {
            metadata,
            molecules,
        }
    }

    /// Builds an index from its serialized form.
    pub fn from_snapshot(snapshot: IndexSnapshot) -> Self {
        let index = ArchiveIndex::new();
        for entry in snapshot.metadata {
            if !entry.tags.is_empty() {
                index.metadata_tags.insert(entry.uid.clone(), entry.tags);
            }
            index.metadata_uids.write().insert(entry.uid);
        }
        for entry in snapshot.molecules {
            if !entry.tags.is_empty() {
                index.molecule_tags.insert(entry.uid.clone(), entry.tags);
            }
            if let Some(channel) = entry.channel {
                index.molecule_channel.insert(entry.uid.clone(), channel);
            }
            if let Some(image) = entry.image {
                index.molecule_image.insert(entry.uid.clone(), image);
            }
            if let Some(md) = entry.metadata_uid {
                index.molecule_metadata.insert(entry.uid.clone(), md);
            }
            index.molecule_uids.write().insert(entry.uid);
        }
        index
    }
}

fn set_or_clear<V>(map: &DashMap<String, V>, uid: &str, value: Option<V>) {
    match value {
        Some(v) => {
            map.insert(uid.to_string(), v);
        }
        None => {
            map.remove(uid);
        }
    }
}

/// Serialized index entry for a metadata record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataEntry {
    /// Record UID.
    pub uid: String,
    /// Record tags.
    pub tags: TagSet,
}

/// Serialized index entry for a molecule.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MoleculeEntry {
    /// Record UID.
    pub uid: String,
    /// Record tags.
    pub tags: TagSet,
    /// Channel, if set.
    pub channel: Option<i32>,
    /// Image number, if set.
    pub image: Option<i32>,
    /// Referenced metadata UID, if set.
    pub metadata_uid: Option<String>,
}

/// Serializable copy of an [`ArchiveIndex`], written to `indexes.{ext}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexSnapshot {
    /// Metadata entries, sorted by UID.
    pub metadata: Vec<MetadataEntry>,
    /// Molecule entries, sorted by UID.
    pub molecules: Vec<MoleculeEntry>,
}

fn write_metadata_entries(s: &IndexSnapshot) -> Option<FieldValue<'_>> {
    let entries = s
        .metadata
        .iter()
        .map(|e| {
            let mut fields = vec![("uid", FieldValue::Str(&e.uid))];
            if !e.tags.is_empty() {
                fields.push(("tags", FieldValue::Strings(e.tags.as_slice())));
            }
            FieldValue::Object(fields)
        })
        .collect();
    Some(FieldValue::List(entries))
}

fn write_molecule_entries(s: &IndexSnapshot) -> Option<FieldValue<'_>> {
    let entries = s
        .molecules
        .iter()
        .map(|e| {
            let mut fields = vec![("uid", FieldValue::Str(&e.uid))];
            if !e.tags.is_empty() {
                fields.push(("tags", FieldValue::Strings(e.tags.as_slice())));
            }
            if let Some(channel) = e.channel {
                fields.push(("channel", FieldValue::Int(i64::from(channel))));
            }
            if let Some(image) = e.image {
                fields.push(("image", FieldValue::Int(i64::from(image))));
            }
            if let Some(md) = &e.metadata_uid {
                fields.push(("metadataUID", FieldValue::Str(md)));
            }
            FieldValue::Object(fields)
        })
        .collect();
    Some(FieldValue::List(entries))
}

/// Entry keys are matched case-insensitively; `imageMetadataUID` is the
/// legacy spelling of `metadataUID`.
fn read_entry(field: &str, value: Value) -> ArchiveResult<MoleculeEntry> {
    let mut entry = MoleculeEntry::default();
    for (key, v) in value.into_object(field)? {
        match key.to_ascii_lowercase().as_str() {
            "uid" => entry.uid = v.into_string(field)?,
            "tags" => entry.tags = v.into_strings(field)?.into_iter().collect(),
            "channel" => entry.channel = Some(v.to_i32(field)?),
            "image" => entry.image = Some(v.to_i32(field)?),
            "metadatauid" | "imagemetadatauid" => entry.metadata_uid = Some(v.into_string(field)?),
            _ => {}
        }
    }
    if entry.uid.is_empty() {
        return Err(ArchiveError::field(field, "index entry without uid"));
    }
    Ok(entry)
}

fn read_metadata_entries(s: &mut IndexSnapshot, v: Value) -> ArchiveResult<()> {
    s.metadata = v
        .into_array("metadata")?
        .into_iter()
        .map(|item| {
            read_entry("metadata", item).map(|e| MetadataEntry {
                uid: e.uid,
                tags: e.tags,
            })
        })
        .collect::<ArchiveResult<_>>()?;
    Ok(())
}

fn read_molecule_entries(s: &mut IndexSnapshot, v: Value) -> ArchiveResult<()> {
    s.molecules = v
        .into_array("molecules")?
        .into_iter()
        .map(|item| read_entry("molecules", item))
        .collect::<ArchiveResult<_>>()?;
    Ok(())
}

static INDEX_FIELDS: LazyLock<FieldRegistry<IndexSnapshot>> = LazyLock::new(|| {
    FieldRegistry::new()
        .field("metadata", write_metadata_entries, read_metadata_entries)
        .alias("ImageMetadataIndex", "metadata")
        .alias("MetadataIndex", "metadata")
        .field("molecules", write_molecule_entries, read_molecule_entries)
        .alias("MoleculeIndex", "molecules")
});

impl Protocol for IndexSnapshot {
    const NAME: &'static str = "index";

    fn registry() -> &'static FieldRegistry<Self> {
        &INDEX_FIELDS
    }
}
