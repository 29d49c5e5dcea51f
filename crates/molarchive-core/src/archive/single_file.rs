//! Single-file archive stream: a `properties` object followed by the
//! `metadata` and `molecules` record arrays.

use std::cell::Cell;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Read};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::de::{DeserializeSeed, Deserializer, MapAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use tracing::{error, info, warn};

use crate::archive::{MoleculeArchive, Slot};
use crate::encoding::{self, Encoding};
use crate::error::ArchiveResult;
use crate::metadata::Metadata;
use crate::molecule::Molecule;
use crate::properties::PropertiesSnapshot;
use crate::protocol::stream::skip_unknown;
use crate::protocol::{Fields, FieldsSeed, RecordSeqSeed};

const PROPERTIES: &str = "properties";
const METADATA: &str = "metadata";
const MOLECULES: &str = "molecules";

/// Streams a single-file archive into `archive`, returning the properties
/// object as read. Records are stored as they are decoded.
pub(crate) fn read_into(
    archive: &MoleculeArchive,
    reader: impl Read,
    encoding: Encoding,
    origin: &str,
) -> ArchiveResult<PropertiesSnapshot> {
    let mut properties = PropertiesSnapshot::default();
    let seed = ArchiveSeed {
        archive,
        properties: &mut properties,
    };
    encoding::read_seed(seed, encoding, origin, reader)?;
    Ok(properties)
}

/// Writes the whole archive to `path` through a sibling temporary file.
/// Records are fetched one at a time while the arrays are written.
pub(crate) fn write_to_path(archive: &MoleculeArchive, path: &Path, encoding: Encoding) -> ArchiveResult<()> {
    let body = ArchiveBody::new(archive);
    let tmp = temporary_sibling(path);
    {
        let writer = BufWriter::new(File::create(&tmp)?);
        if let Err(e) = encoding::write_value(&body, encoding, writer) {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                warn!(path = %tmp.display(), error = %cleanup, "failed to remove temporary file");
            }
            return Err(e);
        }
    }
    fs::rename(&tmp, path)?;
    info!(
        archive = %archive.name(),
        path = %path.display(),
        %encoding,
        molecules = body.molecules.written.get(),
        metadata = body.metadata.written.get(),
        "saved archive file"
    );
    Ok(())
}

fn temporary_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn store_decoded<R: Slot>(archive: &MoleculeArchive, record: R) {
    let uid = record.uid().to_string();
    if let Err(e) = archive.put(record) {
        error!(kind = %R::KIND, uid = %uid, error = %e, "dropped record from archive file");
    }
}

struct ArchiveSeed<'a> {
    archive: &'a MoleculeArchive,
    properties: &'a mut PropertiesSnapshot,
}

impl<'de> DeserializeSeed<'de> for ArchiveSeed<'_> {
    type Value = ();

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ArchiveSeed<'_> {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a molecule archive object")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
        let archive = self.archive;
        while let Some(name) = map.next_key::<String>()? {
            match name.as_str() {
                PROPERTIES | "MoleculeArchiveProperties" => {
                    map.next_value_seed(FieldsSeed(&mut *self.properties))?;
                }
                METADATA | "ImageMetadata" => {
                    let mut sink = |record: Metadata| store_decoded(archive, record);
                    map.next_value_seed(RecordSeqSeed::<Metadata, _>::new(&mut sink))?;
                }
                MOLECULES | "Molecules" => {
                    let mut sink = |record: Molecule| store_decoded(archive, record);
                    map.next_value_seed(RecordSeqSeed::<Molecule, _>::new(&mut sink))?;
                }
                _ => skip_unknown(&mut map, "archive", &name)?,
            }
        }
        Ok(())
    }
}

/// What one save writes. Only UIDs are snapshotted; each record is loaded
/// when its array element is serialized and dropped right after.
struct ArchiveBody<'a> {
    properties: PropertiesSnapshot,
    metadata: RecordStream<'a, Metadata>,
    molecules: RecordStream<'a, Molecule>,
}

impl<'a> ArchiveBody<'a> {
    fn new(archive: &'a MoleculeArchive) -> Self {
        let metadata = RecordStream::<Metadata>::listed(archive);
        let molecules = RecordStream::<Molecule>::listed(archive);
        let mut properties = archive.properties().snapshot();
        properties.metadata_count = metadata.uids.len() as u64;
        properties.molecule_count = molecules.uids.len() as u64;
        Self {
            properties,
            metadata,
            molecules,
        }
    }
}

struct RecordStream<'a, R> {
    archive: &'a MoleculeArchive,
    uids: Vec<String>,
    written: Cell<usize>,
    _kind: PhantomData<fn() -> R>,
}

impl<'a, R: Slot> RecordStream<'a, R> {
    fn listed(archive: &'a MoleculeArchive) -> Self {
        Self {
            archive,
            uids: archive.uid_list::<R>().lock().to_vec(),
            written: Cell::new(0),
            _kind: PhantomData,
        }
    }
}

impl<R: Slot> Serialize for RecordStream<'_, R> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Length unknown up front: a record may vanish or fail to load.
        let mut seq = serializer.serialize_seq(None)?;
        for uid in &self.uids {
            match self.archive.get::<R>(uid) {
                Some(record) => {
                    seq.serialize_element(&Fields(record.as_ref()))?;
                    self.written.set(self.written.get() + 1);
                }
                None => warn!(kind = %R::KIND, uid = %uid, "record not written, failed to load"),
            }
        }
        seq.end()
    }
}

impl Serialize for ArchiveBody<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry(PROPERTIES, &Fields(&self.properties))?;
        map.serialize_entry(METADATA, &self.metadata)?;
        map.serialize_entry(MOLECULES, &self.molecules)?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::StorageMode;
    use crate::config::ArchiveConfig;
    use crate::kind::ArchiveKind;
    use crate::record::ArchiveRecord;
    use crate::table::DataTable;
    use molarchive_kv::{FsStore, KvStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn sample_archive() -> MoleculeArchive {
        let archive = MoleculeArchive::new_in_memory("sample", ArchiveKind::Arch);
        let mut md = Metadata::new("md1");
        md.microscope = "TIRF".to_string();
        md.log_line("acquired");
        archive.put_metadata(md).unwrap();
        for i in 0..3 {
            let mut m = Molecule::new(format!("m{i}")).with_metadata_uid("md1");
            m.add_tag("good");
            m.set_parameter("rate", i as f64 + 0.5);
            m.set_table(DataTable::new().with_doubles("T", vec![0.0, f64::NAN, f64::INFINITY]));
            archive.put_molecule(m).unwrap();
        }
        archive.properties().set_comments("hello");
        archive
    }

    #[test]
    fn test_temporary_sibling() {
        assert_eq!(
            temporary_sibling(Path::new("/data/run.sml")),
            PathBuf::from("/data/run.sml.tmp")
        );
    }

    #[test]
    fn test_round_trip_both_encodings() {
        let dir = TempDir::new().unwrap();
        let archive = sample_archive();
        for encoding in Encoding::ALL {
            let path = dir.path().join(format!("a.{}", encoding.extension()));
            archive.save_as(&path, encoding).unwrap();
            assert!(!temporary_sibling(&path).exists());

            let back = MoleculeArchive::open_file(&path, ArchiveConfig::default()).unwrap();
            assert_eq!(back.mode(), StorageMode::InMemory);
            assert_eq!(back.encoding(), encoding);
            assert_eq!(back.archive_type(), ArchiveKind::Arch);
            assert_eq!(back.molecule_uids(), vec!["m0", "m1", "m2"]);
            assert_eq!(back.properties().comments(), "hello");
            assert_eq!(back.properties().number_of_molecules(), 3);
            assert_eq!(*back.get_molecule("m1").unwrap(), *archive.get_molecule("m1").unwrap());
            assert_eq!(back.get_metadata("md1").unwrap().microscope, "TIRF");
        }
    }

    #[test]
    fn test_save_rewrites_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.json");
        sample_archive().save_as(&path, Encoding::Text).unwrap();

        let archive = MoleculeArchive::open_file(&path, ArchiveConfig::default()).unwrap();
        archive.remove_molecule("m0").unwrap();
        archive.save().unwrap();

        let back = MoleculeArchive::open_file(&path, ArchiveConfig::default()).unwrap();
        assert_eq!(back.molecule_uids(), vec!["m1", "m2"]);
        assert_eq!(back.encoding(), Encoding::Text);
    }

    #[test]
    fn test_save_virtual_streams_records() {
        let dir = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(FsStore::open(dir.path()).unwrap());
        let config = ArchiveConfig {
            encoding: Encoding::Text,
            ..ArchiveConfig::default()
        };
        let archive = MoleculeArchive::create_virtual(store, ArchiveKind::Arch, config).unwrap();
        archive.put_metadata(Metadata::new("md1")).unwrap();
        for i in 0..4 {
            let mut m = Molecule::new(format!("m{i}")).with_metadata_uid("md1");
            m.add_tag("good");
            archive.put_molecule(m).unwrap();
        }
        // A record that no longer loads is left out; the rest still stream.
        fs::write(dir.path().join("Molecules/m2.json"), br#"{"UID": "other"}"#).unwrap();

        let path = out.path().join("flat.sml");
        archive.save_as(&path, Encoding::Binary).unwrap();
        let back = MoleculeArchive::open_file(&path, ArchiveConfig::default()).unwrap();
        assert_eq!(back.encoding(), Encoding::Binary);
        assert_eq!(back.molecule_uids(), vec!["m0", "m1", "m3"]);
        assert_eq!(back.metadata_uids(), vec!["md1"]);
        assert_eq!(back.molecule_uids_with_tag("good").len(), 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_write_removes_temporary_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("full.json");
        let tmp = temporary_sibling(&path);
        std::os::unix::fs::symlink("/dev/full", &tmp).unwrap();

        let err = sample_archive().save_as(&path, Encoding::Text).unwrap_err();
        assert!(
            matches!(err, crate::error::ArchiveError::Io(_) | crate::error::ArchiveError::Json(_)),
            "{err}"
        );
        assert!(fs::symlink_metadata(&tmp).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_legacy_keys_and_unknown_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("legacy.json");
        fs::write(
            &path,
            r#"{
                "MoleculeArchiveProperties": {"archiveType": "de.mpg.biochem.DnaMoleculeArchive", "comments": "x"},
                "Extras": {"nested": [1, 2, 3]},
                "ImageMetadata": [{"UID": "md1", "Microscope": "scope"}],
                "Molecules": [{"UID": "a", "ImageMetadataUID": "md1", "Mystery": 4}]
            }"#,
        )
        .unwrap();

        let archive = MoleculeArchive::open_file(&path, ArchiveConfig::default()).unwrap();
        assert_eq!(archive.archive_type(), ArchiveKind::Dna);
        assert_eq!(archive.properties().comments(), "x");
        assert_eq!(archive.molecule_uids_for_metadata("md1"), vec!["a"]);
        assert_eq!(archive.get_metadata("md1").unwrap().microscope, "scope");
    }

    #[test]
    fn test_truncated_file_keeps_complete_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cut.json");
        fs::write(
            &path,
            r#"{"properties": {}, "molecules": [{"UID": "a", "Tags": ["t"]}, {"UID": "b", "Tags": ["#,
        )
        .unwrap();

        let archive = MoleculeArchive::open_file(&path, ArchiveConfig::default()).unwrap();
        assert_eq!(archive.molecule_uids(), vec!["a"]);
        assert_eq!(archive.properties().number_of_molecules(), 1);
    }

    #[test]
    fn test_records_without_uid_are_dropped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nouid.json");
        fs::write(&path, r#"{"molecules": [{"Notes": "orphan"}, {"UID": "ok"}]}"#).unwrap();
        let archive = MoleculeArchive::open_file(&path, ArchiveConfig::default()).unwrap();
        assert_eq!(archive.molecule_uids(), vec!["ok"]);
    }

    #[test]
    fn test_unrecognized_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.bin");
        fs::write(&path, b"garbage").unwrap();
        let err = MoleculeArchive::open_file(&path, ArchiveConfig::default()).unwrap_err();
        assert!(matches!(err, crate::error::ArchiveError::UnknownEncoding { .. }));
    }
}
