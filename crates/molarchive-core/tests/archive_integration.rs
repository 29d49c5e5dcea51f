//! End-to-end archive tests over both storage modes and both backends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use molarchive_core::{
    ArchiveConfig, ArchiveKind, ArchiveRecord, DataTable, Encoding, Metadata, Molecule, MoleculeArchive,
    StorageMode, WindowLock,
};
use molarchive_kv::{FsStore, KvStore, MemoryObjectClient, S3Store};
use tempfile::TempDir;

fn config(encoding: Encoding) -> ArchiveConfig {
    ArchiveConfig {
        encoding,
        worker_threads: Some(2),
        ..ArchiveConfig::default()
    }
}

fn molecule(uid: &str, metadata_uid: &str, tag: &str) -> Molecule {
    let mut m = Molecule::new(uid).with_metadata_uid(metadata_uid);
    m.add_tag(tag);
    m.channel = Some(2);
    m.image = Some(7);
    m.set_notes("picked by hand");
    m.set_parameter("rate", 1.25);
    m.set_parameter("lifetime", f64::INFINITY);
    m.set_table(
        DataTable::new()
            .with_doubles("T", vec![0.0, 1.0, 2.0])
            .with_doubles("Intensity", vec![10.0, f64::NAN, -3.5]),
    );
    m.put_segment_table("T", "Intensity", DataTable::new().with_doubles("Rate", vec![0.1, 0.2]));
    m
}

fn metadata(uid: &str) -> Metadata {
    let mut md = Metadata::new(uid);
    md.microscope = "TIRF-1".to_string();
    md.source_directory = "/data/run7".to_string();
    md.collection_date = "2024-03-01".to_string();
    md.add_tag("calibrated");
    md
}

fn fs_store(dir: &TempDir) -> Arc<dyn KvStore> {
    Arc::new(FsStore::open(dir.path()).unwrap())
}

#[test]
fn test_virtual_fs_full_cycle_both_encodings() {
    for encoding in Encoding::ALL {
        let dir = TempDir::new().unwrap();
        let archive = MoleculeArchive::create_virtual(fs_store(&dir), ArchiveKind::SingleMolecule, config(encoding)).unwrap();
        archive.put_metadata(metadata("md1")).unwrap();
        archive.put_molecule(molecule("a", "md1", "good")).unwrap();
        archive.put_molecule(molecule("b", "md1", "bad")).unwrap();
        archive.save().unwrap();

        let reopened = MoleculeArchive::open_virtual(fs_store(&dir), ArchiveConfig::default()).unwrap();
        assert_eq!(reopened.encoding(), encoding);
        assert_eq!(reopened.mode(), StorageMode::Virtual);
        assert_eq!(*reopened.get_molecule("a").unwrap(), molecule("a", "md1", "good"));
        assert_eq!(*reopened.get_metadata("md1").unwrap(), metadata("md1"));
        assert_eq!(reopened.molecule_uids_with_tag("bad"), vec!["b"]);
        assert_eq!(reopened.index().molecule_image("a"), Some(7));
        assert_eq!(reopened.properties().segment_table_names().len(), 1);
        assert_eq!(reopened.properties().columns(), vec!["Intensity", "T"]);
    }
}

#[test]
fn test_virtual_s3_backend() {
    let client = Arc::new(MemoryObjectClient::with_page_size(2));
    let store: Arc<dyn KvStore> = Arc::new(S3Store::create(client.clone(), "archives").unwrap());
    let archive = MoleculeArchive::create_virtual(store, ArchiveKind::Dna, config(Encoding::Binary)).unwrap();
    archive.put_metadata(metadata("md1")).unwrap();
    for i in 0..5 {
        archive
            .put_molecule(molecule(&format!("m{i}"), "md1", "good"))
            .unwrap();
    }
    archive.save().unwrap();

    let store: Arc<dyn KvStore> = Arc::new(S3Store::open(client.clone(), "archives").unwrap());
    assert!(store.is_file("Molecules/m3.sml").unwrap());
    let reopened = MoleculeArchive::open_virtual(store, ArchiveConfig::default()).unwrap();
    assert_eq!(reopened.archive_type(), ArchiveKind::Dna);
    assert_eq!(reopened.number_of_molecules(), 5);
    assert_eq!(reopened.molecule_uids_for_metadata("md1").len(), 5);

    let report = reopened.rebuild_indexes().unwrap();
    assert_eq!(report.molecules, 5);
    assert_eq!(report.metadata, 1);
    assert_eq!(report.failed, 0);
    assert!(reopened.remove_molecule("m0").unwrap());
    assert!(reopened.get_molecule("m0").is_none());
}

#[test]
fn test_missing_bucket_fails_fast() {
    let client = Arc::new(MemoryObjectClient::new());
    assert!(S3Store::open(client, "nothing").is_err());
}

#[test]
fn test_concurrent_put_same_uid_never_tears() {
    let dir = TempDir::new().unwrap();
    let archive = MoleculeArchive::create_virtual(fs_store(&dir), ArchiveKind::SingleMolecule, config(Encoding::Text)).unwrap();
    let versions: Vec<Molecule> = (0..8)
        .map(|v| {
            let mut m = Molecule::new("shared");
            m.set_table(DataTable::new().with_doubles("T", vec![v as f64; 20_000]));
            m.set_notes(&format!("version {v}"));
            m.add_tag(&format!("v{v}"));
            m
        })
        .collect();
    let all = &versions;

    std::thread::scope(|s| {
        for version in all {
            let archive = &archive;
            s.spawn(move || {
                for _ in 0..5 {
                    archive.put_molecule(version.clone()).unwrap();
                    let read = archive.get_molecule("shared").unwrap();
                    assert!(all.contains(&read));
                }
            });
        }
    });

    let last = archive.get_molecule("shared").unwrap();
    assert!(versions.contains(&last));
    assert_eq!(archive.number_of_molecules(), 1);
    // The index must describe the version that won on disk.
    for v in 0..8 {
        let tag = format!("v{v}");
        let indexed = archive.molecule_uids_with_tag(&tag) == vec!["shared"];
        assert_eq!(indexed, last.has_tag(&tag), "{tag}");
    }
}

#[test]
fn test_concurrent_put_distinct_uids() {
    let archive = MoleculeArchive::new_in_memory("mem", ArchiveKind::SingleMolecule);
    std::thread::scope(|s| {
        for t in 0..4 {
            let archive = &archive;
            s.spawn(move || {
                for i in 0..50 {
                    archive
                        .put_molecule(molecule(&format!("t{t}-{i:02}"), "md1", &format!("thread{t}")))
                        .unwrap();
                }
            });
        }
    });
    assert_eq!(archive.number_of_molecules(), 200);
    assert_eq!(archive.molecule_uids().len(), 200);
    assert_eq!(archive.properties().number_of_molecules(), 200);
    assert_eq!(archive.properties().tags().len(), 4);
}

#[test]
fn test_rebuild_agrees_with_backend() {
    let dir = TempDir::new().unwrap();
    let archive = MoleculeArchive::create_virtual(fs_store(&dir), ArchiveKind::SingleMolecule, config(Encoding::Binary)).unwrap();
    for i in 0..12 {
        archive
            .put_molecule(molecule(&format!("m{i:02}"), "md1", "good"))
            .unwrap();
    }
    std::fs::remove_file(dir.path().join("Molecules/m04.sml")).unwrap();
    std::fs::remove_file(dir.path().join("Molecules/m05.sml")).unwrap();

    archive.rebuild_indexes().unwrap();
    let mut on_disk: Vec<String> = std::fs::read_dir(dir.path().join("Molecules"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().trim_end_matches(".sml").to_string())
        .collect();
    on_disk.sort();
    assert_eq!(archive.molecule_uids(), on_disk);
    assert_eq!(archive.properties().number_of_molecules(), 10);
}

#[test]
fn test_missing_and_empty_records_leave_index_alone() {
    let dir = TempDir::new().unwrap();
    let archive = MoleculeArchive::create_virtual(fs_store(&dir), ArchiveKind::SingleMolecule, config(Encoding::Text)).unwrap();
    archive.put_molecule(molecule("a", "md1", "good")).unwrap();
    archive.put_molecule(molecule("b", "md1", "good")).unwrap();
    std::fs::write(dir.path().join("Molecules/a.json"), b"").unwrap();
    std::fs::remove_file(dir.path().join("Molecules/b.json")).unwrap();

    assert!(archive.get_molecule("a").is_none());
    assert!(archive.get_molecule("b").is_none());
    assert_eq!(archive.molecule_uids(), vec!["a", "b"]);
    assert_eq!(archive.index().molecule_channel("a"), Some(2));
}

#[test]
fn test_unknown_fields_are_tolerated() {
    let dir = TempDir::new().unwrap();
    let archive = MoleculeArchive::create_virtual(fs_store(&dir), ArchiveKind::SingleMolecule, config(Encoding::Text)).unwrap();
    std::fs::write(
        dir.path().join("Molecules/x.json"),
        r#"{
            "UID": "x",
            "FutureField": {"deeply": [{"nested": true}]},
            "Tags": ["kept"],
            "Channel": "not a number",
            "Parameters": {"rate": "NaN", "k": 2}
        }"#,
    )
    .unwrap();

    let m = archive.get_molecule("x").unwrap();
    assert!(m.has_tag("kept"));
    assert_eq!(m.channel, None);
    assert!(m.parameter("rate").unwrap().is_nan());
    assert_eq!(m.parameter("k"), Some(2.0));
}

#[test]
fn test_export_to_virtual_and_back_to_file() {
    let archive = MoleculeArchive::new_in_memory("mem", ArchiveKind::Arch);
    archive.put_metadata(metadata("md1")).unwrap();
    for i in 0..20 {
        archive
            .put_molecule(molecule(&format!("m{i:02}"), "md1", "good"))
            .unwrap();
    }

    let dir = TempDir::new().unwrap();
    let report = archive
        .save_as_virtual_store(fs_store(&dir), Encoding::Text)
        .unwrap();
    assert_eq!(report.succeeded(), 21);

    let virt = MoleculeArchive::open_virtual(fs_store(&dir), ArchiveConfig::default()).unwrap();
    let file = dir.path().join("copy.sml");
    virt.save_as(&file, Encoding::Binary).unwrap();
    let back = MoleculeArchive::open_file(&file, ArchiveConfig::default()).unwrap();
    assert_eq!(back.molecule_uids(), archive.molecule_uids());
    assert_eq!(*back.get_molecule("m07").unwrap(), *archive.get_molecule("m07").unwrap());
    assert_eq!(back.archive_type(), ArchiveKind::Arch);
}

#[test]
fn test_merge_virtual_into_memory() {
    let dir = TempDir::new().unwrap();
    let other = MoleculeArchive::create_virtual(fs_store(&dir), ArchiveKind::SingleMolecule, config(Encoding::Text)).unwrap();
    other.put_metadata(metadata("md2")).unwrap();
    other.put_molecule(molecule("z", "md2", "other")).unwrap();
    other.properties().set_comments("second run");

    let archive = MoleculeArchive::new_in_memory("mem", ArchiveKind::SingleMolecule);
    archive.put_molecule(molecule("a", "md1", "mine")).unwrap();
    let report = archive.merge_from(&other, "run 2").unwrap();
    assert_eq!(report.molecules, 1);
    assert_eq!(archive.molecule_uids(), vec!["a", "z"]);
    assert_eq!(archive.properties().comments(), "# run 2\nsecond run");
}

struct CountingLock {
    locks: AtomicUsize,
    unlocks: AtomicUsize,
}

impl WindowLock for CountingLock {
    fn lock(&self) {
        self.locks.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_window_lock_wraps_bulk_operations() {
    let hook = Arc::new(CountingLock {
        locks: AtomicUsize::new(0),
        unlocks: AtomicUsize::new(0),
    });
    let archive = MoleculeArchive::new_in_memory("mem", ArchiveKind::SingleMolecule).with_window_lock(hook.clone());
    archive.put_molecule(molecule("a", "md1", "good")).unwrap();
    assert_eq!(hook.locks.load(Ordering::SeqCst), 0);

    let dir = TempDir::new().unwrap();
    archive.rebuild_indexes().unwrap();
    archive.save_as(dir.path().join("a.json"), Encoding::Text).unwrap();
    archive
        .save_as_virtual_store(Arc::new(FsStore::create(dir.path().join("v")).unwrap()), Encoding::Text)
        .unwrap();
    assert_eq!(hook.locks.load(Ordering::SeqCst), 3);
    assert_eq!(hook.unlocks.load(Ordering::SeqCst), 3);
}
