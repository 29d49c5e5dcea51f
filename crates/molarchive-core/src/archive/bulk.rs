//! Whole-archive passes run on a bounded worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use molarchive_kv::KvStore;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{error, info};

use crate::archive::{write_meta_files, MoleculeArchive, Slot, Storage};
use crate::encoding::Encoding;
use crate::error::{ArchiveError, ArchiveResult};
use crate::index::ArchiveIndex;
use crate::layout::VirtualLayout;
use crate::metadata::Metadata;
use crate::molecule::Molecule;
use crate::properties::ArchiveProperties;
use crate::protocol;
use crate::record::RecordKind;

/// Outcome of a bulk operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    /// Molecules processed successfully.
    pub molecules: usize,
    /// Metadata records processed successfully.
    pub metadata: usize,
    /// Records that could not be loaded.
    pub failed: usize,
}

impl BulkReport {
    /// Records processed successfully.
    pub fn succeeded(&self) -> usize {
        self.molecules + self.metadata
    }
}

pub(crate) fn worker_pool(threads: usize) -> ArchiveResult<rayon::ThreadPool> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads.max(1))
        .thread_name(|i| format!("molarchive-bulk-{i}"))
        .build()
        .map_err(|e| ArchiveError::WorkerPool(e.to_string()))
}

fn sorted_keys<V>(map: &DashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.iter().map(|e| e.key().clone()).collect();
    keys.sort();
    keys
}

/// Accumulators shared by the workers of one pass.
struct Pass {
    index: ArchiveIndex,
    properties: ArchiveProperties,
    molecules: AtomicUsize,
    metadata: AtomicUsize,
    failed: AtomicUsize,
}

impl Pass {
    fn new(properties: ArchiveProperties) -> Self {
        Self {
            index: ArchiveIndex::new(),
            properties,
            molecules: AtomicUsize::new(0),
            metadata: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
        }
    }

    fn record<R: Slot>(&self, record: &R) {
        R::index_add(&self.index, record);
        R::absorb(&self.properties, record);
        let counter = match R::KIND {
            RecordKind::Molecule => &self.molecules,
            RecordKind::Metadata => &self.metadata,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn fail<R: Slot>(&self, uid: &str, operation: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        error!(kind = %R::KIND, uid, operation, "record could not be loaded");
    }

    fn report(&self) -> BulkReport {
        BulkReport {
            molecules: self.molecules.load(Ordering::Relaxed),
            metadata: self.metadata.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl MoleculeArchive {
    /// Recomputes the index and every property union from the records
    /// themselves, then persists (virtual archives).
    ///
    /// Each record is loaded once on the worker pool. A record that fails to
    /// load keeps its UID in the index but contributes nothing else.
    pub fn rebuild_indexes(&self) -> ArchiveResult<BulkReport> {
        let _window = self.window_guard();
        let started = Instant::now();
        let (metadata_uids, molecule_uids) = match &self.storage {
            Storage::Virtual { store, layout } => (
                layout.list_uids(store.as_ref(), RecordKind::Metadata)?,
                layout.list_uids(store.as_ref(), RecordKind::Molecule)?,
            ),
            Storage::InMemory(records) => (
                sorted_keys(&records.metadata),
                sorted_keys(&records.molecules),
            ),
        };

        let pass = Pass::new(ArchiveProperties::new(self.properties.archive_type()));
        worker_pool(self.config.workers())?.install(|| {
            metadata_uids
                .par_iter()
                .for_each(|uid| self.reindex_one::<Metadata>(uid, &pass));
            molecule_uids
                .par_iter()
                .for_each(|uid| self.reindex_one::<Molecule>(uid, &pass));
        });
        pass.properties
            .set_number_of_metadata(metadata_uids.len() as u64);
        pass.properties
            .set_number_of_molecules(molecule_uids.len() as u64);

        self.index.replace_with(&pass.index);
        self.metadata_list.lock().reconcile(&metadata_uids);
        self.molecule_list.lock().reconcile(&molecule_uids);
        self.properties.replace_sets_from(&pass.properties);

        if let Storage::Virtual { store, layout } = &self.storage {
            write_meta_files(store.as_ref(), layout, &self.properties, &self.index)?;
        }

        let report = pass.report();
        info!(
            archive = %self.name,
            molecules = molecule_uids.len(),
            metadata = metadata_uids.len(),
            failed = report.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rebuilt indexes"
        );
        Ok(report)
    }

    fn reindex_one<R: Slot>(&self, uid: &str, pass: &Pass) {
        match self.get::<R>(uid) {
            Some(record) => pass.record(record.as_ref()),
            None => {
                R::index_insert_uid(&pass.index, uid);
                pass.fail::<R>(uid, "rebuild");
            }
        }
    }

    /// Writes every record to `dest` as a new virtual store in `encoding`,
    /// together with properties and index computed in the same pass.
    ///
    /// The live archive keeps its mode. Records that fail to load are
    /// skipped and counted; a write failure aborts the export.
    pub fn save_as_virtual_store(&self, dest: Arc<dyn KvStore>, encoding: Encoding) -> ArchiveResult<BulkReport> {
        let _window = self.window_guard();
        if VirtualLayout::existing(dest.as_ref())?.is_some() {
            return Err(ArchiveError::AlreadyExists {
                root: dest.root().to_string(),
            });
        }
        let started = Instant::now();
        let layout = VirtualLayout::new(encoding);
        dest.create_directories(RecordKind::Molecule.directory())?;
        dest.create_directories(RecordKind::Metadata.directory())?;

        let properties = ArchiveProperties::new(self.properties.archive_type());
        for name in self.properties.document_names() {
            if let Some(content) = self.properties.document(&name) {
                properties.set_document(&name, &content);
            }
        }
        let pass = Pass::new(properties);
        let metadata_uids = self.metadata_list.lock().to_vec();
        let molecule_uids = self.molecule_list.lock().to_vec();

        worker_pool(self.config.workers())?.install(|| -> ArchiveResult<()> {
            metadata_uids
                .par_iter()
                .try_for_each(|uid| self.export_one::<Metadata>(uid, dest.as_ref(), &layout, &pass))?;
            molecule_uids
                .par_iter()
                .try_for_each(|uid| self.export_one::<Molecule>(uid, dest.as_ref(), &layout, &pass))
        })?;

        let report = pass.report();
        pass.properties
            .set_number_of_metadata(report.metadata as u64);
        pass.properties
            .set_number_of_molecules(report.molecules as u64);
        write_meta_files(dest.as_ref(), &layout, &pass.properties, &pass.index)?;
        info!(
            archive = %self.name,
            dest = %dest.root(),
            %encoding,
            molecules = report.molecules,
            metadata = report.metadata,
            failed = report.failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "exported virtual store"
        );
        Ok(report)
    }

    fn export_one<R: Slot>(
        &self,
        uid: &str,
        dest: &dyn KvStore,
        layout: &VirtualLayout,
        pass: &Pass,
    ) -> ArchiveResult<()> {
        let Some(record) = self.get::<R>(uid) else {
            pass.fail::<R>(uid, "export");
            return Ok(());
        };
        let bytes = protocol::encode(record.as_ref(), layout.encoding())?;
        dest.write_bytes(&layout.record_path(R::KIND, record.uid()), &bytes)?;
        pass.record(record.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ArchiveConfig;
    use crate::archive::WindowLock;
    use crate::kind::ArchiveKind;
    use crate::record::ArchiveRecord;
    use molarchive_kv::FsStore;
    use std::sync::atomic::AtomicBool;
    use tempfile::TempDir;

    fn config(encoding: Encoding) -> ArchiveConfig {
        ArchiveConfig {
            encoding,
            worker_threads: Some(4),
            ..ArchiveConfig::default()
        }
    }

    fn molecule(i: usize) -> Molecule {
        let mut m = Molecule::new(format!("m{i:03}")).with_metadata_uid("md1");
        m.add_tag(if i % 2 == 0 { "even" } else { "odd" });
        m.set_parameter(&format!("p{}", i % 3), i as f64);
        m.channel = Some((i % 2) as i32);
        m
    }

    #[test]
    fn test_worker_pool_size() {
        let pool = worker_pool(3).unwrap();
        assert_eq!(pool.current_num_threads(), 3);
        assert_eq!(worker_pool(0).unwrap().current_num_threads(), 1);
    }

    #[test]
    fn test_rebuild_in_memory_recomputes_exactly() {
        let archive = MoleculeArchive::new_in_memory("mem", ArchiveKind::SingleMolecule).with_config(config(Encoding::Binary));
        for i in 0..10 {
            archive.put_molecule(molecule(i)).unwrap();
        }
        archive.put_metadata(Metadata::new("md1")).unwrap();
        archive.properties().add_all_tags(["stale"]);

        let report = archive.rebuild_indexes().unwrap();
        assert_eq!(report, BulkReport { molecules: 10, metadata: 1, failed: 0 });
        assert_eq!(archive.properties().tags(), vec!["even", "odd"]);
        assert_eq!(archive.properties().parameters(), vec!["p0", "p1", "p2"]);
        assert_eq!(archive.properties().channels(), vec![0, 1]);
        assert_eq!(archive.properties().number_of_molecules(), 10);
        assert_eq!(archive.molecule_uids_with_tag("odd").len(), 5);
    }

    #[test]
    fn test_rebuild_virtual_matches_files() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn KvStore> = Arc::new(FsStore::open(dir.path()).unwrap());
        let archive = MoleculeArchive::create_virtual(store, ArchiveKind::SingleMolecule, config(Encoding::Text)).unwrap();
        for i in 0..6 {
            archive.put_molecule(molecule(i)).unwrap();
        }
        std::fs::remove_file(dir.path().join("Molecules/m002.json")).unwrap();
        std::fs::write(dir.path().join("Molecules/extra.json"), br#"{"UID": "extra", "Tags": ["new"]}"#).unwrap();
        std::fs::write(dir.path().join("Molecules/broken.json"), b"{\"UID\": 5").unwrap();

        let report = archive.rebuild_indexes().unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.molecules, 6);
        assert_eq!(
            archive.molecule_uids(),
            vec!["broken", "extra", "m000", "m001", "m003", "m004", "m005"]
        );
        assert!(archive.properties().tags().contains(&"new".to_string()));
        assert_eq!(archive.number_of_molecules(), 7);
        assert!(archive.index().molecule_tags("broken").is_none());
    }

    #[test]
    fn test_save_as_virtual_store_round_trip() {
        let archive = MoleculeArchive::new_in_memory("mem", ArchiveKind::Dna);
        for i in 0..8 {
            archive.put_molecule(molecule(i)).unwrap();
        }
        archive.put_metadata(Metadata::new("md1")).unwrap();
        archive.properties().set_comments("exported");

        let dir = TempDir::new().unwrap();
        let dest: Arc<dyn KvStore> = Arc::new(FsStore::open(dir.path()).unwrap());
        let report = archive.save_as_virtual_store(dest.clone(), Encoding::Binary).unwrap();
        assert_eq!(report, BulkReport { molecules: 8, metadata: 1, failed: 0 });
        assert!(dir.path().join("Molecules/m000.sml").is_file());
        assert!(dir.path().join("MoleculeArchiveProperties.sml").is_file());
        assert_eq!(archive.mode(), crate::archive::StorageMode::InMemory);

        let reopened = MoleculeArchive::open_virtual(dest.clone(), ArchiveConfig::default()).unwrap();
        assert_eq!(reopened.archive_type(), ArchiveKind::Dna);
        assert_eq!(reopened.molecule_uids().len(), 8);
        assert_eq!(reopened.properties().comments(), "exported");
        assert_eq!(*reopened.get_molecule("m003").unwrap(), molecule(3));

        let err = archive.save_as_virtual_store(dest, Encoding::Binary).unwrap_err();
        assert!(matches!(err, ArchiveError::AlreadyExists { .. }));
    }

    #[test]
    fn test_bulk_holds_window_lock() {
        struct Flag(AtomicBool, AtomicUsize);
        impl WindowLock for Flag {
            fn lock(&self) {
                self.0.store(true, Ordering::SeqCst);
                self.1.fetch_add(1, Ordering::SeqCst);
            }
            fn unlock(&self) {
                self.0.store(false, Ordering::SeqCst);
            }
        }
        let flag = Arc::new(Flag(AtomicBool::new(false), AtomicUsize::new(0)));
        let archive = MoleculeArchive::new_in_memory("mem", ArchiveKind::SingleMolecule).with_window_lock(flag.clone());
        archive.put_molecule(molecule(1)).unwrap();
        archive.rebuild_indexes().unwrap();
        assert_eq!(flag.1.load(Ordering::SeqCst), 1);
        assert!(!flag.0.load(Ordering::SeqCst));
    }
}
