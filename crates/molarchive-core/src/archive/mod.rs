//! Archive orchestrator.
//!
//! A [`MoleculeArchive`] is either **in memory** (records held in concurrent
//! maps, optionally loaded from and saved back to a single file) or
//! **virtual** (one file per record in a [`KvStore`], read back on every
//! `get`). The mode is fixed at construction.

pub mod bulk;
mod locks;
mod single_file;
mod uid_list;
pub mod window;

pub use bulk::BulkReport;
pub use window::{WindowGuard, WindowLock};

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use molarchive_kv::KvStore;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ArchiveConfig;
use crate::encoding::Encoding;
use crate::error::{ArchiveError, ArchiveResult};
use crate::index::{ArchiveIndex, IndexSnapshot};
use crate::kind::{ArchiveKind, ArchiveTypeRegistry};
use crate::layout::{check_uid, VirtualLayout};
use crate::metadata::Metadata;
use crate::molecule::Molecule;
use crate::properties::{ArchiveProperties, PropertiesSnapshot};
use crate::protocol::{self, Protocol};
use crate::record::{ArchiveRecord, RecordKind};

use locks::UidLocks;
use uid_list::UidList;

/// Where an archive keeps its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Records live in process memory.
    InMemory,
    /// Records live one-per-file in a key-value store.
    Virtual,
}

#[derive(Debug, Default)]
pub(crate) struct MemoryRecords {
    molecules: DashMap<String, Arc<Molecule>>,
    metadata: DashMap<String, Arc<Metadata>>,
}

enum Storage {
    InMemory(MemoryRecords),
    Virtual {
        store: Arc<dyn KvStore>,
        layout: VirtualLayout,
    },
}

/// Per-kind plumbing: which map, index entries and property unions a
/// record type touches.
pub(crate) trait Slot: ArchiveRecord {
    fn memory(records: &MemoryRecords) -> &DashMap<String, Arc<Self>>;
    fn index_add(index: &ArchiveIndex, record: &Self);
    fn index_insert_uid(index: &ArchiveIndex, uid: &str);
    fn index_remove(index: &ArchiveIndex, uid: &str) -> bool;
    fn absorb(properties: &ArchiveProperties, record: &Self);
    fn set_count(properties: &ArchiveProperties, count: u64);
}

impl Slot for Molecule {
    fn memory(records: &MemoryRecords) -> &DashMap<String, Arc<Self>> {
        &records.molecules
    }

    fn index_add(index: &ArchiveIndex, record: &Self) {
        index.add_molecule(record);
    }

    fn index_insert_uid(index: &ArchiveIndex, uid: &str) {
        index.insert_molecule_uid(uid);
    }

    fn index_remove(index: &ArchiveIndex, uid: &str) -> bool {
        index.remove_molecule(uid)
    }

    fn absorb(properties: &ArchiveProperties, record: &Self) {
        properties.absorb_molecule(record);
    }

    fn set_count(properties: &ArchiveProperties, count: u64) {
        properties.set_number_of_molecules(count);
    }
}

impl Slot for Metadata {
    fn memory(records: &MemoryRecords) -> &DashMap<String, Arc<Self>> {
        &records.metadata
    }

    fn index_add(index: &ArchiveIndex, record: &Self) {
        index.add_metadata(record);
    }

    fn index_insert_uid(index: &ArchiveIndex, uid: &str) {
        index.insert_metadata_uid(uid);
    }

    fn index_remove(index: &ArchiveIndex, uid: &str) -> bool {
        index.remove_metadata(uid)
    }

    fn absorb(properties: &ArchiveProperties, record: &Self) {
        properties.absorb_metadata(record);
    }

    fn set_count(properties: &ArchiveProperties, count: u64) {
        properties.set_number_of_metadata(count);
    }
}

/// A collection of molecule and metadata records with its index and
/// archive-wide properties.
pub struct MoleculeArchive {
    name: String,
    storage: Storage,
    encoding: Encoding,
    source: Option<PathBuf>,
    index: ArchiveIndex,
    properties: ArchiveProperties,
    molecule_list: Mutex<UidList>,
    metadata_list: Mutex<UidList>,
    locks: UidLocks,
    window: Option<Arc<dyn WindowLock>>,
    config: ArchiveConfig,
}

impl MoleculeArchive {
    fn assemble(
        name: String,
        storage: Storage,
        encoding: Encoding,
        properties: ArchiveProperties,
        index: ArchiveIndex,
        config: ArchiveConfig,
    ) -> Self {
        let molecule_list = UidList::from_sorted(index.molecule_uids());
        let metadata_list = UidList::from_sorted(index.metadata_uids());
        Self {
            name,
            storage,
            encoding,
            source: None,
            index,
            properties,
            molecule_list: Mutex::new(molecule_list),
            metadata_list: Mutex::new(metadata_list),
            locks: UidLocks::default(),
            window: None,
            config,
        }
    }

    /// Creates an empty in-memory archive using the default configuration.
    pub fn new_in_memory(name: &str, kind: ArchiveKind) -> Self {
        let config = ArchiveConfig::default();
        Self::assemble(
            name.to_string(),
            Storage::InMemory(MemoryRecords::default()),
            config.encoding,
            ArchiveProperties::new(kind),
            ArchiveIndex::new(),
            config,
        )
    }

    /// Applies a configuration. An in-memory archive that was not loaded
    /// from a file also adopts the configured encoding.
    pub fn with_config(mut self, config: ArchiveConfig) -> Self {
        if self.mode() == StorageMode::InMemory && self.source.is_none() {
            self.encoding = config.encoding;
        }
        self.config = config;
        self
    }

    /// Installs a hook held for the duration of bulk operations.
    pub fn with_window_lock(mut self, lock: Arc<dyn WindowLock>) -> Self {
        self.window = Some(lock);
        self
    }

    /// Loads a single-file archive into memory. The encoding is detected
    /// from the file and reused by [`MoleculeArchive::save`].
    pub fn open_file(path: impl AsRef<Path>, config: ArchiveConfig) -> ArchiveResult<Self> {
        let path = path.as_ref();
        let origin = path.display().to_string();
        let types = config.type_registry()?;
        let mut reader = BufReader::new(File::open(path)?);
        let encoding = Encoding::sniff(&mut reader)?
            .ok_or_else(|| ArchiveError::UnknownEncoding {
                origin: origin.clone(),
            })?;

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| origin.clone());
        let mut archive = Self::assemble(
            name,
            Storage::InMemory(MemoryRecords::default()),
            encoding,
            ArchiveProperties::default(),
            ArchiveIndex::new(),
            config,
        );
        archive.source = Some(path.to_path_buf());

        let snapshot = single_file::read_into(&archive, reader, encoding, &origin)?;
        archive.adopt_properties(snapshot, &types)?;
        info!(
            archive = %archive.name,
            %encoding,
            molecules = archive.number_of_molecules(),
            metadata = archive.number_of_metadata(),
            "opened archive file"
        );
        Ok(archive)
    }

    /// Opens an existing virtual store. The encoding is detected by probing
    /// for the properties file. A store without an index file is reindexed
    /// when `index_on_open` is set.
    pub fn open_virtual(store: Arc<dyn KvStore>, config: ArchiveConfig) -> ArchiveResult<Self> {
        let layout = VirtualLayout::detect(store.as_ref())?;
        let encoding = layout.encoding();
        let types = config.type_registry()?;

        let snapshot: PropertiesSnapshot =
            read_snapshot(store.as_ref(), &layout.properties_path(), encoding)?;
        let properties = ArchiveProperties::from_snapshot(snapshot, &types)?;

        let index_path = layout.index_path();
        let index = match store.file_size(&index_path)? {
            Some(size) if size > 0 => Some(ArchiveIndex::from_snapshot(read_snapshot::<IndexSnapshot>(
                store.as_ref(),
                &index_path,
                encoding,
            )?)),
            _ => None,
        };
        let has_index = index.is_some();

        let name = store.root().to_string();
        let rebuild = !has_index && config.index_on_open;
        let archive = Self::assemble(
            name,
            Storage::Virtual { store, layout },
            encoding,
            properties,
            index.unwrap_or_default(),
            config,
        );
        if rebuild {
            warn!(archive = %archive.name, "no index file, rebuilding");
            archive.rebuild_indexes()?;
        } else if !has_index {
            warn!(archive = %archive.name, "no index file, opened with an empty index");
        }
        info!(
            archive = %archive.name,
            %encoding,
            molecules = archive.index.molecule_count(),
            metadata = archive.index.metadata_count(),
            "opened virtual store"
        );
        Ok(archive)
    }

    /// Initializes a new, empty archive in `store` using the configured
    /// encoding. Fails if the store already holds an archive.
    pub fn create_virtual(store: Arc<dyn KvStore>, kind: ArchiveKind, config: ArchiveConfig) -> ArchiveResult<Self> {
        if VirtualLayout::existing(store.as_ref())?.is_some() {
            return Err(ArchiveError::AlreadyExists {
                root: store.root().to_string(),
            });
        }
        let layout = VirtualLayout::new(config.encoding);
        store.create_directories(RecordKind::Molecule.directory())?;
        store.create_directories(RecordKind::Metadata.directory())?;

        let name = store.root().to_string();
        let archive = Self::assemble(
            name,
            Storage::Virtual { store, layout },
            config.encoding,
            ArchiveProperties::new(kind),
            ArchiveIndex::new(),
            config,
        );
        archive.save()?;
        info!(archive = %archive.name, encoding = %archive.encoding, "created virtual store");
        Ok(archive)
    }

    /// Display name (file stem or store root).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage mode.
    pub fn mode(&self) -> StorageMode {
        match self.storage {
            Storage::InMemory(_) => StorageMode::InMemory,
            Storage::Virtual { .. } => StorageMode::Virtual,
        }
    }

    /// Encoding used for every write of this archive.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// File the archive was loaded from, for in-memory archives.
    pub fn source_path(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Backing store, for virtual archives.
    pub fn store(&self) -> Option<&Arc<dyn KvStore>> {
        match &self.storage {
            Storage::Virtual { store, .. } => Some(store),
            Storage::InMemory(_) => None,
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Archive index.
    pub fn index(&self) -> &ArchiveIndex {
        &self.index
    }

    /// Archive properties.
    pub fn properties(&self) -> &ArchiveProperties {
        &self.properties
    }

    /// Archive type.
    pub fn archive_type(&self) -> ArchiveKind {
        self.properties.archive_type()
    }

    /// Number of molecules.
    pub fn number_of_molecules(&self) -> usize {
        self.molecule_list.lock().len()
    }

    /// Number of metadata records.
    pub fn number_of_metadata(&self) -> usize {
        self.metadata_list.lock().len()
    }

    /// Stores a molecule, replacing any record with the same UID.
    pub fn put_molecule(&self, molecule: Molecule) -> ArchiveResult<()> {
        self.put(molecule)
    }

    /// Stores a metadata record, replacing any record with the same UID.
    pub fn put_metadata(&self, metadata: Metadata) -> ArchiveResult<()> {
        self.put(metadata)
    }

    /// Loads a molecule. Missing, empty or corrupt records yield `None`.
    pub fn get_molecule(&self, uid: &str) -> Option<Arc<Molecule>> {
        self.get(uid)
    }

    /// Loads a metadata record. Missing, empty or corrupt records yield `None`.
    pub fn get_metadata(&self, uid: &str) -> Option<Arc<Metadata>> {
        self.get(uid)
    }

    /// Deletes a molecule. Returns true if it existed.
    pub fn remove_molecule(&self, uid: &str) -> ArchiveResult<bool> {
        self.remove::<Molecule>(uid)
    }

    /// Deletes a metadata record. Returns true if it existed.
    pub fn remove_metadata(&self, uid: &str) -> ArchiveResult<bool> {
        self.remove::<Metadata>(uid)
    }

    /// Sorted molecule UIDs, from the index.
    pub fn molecule_uids(&self) -> Vec<String> {
        self.index.molecule_uids()
    }

    /// Sorted metadata UIDs, from the index.
    pub fn metadata_uids(&self) -> Vec<String> {
        self.index.metadata_uids()
    }

    /// Molecule UIDs carrying `tag`, from the index.
    pub fn molecule_uids_with_tag(&self, tag: &str) -> Vec<String> {
        self.index.molecule_uids_with_tag(tag)
    }

    /// Molecule UIDs referring to a metadata record, from the index.
    pub fn molecule_uids_for_metadata(&self, metadata_uid: &str) -> Vec<String> {
        self.index.molecule_uids_for_metadata(metadata_uid)
    }

    /// Index membership test.
    pub fn contains_molecule(&self, uid: &str) -> bool {
        self.index.contains_molecule_uid(uid)
    }

    /// Index membership test.
    pub fn contains_metadata(&self, uid: &str) -> bool {
        self.index.contains_metadata_uid(uid)
    }

    /// Persists the archive in place: an in-memory archive rewrites its
    /// source file, a virtual archive writes its properties and index files.
    pub fn save(&self) -> ArchiveResult<()> {
        match &self.storage {
            Storage::InMemory(_) => {
                let path = self.source.as_deref().ok_or(ArchiveError::NoSourceFile)?;
                self.save_as(path, self.encoding)
            }
            Storage::Virtual { store, layout } => {
                write_meta_files(store.as_ref(), layout, &self.properties, &self.index)?;
                debug!(archive = %self.name, "saved properties and index");
                Ok(())
            }
        }
    }

    /// Writes the whole archive to a single file in `encoding`.
    pub fn save_as(&self, path: impl AsRef<Path>, encoding: Encoding) -> ArchiveResult<()> {
        let _window = self.window_guard();
        single_file::write_to_path(self, path.as_ref(), encoding)
    }

    /// Copies every record of `other` into this archive and merges its
    /// properties, appending its comments under `label`.
    ///
    /// Nothing is copied if any UID of `other` already exists here.
    pub fn merge_from(&self, other: &MoleculeArchive, label: &str) -> ArchiveResult<BulkReport> {
        let _window = self.window_guard();
        let mut collisions: Vec<String> = other
            .metadata_uids()
            .into_iter()
            .filter(|uid| self.contains_metadata(uid))
            .collect();
        collisions.extend(
            other
                .molecule_uids()
                .into_iter()
                .filter(|uid| self.contains_molecule(uid)),
        );
        if let Some(first) = collisions.first() {
            return Err(ArchiveError::UidCollision {
                uid: first.clone(),
                count: collisions.len(),
            });
        }

        let metadata_uids = other.metadata_list.lock().to_vec();
        let molecule_uids = other.molecule_list.lock().to_vec();
        let mut report = BulkReport::default();
        for uid in metadata_uids {
            match other.get::<Metadata>(&uid) {
                Some(record) => {
                    self.put(Metadata::clone(&record))?;
                    report.metadata += 1;
                }
                None => report.failed += 1,
            }
        }
        for uid in molecule_uids {
            match other.get::<Molecule>(&uid) {
                Some(record) => {
                    self.put(Molecule::clone(&record))?;
                    report.molecules += 1;
                }
                None => report.failed += 1,
            }
        }
        self.properties.union_from(&other.properties);
        self.properties
            .append_comments(label, &other.properties.comments());
        info!(
            archive = %self.name,
            from = %other.name,
            label,
            molecules = report.molecules,
            metadata = report.metadata,
            failed = report.failed,
            "merged archive"
        );
        Ok(report)
    }

    pub(crate) fn window_guard(&self) -> WindowGuard<'_> {
        WindowGuard::acquire(self.window.as_deref())
    }

    fn uid_list<R: Slot>(&self) -> &Mutex<UidList> {
        match R::KIND {
            RecordKind::Molecule => &self.molecule_list,
            RecordKind::Metadata => &self.metadata_list,
        }
    }

    /// Stores `record`: backend first, then the UID list, count, index and
    /// property unions, all under the record's UID lock.
    pub(crate) fn put<R: Slot>(&self, record: R) -> ArchiveResult<()> {
        let uid = record.uid().to_string();
        check_uid(&uid).map_err(|e| match e {
            ArchiveError::InvalidRecord { reason } => ArchiveError::InvalidRecord {
                reason: format!("{} record: {reason}", R::KIND),
            },
            other => other,
        })?;

        match &self.storage {
            Storage::InMemory(records) => {
                let record = Arc::new(record);
                self.locks.with_lock(&uid, || {
                    R::memory(records).insert(uid.clone(), Arc::clone(&record));
                    self.register(record.as_ref());
                });
            }
            Storage::Virtual { store, layout } => {
                let bytes = protocol::encode(&record, self.encoding)?;
                let path = layout.record_path(R::KIND, &uid);
                self.locks.with_lock(&uid, || -> ArchiveResult<()> {
                    store.write_bytes(&path, &bytes)?;
                    self.register(&record);
                    Ok(())
                })?;
                debug!(kind = %R::KIND, uid = %uid, bytes = bytes.len(), "wrote record");
            }
        }
        Ok(())
    }

    fn register<R: Slot>(&self, record: &R) {
        {
            let mut list = self.uid_list::<R>().lock();
            if list.push(record.uid()) {
                R::set_count(&self.properties, list.len() as u64);
            }
        }
        R::index_add(&self.index, record);
        R::absorb(&self.properties, record);
    }

    pub(crate) fn get<R: Slot>(&self, uid: &str) -> Option<Arc<R>> {
        match &self.storage {
            Storage::InMemory(records) => R::memory(records).get(uid).map(|r| Arc::clone(&r)),
            Storage::Virtual { store, layout } => {
                if let Err(e) = check_uid(uid) {
                    warn!(kind = %R::KIND, uid, error = %e, "refusing to load record");
                    return None;
                }
                let loaded = self
                    .locks
                    .with_lock(uid, || read_record::<R>(store.as_ref(), layout, uid));
                match loaded {
                    Ok(Some(record)) => Some(Arc::new(record)),
                    Ok(None) => None,
                    Err(e) => {
                        warn!(kind = %R::KIND, uid, error = %e, "failed to load record");
                        None
                    }
                }
            }
        }
    }

    fn remove<R: Slot>(&self, uid: &str) -> ArchiveResult<bool> {
        check_uid(uid)?;
        let (listed, indexed, stored) = self.locks.with_lock(uid, || -> ArchiveResult<_> {
            let stored = match &self.storage {
                Storage::InMemory(records) => R::memory(records).remove(uid).is_some(),
                Storage::Virtual { store, layout } => {
                    let path = layout.record_path(R::KIND, uid);
                    let present = store.is_file(&path)?;
                    if present {
                        store.delete(&path)?;
                    }
                    present
                }
            };
            let listed = {
                let mut list = self.uid_list::<R>().lock();
                let removed = list.remove(uid);
                if removed {
                    R::set_count(&self.properties, list.len() as u64);
                }
                removed
            };
            let indexed = R::index_remove(&self.index, uid);
            Ok((listed, indexed, stored))
        })?;
        debug!(kind = %R::KIND, uid, stored, "removed record");
        Ok(listed || indexed || stored)
    }

    /// Folds a loaded properties snapshot into the live properties. Sets
    /// already absorbed from records are kept.
    fn adopt_properties(&self, snapshot: PropertiesSnapshot, types: &ArchiveTypeRegistry) -> ArchiveResult<()> {
        let loaded = ArchiveProperties::from_snapshot(snapshot, types)?;
        self.properties.set_archive_type(loaded.archive_type());
        self.properties.union_from(&loaded);
        for name in loaded.document_names() {
            if let Some(content) = loaded.document(&name) {
                self.properties.set_document(&name, &content);
            }
        }
        self.properties
            .set_number_of_molecules(self.number_of_molecules() as u64);
        self.properties
            .set_number_of_metadata(self.number_of_metadata() as u64);
        Ok(())
    }
}

impl fmt::Debug for MoleculeArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MoleculeArchive")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("encoding", &self.encoding)
            .field("molecules", &self.index.molecule_count())
            .field("metadata", &self.index.metadata_count())
            .finish()
    }
}

/// Reads one record file under its backend read lock.
///
/// `Ok(None)` means the file is absent or empty; both are logged.
fn read_record<R: ArchiveRecord>(store: &dyn KvStore, layout: &VirtualLayout, uid: &str) -> ArchiveResult<Option<R>> {
    let path = layout.record_path(R::KIND, uid);
    match store.file_size(&path)? {
        None => {
            warn!(kind = %R::KIND, uid, path = %path, "record file missing");
            return Ok(None);
        }
        Some(0) => {
            warn!(kind = %R::KIND, uid, path = %path, "record file is empty");
            return Ok(None);
        }
        Some(_) => {}
    }

    let mut channel = store.lock_for_reading(&path)?;
    let record: R = protocol::decode(channel.reader()?, layout.encoding(), &path)?;
    channel.close()?;

    if record.uid().is_empty() {
        return Err(ArchiveError::CorruptRecord {
            uid: uid.to_string(),
            reason: "no UID field".to_string(),
        });
    }
    if record.uid() != uid {
        return Err(ArchiveError::CorruptRecord {
            uid: uid.to_string(),
            reason: format!("file holds record {}", record.uid()),
        });
    }
    Ok(Some(record))
}

fn read_snapshot<T: Protocol + Default>(store: &dyn KvStore, path: &str, encoding: Encoding) -> ArchiveResult<T> {
    let mut channel = store.lock_for_reading(path)?;
    let item = protocol::decode(channel.reader()?, encoding, path)?;
    channel.close()?;
    Ok(item)
}

/// Writes the properties and index files of a virtual store.
fn write_meta_files(
    store: &dyn KvStore,
    layout: &VirtualLayout,
    properties: &ArchiveProperties,
    index: &ArchiveIndex,
) -> ArchiveResult<()> {
    let encoding = layout.encoding();
    store.write_bytes(
        &layout.properties_path(),
        &protocol::encode(&properties.snapshot(), encoding)?,
    )?;
    store.write_bytes(&layout.index_path(), &protocol::encode(&index.snapshot(), encoding)?)?;
    Ok(())
}
