//! Key layout of a virtual store.
//!
//! ```text
//! MoleculeArchiveProperties.{ext}
//! indexes.{ext}
//! Molecules/<UID>.{ext}
//! Metadata/<UID>.{ext}
//! ```

use molarchive_kv::{path, KvStore};
use tracing::debug;

use crate::encoding::Encoding;
use crate::error::{ArchiveError, ArchiveResult};
use crate::record::RecordKind;

/// Stem of the properties file.
pub const PROPERTIES_STEM: &str = "MoleculeArchiveProperties";

/// Stem of the index file.
pub const INDEX_STEM: &str = "indexes";

/// Checks that `uid` names exactly one record file under its kind's
/// directory: no separators, no `.`/`..`, nothing the key normalizer rewrites.
pub fn check_uid(uid: &str) -> ArchiveResult<()> {
    let problem = if uid.is_empty() {
        Some("empty UID")
    } else if uid.contains(['/', '\\', '\0']) {
        Some("UID contains a path separator")
    } else if uid == "." || uid == ".." {
        Some("UID is a relative path token")
    } else if path::normalize(uid) != uid {
        Some("UID is not a plain key segment")
    } else {
        None
    };
    match problem {
        Some(reason) => Err(ArchiveError::InvalidRecord {
            reason: format!("{reason}: {uid:?}"),
        }),
        None => Ok(()),
    }
}

/// Canonical keys for one encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualLayout {
    encoding: Encoding,
}

impl VirtualLayout {
    /// Layout using the extension of `encoding`.
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding }
    }

    /// Encoding whose extension this layout uses.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Key of the properties file.
    pub fn properties_path(&self) -> String {
        format!("{PROPERTIES_STEM}.{}", self.encoding.extension())
    }

    /// Key of the index file.
    pub fn index_path(&self) -> String {
        format!("{INDEX_STEM}.{}", self.encoding.extension())
    }

    /// Key of a record.
    pub fn record_path(&self, kind: RecordKind, uid: &str) -> String {
        path::join(kind.directory(), &format!("{uid}.{}", self.encoding.extension()))
    }

    /// UID encoded in a record file name, if it carries this layout's
    /// extension.
    pub fn uid_from_file_name<'a>(&self, name: &'a str) -> Option<&'a str> {
        let (stem, ext) = name.rsplit_once('.')?;
        (ext == self.encoding.extension() && check_uid(stem).is_ok()).then_some(stem)
    }

    /// Sorted UIDs of every record file of `kind` in the store. A missing
    /// directory holds no records.
    pub fn list_uids(&self, store: &dyn KvStore, kind: RecordKind) -> ArchiveResult<Vec<String>> {
        let names = match store.list(kind.directory()) {
            Ok(names) => names,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut uids: Vec<String> = names
            .iter()
            .filter_map(|name| self.uid_from_file_name(name))
            .map(str::to_string)
            .collect();
        uids.sort();
        Ok(uids)
    }

    /// Probes for the properties file under each extension.
    pub fn detect(store: &dyn KvStore) -> ArchiveResult<VirtualLayout> {
        for encoding in Encoding::ALL {
            let layout = VirtualLayout::new(encoding);
            if store.is_file(&layout.properties_path())? {
                debug!(root = %store.root(), %encoding, "detected virtual store encoding");
                return Ok(layout);
            }
        }
        Err(ArchiveError::UnknownEncoding {
            origin: store.root().to_string(),
        })
    }

    /// Returns the layout of an archive already present in `store`, if any.
    pub fn existing(store: &dyn KvStore) -> ArchiveResult<Option<VirtualLayout>> {
        match Self::detect(store) {
            Ok(layout) => Ok(Some(layout)),
            Err(ArchiveError::UnknownEncoding { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
