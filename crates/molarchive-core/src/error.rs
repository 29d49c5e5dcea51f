//! Error types for the archive engine.

use molarchive_kv::KvError;
use thiserror::Error;

/// Result type alias for archive operations.
pub type ArchiveResult<T> = Result<T, ArchiveError>;

/// Error variants for archive operations.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Key-value backend error.
    #[error("Storage error: {0}")]
    Kv(#[from] KvError),

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Text (JSON) encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary (Smile) encoding or decoding failed.
    #[error("Smile error: {0}")]
    Smile(#[from] serde_smile::Error),

    /// Neither encoding matched the stream or store.
    #[error("Unknown encoding for {origin}")]
    UnknownEncoding {
        /// File path or store root that was probed.
        origin: String,
    },

    /// A virtual store already holds an archive.
    #[error("Archive already exists at {root}")]
    AlreadyExists {
        /// Store root.
        root: String,
    },

    /// A record could not be loaded.
    #[error("Corrupt record {uid}: {reason}")]
    CorruptRecord {
        /// UID of the record.
        uid: String,
        /// Description of the corruption.
        reason: String,
    },

    /// A record was rejected before being stored.
    #[error("Invalid record: {reason}")]
    InvalidRecord {
        /// Description of the problem.
        reason: String,
    },

    /// A field reader rejected its value.
    #[error("Invalid value for field {field}: {reason}")]
    InvalidField {
        /// Field name as it appeared in the stream.
        field: String,
        /// Description of the problem.
        reason: String,
    },

    /// `save()` was called on an in-memory archive without a source file.
    #[error("Archive has no source file; use save_as")]
    NoSourceFile,

    /// The archive type tag is not registered.
    #[error("Unknown archive type: {name}")]
    UnknownArchiveType {
        /// The unrecognized tag.
        name: String,
    },

    /// Merging would overwrite records that already exist.
    #[error("UID collision on {uid} ({count} colliding records)")]
    UidCollision {
        /// First colliding UID.
        uid: String,
        /// Total number of collisions.
        count: usize,
    },

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The bulk worker pool could not be started.
    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

impl ArchiveError {
    /// Builds an [`ArchiveError::InvalidField`].
    pub fn field(field: &str, reason: impl Into<String>) -> Self {
        ArchiveError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if decoding stopped because the stream ended early.
    pub fn is_unexpected_eof(&self) -> bool {
        match self {
            ArchiveError::Json(e) => e.is_eof(),
            ArchiveError::Smile(e) => smile_hit_eof(e),
            ArchiveError::Io(e) => e.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

// serde_smile does not expose its error kinds; an early end surfaces either
// as an io error or as an end-of-input message.
fn smile_hit_eof(err: &serde_smile::Error) -> bool {
    let io_eof = std::error::Error::source(err)
        .and_then(|source| source.downcast_ref::<std::io::Error>())
        .is_some_and(|io| io.kind() == std::io::ErrorKind::UnexpectedEof);
    let message = err.to_string().to_ascii_lowercase();
    io_eof || message.contains("eof") || message.contains("end of")
}
