//! Error types for key-value access.

use thiserror::Error;

/// Result type alias for key-value operations.
pub type KvResult<T> = Result<T, KvError>;

/// Error variants for key-value operations.
#[derive(Debug, Error)]
pub enum KvError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend root (directory or bucket) does not exist.
    #[error("Backend unavailable: {root}")]
    BackendUnavailable {
        /// Root directory or bucket name.
        root: String,
    },

    /// The requested key or file does not exist.
    #[error("Not found: {path}")]
    NotFound {
        /// Normalized path that was looked up.
        path: String,
    },

    /// An output stream was requested on a handle locked for reading.
    #[error("Channel for {path} is not writable")]
    NotWritable {
        /// Path the handle was opened for.
        path: String,
    },

    /// The channel was used after `close()`.
    #[error("Channel for {path} is closed")]
    Closed {
        /// Path the handle was opened for.
        path: String,
    },

    /// A bucket name was rejected by the object store.
    #[error("Invalid bucket name: {name}")]
    InvalidBucketName {
        /// The rejected name.
        name: String,
    },

    /// The object store refused an operation.
    #[error("Object store error on {bucket}: {reason}")]
    ObjectStore {
        /// Bucket the request targeted.
        bucket: String,
        /// Description of the failure.
        reason: String,
    },
}

impl KvError {
    /// Returns true if the error means the key was simply absent.
    pub fn is_not_found(&self) -> bool {
        match self {
            KvError::NotFound { .. } => true,
            KvError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
