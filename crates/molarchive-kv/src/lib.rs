#![warn(missing_docs)]

//! molarchive key-value access: path-oriented storage over local
//! filesystems and S3-compatible object stores.
//!
//! Both backends expose the same [`KvStore`] contract: normalized
//! `/`-separated keys, synthesized directories, recursive deletion and
//! locked read/write handles ([`LockedChannel`]).

pub mod error;
pub mod fs;
pub mod object_client;
pub mod path;
pub mod s3;
pub mod store;

pub use error::{KvError, KvResult};
pub use fs::FsStore;
pub use object_client::{ListPage, MemoryClientStats, MemoryObjectClient, ObjectClient, ObjectMeta};
pub use path::normalize;
pub use s3::S3Store;
pub use store::{ChannelBackend, KvStore, LockedChannel};
