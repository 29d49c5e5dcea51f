//! S3-compatible object store backend.
//!
//! Object stores have no directories: they are synthesized from the
//! trailing-slash convention. A directory `a/b` exists when a zero-byte
//! marker object `a/b/` exists or any key lies below `a/b/`, and listings
//! use `/` as the delimiter. Objects cannot be partially written, so write
//! handles buffer everything and issue one PUT on close.

use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{KvError, KvResult};
use crate::object_client::{ObjectClient, ObjectMeta};
use crate::path::{dir_prefix, normalize, SEPARATOR};
use crate::store::{ChannelBackend, KvStore, LockedChannel};

/// Maximum number of keys per batch delete request.
const DELETE_BATCH: usize = 1000;

const DELIMITER: &str = "/";

/// Key-value store over one bucket.
#[derive(Clone)]
pub struct S3Store {
    client: Arc<dyn ObjectClient>,
    bucket: String,
}

impl S3Store {
    /// Opens an existing bucket. Fails immediately if it does not exist.
    pub fn open(client: Arc<dyn ObjectClient>, bucket: impl Into<String>) -> KvResult<Self> {
        let bucket = bucket.into();
        if !client.bucket_exists(&bucket)? {
            return Err(KvError::BackendUnavailable { root: bucket });
        }
        debug!(bucket = %bucket, "opened object store");
        Ok(Self { client, bucket })
    }

    /// Creates the bucket if needed and opens it.
    pub fn create(client: Arc<dyn ObjectClient>, bucket: impl Into<String>) -> KvResult<Self> {
        let bucket = bucket.into();
        client.create_bucket(&bucket)?;
        info!(bucket = %bucket, "created object store bucket");
        Ok(Self { client, bucket })
    }

    /// Returns the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Follows continuation tokens until the listing is exhausted.
    fn list_all(
        &self,
        prefix: &str,
        delimiter: Option<&str>,
    ) -> KvResult<(Vec<ObjectMeta>, Vec<String>)> {
        let mut objects = Vec::new();
        let mut prefixes = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects(&self.bucket, prefix, delimiter, token.as_deref())?;
            objects.extend(page.objects);
            prefixes.extend(page.common_prefixes);
            match page.next_continuation_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok((objects, prefixes))
    }

    fn delete_keys(&self, keys: &[String]) -> KvResult<()> {
        for chunk in keys.chunks(DELETE_BATCH) {
            self.client.delete_objects(&self.bucket, chunk)?;
        }
        Ok(())
    }

    fn children(&self, path: &str, dirs_only: bool) -> KvResult<Vec<String>> {
        let prefix = dir_prefix(path);
        let (objects, prefixes) = self.list_all(&prefix, Some(DELIMITER))?;

        let mut names: Vec<String> = prefixes
            .iter()
            .map(|p| p[prefix.len()..].trim_end_matches(SEPARATOR).to_string())
            .collect();
        if !dirs_only {
            names.extend(
                objects
                    .iter()
                    .filter(|o| o.key != prefix)
                    .map(|o| o.key[prefix.len()..].to_string()),
            );
        }

        if names.is_empty() && !self.is_directory(path)? {
            return Err(KvError::NotFound {
                path: normalize(path),
            });
        }
        names.sort();
        Ok(names)
    }
}

impl KvStore for S3Store {
    fn root(&self) -> &str {
        &self.bucket
    }

    fn is_directory(&self, path: &str) -> KvResult<bool> {
        let key = normalize(path);
        if key.is_empty() {
            return self.client.bucket_exists(&self.bucket);
        }
        let prefix = dir_prefix(&key);
        if self.client.head_object(&self.bucket, &prefix)?.is_some() {
            return Ok(true);
        }
        let page = self.client.list_objects(&self.bucket, &prefix, None, None)?;
        Ok(!page.objects.is_empty())
    }

    fn is_file(&self, path: &str) -> KvResult<bool> {
        Ok(self.file_size(path)?.is_some())
    }

    fn file_size(&self, path: &str) -> KvResult<Option<u64>> {
        let key = normalize(path);
        if key.is_empty() {
            return Ok(None);
        }
        Ok(self.client.head_object(&self.bucket, &key)?.map(|meta| meta.size))
    }

    fn list(&self, path: &str) -> KvResult<Vec<String>> {
        self.children(path, false)
    }

    fn list_directories(&self, path: &str) -> KvResult<Vec<String>> {
        self.children(path, true)
    }

    fn create_directories(&self, path: &str) -> KvResult<()> {
        let key = normalize(path);
        let mut marker = String::new();
        for segment in key.split(SEPARATOR).filter(|s| !s.is_empty()) {
            marker.push_str(segment);
            marker.push(SEPARATOR);
            if self.client.head_object(&self.bucket, &marker)?.is_none() {
                debug!(bucket = %self.bucket, marker = %marker, "creating directory marker");
                self.client.put_object(&self.bucket, &marker, Vec::new())?;
            }
        }
        Ok(())
    }

    fn delete(&self, path: &str) -> KvResult<()> {
        let key = normalize(path);
        if key.is_empty() {
            let (objects, _) = self.list_all("", None)?;
            let keys: Vec<String> = objects.into_iter().map(|o| o.key).collect();
            info!(bucket = %self.bucket, keys = keys.len(), "deleting bucket");
            self.delete_keys(&keys)?;
            return self.client.delete_bucket(&self.bucket);
        }

        let (objects, _) = self.list_all(&dir_prefix(&key), None)?;
        let mut keys: Vec<String> = objects.into_iter().map(|o| o.key).collect();
        if self.client.head_object(&self.bucket, &key)?.is_some() {
            keys.push(key.clone());
        }
        debug!(bucket = %self.bucket, path = %key, keys = keys.len(), "deleting keys");
        self.delete_keys(&keys)
    }

    fn lock_for_reading(&self, path: &str) -> KvResult<LockedChannel> {
        let key = normalize(path);
        if self.client.head_object(&self.bucket, &key)?.is_none() {
            return Err(KvError::NotFound { path: key });
        }
        let backend = ObjectChannel {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.clone(),
            pending: None,
        };
        Ok(LockedChannel::new(key, false, Box::new(backend)))
    }

    fn lock_for_writing(&self, path: &str) -> KvResult<LockedChannel> {
        let key = normalize(path);
        let backend = ObjectChannel {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: key.clone(),
            pending: None,
        };
        Ok(LockedChannel::new(key, true, Box::new(backend)))
    }
}

impl std::fmt::Debug for S3Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Store").field("bucket", &self.bucket).finish()
    }
}

struct ObjectChannel {
    client: Arc<dyn ObjectClient>,
    bucket: String,
    key: String,
    pending: Option<Arc<Mutex<Vec<u8>>>>,
}

impl ChannelBackend for ObjectChannel {
    fn open_input(&mut self) -> KvResult<Box<dyn Read + Send>> {
        self.client.get_object(&self.bucket, &self.key)
    }

    fn open_output(&mut self) -> KvResult<Box<dyn Write + Send>> {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        self.pending = Some(buffer.clone());
        Ok(Box::new(PendingUpload(buffer)))
    }

    fn release(&mut self, input: Option<Box<dyn Read + Send>>) -> KvResult<()> {
        // Drain so the connection can go back to the pool instead of being aborted.
        if let Some(mut input) = input {
            io::copy(&mut input, &mut io::sink())?;
        }
        if let Some(buffer) = self.pending.take() {
            let body = std::mem::take(&mut *buffer.lock());
            debug!(bucket = %self.bucket, key = %self.key, size = body.len(), "uploading object");
            self.client.put_object(&self.bucket, &self.key, body)?;
        }
        Ok(())
    }
}

struct PendingUpload(Arc<Mutex<Vec<u8>>>);

impl Write for PendingUpload {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
