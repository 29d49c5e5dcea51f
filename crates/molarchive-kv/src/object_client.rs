//! Object-store capability consumed by [`crate::s3::S3Store`].
//!
//! The wire protocol of a concrete S3 service is outside this crate; a
//! deployment supplies an [`ObjectClient`] implementation for it.
//! [`MemoryObjectClient`] keeps buckets in process and follows S3 listing
//! semantics (delimiters, common prefixes, continuation tokens).

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{KvError, KvResult};

/// Default number of keys returned per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Object metadata (without the object data).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object key
    pub key: String,
    /// Object size in bytes
    pub size: u64,
}

/// One page of a ListObjectsV2-style listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListPage {
    /// Objects directly matching the prefix (and not folded by the delimiter)
    pub objects: Vec<ObjectMeta>,
    /// Common prefixes, each ending in the delimiter
    pub common_prefixes: Vec<String>,
    /// Token for the next page, `None` on the last page
    pub next_continuation_token: Option<String>,
}

/// Blocking object-store operations.
pub trait ObjectClient: Send + Sync {
    /// Returns true if the bucket exists.
    fn bucket_exists(&self, bucket: &str) -> KvResult<bool>;

    /// Creates a bucket. Succeeds if it already exists.
    fn create_bucket(&self, bucket: &str) -> KvResult<()>;

    /// Deletes an empty bucket.
    fn delete_bucket(&self, bucket: &str) -> KvResult<()>;

    /// Returns object metadata, or `None` if the key is absent.
    fn head_object(&self, bucket: &str, key: &str) -> KvResult<Option<ObjectMeta>>;

    /// Opens the object body as a stream.
    fn get_object(&self, bucket: &str, key: &str) -> KvResult<Box<dyn Read + Send>>;

    /// Stores an object in a single request.
    fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> KvResult<()>;

    /// Deletes a batch of keys. Missing keys are ignored.
    fn delete_objects(&self, bucket: &str, keys: &[String]) -> KvResult<()>;

    /// Lists one page of keys under `prefix`.
    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
    ) -> KvResult<ListPage>;
}

/// Read statistics for [`MemoryObjectClient`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryClientStats {
    /// Number of get requests
    pub gets: u64,
    /// Number of put requests
    pub puts: u64,
    /// Number of list pages served
    pub list_pages: u64,
    /// Bytes consumed by readers of get responses
    pub bytes_read: u64,
}

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    puts: AtomicU64,
    list_pages: AtomicU64,
    bytes_read: AtomicU64,
}

/// In-process object store with S3 listing semantics.
pub struct MemoryObjectClient {
    buckets: RwLock<HashMap<String, BTreeMap<String, Arc<[u8]>>>>,
    page_size: usize,
    counters: Arc<Counters>,
}

impl MemoryObjectClient {
    /// Creates an empty client with the default page size.
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// Creates an empty client returning at most `page_size` entries per page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            page_size: page_size.max(1),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Returns request statistics.
    pub fn stats(&self) -> MemoryClientStats {
        MemoryClientStats {
            gets: self.counters.gets.load(Ordering::Relaxed),
            puts: self.counters.puts.load(Ordering::Relaxed),
            list_pages: self.counters.list_pages.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
        }
    }

    /// Returns the number of objects in a bucket (0 if the bucket is missing).
    pub fn object_count(&self, bucket: &str) -> usize {
        self.buckets.read().get(bucket).map(|b| b.len()).unwrap_or(0)
    }

    fn validate_bucket_name(name: &str) -> KvResult<()> {
        let valid_edges = |c: Option<char>| c.map(|c| c.is_ascii_alphanumeric()).unwrap_or(false);
        let valid = (3..=63).contains(&name.len())
            && valid_edges(name.chars().next())
            && valid_edges(name.chars().last())
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
        if valid {
            Ok(())
        } else {
            Err(KvError::InvalidBucketName {
                name: name.to_string(),
            })
        }
    }

    fn missing_bucket(bucket: &str) -> KvError {
        KvError::ObjectStore {
            bucket: bucket.to_string(),
            reason: "NoSuchBucket".to_string(),
        }
    }
}

impl Default for MemoryObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectClient for MemoryObjectClient {
    fn bucket_exists(&self, bucket: &str) -> KvResult<bool> {
        Ok(self.buckets.read().contains_key(bucket))
    }

    fn create_bucket(&self, bucket: &str) -> KvResult<()> {
        Self::validate_bucket_name(bucket)?;
        self.buckets.write().entry(bucket.to_string()).or_default();
        Ok(())
    }

    fn delete_bucket(&self, bucket: &str) -> KvResult<()> {
        let mut buckets = self.buckets.write();
        match buckets.get(bucket) {
            None => Err(Self::missing_bucket(bucket)),
            Some(objects) if !objects.is_empty() => Err(KvError::ObjectStore {
                bucket: bucket.to_string(),
                reason: "BucketNotEmpty".to_string(),
            }),
            Some(_) => {
                buckets.remove(bucket);
                Ok(())
            }
        }
    }

    fn head_object(&self, bucket: &str, key: &str) -> KvResult<Option<ObjectMeta>> {
        let buckets = self.buckets.read();
        let objects = buckets.get(bucket).ok_or_else(|| Self::missing_bucket(bucket))?;
        Ok(objects.get(key).map(|data| ObjectMeta {
            key: key.to_string(),
            size: data.len() as u64,
        }))
    }

    fn get_object(&self, bucket: &str, key: &str) -> KvResult<Box<dyn Read + Send>> {
        let buckets = self.buckets.read();
        let objects = buckets.get(bucket).ok_or_else(|| Self::missing_bucket(bucket))?;
        let data = objects.get(key).cloned().ok_or_else(|| KvError::NotFound {
            path: key.to_string(),
        })?;
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(CountingReader {
            inner: Cursor::new(data),
            counters: self.counters.clone(),
        }))
    }

    fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> KvResult<()> {
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::missing_bucket(bucket))?;
        debug!(bucket, key, size = body.len(), "put object");
        objects.insert(key.to_string(), Arc::from(body));
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn delete_objects(&self, bucket: &str, keys: &[String]) -> KvResult<()> {
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| Self::missing_bucket(bucket))?;
        for key in keys {
            objects.remove(key);
        }
        Ok(())
    }

    fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        continuation_token: Option<&str>,
    ) -> KvResult<ListPage> {
        let buckets = self.buckets.read();
        let objects = buckets.get(bucket).ok_or_else(|| Self::missing_bucket(bucket))?;
        self.counters.list_pages.fetch_add(1, Ordering::Relaxed);

        let mut page = ListPage::default();
        let mut last_emitted: Option<String> = None;
        let mut emitted = 0usize;

        let start = match continuation_token {
            Some(token) if token > prefix => token,
            _ => prefix,
        };
        for (key, data) in objects.range::<str, _>((Bound::Included(start), Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            let common = delimiter
                .and_then(|d| rest.find(d).map(|pos| format!("{}{}", prefix, &rest[..pos + d.len()])));
            let name = common.as_deref().unwrap_or(key.as_str());

            // Names come out in key order, so anything at or before the
            // token was served by an earlier page.
            if continuation_token.map(|t| name <= t).unwrap_or(false) {
                continue;
            }
            if last_emitted.as_deref() == Some(name) {
                continue;
            }
            if emitted == self.page_size {
                page.next_continuation_token = last_emitted;
                break;
            }

            match &common {
                Some(common) => page.common_prefixes.push(common.clone()),
                None => page.objects.push(ObjectMeta {
                    key: key.clone(),
                    size: data.len() as u64,
                }),
            }
            last_emitted = Some(name.to_string());
            emitted += 1;
        }

        Ok(page)
    }
}

struct CountingReader {
    inner: Cursor<Arc<[u8]>>,
    counters: Arc<Counters>,
}

impl Read for CountingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.counters.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}
