//! Backend-neutral key-value access contract and locked I/O handles.

use std::io::{BufRead, BufReader, Read, Write};

use tracing::{debug, warn};

use crate::error::{KvError, KvResult};

/// Path-oriented key-value backend.
///
/// Every path argument is normalized by the implementation before use, so
/// `"/Molecules/x.json"` and `"Molecules//x.json"` address the same key.
pub trait KvStore: Send + Sync {
    /// Human-readable description of the backend root (directory or bucket).
    fn root(&self) -> &str;

    /// Returns true if `path` names an existing file or directory.
    fn exists(&self, path: &str) -> KvResult<bool> {
        Ok(self.is_file(path)? || self.is_directory(path)?)
    }

    /// Returns true for the root, and for any existing directory.
    fn is_directory(&self, path: &str) -> KvResult<bool>;

    /// Returns true if `path` names an existing file (object).
    fn is_file(&self, path: &str) -> KvResult<bool>;

    /// Returns the size of a file in bytes, or `None` when absent.
    fn file_size(&self, path: &str) -> KvResult<Option<u64>>;

    /// Lists the names (not full paths) of all children one level below `path`.
    fn list(&self, path: &str) -> KvResult<Vec<String>>;

    /// Lists the names of the directories one level below `path`.
    fn list_directories(&self, path: &str) -> KvResult<Vec<String>>;

    /// Creates `path` and every missing parent directory.
    fn create_directories(&self, path: &str) -> KvResult<()>;

    /// Recursively deletes `path`. Deleting the empty path removes the root.
    fn delete(&self, path: &str) -> KvResult<()>;

    /// Opens a handle holding a shared lock on `path`.
    fn lock_for_reading(&self, path: &str) -> KvResult<LockedChannel>;

    /// Opens a handle holding an exclusive lock on `path`, creating it if needed.
    fn lock_for_writing(&self, path: &str) -> KvResult<LockedChannel>;

    /// Reads a whole file under a read lock.
    fn read_bytes(&self, path: &str) -> KvResult<Vec<u8>> {
        let mut channel = self.lock_for_reading(path)?;
        let mut bytes = Vec::new();
        channel.input_stream()?.read_to_end(&mut bytes)?;
        channel.close()?;
        Ok(bytes)
    }

    /// Replaces a whole file under a write lock.
    fn write_bytes(&self, path: &str, bytes: &[u8]) -> KvResult<()> {
        let mut channel = self.lock_for_writing(path)?;
        channel.output_stream()?.write_all(bytes)?;
        channel.close()
    }
}

/// Backend half of a [`LockedChannel`]: opens raw streams and releases the
/// lock once the channel is done with them.
pub trait ChannelBackend: Send {
    /// Opens the raw input stream.
    fn open_input(&mut self) -> KvResult<Box<dyn Read + Send>>;

    /// Opens the raw output stream, discarding any previous content.
    fn open_output(&mut self) -> KvResult<Box<dyn Write + Send>>;

    /// Releases the backend lock. Receives the input stream, if one was
    /// opened, so the backend can finish it off (e.g. drain a connection).
    fn release(&mut self, input: Option<Box<dyn Read + Send>>) -> KvResult<()>;
}

/// Scoped handle over one locked path.
///
/// Streams are opened lazily on first use and registered with the handle;
/// [`LockedChannel::close`] (or drop) flushes and releases all of them and
/// then the backend lock.
pub struct LockedChannel {
    path: String,
    writable: bool,
    closed: bool,
    backend: Box<dyn ChannelBackend>,
    input: Option<BufReader<Box<dyn Read + Send>>>,
    output: Option<Box<dyn Write + Send>>,
}

impl LockedChannel {
    /// Wraps a backend handle for `path`.
    pub fn new(path: String, writable: bool, backend: Box<dyn ChannelBackend>) -> Self {
        Self {
            path,
            writable,
            closed: false,
            backend,
            input: None,
            output: None,
        }
    }

    /// Normalized path this handle is locked on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns true if the handle was opened with [`KvStore::lock_for_writing`].
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Returns the (lazily opened) input stream.
    pub fn input_stream(&mut self) -> KvResult<&mut (dyn Read + Send)> {
        Ok(self.buffered_input()?)
    }

    /// Returns the (lazily opened) input stream as a buffered reader.
    pub fn reader(&mut self) -> KvResult<&mut dyn BufRead> {
        Ok(self.buffered_input()?)
    }

    /// Returns the (lazily opened) output stream.
    pub fn output_stream(&mut self) -> KvResult<&mut (dyn Write + Send)> {
        self.ensure_open()?;
        if !self.writable {
            return Err(KvError::NotWritable {
                path: self.path.clone(),
            });
        }
        if self.output.is_none() {
            debug!(path = %self.path, "opening output stream");
            self.output = Some(self.backend.open_output()?);
        }
        match self.output.as_mut() {
            Some(out) => Ok(out.as_mut()),
            None => Err(KvError::Closed {
                path: self.path.clone(),
            }),
        }
    }

    /// Alias of [`LockedChannel::output_stream`]; every output stream is buffered.
    pub fn writer(&mut self) -> KvResult<&mut (dyn Write + Send)> {
        self.output_stream()
    }

    /// Flushes and releases every stream opened through this handle, then
    /// the backend lock.
    pub fn close(mut self) -> KvResult<()> {
        self.release()
    }

    fn buffered_input(&mut self) -> KvResult<&mut BufReader<Box<dyn Read + Send>>> {
        self.ensure_open()?;
        if self.input.is_none() {
            debug!(path = %self.path, "opening input stream");
            self.input = Some(BufReader::new(self.backend.open_input()?));
        }
        match self.input.as_mut() {
            Some(input) => Ok(input),
            None => Err(KvError::Closed {
                path: self.path.clone(),
            }),
        }
    }

    fn ensure_open(&self) -> KvResult<()> {
        if self.closed {
            return Err(KvError::Closed {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    fn release(&mut self) -> KvResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut flushed = Ok(());
        if let Some(mut out) = self.output.take() {
            flushed = out.flush().map_err(KvError::from);
        }
        let input = self.input.take().map(BufReader::into_inner);
        let released = self.backend.release(input);
        flushed.and(released)
    }
}

impl Drop for LockedChannel {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(path = %self.path, error = %e, "failed to release channel");
        }
    }
}

impl std::fmt::Debug for LockedChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedChannel")
            .field("path", &self.path)
            .field("writable", &self.writable)
            .field("closed", &self.closed)
            .finish()
    }
}
