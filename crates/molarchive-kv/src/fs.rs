//! Local filesystem backend.
//!
//! Keys map onto paths below a root directory. Locked handles take an OS
//! advisory lock (`flock`): shared for reading, exclusive for writing.
//! A write handle truncates its file only once the exclusive lock is held,
//! so readers never observe a half-truncated file from a waiting writer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{KvError, KvResult};
use crate::path::normalize;
use crate::store::{ChannelBackend, KvStore, LockedChannel};

/// Key-value store over a local directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    root_display: String,
}

impl FsStore {
    /// Opens an existing root directory. Fails immediately if it is missing.
    pub fn open(root: impl AsRef<Path>) -> KvResult<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_dir() {
            return Err(KvError::BackendUnavailable {
                root: root.display().to_string(),
            });
        }
        debug!(root = %root.display(), "opened filesystem store");
        Ok(Self::at(root))
    }

    /// Creates the root directory (and parents) if needed and opens it.
    pub fn create(root: impl AsRef<Path>) -> KvResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        info!(root = %root.display(), "created filesystem store");
        Ok(Self::at(root))
    }

    fn at(root: PathBuf) -> Self {
        let root_display = root.display().to_string();
        Self { root, root_display }
    }

    /// Returns the root directory.
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> (String, PathBuf) {
        let key = normalize(path);
        let full = if key.is_empty() {
            self.root.clone()
        } else {
            self.root.join(&key)
        };
        (key, full)
    }

    fn children(&self, path: &str, dirs_only: bool) -> KvResult<Vec<String>> {
        let (key, full) = self.resolve(path);
        if !full.is_dir() {
            return Err(KvError::NotFound { path: key });
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            if dirs_only && !entry.file_type()?.is_dir() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

impl KvStore for FsStore {
    fn root(&self) -> &str {
        &self.root_display
    }

    fn is_directory(&self, path: &str) -> KvResult<bool> {
        let (_, full) = self.resolve(path);
        Ok(full.is_dir())
    }

    fn is_file(&self, path: &str) -> KvResult<bool> {
        let (_, full) = self.resolve(path);
        Ok(full.is_file())
    }

    fn file_size(&self, path: &str) -> KvResult<Option<u64>> {
        let (_, full) = self.resolve(path);
        match fs::metadata(&full) {
            Ok(meta) if meta.is_file() => Ok(Some(meta.len())),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, path: &str) -> KvResult<Vec<String>> {
        self.children(path, false)
    }

    fn list_directories(&self, path: &str) -> KvResult<Vec<String>> {
        self.children(path, true)
    }

    fn create_directories(&self, path: &str) -> KvResult<()> {
        let (_, full) = self.resolve(path);
        fs::create_dir_all(full)?;
        Ok(())
    }

    fn delete(&self, path: &str) -> KvResult<()> {
        let (key, full) = self.resolve(path);
        if full.is_dir() {
            debug!(path = %key, "deleting directory tree");
            fs::remove_dir_all(&full)?;
        } else if full.exists() {
            debug!(path = %key, "deleting file");
            fs::remove_file(&full)?;
        }
        Ok(())
    }

    fn lock_for_reading(&self, path: &str) -> KvResult<LockedChannel> {
        let (key, full) = self.resolve(path);
        let file = match File::open(&full) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(KvError::NotFound { path: key })
            }
            Err(e) => return Err(e.into()),
        };
        advisory_lock(&file, LockMode::Shared)?;
        Ok(LockedChannel::new(key, false, Box::new(FsChannel { file })))
    }

    fn lock_for_writing(&self, path: &str) -> KvResult<LockedChannel> {
        let (key, full) = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&full)?;
        advisory_lock(&file, LockMode::Exclusive)?;
        Ok(LockedChannel::new(key, true, Box::new(FsChannel { file })))
    }
}

struct FsChannel {
    file: File,
}

impl ChannelBackend for FsChannel {
    fn open_input(&mut self) -> KvResult<Box<dyn Read + Send>> {
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Box::new(file))
    }

    fn open_output(&mut self) -> KvResult<Box<dyn Write + Send>> {
        self.file.set_len(0)?;
        let mut file = self.file.try_clone()?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn release(&mut self, _input: Option<Box<dyn Read + Send>>) -> KvResult<()> {
        advisory_unlock(&self.file)?;
        Ok(())
    }
}

#[derive(Clone, Copy, Debug)]
enum LockMode {
    Shared,
    Exclusive,
}

#[cfg(unix)]
fn advisory_lock(file: &File, mode: LockMode) -> io::Result<()> {
    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };
    flock(file, op)
}

#[cfg(unix)]
fn advisory_unlock(file: &File) -> io::Result<()> {
    flock(file, libc::LOCK_UN)
}

#[cfg(unix)]
fn flock(file: &File, op: libc::c_int) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        // SAFETY: the descriptor is owned by `file` and stays open for the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), op) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn advisory_lock(_file: &File, _mode: LockMode) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn advisory_unlock(_file: &File) -> io::Result<()> {
    Ok(())
}
