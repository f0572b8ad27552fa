//! Line-oriented text files the reconcilers read and append to.
//!
//! Existing content is never rewritten through this interface: the only
//! mutations are `append` and `write_new`, which refuses to replace a file.
//! Callers that check before they append hold `lock_exclusive` across both.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub trait TextStore {
    /// Human-readable location, used in logs and errors.
    fn location(&self) -> String;

    fn exists(&self) -> bool;

    /// Full contents. `NotFound` when the store does not exist.
    fn read(&self) -> io::Result<String>;

    /// Appends `text`, creating the store if needed.
    fn append(&mut self, text: &str) -> io::Result<()>;

    /// Creates the store with `text`. `AlreadyExists` if it is present.
    fn write_new(&mut self, text: &str) -> io::Result<()>;

    /// Exclusive hold on the store until the returned guard is dropped.
    /// Stores with a single writer need no lock.
    fn lock_exclusive(&self) -> io::Result<StoreLock> {
        Ok(StoreLock::unlocked())
    }

    fn read_or_empty(&self) -> io::Result<String> {
        match self.read() {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err),
        }
    }
}

/// Held lock on a store; released on drop.
#[derive(Debug)]
pub struct StoreLock {
    _file: Option<File>,
}

impl StoreLock {
    pub fn unlocked() -> Self {
        Self { _file: None }
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling `<name>.lock` file; the store itself may not exist yet.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn ensure_parent(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

impl TextStore for FileStore {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn read(&self) -> io::Result<String> {
        fs::read_to_string(&self.path)
    }

    fn append(&mut self, text: &str) -> io::Result<()> {
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        debug!(path = %self.path.display(), bytes = text.len(), "appended to store");
        Ok(())
    }

    fn write_new(&mut self, text: &str) -> io::Result<()> {
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn lock_exclusive(&self) -> io::Result<StoreLock> {
        self.ensure_parent()?;
        let lock_path = self.lock_path();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        flock_exclusive(&file)?;
        debug!(path = %lock_path.display(), "store locked");
        Ok(StoreLock { _file: Some(file) })
    }
}

// Advisory; released when the file is closed.
#[cfg(unix)]
fn flock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

/// In-memory store for dry runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    location: String,
    contents: Option<String>,
}

impl MemoryStore {
    pub fn missing(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            contents: None,
        }
    }

    pub fn with_contents(location: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            contents: Some(contents.into()),
        }
    }

    /// Snapshot of a file on disk; a missing file becomes a missing store.
    pub fn snapshot_of(path: &Path) -> io::Result<Self> {
        let location = format!("{} (dry-run)", path.display());
        match fs::read_to_string(path) {
            Ok(data) => Ok(Self::with_contents(location, data)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::missing(location)),
            Err(err) => Err(err),
        }
    }

    pub fn contents(&self) -> Option<&str> {
        self.contents.as_deref()
    }
}

impl TextStore for MemoryStore {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn exists(&self) -> bool {
        self.contents.is_some()
    }

    fn read(&self) -> io::Result<String> {
        self.contents
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, self.location.clone()))
    }

    fn append(&mut self, text: &str) -> io::Result<()> {
        self.contents.get_or_insert_with(String::new).push_str(text);
        Ok(())
    }

    fn write_new(&mut self, text: &str) -> io::Result<()> {
        if self.contents.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                self.location.clone(),
            ));
        }
        self.contents = Some(text.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    Created,
    AlreadyPresent,
    NothingToBackup,
    /// This process already took (or skipped) its backup.
    AlreadyHandled,
}

/// Copies a store to a sibling backup before its first mutation in this process,
/// but only if no backup exists yet. An existing backup is never overwritten.
#[derive(Debug)]
pub struct BackupOnce<S> {
    target: S,
    handled: bool,
}

impl<S: TextStore> BackupOnce<S> {
    pub fn new(target: S) -> Self {
        Self {
            target,
            handled: false,
        }
    }

    pub fn target(&self) -> &S {
        &self.target
    }

    pub fn ensure<T: TextStore + ?Sized>(&mut self, source: &T) -> io::Result<BackupOutcome> {
        if self.handled {
            return Ok(BackupOutcome::AlreadyHandled);
        }
        let outcome = if self.target.exists() {
            BackupOutcome::AlreadyPresent
        } else if !source.exists() {
            BackupOutcome::NothingToBackup
        } else {
            let pristine = source.read()?;
            self.target.write_new(&pristine)?;
            info!(
                source = %source.location(),
                backup = %self.target.location(),
                "backed up store"
            );
            BackupOutcome::Created
        };
        self.handled = true;
        Ok(outcome)
    }
}
