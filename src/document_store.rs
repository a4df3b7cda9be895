//! Locked Document Store Module
//!
//! Reads and writes whole JSON documents on a directory shared by several
//! processes. Writers serialize on an exclusive lock taken on a `<file>.lock`
//! sidecar, write a uniquely named temp file in the same directory, fsync it and
//! atomically rename it over the target, so readers only ever observe complete
//! documents. Readers never lock; transient failures are retried and corrupt
//! content is replaced by a caller-supplied default.

use crate::platform_lock::{acquire_exclusive, open_lock_file, FileLock, Fs2FileLock, LockAttemptError};
use crate::retry::RetryPolicy;
use crate::{Result, StoreError};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

const LOCK_SUFFIX: &str = ".lock";
const BACKUP_SUFFIX: &str = ".backup";
const TEMP_SUFFIX: &str = ".tmp";

/// Why the most recent failed read attempt failed
#[derive(Debug, Clone, Copy, PartialEq)]
enum ReadFailure {
    Io,
    Syntax,
}

/// Result of one successful read attempt
enum ReadAttempt<T> {
    Missing,
    Parsed(T),
    /// Valid JSON that does not match the document schema
    Garbage(String),
}

/// Temp file holding a fully written and fsynced document, not yet renamed
/// over its target
///
/// Dropping an uncommitted document removes the temp file and leaves the
/// target untouched.
#[derive(Debug)]
pub struct StagedDocument {
    temp_path: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedDocument {
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Atomically replace the target with the staged content
    pub fn commit(mut self) -> Result<()> {
        fs::rename(&self.temp_path, &self.target).map_err(|e| {
            warn!(
                "Failed to rename temp document: tmp={:?}, final={:?}, error={}",
                self.temp_path, self.target, e
            );
            StoreError::TransientIo(format!(
                "Failed to rename {:?} to {:?}: {}",
                self.temp_path, self.target, e
            ))
        })?;
        self.committed = true;
        sync_parent_dir(&self.target);
        Ok(())
    }
}

impl Drop for StagedDocument {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_file(&self.temp_path) {
            Ok(()) => debug!("Removed uncommitted temp document: path={:?}", self.temp_path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove temp document: path={:?}, error={}",
                self.temp_path, e
            ),
        }
    }
}

/// Whole-document JSON store with cross-process locking
#[derive(Debug, Clone)]
pub struct LockedDocumentStore {
    lock: Arc<dyn FileLock>,
    read_retry: RetryPolicy,
    write_retry: RetryPolicy,
    backup_corrupt_files: bool,
}

impl Default for LockedDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LockedDocumentStore {
    /// Store using the OS advisory lock and default retry policies
    pub fn new() -> Self {
        Self {
            lock: Arc::new(Fs2FileLock),
            read_retry: RetryPolicy::default(),
            write_retry: RetryPolicy::default(),
            backup_corrupt_files: true,
        }
    }

    pub fn with_lock(mut self, lock: Arc<dyn FileLock>) -> Self {
        self.lock = lock;
        self
    }

    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    /// Keep corrupt documents as `<file>.backup` before they are replaced
    pub fn with_backup_corrupt_files(mut self, enabled: bool) -> Self {
        self.backup_corrupt_files = enabled;
        self
    }

    /// Sidecar file every writer of `path` locks
    pub fn lock_path(path: &Path) -> PathBuf {
        with_suffix(path, LOCK_SUFFIX)
    }

    /// Where a corrupt `path` is first moved aside; later corruptions get
    /// `<file>.<timestamp>.backup`
    pub fn backup_path(path: &Path) -> PathBuf {
        with_suffix(path, BACKUP_SUFFIX)
    }

    /// Read a document, returning `default()` when it is absent or corrupt
    ///
    /// I/O errors and unparseable content are retried. Content that is still
    /// unreadable after the last attempt yields `DocumentUnavailable`; content that
    /// is still not JSON is treated as corrupt and recovered.
    pub fn read<T, D>(&self, path: &Path, default: D) -> Result<T>
    where
        T: DeserializeOwned,
        D: FnOnce() -> T,
    {
        self.read_document(path, default, false)
    }

    /// Write a document atomically, retrying while another writer holds the lock
    pub fn write<T: Serialize>(&self, path: &Path, document: &T) -> Result<()> {
        let operation = format!("write {}", display_name(path));
        self.write_retry.execute(&operation, |attempt| {
            let lock_path = Self::lock_path(path);
            let lock_file = open_lock_file(&lock_path).map_err(|e| transient("open lock file", &lock_path, e))?;
            let guard = acquire_exclusive(self.lock.as_ref(), &lock_file)
                .map_err(|e| lock_error(e, &lock_path))?;

            self.stage(path, document)?.commit()?;

            if let Err(e) = guard.release() {
                warn!("Failed to release document lock (non-fatal): path={:?}, error={}", lock_path, e);
            }
            debug!("Document written: path={:?}, attempt={}", path, attempt + 1);
            Ok(())
        })
    }

    /// Read-modify-write under a single lock scope
    ///
    /// The whole cycle is retried on lock contention, re-reading the current
    /// document each time, so `mutate` may run more than once; only the last run
    /// is persisted.
    pub fn update<T, D, F, R>(&self, path: &Path, default: D, mut mutate: F) -> Result<R>
    where
        T: Serialize + DeserializeOwned,
        D: Fn() -> T,
        F: FnMut(&mut T) -> R,
    {
        let operation = format!("update {}", display_name(path));
        self.write_retry.execute(&operation, |attempt| {
            let lock_path = Self::lock_path(path);
            let lock_file = open_lock_file(&lock_path).map_err(|e| transient("open lock file", &lock_path, e))?;
            let guard = acquire_exclusive(self.lock.as_ref(), &lock_file)
                .map_err(|e| lock_error(e, &lock_path))?;

            let mut document = self.read_document(path, &default, true)?;
            let result = mutate(&mut document);
            self.stage(path, &document)?.commit()?;

            if let Err(e) = guard.release() {
                warn!("Failed to release document lock (non-fatal): path={:?}, error={}", lock_path, e);
            }
            debug!("Document updated: path={:?}, attempt={}", path, attempt + 1);
            Ok(result)
        })
    }

    /// Serialize `document` to a fresh temp file next to `path` and fsync it
    ///
    /// Callers must hold the document lock until the returned value is
    /// committed or dropped.
    pub fn stage<T: Serialize>(&self, path: &Path, document: &T) -> Result<StagedDocument> {
        let mut json = serde_json::to_vec_pretty(document)?;
        json.push(b'\n');

        let parent = parent_dir(path);
        fs::create_dir_all(&parent).map_err(|e| transient("create directory", &parent, e))?;

        let temp_path = parent.join(format!(
            ".{}.{}{}",
            display_name(path),
            uuid::Uuid::new_v4().simple(),
            TEMP_SUFFIX
        ));
        // From here on the temp file is removed on any early return
        let staged = StagedDocument {
            temp_path,
            target: path.to_path_buf(),
            committed: false,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staged.temp_path)
            .map_err(|e| transient("create temp file", &staged.temp_path, e))?;
        file.write_all(&json)
            .map_err(|e| transient("write temp file", &staged.temp_path, e))?;
        file.sync_all()
            .map_err(|e| transient("fsync temp file", &staged.temp_path, e))?;

        debug!(
            "Staged document: tmp={:?}, size={} bytes",
            staged.temp_path,
            json.len()
        );
        Ok(staged)
    }

    /// Remove temp files left behind by writers that died before renaming
    ///
    /// Only files older than `older_than` are touched, so in-flight writes from
    /// other processes survive.
    pub fn cleanup_temp_files(dir: &Path, older_than: Duration) -> Result<usize> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(transient("read directory", dir, e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with('.') || !name.ends_with(TEMP_SUFFIX) {
                continue;
            }

            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < older_than {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    removed += 1;
                    debug!("Removed stale temp file: path={:?}, age={:?}", entry.path(), age);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove stale temp file: path={:?}, error={}", entry.path(), e),
            }
        }

        if removed > 0 {
            info!("Cleaned up stale temp files: dir={:?}, removed={}", dir, removed);
        }
        Ok(removed)
    }

    fn read_document<T, D>(&self, path: &Path, default: D, lock_held: bool) -> Result<T>
    where
        T: DeserializeOwned,
        D: FnOnce() -> T,
    {
        let operation = format!("read {}", display_name(path));
        let mut last_failure = ReadFailure::Io;

        let outcome = self.read_retry.execute(&operation, |_| {
            let result = read_attempt::<T>(path);
            if let Err(failure) = &result {
                last_failure = *failure;
            }
            result.map_err(|failure| match failure {
                ReadFailure::Io => StoreError::TransientIo(format!("{:?} is not readable", path)),
                ReadFailure::Syntax => StoreError::TransientIo(format!("{:?} is not valid JSON", path)),
            })
        });

        match outcome {
            Ok(ReadAttempt::Missing) => {
                debug!("Document absent, using defaults: path={:?}", path);
                Ok(default())
            }
            Ok(ReadAttempt::Parsed(document)) => Ok(document),
            Ok(ReadAttempt::Garbage(reason)) => {
                self.recover_corrupt::<T>(path, &reason, lock_held);
                Ok(default())
            }
            Err(StoreError::RetryExhausted { .. }) if last_failure == ReadFailure::Syntax => {
                self.recover_corrupt::<T>(path, "content is not valid JSON", lock_held);
                Ok(default())
            }
            Err(StoreError::RetryExhausted { attempts, last_error, .. }) => {
                Err(StoreError::DocumentUnavailable(format!(
                    "{:?} unreadable after {} attempts: {}",
                    path, attempts, last_error
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Log and optionally move aside a corrupt document
    fn recover_corrupt<T: DeserializeOwned>(&self, path: &Path, reason: &str, lock_held: bool) {
        let corrupt = StoreError::DocumentCorrupt(format!("{:?}: {}", path, reason));
        warn!("Recovering corrupt document with defaults: {}", corrupt);

        if !self.backup_corrupt_files {
            return;
        }

        if lock_held {
            self.backup_corrupt(path);
            return;
        }

        // Only move the file while no writer can be replacing it, and only if
        // it is still corrupt once we hold the lock
        let lock_path = Self::lock_path(path);
        let Ok(lock_file) = open_lock_file(&lock_path) else {
            return;
        };
        let guard = match acquire_exclusive(self.lock.as_ref(), &lock_file) {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Skipping corrupt document backup, lock busy: path={:?}", path);
                return;
            }
        };
        let still_corrupt = matches!(
            read_attempt::<T>(path),
            Err(ReadFailure::Syntax) | Ok(ReadAttempt::Garbage(_))
        );
        if still_corrupt {
            self.backup_corrupt(path);
        }
        drop(guard);
    }

    /// Move `path` to `<file>.backup`, or to a timestamped backup if that
    /// name is already taken by an earlier corruption
    fn backup_corrupt(&self, path: &Path) {
        let primary = Self::backup_path(path);
        let backup = if primary.exists() {
            let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
            with_suffix(path, &format!(".{}{}", stamp, BACKUP_SUFFIX))
        } else {
            primary
        };
        match fs::rename(path, &backup) {
            Ok(()) => info!("Moved corrupt document aside: path={:?}, backup={:?}", path, backup),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to back up corrupt document: path={:?}, backup={:?}, error={}",
                path, backup, e
            ),
        }
    }
}

/// One read of `path`; `Err` means retry
fn read_attempt<T: DeserializeOwned>(path: &Path) -> std::result::Result<ReadAttempt<T>, ReadFailure> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ReadAttempt::Missing),
        Err(e) => {
            debug!("Document read failed: path={:?}, error={}", path, e);
            return Err(ReadFailure::Io);
        }
    };

    let value: serde_json::Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => {
            debug!("Document is not valid JSON: path={:?}, error={}", path, e);
            return Err(ReadFailure::Syntax);
        }
    };

    match serde_json::from_value::<T>(value) {
        Ok(document) => Ok(ReadAttempt::Parsed(document)),
        Err(e) => Ok(ReadAttempt::Garbage(e.to_string())),
    }
}

fn lock_error(err: LockAttemptError, lock_path: &Path) -> StoreError {
    match err {
        LockAttemptError::WouldBlock => {
            StoreError::LockContention(format!("{:?} is locked by another writer", lock_path))
        }
        LockAttemptError::Io(e) => transient("lock", lock_path, e),
    }
}

fn transient(action: &str, path: &Path, err: io::Error) -> StoreError {
    StoreError::TransientIo(format!("Failed to {} {:?}: {}", action, path, err))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Persist the rename itself; best effort
fn sync_parent_dir(path: &Path) {
    #[cfg(unix)]
    {
        if let Ok(dir) = fs::File::open(parent_dir(path)) {
            if let Err(e) = dir.sync_all() {
                debug!("Directory fsync failed (non-fatal): path={:?}, error={}", path, e);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}
