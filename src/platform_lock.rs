//! Platform Lock Module
//!
//! Non-blocking exclusive advisory locks on open file handles. The OS-specific
//! primitive (flock on Unix, LockFileEx on Windows) comes from `fs2`; callers only
//! see the [`FileLock`] trait and never branch on platform.

use fs2::FileExt;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use tracing::{debug, warn};

/// Outcome of a failed non-blocking lock attempt
#[derive(Debug)]
pub enum LockAttemptError {
    /// The lock is held by another handle or process
    WouldBlock,
    /// Locking failed for a reason other than contention
    Io(io::Error),
}

impl fmt::Display for LockAttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockAttemptError::WouldBlock => write!(f, "lock is held by another process"),
            LockAttemptError::Io(e) => write!(f, "lock attempt failed: {}", e),
        }
    }
}

impl std::error::Error for LockAttemptError {}

/// Exclusive advisory lock primitive
///
/// Implementations must return immediately: [`LockAttemptError::WouldBlock`] when
/// the lock is held elsewhere, never wait for it.
pub trait FileLock: Send + Sync + fmt::Debug {
    fn try_lock_exclusive(&self, file: &File) -> std::result::Result<(), LockAttemptError>;

    fn unlock(&self, file: &File) -> io::Result<()>;
}

/// OS advisory lock backed by `fs2`
#[derive(Debug, Default, Clone, Copy)]
pub struct Fs2FileLock;

impl FileLock for Fs2FileLock {
    fn try_lock_exclusive(&self, file: &File) -> std::result::Result<(), LockAttemptError> {
        match FileExt::try_lock_exclusive(file) {
            Ok(()) => Ok(()),
            Err(e) if is_contended(&e) => Err(LockAttemptError::WouldBlock),
            Err(e) => Err(LockAttemptError::Io(e)),
        }
    }

    fn unlock(&self, file: &File) -> io::Result<()> {
        FileExt::unlock(file)
    }
}

/// Whether an error from `try_lock_exclusive` means "held elsewhere"
fn is_contended(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::WouldBlock {
        return true;
    }
    let contended = fs2::lock_contended_error();
    err.raw_os_error().is_some() && err.raw_os_error() == contended.raw_os_error()
}

/// Held exclusive lock; released on [`LockGuard::release`] or drop
pub struct LockGuard<'a> {
    lock: &'a dyn FileLock,
    file: &'a File,
    released: bool,
}

impl<'a> LockGuard<'a> {
    /// Release explicitly, surfacing any unlock error
    pub fn release(mut self) -> io::Result<()> {
        self.released = true;
        self.lock.unlock(self.file)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.lock.unlock(self.file) {
            // Closing the handle releases the lock anyway
            warn!("Failed to release file lock on drop: error={}", e);
        }
    }
}

/// Attempt to take the exclusive lock on `file` without waiting
pub fn acquire_exclusive<'a>(
    lock: &'a dyn FileLock,
    file: &'a File,
) -> std::result::Result<LockGuard<'a>, LockAttemptError> {
    lock.try_lock_exclusive(file)?;
    Ok(LockGuard {
        lock,
        file,
        released: false,
    })
}

/// Open (creating if needed) the sidecar file used as the lock rendezvous point
pub fn open_lock_file(lock_path: &Path) -> io::Result<File> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    debug!("Opened lock file: path={:?}", lock_path);
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("doc.json.lock");
        let file = open_lock_file(&lock_path).unwrap();
        let lock = Fs2FileLock;

        let guard = acquire_exclusive(&lock, &file).unwrap();
        guard.release().unwrap();

        // Re-acquirable after release
        let guard = acquire_exclusive(&lock, &file).unwrap();
        drop(guard);
    }

    #[test]
    fn test_second_handle_would_block() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("doc.json.lock");
        let first = open_lock_file(&lock_path).unwrap();
        let second = open_lock_file(&lock_path).unwrap();
        let lock = Fs2FileLock;

        let _held = acquire_exclusive(&lock, &first).unwrap();
        match acquire_exclusive(&lock, &second) {
            Err(LockAttemptError::WouldBlock) => {}
            Err(e) => panic!("Expected WouldBlock, got: {:?}", e),
            Ok(_) => panic!("Expected contention, got lock"),
        };
    }

    #[test]
    fn test_drop_releases_lock() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("doc.json.lock");
        let first = open_lock_file(&lock_path).unwrap();
        let second = open_lock_file(&lock_path).unwrap();
        let lock = Fs2FileLock;

        {
            let _held = acquire_exclusive(&lock, &first).unwrap();
        }
        assert!(acquire_exclusive(&lock, &second).is_ok());
    }

    #[test]
    fn test_open_lock_file_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let lock_path = temp_dir.path().join("Stats").join("nested").join("x.lock");
        open_lock_file(&lock_path).unwrap();
        assert!(lock_path.exists());
    }
}
