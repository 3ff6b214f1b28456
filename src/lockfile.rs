//! Cross-process lock files with last-writer tokens.
//!
//! Every metadata store is guarded by one lock file. POSIX fcntl locks give
//! cross-process shared/exclusive semantics; an in-process `RwLock` covers
//! threads of the same process, which fcntl locks do not exclude.
//!
//! # LastWrite token
//!
//! The lock file stores a 64-byte "last write" token that lets a process
//! detect whether any writer has touched shared state since it last loaded
//! its caches, without re-reading the state itself. The format is:
//! - bytes 0-7: Unix timestamp (nanoseconds, little-endian)
//! - bytes 8-15: Counter (little-endian)
//! - bytes 16-19: Process ID (little-endian)
//! - bytes 20-63: Random bytes
//!
//! Writers call [`LockFile::record_write`] while holding the exclusive lock;
//! readers compare tokens with [`LockFile::modified_since`] while holding
//! either lock mode.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rustix::fs::{fcntl_lock, FlockOperation};

/// Size of the LastWrite token in bytes.
const LAST_WRITE_SIZE: usize = 64;

/// In-process counter feeding the token; distinguishes writes from the same
/// pid within one nanosecond tick.
static LAST_WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Error types for lock file operations.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// I/O error during lock file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lock file operation failed.
    #[error("lock operation failed: {0}")]
    LockFailed(#[from] rustix::io::Errno),

    /// Would block on non-blocking lock attempt.
    #[error("lock would block")]
    WouldBlock,

    /// The lock file was opened read-only and cannot record writes.
    #[error("lock file {0} is read-only")]
    ReadOnly(PathBuf),
}

/// Result type for lock file operations.
pub type Result<T> = std::result::Result<T, LockError>;

/// A 64-byte token representing the last write to the lock file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWrite {
    timestamp_nanos: u64,
    counter: u64,
    pid: u32,
    random: [u8; 44],
}

impl LastWrite {
    /// Generate a fresh token for the current process.
    fn new() -> Self {
        let timestamp_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut random = [0u8; 44];
        rand::rng().fill_bytes(&mut random);
        Self {
            timestamp_nanos,
            counter: LAST_WRITE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1,
            pid: rustix::process::getpid().as_raw_nonzero().get() as u32,
            random,
        }
    }

    /// Deserialize a LastWrite token from a 64-byte array.
    fn from_bytes(buf: &[u8; LAST_WRITE_SIZE]) -> Self {
        let timestamp_nanos = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let counter = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let pid = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let mut random = [0u8; 44];
        random.copy_from_slice(&buf[20..64]);

        Self {
            timestamp_nanos,
            counter,
            pid,
            random,
        }
    }

    /// Serialize the token to its on-disk form.
    fn to_bytes(&self) -> [u8; LAST_WRITE_SIZE] {
        let mut buf = [0u8; LAST_WRITE_SIZE];
        buf[0..8].copy_from_slice(&self.timestamp_nanos.to_le_bytes());
        buf[8..16].copy_from_slice(&self.counter.to_le_bytes());
        buf[16..20].copy_from_slice(&self.pid.to_le_bytes());
        buf[20..64].copy_from_slice(&self.random);
        buf
    }

    /// Check if this token represents an empty/uninitialized state.
    pub fn is_empty(&self) -> bool {
        self.timestamp_nanos == 0 && self.counter == 0 && self.pid == 0
    }
}

impl Default for LastWrite {
    fn default() -> Self {
        Self {
            timestamp_nanos: 0,
            counter: 0,
            pid: 0,
            random: [0u8; 44],
        }
    }
}

/// A file-based lock with shared and exclusive modes.
#[derive(Debug)]
pub struct LockFile {
    /// Path to the lock file.
    path: PathBuf,
    /// File descriptor for the lock file.
    fd: OwnedFd,
    /// Whether the file was opened with write access.
    read_write: bool,
    /// In-process synchronization lock.
    in_process_lock: RwLock<()>,
    /// Live shared holders of the fcntl record. fcntl locks belong to the
    /// whole process, so the record is released only when the last reader
    /// in this process lets go.
    shared_holders: Mutex<u64>,
}

/// RAII guard for a shared (read) lock. Released on drop.
#[derive(Debug)]
pub struct RLockGuard<'a> {
    lockfile: &'a LockFile,
    _guard: RwLockReadGuard<'a, ()>,
}

impl Drop for RLockGuard<'_> {
    fn drop(&mut self) {
        let mut holders = self
            .lockfile
            .shared_holders
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *holders -= 1;
        if *holders == 0 {
            let _ = fcntl_lock(self.lockfile.fd.as_fd(), FlockOperation::Unlock);
        }
    }
}

/// RAII guard for an exclusive (write) lock. Released on drop.
#[derive(Debug)]
pub struct WLockGuard<'a> {
    lockfile: &'a LockFile,
    _guard: RwLockWriteGuard<'a, ()>,
}

impl Drop for WLockGuard<'_> {
    fn drop(&mut self) {
        let _ = fcntl_lock(self.lockfile.fd.as_fd(), FlockOperation::Unlock);
    }
}

impl LockFile {
    /// Open a lock file, creating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_mode(path, true)
    }

    /// Open an existing lock file without write access.
    ///
    /// Such a lock can only be acquired in shared mode and cannot record
    /// writes.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_mode(path, false)
    }

    fn open_mode<P: AsRef<Path>>(path: P, read_write: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = if read_write {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?
        } else {
            OpenOptions::new().read(true).open(&path)?
        };

        let fd: OwnedFd = file.into();

        Ok(Self {
            path,
            fd,
            read_write,
            in_process_lock: RwLock::new(()),
            shared_holders: Mutex::new(0),
        })
    }

    /// Get the path to the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the lock can be acquired exclusively.
    pub fn is_read_write(&self) -> bool {
        self.read_write
    }

    /// Acquire a shared (read) lock, blocking until available.
    pub fn rlock(&self) -> RLockGuard<'_> {
        let guard = self
            .in_process_lock
            .read()
            .unwrap_or_else(|e| e.into_inner());

        let mut holders = self.shared_holders.lock().unwrap_or_else(|e| e.into_inner());
        if *holders == 0 {
            fcntl_lock(self.fd.as_fd(), FlockOperation::LockShared)
                .expect("fcntl_lock failed unexpectedly");
        }
        *holders += 1;
        drop(holders);

        RLockGuard {
            lockfile: self,
            _guard: guard,
        }
    }

    /// Acquire the exclusive (write) lock, blocking until available.
    ///
    /// # Panics
    ///
    /// Panics when called on a lock opened read-only; that is a programming
    /// error, not a runtime condition.
    pub fn lock(&self) -> WLockGuard<'_> {
        assert!(self.read_write, "exclusive lock on read-only lock file");
        let guard = self
            .in_process_lock
            .write()
            .unwrap_or_else(|e| e.into_inner());

        fcntl_lock(self.fd.as_fd(), FlockOperation::LockExclusive)
            .expect("fcntl_lock failed unexpectedly");

        WLockGuard {
            lockfile: self,
            _guard: guard,
        }
    }

    /// Try to acquire a shared (read) lock without blocking.
    ///
    /// Returns `Err(LockError::WouldBlock)` if the lock is not available.
    pub fn try_rlock(&self) -> Result<RLockGuard<'_>> {
        let guard = self
            .in_process_lock
            .try_read()
            .map_err(|_| LockError::WouldBlock)?;

        let mut holders = self.shared_holders.lock().unwrap_or_else(|e| e.into_inner());
        if *holders == 0 {
            match fcntl_lock(self.fd.as_fd(), FlockOperation::NonBlockingLockShared) {
                Ok(()) => {}
                Err(rustix::io::Errno::AGAIN) => return Err(LockError::WouldBlock),
                Err(e) => return Err(LockError::LockFailed(e)),
            }
        }
        *holders += 1;
        drop(holders);

        Ok(RLockGuard {
            lockfile: self,
            _guard: guard,
        })
    }

    /// Try to acquire the exclusive (write) lock without blocking.
    pub fn try_lock(&self) -> Result<WLockGuard<'_>> {
        if !self.read_write {
            return Err(LockError::ReadOnly(self.path.clone()));
        }
        let guard = self
            .in_process_lock
            .try_write()
            .map_err(|_| LockError::WouldBlock)?;

        match fcntl_lock(self.fd.as_fd(), FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => Ok(WLockGuard {
                lockfile: self,
                _guard: guard,
            }),
            Err(rustix::io::Errno::AGAIN) => Err(LockError::WouldBlock),
            Err(e) => Err(LockError::LockFailed(e)),
        }
    }

    /// Read the current LastWrite token from the lock file.
    ///
    /// Callers must hold the lock in either mode.
    pub fn get_last_write(&self) -> Result<LastWrite> {
        let mut file = self.as_file()?;
        file.seek(SeekFrom::Start(0))?;

        let mut buf = [0u8; LAST_WRITE_SIZE];
        match file.read_exact(&mut buf) {
            Ok(()) => Ok(LastWrite::from_bytes(&buf)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                // File is empty or too small - treat as never written
                Ok(LastWrite::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a fresh LastWrite token and return it.
    ///
    /// Callers must hold the exclusive lock.
    pub fn record_write(&self) -> Result<LastWrite> {
        if !self.read_write {
            return Err(LockError::ReadOnly(self.path.clone()));
        }
        let token = LastWrite::new();
        let mut file = self.as_file()?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&token.to_bytes())?;
        Ok(token)
    }

    /// Compare the on-disk token against a previously observed one.
    ///
    /// Returns the current token and whether it differs from `prev`.
    /// Callers must hold the lock in either mode; if this fails, the caller
    /// should keep using `prev` so the next call still reports the missed
    /// modification.
    pub fn modified_since(&self, prev: &LastWrite) -> Result<(LastWrite, bool)> {
        let current = self.get_last_write()?;
        let modified = current != *prev;
        Ok((current, modified))
    }

    /// Borrow the fd as a `File` for token I/O without taking ownership.
    fn as_file(&self) -> Result<File> {
        let duped = rustix::io::fcntl_dupfd_cloexec(self.fd.as_fd(), 0)?;
        Ok(File::from(duped))
    }

    #[cfg(test)]
    fn shared_holder_count(&self) -> u64 {
        *self.shared_holders.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lastwrite_default_is_empty() {
        let token = LastWrite::default();
        assert!(token.is_empty());
    }

    #[test]
    fn test_lastwrite_roundtrip() {
        let token = LastWrite::new();
        assert!(!token.is_empty());
        assert_eq!(LastWrite::from_bytes(&token.to_bytes()), token);
    }

    #[test]
    fn test_basic_lock_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let lockfile = LockFile::open(&path).unwrap();

        {
            let _guard = lockfile.rlock();
        }
        {
            let _guard = lockfile.lock();
        }
        assert!(lockfile.try_lock().is_ok());
    }

    #[test]
    fn test_record_write_changes_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let lockfile = LockFile::open(&path).unwrap();

        let guard = lockfile.lock();
        let before = lockfile.get_last_write().unwrap();
        assert!(before.is_empty());

        let written = lockfile.record_write().unwrap();
        let (current, modified) = lockfile.modified_since(&before).unwrap();
        assert!(modified);
        assert_eq!(current, written);

        let (_, modified) = lockfile.modified_since(&written).unwrap();
        assert!(!modified);
        drop(guard);
    }

    #[test]
    fn test_shared_record_outlives_first_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let lockfile = LockFile::open(&path).unwrap();

        // Overlapping readers share one process-wide fcntl record; only the
        // last one out may release it.
        let first = lockfile.rlock();
        let second = lockfile.rlock();
        assert_eq!(lockfile.shared_holder_count(), 2);

        drop(first);
        assert_eq!(lockfile.shared_holder_count(), 1);

        let third = lockfile.try_rlock().unwrap();
        assert_eq!(lockfile.shared_holder_count(), 2);

        drop(second);
        drop(third);
        assert_eq!(lockfile.shared_holder_count(), 0);
        assert!(lockfile.try_lock().is_ok());
    }

    #[test]
    fn test_read_only_cannot_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");
        std::fs::write(&path, [0u8; 64]).unwrap();

        let lockfile = LockFile::open_read_only(&path).unwrap();
        let _guard = lockfile.rlock();
        assert!(matches!(
            lockfile.record_write(),
            Err(LockError::ReadOnly(_))
        ));
    }
}
