//! Advisory file locking
//!
//! Cache and user-tag files are guarded by an advisory lock taken on a
//! `<path>.lock` sentinel next to the target file. The lock is cooperative:
//! it only coordinates processes that also go through this module. The
//! sentinel records who acquired it and when, and is removed on release; a
//! sentinel left behind points at a holder that crashed.
//!
//! Acquisition is bounded: we retry until the configured timeout and then
//! fail with `LockTimeout` rather than blocking indefinitely.

use crate::error::{UpstackError, UpstackResult};
use chrono::Utc;
use fs4::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const RETRY_INTERVAL: Duration = Duration::from_millis(25);

/// Identity of the current user, recorded into lock sentinels
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Path of the lock sentinel guarding a target file
pub fn lock_path(target: &Path) -> PathBuf {
    let mut path = target.as_os_str().to_os_string();
    path.push(".lock");
    PathBuf::from(path)
}

/// An exclusive advisory lock, released on drop
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquire an exclusive lock guarding `target`, waiting up to `timeout`
    pub fn acquire(target: &Path, owner: &str, timeout: Duration) -> UpstackResult<Self> {
        let path = lock_path(target);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| UpstackError::io(format!("opening lock file {}", path.display()), e))?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if started.elapsed() >= timeout {
                        return Err(UpstackError::LockTimeout {
                            path,
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(UpstackError::io(
                        format!("locking {}", path.display()),
                        e,
                    ))
                }
            }
        }

        file.set_len(0)
            .and_then(|_| writeln!(file, "{} {}", owner, Utc::now().to_rfc3339()))
            .map_err(|e| UpstackError::io(format!("writing lock file {}", path.display()), e))?;

        debug!("Acquired lock {}", path.display());
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
        // a waiter holding an open handle is unaffected: the lock follows
        // the open file, not the path
        let _ = fs::remove_file(&self.path);
        debug!("Released lock {}", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(
            lock_path(Path::new("/tmp/Linux64.cacheDB1_0_0")),
            PathBuf::from("/tmp/Linux64.cacheDB1_0_0.lock")
        );
    }

    #[test]
    fn acquire_writes_owner() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("snapshot");

        let lock = FileLock::acquire(&target, "alice", Duration::from_secs(1)).unwrap();
        let content = fs::read_to_string(lock.path()).unwrap();
        assert!(content.starts_with("alice "));
    }

    #[test]
    fn release_removes_sentinel() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("snapshot");

        let lock = FileLock::acquire(&target, "alice", Duration::from_secs(1)).unwrap();
        let sentinel = lock.path().to_path_buf();
        assert!(sentinel.exists());

        drop(lock);
        assert!(!sentinel.exists());
    }

    #[test]
    fn reacquire_after_release() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("snapshot");

        let first = FileLock::acquire(&target, "alice", Duration::from_secs(1)).unwrap();
        drop(first);
        // released on drop, so a second acquisition must not time out
        FileLock::acquire(&target, "bob", Duration::from_millis(200)).unwrap();
    }

    #[test]
    fn contended_lock_times_out() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("snapshot");

        let _held = FileLock::acquire(&target, "alice", Duration::from_secs(1)).unwrap();
        let path = target.clone();
        // locks are per file description, so contend from another thread
        // holding its own handle
        let result = std::thread::spawn(move || {
            FileLock::acquire(&path, "bob", Duration::from_millis(100))
        })
        .join()
        .unwrap();

        assert!(matches!(result, Err(UpstackError::LockTimeout { .. })));
    }

    #[test]
    fn current_user_is_nonempty() {
        assert!(!current_user().is_empty());
    }
}
