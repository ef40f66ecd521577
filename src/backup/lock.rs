//! Exclusive per-destination lock.
//!
//! Mutual exclusion comes from `flock(2)` on `<destination>/.lock`; the JSON record inside only
//! identifies the holder and lets a crashed holder be recognised. A process that fails to get
//! the lock never writes anything.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use chrono::{DateTime, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

pub static LOCK_FILE_NAME: &str = ".lock";

static MAX_ACQUIRE_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, Display, Serialize, Deserialize, PartialEq, Eq, Getters, CopyGetters)]
#[display("pid {pid} on {host} since {acquired_at}")]
pub struct LockRecord {
    #[getset(get_copy = "pub")]
    pid: u32,
    #[getset(get = "pub")]
    host: String,
    #[getset(get_copy = "pub")]
    acquired_at: DateTime<Utc>,
}

impl LockRecord {
    fn current(host: &str) -> Self {
        Self {
            pid: std::process::id(),
            host: host.to_string(),
            acquired_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Getters)]
pub struct LockManager {
    #[getset(get = "pub")]
    path: PathBuf,
    host: String,
}

/// Held lock. Released explicitly or on drop.
pub struct Lock {
    path: PathBuf,
    record: LockRecord,
    file: Option<Flock<File>>,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("path", &self.path)
            .field("record", &self.record)
            .field("held", &self.file.is_some())
            .finish()
    }
}

impl Lock {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    fn unlock(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // Remove before unlocking so a waiter never locks a file about to vanish.
        let removed = std::fs::remove_file(&self.path);
        drop(file);
        match removed {
            Ok(_) => {
                tracing::debug!("Released lock {:?}", self.path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::from(e).add_msg(format!("Remove lock {:?} failed", self.path))),
        }
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            tracing::warn!("{}", e);
        }
    }
}

fn local_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|e| {
            tracing::warn!("Cannot read hostname, using \"localhost\": {}", e);
            "localhost".to_string()
        })
}

fn read_record(file: &mut File) -> Result<Option<LockRecord>> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    if contents.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&contents)?))
}

fn write_record(file: &mut File, record: &LockRecord) -> Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(serde_json::to_string(record)?.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

impl LockManager {
    pub fn new<P: AsRef<Path>>(destination: P) -> Self {
        Self::with_host(destination, local_host())
    }

    fn with_host<P: AsRef<Path>, S: Into<String>>(destination: P, host: S) -> Self {
        Self {
            path: destination.as_ref().join(LOCK_FILE_NAME),
            host: host.into(),
        }
    }

    /// Takes the lock, reclaiming it from a holder that died without releasing it.
    ///
    /// Fails with `LockContention` naming the holder when another live process has it.
    pub fn acquire(&self) -> Result<Lock> {
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&self.path)
                .map_err(Error::from)
                .add_msg(format!("Open lock file {:?} failed", self.path))?;

            let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(locked) => locked,
                Err((mut file, Errno::EWOULDBLOCK)) => {
                    let holder = read_record(&mut file)
                        .ok()
                        .flatten()
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "another process".to_string());
                    tracing::warn!("Destination locked by {}", holder);
                    return Err(Error::lock_contention(holder));
                }
                Err((_, errno)) => return Err(errno.into()),
            };

            // The previous holder may have unlinked the file between our open and flock.
            let same_file = std::fs::metadata(&self.path)
                .map(|on_disk| {
                    file.metadata()
                        .map(|held| held.ino() == on_disk.ino() && held.dev() == on_disk.dev())
                        .unwrap_or(false)
                })
                .unwrap_or(false);
            if !same_file {
                tracing::debug!("Lock file {:?} replaced while locking, retrying", self.path);
                continue;
            }

            match read_record(&mut file) {
                Ok(Some(record)) if !self.is_stale(&record) => {
                    tracing::warn!("Lock record names live holder {}", record);
                    return Err(Error::lock_contention(record.to_string()));
                }
                Ok(Some(record)) => tracing::warn!("Reclaiming stale lock held by {}", record),
                Ok(None) => {}
                Err(e) => tracing::warn!("Overwriting unreadable lock record: {}", e),
            }

            let record = LockRecord::current(&self.host);
            write_record(&mut file, &record)?;
            tracing::debug!("Acquired lock {:?} as {}", self.path, record);
            return Ok(Lock {
                path: self.path.clone(),
                record,
                file: Some(file),
            });
        }

        Err(Error::lock_contention(format!(
            "an unstable lock file at {:?}",
            self.path
        )))
    }

    pub fn release(&self, mut lock: Lock) -> Result<()> {
        lock.unlock()
    }

    /// A record is stale when its process no longer exists on this host.
    /// Records from other hosts are never considered stale.
    pub fn is_stale(&self, record: &LockRecord) -> bool {
        if record.host != self.host {
            return false;
        }
        if record.pid == std::process::id() {
            // Our pid but not our flock: a previous process that reused it.
            return true;
        }
        let Ok(pid) = i32::try_from(record.pid) else {
            return true;
        };
        match kill(Pid::from_raw(pid), None) {
            Ok(_) => false,
            Err(Errno::ESRCH) => true,
            Err(_) => false,
        }
    }

    /// Current holder as recorded in the lock file, if any.
    pub fn holder(&self) -> Result<Option<LockRecord>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        read_record(&mut file)
    }

    /// Whether some process currently holds the lock. Never modifies the lock file.
    pub fn is_locked(&self) -> Result<bool> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        match Flock::lock(file, FlockArg::LockSharedNonblock) {
            Ok(_) => Ok(false),
            Err((_, Errno::EWOULDBLOCK)) => Ok(true),
            Err((_, errno)) => Err(errno.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_raw_record(dir: &Path, record: &LockRecord) {
        std::fs::write(
            dir.join(LOCK_FILE_NAME),
            serde_json::to_string(record).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_acquire_release_cycle() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());

        let lock = manager.acquire().unwrap();
        assert_eq!(lock.record().pid(), std::process::id());
        assert!(manager.is_locked().unwrap());
        assert_eq!(manager.holder().unwrap().unwrap(), *lock.record());

        manager.release(lock).unwrap();
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
        assert!(!manager.is_locked().unwrap());

        let again = manager.acquire().unwrap();
        drop(again);
        assert!(!dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_second_acquire_is_contention_and_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        let _lock = manager.acquire().unwrap();
        let before = std::fs::read(dir.path().join(LOCK_FILE_NAME)).unwrap();

        let err = LockManager::new(dir.path()).acquire().unwrap_err();
        assert!(err.is_lock_contention());
        assert!(err.to_string().contains(&format!("pid {}", std::process::id())));
        assert_eq!(std::fs::read(dir.path().join(LOCK_FILE_NAME)).unwrap(), before);
    }

    #[test]
    fn test_stale_record_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::with_host(dir.path(), "test-host");
        let dead = LockRecord {
            pid: 2_000_000_000,
            host: "test-host".to_string(),
            acquired_at: Utc::now(),
        };
        assert!(manager.is_stale(&dead));
        write_raw_record(dir.path(), &dead);

        let lock = manager.acquire().unwrap();
        assert_eq!(lock.record().pid(), std::process::id());
        assert_eq!(manager.holder().unwrap().unwrap().pid(), std::process::id());
    }

    #[test]
    fn test_live_record_without_flock_is_contention() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::with_host(dir.path(), "test-host");
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        let live = LockRecord {
            pid: child.id(),
            host: "test-host".to_string(),
            acquired_at: Utc::now(),
        };
        write_raw_record(dir.path(), &live);

        let res = manager.acquire();
        child.kill().unwrap();
        child.wait().unwrap();

        assert!(res.unwrap_err().is_lock_contention());
        assert_eq!(manager.holder().unwrap().unwrap(), live);
    }

    #[test]
    fn test_foreign_host_is_never_stale() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::with_host(dir.path(), "here");
        let foreign = LockRecord {
            pid: 2_000_000_000,
            host: "elsewhere".to_string(),
            acquired_at: Utc::now(),
        };
        assert!(!manager.is_stale(&foreign));
        write_raw_record(dir.path(), &foreign);

        assert!(manager.acquire().unwrap_err().is_lock_contention());
    }

    #[test]
    fn test_empty_or_garbage_lock_file_is_taken() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        std::fs::write(dir.path().join(LOCK_FILE_NAME), "").unwrap();
        drop(manager.acquire().unwrap());

        std::fs::write(dir.path().join(LOCK_FILE_NAME), "garbage").unwrap();
        assert!(manager.acquire().is_ok());
    }

    #[test]
    fn test_holder_without_lock_file() {
        let dir = TempDir::new().unwrap();
        let manager = LockManager::new(dir.path());
        assert!(manager.holder().unwrap().is_none());
        assert!(!manager.is_locked().unwrap());
    }
}
