//! Backups that could not run because their destination was away, kept on disk until it is back.
//!
//! One file serves every job of the user:
//!
//! ```text
//! ~/.cache/dev-backup/queue.json
//! { "version": 1, "queue": [ { "destination": "/Volumes/Backup/dev", ... } ] }
//! ```
//!
//! Repeated misses of the same destination collapse into one entry whose `attempts` grows.

use crate::backup::atomic_json::{read_json, write_json_atomic};
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use bon::Builder;
use chrono::{DateTime, Utc};
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub static QUEUE_FILE_NAME: &str = "queue.json";
pub static QUEUE_REASON_UNAVAILABLE: &str = "destination_unavailable";
static QUEUE_DIR_NAME: &str = "dev-backup";
static QUEUE_VERSION: u32 = 1;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Builder, Getters, CopyGetters)]
pub struct QueuedBackup {
    #[getset(get = "pub")]
    sources: Vec<PathBuf>,
    #[builder(into)]
    #[getset(get = "pub")]
    destination: PathBuf,
    #[getset(get_copy = "pub")]
    queued_at: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    last_attempt: DateTime<Utc>,
    #[builder(into)]
    #[getset(get = "pub")]
    reason: String,
    /// Runs deferred for this destination so far, the first one included.
    #[getset(get_copy = "pub")]
    attempts: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueFile {
    version: u32,
    queue: Vec<QueuedBackup>,
}

#[derive(Clone, Debug, Getters)]
#[getset(get = "pub")]
pub struct BackupQueue {
    path: PathBuf,
}

impl BackupQueue {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(QUEUE_DIR_NAME)
            .join(QUEUE_FILE_NAME)
    }

    /// Every queued backup, oldest first. An unreadable queue file counts as empty.
    pub fn all(&self) -> Vec<QueuedBackup> {
        match read_json::<QueueFile, _>(&self.path) {
            Ok(Some(file)) if file.version == QUEUE_VERSION => file.queue,
            Ok(Some(file)) => {
                tracing::warn!(
                    "Ignoring queue {:?} with unknown version {}",
                    self.path,
                    file.version
                );
                vec![]
            }
            Ok(None) => vec![],
            Err(e) => {
                tracing::warn!("Ignoring unreadable queue: {}", e);
                vec![]
            }
        }
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    pub fn is_empty(&self) -> bool {
        self.all().is_empty()
    }

    pub fn pending_for<P: AsRef<Path>>(&self, destination: P) -> Vec<QueuedBackup> {
        self.all()
            .into_iter()
            .filter(|q| q.destination == destination.as_ref())
            .collect()
    }

    fn save(&self, queue: Vec<QueuedBackup>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        write_json_atomic(
            &self.path,
            &QueueFile {
                version: QUEUE_VERSION,
                queue,
            },
        )
        .add_msg(format!("Saving backup queue {:?} failed", self.path))
    }

    /// Records a deferred run. A destination already waiting keeps its place and gains an attempt.
    pub fn enqueue<P: AsRef<Path>>(
        &self,
        sources: &[PathBuf],
        destination: P,
        reason: &str,
    ) -> Result<QueuedBackup> {
        let destination = destination.as_ref();
        let now = Utc::now();
        let mut queue = self.all();
        let queued = match queue.iter_mut().find(|q| q.destination == destination) {
            Some(existing) => {
                existing.sources = sources.to_vec();
                existing.last_attempt = now;
                existing.reason = reason.to_string();
                existing.attempts += 1;
                existing.clone()
            }
            None => {
                let queued = QueuedBackup::builder()
                    .sources(sources.to_vec())
                    .destination(destination)
                    .queued_at(now)
                    .last_attempt(now)
                    .reason(reason)
                    .attempts(1)
                    .build();
                queue.push(queued.clone());
                queued
            }
        };
        self.save(queue)?;
        tracing::info!(
            "Queued backup to {:?} ({}), {} attempts so far",
            destination,
            reason,
            queued.attempts
        );
        Ok(queued)
    }

    /// Drops the entries of `destination` once a backup to it went through.
    pub fn remove_by_destination<P: AsRef<Path>>(&self, destination: P) -> Result<usize> {
        let queue = self.all();
        let before = queue.len();
        let rest: Vec<_> = queue
            .into_iter()
            .filter(|q| q.destination != destination.as_ref())
            .collect();
        let removed = before - rest.len();
        if removed > 0 {
            self.save(rest)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<usize> {
        let removed = self.len();
        if removed > 0 {
            self.save(vec![])?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queue(dir: &TempDir) -> BackupQueue {
        BackupQueue::new(dir.path().join("cache/dev-backup").join(QUEUE_FILE_NAME))
    }

    #[test]
    fn test_missing_file_is_empty_and_not_created() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        assert!(q.is_empty());
        assert_eq!(q.remove_by_destination("/Volumes/Backup").unwrap(), 0);
        assert_eq!(q.clear().unwrap(), 0);
        assert!(!q.path().exists());
    }

    #[test]
    fn test_enqueue_coalesces_per_destination() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let sources = vec![PathBuf::from("/home/dev/app")];

        let first = q
            .enqueue(&sources, "/Volumes/Backup/dev", QUEUE_REASON_UNAVAILABLE)
            .unwrap();
        assert_eq!(first.attempts(), 1);
        q.enqueue(&sources, "/Volumes/Other", QUEUE_REASON_UNAVAILABLE)
            .unwrap();
        let again = q
            .enqueue(&sources, "/Volumes/Backup/dev", QUEUE_REASON_UNAVAILABLE)
            .unwrap();

        assert_eq!(again.attempts(), 2);
        assert_eq!(again.queued_at(), first.queued_at());
        assert!(again.last_attempt() >= first.last_attempt());
        let all = q.all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].destination(), Path::new("/Volumes/Backup/dev"));
        assert_eq!(q.pending_for("/Volumes/Other").len(), 1);
        assert!(q.pending_for("/Volumes/Nope").is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        for dst in ["/Volumes/A", "/Volumes/B", "/Volumes/C"] {
            q.enqueue(&[], dst, QUEUE_REASON_UNAVAILABLE).unwrap();
        }

        assert_eq!(q.remove_by_destination("/Volumes/B").unwrap(), 1);
        assert_eq!(q.remove_by_destination("/Volumes/B").unwrap(), 0);
        assert_eq!(q.len(), 2);
        assert_eq!(q.clear().unwrap(), 2);
        assert!(q.is_empty());
        assert!(q.path().exists());
    }

    #[test]
    fn test_corrupt_or_foreign_file_counts_as_empty() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        std::fs::create_dir_all(q.path().parent().unwrap()).unwrap();

        std::fs::write(q.path(), "{ not json").unwrap();
        assert!(q.is_empty());
        q.enqueue(&[], "/Volumes/A", QUEUE_REASON_UNAVAILABLE).unwrap();
        assert_eq!(q.len(), 1);

        std::fs::write(q.path(), r#"{"version": 99, "queue": []}"#).unwrap();
        assert!(q.is_empty());
    }

    #[test]
    fn test_file_layout() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        q.enqueue(&[PathBuf::from("/src")], "/Volumes/A", QUEUE_REASON_UNAVAILABLE)
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(q.path()).unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["queue"][0]["destination"], "/Volumes/A");
        assert_eq!(json["queue"][0]["reason"], "destination_unavailable");
        assert_eq!(json["queue"][0]["attempts"], 1);
    }
}
