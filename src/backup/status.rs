//! Progress feed of the running backup, readable in process and mirrored to `.status.json`.

use crate::backup::atomic_json::{read_json, write_json_atomic};
use crate::backup::result_error::result::Result;
use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

pub static STATUS_FILE_NAME: &str = ".status.json";

static PROGRESS_PUBLISH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Clone, Copy, Debug, Display, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    #[display("idle")]
    Idle,
    #[display("acquiring lock")]
    AcquiringLock,
    #[display("validating")]
    Validating,
    #[display("snapshotting")]
    Snapshotting,
    #[display("verifying")]
    Verifying,
    #[display("pruning")]
    Pruning,
    #[display("aborted")]
    Aborted,
    #[display("skipped")]
    Skipped,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    #[display("success")]
    Success,
    #[display("skipped")]
    Skipped,
    #[display("partial")]
    Partial,
    #[display("failed")]
    Failed,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupStatus {
    pub phase: Phase,
    pub snapshot: Option<String>,
    pub files_processed: u64,
    pub files_changed: u64,
    pub files_total: u64,
    pub bytes_written: u64,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(with = "humantime_serde", default)]
    pub elapsed: Option<Duration>,
    pub last_outcome: Option<Outcome>,
    pub last_error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl BackupStatus {
    /// Last persisted status of a destination, if any run ever wrote one.
    pub fn load<P: AsRef<Path>>(destination: P) -> Result<Option<Self>> {
        read_json(destination.as_ref().join(STATUS_FILE_NAME))
    }
}

#[derive(Default)]
struct Inner {
    status: RwLock<BackupStatus>,
    subscribers: Mutex<Vec<Sender<BackupStatus>>>,
    mirror: Mutex<Option<PathBuf>>,
    last_publish: Mutex<Option<Instant>>,
    run_started: Mutex<Option<Instant>>,
}

/// Cheap to clone, all clones share one status.
#[derive(Clone, Default)]
pub struct StatusFeed {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for StatusFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StatusFeed").field(&self.snapshot()).finish()
    }
}

impl StatusFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> BackupStatus {
        self.inner
            .status
            .read()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Receives every published status until the receiver is dropped.
    pub fn subscribe(&self) -> Receiver<BackupStatus> {
        let (tx, rx) = channel();
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Starts mirroring to `<destination>/.status.json`. Only call while holding the lock.
    pub fn attach<P: AsRef<Path>>(&self, destination: P) {
        if let Ok(mut mirror) = self.inner.mirror.lock() {
            *mirror = Some(destination.as_ref().join(STATUS_FILE_NAME));
        }
        self.publish(true);
    }

    /// Writes the final state and stops mirroring. Call before releasing the lock.
    pub fn detach(&self) {
        self.publish(true);
        if let Ok(mut mirror) = self.inner.mirror.lock() {
            *mirror = None;
        }
    }

    /// Resets counters for a new run.
    pub fn begin_run(&self) {
        if let Ok(mut started) = self.inner.run_started.lock() {
            *started = Some(Instant::now());
        }
        self.update(|s| {
            let last_outcome = s.last_outcome;
            *s = BackupStatus {
                started_at: Some(Utc::now()),
                last_outcome,
                ..Default::default()
            };
        });
    }

    pub fn set_phase(&self, phase: Phase) {
        tracing::debug!("Backup phase: {}", phase);
        self.update(|s| s.phase = phase);
    }

    pub fn set_snapshot<S: Into<String>>(&self, snapshot: S) {
        let snapshot = snapshot.into();
        self.update(|s| s.snapshot = Some(snapshot));
    }

    pub fn set_total(&self, files_total: u64) {
        self.update(|s| s.files_total = files_total);
    }

    /// Counts one processed file. Publishing is throttled, counters are not.
    pub fn file_done(&self, changed: bool, bytes_written: u64) {
        self.modify(|s| {
            s.files_processed += 1;
            if changed {
                s.files_changed += 1;
            }
            s.bytes_written += bytes_written;
        });
        self.publish(false);
    }

    pub fn finish(&self, outcome: Outcome, error: Option<String>) {
        self.update(|s| {
            s.last_outcome = Some(outcome);
            s.last_error = error;
            if s.phase != Phase::Aborted && s.phase != Phase::Skipped {
                s.phase = Phase::Idle;
            }
        });
    }

    pub fn update<F: FnOnce(&mut BackupStatus)>(&self, f: F) {
        self.modify(f);
        self.publish(true);
    }

    fn modify<F: FnOnce(&mut BackupStatus)>(&self, f: F) {
        let elapsed = self
            .inner
            .run_started
            .lock()
            .ok()
            .and_then(|s| s.map(|t| t.elapsed()));
        let mut status = match self.inner.status.write() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut status);
        status.elapsed = elapsed.or(status.elapsed);
        status.updated_at = Some(Utc::now());
    }

    fn publish(&self, force: bool) {
        if let Ok(mut last) = self.inner.last_publish.lock() {
            let due = last.is_none_or(|t| t.elapsed() >= PROGRESS_PUBLISH_INTERVAL);
            if !force && !due {
                return;
            }
            *last = Some(Instant::now());
        }

        let status = self.snapshot();
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.retain(|tx| tx.send(status.clone()).is_ok());
        }

        let mirror = self.inner.mirror.lock().ok().and_then(|m| m.clone());
        if let Some(path) = mirror {
            if let Err(e) = write_json_atomic(&path, &status) {
                tracing::warn!("Failed to write status file {:?}: {}", path, e);
            }
        }
    }
}
