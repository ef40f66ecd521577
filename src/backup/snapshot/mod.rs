//! On-disk snapshot layout: naming, metadata, listing and cleanup of interrupted runs.
//!
//! ```text
//! <destination>/
//!   .lock
//!   .status.json
//!   2024-05-01-120000/            complete snapshot
//!     .snapshot.json
//!     .manifest.json
//!     <source-name>/...
//!   2024-05-01-120000-01/         same second, collision suffix
//!   in_progress_2024-05-01-130000/  never treated as history
//! ```

pub mod engine;
pub mod restore;

use crate::backup::atomic_json::{read_json, write_json_atomic};
use crate::backup::manifest::{manifest_key, MANIFEST_FILE_NAME};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use bon::Builder;
use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use derive_more::Display;
use getset::{CopyGetters, Getters};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

pub static TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S";
pub static IN_PROGRESS_PREFIX: &str = "in_progress_";
pub static META_FILE_NAME: &str = ".snapshot.json";

static MAX_COLLISION_SUFFIX: u32 = 99;
static MAX_COLLISION_ROUNDS: u32 = 3;

/// `YYYY-MM-DD-HHMMSS` with an optional `-NN` collision suffix. Orders chronologically.
#[derive(Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[display("{name}")]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId {
    name: String,
    timestamp: NaiveDateTime,
}

impl SnapshotId {
    pub fn parse<S: AsRef<str>>(name: S) -> Option<Self> {
        let name = name.as_ref();
        let base = match name.len() {
            17 => name,
            20 if name.as_bytes()[17] == b'-' => {
                let seq: u32 = name[18..].parse().ok()?;
                if !(1..=MAX_COLLISION_SUFFIX).contains(&seq) {
                    return None;
                }
                &name[..17]
            }
            _ => return None,
        };
        let timestamp = NaiveDateTime::parse_from_str(base, TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            name: name.to_string(),
            timestamp,
        })
    }

    fn from_timestamp(timestamp: NaiveDateTime, seq: Option<u32>) -> Self {
        // Names carry whole seconds only; keep the timestamp equal to what `parse` yields.
        let timestamp = timestamp.with_nanosecond(0).unwrap_or(timestamp);
        let base = timestamp.format(TIMESTAMP_FORMAT).to_string();
        let name = match seq {
            None => base,
            Some(seq) => format!("{base}-{seq:02}"),
        };
        Self { name, timestamp }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.timestamp
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        SnapshotId::parse(&value).ok_or_else(|| format!("invalid snapshot id {value:?}"))
    }
}

impl From<SnapshotId> for String {
    fn from(value: SnapshotId) -> Self {
        value.name
    }
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    #[display("in_progress")]
    InProgress,
    #[display("complete")]
    Complete,
    #[display("corrupt")]
    Corrupt,
}

#[skip_serializing_none]
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Builder, Getters, CopyGetters)]
pub struct SnapshotMeta {
    #[getset(get = "pub")]
    id: SnapshotId,
    #[getset(get_copy = "pub")]
    created_at: DateTime<Utc>,
    #[getset(get_copy = "pub")]
    status: SnapshotStatus,
    #[getset(get_copy = "pub")]
    file_count: u64,
    #[getset(get_copy = "pub")]
    changed_count: u64,
    #[getset(get_copy = "pub")]
    total_bytes: u64,
    #[getset(get_copy = "pub")]
    bytes_written: u64,
    /// Snapshot that unchanged files were linked from. Informational only after creation.
    #[getset(get = "pub")]
    previous: Option<SnapshotId>,
}

impl SnapshotMeta {
    pub fn load<P: AsRef<Path>>(snapshot_dir: P) -> Result<Option<Self>> {
        read_json(snapshot_dir.as_ref().join(META_FILE_NAME))
    }

    pub fn save<P: AsRef<Path>>(&self, snapshot_dir: P) -> Result<()> {
        write_json_atomic(snapshot_dir.as_ref().join(META_FILE_NAME), self)
    }

    pub fn with_status(mut self, status: SnapshotStatus) -> Self {
        self.status = status;
        self
    }
}

#[derive(Clone, Debug, Getters)]
#[getset(get = "pub")]
pub struct SnapshotInfo {
    id: SnapshotId,
    path: PathBuf,
    /// Missing for snapshots written before metadata existed.
    meta: Option<SnapshotMeta>,
}

impl SnapshotInfo {
    pub(crate) fn new(id: SnapshotId, path: PathBuf, meta: Option<SnapshotMeta>) -> Self {
        Self { id, path, meta }
    }

    pub fn status(&self) -> SnapshotStatus {
        self.meta
            .as_ref()
            .map(SnapshotMeta::status)
            .unwrap_or(SnapshotStatus::Complete)
    }

    pub fn is_corrupt(&self) -> bool {
        self.status() == SnapshotStatus::Corrupt
    }
}

/// A regular file inside a finalized snapshot.
#[derive(Debug)]
pub struct SnapshotFile {
    pub path: PathBuf,
    pub key: String,
    pub metadata: Metadata,
}

#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct SnapshotStore {
    #[builder(into)]
    destination: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: Into<PathBuf>>(destination: P) -> Self {
        Self::builder().destination(destination).build()
    }

    pub fn path_of(&self, id: &SnapshotId) -> PathBuf {
        self.destination.join(id.as_str())
    }

    pub fn in_progress_path(&self, id: &SnapshotId) -> PathBuf {
        self.destination
            .join(format!("{}{}", IN_PROGRESS_PREFIX, id.as_str()))
    }

    fn name_taken(&self, id: &SnapshotId) -> bool {
        self.path_of(id).exists() || self.in_progress_path(id).exists()
    }

    /// First free name for `clock()`, adding `-01`..`-99` on collision and waiting for the
    /// clock to advance when a whole second is used up.
    ///
    /// A new name always sorts after the newest existing snapshot. When the wall clock is
    /// behind it (DST fall-back, clock correction) the newest snapshot's second is reused with
    /// the next free suffix.
    pub fn next_id<F: Fn() -> NaiveDateTime>(&self, clock: F) -> Result<SnapshotId> {
        let latest = self.latest()?.map(|info| info.id);
        for _ in 0..MAX_COLLISION_ROUNDS {
            let mut now = clock();
            if let Some(latest) = latest.as_ref().filter(|l| l.timestamp() > now) {
                tracing::warn!(
                    "Clock {} is behind newest snapshot {}, naming after it",
                    now.format(TIMESTAMP_FORMAT),
                    latest
                );
                now = latest.timestamp();
            }
            let free = std::iter::once(None)
                .chain((1..=MAX_COLLISION_SUFFIX).map(Some))
                .map(|seq| SnapshotId::from_timestamp(now, seq))
                .find(|id| !self.name_taken(id) && latest.as_ref().is_none_or(|l| id > l));
            if let Some(id) = free {
                if id.as_str().len() > 17 {
                    tracing::debug!("Snapshot name collision, using {}", id);
                }
                return Ok(id);
            }
            tracing::warn!(
                "All collision suffixes used for {}, waiting for the clock",
                now.format(TIMESTAMP_FORMAT)
            );
            std::thread::sleep(Duration::from_secs(1));
        }
        Err(Error::from(std::io::Error::from(ErrorKind::AlreadyExists))
            .add_msg("No free snapshot name available"))
    }

    /// Finalized snapshots, newest first. In-progress and hidden entries are ignored.
    pub fn list(&self) -> Result<Vec<SnapshotInfo>> {
        let read_dir = match std::fs::read_dir(&self.destination) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(Error::from(e)
                    .add_msg(format!("List snapshots in {:?} failed", self.destination)))
            }
        };

        let infos = read_dir
            .filter_map(|r| r.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| SnapshotId::parse(e.file_name().to_string_lossy()).map(|id| (id, e.path())))
            .map(|(id, path)| {
                let meta = SnapshotMeta::load(&path).unwrap_or_else(|e| {
                    tracing::warn!("Ignoring unreadable metadata of {}: {}", id, e);
                    None
                });
                SnapshotInfo { id, path, meta }
            })
            .sorted_unstable_by(|a, b| b.id.cmp(&a.id))
            .collect_vec();
        Ok(infos)
    }

    pub fn get<S: AsRef<str>>(&self, id: S) -> Result<SnapshotInfo> {
        let id = id.as_ref();
        self.list()?
            .into_iter()
            .find(|info| info.id.as_str() == id)
            .ok_or_else(|| Error::snapshot_not_found(id))
    }

    /// Newest snapshot allowed to seed hard links; corrupt ones never are.
    pub fn latest_basis(&self) -> Result<Option<SnapshotInfo>> {
        Ok(self.list()?.into_iter().find(|info| !info.is_corrupt()))
    }

    pub fn latest(&self) -> Result<Option<SnapshotInfo>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Removes `in_progress_*` leftovers of interrupted runs. Only call while holding the lock.
    pub fn cleanup_incomplete(&self) -> Result<usize> {
        let read_dir = match std::fs::read_dir(&self.destination) {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        for entry in read_dir.filter_map(|r| r.ok()) {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(IN_PROGRESS_PREFIX) {
                continue;
            }
            tracing::info!("Removing incomplete snapshot {:?}", entry.path());
            match std::fs::remove_dir_all(entry.path()) {
                Ok(_) => removed += 1,
                Err(e) => tracing::warn!("Failed to remove {:?}: {}", entry.path(), e),
            }
        }
        Ok(removed)
    }

    pub fn mark_status(&self, info: &SnapshotInfo, status: SnapshotStatus) -> Result<()> {
        let meta = match &info.meta {
            Some(meta) => meta.clone().with_status(status),
            None => SnapshotMeta::builder()
                .id(info.id.clone())
                .created_at(Utc::now())
                .status(status)
                .file_count(0)
                .changed_count(0)
                .total_bytes(0)
                .bytes_written(0)
                .build(),
        };
        tracing::info!("Marking snapshot {} as {}", info.id, status);
        meta.save(&info.path)
    }
}

/// Regular files of a snapshot, skipping the bookkeeping files at its root.
pub fn snapshot_files<P: AsRef<Path>>(snapshot_dir: P) -> impl Iterator<Item = Result<SnapshotFile>> {
    let root = snapshot_dir.as_ref().to_path_buf();
    WalkDir::new(&root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(move |res| {
            let de = match res {
                Ok(de) => de,
                Err(e) => return Some(Err(Error::from(e))),
            };
            if !de.file_type().is_file() {
                return None;
            }
            if de.depth() == 1 && is_bookkeeping_file(de.file_name()) {
                return None;
            }
            let key = manifest_key(de.path().strip_prefix(&root).unwrap_or(de.path()));
            Some(
                de.metadata()
                    .map_err(Error::from)
                    .map(|metadata| SnapshotFile {
                        path: de.into_path(),
                        key,
                        metadata,
                    }),
            )
        })
}

fn is_bookkeeping_file(name: &std::ffi::OsStr) -> bool {
    name == MANIFEST_FILE_NAME || name == META_FILE_NAME
}
