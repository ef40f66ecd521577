//! Health sweep over the snapshot history: every snapshot re-read and checked against its manifest.
//!
//! Read only. Nothing is marked corrupt here, the report says what a `verify` of each snapshot
//! would find.

use crate::backup::manifest::MANIFEST_FILE_NAME;
use crate::backup::result_error::result::Result;
use crate::backup::snapshot::{SnapshotId, SnapshotInfo, SnapshotStatus, SnapshotStore};
use crate::backup::verify::{Finding, IntegrityVerifier, Verification};
use chrono::NaiveDateTime;
use itertools::Itertools;
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::time::Duration;

#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SnapshotHealth {
    pub snapshot: SnapshotId,
    #[serde(with = "humantime_serde")]
    pub age: Duration,
    pub status: SnapshotStatus,
    pub readable: bool,
    pub has_manifest: bool,
    pub manifest_valid: bool,
    pub files_checked: u64,
    pub corrupted: Vec<String>,
    pub missing: Vec<String>,
    pub unreadable: Vec<String>,
    pub error: Option<String>,
}

impl SnapshotHealth {
    fn new(info: &SnapshotInfo, now: NaiveDateTime) -> Self {
        Self {
            snapshot: info.id().clone(),
            age: age(info, now),
            status: info.status(),
            readable: false,
            has_manifest: false,
            manifest_valid: false,
            files_checked: 0,
            corrupted: vec![],
            missing: vec![],
            unreadable: vec![],
            error: None,
        }
    }

    /// Readable, not marked corrupt, and matching its manifest when it has one.
    pub fn is_healthy(&self) -> bool {
        self.readable
            && self.error.is_none()
            && self.status != SnapshotStatus::Corrupt
            && (!self.has_manifest || self.manifest_valid)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Newest first.
    pub snapshots: Vec<SnapshotHealth>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.unhealthy == 0
    }
}

fn age(info: &SnapshotInfo, now: NaiveDateTime) -> Duration {
    (now - info.id().timestamp()).to_std().unwrap_or_default()
}

/// Checks one snapshot. Only cancellation is returned as an error, any other problem is
/// recorded in the result.
pub fn check_snapshot(
    verifier: &IntegrityVerifier,
    info: &SnapshotInfo,
    now: NaiveDateTime,
) -> Result<SnapshotHealth> {
    let mut health = SnapshotHealth::new(info, now);
    if let Err(e) = std::fs::read_dir(info.path()) {
        health.error = Some(format!("Cannot read snapshot directory: {e}"));
        return Ok(health);
    }
    health.readable = true;
    health.has_manifest = info.path().join(MANIFEST_FILE_NAME).is_file();

    match verifier.verify(info, None) {
        Ok(Verification::Unverified) => {}
        Ok(Verification::Verified(report)) => {
            health.manifest_valid = report.is_clean();
            health.files_checked = report.files_checked;
            for finding in report.findings {
                match finding {
                    Finding::CorruptionDetected { path } => health.corrupted.push(path),
                    Finding::Missing { path } => health.missing.push(path),
                    Finding::Unreadable { path, .. } => health.unreadable.push(path),
                }
            }
        }
        Err(e) if e.is_cancelled() => return Err(e),
        Err(e) => health.error = Some(e.to_string()),
    }
    if !health.is_healthy() {
        tracing::warn!(
            "Snapshot {} unhealthy: {} corrupted, {} missing, {} unreadable",
            health.snapshot,
            health.corrupted.len(),
            health.missing.len(),
            health.unreadable.len()
        );
    }
    Ok(health)
}

/// Checks every snapshot at least `min_age` old, or all of them without a minimum.
pub fn check_all(
    store: &SnapshotStore,
    verifier: &IntegrityVerifier,
    min_age: Option<Duration>,
    now: NaiveDateTime,
) -> Result<HealthReport> {
    let snapshots: Vec<_> = store
        .list()?
        .iter()
        .filter(|info| min_age.is_none_or(|min| age(info, now) >= min))
        .map(|info| check_snapshot(verifier, info, now))
        .try_collect()?;
    let healthy = snapshots.iter().filter(|h| h.is_healthy()).count();
    tracing::info!("Health check: {} of {} snapshots healthy", healthy, snapshots.len());
    Ok(HealthReport {
        total: snapshots.len(),
        healthy,
        unhealthy: snapshots.len() - healthy,
        snapshots,
    })
}
