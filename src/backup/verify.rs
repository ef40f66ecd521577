//! SHA-256 manifests: creation for existing snapshots, sealing, and re-verification.

use crate::backup::cancel::CancelToken;
use crate::backup::manifest::{hash_file, key_path, Manifest, ManifestEntry, Mtime};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::snapshot::{snapshot_files, SnapshotId, SnapshotInfo, SnapshotStatus, SnapshotStore};
use bon::Builder;
use derive_more::Display;
use globset::Glob;
use itertools::Itertools;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;

#[derive(Clone, Debug, Display, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Finding {
    #[display("corrupted: {path}")]
    CorruptionDetected { path: String },
    #[display("missing: {path}")]
    Missing { path: String },
    #[display("unreadable: {path} ({reason})")]
    Unreadable { path: String, reason: String },
}

impl Finding {
    pub fn path(&self) -> &str {
        match self {
            Finding::CorruptionDetected { path }
            | Finding::Missing { path }
            | Finding::Unreadable { path, .. } => path,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub snapshot: SnapshotId,
    pub files_checked: u64,
    pub findings: Vec<Finding>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verification {
    /// The snapshot has no manifest to check against.
    Unverified,
    Verified(VerificationReport),
}

impl Verification {
    pub fn report(&self) -> Option<&VerificationReport> {
        match self {
            Verification::Unverified => None,
            Verification::Verified(r) => Some(r),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.report().is_none_or(VerificationReport::is_clean)
    }
}

#[derive(Clone, Debug, Default, Builder)]
pub struct IntegrityVerifier {
    #[builder(default)]
    cancel: CancelToken,
}

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes every file of an existing snapshot and persists the result as its manifest.
    pub fn create_manifest(&self, snapshot: &SnapshotInfo) -> Result<Manifest> {
        tracing::info!("Creating manifest for {}", snapshot.id());
        let files: Vec<_> = snapshot_files(snapshot.path()).try_collect()?;
        let entries = files
            .par_iter()
            .map(|f| {
                self.cancel.check()?;
                let hash = hash_file(&f.path)
                    .add_msg(format!("Hashing {:?} failed", f.path))?;
                Ok(ManifestEntry::builder()
                    .path(f.key.clone())
                    .size(f.metadata.len())
                    .mtime(Mtime::of(&f.metadata))
                    .hash(hash)
                    .build())
            })
            .collect::<Result<Vec<_>>>()?;

        let manifest = Manifest::new(snapshot.id().to_string(), entries);
        self.seal(snapshot, &manifest)?;
        Ok(manifest)
    }

    /// Persists a manifest built elsewhere, e.g. while the snapshot was being copied.
    pub fn seal(&self, snapshot: &SnapshotInfo, manifest: &Manifest) -> Result<()> {
        manifest
            .save(snapshot.path())
            .add_msg(format!("Saving manifest of {} failed", snapshot.id()))?;
        tracing::debug!(
            "Sealed {} with {} entries",
            snapshot.id(),
            manifest.file_count()
        );
        Ok(())
    }

    /// Re-hashes the snapshot's files against its manifest, optionally only paths matching `pattern`.
    pub fn verify(&self, snapshot: &SnapshotInfo, pattern: Option<&str>) -> Result<Verification> {
        let Some(manifest) = Manifest::load(snapshot.path())? else {
            tracing::info!("Snapshot {} has no manifest, cannot verify", snapshot.id());
            return Ok(Verification::Unverified);
        };
        let matcher = pattern
            .map(|p| Glob::new(p).map(|g| g.compile_matcher()))
            .transpose()
            .map_err(Error::from)
            .add_msg(format!("Invalid verify pattern {:?}", pattern))?;

        let selected = manifest
            .entries()
            .iter()
            .filter(|e| matcher.as_ref().is_none_or(|m| m.is_match(e.path())))
            .collect_vec();
        tracing::info!("Verifying {} files of {}", selected.len(), snapshot.id());

        let findings = selected
            .par_iter()
            .map(|entry| {
                self.cancel.check()?;
                Ok(self.check_entry(snapshot, entry))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .sorted_by(|a, b| a.path().cmp(b.path()))
            .collect_vec();

        for finding in &findings {
            tracing::warn!("Snapshot {}: {}", snapshot.id(), finding);
        }
        Ok(Verification::Verified(VerificationReport {
            snapshot: snapshot.id().clone(),
            files_checked: selected.len() as u64,
            findings,
        }))
    }

    fn check_entry(&self, snapshot: &SnapshotInfo, entry: &ManifestEntry) -> Option<Finding> {
        let path = snapshot.path().join(key_path(entry.path()));
        let key = entry.path().clone();
        match hash_file(&path) {
            Ok(hash) if hash == *entry.hash() => None,
            Ok(_) => Some(Finding::CorruptionDetected { path: key }),
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => Some(Finding::Missing { path: key }),
            Err(e) => Some(Finding::Unreadable {
                path: key,
                reason: e.to_string(),
            }),
        }
    }

    pub fn mark_corrupt(&self, store: &SnapshotStore, snapshot: &SnapshotInfo) -> Result<()> {
        store.mark_status(snapshot, SnapshotStatus::Corrupt)
    }
}
