//! Builds one new snapshot, hard-linking files unchanged since the basis snapshot.

use crate::backup::cancel::CancelToken;
use crate::backup::exclude::ExcludeMatcher;
use crate::backup::function_path;
use crate::backup::manifest::{copy_and_hash, hash_file, manifest_key, Manifest, ManifestEntry, Mtime};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};
use crate::backup::retry::RetryConfig;
use crate::backup::snapshot::{SnapshotId, SnapshotInfo, SnapshotMeta, SnapshotStatus, SnapshotStore};
use crate::backup::status::StatusFeed;
use crate::backup::walk::{EntryKind, SourceEntry, SourceTree};
use bon::Builder;
use chrono::{Local, Utc};
use function_name::named;
use getset::Getters;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs::{Metadata, Permissions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct SnapshotEngine {
    store: SnapshotStore,
    sources: Vec<SourceTree>,
    excludes: Arc<ExcludeMatcher>,
    #[builder(default)]
    retry: RetryConfig,
    #[builder(default)]
    status: StatusFeed,
    #[builder(default)]
    cancel: CancelToken,
}

#[derive(Clone, Debug)]
pub struct SnapshotOutcome {
    pub info: SnapshotInfo,
    pub changed: u64,
    pub total: u64,
    pub total_bytes: u64,
    pub bytes_written: u64,
    pub elapsed: Duration,
    /// Built while copying, not yet persisted.
    pub manifest: Manifest,
}

struct PlannedDir {
    path: PathBuf,
    permissions: Permissions,
    mtime: Mtime,
}

impl PlannedDir {
    fn of(path: PathBuf, metadata: &Metadata) -> Self {
        Self {
            path,
            permissions: metadata.permissions(),
            mtime: Mtime::of(metadata),
        }
    }
}

struct FileRecord {
    entry: ManifestEntry,
    changed: bool,
    bytes_written: u64,
}

/// Everything from one pass over the sources, before the rename.
struct Populated {
    records: Vec<FileRecord>,
}

/// Prior snapshot's location and manifest, keyed by manifest path.
struct Basis {
    root: PathBuf,
    entries: HashMap<String, ManifestEntry>,
}

impl Basis {
    fn load(info: &SnapshotInfo) -> Self {
        let entries = match Manifest::load(info.path()) {
            Ok(Some(m)) => m
                .entries()
                .iter()
                .map(|e| (e.path().clone(), e.clone()))
                .collect(),
            Ok(None) => HashMap::new(),
            Err(e) => {
                tracing::warn!("Ignoring manifest of basis {}: {}", info.id(), e);
                HashMap::new()
            }
        };
        Self {
            root: info.path().clone(),
            entries,
        }
    }

    /// The basis file at `relative` when it can stand in for a source file with `metadata`.
    fn reusable(&self, relative: &Path, metadata: &Metadata) -> Option<PathBuf> {
        let path = self.root.join(relative);
        let prior = std::fs::symlink_metadata(&path).ok()?;
        let same = prior.is_file()
            && prior.len() == metadata.len()
            && Mtime::of(&prior) == Mtime::of(metadata)
            && prior.permissions() == metadata.permissions();
        same.then_some(path)
    }
}

impl SnapshotEngine {
    /// Creates a complete snapshot of every source, atomically published under its final name.
    ///
    /// `basis` is the newest non-corrupt snapshot; files that match it are hard-linked.
    #[named]
    pub fn create(&self, basis: Option<&SnapshotInfo>) -> Result<SnapshotOutcome> {
        let started = Instant::now();
        for source in &self.sources {
            source.ensure_available()?;
        }

        let id = self.store.next_id(|| Local::now().naive_local())?;
        let tmp = self.store.in_progress_path(&id);
        std::fs::create_dir(&tmp).map_err(|e| Error::destination_unwritable(&tmp, e.to_string()))?;
        tracing::info!("Creating snapshot {} in {:?}", id, tmp);
        self.status.set_snapshot(id.to_string());

        let basis_dir = basis.map(Basis::load);
        if let Some(basis) = basis {
            tracing::info!("Hard-linking unchanged files from {}", basis.id());
        }

        let published = self
            .populate(&tmp, basis_dir.as_ref())
            .and_then(|populated| self.publish(&id, &tmp, basis, populated, started));
        match published {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                discard(&tmp);
                Err(e.add_fn_name(function_path!()))
            }
        }
    }

    fn populate(&self, tmp: &Path, basis: Option<&Basis>) -> Result<Populated> {
        let mut dirs = vec![];
        let mut files = vec![];

        for source in &self.sources {
            self.cancel.check()?;
            let root = tmp.join(source.dst_dir());
            std::fs::create_dir(&root)?;
            dirs.push(PlannedDir::of(root, &std::fs::metadata(source.src_dir())?));

            for entry in source.entries(self.excludes.clone())? {
                self.cancel.check()?;
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) if e.is_not_found() => {
                        tracing::warn!("Skipping entry that vanished during the scan: {}", e);
                        continue;
                    }
                    Err(e) => return Err(e),
                };
                let target = tmp.join(&entry.dst);
                match entry.kind {
                    EntryKind::Dir => {
                        std::fs::create_dir(&target)?;
                        dirs.push(PlannedDir::of(target, &entry.metadata));
                    }
                    EntryKind::Symlink => match std::fs::read_link(&entry.src) {
                        Ok(link) => std::os::unix::fs::symlink(link, &target)?,
                        Err(e) if e.kind() == ErrorKind::NotFound => {
                            tracing::warn!("Skipping symlink that vanished: {:?}", entry.src);
                        }
                        Err(e) => return Err(e.into()),
                    },
                    EntryKind::File => files.push(entry),
                }
            }
        }

        self.status.set_total(files.len() as u64);
        tracing::debug!("Processing {} files", files.len());
        let records = files
            .par_iter()
            .map(|entry| self.process_file(entry, tmp, basis))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect();

        self.cancel.check()?;
        apply_dir_attributes(dirs)?;
        Ok(Populated { records })
    }

    /// `None` when the source file disappeared before it could be read.
    fn process_file(&self, entry: &SourceEntry, tmp: &Path, basis: Option<&Basis>) -> Result<Option<FileRecord>> {
        self.cancel.check()?;
        let key = manifest_key(&entry.dst);
        let target = tmp.join(&entry.dst);
        let mtime = Mtime::of(&entry.metadata);

        if let Some(basis) = basis {
            if let Some(prior) = basis.reusable(&entry.dst, &entry.metadata) {
                match std::fs::hard_link(&prior, &target) {
                    Ok(_) => {
                        let hash = match basis.entries.get(&key) {
                            Some(e) if e.matches(entry.metadata.len(), mtime) => e.hash().clone(),
                            _ => hash_file(&target)?,
                        };
                        tracing::trace!("Linked {:?}", entry.dst);
                        self.status.file_done(false, 0);
                        return Ok(Some(FileRecord {
                            entry: ManifestEntry::builder()
                                .path(key)
                                .size(entry.metadata.len())
                                .mtime(mtime)
                                .hash(hash)
                                .build(),
                            changed: false,
                            bytes_written: 0,
                        }));
                    }
                    Err(e) => tracing::warn!("Cannot link {:?}, copying instead: {}", prior, e),
                }
            }
        }

        let copied = self.retry.run(&entry.src, &self.cancel, || {
            match std::fs::remove_file(&target) {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let (bytes, hash) = copy_and_hash(&entry.src, &target)?;
            std::fs::set_permissions(&target, entry.metadata.permissions())?;
            filetime::set_file_mtime(&target, mtime.into())?;
            Ok((bytes, hash))
        });

        match copied {
            Ok((bytes, hash)) => {
                tracing::trace!("Copied {:?} ({} bytes)", entry.dst, bytes);
                self.status.file_done(true, bytes);
                Ok(Some(FileRecord {
                    entry: ManifestEntry::builder()
                        .path(key)
                        .size(bytes)
                        .mtime(mtime)
                        .hash(hash)
                        .build(),
                    changed: true,
                    bytes_written: bytes,
                }))
            }
            Err(e) if e.is_not_found() && !entry.src.exists() => {
                tracing::warn!("Skipping {:?}, removed during backup", entry.src);
                let _ = std::fs::remove_file(&target);
                Ok(None)
            }
            Err(e) => Err(e.add_msg(format!("Backing up {:?} failed", entry.src))),
        }
    }

    fn publish(
        &self,
        id: &SnapshotId,
        tmp: &Path,
        basis: Option<&SnapshotInfo>,
        populated: Populated,
        started: Instant,
    ) -> Result<SnapshotOutcome> {
        let total = populated.records.len() as u64;
        let changed = populated.records.iter().filter(|r| r.changed).count() as u64;
        let bytes_written = populated.records.iter().map(|r| r.bytes_written).sum();
        let manifest = Manifest::new(
            id.to_string(),
            populated.records.into_iter().map(|r| r.entry).collect(),
        );

        let meta = SnapshotMeta::builder()
            .id(id.clone())
            .created_at(Utc::now())
            .status(SnapshotStatus::Complete)
            .file_count(total)
            .changed_count(changed)
            .total_bytes(manifest.total_size())
            .bytes_written(bytes_written)
            .maybe_previous(basis.map(|b| b.id().clone()))
            .build();
        meta.save(tmp)?;

        self.cancel.check()?;
        let final_path = self.store.path_of(id);
        if final_path.exists() {
            return Err(Error::from(std::io::Error::from(ErrorKind::AlreadyExists))
                .add_msg(format!("Refusing to overwrite snapshot {:?}", final_path)));
        }
        std::fs::rename(tmp, &final_path)
            .map_err(Error::from)
            .add_msg(format!("Finalizing snapshot {:?} failed", final_path))?;
        if let Err(e) = std::fs::File::open(self.store.destination()).and_then(|d| d.sync_all()) {
            tracing::warn!("Cannot sync destination directory: {}", e);
        }

        let elapsed = started.elapsed();
        tracing::info!(
            "Created snapshot {}: {} changed / {} total files, {} bytes written in {:?}",
            id,
            changed,
            total,
            bytes_written,
            elapsed
        );

        Ok(SnapshotOutcome {
            info: SnapshotInfo::new(id.clone(), final_path, Some(meta)),
            changed,
            total,
            total_bytes: manifest.total_size(),
            bytes_written,
            elapsed,
            manifest,
        })
    }

    /// Bytes a snapshot taken now would have to copy rather than link.
    pub fn estimate_changed_bytes(&self, basis: Option<&SnapshotInfo>) -> Result<u64> {
        let basis_root = basis.map(|b| Basis {
            root: b.path().clone(),
            entries: HashMap::new(),
        });
        let mut total = 0u64;
        for source in &self.sources {
            for entry in source.entries(self.excludes.clone())? {
                self.cancel.check()?;
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                };
                if entry.kind != EntryKind::File {
                    continue;
                }
                let reusable = basis_root
                    .as_ref()
                    .and_then(|b| b.reusable(&entry.dst, &entry.metadata))
                    .is_some();
                if !reusable {
                    total = total.saturating_add(entry.metadata.len());
                }
            }
        }
        Ok(total)
    }
}

/// Deepest first, so setting a parent's mtime is not undone by work on its children.
fn apply_dir_attributes(mut dirs: Vec<PlannedDir>) -> Result<()> {
    dirs.sort_by_key(|d| std::cmp::Reverse(d.path.components().count()));
    for dir in dirs {
        std::fs::set_permissions(&dir.path, dir.permissions)?;
        filetime::set_file_mtime(&dir.path, dir.mtime.into())?;
    }
    Ok(())
}

fn discard(tmp: &Path) {
    tracing::info!("Discarding incomplete snapshot {:?}", tmp);
    match std::fs::remove_dir_all(tmp) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Cannot remove {:?}, next run will retry: {}", tmp, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::walk::source_layout;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        source: PathBuf,
        destination: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("project");
        let destination = dir.path().join("backups");
        std::fs::create_dir_all(source.join("src")).unwrap();
        std::fs::create_dir_all(&destination).unwrap();
        std::fs::write(source.join("a.txt"), "alpha").unwrap();
        std::fs::write(source.join("b.txt"), "bravo").unwrap();
        std::fs::write(source.join("src/c.txt"), "charlie").unwrap();
        Fixture {
            _dir: dir,
            source,
            destination,
        }
    }

    fn engine(fx: &Fixture, patterns: &[&str], cancel: CancelToken) -> SnapshotEngine {
        SnapshotEngine::builder()
            .store(SnapshotStore::new(&fx.destination))
            .sources(source_layout(&[&fx.source]))
            .excludes(Arc::new(ExcludeMatcher::new(patterns).unwrap()))
            .retry(
                RetryConfig::builder()
                    .attempts(1)
                    .base_delay(Duration::from_millis(1))
                    .build(),
            )
            .cancel(cancel)
            .build()
    }

    fn ino(path: &Path) -> u64 {
        std::fs::metadata(path).unwrap().ino()
    }

    fn run(engine: &SnapshotEngine) -> SnapshotOutcome {
        let basis = engine.store().latest_basis().unwrap();
        engine.create(basis.as_ref()).unwrap()
    }

    #[test]
    fn test_first_snapshot_copies_everything() {
        let fx = fixture();
        let engine = engine(&fx, &[], CancelToken::new());

        let outcome = run(&engine);
        assert_eq!((outcome.changed, outcome.total), (3, 3));
        assert_eq!(outcome.bytes_written, 17);
        assert_eq!(outcome.manifest.file_count(), 3);

        let root = outcome.info.path();
        assert_eq!(
            std::fs::read_to_string(root.join("project/src/c.txt")).unwrap(),
            "charlie"
        );
        assert!(root.join(".snapshot.json").exists());
        assert_eq!(outcome.info.status(), SnapshotStatus::Complete);
        assert!(outcome.info.meta().as_ref().unwrap().previous().is_none());
        assert_eq!(
            outcome.manifest.entries()[0].hash(),
            &hash_file(fx.source.join("a.txt")).unwrap()
        );
    }

    #[test]
    fn test_one_changed_file_of_three() {
        let fx = fixture();
        let engine = engine(&fx, &[], CancelToken::new());
        let first = run(&engine);

        std::fs::write(fx.source.join("b.txt"), "bravo, edited").unwrap();
        let second = run(&engine);

        assert_eq!((second.changed, second.total), (1, 3));
        let (p1, p2) = (first.info.path(), second.info.path());
        assert_eq!(ino(&p1.join("project/a.txt")), ino(&p2.join("project/a.txt")));
        assert_eq!(ino(&p1.join("project/src/c.txt")), ino(&p2.join("project/src/c.txt")));
        assert_ne!(ino(&p1.join("project/b.txt")), ino(&p2.join("project/b.txt")));
        assert_eq!(
            std::fs::read_to_string(p1.join("project/b.txt")).unwrap(),
            "bravo"
        );
        assert_eq!(
            second.info.meta().as_ref().unwrap().previous().as_ref(),
            Some(first.info.id())
        );
    }

    #[test]
    fn test_unchanged_runs_link_everything() {
        let fx = fixture();
        let engine = engine(&fx, &[], CancelToken::new());
        let first = run(&engine);

        for _ in 0..3 {
            let next = run(&engine);
            assert_eq!(next.changed, 0);
            assert_eq!(next.bytes_written, 0);
            assert_eq!(next.manifest.entries(), first.manifest.entries());
            assert_eq!(
                ino(&first.info.path().join("project/a.txt")),
                ino(&next.info.path().join("project/a.txt"))
            );
        }
        assert_eq!(engine.store().list().unwrap().len(), 4);
    }

    #[test]
    fn test_copies_keep_mode_and_mtime() {
        let fx = fixture();
        let script = fx.source.join("run.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, Permissions::from_mode(0o750)).unwrap();
        filetime::set_file_mtime(&script, filetime::FileTime::from_unix_time(1_600_000_000, 123)).unwrap();

        let outcome = run(&engine(&fx, &[], CancelToken::new()));
        let copied = std::fs::metadata(outcome.info.path().join("project/run.sh")).unwrap();
        assert_eq!(copied.permissions().mode() & 0o777, 0o750);
        assert_eq!(Mtime::of(&copied), Mtime::of(&std::fs::metadata(&script).unwrap()));
    }

    #[test]
    fn test_excludes_and_symlinks() {
        let fx = fixture();
        std::fs::create_dir_all(fx.source.join("node_modules/dep")).unwrap();
        std::fs::write(fx.source.join("node_modules/dep/index.js"), "x").unwrap();
        std::os::unix::fs::symlink("a.txt", fx.source.join("link")).unwrap();

        let outcome = run(&engine(&fx, &["node_modules/"], CancelToken::new()));
        let root = outcome.info.path().join("project");
        assert!(!root.join("node_modules").exists());
        assert_eq!(std::fs::read_link(root.join("link")).unwrap(), PathBuf::from("a.txt"));
        assert_eq!(outcome.total, 3);
    }

    #[test]
    fn test_cancelled_run_leaves_nothing() {
        let fx = fixture();
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = engine(&fx, &[], cancel).create(None).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(std::fs::read_dir(&fx.destination).unwrap().count(), 0);
    }

    #[test]
    fn test_missing_source_fails_before_writing() {
        let fx = fixture();
        std::fs::remove_dir_all(&fx.source).unwrap();

        let err = engine(&fx, &[], CancelToken::new()).create(None).unwrap_err();
        assert!(matches!(err.root_cause(), Error::SourceUnavailable { .. }));
        assert_eq!(std::fs::read_dir(&fx.destination).unwrap().count(), 0);
    }

    #[test]
    fn test_corrupt_basis_is_not_used() {
        let fx = fixture();
        let engine = engine(&fx, &[], CancelToken::new());
        let first = run(&engine);
        engine
            .store()
            .mark_status(&first.info, SnapshotStatus::Corrupt)
            .unwrap();

        let second = run(&engine);
        assert_eq!(second.changed, 3);
        assert_ne!(
            ino(&first.info.path().join("project/a.txt")),
            ino(&second.info.path().join("project/a.txt"))
        );
    }

    #[test]
    fn test_estimate_changed_bytes() {
        let fx = fixture();
        let engine = engine(&fx, &[], CancelToken::new());
        assert_eq!(engine.estimate_changed_bytes(None).unwrap(), 17);

        let first = run(&engine);
        assert_eq!(engine.estimate_changed_bytes(Some(&first.info)).unwrap(), 0);

        std::fs::write(fx.source.join("a.txt"), "alpha alpha").unwrap();
        assert_eq!(engine.estimate_changed_bytes(Some(&first.info)).unwrap(), 11);
    }
}
