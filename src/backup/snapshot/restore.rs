use crate::backup::manifest::Mtime;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::snapshot::SnapshotStore;
use crate::backup::walk::SourceTree;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreReport {
    pub target: PathBuf,
    pub files: u64,
    pub bytes: u64,
}

/// `path` must be a non-empty relative path made only of normal components.
fn checked_relative(path: &Path) -> Result<&Path> {
    let valid = path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(path)
    } else {
        Err(Error::invalid_restore_path(path))
    }
}

/// Refuses paths that pass through a symlink stored in the snapshot.
fn ensure_no_linked_ancestor(root: &Path, path: &Path) -> Result<()> {
    let linked = path
        .ancestors()
        .skip(1)
        .filter(|a| !a.as_os_str().is_empty())
        .find(|a| std::fs::symlink_metadata(root.join(a)).is_ok_and(|md| md.file_type().is_symlink()));
    match linked {
        Some(link) => {
            tracing::error!("{:?} crosses symlink {:?} in the snapshot", path, link);
            Err(Error::invalid_restore_path(path))
        }
        None => Ok(()),
    }
}

/// Maps `<source-name>/rest` back to `<source dir>/rest`.
fn original_location(sources: &[SourceTree], path: &Path) -> Result<PathBuf> {
    let mut components = path.components();
    let first = components.next().map(|c| c.as_os_str());
    let rest = components.as_path();
    sources
        .iter()
        .find(|s| Some(s.dst_dir().as_os_str()) == first)
        .map(|s| {
            if rest.as_os_str().is_empty() {
                s.src_dir().clone()
            } else {
                s.src_dir().join(rest)
            }
        })
        .ok_or_else(|| {
            tracing::error!("{:?} does not belong to any configured source", path);
            Error::invalid_restore_path(path)
        })
}

/// Copies `path` out of snapshot `snapshot_id` to `target`, or back to where it was backed up
/// from when `target` is `None`. Existing files are overwritten, other files are left alone.
pub fn restore<P: AsRef<Path>>(
    store: &SnapshotStore,
    sources: &[SourceTree],
    snapshot_id: &str,
    path: P,
    target: Option<&Path>,
) -> Result<RestoreReport> {
    let path = checked_relative(path.as_ref())?;
    let info = store.get(snapshot_id)?;
    ensure_no_linked_ancestor(info.path(), path)?;
    let src = info.path().join(path);
    let src_md = std::fs::symlink_metadata(&src)
        .map_err(Error::from)
        .add_msg(format!("{:?} not found in snapshot {}", path, snapshot_id))?;

    let target = match target {
        Some(t) => t.to_path_buf(),
        None => original_location(sources, path)?,
    };
    tracing::info!("Restoring {:?} from snapshot {} to {:?}", path, snapshot_id, target);

    let mut report = RestoreReport {
        target: target.clone(),
        files: 0,
        bytes: 0,
    };
    if !src_md.is_dir() {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        restore_entry(&src, &src_md, &target, &mut report)?;
        return Ok(report);
    }

    let mut dirs = vec![];
    for de in WalkDir::new(&src).follow_links(false).sort_by_file_name() {
        let de = de?;
        let relative = de.path().strip_prefix(&src).unwrap_or(de.path());
        let dst = if relative.as_os_str().is_empty() {
            target.clone()
        } else {
            target.join(relative)
        };
        let md = de.metadata()?;
        if md.is_dir() {
            if std::fs::symlink_metadata(&dst).is_ok_and(|m| !m.is_dir()) {
                std::fs::remove_file(&dst)?;
            }
            std::fs::create_dir_all(&dst)?;
            dirs.push((dst, md));
        } else {
            restore_entry(de.path(), &md, &dst, &mut report)?;
        }
    }

    dirs.sort_by_key(|(d, _)| std::cmp::Reverse(d.components().count()));
    for (dir, md) in dirs {
        std::fs::set_permissions(&dir, md.permissions())?;
        filetime::set_file_mtime(&dir, Mtime::of(&md).into())?;
    }
    tracing::info!("Restored {} files ({} bytes) to {:?}", report.files, report.bytes, target);
    Ok(report)
}

fn remove_existing(dst: &Path) -> Result<()> {
    match std::fs::symlink_metadata(dst) {
        Ok(md) if md.is_dir() => std::fs::remove_dir_all(dst)?,
        Ok(_) => std::fs::remove_file(dst)?,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn restore_entry(src: &Path, md: &Metadata, dst: &Path, report: &mut RestoreReport) -> Result<()> {
    remove_existing(dst)?;
    if md.file_type().is_symlink() {
        std::os::unix::fs::symlink(std::fs::read_link(src)?, dst)?;
        return Ok(());
    }
    // Copy, never link: the restored file must not share storage with the snapshot.
    let bytes = std::fs::copy(src, dst)
        .map_err(Error::from)
        .add_msg(format!("Restoring {:?} failed", dst))?;
    std::fs::set_permissions(dst, md.permissions())?;
    filetime::set_file_mtime(dst, Mtime::of(md).into())?;
    report.files += 1;
    report.bytes += bytes;
    Ok(())
}
