//! Validation functions for configuration values and destination preflight.

use crate::backup::exclude::ExcludeMatcher;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use validator::ValidationError;

pub fn validate_dir_exist<P: AsRef<Path>>(dir: P) -> std::result::Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return Err(ValidationError::new("InvalidDirectory")
            .with_message(format!("{:?} not found", dir).into()));
    }

    Ok(())
}

pub fn validate_dir_exist_or_created<P: AsRef<Path>>(dir: P) -> std::result::Result<(), ValidationError> {
    let dir = dir.as_ref();
    if dir.exists() {
        if !dir.is_dir() {
            return Err(ValidationError::new("InvalidDirectory")
                .with_message(format!("{:?} is not a directory", dir).into()));
        }
    } else {
        return std::fs::create_dir_all(dir).map_err(|e| {
            ValidationError::new("InvalidDirectory").with_message(
                format!("cannot create or access destination {:?}: {}", dir, e).into(),
            )
        });
    }

    Ok(())
}

/// A destination on a volume that is not mounted is accepted as is, runs against it get queued.
pub fn validate_destination<P: AsRef<Path>>(dir: P) -> std::result::Result<(), ValidationError> {
    let dir = dir.as_ref();
    if !is_volume_mounted(dir) {
        tracing::warn!("Volume of destination {:?} is not mounted", dir);
        return Ok(());
    }
    validate_dir_exist_or_created(dir)
}

/// Mount point of the removable volume `path` lives on: `/Volumes/<name>`, `/media/<user>/<name>`,
/// `/run/media/<user>/<name>` or `/mnt/<name>`.
pub fn volume_root<P: AsRef<Path>>(path: P) -> Option<PathBuf> {
    let names = path
        .as_ref()
        .components()
        .map_while(|c| match c {
            Component::RootDir => Some(None),
            Component::Normal(n) => Some(Some(n)),
            _ => None,
        })
        .collect::<Vec<_>>();
    let depth = match names.as_slice() {
        [None, Some(a), Some(_), ..] if *a == "Volumes" || *a == "mnt" => 3,
        [None, Some(a), Some(_), Some(_), ..] if *a == "media" => 4,
        [None, Some(a), Some(b), Some(_), Some(_), ..] if *a == "run" && *b == "media" => 5,
        _ => return None,
    };
    Some(path.as_ref().components().take(depth).collect())
}

fn is_mount_point(dir: &Path) -> bool {
    let parent = dir.parent().unwrap_or(dir);
    match (std::fs::metadata(dir), std::fs::metadata(parent)) {
        (Ok(md), Ok(parent_md)) => md.is_dir() && md.dev() != parent_md.dev(),
        _ => false,
    }
}

/// `false` only when `path` is on a removable volume that is not mounted.
pub fn is_volume_mounted<P: AsRef<Path>>(path: P) -> bool {
    volume_root(path).is_none_or(|root| is_mount_point(&root))
}

/// Whether a backup can go ahead now: the volume is mounted and the directory is there.
pub fn destination_available<P: AsRef<Path>>(path: P) -> bool {
    let path = path.as_ref();
    is_volume_mounted(path) && path.is_dir()
}

pub fn validate_sources(sources: &[PathBuf]) -> std::result::Result<(), ValidationError> {
    for source in sources {
        if !source.is_absolute() {
            return Err(ValidationError::new("InvalidSource")
                .with_message(format!("source {:?} must be an absolute path", source).into()));
        }
        validate_dir_exist(source)?;
    }
    Ok(())
}

pub fn validate_exclude_patterns(patterns: &[String]) -> std::result::Result<(), ValidationError> {
    ExcludeMatcher::new(patterns).map(|_| ()).map_err(|e| {
        ValidationError::new("InvalidExcludePattern").with_message(e.to_string().into())
    })
}

/// Neither the destination nor any source may contain the other.
pub fn validate_no_overlap(sources: &[PathBuf], destination: &Path) -> std::result::Result<(), ValidationError> {
    let normalize = |p: &Path| p.canonicalize().unwrap_or_else(|_| p.to_path_buf());
    let destination = normalize(destination);
    for source in sources.iter().map(|s| normalize(s)) {
        if destination.starts_with(&source) || source.starts_with(&destination) {
            return Err(ValidationError::new("OverlappingPaths").with_message(
                format!(
                    "destination {:?} and source {:?} must not contain each other",
                    destination, source
                )
                .into(),
            ));
        }
    }
    Ok(())
}

/// Creates and removes a probe file, the only reliable writability test.
pub fn probe_writable<P: AsRef<Path>>(dir: P) -> Result<()> {
    let dir = dir.as_ref();
    let unwritable = |e: std::io::Error| Error::destination_unwritable(dir, e.to_string());
    if !dir.is_dir() {
        return Err(Error::destination_unwritable(dir, "not a directory"));
    }
    let mut probe = tempfile::Builder::new()
        .prefix(".write_probe")
        .tempfile_in(dir)
        .map_err(unwritable)?;
    probe.write_all(b"probe").map_err(unwritable)?;
    probe.close().map_err(unwritable)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_validate_dir_exist() {
        let dir = TempDir::new().unwrap();
        assert!(validate_dir_exist(dir.path()).is_ok());
        assert!(validate_dir_exist(dir.path().join("missing")).is_err());

        let file = dir.path().join("file");
        std::fs::write(&file, "x").unwrap();
        assert!(validate_dir_exist(&file).is_err());
    }

    #[test]
    fn test_validate_dir_exist_or_created() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b");
        assert!(validate_dir_exist_or_created(&nested).is_ok());
        assert!(nested.is_dir());
    }

    #[test]
    fn test_volume_root() {
        assert_eq!(
            volume_root("/Volumes/Backup/dev"),
            Some(PathBuf::from("/Volumes/Backup"))
        );
        assert_eq!(
            volume_root("/media/alex/usb/backups/dev"),
            Some(PathBuf::from("/media/alex/usb"))
        );
        assert_eq!(
            volume_root("/run/media/alex/usb/dev"),
            Some(PathBuf::from("/run/media/alex/usb"))
        );
        assert_eq!(volume_root("/mnt/disk"), Some(PathBuf::from("/mnt/disk")));
        assert_eq!(volume_root("/Volumes"), None);
        assert_eq!(volume_root("/media/alex"), None);
        assert_eq!(volume_root("/home/alex/backups"), None);
        assert_eq!(volume_root("relative/Volumes/x"), None);
    }

    #[test]
    fn test_destination_availability() {
        let dir = TempDir::new().unwrap();
        assert!(is_volume_mounted(dir.path()));
        assert!(destination_available(dir.path()));
        assert!(!destination_available(dir.path().join("missing")));

        let unplugged = Path::new("/Volumes/dev-backup-unplugged-drive/backups");
        assert!(!is_volume_mounted(unplugged));
        assert!(!destination_available(unplugged));
        assert!(!is_volume_mounted("/mnt/dev-backup-unplugged-drive/backups"));
    }

    #[test]
    fn test_validate_destination_accepts_unmounted_volume() {
        let unplugged = Path::new("/media/nobody/dev-backup-unplugged-drive/backups");
        assert!(validate_destination(unplugged).is_ok());
        assert!(!unplugged.exists());

        let dir = TempDir::new().unwrap();
        let local = dir.path().join("backups");
        assert!(validate_destination(&local).is_ok());
        assert!(local.is_dir());
    }

    #[test]
    fn test_validate_sources() {
        let dir = TempDir::new().unwrap();
        assert!(validate_sources(&[dir.path().to_path_buf()]).is_ok());
        assert!(validate_sources(&[PathBuf::from("relative/path")]).is_err());
        assert!(validate_sources(&[dir.path().join("missing")]).is_err());
    }

    #[test]
    fn test_validate_no_overlap() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();

        assert!(validate_no_overlap(&[src.clone()], &dir.path().join("dst")).is_ok());
        assert!(validate_no_overlap(&[src.clone()], &src.join("backups")).is_err());
        assert!(validate_no_overlap(&[src.clone()], dir.path()).is_err());
    }

    #[test]
    fn test_validate_exclude_patterns() {
        assert!(validate_exclude_patterns(&["*.log".to_string()]).is_ok());
        assert!(validate_exclude_patterns(&["[oops".to_string()]).is_err());
    }

    #[test]
    fn test_probe_writable() {
        let dir = TempDir::new().unwrap();
        probe_writable(dir.path()).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        let err = probe_writable(dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, Error::DestinationUnwritable { .. }));
    }
}
