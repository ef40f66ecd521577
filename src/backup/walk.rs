use crate::backup::exclude::ExcludeMatcher;
use crate::backup::function_path;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::{AddFunctionName, AddMsg};

use bon::Builder;
use dyn_iter::{DynIter, IntoDynIterator};
use function_name::named;
use getset::Getters;
use walkdir::{DirEntry, WalkDir};

use std::collections::HashSet;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One source directory and where it lands inside a snapshot.
#[derive(Clone, Debug, Builder, PartialEq, Eq, Getters)]
#[getset(get = "pub")]
pub struct SourceTree {
    #[builder(into)]
    src_dir: PathBuf,
    /// Relative to the snapshot root.
    #[builder(into)]
    dst_dir: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

#[derive(Debug)]
pub struct SourceEntry {
    pub src: PathBuf,
    /// Relative to the snapshot root.
    pub dst: PathBuf,
    pub kind: EntryKind,
    pub metadata: Metadata,
}

/// Maps each source to a snapshot subdirectory named after its last component.
///
/// Duplicate names get `-2`, `-3`... in the order given, so the layout is stable between runs.
pub fn source_layout<P: AsRef<Path>>(sources: &[P]) -> Vec<SourceTree> {
    let mut taken = HashSet::new();
    sources
        .iter()
        .map(|src| {
            let src = src.as_ref();
            let base = src
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "root".to_string());
            let mut name = base.clone();
            let mut n = 2;
            while !taken.insert(name.clone()) {
                name = format!("{base}-{n}");
                n += 1;
            }
            SourceTree::builder().src_dir(src).dst_dir(name).build()
        })
        .collect()
}

impl SourceTree {
    pub fn ensure_available(&self) -> Result<()> {
        if self.src_dir.is_dir() {
            Ok(())
        } else {
            tracing::error!(
                "Source directory does not exist or is not a directory: {:?}",
                self.src_dir
            );
            Err(Error::source_unavailable(self.src_dir.clone()))
        }
    }

    /// Every non-excluded entry below the source, parents before children, root excluded.
    #[named]
    pub fn entries<'a>(&self, excludes: Arc<ExcludeMatcher>) -> Result<DynIter<'a, Result<SourceEntry>>> {
        self.ensure_available()?;
        tracing::debug!("Scanning source directory {:?}", self.src_dir);

        let src_dir = self.src_dir.clone();
        let filter_root = self.src_dir.clone();
        let dst_dir = self.dst_dir.clone();

        let entries = WalkDir::new(&self.src_dir)
            .follow_links(false)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |de| {
                let relative = de.path().strip_prefix(&filter_root).unwrap_or(de.path());
                let excluded = excludes.is_excluded(relative, de.file_type().is_dir());
                if excluded {
                    tracing::trace!("Skipping {:?}, excluded", de.path());
                }
                !excluded
            })
            .filter_map(move |res| match res {
                Ok(de) => process_dir_entry(de, &src_dir, &dst_dir),
                Err(e) => Some(Err(e.into())),
            })
            .map(move |res| res.add_fn_name(function_path!()));

        Ok(entries.into_dyn_iter())
    }
}

fn process_dir_entry<P1: AsRef<Path>, P2: AsRef<Path>>(
    de: DirEntry,
    base_src_dir: P1,
    base_dst_dir: P2,
) -> Option<Result<SourceEntry>> {
    let file_type = de.file_type();
    let kind = if file_type.is_dir() {
        EntryKind::Dir
    } else if file_type.is_file() {
        EntryKind::File
    } else if file_type.is_symlink() {
        EntryKind::Symlink
    } else {
        tracing::warn!("Skipping {:?}, not a regular file, directory or symlink", de.path());
        return None;
    };

    let metadata = match de.metadata() {
        Ok(md) => md,
        Err(e) => return Some(Err(e.into())),
    };
    let src = de.into_path();
    let res = match src.strip_prefix(base_src_dir.as_ref()) {
        Ok(stripped) => Ok(base_dst_dir.as_ref().join(stripped)),
        Err(e) => Err(Error::from(std::io::Error::other(e)).add_msg(format!(
            "Stripping {:?} from {:?} failed",
            base_src_dir.as_ref(),
            src
        ))),
    };

    Some(res.map(|dst| {
        tracing::trace!("Including {:?} -> {:?}", src, dst);
        SourceEntry {
            src,
            dst,
            kind,
            metadata,
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_files(dir: &Path) -> std::io::Result<()> {
        std::fs::create_dir_all(dir.join("subdir"))?;
        std::fs::create_dir_all(dir.join("node_modules/pkg"))?;
        std::fs::write(dir.join("file1.txt"), "content1")?;
        std::fs::write(dir.join("file2.pyc"), "content2")?;
        std::fs::write(dir.join("subdir/file3.txt"), "content3")?;
        std::fs::write(dir.join("node_modules/pkg/index.js"), "content4")?;
        Ok(())
    }

    fn collect(tree: &SourceTree, patterns: &[&str]) -> Vec<SourceEntry> {
        let excludes = Arc::new(ExcludeMatcher::new(patterns).unwrap());
        tree.entries(excludes)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn test_entries_respect_excludes() {
        let temp_dir = TempDir::new().unwrap();
        create_test_files(temp_dir.path()).unwrap();
        let tree = SourceTree::builder()
            .src_dir(temp_dir.path())
            .dst_dir("proj")
            .build();

        let entries = collect(&tree, &["node_modules/", "*.pyc"]);
        let dsts: Vec<_> = entries.iter().map(|e| e.dst.clone()).collect();

        assert_eq!(
            dsts,
            vec![
                PathBuf::from("proj/file1.txt"),
                PathBuf::from("proj/subdir"),
                PathBuf::from("proj/subdir/file3.txt"),
            ]
        );
        assert_eq!(entries[1].kind, EntryKind::Dir);
        assert_eq!(entries[2].kind, EntryKind::File);
    }

    #[test]
    fn test_entries_without_excludes() {
        let temp_dir = TempDir::new().unwrap();
        create_test_files(temp_dir.path()).unwrap();
        let tree = SourceTree::builder()
            .src_dir(temp_dir.path())
            .dst_dir("proj")
            .build();

        let files = collect(&tree, &[])
            .into_iter()
            .filter(|e| e.kind == EntryKind::File)
            .count();
        assert_eq!(files, 4);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_not_followed() {
        let temp_dir = TempDir::new().unwrap();
        create_test_files(temp_dir.path()).unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("subdir"), temp_dir.path().join("loop"))
            .unwrap();
        let tree = SourceTree::builder()
            .src_dir(temp_dir.path())
            .dst_dir("proj")
            .build();

        let entries = collect(&tree, &["node_modules/"]);
        let link = entries
            .iter()
            .find(|e| e.dst == Path::new("proj/loop"))
            .unwrap();
        assert_eq!(link.kind, EntryKind::Symlink);
        assert!(!entries
            .iter()
            .any(|e| e.dst != Path::new("proj/loop") && e.dst.starts_with("proj/loop")));
        assert!(!entries
            .iter()
            .any(|e| e.dst == Path::new("proj/loop/file3.txt")));
    }

    #[test]
    fn test_missing_source_is_unavailable() {
        let tree = SourceTree::builder()
            .src_dir("/nonexistent/directory")
            .dst_dir("x")
            .build();

        let err = tree
            .entries(Arc::new(ExcludeMatcher::new::<&str>(&[]).unwrap()))
            .err()
            .unwrap();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }

    #[test]
    fn test_file_as_source_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("not_a_directory.txt");
        std::fs::write(&file_path, "content").unwrap();
        let tree = SourceTree::builder().src_dir(file_path).dst_dir("x").build();

        assert!(tree.ensure_available().is_err());
    }

    #[test]
    fn test_source_layout_dedupes_names() {
        let layout = source_layout(&["/a/app", "/b/app", "/c/lib", "/d/app"]);
        let names: Vec<_> = layout.iter().map(|t| t.dst_dir().clone()).collect();

        assert_eq!(
            names,
            vec![
                PathBuf::from("app"),
                PathBuf::from("app-2"),
                PathBuf::from("lib"),
                PathBuf::from("app-3"),
            ]
        );
        assert_eq!(layout[1].src_dir(), Path::new("/b/app"));
    }
}
