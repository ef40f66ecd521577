//! rsync-flavoured exclude patterns compiled into `globset` matchers.
//!
//! * `node_modules/` matches directories only, by name, at any depth.
//! * `*.pyc` (no slash) matches any entry by name, at any depth.
//! * `docs/build` matches the path relative to the source root, at any depth;
//!   `/docs/build` only at the root.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::Path;

pub static DEFAULT_EXCLUDES: &[&str] = &[
    "node_modules/",
    ".git/",
    "__pycache__/",
    "*.pyc",
    ".pytest_cache/",
    "build/",
    "dist/",
    ".next/",
    "target/",
    "*.log",
    ".DS_Store",
    "*.tmp",
    ".env.local",
    "coverage/",
    ".nyc_output/",
    "vendor/",
];

pub fn default_excludes() -> Vec<String> {
    DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect()
}

#[derive(Clone, Debug)]
pub struct ExcludeMatcher {
    names: GlobSet,
    dir_names: GlobSet,
    paths: GlobSet,
    dir_paths: GlobSet,
}

struct Builders {
    names: GlobSetBuilder,
    dir_names: GlobSetBuilder,
    paths: GlobSetBuilder,
    dir_paths: GlobSetBuilder,
}

impl Builders {
    fn new() -> Self {
        Self {
            names: GlobSetBuilder::new(),
            dir_names: GlobSetBuilder::new(),
            paths: GlobSetBuilder::new(),
            dir_paths: GlobSetBuilder::new(),
        }
    }
}

impl ExcludeMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builders = Builders::new();

        for raw in patterns {
            let raw = raw.as_ref().trim();
            let dir_only = raw.ends_with('/');
            let pattern = raw.trim_end_matches('/');
            if pattern.is_empty() {
                continue;
            }

            let (target, glob) = if pattern.contains('/') {
                let glob = match pattern.strip_prefix('/') {
                    Some(anchored) => anchored.to_string(),
                    None => format!("**/{pattern}"),
                };
                let target = if dir_only {
                    &mut builders.dir_paths
                } else {
                    &mut builders.paths
                };
                (target, glob)
            } else {
                let target = if dir_only {
                    &mut builders.dir_names
                } else {
                    &mut builders.names
                };
                (target, pattern.to_string())
            };

            let glob = GlobBuilder::new(&glob)
                .literal_separator(true)
                .build()
                .map_err(Error::from)
                .add_msg(format!("Invalid exclude pattern {raw:?}"))?;
            target.add(glob);
        }

        Ok(Self {
            names: builders.names.build()?,
            dir_names: builders.dir_names.build()?,
            paths: builders.paths.build()?,
            dir_paths: builders.dir_paths.build()?,
        })
    }

    /// `relative` is the entry's path below the source root.
    pub fn is_excluded<P: AsRef<Path>>(&self, relative: P, is_dir: bool) -> bool {
        let relative = relative.as_ref();
        let name_match = |set: &GlobSet| relative.file_name().is_some_and(|n| set.is_match(n));

        if name_match(&self.names) || self.paths.is_match(relative) {
            return true;
        }
        is_dir && (name_match(&self.dir_names) || self.dir_paths.is_match(relative))
    }
}
