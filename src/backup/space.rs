//! Free space preflight for the destination filesystem.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use bon::Builder;
use getset::CopyGetters;
use nix::sys::statvfs::statvfs;
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

static DEFAULT_BUFFER_PERCENT: u32 = 10;
static DEFAULT_MIN_FREE_WARNING: u64 = 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq, CopyGetters)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct SpaceConfig {
    /// Safety margin on top of the estimated snapshot size.
    #[serde(default = "default_buffer_percent")]
    #[builder(default = DEFAULT_BUFFER_PERCENT)]
    #[validate(range(max = 1000))]
    buffer_percent: u32,
    /// Warn, but continue, when less than this remains free.
    #[serde(default = "default_min_free_warning")]
    #[builder(default = DEFAULT_MIN_FREE_WARNING)]
    min_free_warning: u64,
}

fn default_buffer_percent() -> u32 {
    DEFAULT_BUFFER_PERCENT
}

fn default_min_free_warning() -> u64 {
    DEFAULT_MIN_FREE_WARNING
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl SpaceConfig {
    pub fn required_for(&self, estimated: u64) -> u64 {
        estimated.saturating_add(estimated.saturating_mul(self.buffer_percent as u64) / 100)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceCheck {
    pub available: u64,
    pub estimated: u64,
    pub required: u64,
    pub warning: Option<String>,
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
#[allow(clippy::unnecessary_cast)]
pub fn free_bytes<P: AsRef<Path>>(path: P) -> Result<u64> {
    let path = path.as_ref();
    let stat = statvfs(path)
        .map_err(Error::from)
        .add_msg(format!("statvfs {:?} failed", path))?;
    Ok((stat.blocks_available() as u64).saturating_mul(stat.fragment_size() as u64))
}

/// Compares free space with what a snapshot of `estimated` new bytes needs.
pub fn evaluate(path: &Path, available: u64, estimated: u64, config: &SpaceConfig) -> Result<SpaceCheck> {
    let required = config.required_for(estimated);
    if available < required {
        tracing::error!(
            "Not enough space at {:?}: {} available, {} required",
            path,
            available,
            required
        );
        return Err(Error::insufficient_space(path, available, required));
    }

    let remaining = available - estimated;
    let warning = (remaining < config.min_free_warning).then(|| {
        let msg = format!(
            "Only {} bytes will remain free at {:?} after this snapshot",
            remaining, path
        );
        tracing::warn!("{}", msg);
        msg
    });

    Ok(SpaceCheck {
        available,
        estimated,
        required,
        warning,
    })
}

pub fn check<P: AsRef<Path>>(destination: P, estimated: u64, config: &SpaceConfig) -> Result<SpaceCheck> {
    let destination = destination.as_ref();
    let available = free_bytes(destination)?;
    tracing::debug!(
        "{:?}: {} bytes free, about {} bytes to write",
        destination,
        available,
        estimated
    );
    evaluate(destination, available, estimated, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_required_includes_buffer() {
        let config = SpaceConfig::default();
        assert_eq!(config.required_for(1000), 1100);
        assert_eq!(config.required_for(0), 0);
        assert_eq!(config.required_for(u64::MAX), u64::MAX);
    }

    #[test]
    fn test_insufficient_space() {
        let err = evaluate(Path::new("/dst"), 1000, 1000, &SpaceConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientSpace {
                available: 1000,
                required: 1100,
                ..
            }
        ));
    }

    #[test]
    fn test_low_free_space_only_warns() {
        let config = SpaceConfig::builder().min_free_warning(10_000).build();
        let check = evaluate(Path::new("/dst"), 5000, 1000, &config).unwrap();
        assert_eq!(check.required, 1100);
        assert!(check.warning.is_some());

        let roomy = evaluate(Path::new("/dst"), 50_000, 1000, &config).unwrap();
        assert!(roomy.warning.is_none());
    }

    #[test]
    fn test_free_bytes_of_real_directory() {
        let dir = TempDir::new().unwrap();
        assert!(free_bytes(dir.path()).unwrap() > 0);
        assert!(free_bytes(dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_config_from_yaml() {
        let config: SpaceConfig = serde_yml::from_str("buffer_percent: 25").unwrap();
        assert_eq!(config.buffer_percent(), 25);
        assert_eq!(config.min_free_warning(), DEFAULT_MIN_FREE_WARNING);
        assert!(serde_yml::from_str::<SpaceConfig>("bogus: 1").is_err());
    }
}
