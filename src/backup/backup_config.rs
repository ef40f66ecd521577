use crate::backup::exclude::{default_excludes, ExcludeMatcher};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use crate::backup::retention::RetentionPolicy;
use crate::backup::retry::RetryConfig;
use crate::backup::space::SpaceConfig;
use crate::backup::queue::BackupQueue;
use crate::backup::validate::{
    validate_destination, validate_exclude_patterns, validate_no_overlap, validate_sources,
};
use crate::backup::walk::{source_layout, SourceTree};
use bon::Builder;
use getset::{CopyGetters, Getters};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::{Validate, ValidationError};

static DEFAULT_SCHEDULE: Duration = Duration::from_secs(60 * 60);
static DEFAULT_BATTERY_THRESHOLD: u8 = 20;
static DEFAULT_QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// One backup job: what to copy, where to, and how long to keep it.
#[skip_serializing_none]
#[derive(Clone, Serialize, Deserialize, Debug, Validate, Builder, Getters, CopyGetters)]
#[serde(deny_unknown_fields)]
#[validate(schema(function = validate_layout))]
pub struct BackupConfig {
    #[validate(length(min = 1), custom(function = validate_source_list))]
    #[getset(get = "pub")]
    sources: Vec<PathBuf>,
    #[validate(custom(function = validate_destination))]
    #[builder(into)]
    #[getset(get = "pub")]
    destination: PathBuf,
    #[serde(default = "default_excludes")]
    #[builder(default = default_excludes())]
    #[validate(custom(function = validate_exclude_list))]
    #[getset(get = "pub")]
    exclude: Vec<String>,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    #[getset(get_copy = "pub")]
    retention: RetentionPolicy,
    /// Interval between runs of the daemon loop.
    #[serde(default = "default_schedule", with = "humantime_serde")]
    #[builder(default = DEFAULT_SCHEDULE)]
    #[getset(get_copy = "pub")]
    schedule: Duration,
    /// Skip runs on battery below this charge percentage.
    #[serde(default = "default_battery_threshold")]
    #[builder(default = DEFAULT_BATTERY_THRESHOLD)]
    #[validate(range(max = 100))]
    #[getset(get_copy = "pub")]
    battery_threshold: u8,
    #[serde(default = "default_true")]
    #[builder(default = true)]
    #[getset(get_copy = "pub")]
    verify_after_backup: bool,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    #[getset(get_copy = "pub")]
    retry: RetryConfig,
    #[serde(default)]
    #[builder(default)]
    #[validate(nested)]
    #[getset(get_copy = "pub")]
    space: SpaceConfig,
    #[validate(range(min = 1))]
    #[getset(get_copy = "pub")]
    threads: Option<usize>,
    /// Where runs against an unavailable destination are queued. Defaults to the user cache dir.
    #[builder(into)]
    #[getset(get = "pub")]
    queue_file: Option<PathBuf>,
    /// How often the daemon checks whether a queued destination came back.
    #[serde(default = "default_queue_poll_interval", with = "humantime_serde")]
    #[builder(default = DEFAULT_QUEUE_POLL_INTERVAL)]
    #[getset(get_copy = "pub")]
    queue_poll_interval: Duration,
}

fn default_schedule() -> Duration {
    DEFAULT_SCHEDULE
}

fn default_battery_threshold() -> u8 {
    DEFAULT_BATTERY_THRESHOLD
}

fn default_queue_poll_interval() -> Duration {
    DEFAULT_QUEUE_POLL_INTERVAL
}

fn default_true() -> bool {
    true
}

fn validate_source_list(sources: &[PathBuf]) -> std::result::Result<(), ValidationError> {
    validate_sources(sources)
}

fn validate_exclude_list(patterns: &[String]) -> std::result::Result<(), ValidationError> {
    validate_exclude_patterns(patterns)
}

fn validate_layout(config: &BackupConfig) -> std::result::Result<(), ValidationError> {
    validate_no_overlap(&config.sources, &config.destination)
}

impl BackupConfig {
    /// Reads and validates a YAML config file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        File::open(path)
            .map_err(Error::from)
            .add_msg(format!("Open config failed: {:?}", path))
            .and_then(|f| {
                serde_yml::from_reader::<_, BackupConfig>(f)
                    .map_err(Error::from)
                    .add_msg(format!("Parse YAML config failed: {:?}", path))
            })
            .and_then(|bc| {
                bc.validate()
                    .map_err(Error::from)
                    .map(|_| bc)
                    .add_msg(format!("Config validation failed: {:?}", path))
            })
    }

    pub fn source_layout(&self) -> Vec<SourceTree> {
        source_layout(&self.sources)
    }

    pub fn exclude_matcher(&self) -> Result<ExcludeMatcher> {
        ExcludeMatcher::new(&self.exclude)
    }

    pub fn queue(&self) -> BackupQueue {
        BackupQueue::new(
            self.queue_file
                .clone()
                .unwrap_or_else(BackupQueue::default_path),
        )
    }

    pub fn thread_pool(&self) -> Result<ThreadPool> {
        let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("dev-backup-{i}"));
        if let Some(threads) = self.threads {
            builder = builder.num_threads(threads);
        }
        Ok(builder.build()?)
    }
}
