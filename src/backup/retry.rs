//! Bounded exponential backoff for per-file transient failures.

use crate::backup::cancel::CancelToken;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use bon::Builder;
use getset::CopyGetters;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use validator::Validate;

static DEFAULT_ATTEMPTS: u32 = 3;
static DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);
static DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, Serialize, Deserialize, Validate, Builder, PartialEq, Eq, CopyGetters)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_attempts")]
    #[builder(default = DEFAULT_ATTEMPTS)]
    #[validate(range(max = 10))]
    attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    #[builder(default = DEFAULT_BASE_DELAY)]
    base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    #[builder(default = DEFAULT_MAX_DELAY)]
    max_delay: Duration,
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

fn default_base_delay() -> Duration {
    DEFAULT_BASE_DELAY
}

fn default_max_delay() -> Duration {
    DEFAULT_MAX_DELAY
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or attempts run out.
    ///
    /// Exhausted retries surface as `TransientIo` naming `path`.
    pub fn run<T, F>(&self, path: &Path, cancel: &CancelToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 0;
        loop {
            cancel.check()?;
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt >= self.attempts => {
                    tracing::error!(
                        "All {} retries exhausted for {:?}: {}",
                        self.attempts,
                        path,
                        e
                    );
                    return Err(Error::transient_io(path, attempt + 1, e));
                }
                Err(e) => {
                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        "Retry attempt {}/{} for {:?} in {:?}: {}",
                        attempt,
                        self.attempts,
                        path,
                        delay,
                        e
                    );
                    cancel.sleep(delay)?;
                }
            }
        }
    }
}
