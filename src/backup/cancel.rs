//! Cooperative cancellation shared between the binary's signal handler and a running backup.

use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

static SIGNAL_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::cancelled())
        } else {
            Ok(())
        }
    }

    /// Sleeps up to `duration`, waking early on cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(100)));
        }
    }

    /// Token that trips on SIGINT or SIGTERM. Only the first call installs handlers.
    pub fn from_signals() -> Result<Self> {
        let mut installed = false;
        let flag = SIGNAL_FLAG
            .get_or_init(|| {
                installed = true;
                Arc::new(AtomicBool::new(false))
            })
            .clone();

        if installed {
            let action = SigAction::new(
                SigHandler::Handler(handle_signal),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            for signal in [Signal::SIGINT, Signal::SIGTERM] {
                // SAFETY: the handler only performs an atomic store.
                unsafe { sigaction(signal, &action) }?;
            }
            tracing::debug!("Installed SIGINT/SIGTERM handlers");
        }

        Ok(Self { flag })
    }
}

extern "C" fn handle_signal(_: nix::libc::c_int) {
    if let Some(flag) = SIGNAL_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}
