//! Drives one backup run as an explicit state machine:
//!
//! ```text
//! Idle -> AcquiringLock -> Validating -> Snapshotting -> Verifying -> Pruning -> Idle
//!              |               |              |             |            |
//!              +---------------+--- Aborted --+-------------+------------+
//!              |               +--- Skipped (power)
//!              +--- Skipped (destination away, run queued)
//! ```
//!
//! Every phase returns a [`Transition`]; the lock taken in `AcquiringLock` is dropped on every
//! exit path, panics included.

use crate::backup::backup_config::BackupConfig;
use crate::backup::cancel::CancelToken;
use crate::backup::health::{self, HealthReport};
use crate::backup::lock::{Lock, LockManager, LockRecord};
use crate::backup::manifest::Manifest;
use crate::backup::power::{PowerSource, SystemPower};
use crate::backup::queue::{BackupQueue, QueuedBackup, QUEUE_REASON_UNAVAILABLE};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::{convert_error_vec, Result};
use crate::backup::retention::{self, PruneReport};
use crate::backup::snapshot::engine::{SnapshotEngine, SnapshotOutcome};
use crate::backup::snapshot::restore::{self, RestoreReport};
use crate::backup::snapshot::{SnapshotInfo, SnapshotStore};
use crate::backup::space;
use crate::backup::status::{BackupStatus, Outcome, Phase, StatusFeed};
use crate::backup::validate::{destination_available, probe_writable};
use crate::backup::verify::{IntegrityVerifier, Verification};
use chrono::Local;
use rayon::ThreadPool;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub static EXIT_SUCCESS: i32 = 0;
pub static EXIT_FAILED: i32 = 1;
pub static EXIT_SKIPPED: i32 = 2;
pub static EXIT_PARTIAL: i32 = 3;
pub static EXIT_LOCK_CONTENTION: i32 = 4;

#[derive(Debug)]
pub enum Transition {
    Advance(Phase),
    Skip(String),
    Abort(Error),
}

#[derive(Default)]
struct RunContext {
    lock: Option<Lock>,
    basis: Option<SnapshotInfo>,
    snapshot: Option<SnapshotOutcome>,
    verification: Option<Verification>,
    prune: Option<PruneReport>,
    warnings: Vec<String>,
    corrupt: bool,
}

#[derive(Debug)]
pub struct RunReport {
    pub outcome: Outcome,
    pub reason: String,
    pub error: Option<Error>,
    pub snapshot: Option<SnapshotOutcome>,
    pub verification: Option<Verification>,
    pub prune: Option<PruneReport>,
    pub warnings: Vec<String>,
    pub elapsed: Duration,
}

impl RunReport {
    /// Deepest wrapped error of a failed run.
    pub fn root_cause(&self) -> Option<&Error> {
        self.error.as_ref().map(Error::root_cause)
    }

    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Success => EXIT_SUCCESS,
            Outcome::Skipped => EXIT_SKIPPED,
            Outcome::Partial => EXIT_PARTIAL,
            Outcome::Failed if self.error.as_ref().is_some_and(Error::is_lock_contention) => {
                EXIT_LOCK_CONTENTION
            }
            Outcome::Failed => EXIT_FAILED,
        }
    }
}

/// What `status` shows: this process's feed plus what other processes left on disk.
#[derive(Debug)]
pub struct StatusReport {
    pub current: BackupStatus,
    pub persisted: Option<BackupStatus>,
    pub holder: Option<LockRecord>,
    pub locked: bool,
    pub latest: Option<SnapshotInfo>,
}

pub struct BackupOrchestrator {
    config: BackupConfig,
    store: SnapshotStore,
    locks: LockManager,
    engine: SnapshotEngine,
    verifier: IntegrityVerifier,
    queue: BackupQueue,
    power: Arc<dyn PowerSource>,
    status: StatusFeed,
    cancel: CancelToken,
    pool: Arc<ThreadPool>,
}

impl BackupOrchestrator {
    pub fn new(config: BackupConfig, cancel: CancelToken) -> Result<Self> {
        let store = SnapshotStore::new(config.destination());
        let status = StatusFeed::new();
        let engine = SnapshotEngine::builder()
            .store(store.clone())
            .sources(config.source_layout())
            .excludes(Arc::new(config.exclude_matcher()?))
            .retry(config.retry())
            .status(status.clone())
            .cancel(cancel.clone())
            .build();
        Ok(Self {
            locks: LockManager::new(config.destination()),
            verifier: IntegrityVerifier::builder().cancel(cancel.clone()).build(),
            power: Arc::new(SystemPower::default()),
            pool: Arc::new(config.thread_pool()?),
            queue: config.queue(),
            config,
            store,
            engine,
            status,
            cancel,
        })
    }

    pub fn with_power(mut self, power: Arc<dyn PowerSource>) -> Self {
        self.power = power;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Shared handle for polling or subscribing to progress.
    pub fn status_feed(&self) -> StatusFeed {
        self.status.clone()
    }

    /// Runs one backup to completion. Never panics on a failed run, failures land in the report.
    pub fn run_backup(&self) -> RunReport {
        let started = Instant::now();
        tracing::info!("Trying to create backup...");
        self.status.begin_run();

        let mut ctx = RunContext::default();
        let mut phase = Phase::AcquiringLock;
        let end = loop {
            if phase == Phase::Idle {
                break None;
            }
            self.status.set_phase(phase);
            let transition = if self.cancel.is_cancelled() {
                Transition::Abort(Error::cancelled())
            } else {
                self.step(phase, &mut ctx).unwrap_or_else(Transition::Abort)
            };
            match transition {
                Transition::Advance(next) => phase = next,
                Transition::Skip(reason) => break Some(Transition::Skip(reason)),
                Transition::Abort(e) => break Some(Transition::Abort(e)),
            }
        };

        let (outcome, reason, error) = match end {
            None if ctx.corrupt => (
                Outcome::Partial,
                "Snapshot created but failed verification, marked corrupt".to_string(),
                None,
            ),
            None => (Outcome::Success, self.success_reason(&ctx), None),
            Some(Transition::Skip(reason)) => {
                self.status.set_phase(Phase::Skipped);
                (Outcome::Skipped, reason, None)
            }
            Some(Transition::Abort(e)) => {
                self.status.set_phase(Phase::Aborted);
                (Outcome::Failed, e.to_string(), Some(e))
            }
            Some(Transition::Advance(_)) => (Outcome::Success, self.success_reason(&ctx), None),
        };

        match outcome {
            Outcome::Success => tracing::info!("Backup finished: {}", reason),
            Outcome::Skipped => tracing::info!("Backup skipped: {}", reason),
            Outcome::Partial => tracing::warn!("Backup partially succeeded: {}", reason),
            Outcome::Failed => tracing::error!("Backup failed: {}", reason),
        }

        if matches!(outcome, Outcome::Success | Outcome::Partial) {
            self.settle_queue();
        }

        let root_cause = error.as_ref().map(|e| e.root_cause().to_string());
        self.status.finish(outcome, root_cause);
        if let Some(lock) = ctx.lock.take() {
            self.status.detach();
            if let Err(e) = self.locks.release(lock) {
                tracing::warn!("{}", e);
            }
        }

        RunReport {
            outcome,
            reason,
            error,
            snapshot: ctx.snapshot,
            verification: ctx.verification,
            prune: ctx.prune,
            warnings: ctx.warnings,
            elapsed: started.elapsed(),
        }
    }

    /// A backup reached the destination, so whatever was queued for it is done.
    fn settle_queue(&self) {
        match self.queue.remove_by_destination(self.config.destination()) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Replayed {} queued backups to {:?}", n, self.config.destination()),
            Err(e) => tracing::warn!("{}", e),
        }
    }

    fn success_reason(&self, ctx: &RunContext) -> String {
        match &ctx.snapshot {
            Some(s) => format!(
                "Created snapshot {}: {} changed / {} total files",
                s.info.id(),
                s.changed,
                s.total
            ),
            None => "Nothing to do".to_string(),
        }
    }

    fn step(&self, phase: Phase, ctx: &mut RunContext) -> Result<Transition> {
        match phase {
            Phase::AcquiringLock => self.acquire_lock(ctx),
            Phase::Validating => self.validate(ctx),
            Phase::Snapshotting => self.snapshot(ctx),
            Phase::Verifying => self.verify_new_snapshot(ctx),
            Phase::Pruning => self.prune(ctx),
            Phase::Idle | Phase::Aborted | Phase::Skipped => Ok(Transition::Advance(Phase::Idle)),
        }
    }

    fn acquire_lock(&self, ctx: &mut RunContext) -> Result<Transition> {
        let destination = self.config.destination();
        if !destination_available(destination) {
            let queued = self.queue.enqueue(
                self.config.sources(),
                destination,
                QUEUE_REASON_UNAVAILABLE,
            )?;
            return Ok(Transition::Skip(format!(
                "Destination {:?} unavailable, backup queued ({} attempts)",
                destination,
                queued.attempts()
            )));
        }
        ctx.lock = Some(self.locks.acquire()?);
        self.status.attach(self.config.destination());
        Ok(Transition::Advance(Phase::Validating))
    }

    fn validate(&self, ctx: &mut RunContext) -> Result<Transition> {
        let destination = self.config.destination();
        probe_writable(destination)?;
        convert_error_vec(
            self.engine
                .sources()
                .iter()
                .filter_map(|source| source.ensure_available().err())
                .collect(),
        )?;

        let removed = self.store.cleanup_incomplete()?;
        if removed > 0 {
            tracing::info!("Removed {} incomplete snapshots of interrupted runs", removed);
        }

        let power = self.power.status();
        if power.should_skip(self.config.battery_threshold()) {
            return Ok(Transition::Skip(format!(
                "On battery at {}%, below the {}% threshold",
                power.level,
                self.config.battery_threshold()
            )));
        }

        ctx.basis = self.store.latest_basis()?;
        let estimated = self.engine.estimate_changed_bytes(ctx.basis.as_ref())?;
        let space = space::check(destination, estimated, &self.config.space())?;
        ctx.warnings.extend(space.warning);
        Ok(Transition::Advance(Phase::Snapshotting))
    }

    fn snapshot(&self, ctx: &mut RunContext) -> Result<Transition> {
        let outcome = self
            .pool
            .install(|| self.engine.create(ctx.basis.as_ref()))?;
        let next = if self.config.verify_after_backup() {
            Phase::Verifying
        } else {
            self.verifier.seal(&outcome.info, &outcome.manifest)?;
            Phase::Pruning
        };
        ctx.snapshot = Some(outcome);
        Ok(Transition::Advance(next))
    }

    fn verify_new_snapshot(&self, ctx: &mut RunContext) -> Result<Transition> {
        let Some(snapshot) = &ctx.snapshot else {
            return Ok(Transition::Advance(Phase::Pruning));
        };
        self.verifier.seal(&snapshot.info, &snapshot.manifest)?;
        let verification = self
            .pool
            .install(|| self.verifier.verify(&snapshot.info, None))?;
        if !verification.is_clean() {
            self.verifier.mark_corrupt(&self.store, &snapshot.info)?;
            ctx.corrupt = true;
        }
        ctx.verification = Some(verification);
        Ok(Transition::Advance(Phase::Pruning))
    }

    fn prune(&self, ctx: &mut RunContext) -> Result<Transition> {
        let snapshots = self.store.list()?;
        let plan = self
            .config
            .retention()
            .plan(snapshots, Local::now().naive_local());
        let report = retention::apply(&plan)?;
        if !report.failed.is_empty() {
            ctx.warnings.push(format!(
                "Failed to delete {} snapshots: {}",
                report.failed.len(),
                report
                    .failed
                    .iter()
                    .map(|(id, e)| format!("{id} ({e})"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        ctx.prune = Some(report);
        Ok(Transition::Advance(Phase::Idle))
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.store.list()
    }

    fn snapshot_or_latest(&self, snapshot_id: Option<&str>) -> Result<SnapshotInfo> {
        match snapshot_id {
            Some(id) => self.store.get(id),
            None => self
                .store
                .latest()?
                .ok_or_else(|| Error::snapshot_not_found("latest")),
        }
    }

    /// Checks a snapshot (the newest when `snapshot_id` is `None`) against its manifest.
    pub fn verify(&self, snapshot_id: Option<&str>, pattern: Option<&str>) -> Result<Verification> {
        let snapshot = self.snapshot_or_latest(snapshot_id)?;
        self.pool
            .install(|| self.verifier.verify(&snapshot, pattern))
    }

    /// Writes a fresh manifest for a snapshot that has none, e.g. one made by an older version.
    pub fn seal(&self, snapshot_id: &str) -> Result<Manifest> {
        let _lock = self.locks.acquire()?;
        let snapshot = self.store.get(snapshot_id)?;
        self.pool
            .install(|| self.verifier.create_manifest(&snapshot))
    }

    /// Copies `path` out of a snapshot. The lock keeps pruning from removing it meanwhile.
    pub fn restore<P: AsRef<Path>>(
        &self,
        snapshot_id: &str,
        path: P,
        target: Option<&Path>,
    ) -> Result<RestoreReport> {
        let _lock = self.locks.acquire()?;
        restore::restore(&self.store, self.engine.sources(), snapshot_id, path, target)
    }

    /// Every queued backup of the user, not only the ones for this destination.
    pub fn queued(&self) -> Vec<QueuedBackup> {
        self.queue.all()
    }

    pub fn clear_queue(&self) -> Result<usize> {
        self.queue.clear()
    }

    /// Re-verifies every snapshot at least `min_age` old without changing any of them.
    pub fn health(&self, min_age: Option<Duration>) -> Result<HealthReport> {
        self.pool.install(|| {
            health::check_all(
                &self.store,
                &self.verifier,
                min_age,
                Local::now().naive_local(),
            )
        })
    }

    pub fn status(&self) -> Result<StatusReport> {
        Ok(StatusReport {
            current: self.status.snapshot(),
            persisted: BackupStatus::load(self.config.destination())?,
            holder: self.locks.holder()?,
            locked: self.locks.is_locked()?,
            latest: self.store.latest()?,
        })
    }

    /// Backs up every `schedule` until cancelled. Failed runs are logged and retried next time.
    pub fn start_loop(&self) -> Result<()> {
        loop {
            let report = self.run_backup();
            if let Some(e) = &report.error {
                if e.is_cancelled() {
                    return Ok(());
                }
                if e.is_lock_contention() {
                    tracing::warn!("Another backup is running, will try again later");
                }
            }
            for warning in &report.warnings {
                tracing::warn!("{}", warning);
            }

            tracing::info!("Sleeping {:?} until the next backup", self.config.schedule());
            if !self.wait_for_next_run() {
                tracing::info!("Backup loop cancelled");
                return Ok(());
            }
        }
    }

    /// Sleeps until the next scheduled run, waking early once a queued destination is back.
    /// `false` when cancelled.
    fn wait_for_next_run(&self) -> bool {
        let deadline = Instant::now() + self.config.schedule();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return true;
            }
            if self
                .cancel
                .sleep(left.min(self.config.queue_poll_interval()))
                .is_err()
            {
                return false;
            }
            let destination = self.config.destination();
            if !self.queue.pending_for(destination).is_empty() && destination_available(destination) {
                tracing::info!("Destination {:?} is back, running queued backup", destination);
                return true;
            }
        }
    }
}
