//! # dev-backup
//!
//! Local snapshot backups for development directories.
//!
//! ## Features
//!
//! - **Hard-link Snapshots**: unchanged files are linked to the previous snapshot, only changes are copied
//! - **Atomic Publishing**: snapshots are built under `in_progress_*` and renamed into place
//! - **Integrity Manifests**: SHA-256 per file, re-verified after every run
//! - **Retention Management**: hourly, daily and weekly tiers
//! - **Single Writer**: an advisory `flock` per destination with stale-lock recovery
//! - **Preflight Checks**: free space and battery level
//! - **Offline Queue**: runs against an unplugged drive are queued and replayed once it is back
//! - **Health Sweep**: re-verifies the whole history and lists damaged snapshots
//!
//! ## Quick Start
//!
//! ```no_run
//! use dev_backup::backup::backup_config::BackupConfig;
//! use dev_backup::backup::cancel::CancelToken;
//! use dev_backup::backup::orchestrator::BackupOrchestrator;
//!
//! let config = BackupConfig::load("config.yml")?;
//! let orchestrator = BackupOrchestrator::new(config, CancelToken::from_signals()?)?;
//!
//! let report = orchestrator.run_backup();
//! std::process::exit(report.exit_code());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backup;
