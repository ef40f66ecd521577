use clap::{Parser, Subcommand};
use dev_backup::backup::backup_config::BackupConfig;
use dev_backup::backup::cancel::CancelToken;
use dev_backup::backup::orchestrator::{BackupOrchestrator, EXIT_FAILED, EXIT_PARTIAL, EXIT_SUCCESS};
use dev_backup::backup::result_error::result::Result;
use dev_backup::backup::verify::Verification;
use humantime_serde::re::humantime;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tracing::error;

/// Hard-link snapshot backups for development directories
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one backup now
    Run,
    /// Back up on the configured schedule until interrupted
    Daemon,
    /// List snapshots, newest first
    List,
    /// Re-hash a snapshot against its manifest
    Verify {
        /// Snapshot to check, defaults to the newest
        #[arg(short, long)]
        snapshot: Option<String>,
        /// Only check files matching this glob
        #[arg(short, long)]
        pattern: Option<String>,
    },
    /// Write a manifest for a snapshot that has none
    Seal { snapshot: String },
    /// Copy a file or directory out of a snapshot
    Restore {
        snapshot: String,
        /// Path inside the snapshot, starting with the source name
        path: PathBuf,
        /// Where to restore to, defaults to the original source location
        #[arg(short, long)]
        target: Option<PathBuf>,
    },
    /// Show the state of the current or last run
    Status,
    /// Show backups waiting for their destination to come back
    Queue {
        /// Drop every queued backup
        #[arg(long)]
        clear: bool,
    },
    /// Re-verify every snapshot and report the damaged ones
    Health {
        /// Only check snapshots at least this old, e.g. `7d`
        #[arg(long, value_parser = humantime::parse_duration)]
        min_age: Option<Duration>,
    },
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let res = CancelToken::from_signals().and_then(|cancel| {
        BackupConfig::load(&args.config)
            .and_then(|config| BackupOrchestrator::new(config, cancel))
            .and_then(|orchestrator| execute(&orchestrator, args.command))
    });

    match res {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{e}");
            exit(EXIT_FAILED);
        }
    }
}

fn execute(orchestrator: &BackupOrchestrator, command: Command) -> Result<i32> {
    match command {
        Command::Run => {
            let report = orchestrator.run_backup();
            println!("{}: {}", report.outcome, report.reason);
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            if let Some(prune) = &report.prune {
                if !prune.deleted.is_empty() {
                    println!(
                        "pruned {} snapshots, {} bytes reclaimed",
                        prune.deleted.len(),
                        prune.bytes_reclaimed
                    );
                }
            }
            Ok(report.exit_code())
        }
        Command::Daemon => orchestrator.start_loop().map(|_| EXIT_SUCCESS),
        Command::List => {
            for info in orchestrator.list_snapshots()? {
                match info.meta() {
                    Some(meta) => println!(
                        "{}  {:<8}  {} files ({} changed)  {} bytes",
                        info.id(),
                        info.status().to_string(),
                        meta.file_count(),
                        meta.changed_count(),
                        meta.total_bytes()
                    ),
                    None => println!("{}  {}", info.id(), info.status()),
                }
            }
            Ok(EXIT_SUCCESS)
        }
        Command::Verify { snapshot, pattern } => {
            match orchestrator.verify(snapshot.as_deref(), pattern.as_deref())? {
                Verification::Unverified => {
                    println!("no manifest, run `seal` first");
                    Ok(EXIT_SUCCESS)
                }
                Verification::Verified(report) => {
                    for finding in &report.findings {
                        println!("{finding}");
                    }
                    println!(
                        "{}: {} files checked, {} problems",
                        report.snapshot,
                        report.files_checked,
                        report.findings.len()
                    );
                    Ok(if report.is_clean() { EXIT_SUCCESS } else { EXIT_PARTIAL })
                }
            }
        }
        Command::Seal { snapshot } => {
            let manifest = orchestrator.seal(&snapshot)?;
            println!("{snapshot}: sealed {} files", manifest.file_count());
            Ok(EXIT_SUCCESS)
        }
        Command::Restore {
            snapshot,
            path,
            target,
        } => {
            let report = orchestrator.restore(&snapshot, &path, target.as_deref())?;
            println!(
                "restored {} files ({} bytes) to {:?}",
                report.files, report.bytes, report.target
            );
            Ok(EXIT_SUCCESS)
        }
        Command::Status => {
            let status = orchestrator.status()?;
            match &status.holder {
                Some(holder) if status.locked => println!("running: {holder}"),
                _ => println!("idle"),
            }
            let shown = status.persisted.as_ref().unwrap_or(&status.current);
            println!("{}", serde_json::to_string_pretty(shown)?);
            if let Some(latest) = &status.latest {
                println!("latest snapshot: {} ({})", latest.id(), latest.status());
            }
            Ok(EXIT_SUCCESS)
        }
        Command::Queue { clear: true } => {
            println!("cleared {} queued backups", orchestrator.clear_queue()?);
            Ok(EXIT_SUCCESS)
        }
        Command::Queue { clear: false } => {
            let queued = orchestrator.queued();
            if queued.is_empty() {
                println!("no queued backups");
            }
            for q in queued {
                println!(
                    "{:?}  queued {}  {} attempts, last {}  ({})",
                    q.destination(),
                    q.queued_at().to_rfc3339(),
                    q.attempts(),
                    q.last_attempt().to_rfc3339(),
                    q.reason()
                );
            }
            Ok(EXIT_SUCCESS)
        }
        Command::Health { min_age } => {
            let report = orchestrator.health(min_age)?;
            for h in report.snapshots.iter().filter(|h| !h.is_healthy()) {
                println!(
                    "{}  {} corrupted, {} missing, {} unreadable{}",
                    h.snapshot,
                    h.corrupted.len(),
                    h.missing.len(),
                    h.unreadable.len(),
                    h.error.as_ref().map(|e| format!(", {e}")).unwrap_or_default()
                );
            }
            println!(
                "{} snapshots checked, {} healthy, {} unhealthy",
                report.total, report.healthy, report.unhealthy
            );
            Ok(if report.is_healthy() { EXIT_SUCCESS } else { EXIT_PARTIAL })
        }
    }
}
