// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! `dual-sync`: one-shot backups, restores and health checks, or the
//! scheduler as a long-running daemon.
//!
//! Configuration comes from the environment (see `SyncConfig::from_env`).

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use dual_sync_engine::{Job, JobStatus, Scheduler, SyncConfig, SyncOrchestrator};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "dual-sync")]
#[command(about = "Primary/backup database synchronization and disaster recovery", long_about = None)]
#[command(version)]
struct Cli {
    /// Run one backup (primary → backup) and exit
    #[arg(long, conflicts_with_all = ["health_check", "daemon", "restore"])]
    sync_now: bool,

    /// Print both databases' health as JSON and exit
    #[arg(long, conflicts_with_all = ["daemon", "restore"])]
    health_check: bool,

    /// Run scheduled backups until interrupted
    #[arg(long, conflicts_with = "restore")]
    daemon: bool,

    /// Run one restore (backup → primary) and exit
    #[arg(long)]
    restore: bool,

    /// With --restore: use the full plan even if the primary has live data
    #[arg(long, requires = "restore")]
    force_full: bool,

    /// Write the audit trail as JSON after a one-shot run
    #[arg(long, value_name = "PATH")]
    audit_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).compact().init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<bool> {
    let config = SyncConfig::from_env().context("invalid configuration")?;
    let orchestrator = SyncOrchestrator::new(config).context("failed to set up connection pools")?;

    if cli.health_check {
        let report = orchestrator.connections().health_check().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(true);
    }

    if cli.daemon {
        let scheduler = Scheduler::new(orchestrator);
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping scheduler");
            }
            signal.cancel();
        });
        scheduler.run(shutdown).await;
        return Ok(true);
    }

    let job = if cli.restore {
        orchestrator.run_restore(cli.force_full).await
    } else if cli.sync_now {
        orchestrator.run_backup(None).await
    } else {
        anyhow::bail!("nothing to do: pass --sync-now, --restore, --health-check or --daemon");
    };

    report(&job);
    if let Some(path) = cli.audit_log {
        orchestrator
            .audit()
            .save_json(&path)
            .with_context(|| format!("failed to write audit log to {}", path.display()))?;
        info!(path = %path.display(), "Audit trail saved");
    }
    Ok(job.status == JobStatus::Completed)
}

fn report(job: &Job) {
    let elapsed = job.elapsed().num_milliseconds() as f64 / 1000.0;
    match job.status {
        JobStatus::Completed => info!(
            task_id = %job.id,
            tables = job.tables_succeeded,
            skipped = job.tables_skipped,
            failed = job.tables_failed,
            rows = job.total_rows,
            elapsed_secs = elapsed,
            "{} completed",
            job.kind
        ),
        _ => error!(
            task_id = %job.id,
            error = job.error.as_deref().unwrap_or("unknown error"),
            elapsed_secs = elapsed,
            "{} failed",
            job.kind
        ),
    }
}
