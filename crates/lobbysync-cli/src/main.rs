use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use lobbysync_core::EntityKind;
use lobbysync_storage::StateFile;
use lobbysync_sync::{report_runs_markdown, run_sync_once_from_env, SyncConfig, SyncRunner};
use lobbysync_web::AppState;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "lobbysync")]
#[command(about = "Snapshot synchronization of lobbying representatives and meetings")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled source once, or only the kind `--source` serves.
    Sync {
        #[arg(long)]
        source: Option<String>,
    },
    /// Serve the read-only query API.
    Serve,
    /// Run the cron scheduler until interrupted.
    Schedule {
        /// Also serve the query API over the scheduler's store.
        #[arg(long)]
        serve: bool,
    },
    /// Print the audit trail of one entity, newest first.
    Trail { kind: String, id: Uuid },
    /// Print a markdown digest of recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lobbysync_sync=debug")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source } => {
            let summaries = run_sync_once_from_env(source.as_deref()).await?;
            for summary in summaries {
                let stats = summary.stats;
                println!(
                    "sync complete: run_id={} kind={} sources={} created={} updated={} unchanged={} deactivated={} rejected={} audit={}",
                    summary.run_id,
                    summary.kind,
                    summary.source_ids.join(","),
                    stats.created,
                    stats.updated,
                    stats.unchanged,
                    stats.deactivated,
                    stats.rejected,
                    stats.audit_records
                );
            }
        }
        Commands::Serve => lobbysync_web::serve_from_env().await?,
        Commands::Schedule { serve } => schedule(serve).await?,
        Commands::Trail { kind, id } => {
            let Some(kind) = EntityKind::parse(&kind) else {
                bail!("unknown entity kind {kind:?}");
            };
            let config = SyncConfig::from_env();
            let store = StateFile::new(config.state_path).load().await?;
            let trail = store.trail(kind, id);
            if trail.is_empty() {
                bail!("no audit records for {kind} {id}");
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&trail).context("serializing audit trail")?
            );
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            println!("{}", report_runs_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}

async fn schedule(serve: bool) -> Result<()> {
    let config = SyncConfig::from_env();
    let runner = Arc::new(SyncRunner::new(config.clone()).await?);
    let Some(mut sched) = runner.maybe_build_scheduler().await? else {
        bail!("scheduler is disabled; set LOBBYSYNC_SCHEDULER_ENABLED=1");
    };
    sched.start().await.context("starting scheduler")?;
    info!(
        register = %config.sync_cron_register,
        meetings = %config.sync_cron_meetings,
        "scheduler started"
    );

    if serve {
        let state = AppState::from_config(&config, runner.store())?;
        tokio::select! {
            served = lobbysync_web::serve(state, config.web_port) => served?,
            signal = tokio::signal::ctrl_c() => signal.context("waiting for ctrl-c")?,
        }
    } else {
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    }

    info!("shutting down scheduler");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
