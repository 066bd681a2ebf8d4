use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use rollup_core::OwnerId;
use rollup_storage::PgStore;
use rollup_sync::{Pipeline, PipelineConfig, RunStatus, RunSummary, WindowSpec};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rollup-cli")]
#[command(about = "Periodic rollup and staleness reconciler")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one job, or every enabled job, once.
    Run {
        #[arg(long)]
        job: Option<String>,
        /// First day of an explicit replay window.
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        /// Last day (inclusive) of an explicit replay window.
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    /// Run the cron scheduler until Ctrl-C.
    Serve,
    Migrate,
    Snapshots,
    Reminders {
        #[command(subcommand)]
        command: ReminderCommands,
    },
}

#[derive(Debug, Subcommand)]
enum ReminderCommands {
    List {
        /// Include closed reminders.
        #[arg(long)]
        all: bool,
    },
    Close {
        #[arg(long)]
        owner: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        job: None,
        from: None,
        to: None,
    });

    match command {
        Commands::Run { job, from, to } => {
            let window = match (from, to) {
                (Some(from), Some(to)) => Some(WindowSpec::Explicit { from, to }),
                _ => None,
            };
            if window.is_some() && job.is_none() {
                bail!("--from/--to replay a single job; pass --job");
            }
            let outcomes = rollup_sync::run_once_from_env(job.as_deref(), window).await?;
            let mut failed = 0;
            for outcome in &outcomes {
                match &outcome.result {
                    Ok(summary) => {
                        print_summary(summary);
                        if summary.status == RunStatus::WriteFailed {
                            failed += 1;
                        }
                    }
                    Err(err) => {
                        println!("{}: failed: {err:#}", outcome.job_id);
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} run(s) failed", outcomes.len());
            }
        }
        Commands::Serve => {
            let pipeline = Arc::new(Pipeline::from_config(PipelineConfig::from_env()).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler is disabled; set ROLLUP_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(jobs = pipeline.registry().enabled().count(), "scheduler running; Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("stopping");
            pipeline.cancel_flag().cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Migrate => {
            let config = PipelineConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Snapshots => {
            let pipeline = Pipeline::from_config(PipelineConfig::from_env()).await?;
            let mut snapshots = pipeline.snapshots().list_all().await?;
            snapshots.sort_by(|a, b| (a.period_start, &a.bucket).cmp(&(b.period_start, &b.bucket)));
            for snapshot in snapshots {
                let totals = snapshot
                    .totals
                    .iter()
                    .map(|(measure, total)| format!("{measure}={total}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                println!(
                    "{:<12} {}..{} count={} {}",
                    snapshot.bucket.to_string(),
                    snapshot.period_start,
                    snapshot.period_end,
                    snapshot.source_count,
                    totals
                );
            }
        }
        Commands::Reminders { command } => {
            let pipeline = Pipeline::from_config(PipelineConfig::from_env()).await?;
            match command {
                ReminderCommands::List { all } => {
                    for reminder in pipeline.reminders().list_all().await? {
                        if !all && !reminder.is_open() {
                            continue;
                        }
                        println!(
                            "{} {} job={} last_activity={} created={}",
                            reminder.owner,
                            reminder.status.as_str(),
                            reminder.job_id,
                            reminder.last_activity_at,
                            reminder.created_at
                        );
                    }
                }
                ReminderCommands::Close { owner } => {
                    let owner = OwnerId(owner);
                    let Some(mut reminder) = pipeline
                        .reminders()
                        .list_all()
                        .await?
                        .into_iter()
                        .find(|r| r.owner == owner && r.is_open())
                    else {
                        bail!("no open reminder for {owner}");
                    };
                    reminder.close(Utc::now());
                    pipeline.reminders().save_all(vec![reminder]).await?;
                    println!("closed reminder for {owner}");
                }
            }
        }
    }

    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!(
        "{} {}: status={} window={} chunks={}/{} folded={} skipped={} inserted={} updated={} suppressed={}",
        summary.job_id,
        summary.run_id,
        summary.status.as_str(),
        summary.window,
        summary.chunks_processed,
        summary.chunks_processed + summary.chunks_failed,
        summary.folds.records_folded,
        summary.folds.skipped_invalid_timestamp + summary.folds.skipped_missing_owner,
        summary.records_inserted,
        summary.records_updated,
        summary.reminders_suppressed
    );
}
