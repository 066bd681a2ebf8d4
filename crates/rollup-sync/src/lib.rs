//! Job orchestration: registry, stores, feeds, runs, reports and the cron
//! scheduler.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rollup_adapters::{JsonlSourceFeed, PgSourceFeed, SourceFeed};
use rollup_core::{ReminderRecord, SnapshotRecord};
use rollup_storage::{FileStore, OutputStore, PgStore};
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod config;
pub mod merge;
pub mod report;
pub mod runner;

pub use config::{ConfigError, JobConfig, JobKind, JobRegistry, PipelineConfig, StoreBackend, WindowSpec};
pub use merge::{Accumulator, Closed, Closing, FoldStats, Reconciliation, Rollup, RunContext, StalenessCheck};
pub use runner::{CancelFlag, JobRunner, RunOutput, RunStatus, RunSummary};

pub const CRATE_NAME: &str = "rollup-sync";

/// Result of one job within a multi-job run.
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: String,
    pub result: Result<RunSummary>,
}

/// Reports are written after the store commit, so a failure here only loses
/// the report.
fn note_report_failure(summary: &RunSummary, written: Result<()>) {
    if let Err(err) = written {
        warn!(
            job_id = %summary.job_id,
            run_id = %summary.run_id,
            error = %format!("{err:#}"),
            "run committed but its report was not written"
        );
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    registry: JobRegistry,
    snapshots: Arc<dyn OutputStore<SnapshotRecord>>,
    reminders: Arc<dyn OutputStore<ReminderRecord>>,
    pool: Option<PgPool>,
    feeds: BTreeMap<String, Arc<dyn SourceFeed>>,
    cancel: CancelFlag,
    in_flight: Mutex<HashSet<String>>,
}

/// Marks a job as running until dropped.
struct InFlight<'a> {
    jobs: &'a Mutex<HashSet<String>>,
    job_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.remove(&self.job_id);
    }
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        registry: JobRegistry,
        snapshots: Arc<dyn OutputStore<SnapshotRecord>>,
        reminders: Arc<dyn OutputStore<ReminderRecord>>,
    ) -> Self {
        Self {
            config,
            registry,
            snapshots,
            reminders,
            pool: None,
            feeds: BTreeMap::new(),
            cancel: CancelFlag::new(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Loads `jobs.yaml` and opens the configured store backend.
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let registry = JobRegistry::load(&config.jobs_path()).await?;
        match config.store {
            StoreBackend::File => {
                let snapshots = FileStore::<SnapshotRecord>::new(config.data_dir.join("snapshots.json"));
                let reminders = FileStore::<ReminderRecord>::new(config.data_dir.join("reminders.json"));
                let pool = if registry.jobs.iter().any(|job| job.source == "postgres") {
                    let store = PgStore::connect(&config.database_url)
                        .await
                        .context("connecting to postgres source")?;
                    Some(store.pool().clone())
                } else {
                    None
                };
                let mut pipeline = Self::new(config, registry, Arc::new(snapshots), Arc::new(reminders));
                pipeline.pool = pool;
                Ok(pipeline)
            }
            StoreBackend::Postgres => {
                let store = Arc::new(
                    PgStore::connect(&config.database_url)
                        .await
                        .context("connecting to postgres")?,
                );
                let pool = store.pool().clone();
                let mut pipeline = Self::new(config, registry, store.clone(), store);
                pipeline.pool = Some(pool);
                Ok(pipeline)
            }
        }
    }

    /// Replaces the feed configured for `job_id`.
    pub fn with_feed(mut self, job_id: impl Into<String>, feed: Arc<dyn SourceFeed>) -> Self {
        self.feeds.insert(job_id.into(), feed);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn snapshots(&self) -> &dyn OutputStore<SnapshotRecord> {
        self.snapshots.as_ref()
    }

    pub fn reminders(&self) -> &dyn OutputStore<ReminderRecord> {
        self.reminders.as_ref()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn feed_for(&self, job: &JobConfig) -> Result<Arc<dyn SourceFeed>> {
        if let Some(feed) = self.feeds.get(&job.job_id) {
            return Ok(feed.clone());
        }
        if job.source == "postgres" {
            let pool = self
                .pool
                .clone()
                .ok_or_else(|| anyhow!("job `{}` reads postgres but no pool is configured", job.job_id))?;
            return Ok(Arc::new(PgSourceFeed::new(pool)));
        }
        Ok(Arc::new(JsonlSourceFeed::new(self.config.workspace_root.join(&job.source))))
    }

    fn begin(&self, job_id: &str) -> Option<InFlight<'_>> {
        let mut jobs = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !jobs.insert(job_id.to_string()) {
            return None;
        }
        Some(InFlight {
            jobs: &self.in_flight,
            job_id: job_id.to_string(),
        })
    }

    /// Runs one job now. `window` overrides the registry window, e.g. for an
    /// operator replay of a closed period.
    pub async fn run_job(&self, job_id: &str, window: Option<WindowSpec>, now: DateTime<Utc>) -> Result<RunSummary> {
        let job = self.registry.get(job_id)?;
        let Some(_guard) = self.begin(job_id) else {
            bail!("job `{job_id}` is already running");
        };
        let window = window
            .as_ref()
            .unwrap_or(&job.window)
            .resolve(&job.job_id, job.kind, now)?;
        let feed = self.feed_for(job)?;
        let chunk_size = job.chunk_size.unwrap_or(self.config.chunk_size);
        let ctx = RunContext::new(job.job_id.clone(), now);

        if job.kind.is_rollup() {
            let rollup = match job.kind {
                JobKind::MonthlyRollup => Rollup::monthly(job.measures.clone()),
                _ => Rollup::weekly(job.measures.clone()),
            };
            let output = JobRunner::new(job.kind, &rollup, feed.as_ref(), self.snapshots.as_ref())
                .with_chunk_size(chunk_size)
                .with_cancel(self.cancel.clone())
                .run(ctx, window)
                .await
                .with_context(|| format!("loading snapshots for `{job_id}`"))?;
            if let Some(root) = &self.config.reports_dir {
                let written = match report::write_run_report(root, &output.summary, &output.written).await {
                    Ok(dir) => report::export_snapshots_parquet(&dir, &output.written).await.map(|_| ()),
                    Err(err) => Err(err),
                };
                note_report_failure(&output.summary, written);
            }
            Ok(output.summary)
        } else {
            let stale_after = job
                .stale_after_days
                .ok_or_else(|| ConfigError::MissingStaleAfter {
                    job_id: job.job_id.clone(),
                })?;
            let check = StalenessCheck::days(stale_after);
            let output = JobRunner::new(job.kind, &check, feed.as_ref(), self.reminders.as_ref())
                .with_chunk_size(chunk_size)
                .with_cancel(self.cancel.clone())
                .run(ctx, window)
                .await
                .with_context(|| format!("loading reminders for `{job_id}`"))?;
            if let Some(root) = &self.config.reports_dir {
                let written = report::write_run_report(root, &output.summary, &output.written).await;
                note_report_failure(&output.summary, written.map(|_| ()));
            }
            Ok(output.summary)
        }
    }

    /// Runs every enabled job once, in registry order. A job that fails is
    /// logged and recorded; the remaining jobs still run.
    pub async fn run_all(&self, now: DateTime<Utc>) -> Vec<JobOutcome> {
        let mut outcomes = Vec::new();
        for job in self.registry.enabled() {
            let result = self.run_job(&job.job_id, None, now).await;
            if let Err(err) = &result {
                warn!(job_id = %job.job_id, error = %format!("{err:#}"), "job did not complete");
            }
            outcomes.push(JobOutcome {
                job_id: job.job_id.clone(),
                result,
            });
        }
        outcomes
    }

    /// One cron job per enabled registry entry that has a schedule. A trigger
    /// that fires while the previous run of the same job is active is skipped.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for job in self.registry.enabled() {
            let Some(cron) = job.cron.as_deref() else {
                continue;
            };
            let pipeline = Arc::clone(self);
            let job_id = job.job_id.clone();
            let cron_job = Job::new_async(cron, move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                let job_id = job_id.clone();
                Box::pin(async move {
                    match pipeline.run_job(&job_id, None, Utc::now()).await {
                        Ok(summary) => info!(
                            job_id = %job_id,
                            status = summary.status.as_str(),
                            "scheduled run finished"
                        ),
                        Err(err) => warn!(job_id = %job_id, error = %format!("{err:#}"), "scheduled run did not complete"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job `{}` for cron {cron}", job.job_id))?;
            sched.add(cron_job).await.context("adding scheduler job")?;
            info!(job_id = %job.job_id, cron, "scheduled");
        }
        Ok(Some(sched))
    }
}

pub async fn run_once_from_env(job_id: Option<&str>, window: Option<WindowSpec>) -> Result<Vec<JobOutcome>> {
    let config = PipelineConfig::from_env();
    let pipeline = Pipeline::from_config(config).await?;
    let now = Utc::now();
    match job_id {
        Some(job_id) => Ok(vec![JobOutcome {
            job_id: job_id.to_string(),
            result: pipeline.run_job(job_id, window, now).await,
        }]),
        None => Ok(pipeline.run_all(now).await),
    }
}
