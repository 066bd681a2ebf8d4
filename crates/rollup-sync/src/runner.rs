//! Chunk coordinator: scan, merge, then a single write per run.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rollup_adapters::SourceFeed;
use rollup_core::{OutputRecord, Window};
use rollup_storage::{OutputStore, StoreError};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::JobKind;
use crate::merge::{Accumulator, Closing, FoldStats, Reconciliation, RunContext};

/// Ledger size a single bucket is expected to stay under.
pub const LEDGER_WARN_LEN: usize = 250_000;

/// Cooperative stop signal, checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// At least one chunk could not be fetched; everything else was written.
    CompletedWithErrors,
    WriteFailed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithErrors => "completed_with_errors",
            RunStatus::WriteFailed => "write_failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Scanning,
    Finalizing,
}

fn enter(phase: &mut Phase, next: Phase) {
    debug!(from = ?*phase, to = ?next, "run phase");
    *phase = next;
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job_id: String,
    pub kind: JobKind,
    pub window: Window,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub chunks_processed: usize,
    pub chunks_failed: usize,
    #[serde(flatten)]
    pub folds: FoldStats,
    pub buckets_touched: usize,
    pub records_inserted: usize,
    pub records_updated: usize,
    pub records_unchanged: usize,
    pub reminders_suppressed: usize,
    pub write_failures: usize,
    /// Largest fold ledger among the records written.
    pub largest_ledger: usize,
    pub error: Option<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::CompletedWithErrors)
    }
}

/// Summary plus the records persisted by the run, ids assigned.
#[derive(Debug, Clone)]
pub struct RunOutput<O> {
    pub summary: RunSummary,
    pub written: Vec<O>,
}

pub struct JobRunner<'a, R: Reconciliation> {
    kind: JobKind,
    reconciliation: &'a R,
    feed: &'a dyn SourceFeed,
    store: &'a dyn OutputStore<R::Output>,
    chunk_size: usize,
    cancel: CancelFlag,
}

impl<'a, R: Reconciliation> JobRunner<'a, R> {
    pub fn new(
        kind: JobKind,
        reconciliation: &'a R,
        feed: &'a dyn SourceFeed,
        store: &'a dyn OutputStore<R::Output>,
    ) -> Self {
        Self {
            kind,
            reconciliation,
            feed,
            store,
            chunk_size: 200,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs one reconciliation over `window`.
    ///
    /// Only a failure to load existing outputs is returned as an error; fetch
    /// and write failures are reported through the summary status.
    pub async fn run(&self, ctx: RunContext, window: Window) -> Result<RunOutput<R::Output>, StoreError> {
        let span = info_span!("reconcile_run", run_id = %ctx.run_id, job_id = %ctx.job_id);
        self.run_inner(ctx, window).instrument(span).await
    }

    async fn run_inner(&self, ctx: RunContext, window: Window) -> Result<RunOutput<R::Output>, StoreError> {
        let started_at = Utc::now();
        let mut phase = Phase::Idle;
        let mut summary = RunSummary {
            run_id: ctx.run_id,
            job_id: ctx.job_id.clone(),
            kind: self.kind,
            window,
            started_at,
            finished_at: started_at,
            status: RunStatus::Completed,
            chunks_processed: 0,
            chunks_failed: 0,
            folds: FoldStats::default(),
            buckets_touched: 0,
            records_inserted: 0,
            records_updated: 0,
            records_unchanged: 0,
            reminders_suppressed: 0,
            write_failures: 0,
            largest_ledger: 0,
            error: None,
        };

        let existing = self.store.load_existing(&window.load_scope()).await?;
        debug!(loaded = existing.len(), "existing outputs loaded");
        let mut accumulator = Accumulator::<R>::new(existing);

        enter(&mut phase, Phase::Scanning);
        info!(%window, feed = self.feed.name(), chunk_size = self.chunk_size, "scanning");
        match self.feed.open(&window, self.chunk_size).await {
            Ok(mut cursor) => loop {
                if self.cancel.is_cancelled() {
                    break;
                }
                let chunk_no = summary.chunks_processed + summary.chunks_failed;
                match cursor.next_chunk().await {
                    Ok(Some(chunk)) => {
                        info_span!("chunk", chunk_no, records = chunk.len())
                            .in_scope(|| accumulator.fold_chunk(self.reconciliation, &chunk, &ctx));
                        summary.chunks_processed += 1;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(chunk_no, %err, "skipping chunk that failed to fetch");
                        summary.chunks_failed += 1;
                        summary.error.get_or_insert_with(|| err.to_string());
                    }
                }
            },
            Err(err) => {
                warn!(%err, "could not open source feed");
                summary.chunks_failed += 1;
                summary.error = Some(err.to_string());
            }
        }

        summary.folds = accumulator.stats().clone();
        summary.buckets_touched = accumulator.buckets_touched();
        if summary.folds.skipped_invalid_timestamp + summary.folds.skipped_missing_owner > 0 {
            warn!(
                invalid_timestamp = summary.folds.skipped_invalid_timestamp,
                missing_owner = summary.folds.skipped_missing_owner,
                "records skipped"
            );
        }

        if self.cancel.is_cancelled() {
            summary.status = RunStatus::Cancelled;
            summary.finished_at = Utc::now();
            warn!(chunks_processed = summary.chunks_processed, "run cancelled; nothing written");
            enter(&mut phase, Phase::Idle);
            return Ok(RunOutput {
                summary,
                written: Vec::new(),
            });
        }

        enter(&mut phase, Phase::Finalizing);
        let Closing {
            writes,
            unchanged,
            suppressed,
        } = accumulator.close(self.reconciliation, &ctx);
        summary.records_unchanged = unchanged;
        summary.reminders_suppressed = suppressed;
        summary.largest_ledger = writes.iter().map(OutputRecord::ledger_len).max().unwrap_or(0);
        if summary.largest_ledger > LEDGER_WARN_LEN {
            warn!(
                largest_ledger = summary.largest_ledger,
                limit = LEDGER_WARN_LEN,
                "fold ledger is past its expected size"
            );
        }

        let mut written = Vec::new();
        if !writes.is_empty() {
            let batch = writes.len();
            match self.store.save_all(writes).await {
                Ok(outcome) => {
                    summary.records_inserted = outcome.inserted;
                    summary.records_updated = outcome.updated;
                    written = outcome.records;
                }
                Err(err) => {
                    warn!(%err, batch, "write rejected; nothing persisted");
                    summary.status = RunStatus::WriteFailed;
                    summary.write_failures = batch;
                    summary.error = Some(err.to_string());
                }
            }
        }

        if summary.status == RunStatus::Completed && summary.chunks_failed > 0 {
            summary.status = RunStatus::CompletedWithErrors;
        }
        summary.finished_at = Utc::now();
        enter(&mut phase, Phase::Idle);
        info!(
            status = summary.status.as_str(),
            chunks = summary.chunks_processed,
            folded = summary.folds.records_folded,
            inserted = summary.records_inserted,
            updated = summary.records_updated,
            "run finished"
        );
        Ok(RunOutput { summary, written })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::Rollup;
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};
    use rollup_adapters::{FetchError, MemorySourceFeed, SourceCursor};
    use rollup_core::{OwnerId, RecordId, SnapshotRecord, SourceRecord};
    use rollup_storage::MemoryStore;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    fn order(id: &str, day: u32, amount: i64) -> SourceRecord {
        SourceRecord {
            id: RecordId::from(id),
            timestamp: Utc.with_ymd_and_hms(2024, 7, day, 9, 0, 0).single(),
            owner: Some(OwnerId::from("acct")),
            measures: BTreeMap::from([("amount".to_string(), Some(Decimal::from(amount)))]),
        }
    }

    fn july() -> Window {
        Window::of_days(
            NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 7, 31).unwrap(),
        )
        .unwrap()
    }

    fn ctx() -> RunContext {
        RunContext::new("weekly", Utc.with_ymd_and_hms(2024, 8, 1, 0, 0, 0).unwrap())
    }

    /// Feed whose cursor fails on the second chunk.
    struct FlakyFeed(Vec<SourceRecord>);

    struct FlakyCursor {
        chunks: std::vec::IntoIter<Vec<SourceRecord>>,
        served: usize,
    }

    #[async_trait]
    impl SourceFeed for FlakyFeed {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn open(&self, _window: &Window, chunk_size: usize) -> Result<Box<dyn SourceCursor>, FetchError> {
            let chunks: Vec<Vec<SourceRecord>> = self.0.chunks(chunk_size).map(|c| c.to_vec()).collect();
            Ok(Box::new(FlakyCursor {
                chunks: chunks.into_iter(),
                served: 0,
            }))
        }
    }

    #[async_trait]
    impl SourceCursor for FlakyCursor {
        async fn next_chunk(&mut self) -> Result<Option<Vec<SourceRecord>>, FetchError> {
            self.served += 1;
            let next = self.chunks.next();
            if self.served == 2 {
                return Err(FetchError::Message("connection reset".to_string()));
            }
            Ok(next)
        }
    }

    #[tokio::test]
    async fn failed_chunk_is_skipped_and_the_rest_commits() {
        let feed = FlakyFeed(vec![order("a", 1, 5), order("b", 2, 7), order("c", 15, 3)]);
        let store = MemoryStore::<SnapshotRecord>::new();
        let rollup = Rollup::weekly(vec!["amount".to_string()]);
        let out = JobRunner::new(JobKind::WeeklyRollup, &rollup, &feed, &store)
            .with_chunk_size(1)
            .run(ctx(), july())
            .await
            .unwrap();

        assert_eq!(out.summary.status, RunStatus::CompletedWithErrors);
        assert_eq!(out.summary.chunks_failed, 1);
        assert_eq!(out.summary.chunks_processed, 2);
        let stored = store.list_all().await.unwrap();
        let total: Decimal = stored.iter().map(|s| s.total("amount")).sum();
        assert_eq!(total, Decimal::from(8));
    }

    #[tokio::test]
    async fn cancelled_run_writes_nothing() {
        let feed = MemorySourceFeed::new(vec![order("a", 1, 5), order("b", 2, 7)]);
        let store = MemoryStore::<SnapshotRecord>::new();
        let rollup = Rollup::weekly(vec!["amount".to_string()]);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let out = JobRunner::new(JobKind::WeeklyRollup, &rollup, &feed, &store)
            .with_cancel(cancel)
            .run(ctx(), july())
            .await
            .unwrap();

        assert_eq!(out.summary.status, RunStatus::Cancelled);
        assert!(out.written.is_empty());
        assert!(store.list_all().await.unwrap().is_empty());
    }

    /// Feed whose cursor raises the cancel flag once its first chunk is served.
    struct CancelAfterFirst {
        records: Vec<SourceRecord>,
        cancel: CancelFlag,
    }

    struct CancellingCursor {
        chunks: std::vec::IntoIter<Vec<SourceRecord>>,
        cancel: CancelFlag,
    }

    #[async_trait]
    impl SourceFeed for CancelAfterFirst {
        fn name(&self) -> &str {
            "cancel-after-first"
        }

        async fn open(&self, _window: &Window, chunk_size: usize) -> Result<Box<dyn SourceCursor>, FetchError> {
            let chunks: Vec<Vec<SourceRecord>> = self.records.chunks(chunk_size).map(|c| c.to_vec()).collect();
            Ok(Box::new(CancellingCursor {
                chunks: chunks.into_iter(),
                cancel: self.cancel.clone(),
            }))
        }
    }

    #[async_trait]
    impl SourceCursor for CancellingCursor {
        async fn next_chunk(&mut self) -> Result<Option<Vec<SourceRecord>>, FetchError> {
            let next = self.chunks.next();
            self.cancel.cancel();
            Ok(next)
        }
    }

    #[tokio::test]
    async fn cancel_between_chunks_discards_folded_state() {
        let cancel = CancelFlag::new();
        let feed = CancelAfterFirst {
            records: vec![order("a", 1, 5), order("b", 2, 7), order("c", 15, 3)],
            cancel: cancel.clone(),
        };
        let store = MemoryStore::<SnapshotRecord>::new();
        let rollup = Rollup::weekly(vec!["amount".to_string()]);
        let out = JobRunner::new(JobKind::WeeklyRollup, &rollup, &feed, &store)
            .with_chunk_size(2)
            .with_cancel(cancel)
            .run(ctx(), july())
            .await
            .unwrap();

        assert_eq!(out.summary.status, RunStatus::Cancelled);
        assert_eq!(out.summary.chunks_processed, 1);
        assert_eq!(out.summary.folds.records_folded, 2);
        assert_eq!(out.summary.buckets_touched, 1);
        assert_eq!(out.summary.records_inserted, 0);
        assert!(out.written.is_empty());
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn summary_counts_inserts_then_updates() {
        let feed = MemorySourceFeed::new(vec![order("a", 1, 5), order("b", 8, 7)]);
        let store = MemoryStore::<SnapshotRecord>::new();
        let rollup = Rollup::weekly(vec!["amount".to_string()]);
        let runner = JobRunner::new(JobKind::WeeklyRollup, &rollup, &feed, &store);

        let first = runner.run(ctx(), july()).await.unwrap();
        assert_eq!(first.summary.records_inserted, 2);
        assert_eq!(first.summary.buckets_touched, 2);
        assert_eq!(first.summary.largest_ledger, 1);
        assert!(first.written.iter().all(|s| s.id.is_some()));

        feed.push(order("c", 9, 1)).await;
        let second = runner.run(ctx(), july()).await.unwrap();
        assert_eq!(second.summary.records_updated, 1);
        assert_eq!(second.summary.records_unchanged, 1);
        assert_eq!(second.summary.folds.already_folded, 2);
        assert_eq!(second.summary.largest_ledger, 2);
        assert_eq!(second.summary.status, RunStatus::Completed);
    }
}
