use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use rollup_adapters::MemorySourceFeed;
use rollup_core::{
    BucketKey, LoadScope, OwnerId, RecordId, ReminderRecord, SnapshotRecord, SourceRecord,
};
use rollup_storage::{FileStore, MemoryStore, OutputStore, StoreError, WriteOutcome};
use rollup_sync::{JobRegistry, Pipeline, PipelineConfig, RunStatus, WindowSpec};
use rust_decimal::Decimal;

fn fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/orders.jsonl")
}

fn registry() -> JobRegistry {
    let source = fixture().display().to_string();
    JobRegistry::from_yaml_str(&format!(
        r#"
jobs:
  - job_id: weekly
    kind: weekly_rollup
    measures: [order_total, tax]
    chunk_size: 3
    source: "{source}"
  - job_id: monthly
    kind: monthly_rollup
    measures: [order_total]
    source: "{source}"
  - job_id: stale
    kind: staleness
    window: {{ kind: lookback, days: 365 }}
    stale_after_days: 90
    source: "{source}"
"#
    ))
    .unwrap()
}

fn file_pipeline(root: &Path) -> Pipeline {
    let mut config = PipelineConfig::local(root);
    config.reports_dir = Some(root.join("reports"));
    Pipeline::new(
        config,
        registry(),
        Arc::new(FileStore::<SnapshotRecord>::new(root.join("data/snapshots.json"))),
        Arc::new(FileStore::<ReminderRecord>::new(root.join("data/reminders.json"))),
    )
}

fn july() -> Option<WindowSpec> {
    Some(WindowSpec::Explicit {
        from: NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
        to: NaiveDate::from_ymd_opt(2024, 7, 31).unwrap(),
    })
}

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

fn order(id: &str, ts: DateTime<Utc>, total: i64) -> SourceRecord {
    SourceRecord {
        id: RecordId::from(id),
        timestamp: Some(ts),
        owner: Some(OwnerId::from("acct")),
        measures: BTreeMap::from([("order_total".to_string(), Some(Decimal::from(total)))]),
    }
}

#[tokio::test]
async fn weekly_rollup_conserves_totals_and_reruns_are_no_ops() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = file_pipeline(dir.path());
    let now = at(2024, 8, 2);

    let first = pipeline.run_job("weekly", july(), now).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    assert_eq!(first.chunks_processed, 3);
    assert_eq!(first.folds.records_scanned, 7);
    assert_eq!(first.folds.skipped_invalid_timestamp, 1);
    assert_eq!(first.records_inserted, 4);

    let snapshots = pipeline.snapshots().list_all().await.unwrap();
    let keys: BTreeSet<String> = snapshots.iter().map(|s| s.bucket.to_string()).collect();
    assert_eq!(
        keys,
        BTreeSet::from([
            "2024-07-w1".to_string(),
            "2024-07-w2".to_string(),
            "2024-07-w3".to_string(),
            "2024-07-w5".to_string(),
        ])
    );
    let total: Decimal = snapshots.iter().map(|s| s.total("order_total")).sum();
    assert_eq!(total, Decimal::new(7600, 2));
    let tax: Decimal = snapshots.iter().map(|s| s.total("tax")).sum();
    assert_eq!(tax, Decimal::new(528, 2));
    let first_week = snapshots
        .iter()
        .find(|s| s.bucket.to_string() == "2024-07-w1")
        .unwrap();
    assert_eq!(first_week.total("order_total"), Decimal::new(1500, 2));
    assert_eq!(first_week.source_count, 3);

    let stored = std::fs::read(dir.path().join("data/snapshots.json")).unwrap();
    let second = pipeline.run_job("weekly", july(), at(2024, 8, 3)).await.unwrap();
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second.records_inserted + second.records_updated, 0);
    assert_eq!(second.folds.already_folded, 6);
    assert_eq!(second.records_unchanged, 4);
    assert_eq!(std::fs::read(dir.path().join("data/snapshots.json")).unwrap(), stored);

    let report = dir.path().join("reports").join(first.run_id.to_string());
    assert!(report.join("run_summary.json").exists());
    assert!(report.join("run_brief.md").exists());
    assert!(report.join("snapshots/manifest.json").exists());
}

#[tokio::test]
async fn later_run_adds_new_records_to_the_same_snapshot() {
    let feed = Arc::new(MemorySourceFeed::new(vec![
        order("a", at(2024, 7, 1), 5),
        order("b", at(2024, 7, 3), 7),
    ]));
    let snapshots = Arc::new(MemoryStore::<SnapshotRecord>::new());
    let pipeline = Pipeline::new(
        PipelineConfig::local("."),
        registry(),
        snapshots.clone(),
        Arc::new(MemoryStore::<ReminderRecord>::new()),
    )
    .with_feed("weekly", feed.clone());

    // open period on Jul 3 is the week of Jul 1..=7
    pipeline.run_job("weekly", None, at(2024, 7, 3)).await.unwrap();
    let stored = snapshots.list_all().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].total("order_total"), Decimal::from(12));
    let id = stored[0].id;

    feed.push(order("c", at(2024, 7, 4), 3)).await;
    let summary = pipeline.run_job("weekly", None, at(2024, 7, 4)).await.unwrap();
    assert_eq!(summary.records_updated, 1);
    assert_eq!(summary.records_inserted, 0);

    let stored = snapshots.list_all().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, id);
    assert_eq!(stored[0].total("order_total"), Decimal::from(15));
    assert_eq!(stored[0].source_count, 3);
}

#[tokio::test]
async fn weeks_spanning_new_year_keep_small_indexes() {
    let feed = Arc::new(MemorySourceFeed::new(vec![
        order("dec", at(2024, 12, 30), 1),
        order("jan", at(2025, 1, 1), 2),
        order("jan-5", at(2025, 1, 5), 4),
        order("jan-6", at(2025, 1, 6), 8),
    ]));
    let snapshots = Arc::new(MemoryStore::<SnapshotRecord>::new());
    let pipeline = Pipeline::new(
        PipelineConfig::local("."),
        registry(),
        snapshots.clone(),
        Arc::new(MemoryStore::<ReminderRecord>::new()),
    )
    .with_feed("weekly", feed);

    let window = WindowSpec::Explicit {
        from: NaiveDate::from_ymd_opt(2024, 12, 1).unwrap(),
        to: NaiveDate::from_ymd_opt(2025, 1, 31).unwrap(),
    };
    pipeline.run_job("weekly", Some(window), at(2025, 2, 1)).await.unwrap();

    let totals: BTreeMap<String, Decimal> = snapshots
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|s| (s.bucket.to_string(), s.total("order_total")))
        .collect();
    assert_eq!(
        totals,
        BTreeMap::from([
            ("2024-12-w6".to_string(), Decimal::from(1)),
            ("2025-01-w1".to_string(), Decimal::from(6)),
            ("2025-01-w2".to_string(), Decimal::from(8)),
        ])
    );
}

#[tokio::test]
async fn open_reminder_is_never_duplicated() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = file_pipeline(dir.path());
    let now = Utc.with_ymd_and_hms(2024, 10, 20, 12, 0, 0).unwrap();

    let first = pipeline.run_job("stale", None, now).await.unwrap();
    assert_eq!(first.records_inserted, 2);
    assert_eq!(first.folds.skipped_invalid_timestamp, 1);
    let reminders = pipeline.reminders().list_all().await.unwrap();
    let owners: BTreeSet<String> = reminders.iter().map(|r| r.owner.to_string()).collect();
    assert_eq!(
        owners,
        BTreeSet::from(["acct-globex".to_string(), "acct-initech".to_string()])
    );

    let second = pipeline.run_job("stale", None, now).await.unwrap();
    assert_eq!(second.records_inserted, 0);
    assert_eq!(second.reminders_suppressed, 2);
    assert_eq!(pipeline.reminders().list_all().await.unwrap().len(), 2);

    // closing frees the owner for a new reminder
    let mut globex = reminders
        .into_iter()
        .find(|r| r.owner == OwnerId::from("acct-globex"))
        .unwrap();
    globex.close(now);
    pipeline.reminders().save_all(vec![globex]).await.unwrap();

    let third = pipeline.run_job("stale", None, now).await.unwrap();
    assert_eq!(third.records_inserted, 1);
    assert_eq!(third.reminders_suppressed, 1);
    let all = pipeline.reminders().list_all().await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all.iter().filter(|r| r.is_open()).count(), 2);
}

/// Store whose loader lags behind: it never sees rows a concurrent run wrote.
struct StaleView(MemoryStore<SnapshotRecord>);

#[async_trait]
impl OutputStore<SnapshotRecord> for StaleView {
    async fn load_existing(&self, _scope: &LoadScope) -> Result<BTreeMap<BucketKey, SnapshotRecord>, StoreError> {
        Ok(BTreeMap::new())
    }

    async fn save_all(&self, records: Vec<SnapshotRecord>) -> Result<WriteOutcome<SnapshotRecord>, StoreError> {
        self.0.save_all(records).await
    }

    async fn list_all(&self) -> Result<Vec<SnapshotRecord>, StoreError> {
        self.0.list_all().await
    }
}

#[tokio::test]
async fn overlapping_insert_surfaces_as_write_failure() {
    let store = Arc::new(StaleView(MemoryStore::new()));
    let feed = Arc::new(MemorySourceFeed::new(vec![
        order("a", at(2024, 7, 1), 5),
        order("b", at(2024, 7, 9), 7),
    ]));
    let pipeline = Pipeline::new(
        PipelineConfig::local("."),
        registry(),
        store.clone(),
        Arc::new(MemoryStore::<ReminderRecord>::new()),
    )
    .with_feed("weekly", feed);

    let first = pipeline.run_job("weekly", july(), at(2024, 8, 1)).await.unwrap();
    assert_eq!(first.status, RunStatus::Completed);
    let before = store.list_all().await.unwrap();

    let second = pipeline.run_job("weekly", july(), at(2024, 8, 1)).await.unwrap();
    assert_eq!(second.status, RunStatus::WriteFailed);
    assert_eq!(second.write_failures, 2);
    assert!(second.error.is_some());
    assert_eq!(store.list_all().await.unwrap(), before);
}

#[tokio::test]
async fn monthly_replay_of_closed_period_is_explicit() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = file_pipeline(dir.path());

    // the open period in September doesn't touch July
    let summary = pipeline.run_job("monthly", None, at(2024, 9, 2)).await.unwrap();
    assert_eq!(summary.folds.records_folded, 0);
    assert_eq!(summary.folds.skipped_invalid_timestamp, 1);
    assert!(pipeline.snapshots().list_all().await.unwrap().is_empty());

    let replay = pipeline.run_job("monthly", july(), at(2024, 9, 2)).await.unwrap();
    assert_eq!(replay.records_inserted, 1);
    let stored = pipeline.snapshots().list_all().await.unwrap();
    assert_eq!(stored[0].bucket.to_string(), "2024-07");
    assert_eq!(stored[0].total("order_total"), Decimal::new(7600, 2));
}
