//! Source feed contracts + the windowed, chunked scanners over them.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollup_core::{OwnerId, RecordId, SourceRecord, Window};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgRow, Postgres};
use sqlx::types::Json;
use sqlx::{Connection, Row, Transaction};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::sync::RwLock;
use tracing::debug;

pub const CRATE_NAME: &str = "rollup-adapters";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} line {line}: {source}")]
    Decode {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Message(String),
}

/// Read-only, time-filterable source of transactional records.
#[async_trait]
pub trait SourceFeed: Send + Sync {
    fn name(&self) -> &str;

    /// Starts a scan of `window`. The returned cursor is pinned to the records
    /// visible at open time and stays valid for the rest of the run.
    ///
    /// Records without a timestamp can't be placed outside any window, so
    /// feeds deliver them too and leave rejecting them to the caller.
    async fn open(
        &self,
        window: &Window,
        chunk_size: usize,
    ) -> Result<Box<dyn SourceCursor>, FetchError>;
}

#[async_trait]
pub trait SourceCursor: Send {
    /// Next chunk of at most `chunk_size` records, `Ok(None)` once the window
    /// is exhausted. A failed chunk is consumed: the following call moves on to
    /// the chunk after it.
    async fn next_chunk(&mut self) -> Result<Option<Vec<SourceRecord>>, FetchError>;
}

fn in_window(record: &SourceRecord, window: &Window) -> bool {
    record.timestamp.map_or(true, |ts| window.contains(ts))
}

fn scan_order(a: &SourceRecord, b: &SourceRecord) -> std::cmp::Ordering {
    (a.timestamp, &a.id).cmp(&(b.timestamp, &b.id))
}

/// Cursor over chunks materialized at open time.
#[derive(Debug)]
pub struct VecCursor {
    chunks: VecDeque<Vec<SourceRecord>>,
}

impl VecCursor {
    pub fn new(records: Vec<SourceRecord>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let mut chunks = VecDeque::new();
        let mut records = records.into_iter().peekable();
        while records.peek().is_some() {
            chunks.push_back(records.by_ref().take(chunk_size).collect());
        }
        Self { chunks }
    }
}

#[async_trait]
impl SourceCursor for VecCursor {
    async fn next_chunk(&mut self) -> Result<Option<Vec<SourceRecord>>, FetchError> {
        Ok(self.chunks.pop_front())
    }
}

/// In-process feed; records may keep arriving between runs.
#[derive(Debug, Default)]
pub struct MemorySourceFeed {
    records: RwLock<Vec<SourceRecord>>,
}

impl MemorySourceFeed {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            records: RwLock::new(records),
        }
    }

    pub async fn push(&self, record: SourceRecord) {
        self.records.write().await.push(record);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl SourceFeed for MemorySourceFeed {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(
        &self,
        window: &Window,
        chunk_size: usize,
    ) -> Result<Box<dyn SourceCursor>, FetchError> {
        let mut selected: Vec<SourceRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| in_window(r, window))
            .cloned()
            .collect();
        selected.sort_by(scan_order);
        Ok(Box::new(VecCursor::new(selected, chunk_size)))
    }
}

/// Newline-delimited JSON file, one [`SourceRecord`] per line.
///
/// The file is streamed: each chunk reads at most `chunk_size` non-empty lines
/// and decodes them, so one malformed line fails its own chunk only.
#[derive(Debug, Clone)]
pub struct JsonlSourceFeed {
    path: PathBuf,
}

impl JsonlSourceFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SourceFeed for JsonlSourceFeed {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn open(
        &self,
        window: &Window,
        chunk_size: usize,
    ) -> Result<Box<dyn SourceCursor>, FetchError> {
        let file = File::open(&self.path).await.map_err(|source| FetchError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), chunk_size, "opened jsonl feed");
        Ok(Box::new(JsonlCursor {
            path: self.path.clone(),
            window: *window,
            chunk_size: chunk_size.max(1),
            lines: BufReader::new(file).lines(),
            line: 0,
        }))
    }
}

struct JsonlCursor {
    path: PathBuf,
    window: Window,
    chunk_size: usize,
    lines: Lines<BufReader<File>>,
    /// 1-based number of the last line read.
    line: usize,
}

impl JsonlCursor {
    async fn read_lines(&mut self) -> Result<Vec<(usize, String)>, FetchError> {
        let mut batch = Vec::with_capacity(self.chunk_size);
        while batch.len() < self.chunk_size {
            let next = self.lines.next_line().await.map_err(|source| FetchError::Io {
                path: self.path.clone(),
                source,
            })?;
            let Some(text) = next else {
                break;
            };
            self.line += 1;
            if !text.trim().is_empty() {
                batch.push((self.line, text));
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl SourceCursor for JsonlCursor {
    async fn next_chunk(&mut self) -> Result<Option<Vec<SourceRecord>>, FetchError> {
        let lines = self.read_lines().await?;
        if lines.is_empty() {
            return Ok(None);
        }
        let mut records = Vec::with_capacity(lines.len());
        for (line, text) in lines {
            let record: SourceRecord =
                serde_json::from_str(&text).map_err(|source| FetchError::Decode {
                    path: self.path.clone(),
                    line,
                    source,
                })?;
            if in_window(&record, &self.window) {
                records.push(record);
            }
        }
        Ok(Some(records))
    }
}

/// `source_records` table scanned in `(occurred_at, id)` order.
///
/// The cursor holds one read-only REPEATABLE READ transaction for the whole
/// scan, so every page reads the snapshot taken at open: rows inserted or
/// deleted during the run can't shift pages. Each page runs under a savepoint
/// so a failed page is stepped over without aborting the scan.
#[derive(Debug, Clone)]
pub struct PgSourceFeed {
    pool: PgPool,
}

impl PgSourceFeed {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const WINDOW_PREDICATE: &str =
    "((occurred_at >= $1 AND occurred_at < $2) OR occurred_at IS NULL)";

#[async_trait]
impl SourceFeed for PgSourceFeed {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn open(
        &self,
        window: &Window,
        chunk_size: usize,
    ) -> Result<Box<dyn SourceCursor>, FetchError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        let sql = format!("SELECT COUNT(*) FROM source_records WHERE {WINDOW_PREDICATE}");
        let total: i64 = sqlx::query_scalar(&sql)
            .bind(window.start)
            .bind(window.end)
            .fetch_one(&mut *tx)
            .await?;
        debug!(total, %window, "opened postgres feed");
        Ok(Box::new(PgCursor {
            tx,
            window: *window,
            chunk_size: i64::try_from(chunk_size.max(1)).unwrap_or(i64::MAX),
            offset: 0,
            total,
        }))
    }
}

struct PgCursor {
    tx: Transaction<'static, Postgres>,
    window: Window,
    chunk_size: i64,
    offset: i64,
    total: i64,
}

fn record_from_row(row: &PgRow) -> Result<SourceRecord, sqlx::Error> {
    let Json(measures): Json<BTreeMap<String, Option<Decimal>>> = row.try_get("measures")?;
    Ok(SourceRecord {
        id: RecordId(row.try_get("id")?),
        timestamp: row.try_get::<Option<DateTime<Utc>>, _>("occurred_at")?,
        owner: row.try_get::<Option<String>, _>("owner_id")?.map(OwnerId),
        measures,
    })
}

#[async_trait]
impl SourceCursor for PgCursor {
    async fn next_chunk(&mut self) -> Result<Option<Vec<SourceRecord>>, FetchError> {
        if self.offset >= self.total {
            return Ok(None);
        }
        let offset = self.offset;
        self.offset += self.chunk_size;

        let sql = format!(
            "SELECT id, occurred_at, owner_id, measures FROM source_records \
             WHERE {WINDOW_PREDICATE} \
             ORDER BY occurred_at NULLS FIRST, id LIMIT $3 OFFSET $4"
        );
        // rolled back on drop if the page fails
        let mut page = Connection::begin(&mut *self.tx).await?;
        let rows = sqlx::query(&sql)
            .bind(self.window.start)
            .bind(self.window.end)
            .bind(self.chunk_size)
            .bind(offset)
            .fetch_all(&mut *page)
            .await?;
        page.commit().await?;
        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use tempfile::tempdir;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, day, 12, 0, 0).single().unwrap()
    }

    fn july_first_week() -> Window {
        Window::of_days(
            NaiveDate::from_ymd_opt(2024, 7, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 7, 7).unwrap(),
        )
        .unwrap()
    }

    fn record(id: &str, timestamp: Option<DateTime<Utc>>) -> SourceRecord {
        SourceRecord {
            id: RecordId::from(id),
            timestamp,
            owner: None,
            measures: BTreeMap::new(),
        }
    }

    async fn drain(cursor: &mut Box<dyn SourceCursor>) -> Vec<Vec<SourceRecord>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = cursor.next_chunk().await.expect("chunk") {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn memory_feed_chunks_window_in_scan_order() {
        let feed = MemorySourceFeed::new(vec![
            record("c", Some(ts(3))),
            record("a", Some(ts(1))),
            record("late", Some(ts(9))),
            record("undated", None),
            record("b", Some(ts(2))),
        ]);
        let mut cursor = feed.open(&july_first_week(), 2).await.unwrap();
        let chunks = drain(&mut cursor).await;

        let ids: Vec<Vec<&str>> = chunks
            .iter()
            .map(|c| c.iter().map(|r| r.id.0.as_str()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["undated", "a"], vec!["b", "c"]]);
    }

    #[tokio::test]
    async fn memory_cursor_is_pinned_at_open() {
        let feed = MemorySourceFeed::new(vec![record("a", Some(ts(1)))]);
        let mut cursor = feed.open(&july_first_week(), 10).await.unwrap();
        feed.push(record("b", Some(ts(2)))).await;

        let chunks = drain(&mut cursor).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 1);
        assert_eq!(feed.len().await, 2);
    }

    #[tokio::test]
    async fn malformed_jsonl_line_fails_only_its_chunk() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("orders.jsonl");
        std::fs::write(
            &path,
            [
                r#"{"id":"o1","timestamp":"2024-07-01T09:00:00Z","measures":{"amount":5}}"#,
                r#"{"id":"o2","timestamp":"2024-07-02T09:00:00Z","measures":{"amount":1}}"#,
                r#"{"id":"broken","timestamp":"#,
                r#"{"id":"o3","timestamp":"2024-07-02T10:00:00Z","measures":{"amount":2}}"#,
                r#"{"id":"o4","timestamp":"2024-07-03T09:00:00Z","measures":{"amount":7}}"#,
                r#"{"id":"o5","timestamp":"2024-08-03T09:00:00Z","measures":{"amount":7}}"#,
                "",
            ]
            .join("\n"),
        )
        .unwrap();

        let feed = JsonlSourceFeed::new(&path);
        let mut cursor = feed.open(&july_first_week(), 2).await.unwrap();

        let first = cursor.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        match cursor.next_chunk().await {
            Err(FetchError::Decode { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected decode failure, got {other:?}"),
        }
        let third = cursor.next_chunk().await.unwrap().unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].id.0, "o4");
        assert!(cursor.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn jsonl_cursor_reads_one_chunk_of_lines_at_a_time() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("orders.jsonl");
        let lines: Vec<String> = (1..=5)
            .map(|n| format!(r#"{{"id":"o{n}","timestamp":"2024-07-0{n}T09:00:00Z","measures":{{}}}}"#))
            .collect();
        std::fs::write(&path, lines.join("\n\n")).unwrap();

        let mut cursor = JsonlCursor {
            path: path.clone(),
            window: july_first_week(),
            chunk_size: 2,
            lines: BufReader::new(File::open(&path).await.unwrap()).lines(),
            line: 0,
        };
        let first = cursor.next_chunk().await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        // two records plus the blank line between them
        assert_eq!(cursor.line, 3);

        let rest = drain_cursor(&mut cursor).await;
        assert_eq!(rest.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(cursor.line, 9);
    }

    async fn drain_cursor(cursor: &mut JsonlCursor) -> Vec<Vec<SourceRecord>> {
        let mut chunks = Vec::new();
        while let Some(chunk) = cursor.next_chunk().await.expect("chunk") {
            chunks.push(chunk);
        }
        chunks
    }

    #[tokio::test]
    async fn missing_jsonl_file_is_an_io_error() {
        let feed = JsonlSourceFeed::new("/definitely/not/here.jsonl");
        let err = feed.open(&july_first_week(), 10).await.err().unwrap();
        assert!(matches!(err, FetchError::Io { .. }));
    }
}
