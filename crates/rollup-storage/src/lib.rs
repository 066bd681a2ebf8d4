//! Output stores for snapshot and reminder records: the existing-output loader
//! and the idempotent writer, with in-memory, JSON file and Postgres backends.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rollup_core::{BucketKey, LoadScope, OutputRecord};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

mod postgres;

pub use postgres::PgStore;

pub const CRATE_NAME: &str = "rollup-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding store contents: {0}")]
    Encode(#[source] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("bucket {bucket} already has a stored record")]
    Conflict { bucket: BucketKey },
    #[error("no stored record with id {id}")]
    UnknownIdentity { id: Uuid },
    #[error("record {id} is stored under {stored}, not {incoming}")]
    IdentityMismatch {
        id: Uuid,
        stored: BucketKey,
        incoming: BucketKey,
    },
    #[error("malformed stored row: {0}")]
    Corrupt(String),
}

/// Result of a successful bulk save; `records` carry their persisted ids.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome<O> {
    pub inserted: usize,
    pub updated: usize,
    pub records: Vec<O>,
}

impl<O> Default for WriteOutcome<O> {
    fn default() -> Self {
        Self {
            inserted: 0,
            updated: 0,
            records: Vec::new(),
        }
    }
}

/// Persistence layer for one output record type.
///
/// `save_all` is all-or-nothing: either every record of the batch is applied
/// or none is.
#[async_trait]
pub trait OutputStore<O: OutputRecord>: Send + Sync {
    /// Stored records the run may touch, keyed by bucket. Keys with no stored
    /// record are absent.
    async fn load_existing(&self, scope: &LoadScope) -> Result<BTreeMap<BucketKey, O>, StoreError>;

    /// Records with an id update in place, records without one are inserted.
    /// Inserting into an occupied key fails with [`StoreError::Conflict`].
    async fn save_all(&self, records: Vec<O>) -> Result<WriteOutcome<O>, StoreError>;

    async fn list_all(&self) -> Result<Vec<O>, StoreError>;
}

/// Rows of one record type plus the validation shared by the in-process
/// backends.
#[derive(Debug, Clone)]
pub struct Table<O> {
    rows: BTreeMap<Uuid, O>,
}

impl<O> Default for Table<O> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
        }
    }
}

impl<O: OutputRecord> Table<O> {
    pub fn from_rows(rows: Vec<O>) -> Result<Self, StoreError> {
        let mut table = Self::default();
        for row in rows {
            let id = row
                .id()
                .ok_or_else(|| StoreError::Corrupt(format!("stored row for {} has no id", row.key())))?;
            table.rows.insert(id, row);
        }
        Ok(table)
    }

    pub fn rows(&self) -> impl Iterator<Item = &O> {
        self.rows.values()
    }

    pub fn load(&self, scope: &LoadScope) -> BTreeMap<BucketKey, O> {
        self.rows
            .values()
            .filter(|row| row.occupies_key() && row.in_load_scope(scope))
            .map(|row| (row.key(), row.clone()))
            .collect()
    }

    /// Applies the batch to a copy and swaps it in only if every record passes.
    pub fn apply(&mut self, batch: Vec<O>) -> Result<WriteOutcome<O>, StoreError> {
        let mut next = self.rows.clone();
        let mut occupied: BTreeMap<BucketKey, Uuid> = next
            .iter()
            .filter(|(_, row)| row.occupies_key())
            .map(|(id, row)| (row.key(), *id))
            .collect();
        let mut outcome = WriteOutcome::default();

        for mut record in batch {
            let key = record.key();
            match record.id() {
                Some(id) => {
                    let stored = next.get(&id).ok_or(StoreError::UnknownIdentity { id })?;
                    let stored_key = stored.key();
                    if stored_key != key {
                        return Err(StoreError::IdentityMismatch {
                            id,
                            stored: stored_key,
                            incoming: key,
                        });
                    }
                    if stored.occupies_key() {
                        occupied.remove(&stored_key);
                    }
                    if record.occupies_key() {
                        if occupied.contains_key(&key) {
                            return Err(StoreError::Conflict { bucket: key });
                        }
                        occupied.insert(key, id);
                    }
                    next.insert(id, record.clone());
                    outcome.updated += 1;
                }
                None => {
                    if record.occupies_key() && occupied.contains_key(&key) {
                        return Err(StoreError::Conflict { bucket: key });
                    }
                    let id = Uuid::new_v4();
                    record.assign_id(id);
                    if record.occupies_key() {
                        occupied.insert(key, id);
                    }
                    next.insert(id, record.clone());
                    outcome.inserted += 1;
                }
            }
            outcome.records.push(record);
        }

        self.rows = next;
        Ok(outcome)
    }
}

/// Process-local store, used by tests and embedders.
#[derive(Debug)]
pub struct MemoryStore<O> {
    table: Mutex<Table<O>>,
}

impl<O> Default for MemoryStore<O> {
    fn default() -> Self {
        Self {
            table: Mutex::new(Table::default()),
        }
    }
}

impl<O: OutputRecord> MemoryStore<O> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<O: OutputRecord> OutputStore<O> for MemoryStore<O> {
    async fn load_existing(&self, scope: &LoadScope) -> Result<BTreeMap<BucketKey, O>, StoreError> {
        Ok(self.table.lock().await.load(scope))
    }

    async fn save_all(&self, records: Vec<O>) -> Result<WriteOutcome<O>, StoreError> {
        self.table.lock().await.apply(records)
    }

    async fn list_all(&self) -> Result<Vec<O>, StoreError> {
        Ok(self.table.lock().await.rows().cloned().collect())
    }
}

/// Whole-table JSON file, replaced through a temp file and an atomic rename
/// on every save.
#[derive(Debug)]
pub struct FileStore<O> {
    path: PathBuf,
    lock: Mutex<()>,
    _records: PhantomData<fn() -> O>,
}

impl<O> FileStore<O>
where
    O: OutputRecord + Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            _records: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_table(&self) -> Result<Table<O>, StoreError> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Table::default()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let rows: Vec<O> = serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
            path: self.path.clone(),
            source,
        })?;
        Table::from_rows(rows)
    }
}

#[async_trait]
impl<O> OutputStore<O> for FileStore<O>
where
    O: OutputRecord + Serialize + DeserializeOwned,
{
    async fn load_existing(&self, scope: &LoadScope) -> Result<BTreeMap<BucketKey, O>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_table().await?.load(scope))
    }

    async fn save_all(&self, records: Vec<O>) -> Result<WriteOutcome<O>, StoreError> {
        let _guard = self.lock.lock().await;
        let mut table = self.read_table().await?;
        let outcome = table.apply(records)?;
        let rows: Vec<&O> = table.rows().collect();
        let bytes = serde_json::to_vec_pretty(&rows).map_err(StoreError::Encode)?;
        write_atomically(&self.path, &bytes).await?;
        debug!(
            path = %self.path.display(),
            inserted = outcome.inserted,
            updated = outcome.updated,
            "file store saved"
        );
        Ok(outcome)
    }

    async fn list_all(&self) -> Result<Vec<O>, StoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.read_table().await?.rows().cloned().collect())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(io_error(&parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_error(&temp_path))?;
    file.write_all(bytes).await.map_err(io_error(&temp_path))?;
    file.flush().await.map_err(io_error(&temp_path))?;
    file.sync_all().await.map_err(io_error(&temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}
