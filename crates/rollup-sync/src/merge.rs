//! In-run accumulator and the two reconciliations folded through it.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use rollup_core::{
    derive_bucket, BucketKey, BucketMode, DeriveError, OutputRecord, ReminderRecord,
    SnapshotRecord, SourceRecord,
};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: Uuid,
    pub job_id: String,
    pub now: DateTime<Utc>,
}

impl RunContext {
    pub fn new(job_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_id: job_id.into(),
            now,
        }
    }
}

/// What closing one slot produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Closed<O> {
    /// Nothing to persist for this key.
    Unchanged,
    /// An existing output already covers the key.
    Suppressed,
    Write(O),
}

/// How source records of one job map onto output records.
///
/// A slot is the per-key working state of a run. `fold` must be commutative
/// and associative over records so delivery order can't change the result.
pub trait Reconciliation: Send + Sync {
    type Output: OutputRecord + Serialize;
    type Slot: Send;

    fn mode(&self) -> BucketMode;

    fn derive_key(&self, record: &SourceRecord) -> Result<BucketKey, DeriveError> {
        derive_bucket(record, self.mode())
    }

    /// Starts the slot for `key` from the stored output, if there is one.
    fn open_slot(
        &self,
        key: &BucketKey,
        existing: Option<Self::Output>,
        first: &SourceRecord,
        ctx: &RunContext,
    ) -> Result<Self::Slot, DeriveError>;

    /// Returns `false` when the record was already accounted for.
    fn fold(&self, slot: &mut Self::Slot, record: &SourceRecord) -> bool;

    fn close(&self, key: &BucketKey, slot: Self::Slot, ctx: &RunContext) -> Closed<Self::Output>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FoldStats {
    pub records_scanned: usize,
    pub records_folded: usize,
    pub already_folded: usize,
    pub skipped_invalid_timestamp: usize,
    pub skipped_missing_owner: usize,
}

impl FoldStats {
    fn note_skip(&mut self, err: &DeriveError) {
        debug!(%err, "skipping record");
        match err {
            DeriveError::InvalidTimestamp { .. } => self.skipped_invalid_timestamp += 1,
            DeriveError::MissingOwner { .. } => self.skipped_missing_owner += 1,
        }
    }
}

/// Outputs of a finished accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct Closing<O> {
    pub writes: Vec<O>,
    pub unchanged: usize,
    pub suppressed: usize,
}

/// Run-scoped merge state: the outputs loaded once at the start of the run and
/// the slots opened so far. Threaded through every chunk, never reset.
pub struct Accumulator<R: Reconciliation> {
    existing: BTreeMap<BucketKey, R::Output>,
    slots: BTreeMap<BucketKey, R::Slot>,
    stats: FoldStats,
}

impl<R: Reconciliation> Accumulator<R> {
    pub fn new(existing: BTreeMap<BucketKey, R::Output>) -> Self {
        Self {
            existing,
            slots: BTreeMap::new(),
            stats: FoldStats::default(),
        }
    }

    pub fn stats(&self) -> &FoldStats {
        &self.stats
    }

    pub fn buckets_touched(&self) -> usize {
        self.slots.len()
    }

    pub fn fold_chunk(&mut self, reconciliation: &R, chunk: &[SourceRecord], ctx: &RunContext) {
        for record in chunk {
            self.stats.records_scanned += 1;
            let key = match reconciliation.derive_key(record) {
                Ok(key) => key,
                Err(err) => {
                    self.stats.note_skip(&err);
                    continue;
                }
            };

            if !self.slots.contains_key(&key) {
                let existing = self.existing.remove(&key);
                match reconciliation.open_slot(&key, existing, record, ctx) {
                    Ok(slot) => {
                        self.slots.insert(key.clone(), slot);
                    }
                    Err(err) => {
                        self.stats.note_skip(&err);
                        continue;
                    }
                }
            }

            if let Some(slot) = self.slots.get_mut(&key) {
                if reconciliation.fold(slot, record) {
                    self.stats.records_folded += 1;
                } else {
                    self.stats.already_folded += 1;
                }
            }
        }
    }

    /// Consumes the accumulator. Only outputs that differ from what was loaded
    /// are returned for writing.
    pub fn close(self, reconciliation: &R, ctx: &RunContext) -> Closing<R::Output> {
        let mut closing = Closing {
            writes: Vec::new(),
            unchanged: 0,
            suppressed: 0,
        };
        for (key, slot) in self.slots {
            match reconciliation.close(&key, slot, ctx) {
                Closed::Write(output) => closing.writes.push(output),
                Closed::Unchanged => closing.unchanged += 1,
                Closed::Suppressed => closing.suppressed += 1,
            }
        }
        closing
    }
}

/// Sums measures per time bucket into [`SnapshotRecord`]s.
#[derive(Debug, Clone)]
pub struct Rollup {
    mode: BucketMode,
    measures: Vec<String>,
}

impl Rollup {
    pub fn weekly(measures: Vec<String>) -> Self {
        Self {
            mode: BucketMode::Weekly,
            measures,
        }
    }

    pub fn monthly(measures: Vec<String>) -> Self {
        Self {
            mode: BucketMode::Monthly,
            measures,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RollupSlot {
    base: Option<SnapshotRecord>,
    working: SnapshotRecord,
}

impl Reconciliation for Rollup {
    type Output = SnapshotRecord;
    type Slot = RollupSlot;

    fn mode(&self) -> BucketMode {
        self.mode
    }

    fn open_slot(
        &self,
        key: &BucketKey,
        existing: Option<SnapshotRecord>,
        first: &SourceRecord,
        ctx: &RunContext,
    ) -> Result<RollupSlot, DeriveError> {
        if let Some(stored) = existing {
            return Ok(RollupSlot {
                base: Some(stored.clone()),
                working: stored,
            });
        }
        let working = SnapshotRecord::fresh(key.clone(), &self.measures, ctx.now).ok_or_else(|| {
            DeriveError::InvalidTimestamp {
                record: first.id.clone(),
            }
        })?;
        Ok(RollupSlot {
            base: None,
            working,
        })
    }

    fn fold(&self, slot: &mut RollupSlot, record: &SourceRecord) -> bool {
        slot.working.fold(record, &self.measures)
    }

    fn close(&self, _key: &BucketKey, slot: RollupSlot, ctx: &RunContext) -> Closed<SnapshotRecord> {
        if slot.base.as_ref() == Some(&slot.working) {
            return Closed::Unchanged;
        }
        let mut working = slot.working;
        working.updated_at = ctx.now;
        Closed::Write(working)
    }
}

/// Raises one reminder per owner whose latest activity is older than
/// `stale_after`, unless the owner already has an open one.
#[derive(Debug, Clone)]
pub struct StalenessCheck {
    stale_after: Duration,
}

impl StalenessCheck {
    pub fn new(stale_after: Duration) -> Self {
        Self { stale_after }
    }

    pub fn days(days: u32) -> Self {
        Self::new(Duration::days(i64::from(days)))
    }
}

#[derive(Debug, Clone)]
pub struct StalenessSlot {
    open: Option<ReminderRecord>,
    latest_activity: Option<DateTime<Utc>>,
}

impl Reconciliation for StalenessCheck {
    type Output = ReminderRecord;
    type Slot = StalenessSlot;

    fn mode(&self) -> BucketMode {
        BucketMode::PerEntity
    }

    fn derive_key(&self, record: &SourceRecord) -> Result<BucketKey, DeriveError> {
        if record.timestamp.is_none() {
            return Err(DeriveError::InvalidTimestamp {
                record: record.id.clone(),
            });
        }
        derive_bucket(record, BucketMode::PerEntity)
    }

    fn open_slot(
        &self,
        _key: &BucketKey,
        existing: Option<ReminderRecord>,
        _first: &SourceRecord,
        _ctx: &RunContext,
    ) -> Result<StalenessSlot, DeriveError> {
        Ok(StalenessSlot {
            open: existing,
            latest_activity: None,
        })
    }

    fn fold(&self, slot: &mut StalenessSlot, record: &SourceRecord) -> bool {
        slot.latest_activity = slot.latest_activity.max(record.timestamp);
        true
    }

    fn close(&self, key: &BucketKey, slot: StalenessSlot, ctx: &RunContext) -> Closed<ReminderRecord> {
        if slot.open.is_some() {
            return Closed::Suppressed;
        }
        let (BucketKey::Entity(owner), Some(latest)) = (key, slot.latest_activity) else {
            return Closed::Unchanged;
        };
        // a cutoff before the representable range means nothing is stale yet
        match ctx.now.checked_sub_signed(self.stale_after) {
            Some(cutoff) if latest <= cutoff => {}
            _ => return Closed::Unchanged,
        }
        Closed::Write(ReminderRecord::open(
            owner.clone(),
            ctx.job_id.clone(),
            latest,
            ctx.now,
        ))
    }
}
