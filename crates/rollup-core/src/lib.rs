//! Core domain model for the rollup reconciler: source records, bucket keys,
//! scan windows and the output records the engine owns.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rollup-core";

/// Identity of a source record as assigned by the upstream store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

/// Identity of the entity a source record belongs to (account, customer, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub String);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<&str> for OwnerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Transactional record read from the source feed. Never mutated by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: RecordId,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner: Option<OwnerId>,
    #[serde(default)]
    pub measures: BTreeMap<String, Option<Decimal>>,
}

impl SourceRecord {
    /// Null-safe measure lookup: a missing or null measure reads as zero.
    pub fn measure(&self, name: &str) -> Decimal {
        self.measures
            .get(name)
            .copied()
            .flatten()
            .unwrap_or(Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketMode {
    Weekly,
    Monthly,
    PerEntity,
}

/// Natural key of an output record.
///
/// Structural equality is the identity; the text form (`2024-07-w1`,
/// `2024-07`, `entity:acme`) is only used as a storage column and always
/// parses back to the same value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum BucketKey {
    Week { year: i32, month: u32, week: u32 },
    Month { year: i32, month: u32 },
    Entity(OwnerId),
}

impl BucketKey {
    /// Inclusive first and last day of a time bucket. Week buckets are clipped
    /// to their month. `None` for entity keys and for weeks a month doesn't have.
    pub fn period(&self) -> Option<(NaiveDate, NaiveDate)> {
        match self {
            Self::Month { year, month } => {
                let first = NaiveDate::from_ymd_opt(*year, *month, 1)?;
                Some((first, last_day_of_month(first)?))
            }
            Self::Week { year, month, week } => {
                let first = NaiveDate::from_ymd_opt(*year, *month, 1)?;
                let last = last_day_of_month(first)?;
                let offset = u64::from(first.weekday().num_days_from_monday());
                let week = u64::from(*week);
                if week == 0 {
                    return None;
                }
                let start = if week == 1 {
                    first
                } else {
                    first.checked_add_days(Days::new(7 * (week - 1) - offset))?
                };
                let end = first.checked_add_days(Days::new(7 * week - offset - 1))?;
                if start > last {
                    return None;
                }
                Some((start, end.min(last)))
            }
            Self::Entity(_) => None,
        }
    }

    pub fn mode(&self) -> BucketMode {
        match self {
            Self::Week { .. } => BucketMode::Weekly,
            Self::Month { .. } => BucketMode::Monthly,
            Self::Entity(_) => BucketMode::PerEntity,
        }
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Week { year, month, week } => write!(f, "{year:04}-{month:02}-w{week}"),
            Self::Month { year, month } => write!(f, "{year:04}-{month:02}"),
            Self::Entity(owner) => write!(f, "entity:{owner}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid bucket key `{0}`")]
pub struct KeyParseError(pub String);

impl FromStr for BucketKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || KeyParseError(s.to_string());

        if let Some(owner) = s.strip_prefix("entity:") {
            if owner.is_empty() {
                return Err(invalid());
            }
            return Ok(Self::Entity(OwnerId(owner.to_string())));
        }

        // only the exact text `Display` writes is accepted
        let mut parts = s.split('-');
        let year: i32 = parts
            .next()
            .filter(|p| is_digits(p) && p.len() >= 4 && (p.len() == 4 || !p.starts_with('0')))
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let month: u32 = parts
            .next()
            .filter(|p| is_digits(p) && p.len() == 2)
            .and_then(|p| p.parse().ok())
            .filter(|m| (1..=12).contains(m))
            .ok_or_else(invalid)?;
        let key = match parts.next() {
            None => Self::Month { year, month },
            Some(fine) => {
                let week: u32 = fine
                    .strip_prefix('w')
                    .filter(|w| is_digits(w) && w.len() == 1)
                    .and_then(|w| w.parse().ok())
                    .filter(|w| (1..=6).contains(w))
                    .ok_or_else(invalid)?;
                Self::Week { year, month, week }
            }
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(key)
    }
}

fn is_digits(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}

impl From<BucketKey> for String {
    fn from(value: BucketKey) -> Self {
        value.to_string()
    }
}

impl TryFrom<String> for BucketKey {
    type Error = KeyParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeriveError {
    #[error("record {record} has no timestamp")]
    InvalidTimestamp { record: RecordId },
    #[error("record {record} has no owning entity")]
    MissingOwner { record: RecordId },
}

/// Week index within the date's own month, Monday-start weeks, week 1
/// starting on the 1st whatever weekday that is.
///
/// Computed as the distance between the ISO week of `date` and the ISO week of
/// the month's first day. Both are first re-expressed on a scale continuous
/// across the calendar year so a year boundary falling between them can't make
/// the difference negative or wrap.
pub fn week_of_month(date: NaiveDate) -> u32 {
    let first = first_day_of_month(date);
    let year = date.year();
    let week = continuous_iso_week(date, year) - continuous_iso_week(first, year) + 1;
    debug_assert!((1..=6).contains(&week), "week {week} for {date}");
    u32::try_from(week).unwrap_or(1)
}

fn continuous_iso_week(date: NaiveDate, year: i32) -> i64 {
    let iso = date.iso_week();
    match iso.year().cmp(&year) {
        Ordering::Equal => i64::from(iso.week()),
        // first days of January still sitting in the previous ISO year's last week
        Ordering::Less => 0,
        // last days of December already counted as week 1 of the next ISO year
        Ordering::Greater => i64::from(iso_weeks_in_year(year)) + i64::from(iso.week()),
    }
}

fn iso_weeks_in_year(year: i32) -> u32 {
    // Dec 28 always falls in the last ISO week of its year.
    NaiveDate::from_ymd_opt(year, 12, 28)
        .map(|d| d.iso_week().week())
        .unwrap_or(52)
}

fn first_day_of_month(date: NaiveDate) -> NaiveDate {
    date - Days::new(u64::from(date.day0()))
}

fn last_day_of_month(first: NaiveDate) -> Option<NaiveDate> {
    first.checked_add_months(Months::new(1))?.pred_opt()
}

/// Bucket of a calendar date for the time-based modes.
pub fn bucket_for_date(date: NaiveDate, mode: BucketMode) -> Option<BucketKey> {
    match mode {
        BucketMode::Weekly => Some(BucketKey::Week {
            year: date.year(),
            month: date.month(),
            week: week_of_month(date),
        }),
        BucketMode::Monthly => Some(BucketKey::Month {
            year: date.year(),
            month: date.month(),
        }),
        BucketMode::PerEntity => None,
    }
}

/// Bucket a source record falls into. Pure function of the record's
/// timestamp (time modes) or owner (entity mode).
pub fn derive_bucket(record: &SourceRecord, mode: BucketMode) -> Result<BucketKey, DeriveError> {
    match mode {
        BucketMode::PerEntity => record
            .owner
            .clone()
            .map(BucketKey::Entity)
            .ok_or_else(|| DeriveError::MissingOwner {
                record: record.id.clone(),
            }),
        BucketMode::Weekly | BucketMode::Monthly => {
            let ts = record.timestamp.ok_or_else(|| DeriveError::InvalidTimestamp {
                record: record.id.clone(),
            })?;
            bucket_for_date(ts.date_naive(), mode).ok_or_else(|| DeriveError::InvalidTimestamp {
                record: record.id.clone(),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("window start {start} is not before end {end}")]
pub struct WindowError {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Half-open scan range `[start, end)` of source record timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Window {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, WindowError> {
        if start >= end {
            return Err(WindowError { start, end });
        }
        Ok(Self { start, end })
    }

    /// Whole days `first..=last`.
    pub fn of_days(first: NaiveDate, last: NaiveDate) -> Result<Self, WindowError> {
        let start = first.and_time(NaiveTime::MIN).and_utc();
        let end = last
            .succ_opt()
            .unwrap_or(last)
            .and_time(NaiveTime::MIN)
            .and_utc();
        Self::new(start, end)
    }

    /// Window covering exactly one time bucket.
    pub fn of_bucket(key: &BucketKey) -> Option<Self> {
        let (first, last) = key.period()?;
        Self::of_days(first, last).ok()
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }

    /// Every calendar month the window touches; the loader over-fetches by
    /// this scope instead of computing the exact set of buckets.
    pub fn load_scope(&self) -> LoadScope {
        let first = first_day_of_month(self.start.date_naive());
        let last_instant = self.end - chrono::Duration::nanoseconds(1);
        let last_first = first_day_of_month(last_instant.date_naive());
        let to = last_day_of_month(last_first).unwrap_or(last_first);
        LoadScope { from: first, to }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadScope {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl LoadScope {
    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        start <= self.to && end >= self.from
    }
}

/// Record type the engine persists. Implemented by snapshots and reminders so
/// the loader and writer can stay generic.
pub trait OutputRecord: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    fn key(&self) -> BucketKey;
    /// Persisted identity; `None` until the first successful write.
    fn id(&self) -> Option<Uuid>;
    fn assign_id(&mut self, id: Uuid);
    /// Whether this record holds its key. At most one occupying record may
    /// exist per key.
    fn occupies_key(&self) -> bool {
        true
    }
    /// Whether the loader should hand this record to a run scoped by `scope`.
    fn in_load_scope(&self, scope: &LoadScope) -> bool;
    /// Number of source ids this record remembers as already folded.
    fn ledger_len(&self) -> usize {
        0
    }
}

/// Aggregated totals for one time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub id: Option<Uuid>,
    pub bucket: BucketKey,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub totals: BTreeMap<String, Decimal>,
    pub source_count: u64,
    /// Source records already folded into the totals.
    #[serde(default)]
    pub folded: BTreeSet<RecordId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SnapshotRecord {
    /// Fresh, unpersisted snapshot with every tracked measure at zero.
    /// `None` when the key is not a time bucket.
    pub fn fresh(bucket: BucketKey, measures: &[String], now: DateTime<Utc>) -> Option<Self> {
        let (period_start, period_end) = bucket.period()?;
        Some(Self {
            id: None,
            bucket,
            period_start,
            period_end,
            totals: measures
                .iter()
                .map(|name| (name.clone(), Decimal::ZERO))
                .collect(),
            source_count: 0,
            folded: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn total(&self, measure: &str) -> Decimal {
        self.totals.get(measure).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn has_folded(&self, record: &RecordId) -> bool {
        self.folded.contains(record)
    }

    /// Adds the record's measures into the totals. With an empty `measures`
    /// list every measure the record carries is summed. Returns `false` and
    /// leaves the snapshot untouched if the record was folded before.
    pub fn fold(&mut self, record: &SourceRecord, measures: &[String]) -> bool {
        if !self.folded.insert(record.id.clone()) {
            return false;
        }
        if measures.is_empty() {
            for name in record.measures.keys() {
                *self.totals.entry(name.clone()).or_default() += record.measure(name);
            }
        } else {
            for name in measures {
                *self.totals.entry(name.clone()).or_default() += record.measure(name);
            }
        }
        self.source_count += 1;
        true
    }
}

impl OutputRecord for SnapshotRecord {
    fn key(&self) -> BucketKey {
        self.bucket.clone()
    }

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn assign_id(&mut self, id: Uuid) {
        self.id = Some(id);
    }

    fn in_load_scope(&self, scope: &LoadScope) -> bool {
        scope.overlaps(self.period_start, self.period_end)
    }

    fn ledger_len(&self) -> usize {
        self.folded.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Open,
    Closed,
}

impl ReminderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl FromStr for ReminderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            other => Err(format!("unknown reminder status `{other}`")),
        }
    }
}

/// Follow-up reminder for an owner whose activity went stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderRecord {
    pub id: Option<Uuid>,
    pub owner: OwnerId,
    pub job_id: String,
    pub status: ReminderStatus,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ReminderRecord {
    pub fn open(
        owner: OwnerId,
        job_id: impl Into<String>,
        last_activity_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            owner,
            job_id: job_id.into(),
            status: ReminderStatus::Open,
            last_activity_at,
            created_at: now,
            closed_at: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == ReminderStatus::Open
    }

    pub fn close(&mut self, at: DateTime<Utc>) {
        self.status = ReminderStatus::Closed;
        self.closed_at = Some(at);
    }
}

impl OutputRecord for ReminderRecord {
    fn key(&self) -> BucketKey {
        BucketKey::Entity(self.owner.clone())
    }

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn assign_id(&mut self, id: Uuid) {
        self.id = Some(id);
    }

    fn occupies_key(&self) -> bool {
        self.is_open()
    }

    // Open reminders are few; every run sees all of them.
    fn in_load_scope(&self, _scope: &LoadScope) -> bool {
        self.is_open()
    }
}
