use crate::error::{PipelineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validity tag carried by every canonical record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Valid,
    NonNumeric,
    OutOfRange,
    OutsideWindow,
    DuplicateSuppressed,
}

/// Retrieval order of a record: which fetch produced it, and where it sat in
/// that payload. Lexicographic ordering gives "most recently fetched wins,
/// then latest position within the payload" for duplicate resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RetrievalSeq {
    pub fetch: u64,
    pub index: u32,
}

/// One observation in canonical units. Created by a manufacturer adapter from
/// one raw data point and never mutated afterwards; the validator builds new
/// records when it needs to re-mark validity.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub device_id: String,
    pub field_id: String,
    /// Timezone-aware instant, second resolution.
    pub timestamp: DateTime<Utc>,
    /// Value in canonical units (scale already applied). NaN when the raw
    /// cell could not be parsed as a number.
    pub value: f64,
    pub validity: Validity,
    pub retrieval_seq: RetrievalSeq,
}

/// Raw payload handed over by the fetch collaborator, with provenance.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub bytes: Vec<u8>,
    pub retrieved_at: DateTime<Utc>,
    /// Fetch-order number used for duplicate tie-breaking.
    pub retrieval_seq: u64,
    /// Hex sha256 digest of the payload bytes.
    pub sha256: String,
}

impl FetchedPayload {
    pub fn new(bytes: Vec<u8>, retrieval_seq: u64) -> Self {
        let sha256 = {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            hex::encode(hasher.finalize())
        };
        Self {
            bytes,
            retrieved_at: Utc::now(),
            retrieval_seq,
            sha256,
        }
    }
}

/// The half-open time range a pipeline run is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RunWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if start >= end {
            return Err(PipelineError::Config(format!(
                "run window start must be earlier than end ({start} - {end})"
            )));
        }
        Ok(Self { start, end })
    }

    /// Whether an instant falls inside the window ([start, end)).
    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t < self.end
    }
}

impl fmt::Display for RunWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format("%Y-%m-%d %H:%M:%S"),
            self.end.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

/// Fixed-interval timestamp grid covering a run window. Grid points are
/// exactly `start + k * interval` for `0 <= k < len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplingGrid {
    start: DateTime<Utc>,
    interval_secs: u32,
    len: usize,
}

impl SamplingGrid {
    pub fn new(window: &RunWindow, interval_secs: u32) -> Result<Self> {
        if interval_secs == 0 {
            return Err(PipelineError::Config(
                "resampling interval must be positive".to_string(),
            ));
        }
        let span = (window.end - window.start).num_seconds();
        let interval = i64::from(interval_secs);
        // ceil((end - start) / interval); the window is validated non-empty
        let len = (span + interval - 1) / interval;
        Ok(Self {
            start: window.start,
            interval_secs,
            len: len as usize,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn interval_secs(&self) -> u32 {
        self.interval_secs
    }

    /// Timestamp of grid point `k`. Caller must keep `k < len`.
    pub fn point(&self, k: usize) -> DateTime<Utc> {
        self.start + Duration::seconds(k as i64 * i64::from(self.interval_secs))
    }

    pub fn iter(&self) -> impl Iterator<Item = DateTime<Utc>> + '_ {
        (0..self.len).map(move |k| self.point(k))
    }
}

/// One (device, field) series after validation: strictly ascending by
/// timestamp, duplicates resolved, every record `Valid`. The resampler relies
/// on this ordering without re-sorting.
#[derive(Debug, Clone, PartialEq)]
pub struct CleanedSeries {
    pub device_id: String,
    pub field_id: String,
    pub records: Vec<CanonicalRecord>,
}

impl CleanedSeries {
    pub fn is_strictly_ascending(&self) -> bool {
        self.records
            .windows(2)
            .all(|pair| pair[0].timestamp < pair[1].timestamp)
    }
}

/// One (device, field) series re-expressed on a sampling grid. `None` is the
/// explicit no-data marker for an empty bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct ResampledSeries {
    pub device_id: String,
    pub field_id: String,
    pub grid: SamplingGrid,
    pub values: Vec<Option<f64>>,
}

/// How observations falling into one grid bucket are aggregated. All policies
/// are order-independent so repeated runs are reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AggregatePolicy {
    #[default]
    Mean,
    Min,
    Max,
}

impl fmt::Display for AggregatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AggregatePolicy::Mean => "mean",
            AggregatePolicy::Min => "min",
            AggregatePolicy::Max => "max",
        };
        write!(f, "{name}")
    }
}

/// Column label for a (field, device) pair, whitespace stripped so labels
/// survive CSV headers and shell pipelines. The config validator rejects
/// studies where stripping makes two labels collide.
pub fn column_label(field_id: &str, device_id: &str) -> String {
    format!("{field_id}_{device_id}").split_whitespace().collect()
}

/// One column of a wide table: the resampled values for a (device, field)
/// pair, labelled `<field>_<device>` with whitespace stripped.
#[derive(Debug, Clone, PartialEq)]
pub struct WideColumn {
    pub device_id: String,
    pub field_id: String,
    pub label: String,
    pub values: Vec<Option<f64>>,
}

/// Per-manufacturer analysis table: one row per grid point, one column per
/// (device, analysis field) pair. The column set depends only on the static
/// configuration, never on which devices reported.
#[derive(Debug, Clone, PartialEq)]
pub struct WideTable {
    pub manufacturer_id: String,
    pub index: Vec<DateTime<Utc>>,
    pub columns: Vec<WideColumn>,
}
