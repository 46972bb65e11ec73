use crate::config::FieldConfig;
use crate::types::{CanonicalRecord, CleanedSeries, RunWindow, Validity};
use serde::{Deserialize, Serialize};

/// Records rejected by the validator, by reason. Rejections are counted,
/// never raised as errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionCounts {
    pub non_numeric: usize,
    pub out_of_range: usize,
    pub outside_window: usize,
    pub duplicate: usize,
}

impl RejectionCounts {
    pub fn total(&self) -> usize {
        self.non_numeric + self.out_of_range + self.outside_window + self.duplicate
    }

    pub fn merge(&mut self, other: &RejectionCounts) {
        self.non_numeric += other.non_numeric;
        self.out_of_range += other.out_of_range;
        self.outside_window += other.outside_window;
        self.duplicate += other.duplicate;
    }
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub series: CleanedSeries,
    pub counts: RejectionCounts,
}

/// Clean one (device, field) record batch: drop non-numeric, out-of-range
/// and outside-window records, then resolve exact-timestamp duplicates by
/// keeping the record with the greatest retrieval sequence. The result is
/// strictly ascending by timestamp whatever order the records arrived in.
pub fn clean_series(
    device_id: &str,
    field: &FieldConfig,
    records: Vec<CanonicalRecord>,
    window: &RunWindow,
) -> ValidationOutcome {
    let mut counts = RejectionCounts::default();
    let mut survivors: Vec<CanonicalRecord> = Vec::with_capacity(records.len());
    for record in records {
        if record.validity != Validity::Valid || !record.value.is_finite() {
            counts.non_numeric += 1;
            continue;
        }
        if !field.range.contains(record.value) {
            counts.out_of_range += 1;
            continue;
        }
        if !window.contains(record.timestamp) {
            counts.outside_window += 1;
            continue;
        }
        survivors.push(record);
    }

    survivors.sort_by(|a, b| {
        (a.timestamp, a.retrieval_seq).cmp(&(b.timestamp, b.retrieval_seq))
    });

    // after the sort, the last record of an equal-timestamp run wins
    let mut kept: Vec<CanonicalRecord> = Vec::with_capacity(survivors.len());
    for record in survivors {
        if kept
            .last()
            .map_or(false, |last| last.timestamp == record.timestamp)
        {
            counts.duplicate += 1;
            let last = kept.len() - 1;
            kept[last] = record;
        } else {
            kept.push(record);
        }
    }

    ValidationOutcome {
        series: CleanedSeries {
            device_id: device_id.to_string(),
            field_id: field.field_id.to_string(),
            records: kept,
        },
        counts,
    }
}
