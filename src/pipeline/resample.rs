use crate::types::{AggregatePolicy, CleanedSeries, ResampledSeries, SamplingGrid};
use chrono::Duration;

struct Aggregator {
    policy: AggregatePolicy,
    sum: f64,
    count: usize,
    extreme: f64,
}

impl Aggregator {
    fn new(policy: AggregatePolicy) -> Self {
        Self {
            policy,
            sum: 0.0,
            count: 0,
            extreme: 0.0,
        }
    }

    fn add(&mut self, value: f64) {
        self.sum += value;
        self.extreme = if self.count == 0 {
            value
        } else {
            match self.policy {
                AggregatePolicy::Min => self.extreme.min(value),
                AggregatePolicy::Max => self.extreme.max(value),
                AggregatePolicy::Mean => self.extreme,
            }
        };
        self.count += 1;
    }

    /// `None` when the bucket saw no observations.
    fn finish(self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        Some(match self.policy {
            AggregatePolicy::Mean => self.sum / self.count as f64,
            AggregatePolicy::Min | AggregatePolicy::Max => self.extreme,
        })
    }
}

/// Re-express one cleaned series on the sampling grid. Each grid point `t_k`
/// aggregates the observations in `[t_k, t_k + interval)`; an empty bucket
/// yields `None`. Single forward pass over the sorted records.
pub fn resample(
    series: &CleanedSeries,
    grid: &SamplingGrid,
    policy: AggregatePolicy,
) -> ResampledSeries {
    debug_assert!(
        series.is_strictly_ascending(),
        "resample input must be strictly ascending by timestamp"
    );

    let interval = Duration::seconds(i64::from(grid.interval_secs()));
    let records = &series.records;
    let mut cursor = 0usize;
    let mut values = Vec::with_capacity(grid.len());
    for k in 0..grid.len() {
        let lo = grid.point(k);
        let hi = lo + interval;
        // anything before this bucket belongs to no later bucket either
        while cursor < records.len() && records[cursor].timestamp < lo {
            cursor += 1;
        }
        let mut bucket = Aggregator::new(policy);
        while cursor < records.len() && records[cursor].timestamp < hi {
            bucket.add(records[cursor].value);
            cursor += 1;
        }
        values.push(bucket.finish());
    }

    ResampledSeries {
        device_id: series.device_id.clone(),
        field_id: series.field_id.clone(),
        grid: grid.clone(),
        values,
    }
}
