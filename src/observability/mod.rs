//! Metrics for the scraper pipeline.
//!
//! Prometheus-convention metric names live in one enum so stage code never
//! spells out magic strings. Stage modules wrap the `metrics` macros with
//! small helpers; recording is a no-op until `init()` installs the recorder.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::fmt;
use std::sync::OnceLock;
use tracing::info;

/// Every metric the pipeline emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricName {
    // Fetch stage
    FetchSuccess,
    FetchError,
    FetchDuration,
    FetchPayloadBytes,

    // Adapter stage
    AdapterRecords,
    AdapterParseErrors,
    AdapterWarnings,

    // Validation stage
    ValidateRecordsValid,
    ValidateRecordsRejected,

    // Resample stage
    ResampleBucketsFilled,
    ResampleBucketsEmpty,

    // Pivot stage
    PivotTables,
    PivotColumns,

    // Whole run
    RunDuration,
    RunDevicesFailed,
}

impl MetricName {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricName::FetchSuccess => "aq_fetch_success_total",
            MetricName::FetchError => "aq_fetch_error_total",
            MetricName::FetchDuration => "aq_fetch_duration_seconds",
            MetricName::FetchPayloadBytes => "aq_fetch_payload_bytes",

            MetricName::AdapterRecords => "aq_adapter_records_total",
            MetricName::AdapterParseErrors => "aq_adapter_parse_errors_total",
            MetricName::AdapterWarnings => "aq_adapter_warnings_total",

            MetricName::ValidateRecordsValid => "aq_validate_records_valid_total",
            MetricName::ValidateRecordsRejected => "aq_validate_records_rejected_total",

            MetricName::ResampleBucketsFilled => "aq_resample_buckets_filled_total",
            MetricName::ResampleBucketsEmpty => "aq_resample_buckets_empty_total",

            MetricName::PivotTables => "aq_pivot_tables_total",
            MetricName::PivotColumns => "aq_pivot_columns_total",

            MetricName::RunDuration => "aq_run_duration_seconds",
            MetricName::RunDevicesFailed => "aq_run_devices_failed_total",
        }
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Call once at startup; recording stays a
/// no-op if this is never called.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))?;
    PROMETHEUS_HANDLE.set(handle).ok();
    info!("Metrics recorder installed");
    Ok(())
}

/// Render the current scrape text, when the recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

pub mod fetch {
    use super::MetricName;

    pub fn success(manufacturer: &str) {
        ::metrics::counter!(
            MetricName::FetchSuccess.as_str(),
            "manufacturer" => manufacturer.to_string()
        )
        .increment(1);
    }

    pub fn error(manufacturer: &str) {
        ::metrics::counter!(
            MetricName::FetchError.as_str(),
            "manufacturer" => manufacturer.to_string()
        )
        .increment(1);
    }

    pub fn duration_seconds(seconds: f64) {
        ::metrics::histogram!(MetricName::FetchDuration.as_str()).record(seconds);
    }

    pub fn payload_bytes(bytes: usize) {
        ::metrics::histogram!(MetricName::FetchPayloadBytes.as_str()).record(bytes as f64);
    }
}

pub mod adapter {
    use super::MetricName;

    pub fn records(manufacturer: &str, count: usize) {
        ::metrics::counter!(
            MetricName::AdapterRecords.as_str(),
            "manufacturer" => manufacturer.to_string()
        )
        .increment(count as u64);
    }

    pub fn parse_error(manufacturer: &str) {
        ::metrics::counter!(
            MetricName::AdapterParseErrors.as_str(),
            "manufacturer" => manufacturer.to_string()
        )
        .increment(1);
    }

    pub fn warnings(manufacturer: &str, count: usize) {
        if count == 0 {
            return;
        }
        ::metrics::counter!(
            MetricName::AdapterWarnings.as_str(),
            "manufacturer" => manufacturer.to_string()
        )
        .increment(count as u64);
    }
}

pub mod validate {
    use super::MetricName;

    pub fn valid(count: usize) {
        ::metrics::counter!(MetricName::ValidateRecordsValid.as_str()).increment(count as u64);
    }

    /// `reason` is one of non_numeric, out_of_range, outside_window,
    /// duplicate.
    pub fn rejected(reason: &'static str, count: usize) {
        if count == 0 {
            return;
        }
        ::metrics::counter!(
            MetricName::ValidateRecordsRejected.as_str(),
            "reason" => reason
        )
        .increment(count as u64);
    }
}

pub mod resample {
    use super::MetricName;

    pub fn buckets(filled: usize, empty: usize) {
        ::metrics::counter!(MetricName::ResampleBucketsFilled.as_str()).increment(filled as u64);
        ::metrics::counter!(MetricName::ResampleBucketsEmpty.as_str()).increment(empty as u64);
    }
}

pub mod pivot {
    use super::MetricName;

    pub fn table_written(columns: usize) {
        ::metrics::counter!(MetricName::PivotTables.as_str()).increment(1);
        ::metrics::counter!(MetricName::PivotColumns.as_str()).increment(columns as u64);
    }
}

pub mod run {
    use super::MetricName;

    pub fn duration_seconds(seconds: f64) {
        ::metrics::histogram!(MetricName::RunDuration.as_str()).record(seconds);
    }

    pub fn devices_failed(count: usize) {
        if count == 0 {
            return;
        }
        ::metrics::counter!(MetricName::RunDevicesFailed.as_str()).increment(count as u64);
    }
}
