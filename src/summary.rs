use crate::adapters::ParseWarnings;
use crate::config::DeviceConfig;
use crate::pipeline::validate::RejectionCounts;
use crate::types::{AggregatePolicy, RunWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

const ASCII_COLUMN_WIDTH: usize = 13;
const ASCII_MAX_SCREEN_WIDTH: usize = 100;

/// Stages a device pipeline passes through. `Failed` is terminal and
/// reachable from any stage boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    Pending,
    Fetched,
    Parsed,
    Cleaned,
    Resampled,
    Done,
    Failed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Pending => "pending",
            DeviceState::Fetched => "fetched",
            DeviceState::Parsed => "parsed",
            DeviceState::Cleaned => "cleaned",
            DeviceState::Resampled => "resampled",
            DeviceState::Done => "done",
            DeviceState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Everything worth reporting about one device's run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub device_id: String,
    pub location: String,
    pub state: DeviceState,
    /// Records the adapter produced.
    pub total_records: usize,
    /// Records that survived validation.
    pub valid_records: usize,
    /// Grid buckets holding data after resampling, per field. Counted on the
    /// grid cadence so it compares directly against the table capacity.
    pub field_valid: BTreeMap<String, usize>,
    pub rejections: RejectionCounts,
    pub warnings: ParseWarnings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeviceSummary {
    pub fn new(device: &DeviceConfig) -> Self {
        Self {
            device_id: device.device_id.clone(),
            location: device.location.clone(),
            state: DeviceState::Pending,
            total_records: 0,
            valid_records: 0,
            field_valid: BTreeMap::new(),
            rejections: RejectionCounts::default(),
            warnings: ParseWarnings::default(),
            payload_sha256: None,
            error: None,
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.state = DeviceState::Failed;
        self.error = Some(error.into());
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManufacturerSummary {
    pub manufacturer_id: String,
    pub display_name: String,
    /// Grid points in this manufacturer's wide table.
    pub table_rows: usize,
    pub table_columns: usize,
    pub devices: Vec<DeviceSummary>,
}

/// Structured account of one pipeline run, serialized to JSON by the sink
/// and rendered as an ascii table for the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub window: RunWindow,
    pub interval_secs: u32,
    pub aggregation: AggregatePolicy,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub manufacturers: Vec<ManufacturerSummary>,
}

impl RunSummary {
    /// Devices that completed but produced no valid records. Reportable,
    /// not a failure.
    pub fn zero_valid_devices(&self) -> Vec<(&str, &DeviceSummary)> {
        self.manufacturers
            .iter()
            .flat_map(|m| {
                m.devices
                    .iter()
                    .filter(|d| d.state == DeviceState::Done && d.valid_records == 0)
                    .map(move |d| (m.manufacturer_id.as_str(), d))
            })
            .collect()
    }

    pub fn failed_devices(&self) -> Vec<(&str, &DeviceSummary)> {
        self.manufacturers
            .iter()
            .flat_map(|m| {
                m.devices
                    .iter()
                    .filter(|d| d.state == DeviceState::Failed)
                    .map(move |d| (m.manufacturer_id.as_str(), d))
            })
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.manufacturers.iter().map(|m| m.devices.len()).sum()
    }
}

fn format_row(cells: &[String], width: usize) -> String {
    let mut row = format!("||{:>width$}||", cells[0]);
    for cell in &cells[1..] {
        row.push_str(&format!("{cell:>width$}|"));
    }
    row
}

fn availability_cell(filled: usize, capacity: usize) -> String {
    let pct = if capacity == 0 {
        0.0
    } else {
        filled as f64 / capacity as f64 * 100.0
    };
    format!("{filled} ({pct:.0}%)")
}

/// Render the end-of-run availability table: one row per reporting device,
/// one column per field with "filled buckets (percent of grid capacity)"
/// cells. Wide tables are split into sub-tables that fit the screen,
/// repeating the device column.
pub fn render_ascii(summary: &RunSummary) -> Vec<String> {
    let max_cols = ASCII_MAX_SCREEN_WIDTH / ASCII_COLUMN_WIDTH;
    let mut output = Vec::new();
    output.push("+".repeat(80));
    output.push("Summary".to_string());
    output.push("-".repeat(80));

    for man in &summary.manufacturers {
        let reported: Vec<&DeviceSummary> = man
            .devices
            .iter()
            .filter(|d| d.state != DeviceState::Failed)
            .collect();
        if reported.is_empty() {
            continue;
        }

        output.push(man.display_name.clone());
        output.push("~".repeat(man.display_name.len()));

        let fields: Vec<&str> = reported
            .iter()
            .flat_map(|d| d.field_valid.keys().map(|k| k.as_str()))
            .collect::<BTreeSet<&str>>()
            .into_iter()
            .collect();
        // Location first, then the fields alphabetically
        let mut data_columns = vec!["Location".to_string()];
        data_columns.extend(fields.iter().map(|f| f.to_string()));

        let mut remaining = data_columns.len();
        let mut offset = 0;
        while remaining > 0 {
            let take = remaining.min(max_cols - 1);
            let chunk = &data_columns[offset..offset + take];

            let mut header = vec!["Device ID".to_string()];
            header.extend(chunk.iter().cloned());
            let header_row = format_row(&header, ASCII_COLUMN_WIDTH);
            output.push("-".repeat(header_row.len()));
            output.push(header_row.clone());
            output.push("-".repeat(header_row.len()));

            for device in &reported {
                let mut cells = vec![device.device_id.clone()];
                for column in chunk {
                    if column == "Location" {
                        cells.push(device.location.clone());
                    } else {
                        match device.field_valid.get(column) {
                            Some(filled) => cells.push(availability_cell(*filled, man.table_rows)),
                            None => cells.push(String::new()),
                        }
                    }
                }
                output.push(format_row(&cells, ASCII_COLUMN_WIDTH));
            }
            output.push("-".repeat(header_row.len()));

            remaining -= take;
            offset += take;
        }
    }

    output.push("+".repeat(80));
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn device_summary(device_id: &str, state: DeviceState, valid: usize) -> DeviceSummary {
        let mut field_valid = BTreeMap::new();
        if valid > 0 {
            field_valid.insert("pm2_5".to_string(), valid);
        }
        DeviceSummary {
            device_id: device_id.to_string(),
            location: "York".to_string(),
            state,
            total_records: valid,
            valid_records: valid,
            field_valid,
            rejections: RejectionCounts::default(),
            warnings: ParseWarnings::default(),
            payload_sha256: None,
            error: None,
        }
    }

    fn run_summary(devices: Vec<DeviceSummary>) -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            window: RunWindow {
                start: Utc.timestamp_opt(0, 0).unwrap(),
                end: Utc.timestamp_opt(86_400, 0).unwrap(),
            },
            interval_secs: 600,
            aggregation: AggregatePolicy::Mean,
            started_at: Utc.timestamp_opt(86_400, 0).unwrap(),
            finished_at: Utc.timestamp_opt(86_500, 0).unwrap(),
            manufacturers: vec![ManufacturerSummary {
                manufacturer_id: "aqmesh".to_string(),
                display_name: "AQMesh".to_string(),
                table_rows: 144,
                table_columns: devices.len(),
                devices,
            }],
        }
    }

    #[test]
    fn test_renders_device_rows_with_availability_percent() {
        let summary = run_summary(vec![
            device_summary("mesh-1", DeviceState::Done, 72),
            device_summary("mesh-2", DeviceState::Done, 144),
        ]);
        let lines = render_ascii(&summary);

        assert_eq!(lines[0], "+".repeat(80));
        assert_eq!(lines[1], "Summary");
        assert!(lines.iter().any(|l| l == "AQMesh"));
        assert!(lines.iter().any(|l| l.contains("Device ID")));
        assert!(lines.iter().any(|l| l.contains("72 (50%)")));
        assert!(lines.iter().any(|l| l.contains("144 (100%)")));
        assert_eq!(lines.last().unwrap(), &"+".repeat(80));
    }

    #[test]
    fn test_failed_devices_are_left_out_of_the_table() {
        let mut failed = device_summary("mesh-9", DeviceState::Failed, 0);
        failed.error = Some("connection refused".to_string());
        let summary = run_summary(vec![
            device_summary("mesh-1", DeviceState::Done, 10),
            failed,
        ]);
        let lines = render_ascii(&summary);
        assert!(!lines.iter().any(|l| l.contains("mesh-9")));
        assert!(lines.iter().any(|l| l.contains("mesh-1")));
    }

    #[test]
    fn test_manufacturer_with_no_reporting_devices_is_skipped() {
        let mut failed = device_summary("mesh-9", DeviceState::Failed, 0);
        failed.error = Some("boom".to_string());
        let summary = run_summary(vec![failed]);
        let lines = render_ascii(&summary);
        assert!(!lines.iter().any(|l| l == "AQMesh"));
    }

    #[test]
    fn test_wide_tables_split_into_subtables() {
        let mut device = device_summary("mesh-1", DeviceState::Done, 10);
        for i in 0..8 {
            device.field_valid.insert(format!("field_{i}"), 10);
        }
        let summary = run_summary(vec![device]);
        let lines = render_ascii(&summary);
        let header_count = lines.iter().filter(|l| l.contains("Device ID")).count();
        // location plus nine fields, six data columns per sub-table
        assert_eq!(header_count, 2);
    }

    #[test]
    fn test_helpers_pick_out_zero_valid_and_failed_devices() {
        let mut failed = device_summary("mesh-9", DeviceState::Failed, 0);
        failed.error = Some("boom".to_string());
        let summary = run_summary(vec![
            device_summary("mesh-1", DeviceState::Done, 0),
            device_summary("mesh-2", DeviceState::Done, 5),
            failed,
        ]);

        let zero: Vec<&str> = summary
            .zero_valid_devices()
            .iter()
            .map(|(_, d)| d.device_id.as_str())
            .collect();
        assert_eq!(zero, vec!["mesh-1"]);

        let failed: Vec<&str> = summary
            .failed_devices()
            .iter()
            .map(|(_, d)| d.device_id.as_str())
            .collect();
        assert_eq!(failed, vec!["mesh-9"]);
    }

    #[test]
    fn test_availability_cell_survives_zero_capacity() {
        assert_eq!(availability_cell(0, 0), "0 (0%)");
        assert_eq!(availability_cell(3, 6), "3 (50%)");
    }
}
