// Base trait, registry and shared helpers for manufacturer adapters
pub mod aeroqual;
pub mod aqmesh;
pub mod quantaq;
pub mod zephyr;

pub use aeroqual::AeroqualAdapter;
pub use aqmesh::AqmeshAdapter;
pub use quantaq::QuantaqAdapter;
pub use zephyr::ZephyrAdapter;

use crate::config::{AdapterProperties, DeviceConfig, FieldConfig};
use crate::error::Result;
use crate::types::{CanonicalRecord, FetchedPayload, RetrievalSeq, Validity};
use chrono::{DateTime, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Parses one manufacturer's raw payloads into canonical records. Adapters
/// are stateless; the same instance serves every device of the manufacturer.
pub trait ManufacturerAdapter: Send + Sync {
    fn manufacturer_id(&self) -> &'static str;

    /// Turn one raw payload into canonical records. Record-level defects
    /// (unparsable values, unknown keys, bad timestamps) are downgraded to
    /// warnings or `NonNumeric` records; only payload-level structure
    /// failures are errors.
    fn parse(
        &self,
        payload: &FetchedPayload,
        device: &DeviceConfig,
        fields: &[FieldConfig],
        props: &AdapterProperties,
    ) -> Result<ParseOutput>;
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutput {
    pub records: Vec<CanonicalRecord>,
    pub warnings: ParseWarnings,
}

/// Non-fatal defects noticed while parsing one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarnings {
    /// Payload keys with no configured field mapping.
    pub unknown_fields: BTreeSet<String>,
    /// Device serials in the payload other than the fetched device.
    pub unknown_devices: BTreeSet<String>,
    /// Rows dropped because their timestamp could not be parsed.
    pub bad_timestamps: usize,
}

impl ParseWarnings {
    pub fn is_empty(&self) -> bool {
        self.unknown_fields.is_empty() && self.unknown_devices.is_empty() && self.bad_timestamps == 0
    }
}

/// Registry of manufacturer-specific adapters.
pub struct AdapterRegistry {
    adapters: HashMap<String, Box<dyn ManufacturerAdapter>>,
}

impl AdapterRegistry {
    /// Create a registry with the built-in adapters registered.
    pub fn new() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        registry.register(Box::new(AeroqualAdapter::new()));
        registry.register(Box::new(AqmeshAdapter::new()));
        registry.register(Box::new(ZephyrAdapter::new()));
        registry.register(Box::new(QuantaqAdapter::new()));
        registry
    }

    /// Register an adapter under its own manufacturer id.
    pub fn register(&mut self, adapter: Box<dyn ManufacturerAdapter>) {
        self.adapters
            .insert(adapter.manufacturer_id().to_string(), adapter);
    }

    pub fn get(&self, manufacturer_id: &str) -> Option<&dyn ManufacturerAdapter> {
        self.adapters.get(manufacturer_id).map(|a| a.as_ref())
    }

    /// List all registered manufacturer ids.
    pub fn list(&self) -> Vec<&str> {
        self.adapters.keys().map(|k| k.as_str()).collect()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a raw timestamp with the configured format. Offset-aware formats
/// keep their offset; naive formats are taken as UTC. Sub-second precision is
/// truncated so exact-duplicate detection works at second resolution.
pub(crate) fn parse_timestamp(raw: &str, format: &str) -> Option<DateTime<Utc>> {
    let instant = match DateTime::parse_from_str(raw, format) {
        Ok(t) => t.with_timezone(&Utc),
        Err(_) => Utc.from_utc_datetime(&NaiveDateTime::parse_from_str(raw, format).ok()?),
    };
    instant.with_nanosecond(0)
}

/// Extract a number from a JSON value: a JSON number, or a string that
/// parses as one.
pub(crate) fn numeric_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Builds canonical records for one payload, stamping retrieval sequence
/// numbers in encounter order and applying the field scale exactly once.
pub(crate) struct RecordEmitter<'a> {
    device: &'a DeviceConfig,
    fetch: u64,
    index: u32,
    records: Vec<CanonicalRecord>,
}

impl<'a> RecordEmitter<'a> {
    pub fn new(device: &'a DeviceConfig, payload: &FetchedPayload) -> Self {
        Self {
            device,
            fetch: payload.retrieval_seq,
            index: 0,
            records: Vec::new(),
        }
    }

    /// Emit one record. `raw` is the unscaled value; `None` marks a cell
    /// that could not be read as a number.
    pub fn emit(&mut self, field: &FieldConfig, timestamp: DateTime<Utc>, raw: Option<f64>) {
        let (value, validity) = match raw {
            Some(v) => (v * field.scale, Validity::Valid),
            None => (f64::NAN, Validity::NonNumeric),
        };
        self.records.push(CanonicalRecord {
            device_id: self.device.device_id.clone(),
            field_id: field.field_id.clone(),
            timestamp,
            value,
            validity,
            retrieval_seq: RetrievalSeq {
                fetch: self.fetch,
                index: self.index,
            },
        });
        self.index += 1;
    }

    pub fn into_records(self) -> Vec<CanonicalRecord> {
        self.records
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::config::{AdapterProperties, DeviceConfig, FieldConfig, ValueRange};

    pub fn device(device_id: &str, web_id: &str) -> DeviceConfig {
        DeviceConfig {
            device_id: device_id.to_string(),
            web_id: web_id.to_string(),
            location: "test bench".to_string(),
        }
    }

    pub fn field(field_id: &str, web_id: &str, scale: f64) -> FieldConfig {
        FieldConfig {
            field_id: field_id.to_string(),
            web_id: web_id.to_string(),
            scale,
            range: ValueRange {
                min: -1_000_000.0,
                max: 1_000_000.0,
            },
            included_analysis: true,
        }
    }

    pub fn props(timestamp_column: &str, timestamp_format: &str) -> AdapterProperties {
        AdapterProperties {
            timestamp_column: timestamp_column.to_string(),
            timestamp_format: timestamp_format.to_string(),
            endpoint: "https://api.example.com/{device}/{start}/{end}".to_string(),
            lines_skip: 0,
            averaging_key: None,
            slot: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_registry_has_built_in_adapters() {
        let registry = AdapterRegistry::new();
        let ids = registry.list();
        assert!(ids.contains(&"aeroqual"));
        assert!(ids.contains(&"aqmesh"));
        assert!(ids.contains(&"zephyr"));
        assert!(ids.contains(&"quantaq"));
    }

    #[test]
    fn test_registry_returns_none_for_unknown_manufacturer() {
        let registry = AdapterRegistry::new();
        assert!(registry.get("acme_sensors").is_none());
    }

    #[test]
    fn test_naive_timestamps_are_taken_as_utc() {
        let t = parse_timestamp("2024-03-01 10:30:00", "%Y-%m-%d %H:%M:%S").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap());
    }

    #[test]
    fn test_offset_aware_timestamps_convert_to_utc() {
        let t = parse_timestamp("2024-03-01 10:30:00 +0200", "%Y-%m-%d %H:%M:%S %z").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap());
    }

    #[test]
    fn test_subsecond_precision_is_truncated() {
        let t = parse_timestamp("2024-03-01 10:30:00.750", "%Y-%m-%d %H:%M:%S%.3f").unwrap();
        assert_eq!(t.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_unparsable_timestamp_is_none() {
        assert!(parse_timestamp("yesterday", "%Y-%m-%d %H:%M:%S").is_none());
    }

    #[test]
    fn test_numeric_value_reads_numbers_and_numeric_strings() {
        assert_eq!(numeric_value(&serde_json::json!(1.5)), Some(1.5));
        assert_eq!(numeric_value(&serde_json::json!("2.25")), Some(2.25));
        assert_eq!(numeric_value(&serde_json::json!(" 3 ")), Some(3.0));
        assert_eq!(numeric_value(&serde_json::json!("n/a")), None);
        assert_eq!(numeric_value(&serde_json::json!(null)), None);
        assert_eq!(numeric_value(&serde_json::json!({"v": 1})), None);
    }
}
