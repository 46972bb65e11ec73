use super::{numeric_value, parse_timestamp, ManufacturerAdapter, ParseOutput, ParseWarnings, RecordEmitter};
use crate::config::{AdapterProperties, DeviceConfig, FieldConfig};
use crate::constants;
use crate::error::{PipelineError, Result};
use crate::types::FetchedPayload;
use serde_json::Value;

/// Adapter for AQMesh pods. Payloads are JSON timepoints (object keyed by
/// row id, or plain array), each with a nested timestamp and a `Channels`
/// array of sensor readings.
pub struct AqmeshAdapter;

impl AqmeshAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ManufacturerAdapter for AqmeshAdapter {
    fn manufacturer_id(&self) -> &'static str {
        constants::AQMESH
    }

    fn parse(
        &self,
        payload: &FetchedPayload,
        device: &DeviceConfig,
        fields: &[FieldConfig],
        props: &AdapterProperties,
    ) -> Result<ParseOutput> {
        let root: Value = serde_json::from_slice(&payload.bytes)
            .map_err(|e| PipelineError::Parse(format!("AQMesh payload is not valid JSON: {e}")))?;
        let timepoints: Vec<&Value> = match &root {
            Value::Array(items) => items.iter().collect(),
            Value::Object(map) => map.values().collect(),
            _ => {
                return Err(PipelineError::Parse(
                    "AQMesh payload must be a JSON object or array".to_string(),
                ))
            }
        };

        let mut warnings = ParseWarnings::default();
        let mut emitter = RecordEmitter::new(device, payload);
        for point in timepoints {
            // timestamp is nested one level under the same key
            let raw_ts = point
                .get(&props.timestamp_column)
                .and_then(|t| t.get(&props.timestamp_column))
                .and_then(|v| v.as_str());
            let Some(timestamp) = raw_ts.and_then(|s| parse_timestamp(s, &props.timestamp_format))
            else {
                warnings.bad_timestamps += 1;
                continue;
            };

            let Some(channels) = point.get("Channels").and_then(|c| c.as_array()) else {
                continue;
            };
            for channel in channels {
                let Some(label) = channel.get("SensorLabel").and_then(|v| v.as_str()) else {
                    continue;
                };
                let Some(field) = fields.iter().find(|f| f.web_id == label) else {
                    warnings.unknown_fields.insert(label.to_string());
                    continue;
                };
                let reading = channel
                    .get("Scaled")
                    .and_then(|s| s.get("Reading"))
                    .and_then(numeric_value);
                emitter.emit(field, timestamp, reading);
            }
        }

        Ok(ParseOutput {
            records: emitter.into_records(),
            warnings,
        })
    }
}

impl Default for AqmeshAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::{device, field, props};
    use crate::types::Validity;
    use chrono::{TimeZone, Utc};

    fn mesh_props() -> AdapterProperties {
        props("Timestamp", "%Y-%m-%dT%H:%M:%S")
    }

    fn payload(json: &str) -> FetchedPayload {
        FetchedPayload::new(json.as_bytes().to_vec(), 3)
    }

    const BODY: &str = r#"{
        "0": {
            "Timestamp": { "Timestamp": "2024-03-01T10:00:00", "Offset": 0 },
            "Channels": [
                { "SensorLabel": "PM2.5", "Scaled": { "Reading": 8.5 } },
                { "SensorLabel": "NO2", "Scaled": { "Reading": "0.5" } },
                { "SensorLabel": "HUM", "Scaled": { "Reading": 45.0 } }
            ]
        },
        "1": {
            "Timestamp": { "Timestamp": "not a time" },
            "Channels": [
                { "SensorLabel": "PM2.5", "Scaled": { "Reading": 9.0 } }
            ]
        },
        "2": {
            "Timestamp": { "Timestamp": "2024-03-01T10:15:00" },
            "Channels": [
                { "SensorLabel": "PM2.5", "Scaled": {} }
            ]
        }
    }"#;

    #[test]
    fn test_parses_timepoints_and_channels() {
        let fields = vec![field("pm2_5", "PM2.5", 1.0), field("no2", "NO2", 2.0)];
        let out = AqmeshAdapter::new()
            .parse(&payload(BODY), &device("mesh-1", "2450100"), &fields, &mesh_props())
            .unwrap();

        let pm = out
            .records
            .iter()
            .find(|r| r.field_id == "pm2_5" && r.validity == Validity::Valid)
            .unwrap();
        assert_eq!(pm.value, 8.5);
        assert_eq!(
            pm.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
        );

        // string readings are numbers too, scale applied once
        let no2 = out.records.iter().find(|r| r.field_id == "no2").unwrap();
        assert_eq!(no2.value, 1.0);
        assert_eq!(no2.retrieval_seq.fetch, 3);
    }

    #[test]
    fn test_unknown_sensor_labels_are_warned() {
        let fields = vec![field("pm2_5", "PM2.5", 1.0)];
        let out = AqmeshAdapter::new()
            .parse(&payload(BODY), &device("mesh-1", "2450100"), &fields, &mesh_props())
            .unwrap();
        assert!(out.warnings.unknown_fields.contains("NO2"));
        assert!(out.warnings.unknown_fields.contains("HUM"));
    }

    #[test]
    fn test_bad_timestamps_are_counted() {
        let fields = vec![field("pm2_5", "PM2.5", 1.0)];
        let out = AqmeshAdapter::new()
            .parse(&payload(BODY), &device("mesh-1", "2450100"), &fields, &mesh_props())
            .unwrap();
        assert_eq!(out.warnings.bad_timestamps, 1);
    }

    #[test]
    fn test_missing_reading_becomes_non_numeric() {
        let fields = vec![field("pm2_5", "PM2.5", 1.0)];
        let out = AqmeshAdapter::new()
            .parse(&payload(BODY), &device("mesh-1", "2450100"), &fields, &mesh_props())
            .unwrap();
        let bad = out
            .records
            .iter()
            .find(|r| r.validity == Validity::NonNumeric)
            .unwrap();
        assert!(bad.value.is_nan());
        assert_eq!(
            bad.timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap()
        );
    }

    #[test]
    fn test_array_payloads_are_accepted() {
        let body = r#"[
            {
                "Timestamp": { "Timestamp": "2024-03-01T10:00:00" },
                "Channels": [ { "SensorLabel": "PM2.5", "Scaled": { "Reading": 1.25 } } ]
            }
        ]"#;
        let fields = vec![field("pm2_5", "PM2.5", 1.0)];
        let out = AqmeshAdapter::new()
            .parse(&payload(body), &device("mesh-1", "2450100"), &fields, &mesh_props())
            .unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].value, 1.25);
    }

    #[test]
    fn test_non_json_payload_is_a_parse_error() {
        let fields = vec![field("pm2_5", "PM2.5", 1.0)];
        let result = AqmeshAdapter::new().parse(
            &payload("<html>gateway error</html>"),
            &device("mesh-1", "2450100"),
            &fields,
            &mesh_props(),
        );
        assert!(matches!(result, Err(PipelineError::Parse(_))));
    }

    #[test]
    fn test_scalar_payload_is_a_parse_error() {
        let fields = vec![field("pm2_5", "PM2.5", 1.0)];
        let result = AqmeshAdapter::new().parse(
            &payload("42"),
            &device("mesh-1", "2450100"),
            &fields,
            &mesh_props(),
        );
        assert!(matches!(result, Err(PipelineError::Parse(_))));
    }
}
