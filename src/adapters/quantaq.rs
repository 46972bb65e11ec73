use super::{numeric_value, parse_timestamp, ManufacturerAdapter, ParseOutput, ParseWarnings, RecordEmitter};
use crate::config::{AdapterProperties, DeviceConfig, FieldConfig};
use crate::constants;
use crate::error::{PipelineError, Result};
use crate::types::FetchedPayload;
use serde_json::Value;

/// Payload keys that are device metadata rather than measurands.
const METADATA_KEYS: [&str; 4] = ["url", "sn", "gas", "pm"];

/// Adapter for QuantAQ monitors. Payloads hold a `final` array of flat
/// records; the nested `geo` object is flattened into its subkeys and the
/// `sn` serial is checked against the fetched device.
pub struct QuantaqAdapter;

impl QuantaqAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ManufacturerAdapter for QuantaqAdapter {
    fn manufacturer_id(&self) -> &'static str {
        constants::QUANTAQ
    }

    fn parse(
        &self,
        payload: &FetchedPayload,
        device: &DeviceConfig,
        fields: &[FieldConfig],
        props: &AdapterProperties,
    ) -> Result<ParseOutput> {
        let root: Value = serde_json::from_slice(&payload.bytes)
            .map_err(|e| PipelineError::Parse(format!("QuantAQ payload is not valid JSON: {e}")))?;
        let items = root
            .get("final")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                PipelineError::Parse("QuantAQ payload is missing the 'final' data list".to_string())
            })?;
        if items.is_empty() {
            return Err(PipelineError::Parse(
                "QuantAQ payload contains no data".to_string(),
            ));
        }

        let mut warnings = ParseWarnings::default();
        let mut emitter = RecordEmitter::new(device, payload);
        for item in items {
            let entry = item.as_object().ok_or_else(|| {
                PipelineError::Parse("QuantAQ data entry is not an object".to_string())
            })?;

            if let Some(serial) = entry.get("sn").and_then(|v| v.as_str()) {
                if serial != device.web_id {
                    warnings.unknown_devices.insert(serial.to_string());
                    continue;
                }
            }

            let raw_ts = entry.get(&props.timestamp_column).and_then(|v| v.as_str());
            let Some(timestamp) = raw_ts.and_then(|s| parse_timestamp(s, &props.timestamp_format))
            else {
                warnings.bad_timestamps += 1;
                continue;
            };

            for (key, value) in entry {
                if key == &props.timestamp_column || METADATA_KEYS.contains(&key.as_str()) {
                    continue;
                }
                if key == "geo" {
                    let Some(geo) = value.as_object() else { continue };
                    for (geo_key, geo_value) in geo {
                        match fields.iter().find(|f| &f.web_id == geo_key) {
                            Some(field) => emitter.emit(field, timestamp, numeric_value(geo_value)),
                            None => {
                                warnings.unknown_fields.insert(geo_key.clone());
                            }
                        }
                    }
                    continue;
                }
                match fields.iter().find(|f| &f.web_id == key) {
                    Some(field) => emitter.emit(field, timestamp, numeric_value(value)),
                    None => {
                        warnings.unknown_fields.insert(key.clone());
                    }
                }
            }
        }

        Ok(ParseOutput {
            records: emitter.into_records(),
            warnings,
        })
    }
}

impl Default for QuantaqAdapter {
    fn default() -> Self {
        Self::new()
    }
}
