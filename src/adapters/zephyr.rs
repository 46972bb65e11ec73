use super::{numeric_value, parse_timestamp, ManufacturerAdapter, ParseOutput, ParseWarnings, RecordEmitter};
use crate::config::{AdapterProperties, DeviceConfig, FieldConfig};
use crate::constants;
use crate::error::{PipelineError, Result};
use crate::types::FetchedPayload;
use serde_json::{Map, Value};

/// Adapter for Earthsense Zephyr units. Payloads are columnar JSON under
/// `data.<averaging_key>.<slot>`: one entry per measurand holding a `data`
/// array, all arrays row-aligned with the timestamp entry.
pub struct ZephyrAdapter;

impl ZephyrAdapter {
    pub fn new() -> Self {
        Self
    }
}

fn slot_entries<'a>(averaged: &'a Map<String, Value>, name: &str) -> Option<&'a Map<String, Value>> {
    averaged
        .get(name)
        .and_then(|v| v.as_object())
        .filter(|m| !m.is_empty())
}

impl ManufacturerAdapter for ZephyrAdapter {
    fn manufacturer_id(&self) -> &'static str {
        constants::ZEPHYR
    }

    fn parse(
        &self,
        payload: &FetchedPayload,
        device: &DeviceConfig,
        fields: &[FieldConfig],
        props: &AdapterProperties,
    ) -> Result<ParseOutput> {
        let averaging_key = props.averaging_key.as_deref().ok_or_else(|| {
            PipelineError::Parse("Zephyr adapter requires the averaging_key property".to_string())
        })?;
        let slot_name = props.slot.as_deref().ok_or_else(|| {
            PipelineError::Parse("Zephyr adapter requires the slot property".to_string())
        })?;

        let root: Value = serde_json::from_slice(&payload.bytes)
            .map_err(|e| PipelineError::Parse(format!("Zephyr payload is not valid JSON: {e}")))?;
        let averaged = root
            .get("data")
            .and_then(|d| d.get(averaging_key))
            .and_then(|v| v.as_object())
            .ok_or_else(|| {
                PipelineError::Parse(format!(
                    "Zephyr payload has no 'data.{averaging_key}' section"
                ))
            })?;

        // use the configured slot, falling back to whichever other slot holds data
        let entries = match slot_entries(averaged, slot_name) {
            Some(m) => m,
            None => {
                let alt = averaged
                    .iter()
                    .filter(|(name, _)| name.as_str() != slot_name)
                    .find_map(|(name, v)| {
                        v.as_object()
                            .filter(|m| !m.is_empty())
                            .map(|m| (name.as_str(), m))
                    });
                match alt {
                    Some((alt_name, m)) => {
                        tracing::warn!(
                            "Zephyr slot '{}' has no data for device {}, using '{}'",
                            slot_name,
                            device.device_id,
                            alt_name
                        );
                        m
                    }
                    None => {
                        return Err(PipelineError::Parse(
                            "Zephyr payload has no data in any slot".to_string(),
                        ))
                    }
                }
            }
        };

        let mut columns: Vec<(&str, &Vec<Value>)> = Vec::new();
        for (name, entry) in entries {
            let arr = entry.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
                PipelineError::Parse(format!("Zephyr entry '{name}' has no data array"))
            })?;
            columns.push((name.as_str(), arr));
        }
        let timestamps = columns
            .iter()
            .find(|(name, _)| *name == props.timestamp_column)
            .map(|(_, arr)| *arr)
            .ok_or_else(|| {
                PipelineError::Parse(format!(
                    "Zephyr slot has no timestamp entry '{}'",
                    props.timestamp_column
                ))
            })?;
        let row_count = timestamps.len();
        if columns.iter().any(|(_, arr)| arr.len() != row_count) {
            return Err(PipelineError::Parse(
                "Zephyr data arrays have mismatched lengths".to_string(),
            ));
        }

        let mut warnings = ParseWarnings::default();
        let mut resolved: Vec<(&FieldConfig, &Vec<Value>)> = Vec::new();
        for (name, arr) in &columns {
            if *name == props.timestamp_column {
                continue;
            }
            match fields.iter().find(|f| f.web_id == *name) {
                Some(field) => resolved.push((field, *arr)),
                None => {
                    warnings.unknown_fields.insert((*name).to_string());
                }
            }
        }

        let mut emitter = RecordEmitter::new(device, payload);
        for row in 0..row_count {
            let Some(timestamp) = timestamps[row]
                .as_str()
                .and_then(|s| parse_timestamp(s, &props.timestamp_format))
            else {
                warnings.bad_timestamps += 1;
                continue;
            };
            for (field, arr) in &resolved {
                emitter.emit(field, timestamp, numeric_value(&arr[row]));
            }
        }

        Ok(ParseOutput {
            records: emitter.into_records(),
            warnings,
        })
    }
}

impl Default for ZephyrAdapter {
    fn default() -> Self {
        Self::new()
    }
}
