use super::{parse_timestamp, ManufacturerAdapter, ParseOutput, ParseWarnings, RecordEmitter};
use crate::config::{AdapterProperties, DeviceConfig, FieldConfig};
use crate::constants;
use crate::error::{PipelineError, Result};
use crate::types::FetchedPayload;

/// Adapter for Aeroqual instruments. Payloads are CSV text with a fixed
/// number of preamble lines before the header row.
pub struct AeroqualAdapter;

impl AeroqualAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl ManufacturerAdapter for AeroqualAdapter {
    fn manufacturer_id(&self) -> &'static str {
        constants::AEROQUAL
    }

    fn parse(
        &self,
        payload: &FetchedPayload,
        device: &DeviceConfig,
        fields: &[FieldConfig],
        props: &AdapterProperties,
    ) -> Result<ParseOutput> {
        let text = std::str::from_utf8(&payload.bytes)
            .map_err(|e| PipelineError::Parse(format!("Aeroqual payload is not UTF-8: {e}")))?;
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() <= props.lines_skip {
            return Err(PipelineError::Parse(format!(
                "Aeroqual payload has no header row ({} lines, {} preamble lines expected)",
                lines.len(),
                props.lines_skip
            )));
        }

        let header: Vec<&str> = lines[props.lines_skip].split(',').map(str::trim).collect();
        if header.len() < 2 {
            return Err(PipelineError::Parse(
                "Aeroqual header has fewer than two columns".to_string(),
            ));
        }
        let timestamp_col = header
            .iter()
            .position(|name| *name == props.timestamp_column)
            .ok_or_else(|| {
                PipelineError::Parse(format!(
                    "Aeroqual header is missing timestamp column '{}'",
                    props.timestamp_column
                ))
            })?;

        let mut warnings = ParseWarnings::default();
        // resolve each column to its configured field once
        let columns: Vec<Option<&FieldConfig>> = header
            .iter()
            .enumerate()
            .map(|(i, name)| {
                if i == timestamp_col {
                    return None;
                }
                let field = fields.iter().find(|f| f.web_id == *name);
                if field.is_none() && !name.is_empty() {
                    warnings.unknown_fields.insert((*name).to_string());
                }
                field
            })
            .collect();

        let mut emitter = RecordEmitter::new(device, payload);
        for line in &lines[props.lines_skip + 1..] {
            if line.trim().is_empty() {
                continue;
            }
            let cells: Vec<&str> = line.split(',').map(str::trim).collect();
            if cells.len() != header.len() {
                return Err(PipelineError::Parse(format!(
                    "Aeroqual row has {} cells but the header has {} columns",
                    cells.len(),
                    header.len()
                )));
            }
            let Some(timestamp) = parse_timestamp(cells[timestamp_col], &props.timestamp_format)
            else {
                warnings.bad_timestamps += 1;
                continue;
            };
            for (i, cell) in cells.iter().enumerate() {
                if let Some(field) = columns[i] {
                    emitter.emit(field, timestamp, cell.parse::<f64>().ok());
                }
            }
        }

        Ok(ParseOutput {
            records: emitter.into_records(),
            warnings,
        })
    }
}

impl Default for AeroqualAdapter {
    fn default() -> Self {
        Self::new()
    }
}
