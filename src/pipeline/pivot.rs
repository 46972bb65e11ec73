use crate::config::ManufacturerConfig;
use crate::types::{column_label, ResampledSeries, SamplingGrid, WideColumn, WideTable};
use std::collections::HashMap;

/// Assemble the per-manufacturer wide table. The column set comes from the
/// static configuration (every device x analysis field pair), so a device
/// that failed or reported nothing still contributes an all-no-data column
/// and the table shape is identical run over run.
pub fn pivot_manufacturer(
    man: &ManufacturerConfig,
    grid: &SamplingGrid,
    series: &[ResampledSeries],
) -> WideTable {
    let mut by_pair: HashMap<(&str, &str), &ResampledSeries> = HashMap::new();
    for s in series {
        debug_assert!(
            s.grid == *grid,
            "resampled series grid must match the table grid"
        );
        by_pair.insert((s.device_id.as_str(), s.field_id.as_str()), s);
    }

    let mut columns = Vec::new();
    for device in &man.devices {
        for field in man.analysis_fields() {
            let values = match by_pair.get(&(device.device_id.as_str(), field.field_id.as_str())) {
                Some(s) => s.values.clone(),
                None => vec![None; grid.len()],
            };
            columns.push(WideColumn {
                device_id: device.device_id.clone(),
                field_id: field.field_id.clone(),
                label: column_label(&field.field_id, &device.device_id),
                values,
            });
        }
    }
    // sort by label so a measurand's columns sit together
    columns.sort_by(|a, b| a.label.cmp(&b.label));

    WideTable {
        manufacturer_id: man.manufacturer_id.clone(),
        index: grid.iter().collect(),
        columns,
    }
}
