use crate::constants;
use crate::error::{PipelineError, Result};
use crate::types::{column_label, AggregatePolicy, RunWindow};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Embedded JSON Schema for the study configuration file.
pub const STUDY_SCHEMA_JSON: &str = include_str!("../schemas/study.v1.json");

// jsonschema 0.17 expects a schema with 'static lifetime; leak the parsed
// schema once at first use
static STUDY_SCHEMA: Lazy<JSONSchema> = Lazy::new(|| {
    let schema_json: serde_json::Value =
        serde_json::from_str(STUDY_SCHEMA_JSON).expect("embedded study schema is valid JSON");
    let schema_static: &'static serde_json::Value = Box::leak(Box::new(schema_json));
    JSONSchema::options()
        .compile(schema_static)
        .expect("embedded study schema compiles")
});

/// Static study configuration: which manufacturers, devices and fields a run
/// covers. Loaded once per run and treated as immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub study_name: Option<String>,
    pub manufacturers: Vec<ManufacturerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManufacturerConfig {
    pub manufacturer_id: String,
    pub display_name: String,
    /// Per-manufacturer override of the global device concurrency bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_devices: Option<usize>,
    pub properties: AdapterProperties,
    pub fields: Vec<FieldConfig>,
    pub devices: Vec<DeviceConfig>,
}

impl ManufacturerConfig {
    /// Fields that take part in the wide analysis table.
    pub fn analysis_fields(&self) -> impl Iterator<Item = &FieldConfig> {
        self.fields.iter().filter(|f| f.included_analysis)
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }
}

/// Parse knobs handed to the manufacturer adapter, plus the fetch endpoint
/// template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterProperties {
    /// Name of the payload column/key holding the timestamp.
    pub timestamp_column: String,
    /// chrono format string for raw timestamps.
    pub timestamp_format: String,
    /// URL template with `{device}`, `{start}` and `{end}` placeholders.
    pub endpoint: String,
    /// Preamble lines before the CSV header (aeroqual).
    #[serde(default)]
    pub lines_skip: usize,
    /// Averaging period key in the payload (zephyr).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub averaging_key: Option<String>,
    /// Preferred data slot (zephyr).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Canonical measurand name, e.g. `pm2_5`.
    pub field_id: String,
    /// The manufacturer's key for this measurand in raw payloads.
    pub web_id: String,
    /// Multiplicative factor to canonical units, applied exactly once at
    /// adapter output.
    pub scale: f64,
    pub range: ValueRange,
    /// Whether the field appears as a wide-table column.
    #[serde(default = "default_true")]
    pub included_analysis: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable human label, unique within the manufacturer.
    pub device_id: String,
    /// The manufacturer's own identifier, used only when fetching/parsing.
    pub web_id: String,
    #[serde(default)]
    pub location: String,
}

fn default_true() -> bool {
    true
}

impl StudyConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read study config '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a study config: schema first, then the semantic
    /// checks `serde` cannot express.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let instance: serde_json::Value = serde_json::from_str(raw)?;
        if let Err(errors) = STUDY_SCHEMA.validate(&instance) {
            let details: Vec<String> = errors
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect();
            return Err(PipelineError::Config(format!(
                "Study config failed schema validation: {}",
                details.join("; ")
            )));
        }
        let study: StudyConfig = serde_json::from_value(instance)?;
        study.validate()?;
        Ok(study)
    }

    /// Semantic validation. Any defect here is fatal before the run starts:
    /// a misconfigured scale or range would corrupt every downstream value.
    pub fn validate(&self) -> Result<()> {
        let mut manufacturer_ids = HashSet::new();
        for man in &self.manufacturers {
            if !manufacturer_ids.insert(man.manufacturer_id.as_str()) {
                return Err(PipelineError::Config(format!(
                    "Duplicate manufacturer_id '{}'",
                    man.manufacturer_id
                )));
            }

            let mut device_ids = HashSet::new();
            for device in &man.devices {
                if !device_ids.insert(device.device_id.as_str()) {
                    return Err(PipelineError::Config(format!(
                        "Duplicate device_id '{}' for manufacturer '{}'",
                        device.device_id, man.manufacturer_id
                    )));
                }
            }

            let mut field_ids = HashSet::new();
            for field in &man.fields {
                if !field_ids.insert(field.field_id.as_str()) {
                    return Err(PipelineError::Config(format!(
                        "Duplicate field_id '{}' for manufacturer '{}'",
                        field.field_id, man.manufacturer_id
                    )));
                }
                if !field.scale.is_finite() || field.scale == 0.0 {
                    return Err(PipelineError::Config(format!(
                        "Field '{}' of manufacturer '{}' has unusable scale {}",
                        field.field_id, man.manufacturer_id, field.scale
                    )));
                }
                if !field.range.min.is_finite()
                    || !field.range.max.is_finite()
                    || field.range.min > field.range.max
                {
                    return Err(PipelineError::Config(format!(
                        "Field '{}' of manufacturer '{}' has unusable range [{}, {}]",
                        field.field_id, man.manufacturer_id, field.range.min, field.range.max
                    )));
                }
            }

            // labels are whitespace-stripped in the wide table, so ids that
            // differ only in whitespace would collide in the CSV header
            let mut labels = HashSet::new();
            for device in &man.devices {
                for field in man.analysis_fields() {
                    let label = column_label(&field.field_id, &device.device_id);
                    if !labels.insert(label.clone()) {
                        return Err(PipelineError::Config(format!(
                            "Duplicate column label '{}' for manufacturer '{}'",
                            label, man.manufacturer_id
                        )));
                    }
                }
            }

            if man.manufacturer_id == constants::ZEPHYR
                && (man.properties.averaging_key.is_none() || man.properties.slot.is_none())
            {
                return Err(PipelineError::Config(format!(
                    "Manufacturer '{}' requires averaging_key and slot properties",
                    man.manufacturer_id
                )));
            }
        }
        Ok(())
    }

    /// Narrow the study to the requested manufacturer/device names. An empty
    /// selection list means "all". Names that match nothing are logged and
    /// ignored; manufacturers left without devices are dropped.
    pub fn restrict(&self, manufacturers: &[String], devices: &[String]) -> Self {
        for name in manufacturers {
            if !self.manufacturers.iter().any(|m| &m.manufacturer_id == name) {
                tracing::warn!(manufacturer = %name, "Requested manufacturer is not configured");
            }
        }
        let mut kept: Vec<ManufacturerConfig> = self
            .manufacturers
            .iter()
            .filter(|m| manufacturers.is_empty() || manufacturers.contains(&m.manufacturer_id))
            .cloned()
            .collect();

        if !devices.is_empty() {
            for name in devices {
                if !kept
                    .iter()
                    .any(|m| m.devices.iter().any(|d| &d.device_id == name))
                {
                    tracing::warn!(device = %name, "Requested device is not configured");
                }
            }
            for man in &mut kept {
                man.devices.retain(|d| devices.contains(&d.device_id));
            }
            kept.retain(|m| !m.devices.is_empty());
        }

        Self {
            study_name: self.study_name.clone(),
            manufacturers: kept,
        }
    }

    pub fn device_count(&self) -> usize {
        self.manufacturers.iter().map(|m| m.devices.len()).sum()
    }
}

/// Runtime settings from the optional TOML settings file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub fetch: FetchSettings,
    #[serde(default)]
    pub output: OutputSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSettings {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u32,
    #[serde(default)]
    pub aggregation: AggregatePolicy,
    #[serde(default = "default_max_concurrent_devices")]
    pub max_concurrent_devices: usize,
    /// Whole-run timeout; 0 disables the watchdog.
    #[serde(default)]
    pub timeout_secs: u64,
    pub start: Option<String>,
    pub end: Option<String>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            aggregation: AggregatePolicy::default(),
            max_concurrent_devices: default_max_concurrent_devices(),
            timeout_secs: 0,
            start: None,
            end: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchSettings {
    /// Read payloads from files instead of HTTP when set.
    pub replay_dir: Option<PathBuf>,
    /// Save every fetched payload here when set.
    pub archive_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputSettings {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
        }
    }
}

fn default_interval_secs() -> u32 {
    60
}

fn default_max_concurrent_devices() -> usize {
    4
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read settings file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let settings: Settings = toml::from_str(&raw)?;
        Ok(settings)
    }

    /// Load the settings file when it exists, otherwise fall back to the
    /// built-in defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!(path = %path.display(), "No settings file, using defaults");
            Ok(Self::default())
        }
    }
}

/// Resolve the run window from optional start/end strings. Both must be given
/// or neither; with neither the window is yesterday [00:00, 24:00) UTC.
pub fn resolve_window(start: Option<&str>, end: Option<&str>) -> Result<RunWindow> {
    match (start, end) {
        (Some(s), Some(e)) => RunWindow::new(parse_instant(s)?, parse_instant(e)?),
        (None, None) => {
            let yesterday = Utc::now().date_naive() - Duration::days(1);
            let start = Utc.from_utc_datetime(&yesterday.and_time(NaiveTime::MIN));
            RunWindow::new(start, start + Duration::days(1))
        }
        _ => Err(PipelineError::Config(
            "Run window start and end must be given together".to_string(),
        )),
    }
}

/// Parse a window bound: RFC 3339, `%Y-%m-%dT%H:%M:%S` (taken as UTC) or a
/// bare `%Y-%m-%d` date (midnight UTC).
fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&t));
    }
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)));
    }
    Err(PipelineError::Config(format!(
        "Cannot parse '{raw}' as a timestamp (expected RFC 3339, YYYY-MM-DDTHH:MM:SS or YYYY-MM-DD)"
    )))
}
