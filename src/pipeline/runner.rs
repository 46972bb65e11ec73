use crate::adapters::AdapterRegistry;
use crate::config::StudyConfig;
use crate::error::{PipelineError, Result};
use crate::fetch::{Fetcher, PayloadArchive};
use crate::observability;
use crate::pipeline::{pivot, resample, validate};
use crate::summary::{DeviceState, DeviceSummary, ManufacturerSummary, RunSummary};
use crate::types::{
    AggregatePolicy, CanonicalRecord, ResampledSeries, RunWindow, SamplingGrid, WideTable,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Shared cancellation flag, observed at every stage boundary of every
/// device pipeline.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub window: RunWindow,
    pub interval_secs: u32,
    pub aggregation: AggregatePolicy,
    /// Global bound on concurrently running device pipelines; manufacturers
    /// can override it downwards or upwards in their config.
    pub max_concurrent_devices: usize,
    /// Whole-run timeout in seconds; 0 disables the watchdog.
    pub timeout_secs: u64,
}

#[derive(Debug)]
pub struct RunOutput {
    pub tables: Vec<WideTable>,
    pub summary: RunSummary,
}

/// Runs the whole pipeline for one study: per manufacturer, one task per
/// device (fetch, parse, clean, resample), then the pivot once all device
/// tasks joined.
pub struct PipelineRunner {
    study: Arc<StudyConfig>,
    options: RunOptions,
    adapters: Arc<AdapterRegistry>,
    fetcher: Arc<dyn Fetcher>,
    archive: Option<Arc<PayloadArchive>>,
    cancel: CancelFlag,
}

impl PipelineRunner {
    pub fn new(
        study: StudyConfig,
        options: RunOptions,
        adapters: AdapterRegistry,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            study: Arc::new(study),
            options,
            adapters: Arc::new(adapters),
            fetcher,
            archive: None,
            cancel: CancelFlag::new(),
        }
    }

    /// Save every fetched payload under the archive directory.
    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(Arc::new(archive));
        self
    }

    /// Handle for cancelling the run from outside (signal handlers, tests).
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub async fn run(&self) -> Result<RunOutput> {
        let started_at = Utc::now();
        let started = Instant::now();
        let grid = SamplingGrid::new(&self.options.window, self.options.interval_secs)?;

        if self.study.manufacturers.is_empty() {
            return Err(PipelineError::Config(
                "Study has no manufacturers to run".to_string(),
            ));
        }
        // a configured manufacturer without an adapter is a config defect,
        // caught before any device work starts
        for man in &self.study.manufacturers {
            if self.adapters.get(&man.manufacturer_id).is_none() {
                return Err(PipelineError::Config(format!(
                    "No adapter registered for manufacturer '{}'",
                    man.manufacturer_id
                )));
            }
        }

        info!(
            "Starting run over {} for {} devices at {}s resolution",
            self.options.window,
            self.study.device_count(),
            self.options.interval_secs
        );

        let watchdog = if self.options.timeout_secs > 0 {
            let cancel = self.cancel.clone();
            let timeout = Duration::from_secs(self.options.timeout_secs);
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!("Run timeout of {}s reached, cancelling", timeout.as_secs());
                cancel.cancel();
            }))
        } else {
            None
        };

        let mut tables = Vec::new();
        let mut manufacturers = Vec::new();
        for man_idx in 0..self.study.manufacturers.len() {
            let (table, man_summary) = self.run_manufacturer(man_idx, &grid).await;
            tables.push(table);
            manufacturers.push(man_summary);
        }

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let summary = RunSummary {
            run_id: Uuid::new_v4(),
            window: self.options.window,
            interval_secs: self.options.interval_secs,
            aggregation: self.options.aggregation,
            started_at,
            finished_at: Utc::now(),
            manufacturers,
        };
        observability::run::duration_seconds(started.elapsed().as_secs_f64());
        observability::run::devices_failed(summary.failed_devices().len());

        Ok(RunOutput { tables, summary })
    }

    #[instrument(skip(self, grid), fields(manufacturer = %self.study.manufacturers[man_idx].manufacturer_id))]
    async fn run_manufacturer(
        &self,
        man_idx: usize,
        grid: &SamplingGrid,
    ) -> (WideTable, ManufacturerSummary) {
        let man = &self.study.manufacturers[man_idx];
        let limit = man
            .max_concurrent_devices
            .unwrap_or(self.options.max_concurrent_devices)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        let mut join_set = JoinSet::new();
        for device_idx in 0..man.devices.len() {
            join_set.spawn(run_device(DeviceRun {
                study: Arc::clone(&self.study),
                man_idx,
                device_idx,
                grid: grid.clone(),
                window: self.options.window,
                aggregation: self.options.aggregation,
                adapters: Arc::clone(&self.adapters),
                fetcher: Arc::clone(&self.fetcher),
                archive: self.archive.clone(),
                semaphore: Arc::clone(&semaphore),
                cancel: self.cancel.clone(),
            }));
        }

        // joining every device task is the barrier before the pivot
        let mut outcomes: Vec<Option<DeviceOutcome>> =
            (0..man.devices.len()).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => {
                    let idx = outcome.device_idx;
                    outcomes[idx] = Some(outcome);
                }
                Err(e) => error!("Device task panicked: {e}"),
            }
        }

        let mut series = Vec::new();
        let mut devices = Vec::new();
        for (idx, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Some(o) => {
                    series.extend(o.series);
                    devices.push(o.summary);
                }
                None => {
                    let mut fallback = DeviceSummary::new(&man.devices[idx]);
                    fallback.fail("device task panicked");
                    devices.push(fallback);
                }
            }
        }

        let table = pivot::pivot_manufacturer(man, grid, &series);
        observability::pivot::table_written(table.columns.len());
        info!(
            "📊 Built {} table: {} rows x {} columns",
            man.manufacturer_id,
            table.index.len(),
            table.columns.len()
        );

        let man_summary = ManufacturerSummary {
            manufacturer_id: man.manufacturer_id.clone(),
            display_name: man.display_name.clone(),
            table_rows: table.index.len(),
            table_columns: table.columns.len(),
            devices,
        };
        (table, man_summary)
    }
}

struct DeviceRun {
    study: Arc<StudyConfig>,
    man_idx: usize,
    device_idx: usize,
    grid: SamplingGrid,
    window: RunWindow,
    aggregation: AggregatePolicy,
    adapters: Arc<AdapterRegistry>,
    fetcher: Arc<dyn Fetcher>,
    archive: Option<Arc<PayloadArchive>>,
    semaphore: Arc<Semaphore>,
    cancel: CancelFlag,
}

struct DeviceOutcome {
    device_idx: usize,
    summary: DeviceSummary,
    series: Vec<ResampledSeries>,
}

#[instrument(skip_all, fields(device = %ctx.study.manufacturers[ctx.man_idx].devices[ctx.device_idx].device_id))]
async fn run_device(ctx: DeviceRun) -> DeviceOutcome {
    let man = &ctx.study.manufacturers[ctx.man_idx];
    let device = &man.devices[ctx.device_idx];
    let mut summary = DeviceSummary::new(device);
    let fail = |mut summary: DeviceSummary, error: String| {
        summary.fail(error);
        DeviceOutcome {
            device_idx: ctx.device_idx,
            summary,
            series: Vec::new(),
        }
    };

    let _permit = match ctx.semaphore.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return fail(summary, "device scheduling stopped".to_string()),
    };

    if ctx.cancel.is_cancelled() {
        return fail(summary, "run cancelled before fetch".to_string());
    }

    let fetch_started = Instant::now();
    let payload = match ctx.fetcher.fetch_device(man, device, &ctx.window).await {
        Ok(payload) => {
            observability::fetch::success(&man.manufacturer_id);
            observability::fetch::duration_seconds(fetch_started.elapsed().as_secs_f64());
            observability::fetch::payload_bytes(payload.bytes.len());
            payload
        }
        Err(e) => {
            observability::fetch::error(&man.manufacturer_id);
            warn!("Fetch failed for device {}: {}", device.device_id, e);
            return fail(summary, e.to_string());
        }
    };
    summary.state = DeviceState::Fetched;
    summary.payload_sha256 = Some(payload.sha256.clone());

    if let Some(archive) = &ctx.archive {
        if let Err(e) = archive
            .store(&man.manufacturer_id, &device.device_id, &ctx.window, &payload)
            .await
        {
            warn!("Could not archive payload for device {}: {}", device.device_id, e);
        }
    }

    if ctx.cancel.is_cancelled() {
        return fail(summary, "run cancelled after fetch".to_string());
    }

    // presence was checked before the run started
    let Some(adapter) = ctx.adapters.get(&man.manufacturer_id) else {
        return fail(
            summary,
            format!("no adapter registered for '{}'", man.manufacturer_id),
        );
    };
    let parsed = match adapter.parse(&payload, device, &man.fields, &man.properties) {
        Ok(parsed) => parsed,
        Err(e) => {
            observability::adapter::parse_error(&man.manufacturer_id);
            warn!("Parse failed for device {}: {}", device.device_id, e);
            return fail(summary, e.to_string());
        }
    };
    summary.state = DeviceState::Parsed;
    summary.total_records = parsed.records.len();
    summary.warnings = parsed.warnings;
    observability::adapter::records(&man.manufacturer_id, summary.total_records);
    observability::adapter::warnings(
        &man.manufacturer_id,
        summary.warnings.unknown_fields.len()
            + summary.warnings.unknown_devices.len()
            + summary.warnings.bad_timestamps,
    );
    if !summary.warnings.is_empty() {
        info!(
            "Device {} parse warnings: {} unknown fields, {} unknown devices, {} bad timestamps",
            device.device_id,
            summary.warnings.unknown_fields.len(),
            summary.warnings.unknown_devices.len(),
            summary.warnings.bad_timestamps
        );
    }

    if ctx.cancel.is_cancelled() {
        return fail(summary, "run cancelled after parse".to_string());
    }

    let mut records_by_field: HashMap<String, Vec<CanonicalRecord>> = HashMap::new();
    for record in parsed.records {
        records_by_field
            .entry(record.field_id.clone())
            .or_default()
            .push(record);
    }

    let mut cleaned = Vec::new();
    for field in &man.fields {
        let records = records_by_field.remove(&field.field_id).unwrap_or_default();
        let outcome = validate::clean_series(&device.device_id, field, records, &ctx.window);
        let valid = outcome.series.records.len();
        summary.valid_records += valid;
        summary.rejections.merge(&outcome.counts);
        observability::validate::valid(valid);
        observability::validate::rejected("non_numeric", outcome.counts.non_numeric);
        observability::validate::rejected("out_of_range", outcome.counts.out_of_range);
        observability::validate::rejected("outside_window", outcome.counts.outside_window);
        observability::validate::rejected("duplicate", outcome.counts.duplicate);
        cleaned.push(outcome.series);
    }
    summary.state = DeviceState::Cleaned;

    if ctx.cancel.is_cancelled() {
        return fail(summary, "run cancelled after validation".to_string());
    }

    let mut series = Vec::new();
    for one in &cleaned {
        let resampled = resample::resample(one, &ctx.grid, ctx.aggregation);
        let filled = resampled.values.iter().filter(|v| v.is_some()).count();
        observability::resample::buckets(filled, resampled.values.len() - filled);
        // availability is counted in filled grid buckets, the cadence the
        // summary table's capacity is in
        if filled > 0 {
            summary.field_valid.insert(resampled.field_id.clone(), filled);
        }
        series.push(resampled);
    }
    summary.state = DeviceState::Resampled;

    summary.state = DeviceState::Done;
    info!(
        "✅ Device {} done: {} of {} records valid",
        device.device_id, summary.valid_records, summary.total_records
    );
    DeviceOutcome {
        device_idx: ctx.device_idx,
        summary,
        series,
    }
}
