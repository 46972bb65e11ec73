use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use aq_scraper::adapters::AdapterRegistry;
use aq_scraper::config::{resolve_window, Settings, StudyConfig};
use aq_scraper::fetch::{Fetcher, HttpFetcher, PayloadArchive, ReplayFetcher};
use aq_scraper::pipeline::{PipelineRunner, RunOptions};
use aq_scraper::sink::{CsvDirSink, OutputSink};
use aq_scraper::summary::render_ascii;
use aq_scraper::{logging, observability};

#[derive(Parser)]
#[command(name = "aq_scraper")]
#[command(about = "Air quality sensor data normalization and resampling pipeline")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, clean, and resample one window of measurements
    Run {
        /// Path to the study config
        #[arg(long, default_value = "devices.json")]
        config: PathBuf,
        /// Path to the settings file
        #[arg(long, default_value = "settings.toml")]
        settings: PathBuf,
        /// Specific manufacturers to run (comma-separated). Available: aeroqual, aqmesh, zephyr, quantaq
        #[arg(long)]
        manufacturers: Option<String>,
        /// Specific devices to run (comma-separated device ids)
        #[arg(long)]
        devices: Option<String>,
        /// Window start: RFC 3339, "YYYY-MM-DDTHH:MM:SS", or "YYYY-MM-DD"
        #[arg(long)]
        start: Option<String>,
        /// Window end, same formats as --start
        #[arg(long)]
        end: Option<String>,
        /// Read payloads from this directory instead of HTTP
        #[arg(long)]
        replay_dir: Option<PathBuf>,
        /// Directory for CSV tables and the run summary
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Print the Prometheus metrics snapshot after the run
        #[arg(long)]
        dump_metrics: bool,
    },
    /// Validate the study config and settings without fetching anything
    CheckConfig {
        /// Path to the study config
        #[arg(long, default_value = "devices.json")]
        config: PathBuf,
        /// Path to the settings file
        #[arg(long, default_value = "settings.toml")]
        settings: PathBuf,
    },
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|list| {
        list.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init_logging();
    if let Err(e) = observability::init() {
        warn!("Metrics recorder unavailable: {e}");
    }

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            settings,
            manufacturers,
            devices,
            start,
            end,
            replay_dir,
            output_dir,
            dump_metrics,
        } => {
            println!("🚀 Running measurement pipeline...");

            let mut settings = Settings::load_or_default(&settings)?;
            if start.is_some() {
                settings.run.start = start;
            }
            if end.is_some() {
                settings.run.end = end;
            }
            if replay_dir.is_some() {
                settings.fetch.replay_dir = replay_dir;
            }
            if let Some(dir) = output_dir {
                settings.output.dir = dir;
            }

            let study = StudyConfig::load(&config)?;
            let manufacturer_filter = split_list(manufacturers.as_deref());
            let device_filter = split_list(devices.as_deref());
            let study = if manufacturer_filter.is_empty() && device_filter.is_empty() {
                study
            } else {
                study.restrict(&manufacturer_filter, &device_filter)
            };
            if study.manufacturers.is_empty() {
                anyhow::bail!("No devices left after applying --manufacturers/--devices");
            }

            let window = resolve_window(settings.run.start.as_deref(), settings.run.end.as_deref())?;
            let options = RunOptions {
                window,
                interval_secs: settings.run.interval_secs,
                aggregation: settings.run.aggregation,
                max_concurrent_devices: settings.run.max_concurrent_devices,
                timeout_secs: settings.run.timeout_secs,
            };

            let fetcher: Arc<dyn Fetcher> = match &settings.fetch.replay_dir {
                Some(dir) => {
                    info!("Replaying payloads from {}", dir.display());
                    Arc::new(ReplayFetcher::new(dir.clone()))
                }
                None => Arc::new(HttpFetcher::new()),
            };

            let mut runner = PipelineRunner::new(study, options, AdapterRegistry::new(), fetcher);
            if let Some(dir) = &settings.fetch.archive_dir {
                runner = runner.with_archive(PayloadArchive::new(dir.clone()));
            }

            let cancel = runner.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received, cancelling run");
                    cancel.cancel();
                }
            });

            let output = runner.run().await?;

            let sink = CsvDirSink::new(settings.output.dir.clone());
            for table in &output.tables {
                sink.write_table(table, &window).await?;
            }
            sink.write_summary(&output.summary).await?;

            for line in render_ascii(&output.summary) {
                println!("{line}");
            }

            let failed = output.summary.failed_devices();
            let zero_valid = output.summary.zero_valid_devices();
            println!("\n📊 Run results:");
            println!("   Devices: {}", output.summary.device_count());
            println!("   Failed: {}", failed.len());
            println!("   Tables written: {}", output.tables.len());
            println!("   Output dir: {}", settings.output.dir.display());
            if !failed.is_empty() {
                warn!("{} devices failed during the run", failed.len());
                println!("\n⚠️  Failed devices:");
                for (manufacturer, device) in &failed {
                    println!(
                        "   - {}/{}: {}",
                        manufacturer,
                        device.device_id,
                        device.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            if !zero_valid.is_empty() {
                println!("\n⚠️  Devices with no valid measurements:");
                for (manufacturer, device) in &zero_valid {
                    println!("   - {}/{}", manufacturer, device.device_id);
                }
            }

            if dump_metrics {
                if let Some(snapshot) = observability::render() {
                    println!("\n{snapshot}");
                }
            }
        }
        Commands::CheckConfig { config, settings } => {
            let study = StudyConfig::load(&config)?;
            println!("Study config '{}':", config.display());
            for man in &study.manufacturers {
                println!(
                    "   {} ({}): {} devices, {} fields",
                    man.display_name,
                    man.manufacturer_id,
                    man.devices.len(),
                    man.fields.len()
                );
            }
            let settings = Settings::load_or_default(&settings)?;
            let window = resolve_window(settings.run.start.as_deref(), settings.run.end.as_deref())?;
            println!(
                "   Window {} at {}s resolution, {} aggregation",
                window, settings.run.interval_secs, settings.run.aggregation
            );
            println!("✅ Configuration OK");
        }
    }
    Ok(())
}
