use anyhow::Result;
use std::fs;
use std::sync::Arc;
use tempfile::tempdir;

use aq_scraper::adapters::AdapterRegistry;
use aq_scraper::config::{resolve_window, StudyConfig};
use aq_scraper::fetch::{PayloadArchive, ReplayFetcher};
use aq_scraper::pipeline::{PipelineRunner, RunOptions};
use aq_scraper::sink::{CsvDirSink, OutputSink};
use aq_scraper::summary::{DeviceState, RunSummary};
use aq_scraper::types::AggregatePolicy;

const STUDY_JSON: &str = r#"{
    "study_name": "kerbside-2024",
    "manufacturers": [
        {
            "manufacturer_id": "aeroqual",
            "display_name": "Aeroqual",
            "properties": {
                "timestamp_column": "Time",
                "timestamp_format": "%Y-%m-%d %H:%M:%S",
                "endpoint": "https://api.example.com/aeroqual/{device}/{start}/{end}",
                "lines_skip": 2
            },
            "fields": [
                {
                    "field_id": "pm2_5",
                    "web_id": "PM2.5",
                    "scale": 1.0,
                    "range": { "min": 0.0, "max": 1000.0 }
                },
                {
                    "field_id": "no2",
                    "web_id": "NO2",
                    "scale": 1000.0,
                    "range": { "min": 0.0, "max": 10000.0 }
                }
            ],
            "devices": [
                { "device_id": "aqy-1", "web_id": "AQY-001", "location": "kerbside" },
                { "device_id": "aqy-2", "web_id": "AQY-002", "location": "rooftop" }
            ]
        },
        {
            "manufacturer_id": "aqmesh",
            "display_name": "AQMesh",
            "properties": {
                "timestamp_column": "Timestamp",
                "timestamp_format": "%Y-%m-%dT%H:%M:%S",
                "endpoint": "https://api.example.com/aqmesh/{device}/{start}/{end}"
            },
            "fields": [
                {
                    "field_id": "pm2_5",
                    "web_id": "PM2.5",
                    "scale": 1.0,
                    "range": { "min": 0.0, "max": 1000.0 }
                }
            ],
            "devices": [
                { "device_id": "mesh-1", "web_id": "2450100" }
            ]
        }
    ]
}"#;

const AEROQUAL_PAYLOAD: &str = "\
Instrument serial,AQY-001
Averaging period,1 minute
Time,PM2.5,NO2
2024-03-01 10:00:00,12.5,0.25
2024-03-01 10:30:00,14.5,0.5
not a time,1.0,1.0
";

const AQMESH_PAYLOAD: &str = r#"{
    "0": {
        "Timestamp": { "Timestamp": "2024-03-01T05:00:00" },
        "Channels": [
            { "SensorLabel": "PM2.5", "Scaled": { "Reading": 7.0 } }
        ]
    }
}"#;

fn hourly_options() -> Result<RunOptions> {
    Ok(RunOptions {
        window: resolve_window(Some("2024-03-01"), Some("2024-03-02"))?,
        interval_secs: 3600,
        aggregation: AggregatePolicy::Mean,
        max_concurrent_devices: 4,
        timeout_secs: 0,
    })
}

#[tokio::test]
async fn test_replay_run_builds_stable_tables_with_failed_device() -> Result<()> {
    let temp_dir = tempdir()?;
    let payload_dir = temp_dir.path().join("payloads");
    fs::create_dir_all(&payload_dir)?;
    fs::write(payload_dir.join("aeroqual_aqy-1_2024-03-01.json"), AEROQUAL_PAYLOAD)?;
    fs::write(payload_dir.join("aqmesh_mesh-1_2024-03-01.json"), AQMESH_PAYLOAD)?;
    // no payload for aqy-2, its fetch must fail

    let study_path = temp_dir.path().join("devices.json");
    fs::write(&study_path, STUDY_JSON)?;
    let study = StudyConfig::load(&study_path)?;

    let options = hourly_options()?;
    let runner = PipelineRunner::new(
        study,
        options,
        AdapterRegistry::new(),
        Arc::new(ReplayFetcher::new(payload_dir)),
    );
    let out = runner.run().await?;

    // tables come out in config order with every configured column present
    assert_eq!(out.tables.len(), 2);
    let aeroqual = &out.tables[0];
    assert_eq!(aeroqual.manufacturer_id, "aeroqual");
    let labels: Vec<&str> = aeroqual.columns.iter().map(|c| c.label.as_str()).collect();
    assert_eq!(
        labels,
        vec!["no2_aqy-1", "no2_aqy-2", "pm2_5_aqy-1", "pm2_5_aqy-2"]
    );
    assert_eq!(aeroqual.index.len(), 24);

    // both 10:xx rows land in the 10:00 bucket and average
    let pm = &aeroqual.columns[2];
    assert_eq!(pm.values[10], Some(13.5));
    assert_eq!(pm.values.iter().flatten().count(), 1);
    let no2 = &aeroqual.columns[0];
    assert_eq!(no2.values[10], Some(375.0));

    // the failed device keeps its columns, all empty
    for column in aeroqual.columns.iter().filter(|c| c.device_id == "aqy-2") {
        assert!(column.values.iter().all(|v| v.is_none()));
    }

    let aqmesh = &out.tables[1];
    assert_eq!(aqmesh.columns.len(), 1);
    assert_eq!(aqmesh.columns[0].values[5], Some(7.0));

    let aqy_1 = &out.summary.manufacturers[0].devices[0];
    assert_eq!(aqy_1.state, DeviceState::Done);
    assert_eq!(aqy_1.total_records, 4);
    assert_eq!(aqy_1.valid_records, 4);
    assert_eq!(aqy_1.warnings.bad_timestamps, 1);
    assert_eq!(aqy_1.rejections.total(), 0);
    assert!(aqy_1.payload_sha256.is_some());

    let aqy_2 = &out.summary.manufacturers[0].devices[1];
    assert_eq!(aqy_2.state, DeviceState::Failed);
    assert!(aqy_2.error.as_deref().unwrap().contains("Fetch failed"));
    assert_eq!(out.summary.failed_devices().len(), 1);

    // the CSV sink writes one file per table plus the summary
    let out_dir = temp_dir.path().join("output");
    let sink = CsvDirSink::new(&out_dir);
    for table in &out.tables {
        sink.write_table(table, &options.window).await?;
    }
    sink.write_summary(&out.summary).await?;

    let csv = fs::read_to_string(out_dir.join("aeroqual_2024-03-01_2024-03-02.csv"))?;
    let mut lines = csv.lines();
    assert_eq!(
        lines.next(),
        Some("timestamp,no2_aqy-1,no2_aqy-2,pm2_5_aqy-1,pm2_5_aqy-2")
    );
    assert_eq!(csv.lines().count(), 25);
    assert!(out_dir.join("run_summary_2024-03-01.json").exists());

    Ok(())
}

#[tokio::test]
async fn test_device_with_no_records_is_done_and_reportable() -> Result<()> {
    let temp_dir = tempdir()?;
    let payload_dir = temp_dir.path().join("payloads");
    fs::create_dir_all(&payload_dir)?;
    // header only, no measurement rows
    fs::write(
        payload_dir.join("aeroqual_aqy-1_2024-03-01.json"),
        "Instrument serial,AQY-001\nAveraging period,1 minute\nTime,PM2.5,NO2\n",
    )?;

    let study = StudyConfig::from_json_str(STUDY_JSON)?
        .restrict(&["aeroqual".to_string()], &["aqy-1".to_string()]);
    let runner = PipelineRunner::new(
        study,
        hourly_options()?,
        AdapterRegistry::new(),
        Arc::new(ReplayFetcher::new(payload_dir)),
    );
    let out = runner.run().await?;

    let device = &out.summary.manufacturers[0].devices[0];
    assert_eq!(device.state, DeviceState::Done);
    assert_eq!(device.valid_records, 0);
    assert_eq!(out.summary.zero_valid_devices().len(), 1);
    assert!(out.summary.failed_devices().is_empty());

    // an empty device still gets its columns, with no values
    assert_eq!(out.tables[0].columns.len(), 2);
    for column in &out.tables[0].columns {
        assert!(column.values.iter().all(|v| v.is_none()));
    }

    Ok(())
}

#[tokio::test]
async fn test_archived_payloads_replay_identically() -> Result<()> {
    let temp_dir = tempdir()?;
    let source_dir = temp_dir.path().join("source");
    let archive_dir = temp_dir.path().join("archive");
    fs::create_dir_all(&source_dir)?;
    fs::write(source_dir.join("aqmesh_mesh-1_2024-03-01.json"), AQMESH_PAYLOAD)?;

    let study = StudyConfig::from_json_str(STUDY_JSON)?.restrict(&["aqmesh".to_string()], &[]);
    let options = hourly_options()?;

    let first = PipelineRunner::new(
        study.clone(),
        options,
        AdapterRegistry::new(),
        Arc::new(ReplayFetcher::new(&source_dir)),
    )
    .with_archive(PayloadArchive::new(&archive_dir));
    let first_out = first.run().await?;

    let archived = archive_dir.join("aqmesh_mesh-1_2024-03-01.json");
    assert_eq!(fs::read_to_string(&archived)?, AQMESH_PAYLOAD);

    let second = PipelineRunner::new(
        study,
        options,
        AdapterRegistry::new(),
        Arc::new(ReplayFetcher::new(&archive_dir)),
    );
    let second_out = second.run().await?;

    assert_eq!(
        first_out.tables[0].columns[0].values,
        second_out.tables[0].columns[0].values
    );
    assert_eq!(
        first_out.summary.manufacturers[0].devices[0].payload_sha256,
        second_out.summary.manufacturers[0].devices[0].payload_sha256
    );

    Ok(())
}

#[tokio::test]
async fn test_run_summary_round_trips_through_json() -> Result<()> {
    let temp_dir = tempdir()?;
    let payload_dir = temp_dir.path().join("payloads");
    fs::create_dir_all(&payload_dir)?;
    fs::write(payload_dir.join("aqmesh_mesh-1_2024-03-01.json"), AQMESH_PAYLOAD)?;

    let study = StudyConfig::from_json_str(STUDY_JSON)?.restrict(&["aqmesh".to_string()], &[]);
    let runner = PipelineRunner::new(
        study,
        hourly_options()?,
        AdapterRegistry::new(),
        Arc::new(ReplayFetcher::new(payload_dir)),
    );
    let out = runner.run().await?;

    let out_dir = temp_dir.path().join("output");
    CsvDirSink::new(&out_dir).write_summary(&out.summary).await?;

    let raw = fs::read_to_string(out_dir.join("run_summary_2024-03-01.json"))?;
    let loaded: RunSummary = serde_json::from_str(&raw)?;
    assert_eq!(loaded.run_id, out.summary.run_id);
    assert_eq!(loaded.interval_secs, 3600);
    assert_eq!(loaded.manufacturers[0].devices[0].state, DeviceState::Done);
    assert_eq!(loaded.manufacturers[0].devices[0].field_valid.get("pm2_5"), Some(&1));

    Ok(())
}
