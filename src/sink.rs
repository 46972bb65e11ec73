use crate::error::Result;
use crate::summary::RunSummary;
use crate::types::{RunWindow, WideTable};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::fs;

const CSV_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FILE_DATE_FORMAT: &str = "%Y-%m-%d";

/// Receives the finished analysis tables and the run summary.
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn write_table(&self, table: &WideTable, window: &RunWindow) -> Result<()>;
    async fn write_summary(&self, summary: &RunSummary) -> Result<()>;
}

/// Writes one CSV file per manufacturer table plus the run summary JSON into
/// a directory.
pub struct CsvDirSink {
    dir: PathBuf,
}

impl CsvDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn table_file_name(table: &WideTable, window: &RunWindow) -> String {
        format!(
            "{}_{}_{}.csv",
            table.manufacturer_id,
            window.start.format(FILE_DATE_FORMAT),
            window.end.format(FILE_DATE_FORMAT)
        )
    }

    fn render_csv(table: &WideTable) -> String {
        let mut out = String::from("timestamp");
        for column in &table.columns {
            out.push(',');
            out.push_str(&column.label);
        }
        out.push('\n');

        for (row, timestamp) in table.index.iter().enumerate() {
            out.push_str(&timestamp.format(CSV_TIME_FORMAT).to_string());
            for column in &table.columns {
                out.push(',');
                // no-data stays an empty cell
                if let Some(value) = column.values[row] {
                    out.push_str(&value.to_string());
                }
            }
            out.push('\n');
        }
        out
    }
}

#[async_trait]
impl OutputSink for CsvDirSink {
    async fn write_table(&self, table: &WideTable, window: &RunWindow) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(Self::table_file_name(table, window));
        fs::write(&path, Self::render_csv(table)).await?;
        tracing::info!(
            "Wrote {} rows x {} columns to {}",
            table.index.len(),
            table.columns.len(),
            path.display()
        );
        Ok(())
    }

    async fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!(
            "run_summary_{}.json",
            summary.window.start.format(FILE_DATE_FORMAT)
        ));
        fs::write(&path, serde_json::to_string_pretty(summary)?).await?;
        tracing::info!("Wrote run summary to {}", path.display());
        Ok(())
    }
}

/// Collects outputs in memory for tests.
#[derive(Default)]
pub struct MemorySink {
    tables: Mutex<Vec<WideTable>>,
    summaries: Mutex<Vec<RunSummary>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tables(&self) -> Vec<WideTable> {
        self.tables.lock().unwrap().clone()
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        self.summaries.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn write_table(&self, table: &WideTable, _window: &RunWindow) -> Result<()> {
        self.tables.lock().unwrap().push(table.clone());
        Ok(())
    }

    async fn write_summary(&self, summary: &RunSummary) -> Result<()> {
        self.summaries.lock().unwrap().push(summary.clone());
        Ok(())
    }
}
