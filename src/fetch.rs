use crate::config::{DeviceConfig, ManufacturerConfig};
use crate::error::{PipelineError, Result};
use crate::types::{FetchedPayload, RunWindow};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;

const URL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Produces raw payloads for one device over the run window. Implementations
/// number payloads in retrieval order; that number seeds the duplicate
/// tie-breaking sequence on every record.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_device(
        &self,
        man: &ManufacturerConfig,
        device: &DeviceConfig,
        window: &RunWindow,
    ) -> Result<FetchedPayload>;
}

/// Substitute the `{device}`, `{start}` and `{end}` placeholders of a
/// manufacturer endpoint template.
pub fn endpoint_url(template: &str, device: &DeviceConfig, window: &RunWindow) -> String {
    template
        .replace("{device}", &device.web_id)
        .replace("{start}", &window.start.format(URL_TIME_FORMAT).to_string())
        .replace("{end}", &window.end.format(URL_TIME_FORMAT).to_string())
}

/// `<manufacturer>_<device>_<day>.json`; the archive writes this layout and
/// the replay fetcher reads it back.
pub fn payload_file_name(manufacturer_id: &str, device_id: &str, window: &RunWindow) -> String {
    format!(
        "{}_{}_{}.json",
        manufacturer_id,
        device_id,
        window.start.format("%Y-%m-%d")
    )
}

/// Fetches payloads over HTTP from the manufacturer endpoints.
pub struct HttpFetcher {
    client: reqwest::Client,
    seq: AtomicU64,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            seq: AtomicU64::new(0),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_device(
        &self,
        man: &ManufacturerConfig,
        device: &DeviceConfig,
        window: &RunWindow,
    ) -> Result<FetchedPayload> {
        let url = endpoint_url(&man.properties.endpoint, device, window);
        tracing::debug!("Fetching {}", url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::Fetch(format!(
                "'{url}' returned HTTP {status}"
            )));
        }
        let bytes = response.bytes().await?.to_vec();
        Ok(FetchedPayload::new(
            bytes,
            self.seq.fetch_add(1, Ordering::SeqCst),
        ))
    }
}

/// Replays payloads saved by a previous run instead of talking to the
/// manufacturer APIs.
pub struct ReplayFetcher {
    dir: PathBuf,
    seq: AtomicU64,
}

impl ReplayFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seq: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Fetcher for ReplayFetcher {
    async fn fetch_device(
        &self,
        man: &ManufacturerConfig,
        device: &DeviceConfig,
        window: &RunWindow,
    ) -> Result<FetchedPayload> {
        let path = self
            .dir
            .join(payload_file_name(&man.manufacturer_id, &device.device_id, window));
        let bytes = fs::read(&path).await.map_err(|e| {
            PipelineError::Fetch(format!("Cannot read replay payload '{}': {}", path.display(), e))
        })?;
        Ok(FetchedPayload::new(
            bytes,
            self.seq.fetch_add(1, Ordering::SeqCst),
        ))
    }
}

/// Writes every fetched payload to disk, bytes verbatim, in the replay
/// layout.
pub struct PayloadArchive {
    dir: PathBuf,
}

impl PayloadArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn store(
        &self,
        manufacturer_id: &str,
        device_id: &str,
        window: &RunWindow,
        payload: &FetchedPayload,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await?;
        let path = self
            .dir
            .join(payload_file_name(manufacturer_id, device_id, window));
        fs::write(&path, &payload.bytes).await?;
        Ok(path)
    }
}
