use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{begin_job, elapsed_ms, publish_failure, publish_success};
use crate::catalog::CatalogStore;
use crate::fetch::{FetchError, HttpFetcher};
use crate::jobs::{DownloadJobPayload, DownloadResult, JobType};
use crate::queue::{Delivery, HandlerError, JobHandler, JobQueue};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("download failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Streams static episode media into the download directory
pub struct DownloadWorker {
    catalog: Arc<dyn CatalogStore>,
    queue: Arc<JobQueue>,
    fetcher: Arc<dyn HttpFetcher>,
    download_dir: PathBuf,
}

impl DownloadWorker {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        queue: Arc<JobQueue>,
        fetcher: Arc<dyn HttpFetcher>,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            catalog,
            queue,
            fetcher,
            download_dir: download_dir.into(),
        }
    }

    async fn download(&self, payload: &DownloadJobPayload) -> Result<DownloadResult, DownloadError> {
        let started = Instant::now();
        fs::create_dir_all(&self.download_dir).await?;

        let output_path = self.download_dir.join(Uuid::new_v4().to_string());
        debug!(job_id = %payload.job_id, output = %output_path.display(), "Downloading");

        match self.stream_to(&payload.target_url, &output_path).await {
            Ok(size) => Ok(DownloadResult {
                size,
                output_path: output_path.to_string_lossy().to_string(),
                spent: elapsed_ms(started),
            }),
            Err(err) => {
                remove_partial(&output_path).await;
                Err(err)
            }
        }
    }

    async fn stream_to(&self, url: &str, path: &Path) -> Result<u64, DownloadError> {
        let mut file = fs::File::create(path).await?;
        self.fetcher.download_to(url, &mut file).await?;
        file.sync_all().await?;
        drop(file);
        Ok(fs::metadata(path).await?.len())
    }
}

async fn remove_partial(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed partial download"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove partial download"),
    }
}

#[async_trait]
impl JobHandler for DownloadWorker {
    type Payload = DownloadJobPayload;

    async fn handle(&self, payload: DownloadJobPayload, delivery: &Delivery) -> Result<(), HandlerError> {
        if !begin_job(
            self.catalog.as_ref(),
            &self.queue,
            delivery,
            JobType::Download,
            &payload.job_id,
        )
        .await?
        {
            return Ok(());
        }

        match self.download(&payload).await {
            Ok(result) => {
                info!(
                    job_id = %payload.job_id,
                    size = result.size,
                    output = %result.output_path,
                    "Download completed"
                );
                let published =
                    publish_success(&self.queue, delivery, JobType::Download, &payload.job_id, &result);
                if published.is_err() {
                    // The retry downloads into a fresh file
                    remove_partial(Path::new(&result.output_path)).await;
                }
                published
            }
            Err(err) => Err(publish_failure(
                &self.queue,
                delivery,
                JobType::Download,
                &payload.job_id,
                HandlerError::retryable(err),
            )),
        }
    }
}
