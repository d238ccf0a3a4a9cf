//! Decides which jobs should exist from catalog state
//!
//! A pass lists every channel and the most recent episodes, persists a Job row
//! for each emission and only then enqueues the payload. Emission failures are
//! collected in the [`ProduceReport`] instead of aborting the pass.

mod reconcile;
mod scheduler;

pub use reconcile::{ReconcileReport, Reconciler, ReconcilerSettings};
pub use scheduler::{DEFAULT_PRODUCE_INTERVAL, ProduceScheduler};

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{
    CatalogError, CatalogStore, Channel, Episode, EpisodeType, Job, JobStatus, new_id,
};
use crate::jobs::{
    CrawlJobPayload, CrawlType, DownloadJobPayload, JobType, RecordJobParams,
    RecordReserveJobPayload,
};
use crate::queue::{EnqueueOptions, JobQueue, QueueError};

pub const DEFAULT_EPISODE_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum ProduceError {
    /// Reading catalog state failed; the whole pass is abandoned
    #[error("catalog read failed: {0}")]
    CatalogRead(#[source] CatalogError),
    #[error("catalog write failed: {0}")]
    CatalogWrite(#[source] CatalogError),
    #[error("enqueue failed: {0}")]
    Queue(#[from] QueueError),
    #[error("payload encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProduceError>;

/// Outcome of one producer pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceReport {
    pub crawl: usize,
    pub download: usize,
    pub record_reserve: usize,
    /// One line per emission that failed
    pub failures: Vec<String>,
}

impl ProduceReport {
    pub fn emitted(&self) -> usize {
        self.crawl + self.download + self.record_reserve
    }
}

pub struct Producer {
    catalog: Arc<dyn CatalogStore>,
    queue: Arc<JobQueue>,
    episode_limit: usize,
}

impl Producer {
    pub fn new(catalog: Arc<dyn CatalogStore>, queue: Arc<JobQueue>, episode_limit: usize) -> Self {
        Self {
            catalog,
            queue,
            episode_limit,
        }
    }

    /// Run one pass over channels and recent episodes
    pub async fn produce_all(&self) -> Result<ProduceReport> {
        let channels = self
            .catalog
            .list_channels()
            .await
            .map_err(ProduceError::CatalogRead)?;
        let episodes = self
            .catalog
            .list_recent_episodes(self.episode_limit)
            .await
            .map_err(ProduceError::CatalogRead)?;

        let mut report = ProduceReport::default();

        for channel in &channels {
            match self.emit_crawl(channel).await {
                Ok(()) => report.crawl += 1,
                Err(err) => {
                    warn!(channel_id = %channel.id, error = %err, "Failed to emit crawl job");
                    report.failures.push(format!("crawl {}: {err}", channel.id));
                }
            }
        }

        let now = Utc::now();
        for episode in &episodes {
            match episode.episode_type {
                EpisodeType::Static => {
                    if episode.is_downloaded() {
                        continue;
                    }
                    match self.emit_download(episode).await {
                        Ok(true) => report.download += 1,
                        Ok(false) => {}
                        Err(err) => {
                            warn!(episode_id = %episode.id, error = %err, "Failed to emit download job");
                            report.failures.push(format!("download {}: {err}", episode.id));
                        }
                    }
                }
                EpisodeType::Live => {
                    let Some(scheduled_at) = episode.scheduled_at else {
                        continue;
                    };
                    if scheduled_at <= now {
                        continue;
                    }
                    match self.emit_record_reserve(episode, scheduled_at).await {
                        Ok(true) => report.record_reserve += 1,
                        Ok(false) => {}
                        Err(err) => {
                            warn!(episode_id = %episode.id, error = %err, "Failed to emit record reservation");
                            report
                                .failures
                                .push(format!("record-reserve {}: {err}", episode.id));
                        }
                    }
                }
            }
        }

        info!(
            channels = channels.len(),
            episodes = episodes.len(),
            crawl = report.crawl,
            download = report.download,
            record_reserve = report.record_reserve,
            failures = report.failures.len(),
            "Produce pass finished"
        );
        Ok(report)
    }

    async fn emit_crawl(&self, channel: &Channel) -> Result<()> {
        let job_id = new_id();
        let payload = CrawlJobPayload {
            job_id: job_id.clone(),
            target_url: channel.rss_url.clone(),
            crawl_type: CrawlType::Rss,
        };
        let job = Job::pending(job_id.clone(), JobType::Crawl, serde_json::to_value(&payload)?)
            .with_channel(&channel.id);
        self.persist_and_enqueue(job, JobType::Crawl, &payload).await
    }

    /// Returns `false` when a download for the episode is already queued or running
    async fn emit_download(&self, episode: &Episode) -> Result<bool> {
        if self
            .has_job(&episode.id, JobType::Download, |status| {
                matches!(status, JobStatus::Pending | JobStatus::Working)
            })
            .await?
        {
            debug!(episode_id = %episode.id, "Download already in progress");
            return Ok(false);
        }

        let job_id = new_id();
        let payload = DownloadJobPayload {
            job_id: job_id.clone(),
            target_url: episode.audio_url.clone(),
        };
        let job = Job::pending(job_id.clone(), JobType::Download, serde_json::to_value(&payload)?)
            .with_episode(&episode.id);
        self.persist_and_enqueue(job, JobType::Download, &payload)
            .await?;
        Ok(true)
    }

    /// Returns `false` when the episode already has a live reservation
    async fn emit_record_reserve(
        &self,
        episode: &Episode,
        scheduled_at: chrono::DateTime<Utc>,
    ) -> Result<bool> {
        if self
            .has_job(&episode.id, JobType::RecordReserve, |status| {
                status != JobStatus::Error
            })
            .await?
        {
            debug!(episode_id = %episode.id, "Recording already reserved");
            return Ok(false);
        }

        let job_id = new_id();
        let payload = RecordReserveJobPayload {
            job_id: job_id.clone(),
            record_job_params: RecordJobParams {
                episode_id: episode.id.clone(),
                stream_url: episode.audio_url.clone(),
                start_time: scheduled_at,
                duration: episode.duration_secs,
            },
        };
        let job = Job::pending(
            job_id.clone(),
            JobType::RecordReserve,
            serde_json::to_value(&payload)?,
        )
        .with_episode(&episode.id);
        self.persist_and_enqueue(job, JobType::RecordReserve, &payload)
            .await?;
        Ok(true)
    }

    async fn has_job(
        &self,
        episode_id: &str,
        job_type: JobType,
        matches: impl Fn(JobStatus) -> bool,
    ) -> Result<bool> {
        let jobs = self
            .catalog
            .jobs_for_episode(episode_id)
            .await
            .map_err(ProduceError::CatalogRead)?;
        Ok(jobs
            .iter()
            .any(|job| job.job_type == job_type && matches(job.status)))
    }

    async fn persist_and_enqueue<T: Serialize>(
        &self,
        job: Job,
        job_type: JobType,
        payload: &T,
    ) -> Result<()> {
        self.catalog
            .create_job(&job)
            .await
            .map_err(ProduceError::CatalogWrite)?;
        let seq = self
            .queue
            .enqueue(job_type, payload, EnqueueOptions::for_job(&job.id))?;
        debug!(job_id = %job.id, %job_type, seq, "Job emitted");
        Ok(())
    }
}
