use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::catalog_failure;
use crate::catalog::{CatalogStore, Episode, FinishOutcome, Job, JobCompletion};
use crate::jobs::{CrawlResult, CrawledEpisode, JobResult, UpdateJobMessage};
use crate::queue::{Delivery, HandlerError, JobHandler};

const UNTITLED_EPISODE: &str = "Untitled Episode";

/// Parse a feed publication date: RFC 2822 first, then RFC 3339
pub fn parse_pub_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

/// Folds job outcomes into the catalog
///
/// Every side effect is safe to apply again: crawled episodes are deduped by
/// their feed identifier and sizes are overwritten. Terminal job writes keep
/// the first result.
pub struct UpdateWorker {
    catalog: Arc<dyn CatalogStore>,
}

impl UpdateWorker {
    pub fn new(catalog: Arc<dyn CatalogStore>) -> Self {
        Self { catalog }
    }

    /// Create episodes for crawled items not yet known under the job's channel.
    ///
    /// Returns how many episodes were created.
    pub async fn apply_crawl(&self, job: &Job, result: &CrawlResult) -> Result<usize, HandlerError> {
        let channel_id = job
            .channel_id
            .as_deref()
            .ok_or_else(|| HandlerError::Fatal(format!("crawl job {} has no channel", job.id)))?;
        if self
            .catalog
            .get_channel(channel_id)
            .await
            .map_err(catalog_failure)?
            .is_none()
        {
            return Err(HandlerError::Fatal(format!("channel {channel_id} not found")));
        }

        let mut created = 0;
        let mut skipped = 0;
        for crawled in &result.episodes {
            let Some(identifier) = crawled.identifier() else {
                warn!(job_id = %job.id, title = ?crawled.title, "Crawled item has no guid or link, skipping");
                skipped += 1;
                continue;
            };

            let existing = self
                .catalog
                .find_episode_by_slug(channel_id, identifier)
                .await
                .map_err(catalog_failure)?;
            if existing.is_some() {
                skipped += 1;
                continue;
            }

            let episode = new_episode(&job.id, channel_id, identifier, crawled);
            if self
                .catalog
                .insert_episode(&episode)
                .await
                .map_err(catalog_failure)?
            {
                created += 1;
            } else {
                skipped += 1;
            }
        }

        info!(job_id = %job.id, channel_id, created, skipped, "Crawl result applied");
        Ok(created)
    }

    async fn apply_size(&self, job: &Job, size: u64) -> Result<(), HandlerError> {
        let episode_id = job
            .episode_id
            .as_deref()
            .ok_or_else(|| HandlerError::Fatal(format!("job {} has no episode", job.id)))?;
        self.catalog
            .update_episode_size(episode_id, size)
            .await
            .map_err(catalog_failure)?;
        debug!(job_id = %job.id, episode_id, size, "Episode size updated");
        Ok(())
    }
}

fn new_episode(job_id: &str, channel_id: &str, identifier: &str, crawled: &CrawledEpisode) -> Episode {
    let published_at = match crawled.pub_date.as_deref() {
        Some(raw) => parse_pub_date(raw).unwrap_or_else(|| {
            warn!(job_id, pub_date = raw, "Unparseable publication date, using now");
            Utc::now()
        }),
        None => {
            warn!(job_id, identifier, "Missing publication date, using now");
            Utc::now()
        }
    };

    let title = crawled
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .unwrap_or(UNTITLED_EPISODE);

    Episode::new_static(channel_id, identifier, title, crawled.audio_url(), published_at)
}

#[async_trait]
impl JobHandler for UpdateWorker {
    type Payload = UpdateJobMessage;

    async fn handle(&self, message: UpdateJobMessage, _delivery: &Delivery) -> Result<(), HandlerError> {
        let typed = message.typed_result().map_err(HandlerError::fatal)?;

        if !message.success && message.will_retry {
            let error = message.error.as_deref().unwrap_or("unknown error");
            debug!(job_id = %message.job_id, error, "Recording intermediate attempt error");
            return self
                .catalog
                .record_attempt_error(&message.job_id, error)
                .await
                .map_err(catalog_failure);
        }

        let job = self
            .catalog
            .get_job(&message.job_id)
            .await
            .map_err(catalog_failure)?
            .ok_or_else(|| HandlerError::Fatal(format!("job {} not found", message.job_id)))?;

        if job.job_type != message.job_type {
            return Err(HandlerError::Fatal(format!(
                "job {} is {} but update says {}",
                job.id, job.job_type, message.job_type
            )));
        }

        match &typed {
            Some(JobResult::Crawl(result)) => {
                self.apply_crawl(&job, result).await?;
            }
            Some(JobResult::Download(result)) => self.apply_size(&job, result.size).await?,
            Some(JobResult::Record(result)) => self.apply_size(&job, result.size).await?,
            Some(JobResult::RecordReserve(_)) | None => {}
        }

        let completion = if message.success {
            JobCompletion::Done(message.result.clone())
        } else {
            JobCompletion::Failed(
                message
                    .error
                    .clone()
                    .unwrap_or_else(|| "unknown error".to_string()),
            )
        };

        match self
            .catalog
            .finish_job(&message.job_id, completion)
            .await
            .map_err(catalog_failure)?
        {
            FinishOutcome::Finished => info!(
                job_id = %message.job_id,
                job_type = %message.job_type,
                success = message.success,
                "Job finished"
            ),
            FinishOutcome::AlreadyFinished(status) => debug!(
                job_id = %message.job_id,
                ?status,
                "Duplicate terminal update ignored"
            ),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pub_date_formats() {
        let rfc2822 = parse_pub_date("Tue, 10 Jun 2025 04:00:00 GMT").unwrap();
        assert_eq!(rfc2822.to_rfc3339(), "2025-06-10T04:00:00+00:00");

        let rfc3339 = parse_pub_date("2025-06-10T13:00:00+09:00").unwrap();
        assert_eq!(rfc3339, rfc2822);

        assert!(parse_pub_date("yesterday").is_none());
    }

    #[test]
    fn test_new_episode_defaults() {
        let crawled = CrawledEpisode {
            guid: Some("e1".to_string()),
            pub_date: Some("garbage".to_string()),
            ..Default::default()
        };
        let before = Utc::now();
        let episode = new_episode("job", "ch", "e1", &crawled);

        assert_eq!(episode.title, UNTITLED_EPISODE);
        assert_eq!(episode.slug, "e1");
        assert_eq!(episode.audio_url, "");
        assert!(episode.published_at >= before);
    }
}
