use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use super::{begin_job, elapsed_ms, publish_failure, publish_success};
use crate::catalog::CatalogStore;
use crate::fetch::{FeedError, FeedParser, FetchError, HttpFetcher, extract_episodes};
use crate::jobs::{CrawlJobPayload, CrawlResult, CrawlType, JobType};
use crate::queue::{Delivery, HandlerError, JobHandler, JobQueue};

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("feed parse failed: {0}")]
    Feed(#[from] FeedError),
}

/// Fetches a channel feed and reports its episodes
pub struct CrawlWorker {
    catalog: Arc<dyn CatalogStore>,
    queue: Arc<JobQueue>,
    fetcher: Arc<dyn HttpFetcher>,
    parser: Arc<dyn FeedParser>,
}

impl CrawlWorker {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        queue: Arc<JobQueue>,
        fetcher: Arc<dyn HttpFetcher>,
        parser: Arc<dyn FeedParser>,
    ) -> Self {
        Self {
            catalog,
            queue,
            fetcher,
            parser,
        }
    }

    async fn crawl(&self, payload: &CrawlJobPayload) -> Result<CrawlResult, CrawlError> {
        let started = Instant::now();

        let episodes = match payload.crawl_type {
            CrawlType::Rss => {
                let body = self.fetcher.fetch(&payload.target_url).await?;
                let document = self.parser.parse(&body)?;
                extract_episodes(&document)
            }
            CrawlType::Unknown => {
                warn!(job_id = %payload.job_id, "Unsupported crawl type, reporting no episodes");
                Vec::new()
            }
        };

        Ok(CrawlResult {
            episodes,
            spent: elapsed_ms(started),
        })
    }
}

#[async_trait]
impl JobHandler for CrawlWorker {
    type Payload = CrawlJobPayload;

    async fn handle(&self, payload: CrawlJobPayload, delivery: &Delivery) -> Result<(), HandlerError> {
        if !begin_job(
            self.catalog.as_ref(),
            &self.queue,
            delivery,
            JobType::Crawl,
            &payload.job_id,
        )
        .await?
        {
            return Ok(());
        }

        match self.crawl(&payload).await {
            Ok(result) => {
                info!(
                    job_id = %payload.job_id,
                    url = %payload.target_url,
                    episodes = result.episodes.len(),
                    spent_ms = result.spent,
                    "Crawl completed"
                );
                publish_success(&self.queue, delivery, JobType::Crawl, &payload.job_id, &result)
            }
            Err(err) => Err(publish_failure(
                &self.queue,
                delivery,
                JobType::Crawl,
                &payload.job_id,
                HandlerError::retryable(err),
            )),
        }
    }
}
