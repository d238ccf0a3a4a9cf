use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use super::record::RecordSupervisor;
use super::{begin_job, elapsed_ms, publish_failure, publish_success};
use crate::catalog::{CatalogError, CatalogStore, Job, new_id};
use crate::jobs::{JobType, RecordJobPayload, RecordReserveJobPayload, RecordReserveResult};
use crate::queue::{Delivery, EnqueueOptions, HandlerError, JobHandler, JobQueue, QueueError};

/// Recordings start this long before the announced stream start
pub const RECORD_LEAD_TIME: Duration = Duration::from_secs(5 * 60);

/// `max(0, (start - now) - lead time)`
pub fn record_start_delay(start: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (start - now)
        .to_std()
        .ok()
        .and_then(|until_start| until_start.checked_sub(RECORD_LEAD_TIME))
        .unwrap_or(Duration::ZERO)
}

#[derive(Debug, Error)]
pub enum ReserveError {
    #[error("catalog write failed: {0}")]
    Catalog(#[from] CatalogError),
    #[error("enqueue failed: {0}")]
    Queue(#[from] QueueError),
    #[error("payload encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Turns a reservation into a delayed Record job
pub struct RecordReserveWorker {
    catalog: Arc<dyn CatalogStore>,
    queue: Arc<JobQueue>,
    supervisor: Arc<RecordSupervisor>,
}

impl RecordReserveWorker {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        queue: Arc<JobQueue>,
        supervisor: Arc<RecordSupervisor>,
    ) -> Self {
        Self {
            catalog,
            queue,
            supervisor,
        }
    }

    async fn reserve(
        &self,
        payload: &RecordReserveJobPayload,
    ) -> Result<RecordReserveResult, ReserveError> {
        let started = Instant::now();
        let params = &payload.record_job_params;

        let record_job_id = new_id();
        let record_payload = RecordJobPayload {
            job_id: record_job_id.clone(),
            params: params.clone(),
        };

        let job = Job::pending(
            record_job_id.clone(),
            JobType::Record,
            serde_json::to_value(&record_payload)?,
        )
        .with_episode(&params.episode_id);
        self.catalog.create_job(&job).await?;

        let delay = record_start_delay(params.start_time, Utc::now());
        self.queue.enqueue(
            JobType::Record,
            &record_payload,
            EnqueueOptions::for_job(&record_job_id).with_delay(delay),
        )?;

        info!(
            job_id = %payload.job_id,
            record_job_id = %record_job_id,
            episode_id = %params.episode_id,
            start_time = %params.start_time,
            delay_secs = delay.as_secs(),
            "Record job reserved"
        );

        self.supervisor.trigger();

        Ok(RecordReserveResult {
            record_job_id,
            spent: elapsed_ms(started),
        })
    }
}

#[async_trait]
impl JobHandler for RecordReserveWorker {
    type Payload = RecordReserveJobPayload;

    async fn handle(
        &self,
        payload: RecordReserveJobPayload,
        delivery: &Delivery,
    ) -> Result<(), HandlerError> {
        if !begin_job(
            self.catalog.as_ref(),
            &self.queue,
            delivery,
            JobType::RecordReserve,
            &payload.job_id,
        )
        .await?
        {
            return Ok(());
        }

        match self.reserve(&payload).await {
            Ok(result) => publish_success(
                &self.queue,
                delivery,
                JobType::RecordReserve,
                &payload.job_id,
                &result,
            ),
            Err(err) => Err(publish_failure(
                &self.queue,
                delivery,
                JobType::RecordReserve,
                &payload.job_id,
                HandlerError::retryable(err),
            )),
        }
    }
}
