//! Queue consumers, one per job kind
//!
//! Every worker follows the same shape: mark its catalog job Working, do the
//! work, and publish an [`UpdateJobMessage`] to the update queue. Failures are
//! published too and then returned so the queue's retry policy applies. Only
//! the [`UpdateWorker`] writes terminal job states.

pub mod crawl;
pub mod download;
pub mod produce;
pub mod record;
pub mod record_reserve;
pub mod update;

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::catalog::{CatalogError, CatalogStore, StartOutcome};
use crate::jobs::{JobType, UpdateJobMessage};
use crate::queue::{Delivery, EnqueueOptions, HandlerError, JobQueue};

pub use crawl::CrawlWorker;
pub use download::DownloadWorker;
pub use produce::ProduceWorker;
pub use record::{RecordSettings, RecordSupervisor, RecordWorker};
pub use record_reserve::{RECORD_LEAD_TIME, RecordReserveWorker, record_start_delay};
pub use update::UpdateWorker;

/// Map a catalog failure to a handler error; missing rows never reappear on retry
pub(crate) fn catalog_failure(err: CatalogError) -> HandlerError {
    if err.is_not_found() {
        HandlerError::fatal(err)
    } else {
        HandlerError::retryable(err)
    }
}

/// Mark the job Working. Returns `false` when the job already finished and the
/// delivery should be acknowledged without doing the work again.
///
/// A catalog failure is published like any other failed attempt, so the last
/// attempt still finalizes the row.
pub(crate) async fn begin_job(
    catalog: &dyn CatalogStore,
    queue: &JobQueue,
    delivery: &Delivery,
    job_type: JobType,
    job_id: &str,
) -> Result<bool, HandlerError> {
    let outcome = match catalog.start_job(job_id).await {
        Ok(outcome) => outcome,
        Err(err) => {
            return Err(publish_failure(
                queue,
                delivery,
                job_type,
                job_id,
                catalog_failure(err),
            ));
        }
    };

    match outcome {
        StartOutcome::Started => Ok(true),
        StartOutcome::AlreadyWorking => {
            debug!(job_id, attempt = delivery.attempt, "Redelivery of working job");
            Ok(true)
        }
        StartOutcome::AlreadyFinished(status) => {
            warn!(job_id, ?status, "Job already finished, skipping duplicate delivery");
            Ok(false)
        }
    }
}

/// Publish a successful attempt to the update queue.
///
/// When the success message cannot be queued the attempt counts as failed and
/// a failure update is attempted instead.
pub(crate) fn publish_success<R: Serialize>(
    queue: &JobQueue,
    delivery: &Delivery,
    job_type: JobType,
    job_id: &str,
    result: &R,
) -> Result<(), HandlerError> {
    let enqueued = UpdateJobMessage::success(job_type, job_id, result)
        .map_err(HandlerError::fatal)
        .and_then(|message| {
            queue
                .enqueue(JobType::Update, &message, EnqueueOptions::for_job(job_id))
                .map_err(HandlerError::retryable)
        });

    match enqueued {
        Ok(_) => Ok(()),
        Err(err) => Err(publish_failure(queue, delivery, job_type, job_id, err)),
    }
}

/// Publish a failed attempt and hand the error back for the queue
pub(crate) fn publish_failure(
    queue: &JobQueue,
    delivery: &Delivery,
    job_type: JobType,
    job_id: &str,
    err: HandlerError,
) -> HandlerError {
    let will_retry = delivery.will_retry(&err);
    warn!(
        job_id,
        %job_type,
        attempt = delivery.attempt,
        will_retry,
        error = %err,
        "Job attempt failed"
    );

    let message = UpdateJobMessage::failure(job_type, job_id, err.message(), will_retry);
    if let Err(publish_err) =
        queue.enqueue(JobType::Update, &message, EnqueueOptions::for_job(job_id))
    {
        error!(job_id, error = %publish_err, "Failed to publish failure update");
    }
    err
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
