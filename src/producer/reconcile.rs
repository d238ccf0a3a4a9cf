use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ProduceError, Result};
use crate::catalog::{CatalogStore, DEFAULT_JOB_RETENTION_DAYS, Job, JobStatus};
use crate::jobs::{JobType, RecordJobPayload};
use crate::queue::{EnqueueOptions, JobQueue};
use crate::workers::{RecordSupervisor, record_start_delay};

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub interval: Duration,
    /// Pending rows younger than this are still expected to be enqueued
    pub stale_after: Duration,
    /// Finished jobs older than this are pruned
    pub job_ttl: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            stale_after: Duration::from_secs(900),
            job_ttl: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    /// Orphaned Pending rows whose payload was enqueued again
    pub requeued: usize,
    pub jobs_pruned: usize,
    pub failures: Vec<String>,
}

/// Recovers Pending job rows whose queue entry never made it to the queue
///
/// A Job row is persisted before its payload is enqueued, so a crash between
/// the two leaves a Pending row nothing will ever deliver. A sweep re-enqueues
/// the stored payload of every such row once it is older than `stale_after`,
/// then prunes old finished jobs.
pub struct Reconciler {
    catalog: Arc<dyn CatalogStore>,
    queue: Arc<JobQueue>,
    supervisor: Option<Arc<RecordSupervisor>>,
    settings: ReconcilerSettings,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        queue: Arc<JobQueue>,
        supervisor: Option<Arc<RecordSupervisor>>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            catalog,
            queue,
            supervisor,
            settings,
        }
    }

    /// One sweep at `now`
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        let pending = self
            .catalog
            .list_jobs_by_status(JobStatus::Pending)
            .await
            .map_err(ProduceError::CatalogRead)?;
        let queued = self.queue.job_ids()?;
        let stale_before = now
            - chrono::Duration::from_std(self.settings.stale_after)
                .unwrap_or_else(|_| chrono::Duration::zero());

        let mut record_requeued = false;
        for job in pending {
            if job.created_at > stale_before || queued.contains(&job.id) {
                continue;
            }
            match self.requeue(&job, now) {
                Ok(()) => {
                    report.requeued += 1;
                    record_requeued |= job.job_type == JobType::Record;
                    info!(job_id = %job.id, job_type = %job.job_type, "Requeued orphaned job");
                }
                Err(err) => {
                    warn!(job_id = %job.id, error = %err, "Failed to requeue orphaned job");
                    report.failures.push(format!("{} {}: {err}", job.job_type, job.id));
                }
            }
        }

        if record_requeued {
            if let Some(supervisor) = &self.supervisor {
                supervisor.trigger();
            }
        }

        let ttl = chrono::Duration::from_std(self.settings.job_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(DEFAULT_JOB_RETENTION_DAYS as i64));
        let pruned = self
            .catalog
            .prune_finished(now - ttl)
            .await
            .map_err(ProduceError::CatalogWrite)?;
        report.jobs_pruned = pruned.jobs_pruned;

        debug!(
            requeued = report.requeued,
            jobs_pruned = report.jobs_pruned,
            failures = report.failures.len(),
            "Reconcile sweep finished"
        );
        Ok(report)
    }

    fn requeue(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let mut options = EnqueueOptions::for_job(&job.id);
        if job.job_type == JobType::Record {
            let payload: RecordJobPayload = serde_json::from_value(job.payload.clone())?;
            options = options.with_delay(record_start_delay(payload.params.start_time, now));
        }
        self.queue.enqueue(job.job_type, &job.payload, options)?;
        Ok(())
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            stale_after_secs = self.settings.stale_after.as_secs(),
            "Reconciler started"
        );
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.run_once(Utc::now()).await {
                        warn!(error = %err, "Reconcile sweep failed");
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }
}
