//! Per-queue delivery counters

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::jobs::JobType;

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Metrics handle shared by the queue and the ops server
#[derive(Debug)]
pub struct Metrics {
    queues: HashMap<JobType, QueueCounters>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            queues: JobType::ALL
                .into_iter()
                .map(|job_type| (job_type, QueueCounters::default()))
                .collect(),
        }
    }

    fn bump(&self, job_type: JobType, counter: &'static str, pick: fn(&QueueCounters) -> &AtomicU64) {
        if let Some(counters) = self.queues.get(&job_type) {
            pick(counters).fetch_add(1, Ordering::Relaxed);
            tracing::trace!(queue = %job_type, counter, "Metric incremented");
        }
    }

    pub fn enqueued(&self, job_type: JobType) {
        self.bump(job_type, "enqueued", |c| &c.enqueued);
    }

    pub fn delivered(&self, job_type: JobType) {
        self.bump(job_type, "delivered", |c| &c.delivered);
    }

    pub fn succeeded(&self, job_type: JobType) {
        self.bump(job_type, "succeeded", |c| &c.succeeded);
    }

    pub fn retried(&self, job_type: JobType) {
        self.bump(job_type, "retried", |c| &c.retried);
    }

    pub fn dead_lettered(&self, job_type: JobType) {
        self.bump(job_type, "dead_lettered", |c| &c.dead_lettered);
    }

    pub fn snapshot(&self, job_type: JobType) -> MetricsSnapshot {
        self.queues
            .get(&job_type)
            .map(|c| MetricsSnapshot {
                enqueued: c.enqueued.load(Ordering::Relaxed),
                delivered: c.delivered.load(Ordering::Relaxed),
                succeeded: c.succeeded.load(Ordering::Relaxed),
                retried: c.retried.load(Ordering::Relaxed),
                dead_lettered: c.dead_lettered.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub enqueued: u64,
    pub delivered: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}
