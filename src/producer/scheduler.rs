use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::jobs::{JobType, ProduceRequest};
use crate::queue::{EnqueueOptions, JobQueue, QueueError};

pub const DEFAULT_PRODUCE_INTERVAL: Duration = Duration::from_secs(600);

/// Enqueues a produce request on a fixed interval, first tick immediately
pub struct ProduceScheduler {
    queue: Arc<JobQueue>,
    interval: Duration,
}

impl ProduceScheduler {
    pub fn new(queue: Arc<JobQueue>, interval: Duration) -> Self {
        Self { queue, interval }
    }

    /// Enqueue a single produce request
    pub fn tick(&self) -> Result<u64, QueueError> {
        let request = ProduceRequest {
            requested_at: Utc::now(),
        };
        self.queue
            .enqueue(JobType::Produce, &request, EnqueueOptions::default())
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(self, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "Produce scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick() {
                        Ok(seq) => debug!(seq, "Produce request enqueued"),
                        Err(err) => warn!(error = %err, "Failed to enqueue produce request"),
                    }
                }
            }
        }

        info!("Produce scheduler stopped");
    }
}
