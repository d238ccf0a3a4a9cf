use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use governor::{Quota, RateLimiter};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::{Delivery, HandlerError, JobHandler};
use super::policy::{QueuePolicy, RetryPolicy};
use super::store::{
    DeadLetter, FAILURE_FATAL, FAILURE_RETRIES_EXHAUSTED, FjallQueue, QueueEntry, QueueError,
    Result, now_ms,
};
use crate::jobs::JobType;
use crate::observability::{Metrics, MetricsSnapshot};

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Options for a single enqueue
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub delay: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    /// Catalog job this entry executes, used by reconciliation
    pub job_id: Option<String>,
}

impl EnqueueOptions {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// How long a consumer keeps dispatching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeMode {
    /// Until shutdown
    Forever,
    /// Until the queue holds no entries and nothing is in flight
    UntilIdle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    ready_at_ms: u64,
    seq: u64,
}

struct Lane {
    policy: QueuePolicy,
    heap: Mutex<BinaryHeap<Reverse<Slot>>>,
    notify: Notify,
    permits: Arc<Semaphore>,
    limiter: Option<DirectLimiter>,
    consuming: AtomicBool,
}

impl Lane {
    fn new(policy: QueuePolicy) -> Self {
        let limiter = policy
            .rate_per_sec
            .and_then(NonZeroU32::new)
            .map(|rate| RateLimiter::direct(Quota::per_second(rate).allow_burst(NonZeroU32::MIN)));

        Self {
            permits: Arc::new(Semaphore::new(policy.concurrency.max(1))),
            policy,
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            limiter,
            consuming: AtomicBool::new(false),
        }
    }

    fn push(&self, slot: Slot) {
        self.heap.lock().push(Reverse(slot));
        self.notify.notify_one();
    }

    fn peek(&self) -> Option<Slot> {
        self.heap.lock().peek().map(|Reverse(slot)| *slot)
    }

    fn pop_due(&self, now: u64) -> Option<Slot> {
        let mut heap = self.heap.lock();
        match heap.peek() {
            Some(Reverse(slot)) if slot.ready_at_ms <= now => heap.pop().map(|Reverse(slot)| slot),
            _ => None,
        }
    }

    fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

/// Clears the consumer flag when a dispatch loop exits
struct ConsumerGuard(Arc<Lane>);

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.0.consuming.store(false, Ordering::SeqCst);
    }
}

/// Per-queue depth and counters
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub queue: JobType,
    pub depth: usize,
    pub dead_letters: usize,
    pub concurrency: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_per_sec: Option<u32>,
    pub counters: MetricsSnapshot,
}

/// Named durable queues with delayed delivery, retry and flow control
///
/// Each queue keeps a min-heap of `(ready_at, seq)` slots over entries stored
/// in [`FjallQueue`]. A consumer registration runs one dispatch loop that pops
/// due slots under the queue's semaphore and rate limiter and runs the handler
/// in a `JoinSet`. Entries stay in the store until acknowledged, so a crash
/// after delivery causes redelivery on the next open.
pub struct JobQueue {
    store: FjallQueue,
    lanes: HashMap<JobType, Arc<Lane>>,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl JobQueue {
    /// Open queues over `store`, reloading every stored entry
    pub fn open(
        store: FjallQueue,
        policies: impl IntoIterator<Item = QueuePolicy>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let lanes: HashMap<JobType, Arc<Lane>> = policies
            .into_iter()
            .map(|policy| (policy.job_type, Arc::new(Lane::new(policy))))
            .collect();

        let mut recovered = 0usize;
        for entry in store.entries()? {
            match lanes.get(&entry.queue) {
                Some(lane) => {
                    lane.heap.lock().push(Reverse(Slot {
                        ready_at_ms: entry.ready_at_ms,
                        seq: entry.seq,
                    }));
                    recovered += 1;
                }
                None => warn!(seq = entry.seq, queue = %entry.queue, "No policy for stored entry"),
            }
        }

        info!(queues = lanes.len(), recovered, "JobQueue opened");

        Ok(Arc::new(Self {
            store,
            lanes,
            closed: AtomicBool::new(false),
            metrics,
        }))
    }

    fn lane(&self, job_type: JobType) -> Result<&Arc<Lane>> {
        self.lanes
            .get(&job_type)
            .ok_or(QueueError::UnknownQueue(job_type))
    }

    /// Durably enqueue `payload` on the queue named by `job_type`
    ///
    /// Returns the entry's sequence number once it is persisted.
    pub fn enqueue<T: Serialize>(
        &self,
        job_type: JobType,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<u64> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let lane = self.lane(job_type)?;

        let delay_ms = options
            .delay
            .map(|delay| u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        let mut entry = QueueEntry::new(
            job_type,
            serde_json::to_value(payload)?,
            now_ms().saturating_add(delay_ms),
        );
        entry.job_id = options.job_id;
        entry.retry = options.retry;

        let entry = self.store.enqueue(entry)?;
        lane.push(Slot {
            ready_at_ms: entry.ready_at_ms,
            seq: entry.seq,
        });
        self.metrics.enqueued(job_type);

        debug!(
            queue = %job_type,
            seq = entry.seq,
            job_id = ?entry.job_id,
            delay_ms,
            "Enqueued"
        );
        Ok(entry.seq)
    }

    /// Register the single consumer of a queue and start its dispatch loop
    pub fn consume<H: JobHandler>(
        self: &Arc<Self>,
        job_type: JobType,
        handler: Arc<H>,
        mode: ConsumeMode,
        shutdown: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let lane = Arc::clone(self.lane(job_type)?);

        if lane
            .consuming
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(QueueError::AlreadyConsuming(job_type));
        }

        info!(
            queue = %job_type,
            concurrency = lane.policy.concurrency,
            rate_per_sec = ?lane.policy.rate_per_sec,
            ?mode,
            "Starting consumer"
        );

        let queue = Arc::clone(self);
        Ok(tokio::spawn(async move {
            queue.dispatch(lane, handler, mode, shutdown).await;
        }))
    }

    async fn dispatch<H: JobHandler>(
        self: Arc<Self>,
        lane: Arc<Lane>,
        handler: Arc<H>,
        mode: ConsumeMode,
        shutdown: CancellationToken,
    ) {
        let _guard = ConsumerGuard(Arc::clone(&lane));
        let job_type = lane.policy.job_type;
        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                log_join(job_type, joined);
            }

            if shutdown.is_cancelled() {
                break;
            }

            let wait = match lane.peek() {
                None if mode == ConsumeMode::UntilIdle && in_flight.is_empty() => break,
                None => None,
                Some(slot) => {
                    let now = now_ms();
                    if slot.ready_at_ms <= now {
                        Some(Duration::ZERO)
                    } else {
                        Some(Duration::from_millis(slot.ready_at_ms - now))
                    }
                }
            };

            if wait != Some(Duration::ZERO) {
                let sleep = tokio::time::sleep(wait.unwrap_or(Duration::from_secs(3600)));
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = lane.notify.notified() => {}
                    _ = sleep => {}
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        log_join(job_type, joined);
                    }
                }
                continue;
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = Arc::clone(&lane.permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if let Some(limiter) = &lane.limiter {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = limiter.until_ready() => {}
                }
            }

            let Some(slot) = lane.pop_due(now_ms()) else {
                continue;
            };

            let entry = match self.store.get(slot.seq) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    warn!(queue = %job_type, seq = slot.seq, "Slot without stored entry, skipping");
                    continue;
                }
                Err(err) => {
                    error!(queue = %job_type, seq = slot.seq, error = %err, "Failed to load entry");
                    lane.push(Slot {
                        ready_at_ms: now_ms().saturating_add(1000),
                        seq: slot.seq,
                    });
                    continue;
                }
            };

            let queue = Arc::clone(&self);
            let lane_ref = Arc::clone(&lane);
            let handler = Arc::clone(&handler);
            let token = shutdown.clone();
            in_flight.spawn(async move {
                let _permit = permit;
                queue.execute(&lane_ref, handler.as_ref(), entry, token).await;
            });
        }

        if !in_flight.is_empty() {
            info!(queue = %job_type, in_flight = in_flight.len(), "Draining in-flight deliveries");
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join(job_type, joined);
        }
        info!(queue = %job_type, "Consumer stopped");
    }

    async fn execute<H: JobHandler>(
        &self,
        lane: &Lane,
        handler: &H,
        mut entry: QueueEntry,
        shutdown: CancellationToken,
    ) {
        let job_type = entry.queue;
        let retry = entry.retry.unwrap_or(lane.policy.retry);
        let attempt = entry.attempts + 1;

        let delivery = Delivery {
            job_type,
            seq: entry.seq,
            job_id: entry.job_id.clone(),
            attempt,
            max_attempts: retry.max_attempts,
            shutdown,
        };
        self.metrics.delivered(job_type);
        debug!(queue = %job_type, seq = entry.seq, attempt, "Delivering");

        let outcome = match serde_json::from_value::<H::Payload>(entry.payload.clone()) {
            Ok(payload) => handler.handle(payload, &delivery).await,
            Err(err) => Err(HandlerError::Fatal(format!("undecodable payload: {err}"))),
        };

        let err = match outcome {
            Ok(()) => {
                if let Err(err) = self.store.ack(entry.seq) {
                    error!(queue = %job_type, seq = entry.seq, error = %err, "Failed to ack entry");
                }
                self.metrics.succeeded(job_type);
                return;
            }
            Err(err) => err,
        };

        let next_delay = if err.is_retryable() {
            retry.next_delay(attempt)
        } else {
            None
        };

        match next_delay {
            Some(delay) => {
                entry.attempts = attempt;
                entry.ready_at_ms = now_ms()
                    .saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
                entry.last_error = Some(err.message().to_string());

                if let Err(store_err) = self.store.update(&entry) {
                    error!(queue = %job_type, seq = entry.seq, error = %store_err, "Failed to persist retry");
                }
                lane.push(Slot {
                    ready_at_ms: entry.ready_at_ms,
                    seq: entry.seq,
                });
                self.metrics.retried(job_type);
                warn!(
                    queue = %job_type,
                    seq = entry.seq,
                    attempt,
                    max_attempts = retry.max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %err,
                    "Delivery failed, retrying"
                );
            }
            None => {
                let code = if err.is_retryable() {
                    FAILURE_RETRIES_EXHAUSTED
                } else {
                    FAILURE_FATAL
                };
                let seq = entry.seq;
                if let Err(store_err) =
                    self.store
                        .move_to_dlq(entry, code, err.message().to_string(), attempt)
                {
                    error!(queue = %job_type, seq, error = %store_err, "Failed to dead-letter entry");
                }
                self.metrics.dead_lettered(job_type);
                warn!(queue = %job_type, seq, attempt, code, error = %err, "Delivery failed permanently");
            }
        }
    }

    /// Reject further enqueues
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("JobQueue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Entries waiting on a queue, including ones scheduled for later
    pub fn depth(&self, job_type: JobType) -> usize {
        self.lanes.get(&job_type).map(|lane| lane.len()).unwrap_or(0)
    }

    /// Stored entries of one queue ordered by readiness
    pub fn scheduled(&self, job_type: JobType) -> Result<Vec<QueueEntry>> {
        let mut entries: Vec<QueueEntry> = self
            .store
            .entries()?
            .into_iter()
            .filter(|entry| entry.queue == job_type)
            .collect();
        entries.sort_by_key(|entry| (entry.ready_at_ms, entry.seq));
        Ok(entries)
    }

    pub fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.store.list_dlq(limit)
    }

    /// Job ids that still have a live or dead-lettered entry
    pub fn job_ids(&self) -> Result<HashSet<String>> {
        self.store.job_ids()
    }

    pub fn policy(&self, job_type: JobType) -> Option<QueuePolicy> {
        self.lanes.get(&job_type).map(|lane| lane.policy)
    }

    pub fn stats(&self) -> Result<Vec<QueueStats>> {
        let mut stats = Vec::with_capacity(self.lanes.len());
        for job_type in JobType::ALL {
            let Some(lane) = self.lanes.get(&job_type) else {
                continue;
            };
            stats.push(QueueStats {
                queue: job_type,
                depth: lane.len(),
                dead_letters: self.store.dlq_count(job_type)?,
                concurrency: lane.policy.concurrency,
                rate_per_sec: lane.policy.rate_per_sec,
                counters: self.metrics.snapshot(job_type),
            });
        }
        Ok(stats)
    }

    pub fn health_check(&self) -> Result<()> {
        self.store.health_check()
    }

    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }
}

fn log_join(job_type: JobType, joined: std::result::Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(queue = %job_type, "Handler task panicked");
        } else {
            warn!(queue = %job_type, error = %err, "Handler task cancelled");
        }
    }
}
