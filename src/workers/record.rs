use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{begin_job, elapsed_ms, publish_failure, publish_success};
use crate::catalog::CatalogStore;
use crate::jobs::{JobType, RecordJobPayload, RecordResult};
use crate::queue::{ConsumeMode, Delivery, HandlerError, JobHandler, JobQueue};
use crate::recorder::{MediaRecorder, RecordRequest, RecorderError};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("recording failed: {0}")]
    Recorder(#[from] RecorderError),
    #[error("output directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct RecordSettings {
    pub output_dir: PathBuf,
    /// Used when the job carries no duration
    pub max_duration: Duration,
    /// Output file extension
    pub container: String,
}

/// Captures a live stream for a Record job
pub struct RecordWorker {
    catalog: Arc<dyn CatalogStore>,
    queue: Arc<JobQueue>,
    recorder: Arc<dyn MediaRecorder>,
    settings: RecordSettings,
}

impl RecordWorker {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        queue: Arc<JobQueue>,
        recorder: Arc<dyn MediaRecorder>,
        settings: RecordSettings,
    ) -> Self {
        Self {
            catalog,
            queue,
            recorder,
            settings,
        }
    }

    async fn record(
        &self,
        payload: &RecordJobPayload,
        shutdown: &CancellationToken,
    ) -> Result<RecordResult, RecordError> {
        let started = Instant::now();
        tokio::fs::create_dir_all(&self.settings.output_dir).await?;

        let output_path = self
            .settings
            .output_dir
            .join(format!("{}.{}", Uuid::new_v4(), self.settings.container));
        let max_duration = payload
            .params
            .duration
            .map(Duration::from_secs)
            .unwrap_or(self.settings.max_duration);

        let request = RecordRequest {
            stream_url: payload.params.stream_url.clone(),
            output_path,
            max_duration,
        };
        let output = self.recorder.record(&request, shutdown.child_token()).await?;

        Ok(RecordResult {
            output_path: output.output_path.to_string_lossy().to_string(),
            size: output.size,
            duration: output.duration_secs,
            spent: elapsed_ms(started),
        })
    }
}

#[async_trait]
impl JobHandler for RecordWorker {
    type Payload = RecordJobPayload;

    async fn handle(&self, payload: RecordJobPayload, delivery: &Delivery) -> Result<(), HandlerError> {
        if !begin_job(
            self.catalog.as_ref(),
            &self.queue,
            delivery,
            JobType::Record,
            &payload.job_id,
        )
        .await?
        {
            return Ok(());
        }

        info!(
            job_id = %payload.job_id,
            episode_id = %payload.params.episode_id,
            stream_url = %payload.params.stream_url,
            "Recording started"
        );

        match self.record(&payload, &delivery.shutdown).await {
            Ok(result) => {
                info!(
                    job_id = %payload.job_id,
                    size = result.size,
                    duration_secs = result.duration,
                    "Recording completed"
                );
                publish_success(&self.queue, delivery, JobType::Record, &payload.job_id, &result)
            }
            Err(err) => Err(publish_failure(
                &self.queue,
                delivery,
                JobType::Record,
                &payload.job_id,
                HandlerError::retryable(err),
            )),
        }
    }
}

#[derive(Default)]
struct SupervisorState {
    active: bool,
    handle: Option<JoinHandle<()>>,
}

/// Runs the record queue in a supervised execution context on demand
///
/// `trigger` starts a consumer of the record queue if none is active. The
/// context drains the queue (including delayed entries) and exits once it is
/// idle; a later trigger starts a new one.
pub struct RecordSupervisor {
    queue: Arc<JobQueue>,
    worker: Arc<RecordWorker>,
    shutdown: CancellationToken,
    state: Arc<Mutex<SupervisorState>>,
}

impl RecordSupervisor {
    pub fn new(queue: Arc<JobQueue>, worker: Arc<RecordWorker>, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            worker,
            shutdown,
            state: Arc::new(Mutex::new(SupervisorState::default())),
        }
    }

    /// Start the record context unless it is already running. Never waits.
    pub fn trigger(&self) {
        let mut state = self.state.lock();
        if state.active {
            debug!("Record context already running");
            return;
        }
        if self.shutdown.is_cancelled() {
            return;
        }

        state.active = true;
        let queue = Arc::clone(&self.queue);
        let worker = Arc::clone(&self.worker);
        let shutdown = self.shutdown.clone();
        let shared = Arc::clone(&self.state);

        state.handle = Some(tokio::spawn(async move {
            supervise(queue, worker, shutdown, shared).await;
        }));
        info!("Record context started");
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Wait until no record context is running
    pub async fn wait_idle(&self) {
        loop {
            let handle = self.state.lock().handle.take();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }
}

async fn supervise(
    queue: Arc<JobQueue>,
    worker: Arc<RecordWorker>,
    shutdown: CancellationToken,
    state: Arc<Mutex<SupervisorState>>,
) {
    loop {
        let consumer = match queue.consume(
            JobType::Record,
            Arc::clone(&worker),
            ConsumeMode::UntilIdle,
            shutdown.clone(),
        ) {
            Ok(consumer) => consumer,
            Err(err) => {
                error!(error = %err, "Failed to start record context");
                state.lock().active = false;
                return;
            }
        };

        match consumer.await {
            Ok(()) => debug!("Record context idle"),
            Err(err) if err.is_panic() => {
                error!("Record context panicked");
                state.lock().active = false;
                return;
            }
            Err(err) => warn!(error = %err, "Record context aborted"),
        }

        // Entries enqueued while the consumer was exiting keep this context alive
        let mut guard = state.lock();
        if shutdown.is_cancelled() || queue.depth(JobType::Record) == 0 {
            guard.active = false;
            info!("Record context stopped");
            return;
        }
    }
}
