//! Wires stores, queues and workers into one running pipeline

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::catalog::{CatalogError, CatalogStore, FjallCatalog};
use crate::config::Config;
use crate::fetch::{FeedParser, FetchError, HttpFetcher, ReqwestFetcher, XmlFeedParser};
use crate::jobs::JobType;
use crate::observability::Metrics;
use crate::producer::{ProduceScheduler, Producer, Reconciler};
use crate::queue::{ConsumeMode, FjallQueue, JobQueue, QueueError};
use crate::recorder::{FfmpegRecorder, MediaRecorder};
use crate::workers::{
    CrawlWorker, DownloadWorker, ProduceWorker, RecordReserveWorker, RecordSettings,
    RecordSupervisor, RecordWorker, UpdateWorker,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),
    #[error("queue: {0}")]
    Queue(#[from] QueueError),
    #[error("http client: {0}")]
    Fetch(#[from] FetchError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// External collaborators the workers talk to
#[derive(Clone)]
pub struct Collaborators {
    pub fetcher: Arc<dyn HttpFetcher>,
    pub parser: Arc<dyn FeedParser>,
    pub recorder: Arc<dyn MediaRecorder>,
}

impl Collaborators {
    /// reqwest, quick-xml and ffmpeg as configured
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            fetcher: Arc::new(ReqwestFetcher::new(config.http.client())?),
            parser: Arc::new(XmlFeedParser),
            recorder: Arc::new(FfmpegRecorder::new(config.recorder.ffmpeg())),
        })
    }
}

pub struct Pipeline {
    pub catalog: Arc<FjallCatalog>,
    pub queue: Arc<JobQueue>,
    pub metrics: Arc<Metrics>,
    pub producer: Arc<Producer>,
    pub supervisor: Arc<RecordSupervisor>,
    config: Config,
    collaborators: Collaborators,
    shutdown: CancellationToken,
}

impl Pipeline {
    /// Open both stores and build the shared components
    pub fn open(
        config: Config,
        collaborators: Collaborators,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        info!(path = %config.catalog.path.display(), "Opening catalog");
        let catalog = Arc::new(FjallCatalog::open(&config.catalog.path)?);

        info!(path = %config.queue.path.display(), "Opening queue store");
        let metrics = Arc::new(Metrics::new());
        let queue = JobQueue::open(
            FjallQueue::open(&config.queue.path)?,
            config.queue_policies(),
            Arc::clone(&metrics),
        )?;

        let catalog_store: Arc<dyn CatalogStore> = catalog.clone();
        let record_worker = Arc::new(RecordWorker::new(
            Arc::clone(&catalog_store),
            Arc::clone(&queue),
            Arc::clone(&collaborators.recorder),
            RecordSettings {
                output_dir: config.recorder.dir.clone(),
                max_duration: config.recorder.max_duration(),
                container: config.recorder.container.clone(),
            },
        ));
        let supervisor = Arc::new(RecordSupervisor::new(
            Arc::clone(&queue),
            record_worker,
            shutdown.clone(),
        ));
        let producer = Arc::new(Producer::new(
            catalog_store,
            Arc::clone(&queue),
            config.producer.episode_limit,
        ));

        Ok(Self {
            catalog,
            queue,
            metrics,
            producer,
            supervisor,
            config,
            collaborators,
            shutdown,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn catalog_store(&self) -> Arc<dyn CatalogStore> {
        self.catalog.clone()
    }

    /// Register a consumer on every queue except `record`, which runs under
    /// the supervisor. Recovered record entries trigger it once.
    pub fn start_workers(&self) -> Result<Vec<JoinHandle<()>>> {
        let catalog = self.catalog_store();
        let queue = &self.queue;
        let shutdown = &self.shutdown;
        let fetcher = &self.collaborators.fetcher;

        let handles = vec![
            queue.consume(
                JobType::Produce,
                Arc::new(ProduceWorker::new(Arc::clone(&self.producer))),
                ConsumeMode::Forever,
                shutdown.clone(),
            )?,
            queue.consume(
                JobType::Crawl,
                Arc::new(CrawlWorker::new(
                    Arc::clone(&catalog),
                    Arc::clone(queue),
                    Arc::clone(fetcher),
                    Arc::clone(&self.collaborators.parser),
                )),
                ConsumeMode::Forever,
                shutdown.clone(),
            )?,
            queue.consume(
                JobType::Download,
                Arc::new(DownloadWorker::new(
                    Arc::clone(&catalog),
                    Arc::clone(queue),
                    Arc::clone(fetcher),
                    self.config.download.dir.clone(),
                )),
                ConsumeMode::Forever,
                shutdown.clone(),
            )?,
            queue.consume(
                JobType::RecordReserve,
                Arc::new(RecordReserveWorker::new(
                    Arc::clone(&catalog),
                    Arc::clone(queue),
                    Arc::clone(&self.supervisor),
                )),
                ConsumeMode::Forever,
                shutdown.clone(),
            )?,
            queue.consume(
                JobType::Update,
                Arc::new(UpdateWorker::new(catalog)),
                ConsumeMode::Forever,
                shutdown.clone(),
            )?,
        ];

        let recovered = queue.depth(JobType::Record);
        if recovered > 0 {
            info!(recovered, "Recovered record entries, starting record context");
            self.supervisor.trigger();
        }

        Ok(handles)
    }

    pub fn scheduler(&self) -> ProduceScheduler {
        ProduceScheduler::new(Arc::clone(&self.queue), self.config.producer.interval())
    }

    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.catalog_store(),
            Arc::clone(&self.queue),
            Some(Arc::clone(&self.supervisor)),
            self.config.reconciler_settings(),
        )
    }

    /// Reconciler for one-shot sweeps outside `run`. Requeued record entries
    /// stay in the store until a running pipeline recovers them.
    pub fn standalone_reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.catalog_store(),
            Arc::clone(&self.queue),
            None,
            self.config.reconciler_settings(),
        )
    }

    /// Wait for `tasks` and the record context, then make both stores durable.
    /// The caller cancels the shutdown token first.
    pub async fn shutdown(&self, tasks: Vec<JoinHandle<()>>) -> Result<()> {
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Pipeline task ended abnormally");
            }
        }
        self.supervisor.wait_idle().await;

        self.queue.close();
        self.queue.flush()?;
        self.catalog.persist()?;
        info!("Pipeline stopped");
        Ok(())
    }
}
