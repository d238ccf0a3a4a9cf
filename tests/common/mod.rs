//! Shared fixtures for pipeline integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use feedpipe::catalog::{CatalogStore, Job};
use feedpipe::config::{Config, WorkerOverride};
use feedpipe::fetch::XmlFeedParser;
use feedpipe::jobs::JobType;
use feedpipe::pipeline::{Collaborators, Pipeline};
use feedpipe::testing::{FakeFetcher, FakeRecorder, FakeRecording};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const FEED_URL: &str = "https://feed.example/rss";

pub const TWO_EPISODE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>Example Show</title>
    <item>
      <title>Episode One</title>
      <guid>e1</guid>
      <pubDate>Tue, 10 Jun 2025 04:00:00 GMT</pubDate>
      <enclosure url="https://media.example/e1.mp3" length="1024" type="audio/mpeg"/>
    </item>
    <item>
      <title>Episode Two</title>
      <guid>e2</guid>
      <pubDate>Wed, 11 Jun 2025 04:00:00 GMT</pubDate>
      <enclosure url="https://media.example/e2.mp3" length="2048" type="audio/mpeg"/>
    </item>
  </channel>
</rss>"#;

pub struct TestPipeline {
    pub dir: TempDir,
    pub pipeline: Pipeline,
    pub fetcher: Arc<FakeFetcher>,
    pub recorder: Arc<FakeRecorder>,
    pub shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Config rooted in `dir` with fast retries and no rate limits
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.queue.path = dir.path().join("queue");
    config.catalog.path = dir.path().join("catalog");
    config.download.dir = dir.path().join("downloads");
    config.recorder.dir = dir.path().join("recordings");

    for queue in ["crawl", "download", "record-reserve", "update", "produce"] {
        config.workers.insert(
            queue.to_string(),
            WorkerOverride {
                rate_per_sec: Some(0),
                backoff_ms: Some(10),
                ..Default::default()
            },
        );
    }
    config
}

impl TestPipeline {
    pub fn new(recording: FakeRecording) -> Self {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let fetcher = Arc::new(FakeFetcher::new());
        let recorder = Arc::new(FakeRecorder::new(recording));
        let shutdown = CancellationToken::new();

        let collaborators = Collaborators {
            fetcher: fetcher.clone(),
            parser: Arc::new(XmlFeedParser),
            recorder: recorder.clone(),
        };
        let pipeline = Pipeline::open(config, collaborators, shutdown.clone()).unwrap();

        Self {
            dir,
            pipeline,
            fetcher,
            recorder,
            shutdown,
            tasks: Vec::new(),
        }
    }

    pub fn catalog(&self) -> Arc<dyn CatalogStore> {
        self.pipeline.catalog_store()
    }

    pub fn start(&mut self) {
        self.tasks = self.pipeline.start_workers().unwrap();
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut self.tasks);
        self.pipeline.shutdown(tasks).await.unwrap();
    }

    /// The only job of `job_type` attached to `episode_id`
    pub async fn episode_job(&self, episode_id: &str, job_type: JobType) -> Option<Job> {
        self.catalog()
            .jobs_for_episode(episode_id)
            .await
            .unwrap()
            .into_iter()
            .find(|job| job.job_type == job_type)
    }
}

/// Poll `check` until it holds, panicking after ten seconds
pub async fn wait_for<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
