//! End-to-end pipeline tests over on-disk stores and fake collaborators
//!
//! Each test opens a full [`Pipeline`] in a temp dir: the fetcher and the
//! recorder are in-process fakes, everything else (queues, retries, catalog,
//! update applier, record supervision) is the real thing.

mod common;

use std::time::Duration;

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use common::{FEED_URL, TWO_EPISODE_FEED, TestPipeline, wait_for};
use feedpipe::catalog::{Channel, Episode, Job, JobStatus};
use feedpipe::jobs::{CrawlJobPayload, CrawlType, JobType, RecordJobParams, RecordJobPayload, UpdateJobMessage};
use feedpipe::queue::EnqueueOptions;
use feedpipe::queue::store::FAILURE_RETRIES_EXHAUSTED;
use feedpipe::testing::{FakeRecording, FakeResponse};

fn capture() -> FakeRecording {
    FakeRecording::Capture(Bytes::from_static(b"mpegts"))
}

#[tokio::test]
async fn test_crawl_result_applied_idempotently() {
    let mut t = TestPipeline::new(capture());
    let catalog = t.catalog();

    let channel = Channel::new("Example Show", FEED_URL);
    catalog.upsert_channel(&channel).await.unwrap();
    t.fetcher
        .respond(FEED_URL, FakeResponse::Body(Bytes::from_static(TWO_EPISODE_FEED.as_bytes())));

    t.start();
    let report = t.pipeline.producer.produce_all().await.unwrap();
    assert_eq!(report.crawl, 1);
    assert!(report.failures.is_empty());

    wait_for("crawl job to finish", || {
        let catalog = catalog.clone();
        async move {
            catalog
                .list_jobs_by_status(JobStatus::Done)
                .await
                .unwrap()
                .iter()
                .any(|job| job.job_type == JobType::Crawl)
        }
    })
    .await;

    let mut slugs: Vec<String> = catalog
        .list_recent_episodes(10)
        .await
        .unwrap()
        .into_iter()
        .map(|episode| episode.slug)
        .collect();
    slugs.sort();
    assert_eq!(slugs, ["e1", "e2"]);

    let crawl_job = catalog
        .list_jobs_by_status(JobStatus::Done)
        .await
        .unwrap()
        .into_iter()
        .find(|job| job.job_type == JobType::Crawl)
        .unwrap();
    assert_eq!(crawl_job.channel_id.as_deref(), Some(channel.id.as_str()));

    // Redeliver the identical success message
    let replay = UpdateJobMessage {
        job_type: JobType::Crawl,
        job_id: crawl_job.id.clone(),
        success: true,
        result: crawl_job.result.clone(),
        error: None,
        will_retry: false,
    };
    t.pipeline
        .queue
        .enqueue(JobType::Update, &replay, EnqueueOptions::for_job(&crawl_job.id))
        .unwrap();

    let metrics = t.pipeline.metrics.clone();
    wait_for("replayed update to be applied", || {
        let metrics = metrics.clone();
        async move { metrics.snapshot(JobType::Update).succeeded >= 2 }
    })
    .await;

    assert_eq!(catalog.list_recent_episodes(10).await.unwrap().len(), 2);
    let after = catalog.get_job(&crawl_job.id).await.unwrap().unwrap();
    assert_eq!(after.finished_at, crawl_job.finished_at);
    assert_eq!(after.status, JobStatus::Done);

    t.stop().await;
}

#[tokio::test]
async fn test_reservation_schedules_record_job_before_start() {
    let mut t = TestPipeline::new(capture());
    let catalog = t.catalog();

    let start = Utc::now() + ChronoDuration::minutes(10);
    let episode = Episode::new_live(
        "channel-live",
        "Morning Live",
        "https://live.example/stream",
        start,
        Some(1800),
    );
    assert!(catalog.insert_episode(&episode).await.unwrap());

    t.start();
    let report = t.pipeline.producer.produce_all().await.unwrap();
    assert_eq!(report.record_reserve, 1);

    wait_for("reservation to finish", || {
        let catalog = catalog.clone();
        let episode_id = episode.id.clone();
        async move {
            catalog
                .jobs_for_episode(&episode_id)
                .await
                .unwrap()
                .iter()
                .any(|job| job.job_type == JobType::RecordReserve && job.status == JobStatus::Done)
        }
    })
    .await;

    let record_job = t.episode_job(&episode.id, JobType::Record).await.unwrap();
    assert_eq!(record_job.status, JobStatus::Pending);
    assert_eq!(record_job.payload["duration"], 1800);
    assert_eq!(record_job.payload["streamUrl"], "https://live.example/stream");

    let reserve_job = t.episode_job(&episode.id, JobType::RecordReserve).await.unwrap();
    assert_eq!(
        reserve_job.result.as_ref().unwrap()["recordJobId"],
        record_job.id.as_str()
    );

    let scheduled = t.pipeline.queue.scheduled(JobType::Record).unwrap();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].job_id.as_deref(), Some(record_job.id.as_str()));

    let expected_ready = (start - ChronoDuration::minutes(5)).timestamp_millis();
    let skew = scheduled[0].ready_at_ms as i64 - expected_ready;
    assert!(skew.abs() < 2_000, "ready_at off by {skew}ms");

    assert!(t.pipeline.supervisor.is_active());
    assert!(t.recorder.requests().is_empty());

    t.stop().await;
}

#[tokio::test]
async fn test_record_failure_is_terminal_after_one_attempt() {
    let mut t = TestPipeline::new(FakeRecording::Exit(1));
    let catalog = t.catalog();

    let episode = Episode::new_live(
        "channel-live",
        "Starting Soon",
        "https://live.example/soon",
        Utc::now() + ChronoDuration::minutes(1),
        None,
    );
    catalog.insert_episode(&episode).await.unwrap();

    t.start();
    t.pipeline.producer.produce_all().await.unwrap();

    wait_for("record job to fail", || {
        let catalog = catalog.clone();
        let episode_id = episode.id.clone();
        async move {
            catalog
                .jobs_for_episode(&episode_id)
                .await
                .unwrap()
                .iter()
                .any(|job| job.job_type == JobType::Record && job.status == JobStatus::Error)
        }
    })
    .await;

    let record_job = t.episode_job(&episode.id, JobType::Record).await.unwrap();
    assert_eq!(record_job.attempts, 1);
    assert!(record_job.error.as_deref().unwrap().contains("Connection refused"));
    assert!(record_job.finished_at.is_some());

    let requests = t.recorder.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].stream_url, "https://live.example/soon");
    assert_eq!(requests[0].max_duration, Duration::from_secs(7200));

    let dead = t.pipeline.queue.dead_letters(10).unwrap();
    let record_dead: Vec<_> = dead
        .iter()
        .filter(|d| d.entry.queue == JobType::Record)
        .collect();
    assert_eq!(record_dead.len(), 1);
    assert_eq!(record_dead[0].attempts, 1);
    assert_eq!(record_dead[0].failure_code, FAILURE_RETRIES_EXHAUSTED);

    t.stop().await;
}

#[tokio::test]
async fn test_download_exhausts_retries_and_removes_partial_file() {
    let mut t = TestPipeline::new(capture());
    let catalog = t.catalog();

    let episode = Episode::new_static(
        "channel-1",
        "e1",
        "Episode One",
        "https://media.example/e1.mp3",
        Utc::now(),
    );
    catalog.insert_episode(&episode).await.unwrap();
    t.fetcher.respond(
        "https://media.example/e1.mp3",
        FakeResponse::Truncated(Bytes::from_static(b"partial-bytes")),
    );

    t.start();
    let report = t.pipeline.producer.produce_all().await.unwrap();
    assert_eq!(report.download, 1);

    wait_for("download job to fail", || {
        let catalog = catalog.clone();
        let episode_id = episode.id.clone();
        async move {
            catalog
                .jobs_for_episode(&episode_id)
                .await
                .unwrap()
                .iter()
                .any(|job| job.job_type == JobType::Download && job.status == JobStatus::Error)
        }
    })
    .await;

    let job = t.episode_job(&episode.id, JobType::Download).await.unwrap();
    assert_eq!(job.attempts, 3);
    assert!(job.error.as_deref().unwrap().contains("connection reset"));
    assert_eq!(t.fetcher.calls(), 3);

    let download_dir = t.pipeline.config().download.dir.clone();
    let leftovers = std::fs::read_dir(&download_dir).unwrap().count();
    assert_eq!(leftovers, 0);

    let stored = catalog.get_episode(&episode.id).await.unwrap().unwrap();
    assert_eq!(stored.size_bytes, None);

    t.stop().await;
}

#[tokio::test]
async fn test_download_into_existing_directory() {
    let mut t = TestPipeline::new(capture());
    let catalog = t.catalog();

    let download_dir = t.pipeline.config().download.dir.clone();
    std::fs::create_dir_all(&download_dir).unwrap();
    std::fs::write(download_dir.join("keep.mp3"), b"older").unwrap();

    let episode = Episode::new_static(
        "channel-1",
        "e2",
        "Episode Two",
        "https://media.example/e2.mp3",
        Utc::now(),
    );
    catalog.insert_episode(&episode).await.unwrap();
    t.fetcher.respond(
        "https://media.example/e2.mp3",
        FakeResponse::Body(Bytes::from_static(b"0123456789")),
    );

    t.start();
    t.pipeline.producer.produce_all().await.unwrap();

    wait_for("episode size to be recorded", || {
        let catalog = catalog.clone();
        let episode_id = episode.id.clone();
        async move {
            catalog
                .get_episode(&episode_id)
                .await
                .unwrap()
                .and_then(|episode| episode.size_bytes)
                == Some(10)
        }
    })
    .await;

    assert_eq!(std::fs::read_dir(&download_dir).unwrap().count(), 2);
    assert_eq!(std::fs::read(download_dir.join("keep.mp3")).unwrap(), b"older");

    t.stop().await;
}

#[tokio::test]
async fn test_producer_suppresses_duplicate_emissions() {
    let t = TestPipeline::new(capture());
    let catalog = t.catalog();

    let static_episode = Episode::new_static(
        "channel-1",
        "e1",
        "Episode One",
        "https://media.example/e1.mp3",
        Utc::now(),
    );
    let live_episode = Episode::new_live(
        "channel-1",
        "Tonight",
        "https://live.example/tonight",
        Utc::now() + ChronoDuration::hours(3),
        None,
    );
    let past_live = Episode::new_live(
        "channel-1",
        "Last Week",
        "https://live.example/old",
        Utc::now() - ChronoDuration::days(7),
        None,
    );
    let mut downloaded = Episode::new_static(
        "channel-1",
        "e0",
        "Episode Zero",
        "https://media.example/e0.mp3",
        Utc::now(),
    );
    downloaded.size_bytes = Some(42);
    for episode in [&static_episode, &live_episode, &past_live, &downloaded] {
        catalog.insert_episode(episode).await.unwrap();
    }

    let first = t.pipeline.producer.produce_all().await.unwrap();
    assert_eq!((first.crawl, first.download, first.record_reserve), (0, 1, 1));

    let second = t.pipeline.producer.produce_all().await.unwrap();
    assert_eq!(second.emitted(), 0);

    assert_eq!(t.pipeline.queue.depth(JobType::Download), 1);
    assert_eq!(t.pipeline.queue.depth(JobType::RecordReserve), 1);

    t.stop().await;
}

#[tokio::test]
async fn test_reconciler_requeues_orphans_and_prunes() {
    let t = TestPipeline::new(capture());
    let catalog = t.catalog();
    let now = Utc::now();

    let orphan_payload = CrawlJobPayload {
        job_id: "orphan-crawl".to_string(),
        target_url: FEED_URL.to_string(),
        crawl_type: CrawlType::Rss,
    };
    let mut orphan = Job::pending(
        "orphan-crawl",
        JobType::Crawl,
        serde_json::to_value(&orphan_payload).unwrap(),
    );
    orphan.created_at = now - ChronoDuration::hours(1);
    catalog.create_job(&orphan).await.unwrap();

    let record_start = now + ChronoDuration::minutes(20);
    let record_payload = RecordJobPayload {
        job_id: "orphan-record".to_string(),
        params: RecordJobParams {
            episode_id: "ep-live".to_string(),
            stream_url: "https://live.example/stream".to_string(),
            start_time: record_start,
            duration: None,
        },
    };
    let mut orphan_record = Job::pending(
        "orphan-record",
        JobType::Record,
        serde_json::to_value(&record_payload).unwrap(),
    )
    .with_episode("ep-live");
    orphan_record.created_at = now - ChronoDuration::hours(1);
    catalog.create_job(&orphan_record).await.unwrap();

    let fresh = Job::pending("fresh", JobType::Crawl, serde_json::to_value(&orphan_payload).unwrap());
    catalog.create_job(&fresh).await.unwrap();

    let mut finished = Job::pending("finished", JobType::Download, serde_json::json!({}));
    finished.status = JobStatus::Done;
    finished.finished_at = Some(now - ChronoDuration::days(40));
    catalog.create_job(&finished).await.unwrap();

    let reconciler = t.pipeline.reconciler();
    let report = reconciler.run_once(now).await.unwrap();
    assert_eq!(report.requeued, 2);
    assert_eq!(report.jobs_pruned, 1);
    assert!(report.failures.is_empty());

    let crawl_entries = t.pipeline.queue.scheduled(JobType::Crawl).unwrap();
    assert_eq!(crawl_entries.len(), 1);
    assert_eq!(crawl_entries[0].job_id.as_deref(), Some("orphan-crawl"));
    assert_eq!(crawl_entries[0].payload, orphan.payload);

    let record_entries = t.pipeline.queue.scheduled(JobType::Record).unwrap();
    assert_eq!(record_entries.len(), 1);
    let expected_ready = (record_start - ChronoDuration::minutes(5)).timestamp_millis();
    assert!((record_entries[0].ready_at_ms as i64 - expected_ready).abs() < 2_000);
    assert!(t.pipeline.supervisor.is_active());

    assert!(catalog.get_job("finished").await.unwrap().is_none());

    let again = reconciler.run_once(now).await.unwrap();
    assert_eq!(again.requeued, 0);

    t.stop().await;
}

#[tokio::test]
async fn test_standalone_reconcile_leaves_recording_to_running_pipeline() {
    let t = TestPipeline::new(capture());
    let catalog = t.catalog();
    let now = Utc::now();

    let payload = RecordJobPayload {
        job_id: "late-record".to_string(),
        params: RecordJobParams {
            episode_id: "ep-late".to_string(),
            stream_url: "https://live.example/late".to_string(),
            start_time: now + ChronoDuration::hours(2),
            duration: None,
        },
    };
    let mut orphan = Job::pending(
        "late-record",
        JobType::Record,
        serde_json::to_value(&payload).unwrap(),
    )
    .with_episode("ep-late");
    orphan.created_at = now - ChronoDuration::hours(1);
    catalog.create_job(&orphan).await.unwrap();

    let report = t.pipeline.standalone_reconciler().run_once(now).await.unwrap();
    assert_eq!(report.requeued, 1);
    assert!(!t.pipeline.supervisor.is_active());
    assert_eq!(t.pipeline.queue.depth(JobType::Record), 1);

    let recorder = t.recorder.clone();
    tokio::time::timeout(Duration::from_secs(3), t.stop())
        .await
        .expect("shutdown waited on the delayed recording");
    assert!(recorder.requests().is_empty());
}
