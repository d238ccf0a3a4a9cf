use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::error::{CatalogError, Result};
use super::models::{
    Channel, Episode, FinishOutcome, Job, JobCompletion, JobStatus, StartOutcome,
};
use super::partitions::{
    decode_job_episode_key, encode_channel_key, encode_episode_key, encode_job_episode_key,
    encode_job_episode_prefix, encode_job_key, encode_meta_key, encode_slug_key,
};
use super::pruning::{PruneStats, last_prune, prune_finished_jobs};

/// Durable store of channels, episodes and jobs
///
/// Every component that reads or mutates catalog state receives one of these
/// explicitly.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_channels(&self) -> Result<Vec<Channel>>;

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>>;

    async fn upsert_channel(&self, channel: &Channel) -> Result<()>;

    /// Most recent episodes across channels, newest `published_at` first
    async fn list_recent_episodes(&self, limit: usize) -> Result<Vec<Episode>>;

    async fn get_episode(&self, episode_id: &str) -> Result<Option<Episode>>;

    async fn find_episode_by_slug(&self, channel_id: &str, slug: &str)
    -> Result<Option<Episode>>;

    /// Insert unless the channel already has an episode with the same slug.
    ///
    /// Returns `false` when the slug was taken.
    async fn insert_episode(&self, episode: &Episode) -> Result<bool>;

    async fn update_episode_size(&self, episode_id: &str, size_bytes: u64) -> Result<()>;

    /// Persist a new Pending job
    async fn create_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Mark a job Working at the start of a delivery and count the attempt
    async fn start_job(&self, job_id: &str) -> Result<StartOutcome>;

    /// Keep the error of an attempt that will be retried, without finishing the job
    async fn record_attempt_error(&self, job_id: &str, error: &str) -> Result<()>;

    /// Write the terminal status together with result or error and `finishedAt`.
    ///
    /// The first terminal write wins.
    async fn finish_job(&self, job_id: &str, completion: JobCompletion) -> Result<FinishOutcome>;

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    async fn jobs_for_episode(&self, episode_id: &str) -> Result<Vec<Job>>;

    /// Drop finished jobs whose `finishedAt` is before `cutoff`
    async fn prune_finished(&self, cutoff: DateTime<Utc>) -> Result<PruneStats>;
}

/// Fjall-backed catalog
#[derive(Clone)]
pub struct FjallCatalog {
    keyspace: Keyspace,
    channels: PartitionHandle,
    episodes: PartitionHandle,
    episode_slugs: PartitionHandle,
    jobs: PartitionHandle,
    job_episodes: PartitionHandle,
    metadata: PartitionHandle,
    /// Serializes check-then-write sequences
    write_lock: Arc<Mutex<()>>,
}

impl FjallCatalog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening catalog at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;

        let channels = keyspace.open_partition("channels", PartitionCreateOptions::default())?;
        let episodes = keyspace.open_partition("episodes", PartitionCreateOptions::default())?;
        let episode_slugs =
            keyspace.open_partition("episode_slugs", PartitionCreateOptions::default())?;
        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let job_episodes =
            keyspace.open_partition("job_episodes", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        info!("Catalog opened successfully");
        Ok(Self {
            keyspace,
            channels,
            episodes,
            episode_slugs,
            jobs,
            job_episodes,
            metadata,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn read<T: DeserializeOwned>(partition: &PartitionHandle, key: Vec<u8>) -> Result<Option<T>> {
        match partition.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(partition: &PartitionHandle) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        for item in partition.iter() {
            let (_, value) = item?;
            rows.push(serde_json::from_slice(&value)?);
        }
        Ok(rows)
    }

    fn write<T: Serialize>(partition: &PartitionHandle, key: Vec<u8>, row: &T) -> Result<()> {
        partition.insert(key, serde_json::to_vec(row)?)?;
        Ok(())
    }

    fn load_job(&self, job_id: &str) -> Result<Job> {
        Self::read(&self.jobs, encode_job_key(job_id))?
            .ok_or_else(|| CatalogError::JobNotFound(job_id.to_string()))
    }

    fn save_job(&self, job: &Job) -> Result<()> {
        Self::write(&self.jobs, encode_job_key(&job.id), job)
    }

    pub fn last_prune(&self) -> Result<Option<DateTime<Utc>>> {
        last_prune(&self.metadata)
    }

    /// Persist all pending writes to disk
    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(encode_meta_key("health"))?;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for FjallCatalog {
    async fn list_channels(&self) -> Result<Vec<Channel>> {
        Self::scan(&self.channels)
    }

    async fn get_channel(&self, channel_id: &str) -> Result<Option<Channel>> {
        Self::read(&self.channels, encode_channel_key(channel_id))
    }

    async fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        Self::write(&self.channels, encode_channel_key(&channel.id), channel)?;
        debug!(channel_id = %channel.id, "Upserted channel");
        Ok(())
    }

    async fn list_recent_episodes(&self, limit: usize) -> Result<Vec<Episode>> {
        let mut episodes: Vec<Episode> = Self::scan(&self.episodes)?;
        episodes.sort_by(|a, b| b.published_at.cmp(&a.published_at));
        episodes.truncate(limit);
        Ok(episodes)
    }

    async fn get_episode(&self, episode_id: &str) -> Result<Option<Episode>> {
        Self::read(&self.episodes, encode_episode_key(episode_id))
    }

    async fn find_episode_by_slug(
        &self,
        channel_id: &str,
        slug: &str,
    ) -> Result<Option<Episode>> {
        let Some(episode_id) = self.episode_slugs.get(encode_slug_key(channel_id, slug))? else {
            return Ok(None);
        };
        let episode_id = String::from_utf8_lossy(&episode_id).to_string();
        self.get_episode(&episode_id).await
    }

    async fn insert_episode(&self, episode: &Episode) -> Result<bool> {
        let slug_key = encode_slug_key(&episode.channel_id, &episode.slug);

        let _guard = self.write_lock.lock();
        if self.episode_slugs.contains_key(&slug_key)? {
            debug!(
                channel_id = %episode.channel_id,
                slug = %episode.slug,
                "Episode slug already present"
            );
            return Ok(false);
        }

        let mut batch = self.keyspace.batch();
        batch.insert(
            &self.episodes,
            encode_episode_key(&episode.id),
            serde_json::to_vec(episode)?,
        );
        batch.insert(&self.episode_slugs, slug_key, episode.id.as_bytes());
        batch.commit()?;

        debug!(episode_id = %episode.id, channel_id = %episode.channel_id, "Inserted episode");
        Ok(true)
    }

    async fn update_episode_size(&self, episode_id: &str, size_bytes: u64) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut episode: Episode = Self::read(&self.episodes, encode_episode_key(episode_id))?
            .ok_or_else(|| CatalogError::EpisodeNotFound(episode_id.to_string()))?;
        episode.size_bytes = Some(size_bytes);
        Self::write(&self.episodes, encode_episode_key(episode_id), &episode)?;
        debug!(episode_id, size_bytes, "Updated episode size");
        Ok(())
    }

    async fn create_job(&self, job: &Job) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.jobs.contains_key(encode_job_key(&job.id))? {
            return Err(CatalogError::DuplicateJob(job.id.clone()));
        }

        let mut batch = self.keyspace.batch();
        batch.insert(&self.jobs, encode_job_key(&job.id), serde_json::to_vec(job)?);
        if let Some(episode_id) = &job.episode_id {
            batch.insert(
                &self.job_episodes,
                encode_job_episode_key(episode_id, &job.id),
                b"".to_vec(),
            );
        }
        batch.commit()?;

        debug!(job_id = %job.id, job_type = %job.job_type, "Created job");
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Self::read(&self.jobs, encode_job_key(job_id))
    }

    async fn start_job(&self, job_id: &str) -> Result<StartOutcome> {
        let _guard = self.write_lock.lock();
        let mut job = self.load_job(job_id)?;

        let outcome = match job.status {
            JobStatus::Done | JobStatus::Error => return Ok(StartOutcome::AlreadyFinished(job.status)),
            JobStatus::Working => StartOutcome::AlreadyWorking,
            JobStatus::Pending => StartOutcome::Started,
        };

        let now = Utc::now();
        job.status = JobStatus::Working;
        job.attempts += 1;
        job.started_at.get_or_insert(now);
        job.updated_at = now;
        self.save_job(&job)?;

        debug!(job_id, attempts = job.attempts, ?outcome, "Job working");
        Ok(outcome)
    }

    async fn record_attempt_error(&self, job_id: &str, error: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut job = self.load_job(job_id)?;
        if job.status.is_terminal() {
            return Ok(());
        }
        job.last_error = Some(error.to_string());
        job.updated_at = Utc::now();
        self.save_job(&job)
    }

    async fn finish_job(&self, job_id: &str, completion: JobCompletion) -> Result<FinishOutcome> {
        let _guard = self.write_lock.lock();
        let mut job = self.load_job(job_id)?;
        if job.status.is_terminal() {
            debug!(job_id, status = ?job.status, "Job already finished, keeping first result");
            return Ok(FinishOutcome::AlreadyFinished(job.status));
        }

        let now = Utc::now();
        match completion {
            JobCompletion::Done(result) => {
                job.status = JobStatus::Done;
                job.result = result;
            }
            JobCompletion::Failed(error) => {
                job.status = JobStatus::Error;
                job.error = Some(error);
            }
        }
        job.started_at.get_or_insert(now);
        job.updated_at = now;
        job.finished_at = Some(now);
        self.save_job(&job)?;

        debug!(job_id, status = ?job.status, "Job finished");
        Ok(FinishOutcome::Finished)
    }

    async fn list_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let jobs: Vec<Job> = Self::scan(&self.jobs)?;
        Ok(jobs.into_iter().filter(|job| job.status == status).collect())
    }

    async fn jobs_for_episode(&self, episode_id: &str) -> Result<Vec<Job>> {
        let mut job_ids = Vec::new();
        for item in self.job_episodes.prefix(encode_job_episode_prefix(episode_id)) {
            let (key, _) = item?;
            job_ids.extend(decode_job_episode_key(&key));
        }

        let mut jobs = Vec::new();
        for job_id in job_ids {
            if let Some(job) = Self::read::<Job>(&self.jobs, encode_job_key(&job_id))? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    async fn prune_finished(&self, cutoff: DateTime<Utc>) -> Result<PruneStats> {
        let _guard = self.write_lock.lock();
        prune_finished_jobs(
            &self.keyspace,
            &self.jobs,
            &self.job_episodes,
            &self.metadata,
            cutoff,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobType;
    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_catalog() -> (FjallCatalog, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let catalog = FjallCatalog::open(temp_dir.path().join("catalog")).unwrap();
        (catalog, temp_dir)
    }

    fn episode(channel_id: &str, slug: &str, published_at: DateTime<Utc>) -> Episode {
        Episode::new_static(channel_id, slug, slug, "https://cdn.example/a.mp3", published_at)
    }

    #[tokio::test]
    async fn test_channel_roundtrip() {
        let (catalog, _temp) = create_test_catalog();
        let channel = Channel::new("Daily News", "https://feed.example/rss");

        catalog.upsert_channel(&channel).await.unwrap();

        assert_eq!(catalog.get_channel(&channel.id).await.unwrap(), Some(channel.clone()));
        assert_eq!(catalog.list_channels().await.unwrap(), vec![channel]);
        assert!(catalog.get_channel("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_episode_dedupes_by_channel_slug() {
        let (catalog, _temp) = create_test_catalog();
        let now = Utc::now();

        assert!(catalog.insert_episode(&episode("ch1", "e1", now)).await.unwrap());
        assert!(!catalog.insert_episode(&episode("ch1", "e1", now)).await.unwrap());
        assert!(catalog.insert_episode(&episode("ch2", "e1", now)).await.unwrap());

        let found = catalog.find_episode_by_slug("ch1", "e1").await.unwrap().unwrap();
        assert_eq!(found.slug, "e1");
        assert_eq!(catalog.list_recent_episodes(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_recent_episodes_newest_first_with_limit() {
        let (catalog, _temp) = create_test_catalog();
        let now = Utc::now();

        for (slug, age_days) in [("old", 3), ("new", 0), ("mid", 1)] {
            let ep = episode("ch", slug, now - Duration::days(age_days));
            catalog.insert_episode(&ep).await.unwrap();
        }

        let recent = catalog.list_recent_episodes(2).await.unwrap();
        let slugs: Vec<&str> = recent.iter().map(|e| e.slug.as_str()).collect();
        assert_eq!(slugs, vec!["new", "mid"]);
    }

    #[tokio::test]
    async fn test_update_episode_size() {
        let (catalog, _temp) = create_test_catalog();
        let ep = episode("ch", "e1", Utc::now());
        catalog.insert_episode(&ep).await.unwrap();

        catalog.update_episode_size(&ep.id, 1024).await.unwrap();
        let stored = catalog.get_episode(&ep.id).await.unwrap().unwrap();
        assert_eq!(stored.size_bytes, Some(1024));

        let missing = catalog.update_episode_size("nope", 1).await;
        assert!(matches!(missing, Err(CatalogError::EpisodeNotFound(_))));
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let (catalog, _temp) = create_test_catalog();
        let job = Job::pending("job-1", JobType::Download, json!({ "jobId": "job-1" }))
            .with_episode("ep-1");
        catalog.create_job(&job).await.unwrap();

        assert_eq!(catalog.start_job("job-1").await.unwrap(), StartOutcome::Started);
        assert_eq!(
            catalog.start_job("job-1").await.unwrap(),
            StartOutcome::AlreadyWorking
        );

        catalog.record_attempt_error("job-1", "timeout").await.unwrap();

        let outcome = catalog
            .finish_job("job-1", JobCompletion::Done(Some(json!({ "size": 10 }))))
            .await
            .unwrap();
        assert_eq!(outcome, FinishOutcome::Finished);

        let stored = catalog.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
        assert_eq!(stored.result, Some(json!({ "size": 10 })));
        assert!(stored.finished_at.is_some());

        assert_eq!(
            catalog.start_job("job-1").await.unwrap(),
            StartOutcome::AlreadyFinished(JobStatus::Done)
        );
    }

    #[tokio::test]
    async fn test_first_terminal_write_wins() {
        let (catalog, _temp) = create_test_catalog();
        catalog
            .create_job(&Job::pending("job-1", JobType::Crawl, json!({})))
            .await
            .unwrap();

        catalog
            .finish_job("job-1", JobCompletion::Failed("boom".into()))
            .await
            .unwrap();
        let second = catalog
            .finish_job("job-1", JobCompletion::Done(None))
            .await
            .unwrap();
        assert_eq!(second, FinishOutcome::AlreadyFinished(JobStatus::Error));

        let stored = catalog.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert!(stored.result.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_job_rejected() {
        let (catalog, _temp) = create_test_catalog();
        let job = Job::pending("job-1", JobType::Crawl, json!({}));
        catalog.create_job(&job).await.unwrap();
        assert!(matches!(
            catalog.create_job(&job).await,
            Err(CatalogError::DuplicateJob(_))
        ));
    }

    #[tokio::test]
    async fn test_jobs_for_episode_and_by_status() {
        let (catalog, _temp) = create_test_catalog();
        for (id, episode_id) in [("a", "ep-1"), ("b", "ep-1"), ("c", "ep-10")] {
            let job = Job::pending(id, JobType::Download, json!({})).with_episode(episode_id);
            catalog.create_job(&job).await.unwrap();
        }
        catalog.start_job("a").await.unwrap();

        let mut ids: Vec<String> = catalog
            .jobs_for_episode("ep-1")
            .await
            .unwrap()
            .into_iter()
            .map(|job| job.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);

        let pending = catalog.list_jobs_by_status(JobStatus::Pending).await.unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_jobs_for_episode_runs_on_spawned_task() {
        let (catalog, _temp) = create_test_catalog();
        let job = Job::pending("spawned", JobType::Record, json!({})).with_episode("ep-s");
        catalog.create_job(&job).await.unwrap();

        let store: Arc<dyn CatalogStore> = Arc::new(catalog);
        let jobs = tokio::spawn(async move { store.jobs_for_episode("ep-s").await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "spawned");
    }

    #[tokio::test]
    async fn test_prune_removes_only_old_finished_jobs() {
        let (catalog, _temp) = create_test_catalog();
        for id in ["done", "pending"] {
            let job = Job::pending(id, JobType::Download, json!({})).with_episode("ep");
            catalog.create_job(&job).await.unwrap();
        }
        catalog
            .finish_job("done", JobCompletion::Done(None))
            .await
            .unwrap();

        let kept = catalog.prune_finished(Utc::now() - Duration::days(1)).await.unwrap();
        assert_eq!(kept.jobs_pruned, 0);

        let stats = catalog.prune_finished(Utc::now() + Duration::seconds(1)).await.unwrap();
        assert_eq!(stats.jobs_pruned, 1);
        assert!(catalog.get_job("done").await.unwrap().is_none());
        assert!(catalog.get_job("pending").await.unwrap().is_some());
        assert_eq!(catalog.jobs_for_episode("ep").await.unwrap().len(), 1);
        assert!(catalog.last_prune().unwrap().is_some());
    }
}
