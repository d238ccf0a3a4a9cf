use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::fetch::HttpConfig;
use crate::jobs::JobType;
use crate::producer::ReconcilerSettings;
use crate::queue::{Backoff, QueuePolicy, RetryPolicy};
use crate::recorder::FfmpegConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Per-queue overrides keyed by queue name
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerOverride>,
}

/// Ops server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

/// Durable queue broker
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: default_queue_path(),
        }
    }
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("data/queue")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("data/catalog")
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DownloadConfig {
    #[serde(default = "default_download_dir")]
    pub dir: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            dir: default_download_dir(),
        }
    }
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("data/downloads")
}

/// Live stream recording
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderConfig {
    #[serde(default = "default_record_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    /// Cap for jobs that carry no duration
    #[serde(default = "default_max_duration_secs")]
    pub max_duration_secs: u64,
    /// Output file extension
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            dir: default_record_dir(),
            ffmpeg_path: default_ffmpeg_path(),
            max_duration_secs: default_max_duration_secs(),
            container: default_container(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

impl RecorderConfig {
    pub fn ffmpeg(&self) -> FfmpegConfig {
        FfmpegConfig {
            binary_path: self.ffmpeg_path.clone(),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
        }
    }

    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs)
    }
}

fn default_record_dir() -> PathBuf {
    PathBuf::from("data/recordings")
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_max_duration_secs() -> u64 {
    7200
}

fn default_container() -> String {
    "ts".to_string()
}

fn default_stop_grace_secs() -> u64 {
    10
}

/// Outbound HTTP client
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    pub user_agent: Option<String>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            user_agent: None,
        }
    }
}

impl HttpSettings {
    pub fn client(&self) -> HttpConfig {
        let defaults = HttpConfig::default();
        HttpConfig {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    #[serde(default = "default_produce_interval_secs")]
    pub interval_secs: u64,
    /// Recent episodes considered per pass
    #[serde(default = "default_episode_limit")]
    pub episode_limit: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_produce_interval_secs(),
            episode_limit: default_episode_limit(),
        }
    }
}

impl ProducerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_produce_interval_secs() -> u64 {
    crate::producer::DEFAULT_PRODUCE_INTERVAL.as_secs()
}

fn default_episode_limit() -> usize {
    crate::producer::DEFAULT_EPISODE_LIMIT
}

/// Orphaned Pending job sweep
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_reconcile_interval_secs() -> u64 {
    600
}

fn default_stale_after_secs() -> u64 {
    900
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionConfig {
    #[serde(default = "default_job_ttl_days")]
    pub job_ttl_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            job_ttl_days: default_job_ttl_days(),
        }
    }
}

fn default_job_ttl_days() -> u32 {
    30
}

/// Overrides of one queue's built-in policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct WorkerOverride {
    pub concurrency: Option<usize>,
    pub rate_per_sec: Option<u32>,
    pub max_attempts: Option<u32>,
    pub backoff_ms: Option<u64>,
}

impl WorkerOverride {
    fn apply(&self, mut policy: QueuePolicy) -> QueuePolicy {
        if let Some(concurrency) = self.concurrency {
            policy.concurrency = concurrency;
        }
        if let Some(rate) = self.rate_per_sec {
            policy.rate_per_sec = (rate > 0).then_some(rate);
        }
        if let Some(max_attempts) = self.max_attempts {
            policy.retry.max_attempts = max_attempts;
        }
        if let Some(base_ms) = self.backoff_ms {
            policy.retry.backoff = Some(Backoff::Exponential { base_ms });
        }
        if policy.retry.max_attempts <= 1 {
            policy.retry = RetryPolicy::no_retry();
        }
        policy
    }
}

/// Queue name as written in config keys: `record-reserve` or `record_reserve`
pub fn parse_queue_name(name: &str) -> Option<JobType> {
    name.replace('_', "-").parse().ok()
}

impl Config {
    /// Built-in queue policies with the `workers` overrides applied
    pub fn queue_policies(&self) -> Vec<QueuePolicy> {
        JobType::ALL
            .into_iter()
            .map(|job_type| {
                let policy = QueuePolicy::default_for(job_type);
                self.workers
                    .iter()
                    .filter(|(name, _)| parse_queue_name(name) == Some(job_type))
                    .fold(policy, |policy, (_, over)| over.apply(policy))
            })
            .collect()
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            interval: Duration::from_secs(self.reconcile.interval_secs),
            stale_after: Duration::from_secs(self.reconcile.stale_after_secs),
            job_ttl: Duration::from_secs(u64::from(self.retention.job_ttl_days) * 24 * 60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.recorder.max_duration_secs, 7200);
        assert_eq!(config.recorder.container, "ts");
        assert_eq!(config.producer.interval_secs, 600);
        assert_eq!(config.reconcile.stale_after_secs, 900);
        assert_eq!(config.retention.job_ttl_days, 30);
        assert_eq!(config.queue_policies(), QueuePolicy::defaults());
    }

    #[test]
    fn test_worker_override_applies_to_named_queue() {
        let mut config = Config::default();
        config.workers.insert(
            "record_reserve".to_string(),
            WorkerOverride {
                concurrency: Some(2),
                max_attempts: Some(4),
                ..Default::default()
            },
        );
        config.workers.insert(
            "crawl".to_string(),
            WorkerOverride {
                rate_per_sec: Some(0),
                backoff_ms: Some(250),
                ..Default::default()
            },
        );

        let policies = config.queue_policies();
        let reserve = policies
            .iter()
            .find(|p| p.job_type == JobType::RecordReserve)
            .unwrap();
        assert_eq!(reserve.concurrency, 2);
        assert_eq!(reserve.retry.max_attempts, 4);

        let crawl = policies.iter().find(|p| p.job_type == JobType::Crawl).unwrap();
        assert_eq!(crawl.rate_per_sec, None);
        assert_eq!(crawl.retry, RetryPolicy::exponential(3, 250));

        let download = policies
            .iter()
            .find(|p| p.job_type == JobType::Download)
            .unwrap();
        assert_eq!(*download, QueuePolicy::default_for(JobType::Download));
    }

    #[test]
    fn test_parse_queue_name() {
        assert_eq!(parse_queue_name("record-reserve"), Some(JobType::RecordReserve));
        assert_eq!(parse_queue_name("record_reserve"), Some(JobType::RecordReserve));
        assert_eq!(parse_queue_name("transcode"), None);
    }

    #[test]
    fn test_reconciler_settings_from_config() {
        let config = Config::default();
        let settings = config.reconciler_settings();
        assert_eq!(settings.stale_after, Duration::from_secs(900));
        assert_eq!(settings.job_ttl, Duration::from_secs(30 * 86_400));
    }
}
