use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::JobType;

/// Fresh time-ordered id for catalog rows
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Lowercase ASCII slug with single hyphens between words
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub title: String,
    /// Feed endpoint
    pub rss_url: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

impl Channel {
    pub fn new(title: impl Into<String>, rss_url: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: new_id(),
            slug: slugify(&title),
            title,
            rss_url: rss_url.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeType {
    Static,
    Live,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub channel_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub episode_type: EpisodeType,
    pub audio_url: String,
    /// Announced start of a live stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Planned recording length of a live stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    /// Filled after download or recording
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub published_at: DateTime<Utc>,
    /// Unique per channel; crawled episodes use their feed identifier
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

impl Episode {
    pub fn new_static(
        channel_id: impl Into<String>,
        slug: impl Into<String>,
        title: impl Into<String>,
        audio_url: impl Into<String>,
        published_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_id(),
            channel_id: channel_id.into(),
            title: title.into(),
            episode_type: EpisodeType::Static,
            audio_url: audio_url.into(),
            scheduled_at: None,
            duration_secs: None,
            size_bytes: None,
            published_at,
            slug: slug.into(),
            created_at: Utc::now(),
        }
    }

    pub fn new_live(
        channel_id: impl Into<String>,
        title: impl Into<String>,
        stream_url: impl Into<String>,
        scheduled_at: DateTime<Utc>,
        duration_secs: Option<u64>,
    ) -> Self {
        let title = title.into();
        let slug = format!("{}-{}", slugify(&title), scheduled_at.format("%Y%m%d%H%M"));
        Self {
            id: new_id(),
            channel_id: channel_id.into(),
            title,
            episode_type: EpisodeType::Live,
            audio_url: stream_url.into(),
            scheduled_at: Some(scheduled_at),
            duration_secs,
            size_bytes: None,
            published_at: scheduled_at,
            slug,
            created_at: Utc::now(),
        }
    }

    pub fn is_downloaded(&self) -> bool {
        self.size_bytes.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Working,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

/// Persisted record of one unit of pipeline work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub payload: Value,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Terminal error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Most recent error of an attempt that will be retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Deliveries started
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A Pending job whose payload is filled in once the id is known
    pub fn pending(id: impl Into<String>, job_type: JobType, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            job_type,
            payload,
            status: JobStatus::Pending,
            result: None,
            error: None,
            last_error: None,
            attempts: 0,
            channel_id: None,
            episode_id: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            finished_at: None,
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_episode(mut self, episode_id: impl Into<String>) -> Self {
        self.episode_id = Some(episode_id.into());
        self
    }
}

/// Result of marking a job Working at the start of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Redelivery of a job already marked Working
    AlreadyWorking,
    /// The job reached a terminal state; the delivery is a duplicate
    AlreadyFinished(JobStatus),
}

/// Terminal write applied by the update applier
#[derive(Debug, Clone, PartialEq)]
pub enum JobCompletion {
    Done(Option<Value>),
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishOutcome {
    Finished,
    /// A terminal state was already recorded and kept
    AlreadyFinished(JobStatus),
}
