use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kinds of pipeline work. Each kind has exactly one queue of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    Produce,
    Crawl,
    Download,
    RecordReserve,
    Record,
    Update,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::Produce,
        JobType::Crawl,
        JobType::Download,
        JobType::RecordReserve,
        JobType::Record,
        JobType::Update,
    ];

    /// Queue name carrying this kind of job
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Produce => "produce",
            JobType::Crawl => "crawl",
            JobType::Download => "download",
            JobType::RecordReserve => "record-reserve",
            JobType::Record => "record",
            JobType::Update => "update",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown job type: {s}"))
    }
}

/// How a crawl target is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrawlType {
    Rss,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlJobPayload {
    pub job_id: String,
    pub target_url: String,
    pub crawl_type: CrawlType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadJobPayload {
    pub job_id: String,
    pub target_url: String,
}

/// Parameters of the Record job a reservation will create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordJobParams {
    pub episode_id: String,
    pub stream_url: String,
    pub start_time: DateTime<Utc>,
    /// Recording length in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordReserveJobPayload {
    pub job_id: String,
    pub record_job_params: RecordJobParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordJobPayload {
    pub job_id: String,
    #[serde(flatten)]
    pub params: RecordJobParams,
}

/// Trigger for one producer pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub requested_at: DateTime<Utc>,
}
