use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::results::{CrawlResult, DownloadResult, JobResult, RecordReserveResult, RecordResult};
use super::types::JobType;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unknown job type in update message: {0}")]
    UnknownJobType(JobType),

    #[error("successful {job_type} update for job {job_id} carries no result")]
    MissingResult { job_type: JobType, job_id: String },

    #[error("malformed {job_type} result for job {job_id}: {source}")]
    MalformedResult {
        job_type: JobType,
        job_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of one job attempt, sent by a worker to the update queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobMessage {
    pub job_type: JobType,
    pub job_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set when the queue will redeliver the failed attempt
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub will_retry: bool,
}

impl UpdateJobMessage {
    pub fn success<R: Serialize>(
        job_type: JobType,
        job_id: impl Into<String>,
        result: &R,
    ) -> Result<Self, MessageError> {
        Ok(Self {
            job_type,
            job_id: job_id.into(),
            success: true,
            result: Some(serde_json::to_value(result)?),
            error: None,
            will_retry: false,
        })
    }

    pub fn failure(
        job_type: JobType,
        job_id: impl Into<String>,
        error: impl Into<String>,
        will_retry: bool,
    ) -> Self {
        Self {
            job_type,
            job_id: job_id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            will_retry,
        }
    }

    /// Resolve the untyped result into the variant matching `job_type`.
    ///
    /// Returns `Ok(None)` for failure messages. Job types that never produce
    /// update messages are rejected.
    pub fn typed_result(&self) -> Result<Option<JobResult>, MessageError> {
        match self.job_type {
            JobType::Update | JobType::Produce => {
                return Err(MessageError::UnknownJobType(self.job_type));
            }
            _ => {}
        }

        if !self.success {
            return Ok(None);
        }

        let value = self
            .result
            .clone()
            .ok_or_else(|| MessageError::MissingResult {
                job_type: self.job_type,
                job_id: self.job_id.clone(),
            })?;

        let malformed = |source| MessageError::MalformedResult {
            job_type: self.job_type,
            job_id: self.job_id.clone(),
            source,
        };

        let typed = match self.job_type {
            JobType::Crawl => {
                JobResult::Crawl(serde_json::from_value::<CrawlResult>(value).map_err(malformed)?)
            }
            JobType::Download => JobResult::Download(
                serde_json::from_value::<DownloadResult>(value).map_err(malformed)?,
            ),
            JobType::RecordReserve => JobResult::RecordReserve(
                serde_json::from_value::<RecordReserveResult>(value).map_err(malformed)?,
            ),
            JobType::Record => {
                JobResult::Record(serde_json::from_value::<RecordResult>(value).map_err(malformed)?)
            }
            JobType::Update | JobType::Produce => {
                return Err(MessageError::UnknownJobType(self.job_type));
            }
        };

        Ok(Some(typed))
    }
}
