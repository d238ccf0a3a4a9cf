use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::jobs::JobType;

/// Handler failure, deciding whether the queue may redeliver
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn retryable(err: impl std::fmt::Display) -> Self {
        HandlerError::Retryable(err.to_string())
    }

    pub fn fatal(err: impl std::fmt::Display) -> Self {
        HandlerError::Fatal(err.to_string())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            HandlerError::Retryable(msg) | HandlerError::Fatal(msg) => msg,
        }
    }
}

/// Delivery metadata passed alongside the decoded payload
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job_type: JobType,
    pub seq: u64,
    pub job_id: Option<String>,
    /// 1-based attempt number of this delivery
    pub attempt: u32,
    pub max_attempts: u32,
    /// Cancelled when the process shuts down
    pub shutdown: CancellationToken,
}

impl Delivery {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Whether a failure of this delivery with `err` will be redelivered
    pub fn will_retry(&self, err: &HandlerError) -> bool {
        err.is_retryable() && !self.is_final_attempt()
    }
}

/// Consumer of one queue
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;

    async fn handle(&self, payload: Self::Payload, delivery: &Delivery)
    -> Result<(), HandlerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(attempt: u32, max_attempts: u32) -> Delivery {
        Delivery {
            job_type: JobType::Download,
            seq: 0,
            job_id: None,
            attempt,
            max_attempts,
            shutdown: CancellationToken::new(),
        }
    }

    #[test]
    fn test_will_retry_only_for_retryable_with_attempts_left() {
        let retryable = HandlerError::Retryable("timeout".into());
        let fatal = HandlerError::Fatal("bad payload".into());

        assert!(delivery(1, 3).will_retry(&retryable));
        assert!(!delivery(3, 3).will_retry(&retryable));
        assert!(!delivery(1, 3).will_retry(&fatal));
        assert!(!delivery(1, 1).will_retry(&retryable));
    }
}
