use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::jobs::JobType;

/// Backoff between delivery attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
    Exponential { base_ms: u64 },
}

impl Backoff {
    /// Delay before redelivering after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Exponential { base_ms } => {
                let exponent = attempt.saturating_sub(1).min(32);
                let factor = 1u64 << exponent;
                Duration::from_millis(base_ms.saturating_mul(factor))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
}

impl RetryPolicy {
    pub const fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: None,
        }
    }

    pub const fn exponential(max_attempts: u32, base_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff: Some(Backoff::Exponential { base_ms }),
        }
    }

    /// Delay before the next attempt, or `None` when attempts are exhausted
    pub fn next_delay(&self, failed_attempt: u32) -> Option<Duration> {
        if failed_attempt >= self.max_attempts {
            return None;
        }
        Some(
            self.backoff
                .map(|backoff| backoff.delay_after(failed_attempt))
                .unwrap_or(Duration::ZERO),
        )
    }
}

/// Delivery policy of one named queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub job_type: JobType,
    pub retry: RetryPolicy,
    /// In-flight handler invocations
    pub concurrency: usize,
    /// Deliveries per second, unlimited when `None`
    pub rate_per_sec: Option<u32>,
}

impl QueuePolicy {
    pub fn default_for(job_type: JobType) -> Self {
        let (retry, concurrency, rate_per_sec) = match job_type {
            JobType::Produce => (RetryPolicy::exponential(3, 1000), 1, None),
            JobType::Crawl => (RetryPolicy::exponential(3, 1000), 5, Some(10)),
            JobType::Download => (RetryPolicy::exponential(3, 1000), 5, Some(5)),
            JobType::RecordReserve => (RetryPolicy::exponential(3, 1000), 10, None),
            JobType::Record => (RetryPolicy::no_retry(), 1, None),
            JobType::Update => (RetryPolicy::exponential(5, 1000), 10, None),
        };

        Self {
            job_type,
            retry,
            concurrency,
            rate_per_sec,
        }
    }

    /// Default policies for every queue
    pub fn defaults() -> Vec<Self> {
        JobType::ALL.into_iter().map(Self::default_for).collect()
    }
}
