use super::models::{Config, parse_queue_name};
use crate::jobs::JobType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Unknown queue '{name}' in [workers]")]
    UnknownQueue { name: String },

    #[error("Concurrency for queue '{queue}' must be positive")]
    ZeroConcurrency { queue: String },

    #[error("Max attempts for queue '{queue}' must be positive")]
    ZeroAttempts { queue: String },

    #[error("Record queue concurrency is fixed at 1, got {value}")]
    RecordConcurrency { value: usize },

    #[error("Duration must be positive: {field}")]
    ZeroDuration { field: &'static str },

    #[error("Retention TTL must be positive: {field} = {value}")]
    InvalidRetentionTTL { field: String, value: u32 },

    #[error("Recording container extension must not be empty")]
    EmptyContainer,
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_workers(config)?;
    validate_durations(config)?;
    validate_retention(config)?;
    if config.recorder.container.trim().is_empty() {
        return Err(ValidationError::EmptyContainer);
    }
    Ok(())
}

fn validate_workers(config: &Config) -> Result<(), ValidationError> {
    for (name, over) in &config.workers {
        let Some(job_type) = parse_queue_name(name) else {
            return Err(ValidationError::UnknownQueue { name: name.clone() });
        };

        if over.concurrency == Some(0) {
            return Err(ValidationError::ZeroConcurrency {
                queue: job_type.to_string(),
            });
        }
        if over.max_attempts == Some(0) {
            return Err(ValidationError::ZeroAttempts {
                queue: job_type.to_string(),
            });
        }
        if job_type == JobType::Record {
            if let Some(value) = over.concurrency.filter(|&c| c != 1) {
                return Err(ValidationError::RecordConcurrency { value });
            }
        }
    }
    Ok(())
}

fn validate_durations(config: &Config) -> Result<(), ValidationError> {
    let checks = [
        ("recorder.max_duration_secs", config.recorder.max_duration_secs),
        ("http.connect_timeout_secs", config.http.connect_timeout_secs),
        ("http.request_timeout_secs", config.http.request_timeout_secs),
        ("producer.interval_secs", config.producer.interval_secs),
        ("reconcile.interval_secs", config.reconcile.interval_secs),
        ("reconcile.stale_after_secs", config.reconcile.stale_after_secs),
    ];
    for (field, value) in checks {
        if value == 0 {
            return Err(ValidationError::ZeroDuration { field });
        }
    }
    if config.producer.episode_limit == 0 {
        return Err(ValidationError::ZeroDuration {
            field: "producer.episode_limit",
        });
    }
    Ok(())
}

fn validate_retention(config: &Config) -> Result<(), ValidationError> {
    if config.retention.job_ttl_days == 0 {
        return Err(ValidationError::InvalidRetentionTTL {
            field: "job_ttl_days".to_string(),
            value: config.retention.job_ttl_days,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerOverride;

    #[test]
    fn test_defaults_are_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_rejects_unknown_queue() {
        let mut config = Config::default();
        config
            .workers
            .insert("transcode".to_string(), WorkerOverride::default());
        assert!(matches!(
            validate(&config),
            Err(ValidationError::UnknownQueue { .. })
        ));
    }

    #[test]
    fn test_record_concurrency_fixed() {
        let mut config = Config::default();
        config.workers.insert(
            "record".to_string(),
            WorkerOverride {
                concurrency: Some(3),
                ..Default::default()
            },
        );
        assert!(matches!(
            validate(&config),
            Err(ValidationError::RecordConcurrency { value: 3 })
        ));
    }

    #[test]
    fn test_rejects_zero_values() {
        let mut config = Config::default();
        config.workers.insert(
            "crawl".to_string(),
            WorkerOverride {
                concurrency: Some(0),
                ..Default::default()
            },
        );
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ZeroConcurrency { .. })
        ));

        let mut config = Config::default();
        config.recorder.max_duration_secs = 0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::ZeroDuration {
                field: "recorder.max_duration_secs"
            })
        ));

        let mut config = Config::default();
        config.retention.job_ttl_days = 0;
        assert!(matches!(
            validate(&config),
            Err(ValidationError::InvalidRetentionTTL { .. })
        ));
    }
}
