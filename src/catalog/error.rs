use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Episode not found: {0}")]
    EpisodeNotFound(String),

    #[error("Job {0} already exists")]
    DuplicateJob(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CatalogError {
    /// Missing rows cannot appear by retrying
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CatalogError::JobNotFound(_) | CatalogError::EpisodeNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
