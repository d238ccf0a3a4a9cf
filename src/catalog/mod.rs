/// Durable catalog of channels, episodes and job rows
///
/// The catalog is the single source of truth for pipeline state. Emitters
/// create Pending job rows before enqueueing work; workers mark them Working;
/// only the update applier writes terminal states.
///
/// ## Layout
///
/// `FjallCatalog` keeps one fjall keyspace with partitions for channels,
/// episodes, a per-channel slug index used for episode dedupe, jobs, an
/// episode to job index and metadata (pruning state).
///
/// ## Retention
///
/// Done and Error jobs older than the configured TTL (default 30 days) are
/// removed by [`CatalogStore::prune_finished`].
pub mod error;
pub mod models;
pub mod partitions;
pub mod pruning;
pub mod store;

pub use error::{CatalogError, Result};
pub use models::{
    Channel, Episode, EpisodeType, FinishOutcome, Job, JobCompletion, JobStatus, StartOutcome,
    new_id, slugify,
};
pub use pruning::{DEFAULT_JOB_RETENTION_DAYS, PruneStats};
pub use store::{CatalogStore, FjallCatalog};
