/// Retention of finished jobs
use chrono::{DateTime, Utc};
use fjall::{Keyspace, PartitionHandle};
use tracing::{debug, info};

use super::error::Result;
use super::models::Job;
use super::partitions::{encode_job_episode_key, encode_meta_key};

pub const DEFAULT_JOB_RETENTION_DAYS: u64 = 30;

const META_LAST_PRUNE_JOBS: &str = "last_prune_jobs";

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneStats {
    pub jobs_pruned: usize,
}

/// Remove Done/Error jobs finished before `cutoff`, with their episode index keys
///
/// Pending and Working jobs are never pruned.
pub fn prune_finished_jobs(
    keyspace: &Keyspace,
    jobs: &PartitionHandle,
    job_episodes: &PartitionHandle,
    metadata: &PartitionHandle,
    cutoff: DateTime<Utc>,
) -> Result<PruneStats> {
    let mut stats = PruneStats::default();
    let mut batch = keyspace.batch();

    for item in jobs.iter() {
        let (key, value) = item?;
        let job: Job = serde_json::from_slice(&value)?;

        let expired = job.status.is_terminal()
            && job.finished_at.is_some_and(|finished| finished < cutoff);
        if !expired {
            continue;
        }

        batch.remove(jobs, key);
        if let Some(episode_id) = &job.episode_id {
            batch.remove(job_episodes, encode_job_episode_key(episode_id, &job.id));
        }
        debug!(job_id = %job.id, "Pruning finished job");
        stats.jobs_pruned += 1;
    }

    batch.insert(
        metadata,
        encode_meta_key(META_LAST_PRUNE_JOBS),
        Utc::now().to_rfc3339().as_bytes(),
    );
    batch.commit()?;
    keyspace.persist(fjall::PersistMode::SyncAll)?;

    info!("Pruning complete: {:?}", stats);
    Ok(stats)
}

/// When the last prune ran, if ever
pub fn last_prune(metadata: &PartitionHandle) -> Result<Option<DateTime<Utc>>> {
    let Some(bytes) = metadata.get(encode_meta_key(META_LAST_PRUNE_JOBS))? else {
        return Ok(None);
    };
    Ok(std::str::from_utf8(&bytes)
        .ok()
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .map(|at| at.with_timezone(&Utc)))
}
