use std::collections::HashSet;
use std::path::Path;

use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::policy::RetryPolicy;
use crate::jobs::JobType;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue entry not found: seq={0}")]
    EntryNotFound(u64),

    #[error("No queue registered for {0}")]
    UnknownQueue(JobType),

    #[error("Queue {0} already has a consumer")]
    AlreadyConsuming(JobType),

    #[error("Queue is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// A durable work item of one named queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub queue: JobType,
    /// Assigned by the store on enqueue
    #[serde(default)]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub payload: Value,
    /// Failed deliveries so far
    #[serde(default)]
    pub attempts: u32,
    pub ready_at_ms: u64,
    /// Overrides the queue's retry policy for this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub enqueued_at_ms: u64,
}

impl QueueEntry {
    pub fn new(queue: JobType, payload: Value, ready_at_ms: u64) -> Self {
        Self {
            queue,
            seq: 0,
            job_id: None,
            payload,
            attempts: 0,
            ready_at_ms,
            retry: None,
            last_error: None,
            enqueued_at_ms: now_ms(),
        }
    }
}

/// An entry that failed permanently
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub entry: QueueEntry,
    pub failure_code: String,
    pub failure_message: String,
    pub attempts: u32,
    pub failed_at_ms: u64,
}

pub const FAILURE_FATAL: &str = "FATAL";
pub const FAILURE_RETRIES_EXHAUSTED: &str = "RETRIES_EXHAUSTED";

/// Durable storage for every queue's entries and dead letters
///
/// Layout:
/// - `tasks`: u64 (big-endian) -> QueueEntry (JSON)
/// - `metadata`: "next_seq" -> u64
/// - `dlq`: u64 (big-endian) -> DeadLetter (JSON)
///
/// Sequence numbers are shared across queues so one keyspace holds all of them.
#[derive(Clone)]
pub struct FjallQueue {
    keyspace: Keyspace,
    tasks: PartitionHandle,
    metadata: PartitionHandle,
    dlq: PartitionHandle,
    next_seq: Arc<Mutex<u64>>,
}

impl FjallQueue {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening FjallQueue at: {}", path.display());

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let keyspace = Config::new(path).open()?;

        let tasks = keyspace.open_partition("tasks", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;
        let dlq = keyspace.open_partition("dlq", PartitionCreateOptions::default())?;

        let current_seq = metadata
            .get(b"next_seq")?
            .map(|bytes| decode_seq(&bytes))
            .unwrap_or(0);

        info!("FjallQueue opened, current sequence: {}", current_seq);

        Ok(Self {
            keyspace,
            tasks,
            metadata,
            dlq,
            next_seq: Arc::new(Mutex::new(current_seq)),
        })
    }

    /// Persist an entry under a fresh sequence number
    ///
    /// The entry and the advanced counter are written in one batch and synced
    /// before returning.
    pub fn enqueue(&self, mut entry: QueueEntry) -> Result<QueueEntry> {
        let mut next_seq = self.next_seq.lock();
        entry.seq = *next_seq;

        let value = serde_json::to_vec(&entry)?;
        let mut batch = self.keyspace.batch();
        batch.insert(&self.tasks, entry.seq.to_be_bytes(), value);
        batch.insert(&self.metadata, b"next_seq", (entry.seq + 1).to_be_bytes());
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;

        *next_seq += 1;

        debug!(seq = entry.seq, queue = %entry.queue, "Entry enqueued");
        Ok(entry)
    }

    pub fn get(&self, seq: u64) -> Result<Option<QueueEntry>> {
        match self.tasks.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Overwrite a stored entry (retry bookkeeping)
    pub fn update(&self, entry: &QueueEntry) -> Result<()> {
        let value = serde_json::to_vec(entry)?;
        self.tasks.insert(entry.seq.to_be_bytes(), value)?;
        Ok(())
    }

    /// Acknowledge a delivered entry by removing it
    pub fn ack(&self, seq: u64) -> Result<()> {
        self.tasks.remove(seq.to_be_bytes())?;
        debug!(seq, "Entry acknowledged");
        Ok(())
    }

    /// Move an entry to the dead-letter partition
    pub fn move_to_dlq(
        &self,
        entry: QueueEntry,
        failure_code: &str,
        failure_message: String,
        attempts: u32,
    ) -> Result<DeadLetter> {
        let seq = entry.seq;
        let dead = DeadLetter {
            entry,
            failure_code: failure_code.to_string(),
            failure_message,
            attempts,
            failed_at_ms: now_ms(),
        };

        let value = serde_json::to_vec(&dead)?;
        let mut batch = self.keyspace.batch();
        batch.insert(&self.dlq, seq.to_be_bytes(), value);
        batch.remove(&self.tasks, seq.to_be_bytes());
        batch.commit()?;

        info!(seq, attempts, failure_code, "Entry moved to DLQ");
        Ok(dead)
    }

    pub fn get_dead_letter(&self, seq: u64) -> Result<Option<DeadLetter>> {
        match self.dlq.get(seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_dlq(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let mut results = Vec::new();
        for item in self.dlq.iter().take(limit) {
            let (_, value) = item?;
            results.push(serde_json::from_slice(&value)?);
        }
        Ok(results)
    }

    /// All live entries in sequence order
    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        let mut results = Vec::new();
        for item in self.tasks.iter() {
            let (_, value) = item?;
            results.push(serde_json::from_slice(&value)?);
        }
        Ok(results)
    }

    /// Job ids referenced by live or dead-lettered entries
    pub fn job_ids(&self) -> Result<HashSet<String>> {
        let mut ids: HashSet<String> = self
            .entries()?
            .into_iter()
            .filter_map(|entry| entry.job_id)
            .collect();

        for item in self.dlq.iter() {
            let (_, value) = item?;
            let dead: DeadLetter = serde_json::from_slice(&value)?;
            if let Some(job_id) = dead.entry.job_id {
                ids.insert(job_id);
            }
        }

        Ok(ids)
    }

    pub fn dlq_count(&self, queue: JobType) -> Result<usize> {
        let mut count = 0;
        for item in self.dlq.iter() {
            let (_, value) = item?;
            let dead: DeadLetter = serde_json::from_slice(&value)?;
            if dead.entry.queue == queue {
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn current_seq(&self) -> u64 {
        *self.next_seq.lock()
    }

    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }

    pub fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(b"next_seq")?;
        Ok(())
    }
}

fn decode_seq(bytes: &[u8]) -> u64 {
    u64::from_be_bytes(bytes.try_into().unwrap_or([0u8; 8]))
}

/// Current Unix timestamp in milliseconds
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
