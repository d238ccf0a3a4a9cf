//! Job kinds and the wire contract between pipeline components
//!
//! Payloads travel from emitters to worker queues; [`UpdateJobMessage`]
//! carries each attempt's outcome to the update applier. All shapes are JSON
//! with camelCase field names and must stay stable field-for-field.

mod message;
mod results;
mod types;

pub use message::{MessageError, UpdateJobMessage};
pub use results::{
    CrawlResult, CrawledEpisode, DownloadResult, Enclosure, JobResult, RecordReserveResult,
    RecordResult,
};
pub use types::{
    CrawlJobPayload, CrawlType, DownloadJobPayload, JobType, ProduceRequest, RecordJobParams,
    RecordJobPayload, RecordReserveJobPayload,
};
