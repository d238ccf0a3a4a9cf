pub mod broker;
pub mod handler;
pub mod policy;
pub mod store;

pub use broker::{ConsumeMode, EnqueueOptions, JobQueue, QueueStats};
pub use handler::{Delivery, HandlerError, JobHandler};
pub use policy::{Backoff, QueuePolicy, RetryPolicy};
pub use store::{DeadLetter, FjallQueue, QueueEntry, QueueError};
