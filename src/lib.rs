pub mod catalog;
pub mod config;
pub mod fetch;
pub mod jobs;
pub mod observability;
pub mod pipeline;
pub mod producer;
pub mod queue;
pub mod recorder;
pub mod server;
pub mod testing;
pub mod workers;
