use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::jobs::ProduceRequest;
use crate::producer::Producer;
use crate::queue::{Delivery, HandlerError, JobHandler};

/// Runs a producer pass per produce request
pub struct ProduceWorker {
    producer: Arc<Producer>,
}

impl ProduceWorker {
    pub fn new(producer: Arc<Producer>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl JobHandler for ProduceWorker {
    type Payload = ProduceRequest;

    async fn handle(&self, request: ProduceRequest, delivery: &Delivery) -> Result<(), HandlerError> {
        let report = self
            .producer
            .produce_all()
            .await
            .map_err(HandlerError::retryable)?;

        if !report.failures.is_empty() {
            warn!(
                requested_at = %request.requested_at,
                attempt = delivery.attempt,
                failures = report.failures.len(),
                first = %report.failures[0],
                "Produce pass finished with failures"
            );
        }
        Ok(())
    }
}
