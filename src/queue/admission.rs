// src/queue/admission.rs
//! Inline-drain decision taken after every enqueue

use crate::queue::tracking_queue::Queue;
use crate::utils::config::QueueConfig;
use crate::utils::errors::Result;

/// What the ingesting request should do after queueing its batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// Enough work is queued and opportunistic processing is on
    DrainInline,

    /// Enough work is queued but draining is left to a scheduled run
    Deferred,

    /// Not enough work queued yet
    BelowThreshold,

    /// Queueing is switched off; the batch was persisted without queueing
    NotQueued,
}

#[derive(Debug, Clone, Copy)]
pub struct Admission {
    process_during_request: bool,
}

impl Admission {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            process_during_request: config.process_during_request,
        }
    }

    pub async fn decide(&self, queue: &Queue) -> Result<AdmissionDecision> {
        if !queue.should_drain().await? {
            return Ok(AdmissionDecision::BelowThreshold);
        }

        if self.process_during_request {
            Ok(AdmissionDecision::DrainInline)
        } else {
            Ok(AdmissionDecision::Deferred)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::tracking::{Environment, Event, EventBatch};
    use std::sync::Arc;

    async fn queue_with(config: &QueueConfig, n: usize) -> Queue {
        let queue = Queue::new(Arc::new(MemoryBackend::new()), config);
        for _ in 0..n {
            queue
                .enqueue(&EventBatch::single(
                    Event::new([("idsite", "1")]),
                    Environment::new(),
                ))
                .await
                .unwrap();
        }
        queue
    }

    #[tokio::test]
    async fn test_decisions() {
        let mut config = QueueConfig {
            batch_size: 2,
            ..QueueConfig::default()
        };

        let admission = Admission::new(&config);
        let queue = queue_with(&config, 1).await;
        assert_eq!(
            admission.decide(&queue).await.unwrap(),
            AdmissionDecision::BelowThreshold
        );

        let queue = queue_with(&config, 2).await;
        assert_eq!(
            admission.decide(&queue).await.unwrap(),
            AdmissionDecision::DrainInline
        );

        config.process_during_request = false;
        let admission = Admission::new(&config);
        assert_eq!(
            admission.decide(&queue).await.unwrap(),
            AdmissionDecision::Deferred
        );
    }
}
