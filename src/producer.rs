//! Producer side of the relay: turn an [`Action`] into a log append.
//!
//! [`SkillPublisher::publish`] returns only after the log has durably
//! accepted the envelope. On error nothing was recorded and the caller must
//! not assume the mutation happened.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::codec::{Action, Envelope};
use crate::error::PublishError;
use crate::log::LogProducer;
use crate::metrics;
use crate::types::PartitionPosition;

/// Publishes skill actions to one topic.
///
/// Cheap to clone and safe to share between request handlers: concurrent
/// calls are serialized or pipelined by the underlying [`LogProducer`].
#[derive(Clone)]
pub struct SkillPublisher {
    producer: Arc<dyn LogProducer>,
    topic: String,
}

impl SkillPublisher {
    pub fn new(producer: Arc<dyn LogProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Append `action` to the topic, partitioned by its entity key.
    pub async fn publish(&self, action: &Action) -> Result<PartitionPosition, PublishError> {
        if action.key().is_empty() {
            return Err(PublishError::EmptyKey);
        }
        let envelope = Envelope::seal(action)?;

        match self.producer.send(&self.topic, &envelope).await {
            Ok(position) => {
                debug!(
                    topic = %self.topic,
                    key = %envelope.partition_key,
                    action = %envelope.kind,
                    partition = position.partition,
                    offset = position.offset,
                    "Action published"
                );
                metrics::record_published(envelope.kind);
                Ok(position)
            }
            Err(e) => {
                warn!(
                    topic = %self.topic,
                    key = %envelope.partition_key,
                    action = %envelope.kind,
                    error = %e,
                    "Failed to publish action"
                );
                metrics::record_publish_failure();
                Err(e)
            }
        }
    }

    /// Wait for in-flight publishes to be acknowledged.
    pub async fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        self.producer.flush(timeout).await
    }
}

impl std::fmt::Debug for SkillPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillPublisher")
            .field("topic", &self.topic)
            .finish()
    }
}
