//! Partitioned log transport.
//!
//! The relay talks to the log through three seams:
//!
//! - [`LogProducer`]: append an [`Envelope`] and learn where it landed
//! - [`GroupTransport`]: join a consumer group and receive a [`Session`]
//! - [`ClaimStream`] / [`OffsetCommitter`]: read one assigned partition in
//!   order and commit progress for it
//!
//! # Sessions
//!
//! A [`Session`] is one generation of group membership. It carries one
//! claim per assigned partition and a revocation token the transport fires
//! when the generation ends (another member joined or left, the
//! coordinator forced a rebalance). Claims of a revoked session must stop
//! before the member joins again, which is what keeps two members from
//! consuming the same partition at once.
//!
//! Implementations: [`MemoryBroker`] (in-process) and, with the `kafka`
//! feature, `KafkaProducer` / `KafkaGroupTransport` on librdkafka.

mod memory;
mod partitioner;

#[cfg(feature = "kafka")]
mod kafka;

pub use memory::{BrokerOptions, MemoryBroker, MemoryGroupMember};
pub use partitioner::{murmur2, partition_for_key};

#[cfg(feature = "kafka")]
pub use kafka::{KafkaGroupTransport, KafkaProducer};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::codec::Envelope;
use crate::error::{PublishError, TransportError};
use crate::shutdown::Shutdown;
use crate::types::PartitionPosition;

// =============================================================================
// Records
// =============================================================================

/// A message as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: Arc<str>,
    pub partition: i32,
    pub offset: i64,
    /// Milliseconds since the Unix epoch, as stamped by the log.
    pub timestamp: i64,
    pub key: Option<Bytes>,
    pub headers: Vec<(String, Bytes)>,
    pub payload: Bytes,
}

impl LogRecord {
    /// Value of the first header named `name`.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_ref())
    }

    pub fn position(&self) -> PartitionPosition {
        PartitionPosition::new(self.partition, self.offset)
    }
}

// =============================================================================
// Producer Side
// =============================================================================

#[async_trait]
pub trait LogProducer: Send + Sync {
    /// Append `envelope` to `topic`.
    ///
    /// Resolves once the log has durably accepted the message (all in-sync
    /// replicas for a replicated log). Messages with the same partition key
    /// land in the same partition in send order.
    async fn send(&self, topic: &str, envelope: &Envelope)
    -> Result<PartitionPosition, PublishError>;

    /// Wait for in-flight sends to be acknowledged.
    async fn flush(&self, _timeout: Duration) -> Result<(), PublishError> {
        Ok(())
    }
}

// =============================================================================
// Consumer Side
// =============================================================================

/// Ordered reader for one claimed partition.
#[async_trait]
pub trait ClaimStream: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> i32;

    /// Offset of the first record this claim delivers.
    fn initial_offset(&self) -> i64;

    /// Next record in partition order, waiting if none is available.
    ///
    /// Cancel-safe: dropping the future before it resolves loses nothing,
    /// the same record is returned by the next call.
    async fn next_record(&mut self) -> Result<LogRecord, TransportError>;
}

/// Commits consumer progress for the session it was issued with.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Record that every offset below `next_offset` has been handled.
    ///
    /// Fails with a non-fatal error once the session's generation is over.
    async fn commit(&self, topic: &str, partition: i32, next_offset: i64)
    -> Result<(), TransportError>;
}

/// Membership in one consumer group.
#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// Join (or re-join) the group and wait for this member's assignment.
    async fn join(&self) -> Result<Session, TransportError>;

    /// Leave the group and release the client. Later calls to `join` fail
    /// with [`TransportError::Closed`]. Idempotent.
    async fn close(&self) -> Result<(), TransportError>;
}

/// One generation of group membership.
pub struct Session {
    pub member_id: String,
    pub generation: i32,
    pub claims: Vec<Box<dyn ClaimStream>>,
    /// Fired by the transport when this generation ends.
    pub revoked: Shutdown,
    pub committer: Arc<dyn OffsetCommitter>,
}

impl Session {
    pub fn partitions(&self) -> Vec<i32> {
        self.claims.iter().map(|claim| claim.partition()).collect()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("member_id", &self.member_id)
            .field("generation", &self.generation)
            .field("partitions", &self.partitions())
            .field("revoked", &self.revoked.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_returns_first_match() {
        let record = LogRecord {
            topic: Arc::from("skills"),
            partition: 1,
            offset: 7,
            timestamp: 0,
            key: None,
            headers: vec![
                ("trace".to_string(), Bytes::from_static(b"abc")),
                ("action".to_string(), Bytes::from_static(b"create")),
                ("action".to_string(), Bytes::from_static(b"delete")),
            ],
            payload: Bytes::new(),
        };

        assert_eq!(record.header("action"), Some(b"create".as_slice()));
        assert_eq!(record.header("missing"), None);
        assert_eq!(record.position(), PartitionPosition::new(1, 7));
    }
}
