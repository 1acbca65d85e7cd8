//! Kafka transport on librdkafka.
//!
//! - [`KafkaProducer`]: `acks=all`, idempotent, murmur2 partitioning so keys
//!   map to the same partitions as [`MemoryBroker`](super::MemoryBroker)
//! - [`KafkaGroupTransport`]: a subscribed `StreamConsumer` whose context
//!   tracks assignments; every assigned partition gets its own queue so
//!   claims read partitions independently
//!
//! Offsets are stored after each handled record (`enable.auto.offset.store`
//! off) and committed by librdkafka's background auto-commit, plus one
//! synchronous commit on close.
//!
//! Fetching starts as soon as a partition is assigned, before `join` has
//! split its queue, and records fetched in that window land on the main
//! queue. `join` therefore seeks every claimed partition to a known
//! position after splitting: the newer of the group's committed offset and
//! the last offset this process stored, or the configured reset when
//! neither exists.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::ClientConfig;
use rdkafka::client::ClientContext;
use rdkafka::consumer::stream_consumer::StreamPartitionQueue;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use tokio::sync::watch;
use tokio::task::{JoinHandle, spawn_blocking};
use tracing::{debug, info, warn};

use super::{ClaimStream, GroupTransport, LogProducer, LogRecord, OffsetCommitter, Session};
use crate::codec::Envelope;
use crate::config::RelayConfig;
use crate::constants::ACTION_HEADER;
use crate::error::{PublishError, TransportError};
use crate::shutdown::Shutdown;
use crate::types::{OffsetReset, PartitionPosition};

fn broker_error(err: KafkaError) -> TransportError {
    TransportError::Broker(err.to_string())
}

// =============================================================================
// Producer
// =============================================================================

pub struct KafkaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &RelayConfig) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("partitioner", "murmur2_random")
            .set(
                "message.timeout.ms",
                config.publish_timeout.as_millis().to_string(),
            )
            .create()
            .map_err(|e| PublishError::Unavailable(e.to_string()))?;

        info!(brokers = %config.brokers, client_id = %config.client_id, "Kafka producer created");
        Ok(Self {
            producer,
            timeout: config.publish_timeout,
        })
    }
}

fn publish_error(topic: &str, timeout: Duration, err: KafkaError) -> PublishError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::NotEnoughReplicas)
        | Some(RDKafkaErrorCode::NotEnoughReplicasAfterAppend) => PublishError::NotEnoughReplicas,
        Some(RDKafkaErrorCode::MessageTimedOut) => PublishError::Timeout(timeout),
        Some(RDKafkaErrorCode::UnknownTopicOrPartition) | Some(RDKafkaErrorCode::UnknownTopic) => {
            PublishError::UnknownTopic(topic.to_string())
        }
        _ => PublishError::Unavailable(err.to_string()),
    }
}

#[async_trait]
impl LogProducer for KafkaProducer {
    async fn send(
        &self,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<PartitionPosition, PublishError> {
        let headers = OwnedHeaders::new().insert(Header {
            key: ACTION_HEADER,
            value: Some(envelope.kind.as_str()),
        });
        let record = FutureRecord::to(topic)
            .key(envelope.partition_key.as_str())
            .payload(envelope.payload.as_ref())
            .headers(headers);

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok((partition, offset)) => Ok(PartitionPosition::new(partition, offset)),
            Err((err, _message)) => Err(publish_error(topic, self.timeout, err)),
        }
    }

    async fn flush(&self, timeout: Duration) -> Result<(), PublishError> {
        let producer = self.producer.clone();
        spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| PublishError::Unavailable(e.to_string()))?
            .map_err(|e| PublishError::Unavailable(e.to_string()))
    }
}

// =============================================================================
// Rebalance Tracking
// =============================================================================

struct Assignment {
    partitions: Vec<i32>,
    revoke: Shutdown,
}

struct RebalanceContext {
    topic: String,
    assignment: std::sync::Mutex<Assignment>,
    /// Bumped on every assignment; stands in for the group generation.
    assigned: watch::Sender<u64>,
}

impl RebalanceContext {
    fn new(topic: &str) -> (Self, watch::Receiver<u64>) {
        let (assigned, assigned_rx) = watch::channel(0);
        let context = Self {
            topic: topic.to_string(),
            assignment: std::sync::Mutex::new(Assignment {
                partitions: Vec::new(),
                revoke: Shutdown::new(),
            }),
            assigned,
        };
        (context, assigned_rx)
    }

    /// Replace the assignment with this topic's partitions in `tpl` and end
    /// any session still holding the previous one.
    fn assign(&self, tpl: &TopicPartitionList) {
        let mut partitions: Vec<i32> = tpl
            .elements()
            .iter()
            .filter(|elem| elem.topic() == self.topic)
            .map(|elem| elem.partition())
            .collect();
        partitions.sort_unstable();
        info!(?partitions, "Partitions assigned");
        {
            let mut assignment = self
                .assignment
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            assignment.revoke.cancel();
            *assignment = Assignment {
                partitions,
                revoke: Shutdown::new(),
            };
        }
        self.assigned.send_modify(|generation| *generation += 1);
    }

    fn revoke(&self) {
        let mut assignment = self
            .assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        assignment.revoke.cancel();
        assignment.partitions.clear();
    }

    fn snapshot(&self) -> (Vec<i32>, Shutdown) {
        let assignment = self
            .assignment
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        (assignment.partitions.clone(), assignment.revoke.clone())
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(tpl) = rebalance {
            info!(partitions = tpl.count(), "Partitions revoked");
            self.revoke();
        }
    }

    fn post_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(tpl) => self.assign(tpl),
            Rebalance::Error(err) => warn!(error = %err, "Rebalance failed"),
            Rebalance::Revoke(_) => {}
        }
    }
}

type SubscribedConsumer = StreamConsumer<RebalanceContext>;

/// Next offset to read per partition, as last stored by this process.
type StoredOffsets = Arc<std::sync::Mutex<HashMap<i32, i64>>>;

/// Where a claim on a partition starts reading. Committed offsets only
/// move forward, so the newer of the two known positions wins.
fn seek_target(committed: Option<i64>, stored: Option<i64>, reset: OffsetReset) -> Offset {
    match committed.max(stored) {
        Some(offset) => Offset::Offset(offset),
        None => match reset {
            OffsetReset::Earliest => Offset::Beginning,
            OffsetReset::Latest => Offset::End,
        },
    }
}

// =============================================================================
// Group Transport
// =============================================================================

pub struct KafkaGroupTransport {
    consumer: Arc<SubscribedConsumer>,
    topic: String,
    group: String,
    assigned: watch::Receiver<u64>,
    reset: OffsetReset,
    stored: StoredOffsets,
    op_timeout: Duration,
    driver: std::sync::Mutex<Option<JoinHandle<()>>>,
    sessions: AtomicU64,
    closed: AtomicBool,
}

impl KafkaGroupTransport {
    /// Create the consumer and subscribe to the configured topic.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(config: &RelayConfig) -> Result<Self, TransportError> {
        let (context, assigned_rx) = RebalanceContext::new(&config.topic);

        let consumer: SubscribedConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("client.id", &config.client_id)
            .set(
                "session.timeout.ms",
                config.session_timeout.as_millis().to_string(),
            )
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", config.initial_offset.as_str())
            .set("partition.assignment.strategy", "roundrobin")
            .create_with_context(context)
            .map_err(broker_error)?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(broker_error)?;

        let consumer = Arc::new(consumer);
        let driver = tokio::spawn(drive_main_queue(consumer.clone()));

        info!(
            brokers = %config.brokers,
            group = %config.group_id,
            topic = %config.topic,
            "Kafka consumer subscribed"
        );

        Ok(Self {
            consumer,
            topic: config.topic.clone(),
            group: config.group_id.clone(),
            assigned: assigned_rx,
            reset: config.initial_offset,
            stored: StoredOffsets::default(),
            op_timeout: config.session_timeout,
            driver: std::sync::Mutex::new(Some(driver)),
            sessions: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Committed offsets for `partitions`, `None` where the group has none.
    async fn committed(
        &self,
        partitions: &[i32],
    ) -> Result<Vec<(i32, Option<i64>)>, TransportError> {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            tpl.add_partition(&self.topic, *partition);
        }
        let consumer = self.consumer.clone();
        let timeout = self.op_timeout;
        let committed =
            spawn_blocking(move || consumer.committed_offsets(tpl, Timeout::After(timeout)))
                .await
                .map_err(|e| TransportError::Broker(e.to_string()))?
                .map_err(broker_error)?;

        Ok(committed
            .elements()
            .iter()
            .map(|elem| match elem.offset() {
                Offset::Offset(offset) => (elem.partition(), Some(offset)),
                _ => (elem.partition(), None),
            })
            .collect())
    }

    fn stored(&self, partition: i32) -> Option<i64> {
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&partition)
            .copied()
    }

    /// Move the fetch position of `partition`. Records already fetched for
    /// it, on either queue, are discarded and fetched again.
    async fn seek(&self, partition: i32, offset: Offset) -> Result<(), TransportError> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let timeout = self.op_timeout;
        spawn_blocking(move || consumer.seek(&topic, partition, offset, Timeout::After(timeout)))
            .await
            .map_err(|e| TransportError::Broker(e.to_string()))?
            .map_err(broker_error)
    }
}

/// Poll the main queue so rebalance callbacks run. Records only show up
/// here for partitions whose queue is not split yet; `join` seeks those
/// partitions, so the records are fetched again.
async fn drive_main_queue(consumer: Arc<SubscribedConsumer>) {
    loop {
        match consumer.recv().await {
            Ok(message) => debug!(
                partition = message.partition(),
                offset = message.offset(),
                "Record on main queue ignored"
            ),
            Err(err) => warn!(error = %err, "Consumer error"),
        }
    }
}

#[async_trait]
impl GroupTransport for KafkaGroupTransport {
    async fn join(&self) -> Result<Session, TransportError> {
        let mut assigned = self.assigned.clone();
        let (generation, partitions, revoked) = loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }
            let generation = *assigned.borrow_and_update();
            let (partitions, revoked) = self.consumer.context().snapshot();
            if generation > 0 && !revoked.is_cancelled() {
                break (generation, partitions, revoked);
            }
            assigned
                .changed()
                .await
                .map_err(|_| TransportError::Closed)?;
        };

        let mut claims: Vec<Box<dyn ClaimStream>> = Vec::with_capacity(partitions.len());
        let positions = self.committed(&partitions).await?;
        for (partition, committed) in positions {
            let queue = self
                .consumer
                .split_partition_queue(&self.topic, partition)
                .ok_or_else(|| {
                    TransportError::Broker(format!("cannot split queue for partition {partition}"))
                })?;
            let stored = self.stored(partition);
            let target = seek_target(committed, stored, self.reset);
            debug!(partition, ?committed, ?stored, ?target, "Seeking claimed partition");
            self.seek(partition, target).await?;
            claims.push(Box::new(KafkaClaim {
                queue,
                topic: self.topic.clone(),
                partition,
                initial_offset: committed.max(stored).unwrap_or(-1),
            }));
        }

        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session {
            member_id: format!("{}-{}", self.group, session),
            generation: i32::try_from(generation).unwrap_or(i32::MAX),
            claims,
            revoked: revoked.clone(),
            committer: Arc::new(KafkaCommitter {
                consumer: self.consumer.clone(),
                group: self.group.clone(),
                stored: self.stored.clone(),
                revoked,
            }),
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(group = %self.group, "Closing Kafka consumer");

        let consumer = self.consumer.clone();
        let result = spawn_blocking(move || {
            if let Err(err) = consumer.commit_consumer_state(CommitMode::Sync) {
                debug!(error = %err, "Final commit skipped");
            }
            consumer.unsubscribe();
        })
        .await;

        if let Some(driver) = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            driver.abort();
        }
        result.map_err(|e| TransportError::Broker(e.to_string()))
    }
}

// =============================================================================
// Claim & Committer
// =============================================================================

struct KafkaClaim {
    queue: StreamPartitionQueue<RebalanceContext>,
    topic: String,
    partition: i32,
    initial_offset: i64,
}

fn to_log_record<M: Message>(message: &M) -> LogRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|header| {
                    (
                        header.key.to_string(),
                        header.value.map(Bytes::copy_from_slice).unwrap_or_default(),
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    LogRecord {
        topic: Arc::from(message.topic()),
        partition: message.partition(),
        offset: message.offset(),
        timestamp: message.timestamp().to_millis().unwrap_or(-1),
        key: message.key().map(Bytes::copy_from_slice),
        headers,
        payload: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
    }
}

#[async_trait]
impl ClaimStream for KafkaClaim {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    async fn next_record(&mut self) -> Result<LogRecord, TransportError> {
        let message = self.queue.recv().await.map_err(broker_error)?;
        Ok(to_log_record(&message))
    }
}

struct KafkaCommitter {
    consumer: Arc<SubscribedConsumer>,
    group: String,
    stored: StoredOffsets,
    revoked: Shutdown,
}

#[async_trait]
impl OffsetCommitter for KafkaCommitter {
    async fn commit(
        &self,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), TransportError> {
        if self.revoked.is_cancelled() {
            return Err(TransportError::RebalanceInProgress(self.group.clone()));
        }
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(next_offset))
            .map_err(broker_error)?;
        self.consumer.store_offsets(&tpl).map_err(broker_error)?;
        self.stored
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition, next_offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::Timestamp;
    use rdkafka::message::OwnedMessage;

    #[test]
    fn test_seek_target_prefers_newest_known_offset() {
        assert_eq!(
            seek_target(Some(4), None, OffsetReset::Earliest),
            Offset::Offset(4)
        );
        // Stored but not yet auto-committed.
        assert_eq!(
            seek_target(Some(4), Some(7), OffsetReset::Earliest),
            Offset::Offset(7)
        );
        // Another member committed past what this process stored.
        assert_eq!(
            seek_target(Some(9), Some(7), OffsetReset::Latest),
            Offset::Offset(9)
        );
        assert_eq!(
            seek_target(None, Some(2), OffsetReset::Latest),
            Offset::Offset(2)
        );
    }

    #[test]
    fn test_seek_target_without_offsets_follows_reset() {
        assert_eq!(
            seek_target(None, None, OffsetReset::Earliest),
            Offset::Beginning
        );
        assert_eq!(seek_target(None, None, OffsetReset::Latest), Offset::End);
    }

    #[test]
    fn test_publish_error_mapping() {
        let timeout = Duration::from_secs(3);
        let produce = |code| publish_error("skills", timeout, KafkaError::MessageProduction(code));

        assert!(matches!(
            produce(RDKafkaErrorCode::NotEnoughReplicas),
            PublishError::NotEnoughReplicas
        ));
        assert!(matches!(
            produce(RDKafkaErrorCode::NotEnoughReplicasAfterAppend),
            PublishError::NotEnoughReplicas
        ));
        assert!(matches!(
            produce(RDKafkaErrorCode::MessageTimedOut),
            PublishError::Timeout(t) if t == timeout
        ));
        assert!(matches!(
            produce(RDKafkaErrorCode::UnknownTopicOrPartition),
            PublishError::UnknownTopic(topic) if topic == "skills"
        ));
        assert!(matches!(
            produce(RDKafkaErrorCode::MessageSizeTooLarge),
            PublishError::Unavailable(_)
        ));
        assert!(matches!(
            publish_error("skills", timeout, KafkaError::Canceled),
            PublishError::Unavailable(_)
        ));
    }

    #[test]
    fn test_to_log_record_copies_message() {
        let headers = OwnedHeaders::new().insert(Header {
            key: ACTION_HEADER,
            value: Some("update_name"),
        });
        let message = OwnedMessage::new(
            Some(b"{\"key\":\"go\",\"name\":\"gopher\"}".to_vec()),
            Some(b"go".to_vec()),
            "skills".to_string(),
            Timestamp::CreateTime(1_700_000_000_000),
            2,
            41,
            Some(headers),
        );

        let record = to_log_record(&message);

        assert_eq!(&*record.topic, "skills");
        assert_eq!(record.partition, 2);
        assert_eq!(record.offset, 41);
        assert_eq!(record.timestamp, 1_700_000_000_000);
        assert_eq!(record.key, Some(Bytes::from_static(b"go")));
        assert_eq!(
            record.headers,
            vec![(ACTION_HEADER.to_string(), Bytes::from_static(b"update_name"))]
        );
        assert_eq!(
            record.payload,
            Bytes::from_static(b"{\"key\":\"go\",\"name\":\"gopher\"}")
        );
    }

    #[test]
    fn test_to_log_record_without_key_headers_or_timestamp() {
        let message = OwnedMessage::new(
            None,
            None,
            "skills".to_string(),
            Timestamp::NotAvailable,
            0,
            0,
            None,
        );

        let record = to_log_record(&message);

        assert_eq!(record.key, None);
        assert!(record.headers.is_empty());
        assert!(record.payload.is_empty());
        assert_eq!(record.timestamp, -1);
    }

    fn tpl(entries: &[(&str, i32)]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        for (topic, partition) in entries {
            tpl.add_partition(topic, *partition);
        }
        tpl
    }

    #[test]
    fn test_assign_keeps_own_topic_sorted_and_bumps_generation() {
        let (context, assigned) = RebalanceContext::new("skills");

        context.assign(&tpl(&[("skills", 2), ("other", 0), ("skills", 0)]));

        let (partitions, revoke) = context.snapshot();
        assert_eq!(partitions, vec![0, 2]);
        assert!(!revoke.is_cancelled());
        assert_eq!(*assigned.borrow(), 1);
    }

    #[test]
    fn test_reassign_ends_previous_session() {
        let (context, assigned) = RebalanceContext::new("skills");
        context.assign(&tpl(&[("skills", 0), ("skills", 1)]));
        let (_, first) = context.snapshot();

        context.assign(&tpl(&[("skills", 1)]));

        let (partitions, second) = context.snapshot();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(partitions, vec![1]);
        assert_eq!(*assigned.borrow(), 2);
    }

    #[test]
    fn test_revoke_clears_assignment_without_new_generation() {
        let (context, assigned) = RebalanceContext::new("skills");
        context.assign(&tpl(&[("skills", 0)]));

        context.revoke();

        let (partitions, revoke) = context.snapshot();
        assert!(partitions.is_empty());
        assert!(revoke.is_cancelled());
        assert_eq!(*assigned.borrow(), 1);
    }
}
