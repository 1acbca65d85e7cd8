//! In-process partitioned log with consumer group coordination.
//!
//! [`MemoryBroker`] behaves like a single Kafka broker for the parts the
//! relay depends on:
//!
//! - Topics with a fixed partition count, auto-created on first use
//! - murmur2 key partitioning, so the same key always lands in the same
//!   partition as with a Kafka client
//! - Consumer groups with generations, a join barrier and round-robin
//!   partition assignment
//! - Committed offsets per group, validated against the generation
//!
//! # Group Protocol
//!
//! ```text
//!   member joins / leaves / trigger_rebalance
//!        │
//!        ▼
//!   generation += 1, revoke token of the old generation fires
//!        │
//!        ▼
//!   every member re-joins (barrier) ──► laggards evicted after session timeout
//!        │
//!        ▼
//!   assignment computed, sessions handed out
//! ```
//!
//! Because the assignment for a new generation is only computed once every
//! member has re-joined, and a member only re-joins after its claims have
//! stopped, a partition is never consumed by two members at once.
//!
//! Fault injection (`fail_next_appends`, `fail_next_commits`) lets tests
//! exercise the error paths.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::partitioner::partition_for_key;
use super::{ClaimStream, GroupTransport, LogProducer, LogRecord, OffsetCommitter, Session};
use crate::codec::Envelope;
use crate::constants::{ACTION_HEADER, DEFAULT_SESSION_TIMEOUT_MS, DEFAULT_TOPIC_PARTITIONS};
use crate::error::{PublishError, TransportError};
use crate::shutdown::Shutdown;
use crate::types::{OffsetReset, PartitionPosition};

/// Broker-wide settings.
#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Partition count for auto-created topics.
    pub default_partitions: i32,
    pub auto_create_topics: bool,
    /// How long the join barrier waits for members before evicting them.
    pub session_timeout: Duration,
    /// Start position for partitions without a committed offset.
    pub initial_offset: OffsetReset,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            default_partitions: DEFAULT_TOPIC_PARTITIONS,
            auto_create_topics: true,
            session_timeout: Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS),
            initial_offset: OffsetReset::Earliest,
        }
    }
}

// =============================================================================
// Internal State
// =============================================================================

struct PartitionLog {
    records: RwLock<Vec<LogRecord>>,
    appended: Notify,
}

struct TopicLog {
    name: Arc<str>,
    partitions: Vec<PartitionLog>,
}

impl TopicLog {
    fn new(name: &str, partitions: i32) -> Self {
        Self {
            name: Arc::from(name),
            partitions: (0..partitions.max(1))
                .map(|_| PartitionLog {
                    records: RwLock::new(Vec::new()),
                    appended: Notify::new(),
                })
                .collect(),
        }
    }

    fn partition_count(&self) -> i32 {
        self.partitions.len() as i32
    }

    fn partition(&self, partition: i32) -> Option<&PartitionLog> {
        usize::try_from(partition)
            .ok()
            .and_then(|p| self.partitions.get(p))
    }
}

struct MemberSlot {
    /// Generation this member last joined.
    joined_generation: i32,
}

struct GroupState {
    topic: String,
    generation: i32,
    members: BTreeMap<String, MemberSlot>,
    /// Fired when the current generation ends.
    revoke: Shutdown,
    /// Assignment for `assigned_generation`.
    assignment: BTreeMap<String, Vec<i32>>,
    assigned_generation: i32,
    offsets: HashMap<i32, i64>,
}

impl GroupState {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            generation: 0,
            members: BTreeMap::new(),
            revoke: Shutdown::new(),
            assignment: BTreeMap::new(),
            assigned_generation: -1,
            offsets: HashMap::new(),
        }
    }

    /// End the current generation.
    fn bump(&mut self) {
        self.generation += 1;
        self.revoke.cancel();
        self.revoke = Shutdown::new();
        self.assignment.clear();
    }

    fn all_joined(&self) -> bool {
        self.members
            .values()
            .all(|m| m.joined_generation == self.generation)
    }

    /// Round-robin over members sorted by id.
    fn assign(&mut self, partitions: i32) {
        let members: Vec<&String> = self.members.keys().collect();
        let mut assignment: BTreeMap<String, Vec<i32>> = members
            .iter()
            .map(|m| ((*m).clone(), Vec::new()))
            .collect();
        if !members.is_empty() {
            for p in 0..partitions {
                let owner = members[p as usize % members.len()];
                if let Some(owned) = assignment.get_mut(owner) {
                    owned.push(p);
                }
            }
        }
        self.assignment = assignment;
        self.assigned_generation = self.generation;
    }
}

struct BrokerInner {
    options: BrokerOptions,
    topics: RwLock<HashMap<String, Arc<TopicLog>>>,
    groups: Mutex<HashMap<String, GroupState>>,
    group_changed: Notify,
    closed: AtomicBool,
    failing_appends: AtomicU32,
    failing_commits: AtomicU32,
}

fn take_injected(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// =============================================================================
// Broker
// =============================================================================

/// An in-process log broker. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(BrokerOptions::default())
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("options", &self.inner.options)
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryBroker {
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                options,
                topics: RwLock::new(HashMap::new()),
                groups: Mutex::new(HashMap::new()),
                group_changed: Notify::new(),
                closed: AtomicBool::new(false),
                failing_appends: AtomicU32::new(0),
                failing_commits: AtomicU32::new(0),
            }),
        }
    }

    /// Create a topic. Returns `false` if it already exists.
    pub async fn create_topic(&self, name: &str, partitions: i32) -> bool {
        let mut topics = self.inner.topics.write().await;
        if topics.contains_key(name) {
            return false;
        }
        info!(topic = name, partitions, "Created topic");
        topics.insert(name.to_string(), Arc::new(TopicLog::new(name, partitions)));
        true
    }

    async fn topic(&self, name: &str) -> Option<Arc<TopicLog>> {
        if let Some(topic) = self.inner.topics.read().await.get(name) {
            return Some(topic.clone());
        }
        if !self.inner.options.auto_create_topics {
            return None;
        }
        let mut topics = self.inner.topics.write().await;
        let topic = topics.entry(name.to_string()).or_insert_with(|| {
            info!(
                topic = name,
                partitions = self.inner.options.default_partitions,
                "Auto-created topic"
            );
            Arc::new(TopicLog::new(name, self.inner.options.default_partitions))
        });
        Some(topic.clone())
    }

    pub async fn partition_count(&self, topic: &str) -> Option<i32> {
        self.inner
            .topics
            .read()
            .await
            .get(topic)
            .map(|t| t.partition_count())
    }

    /// Append a record with arbitrary key and headers.
    ///
    /// The partition is chosen from `key` like [`LogProducer::send`] does;
    /// keyless records go to partition 0.
    pub async fn append_raw(
        &self,
        topic: &str,
        key: Option<Bytes>,
        headers: Vec<(String, Bytes)>,
        payload: Bytes,
    ) -> Result<PartitionPosition, PublishError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PublishError::Closed);
        }
        if take_injected(&self.inner.failing_appends) {
            return Err(PublishError::Unavailable("injected append failure".to_string()));
        }
        let log = self
            .topic(topic)
            .await
            .ok_or_else(|| PublishError::UnknownTopic(topic.to_string()))?;

        let partition = match &key {
            Some(key) => partition_for_key(key, log.partition_count()),
            None => 0,
        };
        let Some(partition_log) = log.partition(partition) else {
            return Err(PublishError::UnknownTopic(topic.to_string()));
        };

        let offset = {
            let mut records = partition_log.records.write().await;
            let offset = records.len() as i64;
            records.push(LogRecord {
                topic: log.name.clone(),
                partition,
                offset,
                timestamp: chrono::Utc::now().timestamp_millis(),
                key,
                headers,
                payload,
            });
            offset
        };
        partition_log.appended.notify_waiters();

        Ok(PartitionPosition::new(partition, offset))
    }

    /// Snapshot of every record in one partition.
    pub async fn records(&self, topic: &str, partition: i32) -> Vec<LogRecord> {
        let Some(log) = self.inner.topics.read().await.get(topic).cloned() else {
            return Vec::new();
        };
        match log.partition(partition) {
            Some(p) => p.records.read().await.clone(),
            None => Vec::new(),
        }
    }

    /// Offset the next appended record in `partition` will get.
    pub async fn high_watermark(&self, topic: &str, partition: i32) -> i64 {
        self.records(topic, partition).await.len() as i64
    }

    pub async fn committed_offset(&self, group: &str, partition: i32) -> Option<i64> {
        self.inner
            .groups
            .lock()
            .await
            .get(group)
            .and_then(|g| g.offsets.get(&partition).copied())
    }

    pub async fn generation(&self, group: &str) -> Option<i32> {
        self.inner.groups.lock().await.get(group).map(|g| g.generation)
    }

    pub async fn members(&self, group: &str) -> Vec<String> {
        self.inner
            .groups
            .lock()
            .await
            .get(group)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// End the current generation of `group` without a membership change,
    /// the way a coordinator does on a topic metadata change.
    pub async fn trigger_rebalance(&self, group: &str) {
        let mut groups = self.inner.groups.lock().await;
        if let Some(state) = groups.get_mut(group) {
            state.bump();
            info!(group, generation = state.generation, "Rebalance triggered");
        }
        drop(groups);
        self.inner.group_changed.notify_waiters();
    }

    pub fn fail_next_appends(&self, n: u32) {
        self.inner.failing_appends.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_commits(&self, n: u32) {
        self.inner.failing_commits.store(n, Ordering::SeqCst);
    }

    /// A group member handle for `group` subscribed to `topic`.
    pub fn member(&self, group: &str, topic: &str) -> MemoryGroupMember {
        MemoryGroupMember {
            broker: self.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            member_id: format!("member-{}", uuid::Uuid::new_v4()),
            closed: AtomicBool::new(false),
        }
    }

    /// Shut the broker down. Pending reads and joins fail with
    /// [`TransportError::Closed`], appends with [`PublishError::Closed`].
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for state in self.inner.groups.lock().await.values() {
            state.revoke.cancel();
        }
        for topic in self.inner.topics.read().await.values() {
            for partition in &topic.partitions {
                partition.appended.notify_waiters();
            }
        }
        self.inner.group_changed.notify_waiters();
        info!("Memory broker closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Group Coordination
    // =========================================================================

    async fn join_group(
        &self,
        group: &str,
        topic: &str,
        member_id: &str,
    ) -> Result<Session, TransportError> {
        let log = self
            .topic(topic)
            .await
            .ok_or_else(|| TransportError::UnknownTopic(topic.to_string()))?;
        let session_timeout = self.inner.options.session_timeout;
        let mut deadline = Instant::now() + session_timeout;

        loop {
            if self.is_closed() {
                return Err(TransportError::Closed);
            }

            let mut groups = self.inner.groups.lock().await;
            let state = groups
                .entry(group.to_string())
                .or_insert_with(|| GroupState::new(topic));

            if state.topic != topic {
                return Err(TransportError::Broker(format!(
                    "group '{group}' is subscribed to '{}', not '{topic}'",
                    state.topic
                )));
            }

            if !state.members.contains_key(member_id) {
                state.members.insert(
                    member_id.to_string(),
                    MemberSlot {
                        joined_generation: -1,
                    },
                );
                state.bump();
                info!(
                    group,
                    member_id,
                    generation = state.generation,
                    "Member joined, rebalancing"
                );
                self.inner.group_changed.notify_waiters();
            }

            let generation = state.generation;
            if let Some(slot) = state.members.get_mut(member_id) {
                slot.joined_generation = generation;
            }

            if state.all_joined() {
                if state.assigned_generation != generation {
                    state.assign(log.partition_count());
                    debug!(group, generation, assignment = ?state.assignment, "Computed assignment");
                    self.inner.group_changed.notify_waiters();
                }
                return Ok(self.build_session(group, member_id, state, &log).await);
            }

            let notified = self.inner.group_changed.notified();
            drop(groups);

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                self.evict_laggards(group, generation).await;
                deadline = Instant::now() + session_timeout;
            }
        }
    }

    async fn evict_laggards(&self, group: &str, generation: i32) {
        let mut groups = self.inner.groups.lock().await;
        let Some(state) = groups.get_mut(group) else {
            return;
        };
        if state.generation != generation {
            return;
        }
        let laggards: Vec<String> = state
            .members
            .iter()
            .filter(|(_, slot)| slot.joined_generation != generation)
            .map(|(id, _)| id.clone())
            .collect();
        if laggards.is_empty() {
            return;
        }
        for id in &laggards {
            state.members.remove(id);
        }
        state.bump();
        warn!(
            group,
            evicted = ?laggards,
            generation = state.generation,
            "Evicted members that missed the join deadline"
        );
        drop(groups);
        self.inner.group_changed.notify_waiters();
    }

    async fn build_session(
        &self,
        group: &str,
        member_id: &str,
        state: &GroupState,
        log: &Arc<TopicLog>,
    ) -> Session {
        let partitions = state.assignment.get(member_id).cloned().unwrap_or_default();

        let mut claims: Vec<Box<dyn ClaimStream>> = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let start = match state.offsets.get(&partition) {
                Some(offset) => *offset,
                None => match self.inner.options.initial_offset {
                    OffsetReset::Earliest => 0,
                    OffsetReset::Latest => match log.partition(partition) {
                        Some(p) => p.records.read().await.len() as i64,
                        None => 0,
                    },
                },
            };
            claims.push(Box::new(MemoryClaim {
                broker: self.clone(),
                log: log.clone(),
                partition,
                initial_offset: start,
                next_offset: start,
            }));
        }

        Session {
            member_id: member_id.to_string(),
            generation: state.generation,
            claims,
            revoked: state.revoke.clone(),
            committer: Arc::new(MemoryCommitter {
                broker: self.clone(),
                group: group.to_string(),
                member_id: member_id.to_string(),
                generation: state.generation,
            }),
        }
    }

    async fn leave_group(&self, group: &str, member_id: &str) {
        let mut groups = self.inner.groups.lock().await;
        let Some(state) = groups.get_mut(group) else {
            return;
        };
        if state.members.remove(member_id).is_some() {
            state.bump();
            info!(
                group,
                member_id,
                generation = state.generation,
                remaining = state.members.len(),
                "Member left"
            );
        }
        drop(groups);
        self.inner.group_changed.notify_waiters();
    }

    async fn commit_offset(
        &self,
        group: &str,
        member_id: &str,
        generation: i32,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if take_injected(&self.inner.failing_commits) {
            return Err(TransportError::Broker("injected commit failure".to_string()));
        }

        let mut groups = self.inner.groups.lock().await;
        let unknown_member = || TransportError::UnknownMember {
            group: group.to_string(),
            member_id: member_id.to_string(),
        };
        let state = groups.get_mut(group).ok_or_else(unknown_member)?;
        if !state.members.contains_key(member_id) {
            return Err(unknown_member());
        }
        if state.generation != generation {
            return Err(TransportError::IllegalGeneration {
                group: group.to_string(),
                generation,
            });
        }
        state.offsets.insert(partition, next_offset);
        Ok(())
    }
}

#[async_trait]
impl LogProducer for MemoryBroker {
    async fn send(
        &self,
        topic: &str,
        envelope: &Envelope,
    ) -> Result<PartitionPosition, PublishError> {
        self.append_raw(
            topic,
            Some(Bytes::copy_from_slice(envelope.partition_key.as_bytes())),
            vec![(
                ACTION_HEADER.to_string(),
                Bytes::from_static(envelope.kind.as_str().as_bytes()),
            )],
            envelope.payload.clone(),
        )
        .await
    }
}

// =============================================================================
// Member, Claim, Committer
// =============================================================================

/// One member of a consumer group on a [`MemoryBroker`].
pub struct MemoryGroupMember {
    broker: MemoryBroker,
    group: String,
    topic: String,
    member_id: String,
    closed: AtomicBool,
}

impl MemoryGroupMember {
    pub fn member_id(&self) -> &str {
        &self.member_id
    }
}

#[async_trait]
impl GroupTransport for MemoryGroupMember {
    async fn join(&self) -> Result<Session, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.broker
            .join_group(&self.group, &self.topic, &self.member_id)
            .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.leave_group(&self.group, &self.member_id).await;
        Ok(())
    }
}

struct MemoryClaim {
    broker: MemoryBroker,
    log: Arc<TopicLog>,
    partition: i32,
    initial_offset: i64,
    next_offset: i64,
}

#[async_trait]
impl ClaimStream for MemoryClaim {
    fn topic(&self) -> &str {
        &self.log.name
    }

    fn partition(&self) -> i32 {
        self.partition
    }

    fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    async fn next_record(&mut self) -> Result<LogRecord, TransportError> {
        let Some(partition) = self.log.partition(self.partition) else {
            return Err(TransportError::UnknownTopic(self.log.name.to_string()));
        };
        loop {
            // Registered before the check so an append in between is not missed.
            let appended = partition.appended.notified();

            let record = match usize::try_from(self.next_offset) {
                Ok(index) => partition.records.read().await.get(index).cloned(),
                Err(_) => None,
            };
            if let Some(record) = record {
                self.next_offset += 1;
                return Ok(record);
            }
            if self.broker.is_closed() {
                return Err(TransportError::Closed);
            }
            appended.await;
        }
    }
}

struct MemoryCommitter {
    broker: MemoryBroker,
    group: String,
    member_id: String,
    generation: i32,
}

#[async_trait]
impl OffsetCommitter for MemoryCommitter {
    async fn commit(
        &self,
        _topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), TransportError> {
        self.broker
            .commit_offset(
                &self.group,
                &self.member_id,
                self.generation,
                partition,
                next_offset,
            )
            .await
    }
}
