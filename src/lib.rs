//! # Skillrelay
//! Asynchronous command relay for skill records.
//!
//! Writes to a skill are not applied to the store directly. Each write is
//! encoded as an action, appended to a partitioned log keyed by the skill
//! key, and applied later by a consumer group. Reads go to the store and are
//! eventually consistent with the writes.
//!
//! ```text
//!   SkillService ──► SkillPublisher ──► log (partition = hash(key))
//!                                             │
//!                                             ▼
//!   SkillStore ◄── MutationDispatcher ◄── GroupConsumer ◄── Supervisor
//! ```
//!
//! # Guarantees
//! - Actions for one skill are applied in the order they were published
//! - At-least-once: an offset is committed only after its action was applied,
//!   and every action is idempotent on the store
//! - Undecodable records (poison) are skipped without touching the store
//! - A rebalance stops every claim before partitions are handed out again
//!
//! ## Getting started
//! Everything runs in-process with [`MemoryBroker`](log::MemoryBroker) and
//! [`MemoryStore`](store::MemoryStore); the `kafka` feature adds a
//! librdkafka transport and the `skill-relay-consumer` binary.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use skillrelay::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::default();
//!     let broker = MemoryBroker::default();
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let publisher = SkillPublisher::new(Arc::new(broker.clone()), &config.topic);
//!     publisher.publish(&Action::Create(Skill::new("go").with_name("Go"))).await?;
//!
//!     let transport = Arc::new(broker.member(&config.group_id, &config.topic));
//!     let dispatcher = MutationDispatcher::new(store.clone());
//!     let consumer = GroupConsumer::new(transport, dispatcher, &config);
//!     Supervisor::new(consumer, config.session_timeout)
//!         .run_until_signal()
//!         .await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod log;
pub mod metrics;
pub mod producer;
pub mod retry;
pub mod service;
pub mod shutdown;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Common imports for embedding the relay.
    pub use crate::codec::{Action, ActionKind, Envelope};
    pub use crate::config::{ObjectStoreType, RelayConfig, RetryConfig, StoreConfig};
    pub use crate::consumer::{GroupConsumer, MemberPhase, MemberState, Readiness};
    pub use crate::dispatcher::{Disposition, MutationDispatcher};
    pub use crate::error::{
        ApplyError, ConfigError, DecodeError, EncodeError, PublishError, RelayError, ServiceError,
        StoreError, TransportError,
    };
    pub use crate::log::{GroupTransport, LogProducer, MemoryBroker};
    pub use crate::producer::SkillPublisher;
    pub use crate::service::SkillService;
    pub use crate::shutdown::Shutdown;
    pub use crate::store::{MemoryStore, SkillStore, SlateStore, open_store};
    pub use crate::supervisor::Supervisor;
    pub use crate::types::{PartitionPosition, Skill};

    #[cfg(feature = "kafka")]
    pub use crate::log::{KafkaGroupTransport, KafkaProducer};

    pub use bytes;
}
