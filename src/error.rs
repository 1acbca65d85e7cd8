//! Error taxonomy for the relay.
//!
//! # Error Hierarchy
//!
//! Each stage of the pipeline owns one error type, so a caller can tell
//! *where* a failure came from without string matching:
//!
//! - [`EncodeError`]: an [`Action`](crate::codec::Action) could not be serialized
//! - [`DecodeError`]: a delivered record is not a well-formed action (poison)
//! - [`PublishError`]: the log did not durably accept a message
//! - [`StoreError`]: the entity store rejected or failed an operation
//! - [`ApplyError`]: a decoded action could not be applied (wraps [`StoreError`])
//! - [`TransportError`]: consumer group membership or offset commit failed
//! - [`ConfigError`]: configuration is incomplete or inconsistent
//! - [`ServiceError`]: producer-facing API failures with HTTP-style status codes
//! - [`RelayError`]: what the supervisor hands back to `main`
//!
//! ## Classification
//!
//! The consumer branches on classification helpers rather than variants:
//!
//! - [`ApplyError::is_retriable`]: retry in place, then leave for redelivery
//! - [`TransportError::is_fatal`]: stop the member loop and shut down
//! - [`ServiceError::status_code`]: map to a response status

use std::time::Duration;

use thiserror::Error;

use crate::codec::ActionKind;

// =============================================================================
// Codec Errors
// =============================================================================

/// Serializing an action payload failed.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// serde_json refused the payload.
    #[error("failed to encode {kind} payload: {source}")]
    Serialize {
        kind: ActionKind,
        #[source]
        source: serde_json::Error,
    },
}

/// A delivered record could not be turned into an action.
///
/// Decode failures are deterministic: redelivering the same bytes yields the
/// same error, so the consumer skips the record instead of retrying it.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The record carried no action tag, neither as a header nor as its key.
    #[error("record carries no action tag")]
    MissingTag,

    /// The tag is not one of the known actions.
    #[error("unknown action tag '{0}'")]
    UnknownAction(String),

    /// The payload is not valid JSON for the tagged action.
    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: ActionKind,
        #[source]
        source: serde_json::Error,
    },

    /// The payload decoded but names no entity.
    #[error("{kind} payload has an empty key")]
    EmptyKey { kind: ActionKind },
}

// =============================================================================
// Log Errors
// =============================================================================

/// The log did not accept a message.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Actions must name an entity.
    #[error("action has an empty key")]
    EmptyKey,

    /// Payload serialization failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The topic does not exist and cannot be created.
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),

    /// Fewer in-sync replicas acknowledged the write than required.
    #[error("not enough in-sync replicas acknowledged the write")]
    NotEnoughReplicas,

    /// No acknowledgement arrived in time.
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    /// Broker unreachable or refused the request.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// The producer was closed.
    #[error("producer is closed")]
    Closed,
}

impl PublishError {
    /// Whether re-sending the same message may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            PublishError::NotEnoughReplicas | PublishError::Timeout(_) | PublishError::Unavailable(_)
        )
    }
}

/// Consumer group membership, fetch or commit failed.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The group is rebalancing; re-join to get a new assignment.
    #[error("rebalance in progress for group '{0}'")]
    RebalanceInProgress(String),

    /// A request carried a generation the coordinator no longer accepts.
    #[error("illegal generation {generation} for group '{group}'")]
    IllegalGeneration { group: String, generation: i32 },

    /// The coordinator does not know this member (evicted or left).
    #[error("unknown member '{member_id}' in group '{group}'")]
    UnknownMember { group: String, member_id: String },

    /// The subscribed topic does not exist.
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),

    /// Broker or network failure.
    #[error("broker error: {0}")]
    Broker(String),

    /// The client or the group was closed.
    #[error("consumer group is closed")]
    Closed,
}

impl TransportError {
    /// Fatal errors end the member loop; everything else is answered by
    /// backing off and re-joining.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Closed | TransportError::UnknownTopic(_))
    }
}

// =============================================================================
// Store & Apply Errors
// =============================================================================

/// Entity store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No entity with this key.
    #[error("skill '{0}' not found")]
    NotFound(String),

    /// An entity with this key already exists.
    #[error("skill '{0}' already exists")]
    Conflict(String),

    /// The backend is temporarily unreachable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored record no longer deserializes.
    #[error("corrupt record for skill '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// The store was closed.
    #[error("store is closed")]
    Closed,
}

impl StoreError {
    /// Transient failures may succeed when retried; the rest are
    /// deterministic for the same input.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }

    /// The store answered and will answer the same way for the same action.
    /// `Closed` is not a rejection: the action was never looked at.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            StoreError::NotFound(_) | StoreError::Conflict(_) | StoreError::Corrupt { .. }
        )
    }
}

impl From<slatedb::Error> for StoreError {
    fn from(err: slatedb::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Applying a decoded action failed.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The store deterministically rejected the action.
    #[error("{action} for '{key}' rejected: {source}")]
    Rejected {
        action: ActionKind,
        key: String,
        #[source]
        source: StoreError,
    },

    /// The store could not be reached or was closed.
    #[error("{action} for '{key}' failed: {source}")]
    Unavailable {
        action: ActionKind,
        key: String,
        #[source]
        source: StoreError,
    },
}

impl ApplyError {
    /// Classify a store failure for `action` on `key`.
    pub fn from_store(action: ActionKind, key: impl Into<String>, source: StoreError) -> Self {
        let key = key.into();
        if source.is_rejection() {
            ApplyError::Rejected { action, key, source }
        } else {
            ApplyError::Unavailable { action, key, source }
        }
    }

    /// Worth another attempt in place.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ApplyError::Unavailable { source, .. } if source.is_transient())
    }

    /// The offset may advance past a record that failed this way.
    pub fn is_rejection(&self) -> bool {
        matches!(self, ApplyError::Rejected { .. })
    }

    pub fn action(&self) -> ActionKind {
        match self {
            ApplyError::Rejected { action, .. } | ApplyError::Unavailable { action, .. } => *action,
        }
    }

    pub fn store_error(&self) -> &StoreError {
        match self {
            ApplyError::Rejected { source, .. } | ApplyError::Unavailable { source, .. } => source,
        }
    }
}

// =============================================================================
// Configuration Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    /// One or more settings failed validation.
    #[error("Configuration validation failed: {}", .0.join("; "))]
    Invalid(Vec<String>),

    /// The object store backing the entity store could not be built.
    #[error("failed to create object store: {0}")]
    ObjectStore(String),
}

// =============================================================================
// Service & Top-Level Errors
// =============================================================================

/// Producer-facing API errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The key in the request path differs from the key in the body.
    #[error("Key does not match")]
    KeyMismatch { path: String, body: String },

    /// Requests must name an entity.
    #[error("key must not be empty")]
    EmptyKey,

    #[error("Skill not found")]
    NotFound(String),

    #[error("failed to publish action: {0}")]
    Publish(#[from] PublishError),

    #[error("failed to read skill: {0}")]
    Store(StoreError),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => ServiceError::NotFound(key),
            other => ServiceError::Store(other),
        }
    }
}

impl ServiceError {
    /// HTTP status the error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            ServiceError::KeyMismatch { .. } | ServiceError::EmptyKey => 400,
            ServiceError::NotFound(_) => 404,
            ServiceError::Publish(_) | ServiceError::Store(_) => 500,
        }
    }
}

/// Errors surfaced by the lifecycle supervisor.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The consumer task panicked or was aborted.
    #[error("consumer task failed: {0}")]
    Task(String),
}
