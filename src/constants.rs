//! Centralized protocol and configuration constants.
//!
//! Everything the producer and the consumer must agree on (header names,
//! action tags, store key layout) lives here, next to the defaults used by
//! [`RelayConfig`](crate::config::RelayConfig).

use std::time::Duration;

// =============================================================================
// Wire Constants
// =============================================================================

/// Message header carrying the action tag (`create`, `update_name`, ...).
///
/// The tag travels out-of-band so the record key stays free for the entity
/// key, which drives partition assignment.
pub const ACTION_HEADER: &str = "action";

/// Action tags as they appear on the wire.
pub const TAG_CREATE: &str = "create";
pub const TAG_REPLACE: &str = "update";
pub const TAG_DELETE: &str = "delete";
pub const TAG_UPDATE_NAME: &str = "update_name";
pub const TAG_UPDATE_DESCRIPTION: &str = "update_desc";
pub const TAG_UPDATE_LOGO: &str = "update_logo";
pub const TAG_UPDATE_TAGS: &str = "update_tags";

// =============================================================================
// Store Constants
// =============================================================================

/// Key prefix for skill records in SlateDB.
pub const SKILL_KEY_PREFIX: &[u8] = b"skill/";

/// Exclusive upper bound for a prefix scan over [`SKILL_KEY_PREFIX`]
/// (`'/' + 1 == '0'`).
pub const SKILL_KEY_PREFIX_END: &[u8] = b"skill0";

// =============================================================================
// Consumer Group Defaults
// =============================================================================

/// Default consumer group session timeout.
///
/// Matches the Kafka client default; also bounds how long shutdown waits for
/// in-flight claims to drain.
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 10_000;

/// Lower bound accepted for the session timeout.
pub const MIN_SESSION_TIMEOUT_MS: u64 = 100;

/// Delay before re-joining after a claim failed without a rebalance.
pub const DEFAULT_REJOIN_DELAY_MS: u64 = 1_000;

/// Default partition count for auto-created topics.
pub const DEFAULT_TOPIC_PARTITIONS: i32 = 3;

/// Default time a publish waits for broker acknowledgement.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Apply Retry Defaults
// =============================================================================

/// First backoff step when the store is transiently unavailable.
pub const DEFAULT_APPLY_RETRY_MIN_DELAY_MS: u64 = 10;

/// Backoff ceiling for store retries.
pub const DEFAULT_APPLY_RETRY_MAX_DELAY_MS: u64 = 500;

/// Retries before a claim gives up and the record is left for redelivery.
pub const DEFAULT_APPLY_RETRY_MAX_TIMES: usize = 3;

// =============================================================================
// Environment Defaults
// =============================================================================

pub const DEFAULT_CLIENT_ID: &str = "skill-relay";
pub const DEFAULT_DATA_PATH: &str = "/tmp/skillrelay-data";
