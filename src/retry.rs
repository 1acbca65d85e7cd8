//! Backoff policies built on `backon`.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `RelayConfig::apply_retry` | 10ms | 500ms | 3 | Store calls while applying an action |
//! | [`JOIN_RETRY`] | 100ms | 10s | 5 | Joining the group after a transport error |
//!
//! Apply retries run in place through `Retryable` (see
//! [`MutationDispatcher`](crate::dispatcher::MutationDispatcher)). Join
//! retries are interleaved with shutdown checks, so the consumer steps a
//! [`JoinBackoff`] by hand instead.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff};

use crate::config::RetryConfig;

/// Backoff between failed group joins.
pub const JOIN_RETRY: RetryConfig = RetryConfig {
    min_delay: Duration::from_millis(100),
    max_delay: Duration::from_secs(10),
    max_times: 5,
};

/// Delays between consecutive failed joins.
///
/// A successful join calls [`reset`](Self::reset) so the next failure starts
/// again from the minimum delay.
#[derive(Debug)]
pub struct JoinBackoff {
    config: RetryConfig,
    delays: Option<ExponentialBackoff>,
}

impl JoinBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            delays: None,
        }
    }

    /// Delay before the next attempt, or `None` once the retries are spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.delays
            .get_or_insert_with(|| self.config.policy().build())
            .next()
    }

    pub fn reset(&mut self) {
        self.delays = None;
    }
}
