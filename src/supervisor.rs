//! Lifecycle supervisor for a consumer.
//!
//! The supervisor owns the process-wide [`Shutdown`] token and runs the
//! [`GroupConsumer`] under it:
//!
//! 1. Spawn the member loop and watch its [`Readiness`]. Every new session
//!    that starts consuming is logged; rebalances re-arm readiness without
//!    any action from the supervisor.
//! 2. Stop when the token fires (signal listener, embedding application) or
//!    when the member loop ends on its own (fatal transport error).
//! 3. Fire the token, wait for the member loop to drain its claims (bounded
//!    by the drain timeout), then close the transport.
//!
//! Step 3 runs exactly once, whichever source ended step 2.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tracing::{error, info, warn};

use crate::consumer::{GroupConsumer, Readiness};
use crate::error::{RelayError, TransportError};
use crate::shutdown::{Shutdown, listen_for_signals};

pub struct Supervisor {
    consumer: Arc<GroupConsumer>,
    shutdown: Shutdown,
    drain_timeout: Duration,
}

impl Supervisor {
    /// `drain_timeout` is normally the group session timeout.
    pub fn new(consumer: GroupConsumer, drain_timeout: Duration) -> Self {
        Self {
            consumer: Arc::new(consumer),
            shutdown: Shutdown::new(),
            drain_timeout,
        }
    }

    /// Token that stops [`run`](Self::run) when fired.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    pub fn readiness(&self) -> Readiness {
        self.consumer.readiness()
    }

    /// Run until the shutdown token fires or the consumer fails.
    pub async fn run(self) -> Result<(), RelayError> {
        let mut readiness = self.consumer.readiness();
        let mut task = tokio::spawn({
            let consumer = self.consumer.clone();
            let shutdown = self.shutdown.clone();
            async move { consumer.run(shutdown).await }
        });

        let mut last_session = 0;
        let mut watching = true;
        let mut finished: Option<Result<Result<(), TransportError>, JoinError>> = None;

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested, draining consumer");
                    break;
                }
                joined = &mut task => {
                    finished = Some(joined);
                    break;
                }
                ready = readiness.wait_ready(last_session), if watching => match ready {
                    Some(state) => {
                        if last_session == 0 {
                            info!(
                                generation = state.generation,
                                partitions = ?state.partitions,
                                "Consumer up and running"
                            );
                        } else {
                            info!(
                                generation = state.generation,
                                partitions = ?state.partitions,
                                "Consumer ready again after rebalance"
                            );
                        }
                        last_session = state.session;
                    }
                    None => watching = false,
                },
            }
        }

        self.shutdown.cancel();
        let outcome = match finished {
            Some(joined) => joined,
            None => match tokio::time::timeout(self.drain_timeout, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(timeout = ?self.drain_timeout, "Consumer did not drain in time, aborting");
                    task.abort();
                    task.await
                }
            },
        };

        if let Err(e) = self.consumer.transport().close().await {
            warn!(error = %e, "Failed to close consumer group transport");
        }
        info!("Supervisor stopped");

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(RelayError::Transport(e)),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => {
                error!(error = %e, "Consumer task failed");
                Err(RelayError::Task(e.to_string()))
            }
        }
    }

    /// [`run`](Self::run) with SIGINT/SIGTERM wired to the shutdown token.
    pub async fn run_until_signal(self) -> Result<(), RelayError> {
        let listener = listen_for_signals(self.shutdown.clone());
        let result = self.run().await;
        // `run` fired the token, so the listener has returned or is about to.
        let _ = listener.await;
        result
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("consumer", &self.consumer)
            .field("cancelled", &self.shutdown.is_cancelled())
            .field("drain_timeout", &self.drain_timeout)
            .finish()
    }
}
