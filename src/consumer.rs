//! Consumer group member: joins the group, runs one task per claimed
//! partition and re-joins on every rebalance.
//!
//! # Member State Machine
//!
//! ```text
//!              join ok                  claims spawned
//!   Joining ───────────► Assigned ─────────────────► Consuming
//!      ▲                                                │
//!      │   claims drained          revoked / claim failed│
//!      └──────────────── Rebalancing ◄──────────────────┘
//!
//!   any state ── shutdown or fatal transport error ──► Closed
//! ```
//!
//! Every transition is published on a watch channel. [`Readiness`] lets a
//! supervisor wait for the next `Consuming` transition, so readiness is
//! re-armed by each new session rather than by recreating a channel.
//!
//! # Delivery
//!
//! A claim task pulls records in partition order, dispatches each one and
//! commits `offset + 1` only after the dispatcher has accepted it. A claim
//! that is stopped while waiting for a record returns without committing
//! anything, so in-flight records are redelivered (at-least-once).

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{RelayConfig, RetryConfig};
use crate::dispatcher::MutationDispatcher;
use crate::error::{ApplyError, TransportError};
use crate::log::{ClaimStream, GroupTransport, OffsetCommitter, Session};
use crate::metrics::{ASSIGNED_PARTITIONS, REBALANCES};
use crate::retry::{JOIN_RETRY, JoinBackoff};
use crate::shutdown::Shutdown;

// =============================================================================
// Member State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberPhase {
    Joining,
    Assigned,
    Consuming,
    Rebalancing,
    Closed,
}

impl MemberPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberPhase::Joining => "joining",
            MemberPhase::Assigned => "assigned",
            MemberPhase::Consuming => "consuming",
            MemberPhase::Rebalancing => "rebalancing",
            MemberPhase::Closed => "closed",
        }
    }
}

/// Snapshot of the member as published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberState {
    pub phase: MemberPhase,
    /// Group generation of the current (or last) session.
    pub generation: i32,
    /// Sessions started by this member so far; grows by one per join.
    pub session: u64,
    pub partitions: Vec<i32>,
}

impl MemberState {
    fn initial() -> Self {
        Self {
            phase: MemberPhase::Joining,
            generation: -1,
            session: 0,
            partitions: Vec::new(),
        }
    }
}

/// Observer side of the member state channel.
#[derive(Debug, Clone)]
pub struct Readiness {
    rx: watch::Receiver<MemberState>,
}

impl Readiness {
    pub fn current(&self) -> MemberState {
        self.rx.borrow().clone()
    }

    /// Wait until a session newer than `after_session` is consuming.
    ///
    /// Returns `None` once the member is closed.
    pub async fn wait_ready(&mut self, after_session: u64) -> Option<MemberState> {
        let state = self
            .rx
            .wait_for(|state| {
                state.phase == MemberPhase::Closed
                    || (state.phase == MemberPhase::Consuming && state.session > after_session)
            })
            .await
            .ok()?
            .clone();
        (state.phase != MemberPhase::Closed).then_some(state)
    }
}

// =============================================================================
// Claim Tasks
// =============================================================================

#[derive(Debug, Error)]
enum ClaimError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("claim task failed: {0}")]
    Task(String),
}

/// Consume one partition until `stop` fires or something fails.
async fn consume_claim(
    mut claim: Box<dyn ClaimStream>,
    dispatcher: MutationDispatcher,
    committer: Arc<dyn OffsetCommitter>,
    stop: Shutdown,
) -> Result<(), ClaimError> {
    let topic = claim.topic().to_string();
    let partition = claim.partition();
    debug!(topic = %topic, partition, offset = claim.initial_offset(), "Claim started");

    loop {
        let record = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!(topic = %topic, partition, "Claim stopped");
                return Ok(());
            }
            record = claim.next_record() => record?,
        };

        dispatcher.dispatch(&record).await?;
        committer.commit(&topic, partition, record.offset + 1).await?;
    }
}

enum SessionEnd {
    Shutdown,
    Revoked,
    ClaimFailed,
}

// =============================================================================
// Group Consumer
// =============================================================================

/// One member of the consumer group.
pub struct GroupConsumer {
    transport: Arc<dyn GroupTransport>,
    dispatcher: MutationDispatcher,
    session_timeout: Duration,
    rejoin_delay: Duration,
    join_retry: RetryConfig,
    state: watch::Sender<MemberState>,
}

impl GroupConsumer {
    pub fn new(
        transport: Arc<dyn GroupTransport>,
        dispatcher: MutationDispatcher,
        config: &RelayConfig,
    ) -> Self {
        let (state, _) = watch::channel(MemberState::initial());
        Self {
            transport,
            dispatcher,
            session_timeout: config.session_timeout,
            rejoin_delay: config.rejoin_delay,
            join_retry: JOIN_RETRY,
            state,
        }
    }

    /// Backoff between failed joins. Exhausting it ends [`run`](Self::run).
    pub fn with_join_retry(mut self, retry: RetryConfig) -> Self {
        self.join_retry = retry;
        self
    }

    pub fn transport(&self) -> &Arc<dyn GroupTransport> {
        &self.transport
    }

    pub fn readiness(&self) -> Readiness {
        Readiness {
            rx: self.state.subscribe(),
        }
    }

    pub fn state(&self) -> MemberState {
        self.state.borrow().clone()
    }

    fn transition(&self, phase: MemberPhase) {
        self.state.send_modify(|state| state.phase = phase);
        debug!(phase = phase.as_str(), "Member state changed");
    }

    /// Run the member loop until `shutdown` fires or a fatal transport
    /// error occurs. Does not close the transport.
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), TransportError> {
        let result = self.member_loop(&shutdown).await;
        self.state.send_modify(|state| {
            state.phase = MemberPhase::Closed;
            state.partitions.clear();
        });
        ASSIGNED_PARTITIONS.set(0);
        match &result {
            Ok(()) => info!("Consumer stopped"),
            Err(e) => error!(error = %e, "Consumer stopped on transport error"),
        }
        result
    }

    async fn member_loop(&self, shutdown: &Shutdown) -> Result<(), TransportError> {
        let mut backoff = JoinBackoff::new(self.join_retry);
        let mut sessions = 0u64;

        loop {
            self.transition(MemberPhase::Joining);
            let joined = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                joined = self.transport.join() => joined,
            };

            let session = match joined {
                Ok(session) => {
                    backoff.reset();
                    session
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    let Some(delay) = backoff.next_delay() else {
                        error!(error = %e, "Giving up joining the group");
                        return Err(e);
                    };
                    warn!(error = %e, retry_in = ?delay, "Join failed, backing off");
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            sessions += 1;
            match self.run_session(session, sessions, shutdown).await? {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Revoked => {}
                SessionEnd::ClaimFailed => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.rejoin_delay) => {}
                    }
                }
            }
        }
    }

    async fn run_session(
        &self,
        session: Session,
        sequence: u64,
        shutdown: &Shutdown,
    ) -> Result<SessionEnd, TransportError> {
        let partitions = session.partitions();
        let Session {
            member_id,
            generation,
            claims,
            revoked,
            committer,
        } = session;

        info!(member_id = %member_id, generation, ?partitions, "Partitions assigned");
        self.state.send_replace(MemberState {
            phase: MemberPhase::Assigned,
            generation,
            session: sequence,
            partitions: partitions.clone(),
        });
        ASSIGNED_PARTITIONS.set(partitions.len() as i64);

        let stop = Shutdown::new();
        let mut tasks = JoinSet::new();
        for claim in claims {
            tasks.spawn(consume_claim(
                claim,
                self.dispatcher.clone(),
                committer.clone(),
                stop.clone(),
            ));
        }
        self.transition(MemberPhase::Consuming);

        let mut failure = None;
        let end = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break SessionEnd::Shutdown,
                _ = revoked.cancelled() => break SessionEnd::Revoked,
                Some(joined) = tasks.join_next() => match joined {
                    Ok(Ok(())) => continue,
                    Ok(Err(e)) => {
                        failure = Some(e);
                        break SessionEnd::ClaimFailed;
                    }
                    Err(e) => {
                        failure = Some(ClaimError::Task(e.to_string()));
                        break SessionEnd::ClaimFailed;
                    }
                },
            }
        };

        match (&end, &failure) {
            (SessionEnd::Shutdown, _) => {
                info!(member_id = %member_id, generation, "Stopping claims for shutdown")
            }
            (SessionEnd::Revoked, _) => info!(member_id = %member_id, generation, "Rebalancing"),
            (SessionEnd::ClaimFailed, Some(e)) => {
                warn!(member_id = %member_id, generation, error = %e, "Claim failed, re-joining")
            }
            (SessionEnd::ClaimFailed, None) => {}
        }

        self.transition(MemberPhase::Rebalancing);
        stop.cancel();
        self.drain(&mut tasks).await;
        ASSIGNED_PARTITIONS.set(0);

        if !matches!(end, SessionEnd::Shutdown) {
            REBALANCES.inc();
        }
        match failure {
            Some(ClaimError::Transport(e)) if e.is_fatal() => Err(e),
            _ => Ok(end),
        }
    }

    /// Wait for every claim to return, aborting those still running after
    /// the session timeout.
    async fn drain(&self, tasks: &mut JoinSet<Result<(), ClaimError>>) {
        let drained = tokio::time::timeout(self.session_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                if let Ok(Err(e)) = joined {
                    debug!(error = %e, "Claim ended with error while draining");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                timeout = ?self.session_timeout,
                remaining = tasks.len(),
                "Claims did not stop in time, aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

impl std::fmt::Debug for GroupConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupConsumer")
            .field("state", &*self.state.borrow())
            .field("session_timeout", &self.session_timeout)
            .finish()
    }
}
