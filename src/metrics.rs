//! Prometheus metrics for the relay.
//!
//! Metrics cover both halves of the pipeline:
//! - Publishing (actions accepted by the log, failures)
//! - Applying (actions applied per kind, skipped records per reason, latency)
//! - Group membership (rebalances, currently assigned partitions)
//!
//! Everything lives in [`REGISTRY`], whose names carry the `skillrelay_`
//! prefix. A metric that fails to register still counts; it is only missing
//! from [`encode_metrics`].

use once_cell::sync::Lazy;
use prometheus::core::Collector;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use tracing::warn;

use crate::codec::ActionKind;

/// Custom Prometheus registry for relay metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("skillrelay".to_string()), None).unwrap_or_else(|_| Registry::new())
});

/// Buckets for per-action apply latency, in seconds.
const APPLY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5];

fn registered<M>(name: &str, metric: M) -> M
where
    M: Collector + Clone + 'static,
{
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        warn!(name, error = %e, "Metric left unregistered");
    }
    metric
}

fn counter(name: &str, help: &str) -> IntCounter {
    registered(name, IntCounter::new(name, help).expect("valid counter"))
}

fn counter_by(name: &str, help: &str, label: &str) -> IntCounterVec {
    registered(
        name,
        IntCounterVec::new(Opts::new(name, help), &[label]).expect("valid counter vec"),
    )
}

fn gauge(name: &str, help: &str) -> IntGauge {
    registered(name, IntGauge::new(name, help).expect("valid gauge"))
}

fn histogram_by(name: &str, help: &str, label: &str, buckets: &[f64]) -> HistogramVec {
    let opts = HistogramOpts::new(name, help).buckets(buckets.to_vec());
    registered(name, HistogramVec::new(opts, &[label]).expect("valid histogram vec"))
}

// =============================================================================
// Publish
// =============================================================================

/// Actions durably accepted by the log, by action tag.
pub static ACTIONS_PUBLISHED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_by(
        "actions_published_total",
        "Actions durably accepted by the log",
        "action",
    )
});

pub static PUBLISH_FAILURES: Lazy<IntCounter> =
    Lazy::new(|| counter("publish_failures_total", "Actions the log did not accept"));

// =============================================================================
// Apply
// =============================================================================

pub static ACTIONS_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_by(
        "actions_applied_total",
        "Actions applied to the store",
        "action",
    )
});

/// Records committed without a successful apply, by [`SkipReason`].
pub static ACTIONS_SKIPPED: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_by(
        "actions_skipped_total",
        "Records committed without being applied",
        "reason",
    )
});

pub static APPLY_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_by(
        "apply_failures_total",
        "Transient apply failures left for redelivery",
        "action",
    )
});

/// Time spent applying one action, retries included.
pub static APPLY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    histogram_by(
        "apply_duration_seconds",
        "Time spent applying one action, retries included",
        "action",
        APPLY_BUCKETS,
    )
});

// =============================================================================
// Group membership
// =============================================================================

pub static REBALANCES: Lazy<IntCounter> =
    Lazy::new(|| counter("rebalances_total", "Sessions torn down and re-joined"));

pub static ASSIGNED_PARTITIONS: Lazy<IntGauge> =
    Lazy::new(|| gauge("assigned_partitions", "Partitions claimed by this member"));

/// Force registration of every metric so they appear in the exposition
/// before the first event.
pub fn init_metrics() {
    let _ = &*ACTIONS_PUBLISHED;
    let _ = &*PUBLISH_FAILURES;
    let _ = &*ACTIONS_APPLIED;
    let _ = &*ACTIONS_SKIPPED;
    let _ = &*APPLY_FAILURES;
    let _ = &*APPLY_DURATION;
    let _ = &*REBALANCES;
    let _ = &*ASSIGNED_PARTITIONS;
}

/// Render all metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

// =============================================================================
// Recording Helpers
// =============================================================================

/// Why a record was committed without a successful apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The record could not be decoded.
    Poison,
    /// The store deterministically rejected the action.
    Rejected,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Poison => "poison",
            SkipReason::Rejected => "rejected",
        }
    }
}

pub fn record_published(action: ActionKind) {
    ACTIONS_PUBLISHED.with_label_values(&[action.as_str()]).inc();
}

pub fn record_publish_failure() {
    PUBLISH_FAILURES.inc();
}

pub fn record_applied(action: ActionKind, duration_secs: f64) {
    ACTIONS_APPLIED.with_label_values(&[action.as_str()]).inc();
    APPLY_DURATION
        .with_label_values(&[action.as_str()])
        .observe(duration_secs);
}

pub fn record_skipped(reason: SkipReason) {
    ACTIONS_SKIPPED.with_label_values(&[reason.as_str()]).inc();
}

pub fn record_apply_failure(action: ActionKind) {
    APPLY_FAILURES.with_label_values(&[action.as_str()]).inc();
}
