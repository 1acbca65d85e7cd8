//! Skill relay consumer.
//!
//! Joins the consumer group configured in the environment and applies skill
//! actions to the configured store until SIGINT or SIGTERM.
//!
//! ```bash
//! KAFKA_BROKER=localhost:9092 TOPIC=skills GROUP=skill-relay \
//!     STORE_TYPE=local DATA_PATH=/var/lib/skillrelay \
//!     cargo run --features kafka --bin skill-relay-consumer
//! ```

use std::sync::Arc;

use skillrelay::config::RelayConfig;
use skillrelay::consumer::GroupConsumer;
use skillrelay::dispatcher::MutationDispatcher;
use skillrelay::log::KafkaGroupTransport;
use skillrelay::metrics::init_metrics;
use skillrelay::store::open_store;
use skillrelay::supervisor::Supervisor;
use skillrelay::telemetry::{LogFormat, init_logging};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // LOG_FORMAT=json for log aggregators
    init_logging(LogFormat::from_env()).map_err(|e| -> Box<dyn std::error::Error> { e })?;
    init_metrics();

    let config = RelayConfig::from_env()?;
    info!(
        brokers = %config.brokers,
        topic = %config.topic,
        group = %config.group_id,
        store = ?config.store,
        "Starting skill relay consumer"
    );

    let store = open_store(&config.store).await?;
    let transport = Arc::new(KafkaGroupTransport::new(&config)?);
    let dispatcher = MutationDispatcher::new(store.clone()).with_retry(config.apply_retry);
    let consumer = GroupConsumer::new(transport, dispatcher, &config);

    let result = Supervisor::new(consumer, config.session_timeout)
        .run_until_signal()
        .await;

    if let Err(e) = store.close().await {
        error!(error = %e, "Failed to close skill store");
    }

    match result {
        Ok(()) => {
            info!("Skill relay consumer stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Skill relay consumer failed");
            Err(e.into())
        }
    }
}
