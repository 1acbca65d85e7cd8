//! Relay configuration.
//!
//! All settings live in one explicit [`RelayConfig`] value that is built once
//! at startup ([`RelayConfig::from_env`] or struct literals in tests),
//! validated, and handed to the components that need it. Nothing reads the
//! environment after startup.
//!
//! # Environment Variables
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `KAFKA_BROKER` | required | Comma-separated bootstrap brokers |
//! | `TOPIC` | required | Topic carrying skill actions |
//! | `GROUP` | required | Consumer group id |
//! | `CLIENT_ID` | `skill-relay` | Client id reported to the brokers |
//! | `TOPIC_PARTITIONS` | `3` | Partitions for auto-created topics |
//! | `SESSION_TIMEOUT_MS` | `10000` | Group session timeout and drain bound |
//! | `PUBLISH_TIMEOUT_MS` | `10000` | Acknowledgement timeout for publishes |
//! | `REJOIN_DELAY_MS` | `1000` | Pause before re-joining after a failed claim |
//! | `INITIAL_OFFSET` | `earliest` | `earliest` or `latest` |
//! | `APPLY_RETRY_MAX_TIMES` | `3` | Store retries before redelivery |
//! | `STORE_TYPE` | `local` | `memory`, `local` or `s3` |
//! | `DATA_PATH` | `/tmp/skillrelay-data` | Local store directory |
//! | `SLATEDB_PATH` | `skills` | Database path inside the object store |
//! | `S3_BUCKET` / `AWS_S3_BUCKET` | required for s3 | Bucket name |
//! | `AWS_REGION` | `us-east-1` | Bucket region |
//! | `AWS_ENDPOINT` | none | S3-compatible endpoint (MinIO etc.) |

use std::time::Duration;

use backon::ExponentialBuilder;

use crate::constants::{
    DEFAULT_APPLY_RETRY_MAX_DELAY_MS, DEFAULT_APPLY_RETRY_MAX_TIMES,
    DEFAULT_APPLY_RETRY_MIN_DELAY_MS, DEFAULT_CLIENT_ID, DEFAULT_DATA_PATH,
    DEFAULT_PUBLISH_TIMEOUT, DEFAULT_REJOIN_DELAY_MS, DEFAULT_SESSION_TIMEOUT_MS,
    DEFAULT_TOPIC_PARTITIONS, MIN_SESSION_TIMEOUT_MS,
};
use crate::error::ConfigError;
use crate::types::OffsetReset;

/// Type of object store backing the SlateDB store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreType {
    /// Local filesystem storage.
    Local {
        /// Directory on the local filesystem.
        path: String,
    },
    /// Process memory; contents vanish with the process.
    InMemory,
    /// Amazon S3 or S3-compatible storage (MinIO, etc.).
    S3 {
        bucket: String,
        region: String,
        /// Custom endpoint for S3-compatible services.
        endpoint: Option<String>,
        access_key_id: Option<String>,
        secret_access_key: Option<String>,
    },
}

/// Which entity store the consumer applies actions to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// In-process map. Useful for development and tests.
    Memory,
    /// SlateDB on top of an object store.
    Slate {
        object_store: ObjectStoreType,
        /// Database root inside the object store.
        path: String,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Slate {
            object_store: ObjectStoreType::Local {
                path: DEFAULT_DATA_PATH.to_string(),
            },
            path: "skills".to_string(),
        }
    }
}

/// Backoff for transient store failures while applying an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub max_times: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(DEFAULT_APPLY_RETRY_MIN_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_APPLY_RETRY_MAX_DELAY_MS),
            max_times: DEFAULT_APPLY_RETRY_MAX_TIMES,
        }
    }
}

impl RetryConfig {
    /// Backon policy with jitter.
    pub fn policy(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_times)
            .with_jitter()
    }
}

/// Configuration for the producer and consumer sides of the relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Comma-separated bootstrap brokers.
    pub brokers: String,
    pub topic: String,
    pub group_id: String,
    pub client_id: String,

    /// Partition count used when the topic is auto-created.
    pub partitions: i32,

    /// Consumer group session timeout. Also bounds the shutdown drain.
    pub session_timeout: Duration,

    pub publish_timeout: Duration,

    /// Pause before re-joining after a claim failed without a rebalance.
    pub rejoin_delay: Duration,

    pub initial_offset: OffsetReset,

    pub apply_retry: RetryConfig,

    pub store: StoreConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "skills".to_string(),
            group_id: "skill-relay".to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            partitions: DEFAULT_TOPIC_PARTITIONS,
            session_timeout: Duration::from_millis(DEFAULT_SESSION_TIMEOUT_MS),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            rejoin_delay: Duration::from_millis(DEFAULT_REJOIN_DELAY_MS),
            initial_offset: OffsetReset::Earliest,
            apply_retry: RetryConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.brokers.trim().is_empty() {
            errors.push("brokers must not be empty (set KAFKA_BROKER)".to_string());
        }
        if self.topic.trim().is_empty() {
            errors.push("topic must not be empty (set TOPIC)".to_string());
        }
        if self.group_id.trim().is_empty() {
            errors.push("group_id must not be empty (set GROUP)".to_string());
        }
        if self.partitions < 1 {
            errors.push(format!(
                "partitions ({}) must be at least 1",
                self.partitions
            ));
        }
        if self.session_timeout < Duration::from_millis(MIN_SESSION_TIMEOUT_MS) {
            errors.push(format!(
                "session_timeout ({:?}) must be at least {}ms",
                self.session_timeout, MIN_SESSION_TIMEOUT_MS
            ));
        }
        if self.publish_timeout.is_zero() {
            errors.push("publish_timeout must be greater than zero".to_string());
        }
        if self.apply_retry.min_delay > self.apply_retry.max_delay {
            errors.push(format!(
                "apply_retry min_delay ({:?}) must not exceed max_delay ({:?})",
                self.apply_retry.min_delay, self.apply_retry.max_delay
            ));
        }

        if let StoreConfig::Slate { object_store, path } = &self.store {
            if path.trim().is_empty() {
                errors.push("store path must not be empty".to_string());
            }
            match object_store {
                ObjectStoreType::Local { path } if path.trim().is_empty() => {
                    errors.push("local data path must not be empty (set DATA_PATH)".to_string());
                }
                ObjectStoreType::S3 { bucket, .. } if bucket.trim().is_empty() => {
                    errors.push("S3 bucket must not be empty (set S3_BUCKET)".to_string());
                }
                _ => {}
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Build configuration from environment variables and validate it.
    ///
    /// Broker, topic and group have no defaults here: a deployment that
    /// forgets one of them fails at startup instead of talking to the wrong
    /// cluster.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let mut errors = Vec::new();

        let mut required = |name: &str| match std::env::var(name) {
            Ok(value) if !value.trim().is_empty() => value,
            _ => {
                errors.push(format!("{name} must be set"));
                String::new()
            }
        };
        let brokers = required("KAFKA_BROKER");
        let topic = required("TOPIC");
        let group_id = required("GROUP");

        let client_id = std::env::var("CLIENT_ID").unwrap_or(defaults.client_id);

        let partitions: i32 = std::env::var("TOPIC_PARTITIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.partitions);

        let session_timeout = std::env::var("SESSION_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.session_timeout);

        let publish_timeout = std::env::var("PUBLISH_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.publish_timeout);

        let rejoin_delay = std::env::var("REJOIN_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.rejoin_delay);

        let initial_offset = match std::env::var("INITIAL_OFFSET") {
            Ok(value) => value.parse().unwrap_or_else(|e: String| {
                errors.push(format!("Invalid INITIAL_OFFSET: {e}"));
                defaults.initial_offset
            }),
            Err(_) => defaults.initial_offset,
        };

        let apply_retry = RetryConfig {
            max_times: std::env::var("APPLY_RETRY_MAX_TIMES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.apply_retry.max_times),
            ..defaults.apply_retry
        };

        let data_path = std::env::var("DATA_PATH").unwrap_or_else(|_| DEFAULT_DATA_PATH.to_string());
        let db_path = std::env::var("SLATEDB_PATH").unwrap_or_else(|_| "skills".to_string());

        let store_type = std::env::var("STORE_TYPE")
            .unwrap_or_else(|_| "local".to_string())
            .to_lowercase();

        let store = match store_type.as_str() {
            "memory" => StoreConfig::Memory,
            "s3" => {
                let bucket = std::env::var("AWS_S3_BUCKET")
                    .or_else(|_| std::env::var("S3_BUCKET"))
                    .unwrap_or_else(|_| {
                        errors.push("S3_BUCKET or AWS_S3_BUCKET must be set when STORE_TYPE=s3".to_string());
                        String::new()
                    });

                let region = std::env::var("AWS_REGION")
                    .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
                    .unwrap_or_else(|_| "us-east-1".to_string());

                let endpoint = std::env::var("AWS_ENDPOINT")
                    .or_else(|_| std::env::var("S3_ENDPOINT"))
                    .ok();

                StoreConfig::Slate {
                    object_store: ObjectStoreType::S3 {
                        bucket,
                        region,
                        endpoint,
                        access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
                        secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
                    },
                    path: db_path,
                }
            }
            "local" => StoreConfig::Slate {
                object_store: ObjectStoreType::Local { path: data_path },
                path: db_path,
            },
            other => {
                errors.push(format!(
                    "Invalid STORE_TYPE '{other}' (expected memory, local or s3)"
                ));
                StoreConfig::Memory
            }
        };

        let config = Self {
            brokers,
            topic,
            group_id,
            client_id,
            partitions,
            session_timeout,
            publish_timeout,
            rejoin_delay,
            initial_offset,
            apply_retry,
            store,
        };

        if let Err(validation) = config.validate() {
            for message in validation {
                if !errors.contains(&message) {
                    errors.push(message);
                }
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        tracing::info!(
            brokers = %config.brokers,
            topic = %config.topic,
            group = %config.group_id,
            client_id = %config.client_id,
            store = store_type,
            session_timeout_ms = config.session_timeout.as_millis() as u64,
            initial_offset = config.initial_offset.as_str(),
            "Loaded relay configuration"
        );

        Ok(config)
    }
}
