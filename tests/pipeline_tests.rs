//! End-to-end tests for the publish → log → consume → store pipeline.
//!
//! These tests verify:
//! 1. Actions for one key are applied in publish order
//! 2. Redelivered actions leave the store as a single delivery would
//! 3. Poison records are skipped without reaching the store
//! 4. Deleting an absent key is a success
//! 5. Two members split partitions without applying anything twice

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use skillrelay::codec::Action;
use skillrelay::config::{RelayConfig, RetryConfig};
use skillrelay::consumer::GroupConsumer;
use skillrelay::dispatcher::MutationDispatcher;
use skillrelay::error::RelayError;
use skillrelay::log::{BrokerOptions, MemoryBroker, partition_for_key};
use skillrelay::producer::SkillPublisher;
use skillrelay::service::SkillService;
use skillrelay::shutdown::Shutdown;
use skillrelay::store::{MemoryStore, SkillStore};
use skillrelay::supervisor::Supervisor;
use skillrelay::types::Skill;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(5);
const GROUP: &str = "skill-relay";
const TOPIC: &str = "skills";

fn test_config() -> RelayConfig {
    RelayConfig {
        topic: TOPIC.to_string(),
        group_id: GROUP.to_string(),
        session_timeout: Duration::from_millis(500),
        rejoin_delay: Duration::from_millis(10),
        apply_retry: RetryConfig {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_times: 2,
        },
        ..RelayConfig::default()
    }
}

fn test_broker() -> MemoryBroker {
    MemoryBroker::new(BrokerOptions {
        default_partitions: 3,
        session_timeout: Duration::from_millis(500),
        ..BrokerOptions::default()
    })
}

/// Start a supervised consumer. Returns its shutdown token and run handle.
fn start_consumer(
    broker: &MemoryBroker,
    store: Arc<dyn SkillStore>,
) -> (Shutdown, JoinHandle<Result<(), RelayError>>) {
    let config = test_config();
    let dispatcher = MutationDispatcher::new(store).with_retry(config.apply_retry);
    let transport = Arc::new(broker.member(GROUP, TOPIC));
    let consumer = GroupConsumer::new(transport, dispatcher, &config);
    let supervisor = Supervisor::new(consumer, config.session_timeout);
    let shutdown = supervisor.shutdown_handle();
    (shutdown, tokio::spawn(supervisor.run()))
}

async fn stop(shutdown: Shutdown, handle: JoinHandle<Result<(), RelayError>>) {
    shutdown.cancel();
    tokio::time::timeout(WAIT, handle)
        .await
        .expect("consumer did not stop in time")
        .expect("consumer task panicked")
        .expect("consumer failed");
}

/// Wait until every partition of the topic has been committed up to its end.
async fn wait_until_caught_up(broker: &MemoryBroker) {
    tokio::time::timeout(WAIT, async {
        loop {
            let mut caught_up = true;
            for partition in 0..3 {
                let end = broker.high_watermark(TOPIC, partition).await;
                let committed = broker.committed_offset(GROUP, partition).await.unwrap_or(0);
                if committed < end {
                    caught_up = false;
                }
            }
            if caught_up {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("consumer did not catch up");
}

fn publisher(broker: &MemoryBroker) -> SkillPublisher {
    SkillPublisher::new(Arc::new(broker.clone()), TOPIC)
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_create_then_update_name_applies_in_order() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::new());
    let publisher = publisher(&broker);

    publisher
        .publish(&Action::Create(Skill::new("go").with_name("go")))
        .await
        .unwrap();
    publisher
        .publish(&Action::update_name("go", "gopher"))
        .await
        .unwrap();

    let (shutdown, handle) = start_consumer(&broker, store.clone());
    wait_until_caught_up(&broker).await;
    stop(shutdown, handle).await;

    assert_eq!(store.get_by_key("go").await.unwrap().name, "gopher");
}

#[tokio::test]
async fn test_update_name_scenario() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::with_skills([Skill::new("go")
        .with_name("go")
        .with_description("d")
        .with_logo("l")
        .with_tags(["a"])]));
    let (shutdown, handle) = start_consumer(&broker, store.clone());

    publisher(&broker)
        .publish(&Action::update_name("go", "gopher"))
        .await
        .unwrap();
    wait_until_caught_up(&broker).await;
    stop(shutdown, handle).await;

    assert_eq!(
        store.get_by_key("go").await.unwrap(),
        Skill::new("go")
            .with_name("gopher")
            .with_description("d")
            .with_logo("l")
            .with_tags(["a"])
    );
}

#[tokio::test]
async fn test_many_keys_each_keep_their_own_order() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::new());
    let publisher = publisher(&broker);
    let (shutdown, handle) = start_consumer(&broker, store.clone());

    let keys = ["go", "rust", "python", "zig", "c", "d"];
    for key in keys {
        publisher
            .publish(&Action::Create(Skill::new(key).with_name(key)))
            .await
            .unwrap();
    }
    for round in 0..5 {
        for key in keys {
            publisher
                .publish(&Action::update_description(key, format!("rev-{round}")))
                .await
                .unwrap();
        }
    }
    for key in ["c", "d"] {
        publisher.publish(&Action::delete(key)).await.unwrap();
    }

    wait_until_caught_up(&broker).await;
    stop(shutdown, handle).await;

    let skills = store.list().await.unwrap();
    let remaining: Vec<&str> = skills.iter().map(|s| s.key.as_str()).collect();
    assert_eq!(remaining, vec!["go", "python", "rust", "zig"]);
    assert!(skills.iter().all(|s| s.description == "rev-4"));
}

// ============================================================================
// Redelivery & Idempotence
// ============================================================================

#[tokio::test]
async fn test_redelivery_after_crash_is_idempotent() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::new());
    let publisher = publisher(&broker);

    let actions = vec![
        Action::Create(Skill::new("rust").with_name("Rust").with_tags(["systems"])),
        Action::update_logo("rust", "ferris.png"),
        Action::Replace(Skill::new("rust").with_name("Rust 2024").with_logo("crab.png")),
        Action::update_tags("rust", ["systems", "safety"]),
        Action::Create(Skill::new("tmp").with_name("Temporary")),
        Action::delete("tmp"),
    ];
    for action in &actions {
        publisher.publish(action).await.unwrap();
    }

    // A previous incarnation applied everything but crashed before committing.
    let crashed = MutationDispatcher::new(store.clone());
    for action in &actions {
        crashed.apply(action).await.unwrap();
    }
    let before = store.list().await.unwrap();
    assert_eq!(broker.committed_offset(GROUP, 0).await, None);

    let (shutdown, handle) = start_consumer(&broker, store.clone());
    wait_until_caught_up(&broker).await;
    stop(shutdown, handle).await;

    assert_eq!(store.list().await.unwrap(), before);
}

#[tokio::test]
async fn test_delete_of_absent_key_is_committed() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::new());

    let position = publisher(&broker)
        .publish(&Action::delete("never-created"))
        .await
        .unwrap();

    let (shutdown, handle) = start_consumer(&broker, store.clone());
    wait_until_caught_up(&broker).await;
    stop(shutdown, handle).await;

    assert_eq!(
        broker.committed_offset(GROUP, position.partition).await,
        Some(position.offset + 1)
    );
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_update_for_deleted_key_is_skipped_not_resurrected() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::new());
    let publisher = publisher(&broker);

    publisher
        .publish(&Action::Create(Skill::new("go").with_name("go")))
        .await
        .unwrap();
    publisher.publish(&Action::delete("go")).await.unwrap();
    publisher
        .publish(&Action::update_name("go", "gopher"))
        .await
        .unwrap();

    let (shutdown, handle) = start_consumer(&broker, store.clone());
    wait_until_caught_up(&broker).await;
    stop(shutdown, handle).await;

    assert!(store.list().await.unwrap().is_empty());
}

// ============================================================================
// Poison Messages
// ============================================================================

#[tokio::test]
async fn test_poison_record_is_skipped_without_store_calls() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::with_skills([Skill::new("go").with_name("go")]));
    let partition = partition_for_key(b"go", 3);

    let poison = broker
        .append_raw(
            TOPIC,
            Some(Bytes::from_static(b"go")),
            vec![("action".to_string(), Bytes::from_static(b"update_name"))],
            Bytes::from_static(b"{\"key\":\"go\",\"name\":"),
        )
        .await
        .unwrap();
    assert_eq!(poison.partition, partition);
    let unknown = broker
        .append_raw(
            TOPIC,
            Some(Bytes::from_static(b"go")),
            vec![("action".to_string(), Bytes::from_static(b"upsert"))],
            Bytes::from_static(b"{\"key\":\"go\"}"),
        )
        .await
        .unwrap();

    let (shutdown, handle) = start_consumer(&broker, store.clone());
    wait_until_caught_up(&broker).await;
    stop(shutdown, handle).await;

    assert_eq!(store.operation_count(), 0);
    assert_eq!(
        broker.committed_offset(GROUP, partition).await,
        Some(unknown.offset + 1)
    );
    assert_eq!(store.get_by_key("go").await.unwrap().name, "go");
}

#[tokio::test]
async fn test_poison_does_not_block_later_records() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::with_skills([Skill::new("go").with_name("go")]));

    broker
        .append_raw(
            TOPIC,
            Some(Bytes::from_static(b"go")),
            vec![("action".to_string(), Bytes::from_static(b"update_logo"))],
            Bytes::from_static(b"not json"),
        )
        .await
        .unwrap();
    publisher(&broker)
        .publish(&Action::update_logo("go", "gopher.svg"))
        .await
        .unwrap();

    let (shutdown, handle) = start_consumer(&broker, store.clone());
    wait_until_caught_up(&broker).await;
    stop(shutdown, handle).await;

    assert_eq!(store.get_by_key("go").await.unwrap().logo, "gopher.svg");
}

#[tokio::test]
async fn test_records_tagged_by_key_are_understood() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::new());

    // Older producers put the action tag in the record key.
    broker
        .append_raw(
            TOPIC,
            Some(Bytes::from_static(b"create")),
            Vec::new(),
            Bytes::from_static(b"{\"Key\":\"go\",\"Name\":\"Go\",\"Tags\":null}"),
        )
        .await
        .unwrap();

    let (shutdown, handle) = start_consumer(&broker, store.clone());
    wait_until_caught_up(&broker).await;
    stop(shutdown, handle).await;

    assert_eq!(
        store.get_by_key("go").await.unwrap(),
        Skill::new("go").with_name("Go")
    );
}

// ============================================================================
// Transient Failures
// ============================================================================

#[tokio::test]
async fn test_store_outage_is_ridden_out_by_redelivery() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::with_skills([Skill::new("go").with_name("go")]));

    // Longer than one round of apply retries (1 attempt + 2 retries).
    store.fail_next(5);
    publisher(&broker)
        .publish(&Action::update_name("go", "gopher"))
        .await
        .unwrap();

    let (shutdown, handle) = start_consumer(&broker, store.clone());
    wait_until_caught_up(&broker).await;
    stop(shutdown, handle).await;

    assert_eq!(store.get_by_key("go").await.unwrap().name, "gopher");
}

#[tokio::test]
async fn test_closed_store_never_advances_the_offset() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::new());
    store.close().await.unwrap();

    let position = publisher(&broker)
        .publish(&Action::Create(Skill::new("go").with_name("go")))
        .await
        .unwrap();

    let (shutdown, handle) = start_consumer(&broker, store.clone());
    // Plenty of rejoin cycles at the 10ms rejoin delay.
    tokio::time::sleep(Duration::from_millis(300)).await;
    stop(shutdown, handle).await;

    assert_eq!(broker.committed_offset(GROUP, position.partition).await, None);
}

#[tokio::test]
async fn test_commit_failure_leads_to_redelivery() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::with_skills([Skill::new("go").with_name("go")]));
    broker.fail_next_commits(1);

    let position = publisher(&broker)
        .publish(&Action::update_description("go", "concurrency"))
        .await
        .unwrap();

    let (shutdown, handle) = start_consumer(&broker, store.clone());
    wait_until_caught_up(&broker).await;
    stop(shutdown, handle).await;

    assert_eq!(
        broker.committed_offset(GROUP, position.partition).await,
        Some(position.offset + 1)
    );
    assert_eq!(store.get_by_key("go").await.unwrap().description, "concurrency");
}

// ============================================================================
// Multiple Members
// ============================================================================

#[tokio::test]
async fn test_two_members_split_partitions() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::new());
    let publisher = publisher(&broker);

    let (first_shutdown, first) = start_consumer(&broker, store.clone());
    let (second_shutdown, second) = start_consumer(&broker, store.clone());
    tokio::time::timeout(WAIT, async {
        while broker.members(GROUP).await.len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("second member never joined");

    for i in 0..30 {
        let key = format!("skill-{i}");
        publisher
            .publish(&Action::Create(Skill::new(&key).with_name(&key)))
            .await
            .unwrap();
        publisher
            .publish(&Action::update_tags(&key, [format!("tag-{i}")]))
            .await
            .unwrap();
    }

    wait_until_caught_up(&broker).await;

    stop(first_shutdown, first).await;
    stop(second_shutdown, second).await;

    let skills = store.list().await.unwrap();
    assert_eq!(skills.len(), 30);
    for skill in skills {
        let i = skill.key.trim_start_matches("skill-");
        assert_eq!(skill.tags, vec![format!("tag-{i}")]);
    }
}

// ============================================================================
// Producer-Facing Service
// ============================================================================

#[tokio::test]
async fn test_service_writes_become_visible_after_consumption() {
    let broker = test_broker();
    let store = Arc::new(MemoryStore::new());
    let service = SkillService::new(publisher(&broker), store.clone());
    let (shutdown, handle) = start_consumer(&broker, store.clone());

    service
        .create_skill(Skill::new("go").with_name("Go"))
        .await
        .unwrap();
    wait_until_caught_up(&broker).await;

    let projected = service.update_logo("go", "gopher.png").await.unwrap();
    assert_eq!(projected.logo, "gopher.png");
    wait_until_caught_up(&broker).await;
    assert_eq!(service.get_skill("go").await.unwrap(), projected);

    service.delete_skill("go").await.unwrap();
    wait_until_caught_up(&broker).await;
    assert_eq!(service.get_skill("go").await.unwrap_err().status_code(), 404);

    stop(shutdown, handle).await;
}
