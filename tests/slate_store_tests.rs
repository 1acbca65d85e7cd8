//! Integration tests for the SlateDB-backed skill store.
//!
//! These run SlateDB against a local directory and against an in-memory
//! object store. SlateDB needs a multi-threaded runtime because the store
//! opens the database on a blocking thread.

use std::sync::Arc;
use std::time::Duration;

use skillrelay::codec::Action;
use skillrelay::config::{ObjectStoreType, RelayConfig, StoreConfig};
use skillrelay::consumer::GroupConsumer;
use skillrelay::dispatcher::MutationDispatcher;
use skillrelay::error::{ApplyError, StoreError};
use skillrelay::log::{BrokerOptions, MemoryBroker};
use skillrelay::producer::SkillPublisher;
use skillrelay::store::{FieldPatch, SkillStore, SlateStore, create_object_store, open_store};
use skillrelay::supervisor::Supervisor;
use skillrelay::types::Skill;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);

fn local_config(dir: &TempDir) -> StoreConfig {
    StoreConfig::Slate {
        object_store: ObjectStoreType::Local {
            path: dir.path().to_string_lossy().into_owned(),
        },
        path: "skills".to_string(),
    }
}

async fn open_local(dir: &TempDir) -> SlateStore {
    let object_store = create_object_store(&ObjectStoreType::Local {
        path: dir.path().to_string_lossy().into_owned(),
    })
    .unwrap();
    SlateStore::open("skills", object_store).await.unwrap()
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_skills_survive_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store = open_local(&dir).await;
        store
            .insert(Skill::new("go").with_name("Go").with_tags(["lang"]))
            .await
            .unwrap();
        store
            .insert(Skill::new("rust").with_name("Rust"))
            .await
            .unwrap();
        store
            .patch_field("rust", FieldPatch::Logo("ferris.png".into()))
            .await
            .unwrap();
        store.close().await.unwrap();
    }

    let store = open_local(&dir).await;
    assert_eq!(
        store.list().await.unwrap(),
        vec![
            Skill::new("go").with_name("Go").with_tags(["lang"]),
            Skill::new("rust").with_name("Rust").with_logo("ferris.png"),
        ]
    );
    store.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_delete_survives_reopen() {
    let dir = TempDir::new().unwrap();

    {
        let store = open_local(&dir).await;
        store.insert(Skill::new("go")).await.unwrap();
        store.delete_by_key("go").await.unwrap();
        store.close().await.unwrap();
    }

    let store = open_local(&dir).await;
    assert!(matches!(
        store.get_by_key("go").await,
        Err(StoreError::NotFound(_))
    ));
    store.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_closed_store_rejects_operations() {
    let dir = TempDir::new().unwrap();
    let store = open_local(&dir).await;
    store.close().await.unwrap();

    assert!(matches!(
        store.insert(Skill::new("go")).await,
        Err(StoreError::Closed)
    ));
    assert!(matches!(store.list().await, Err(StoreError::Closed)));
}

// ============================================================================
// open_store
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_open_store_memory() {
    let store = open_store(&StoreConfig::Memory).await.unwrap();
    store.insert(Skill::new("go")).await.unwrap();
    assert_eq!(store.list().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_open_store_local_directory_is_created() {
    let dir = TempDir::new().unwrap();
    let nested = dir.path().join("data").join("relay");
    let config = StoreConfig::Slate {
        object_store: ObjectStoreType::Local {
            path: nested.to_string_lossy().into_owned(),
        },
        path: "skills".to_string(),
    };

    let store = open_store(&config).await.unwrap();
    store.insert(Skill::new("go")).await.unwrap();
    store.close().await.unwrap();

    assert!(nested.is_dir());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_open_store_reads_what_a_previous_process_wrote() {
    let dir = TempDir::new().unwrap();

    let first = open_store(&local_config(&dir)).await.unwrap();
    first
        .insert(Skill::new("go").with_description("concurrency"))
        .await
        .unwrap();
    first.close().await.unwrap();

    let second = open_store(&local_config(&dir)).await.unwrap();
    assert_eq!(
        second.get_by_key("go").await.unwrap().description,
        "concurrency"
    );
    second.close().await.unwrap();
}

// ============================================================================
// Dispatcher Semantics On SlateDB
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_dispatcher_reconciles_create_on_slate() {
    let store = open_store(&StoreConfig::Slate {
        object_store: ObjectStoreType::InMemory,
        path: "skills".to_string(),
    })
    .await
    .unwrap();
    let dispatcher = MutationDispatcher::new(store.clone());
    let skill = Skill::new("go").with_name("Go");

    dispatcher.apply(&Action::Create(skill.clone())).await.unwrap();
    // Redelivered create of the same skill.
    dispatcher.apply(&Action::Create(skill.clone())).await.unwrap();
    // A different skill under the same key.
    let err = dispatcher
        .apply(&Action::Create(skill.clone().with_name("Golang")))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ApplyError::Rejected {
            source: StoreError::Conflict(_),
            ..
        }
    ));

    dispatcher.apply(&Action::delete("go")).await.unwrap();
    dispatcher.apply(&Action::delete("go")).await.unwrap();
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pipeline_applies_to_slate_store() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&local_config(&dir)).await.unwrap();

    let config = RelayConfig {
        session_timeout: Duration::from_millis(500),
        store: local_config(&dir),
        ..RelayConfig::default()
    };
    let broker = MemoryBroker::new(BrokerOptions {
        session_timeout: config.session_timeout,
        ..BrokerOptions::default()
    });

    let publisher = SkillPublisher::new(Arc::new(broker.clone()), &config.topic);
    publisher
        .publish(&Action::Create(Skill::new("go").with_name("go")))
        .await
        .unwrap();
    publisher
        .publish(&Action::update_name("go", "gopher"))
        .await
        .unwrap();
    let last = publisher
        .publish(&Action::update_tags("go", ["lang", "cloud"]))
        .await
        .unwrap();

    let transport = Arc::new(broker.member(&config.group_id, &config.topic));
    let consumer = GroupConsumer::new(transport, MutationDispatcher::new(store.clone()), &config);
    let supervisor = Supervisor::new(consumer, config.session_timeout);
    let shutdown = supervisor.shutdown_handle();
    let run = tokio::spawn(supervisor.run());

    tokio::time::timeout(WAIT, async {
        while broker.committed_offset(&config.group_id, last.partition).await
            != Some(last.offset + 1)
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("consumer did not commit the last action");

    shutdown.cancel();
    tokio::time::timeout(WAIT, run).await.unwrap().unwrap().unwrap();
    store.close().await.unwrap();

    let reopened = open_store(&local_config(&dir)).await.unwrap();
    assert_eq!(
        reopened.get_by_key("go").await.unwrap(),
        Skill::new("go").with_name("gopher").with_tags(["lang", "cloud"])
    );
    reopened.close().await.unwrap();
}
