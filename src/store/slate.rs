//! SlateDB-backed skill store.
//!
//! Each skill is one JSON value under `skill/<key>`. Writes wait for
//! durability before returning, so a committed log offset never points past
//! state that could be lost. Read-modify-write operations (insert, replace,
//! patch, delete) run under a single write lock, which makes each of them
//! atomic with respect to the others.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use slatedb::Db;
use slatedb::config::{PutOptions, WriteOptions};
use tokio::sync::Mutex;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use super::{FieldPatch, SkillStore};
use crate::constants::{SKILL_KEY_PREFIX, SKILL_KEY_PREFIX_END};
use crate::error::StoreError;
use crate::types::Skill;

const DURABLE_WRITE_OPTIONS: WriteOptions = WriteOptions {
    await_durable: true,
};

pub struct SlateStore {
    db: Db,
    path: String,
    write_lock: Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SlateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlateStore")
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn encode_key(key: &str) -> Vec<u8> {
    let mut encoded = Vec::with_capacity(SKILL_KEY_PREFIX.len() + key.len());
    encoded.extend_from_slice(SKILL_KEY_PREFIX);
    encoded.extend_from_slice(key.as_bytes());
    encoded
}

fn decode_value(key: &str, value: &[u8]) -> Result<Skill, StoreError> {
    serde_json::from_slice(value).map_err(|source| StoreError::Corrupt {
        key: key.to_string(),
        source,
    })
}

fn encode_value(skill: &Skill) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(skill).map_err(|source| StoreError::Corrupt {
        key: skill.key.clone(),
        source,
    })
}

impl SlateStore {
    /// Open (or create) the database at `path` inside `object_store`.
    ///
    /// Uses `spawn_blocking` because the SlateDB open future is not `Send`.
    pub async fn open(path: &str, object_store: Arc<dyn ObjectStore>) -> Result<Self, StoreError> {
        info!(path, "Opening skill store");

        let path_for_task = path.to_string();
        let db = spawn_blocking(move || {
            let handle = tokio::runtime::Handle::current();
            handle.block_on(async move {
                Db::builder(ObjectPath::from(path_for_task.as_str()), object_store)
                    .build()
                    .await
            })
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("open task failed: {e}")))??;

        Ok(Self {
            db,
            path: path.to_string(),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    async fn read(&self, key: &str) -> Result<Option<Skill>, StoreError> {
        match self.db.get(encode_key(key).as_slice()).await? {
            Some(value) => decode_value(key, &value).map(Some),
            None => Ok(None),
        }
    }

    async fn write(&self, skill: &Skill) -> Result<(), StoreError> {
        let value = Bytes::from(encode_value(skill)?);
        self.db
            .put_with_options(
                encode_key(&skill.key).as_slice(),
                value.as_ref(),
                &PutOptions::default(),
                &DURABLE_WRITE_OPTIONS,
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl SkillStore for SlateStore {
    async fn insert(&self, skill: Skill) -> Result<Skill, StoreError> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;
        if self.read(&skill.key).await?.is_some() {
            return Err(StoreError::Conflict(skill.key));
        }
        self.write(&skill).await?;
        debug!(key = %skill.key, "Inserted skill");
        Ok(skill)
    }

    async fn replace_by_key(&self, key: &str, skill: Skill) -> Result<Skill, StoreError> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;
        if self.read(key).await?.is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        let replaced = Skill {
            key: key.to_string(),
            ..skill
        };
        self.write(&replaced).await?;
        Ok(replaced)
    }

    async fn patch_field(&self, key: &str, patch: FieldPatch) -> Result<Skill, StoreError> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;
        let mut skill = self
            .read(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let field = patch.field();
        patch.apply_to(&mut skill);
        self.write(&skill).await?;
        debug!(key, field = field.as_str(), "Patched skill");
        Ok(skill)
    }

    async fn delete_by_key(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        let _guard = self.write_lock.lock().await;
        if self.read(key).await?.is_none() {
            return Err(StoreError::NotFound(key.to_string()));
        }
        self.db
            .delete_with_options(encode_key(key).as_slice(), &DURABLE_WRITE_OPTIONS)
            .await?;
        Ok(())
    }

    async fn get_by_key(&self, key: &str) -> Result<Skill, StoreError> {
        self.ensure_open()?;
        self.read(key)
            .await?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<Skill>, StoreError> {
        self.ensure_open()?;
        let mut iter = self.db.scan(SKILL_KEY_PREFIX..SKILL_KEY_PREFIX_END).await?;

        let mut skills = Vec::new();
        while let Some(item) = iter.next().await? {
            let key = String::from_utf8_lossy(&item.key[SKILL_KEY_PREFIX.len()..]).into_owned();
            skills.push(decode_value(&key, &item.value)?);
        }
        Ok(skills)
    }

    async fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(path = %self.path, "Closing skill store");
        let _guard = self.write_lock.lock().await;
        self.db.flush().await?;
        self.db.close().await?;
        Ok(())
    }
}
