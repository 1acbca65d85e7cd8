//! In-process skill store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{FieldPatch, SkillStore};
use crate::error::StoreError;
use crate::types::Skill;

/// A [`SkillStore`] backed by a `BTreeMap`.
///
/// Supports failure injection: [`fail_next`](Self::fail_next) makes the next
/// N operations return [`StoreError::Unavailable`], which is how tests model
/// a flapping database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    skills: RwLock<BTreeMap<String, Skill>>,
    pending_failures: AtomicU32,
    operations: AtomicU64,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_skills(skills: impl IntoIterator<Item = Skill>) -> Self {
        let map = skills.into_iter().map(|s| (s.key.clone(), s)).collect();
        Self {
            skills: RwLock::new(map),
            ..Default::default()
        }
    }

    /// Make the next `n` operations fail as unavailable.
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    /// Number of operations attempted so far, failed ones included.
    pub fn operation_count(&self) -> u64 {
        self.operations.load(Ordering::SeqCst)
    }

    fn begin(&self) -> Result<(), StoreError> {
        self.operations.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SkillStore for MemoryStore {
    async fn insert(&self, skill: Skill) -> Result<Skill, StoreError> {
        self.begin()?;
        let mut skills = self.skills.write().await;
        if skills.contains_key(&skill.key) {
            return Err(StoreError::Conflict(skill.key));
        }
        skills.insert(skill.key.clone(), skill.clone());
        Ok(skill)
    }

    async fn replace_by_key(&self, key: &str, skill: Skill) -> Result<Skill, StoreError> {
        self.begin()?;
        let mut skills = self.skills.write().await;
        let stored = skills
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        *stored = Skill {
            key: key.to_string(),
            ..skill
        };
        Ok(stored.clone())
    }

    async fn patch_field(&self, key: &str, patch: FieldPatch) -> Result<Skill, StoreError> {
        self.begin()?;
        let mut skills = self.skills.write().await;
        let stored = skills
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        patch.apply_to(stored);
        Ok(stored.clone())
    }

    async fn delete_by_key(&self, key: &str) -> Result<(), StoreError> {
        self.begin()?;
        self.skills
            .write()
            .await
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn get_by_key(&self, key: &str) -> Result<Skill, StoreError> {
        self.begin()?;
        self.skills
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<Skill>, StoreError> {
        self.begin()?;
        Ok(self.skills.read().await.values().cloned().collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
