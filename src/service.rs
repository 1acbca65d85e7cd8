//! Producer-facing skill API.
//!
//! Reads go straight to the store. Writes are published as actions and
//! applied later by the consumer, so a read right after a write may still
//! see the old state. A successful write only means the intent was durably
//! logged.
//!
//! Field updates answer with the current stored skill with the new value
//! laid over it, which is what the skill will look like once the consumer
//! catches up (unless another write for the same key lands in between).

use std::sync::Arc;

use tracing::debug;

use crate::codec::Action;
use crate::error::ServiceError;
use crate::producer::SkillPublisher;
use crate::store::{FieldPatch, SkillStore};
use crate::types::Skill;

#[derive(Clone)]
pub struct SkillService {
    publisher: SkillPublisher,
    store: Arc<dyn SkillStore>,
}

impl SkillService {
    pub fn new(publisher: SkillPublisher, store: Arc<dyn SkillStore>) -> Self {
        Self { publisher, store }
    }

    pub async fn get_skill(&self, key: &str) -> Result<Skill, ServiceError> {
        Ok(self.store.get_by_key(key).await?)
    }

    pub async fn list_skills(&self) -> Result<Vec<Skill>, ServiceError> {
        Ok(self.store.list().await?)
    }

    pub async fn create_skill(&self, skill: Skill) -> Result<Skill, ServiceError> {
        self.publish(Action::Create(skill.clone())).await?;
        Ok(skill)
    }

    /// Replace every attribute of the skill at `key`. The body must carry
    /// the same key.
    pub async fn update_skill(&self, key: &str, skill: Skill) -> Result<Skill, ServiceError> {
        if skill.key != key {
            return Err(ServiceError::KeyMismatch {
                path: key.to_string(),
                body: skill.key,
            });
        }
        self.publish(Action::Replace(skill.clone())).await?;
        Ok(skill)
    }

    pub async fn update_name(&self, key: &str, name: &str) -> Result<Skill, ServiceError> {
        self.publish(Action::update_name(key, name)).await?;
        self.projected(key, FieldPatch::Name(name.to_string())).await
    }

    pub async fn update_description(
        &self,
        key: &str,
        description: &str,
    ) -> Result<Skill, ServiceError> {
        self.publish(Action::update_description(key, description)).await?;
        self.projected(key, FieldPatch::Description(description.to_string())).await
    }

    pub async fn update_logo(&self, key: &str, logo: &str) -> Result<Skill, ServiceError> {
        self.publish(Action::update_logo(key, logo)).await?;
        self.projected(key, FieldPatch::Logo(logo.to_string())).await
    }

    pub async fn update_tags(&self, key: &str, tags: Vec<String>) -> Result<Skill, ServiceError> {
        self.publish(Action::update_tags(key, tags.clone())).await?;
        self.projected(key, FieldPatch::Tags(tags)).await
    }

    pub async fn delete_skill(&self, key: &str) -> Result<(), ServiceError> {
        self.publish(Action::delete(key)).await
    }

    async fn publish(&self, action: Action) -> Result<(), ServiceError> {
        if action.key().is_empty() {
            return Err(ServiceError::EmptyKey);
        }
        let position = self.publisher.publish(&action).await?;
        debug!(key = %action.key(), action = %action.kind(), %position, "Write accepted");
        Ok(())
    }

    async fn projected(&self, key: &str, patch: FieldPatch) -> Result<Skill, ServiceError> {
        let mut skill = self.store.get_by_key(key).await?;
        patch.apply_to(&mut skill);
        Ok(skill)
    }
}

impl std::fmt::Debug for SkillService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SkillService")
            .field("publisher", &self.publisher)
            .finish()
    }
}
