//! Entity store: the read/write contract the consumer applies actions to.
//!
//! The store holds current skill state keyed by skill key. It is a
//! projection of the action log; the log is authoritative.
//!
//! Two implementations ship with the crate:
//! - [`MemoryStore`]: in-process, with failure injection for tests
//! - [`SlateStore`]: SlateDB on an `object_store` backend (local, S3, memory)
//!
//! Use [`open_store`] to pick one from [`StoreConfig`].

mod memory;
mod objects;
mod slate;

pub use memory::MemoryStore;
pub use objects::create_object_store;
pub use slate::SlateStore;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::types::Skill;

/// A single mutable attribute of a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkillField {
    Name,
    Description,
    Logo,
    Tags,
}

impl SkillField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkillField::Name => "name",
            SkillField::Description => "description",
            SkillField::Logo => "logo",
            SkillField::Tags => "tags",
        }
    }
}

/// New value for one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldPatch {
    Name(String),
    Description(String),
    Logo(String),
    Tags(Vec<String>),
}

impl FieldPatch {
    pub fn field(&self) -> SkillField {
        match self {
            FieldPatch::Name(_) => SkillField::Name,
            FieldPatch::Description(_) => SkillField::Description,
            FieldPatch::Logo(_) => SkillField::Logo,
            FieldPatch::Tags(_) => SkillField::Tags,
        }
    }

    /// Overwrite the patched attribute of `skill`, leaving the rest alone.
    pub fn apply_to(self, skill: &mut Skill) {
        match self {
            FieldPatch::Name(name) => skill.name = name,
            FieldPatch::Description(description) => skill.description = description,
            FieldPatch::Logo(logo) => skill.logo = logo,
            FieldPatch::Tags(tags) => skill.tags = tags,
        }
    }
}

/// Keyed skill persistence.
///
/// Every operation is atomic for a single key. Implementations report
/// missing keys as [`StoreError::NotFound`], duplicate inserts as
/// [`StoreError::Conflict`], and connectivity trouble as
/// [`StoreError::Unavailable`] so callers can decide what to retry.
#[async_trait]
pub trait SkillStore: Send + Sync {
    /// Insert a new skill. Fails with `Conflict` if the key exists.
    async fn insert(&self, skill: Skill) -> Result<Skill, StoreError>;

    /// Overwrite every non-key attribute of an existing skill.
    async fn replace_by_key(&self, key: &str, skill: Skill) -> Result<Skill, StoreError>;

    /// Overwrite one attribute of an existing skill.
    async fn patch_field(&self, key: &str, patch: FieldPatch) -> Result<Skill, StoreError>;

    /// Remove a skill. Fails with `NotFound` if the key is absent.
    async fn delete_by_key(&self, key: &str) -> Result<(), StoreError>;

    async fn get_by_key(&self, key: &str) -> Result<Skill, StoreError>;

    /// All skills, ordered by key.
    async fn list(&self) -> Result<Vec<Skill>, StoreError>;

    /// Flush and release resources. Further calls fail with `Closed`.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Open the store described by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn SkillStore>, StoreError> {
    match config {
        StoreConfig::Memory => {
            tracing::info!("Using in-memory skill store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreConfig::Slate { object_store, path } => {
            let object_store = create_object_store(object_store)
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            Ok(Arc::new(SlateStore::open(path, object_store).await?))
        }
    }
}
