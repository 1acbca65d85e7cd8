//! Applies decoded actions to the skill store.
//!
//! # Outcomes
//!
//! | Situation | Result | Offset |
//! |-----------|--------|--------|
//! | Applied (or already applied) | `Ok(Applied)` | committed |
//! | Record does not decode | `Ok(Poison)`, no store call | committed |
//! | Store rejects deterministically (`NotFound`, `Conflict`) | `Ok(Rejected)` | committed |
//! | Store unavailable after retries | `Err(ApplyError)` | not committed, redelivered |
//! | Store closed | `Err(ApplyError)`, no retries | not committed, redelivered |
//!
//! Redelivery is safe because every action is idempotent on the store:
//! replace and patch overwrite, delete of an absent key succeeds, and a
//! create whose stored state already equals the payload succeeds.

use std::sync::Arc;
use std::time::Instant;

use backon::Retryable;
use tracing::{debug, warn};

use crate::codec::{Action, ActionKind, decode_record};
use crate::config::RetryConfig;
use crate::error::{ApplyError, DecodeError, StoreError};
use crate::log::LogRecord;
use crate::metrics::{self, SkipReason};
use crate::store::{FieldPatch, SkillStore};
use crate::types::Skill;

/// What happened to one delivered record.
#[derive(Debug)]
pub enum Disposition {
    Applied(ActionKind),
    /// Skipped: the record can never be decoded.
    Poison(DecodeError),
    /// Skipped: the store will reject this action on every delivery.
    Rejected(ApplyError),
}

impl Disposition {
    pub fn is_applied(&self) -> bool {
        matches!(self, Disposition::Applied(_))
    }
}

/// Maps actions onto [`SkillStore`] operations.
///
/// One dispatcher is shared by every claim of a member; the store handles
/// concurrent use. Within a claim, records are dispatched one at a time.
#[derive(Clone)]
pub struct MutationDispatcher {
    store: Arc<dyn SkillStore>,
    retry: RetryConfig,
}

impl MutationDispatcher {
    pub fn new(store: Arc<dyn SkillStore>) -> Self {
        Self {
            store,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn SkillStore> {
        &self.store
    }

    /// Apply one action, without retries.
    pub async fn apply(&self, action: &Action) -> Result<(), ApplyError> {
        let result = match action {
            Action::Create(skill) => self.create(skill).await,
            Action::Replace(skill) => self
                .store
                .replace_by_key(&skill.key, skill.clone())
                .await
                .map(drop),
            Action::UpdateName(u) => self.patch(&u.key, FieldPatch::Name(u.name.clone())).await,
            Action::UpdateDescription(u) => {
                self.patch(&u.key, FieldPatch::Description(u.description.clone()))
                    .await
            }
            Action::UpdateLogo(u) => self.patch(&u.key, FieldPatch::Logo(u.logo.clone())).await,
            Action::UpdateTags(u) => self.patch(&u.key, FieldPatch::Tags(u.tags.clone())).await,
            Action::Delete(r) => match self.store.delete_by_key(&r.key).await {
                Err(StoreError::NotFound(_)) => {
                    debug!(key = %r.key, "Delete of absent skill treated as applied");
                    Ok(())
                }
                other => other,
            },
        };

        result.map_err(|e| ApplyError::from_store(action.kind(), action.key(), e))
    }

    async fn create(&self, skill: &Skill) -> Result<(), StoreError> {
        match self.store.insert(skill.clone()).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(key)) => {
                // A redelivered create finds its own earlier write.
                let existing = self.store.get_by_key(&skill.key).await?;
                if existing == *skill {
                    debug!(key = %skill.key, "Create already applied");
                    Ok(())
                } else {
                    Err(StoreError::Conflict(key))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn patch(&self, key: &str, patch: FieldPatch) -> Result<(), StoreError> {
        self.store.patch_field(key, patch).await.map(drop)
    }

    /// Decode and apply a delivered record.
    ///
    /// Transient store failures are retried in place. `Err` means the
    /// record must not be committed.
    pub async fn dispatch(&self, record: &LogRecord) -> Result<Disposition, ApplyError> {
        let action = match decode_record(record) {
            Ok(action) => action,
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Skipping undecodable record"
                );
                metrics::record_skipped(SkipReason::Poison);
                return Ok(Disposition::Poison(e));
            }
        };

        let kind = action.kind();
        let started = Instant::now();
        let result = (|| self.apply(&action))
            .retry(self.retry.policy())
            .when(ApplyError::is_retriable)
            .notify(|e, delay| {
                warn!(
                    key = %action.key(),
                    action = %kind,
                    error = %e,
                    retry_in = ?delay,
                    "Apply failed, retrying"
                );
            })
            .await;

        match result {
            Ok(()) => {
                metrics::record_applied(kind, started.elapsed().as_secs_f64());
                debug!(
                    partition = record.partition,
                    offset = record.offset,
                    key = %action.key(),
                    action = %kind,
                    "Applied action"
                );
                Ok(Disposition::Applied(kind))
            }
            Err(e) if !e.is_rejection() => {
                metrics::record_apply_failure(kind);
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Apply failed, leaving record for redelivery"
                );
                Err(e)
            }
            Err(e) => {
                metrics::record_skipped(SkipReason::Rejected);
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Skipping rejected action"
                );
                Ok(Disposition::Rejected(e))
            }
        }
    }
}

impl std::fmt::Debug for MutationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationDispatcher")
            .field("retry", &self.retry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Envelope;
    use crate::store::MemoryStore;
    use bytes::Bytes;
    use std::time::Duration;

    fn quick_retry() -> RetryConfig {
        RetryConfig {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_times: 3,
        }
    }

    fn dispatcher(store: Arc<MemoryStore>) -> MutationDispatcher {
        MutationDispatcher::new(store).with_retry(quick_retry())
    }

    fn record_for(action: &Action) -> LogRecord {
        let envelope = Envelope::seal(action).unwrap();
        raw_record(envelope.kind.as_str(), envelope.payload)
    }

    fn raw_record(tag: &str, payload: impl Into<Bytes>) -> LogRecord {
        LogRecord {
            topic: Arc::from("skills"),
            partition: 0,
            offset: 0,
            timestamp: 0,
            key: Some(Bytes::from_static(b"go")),
            headers: vec![("action".to_string(), Bytes::copy_from_slice(tag.as_bytes()))],
            payload: payload.into(),
        }
    }

    fn go() -> Skill {
        Skill::new("go")
            .with_name("go")
            .with_description("d")
            .with_logo("l")
            .with_tags(["a"])
    }

    #[tokio::test]
    async fn test_update_name_only_changes_name() {
        let store = Arc::new(MemoryStore::with_skills([go()]));
        let dispatcher = dispatcher(store.clone());

        let disposition = dispatcher
            .dispatch(&record_for(&Action::update_name("go", "gopher")))
            .await
            .unwrap();

        assert!(matches!(disposition, Disposition::Applied(ActionKind::UpdateName)));
        assert_eq!(
            store.get_by_key("go").await.unwrap(),
            go().with_name("gopher")
        );
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(store.clone());

        let actions = [
            Action::Create(go()),
            Action::Replace(go().with_description("replaced")),
            Action::update_tags("go", ["x", "y"]),
        ];
        for action in &actions {
            dispatcher.apply(action).await.unwrap();
        }
        let once = store.get_by_key("go").await.unwrap();

        for action in &actions {
            dispatcher.apply(action).await.unwrap();
        }
        assert_eq!(store.get_by_key("go").await.unwrap(), once);
    }

    #[tokio::test]
    async fn test_redelivered_create_after_update_is_rejected_not_reverted() {
        let store = Arc::new(MemoryStore::with_skills([go().with_name("gopher")]));
        let dispatcher = dispatcher(store.clone());

        let disposition = dispatcher
            .dispatch(&record_for(&Action::Create(go())))
            .await
            .unwrap();

        match disposition {
            Disposition::Rejected(e) => {
                assert!(matches!(e.store_error(), StoreError::Conflict(_)))
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(store.get_by_key("go").await.unwrap().name, "gopher");
    }

    #[tokio::test]
    async fn test_delete_of_absent_key_succeeds() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(store.clone());

        dispatcher.apply(&Action::delete("rust")).await.unwrap();
        let disposition = dispatcher
            .dispatch(&record_for(&Action::delete("rust")))
            .await
            .unwrap();
        assert!(disposition.is_applied());
    }

    #[tokio::test]
    async fn test_update_after_delete_does_not_resurrect() {
        let store = Arc::new(MemoryStore::with_skills([go()]));
        let dispatcher = dispatcher(store.clone());

        dispatcher.apply(&Action::delete("go")).await.unwrap();
        let err = dispatcher
            .apply(&Action::update_logo("go", "new.png"))
            .await
            .unwrap_err();

        assert!(!err.is_retriable());
        assert!(matches!(err.store_error(), StoreError::NotFound(_)));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_poison_record_never_reaches_store() {
        let store = Arc::new(MemoryStore::with_skills([go()]));
        let dispatcher = dispatcher(store.clone());
        let before = store.operation_count();

        for record in [
            raw_record("update_name", Bytes::from_static(b"{\"key\":\"go\",\"na")),
            raw_record("update_name", Bytes::from_static(b"{\"key\":\"go\"}")),
            raw_record("rename", Bytes::from_static(b"{}")),
            raw_record("delete", Bytes::from_static(b"{\"key\":\"\"}")),
        ] {
            let disposition = dispatcher.dispatch(&record).await.unwrap();
            assert!(matches!(disposition, Disposition::Poison(_)));
        }
        assert_eq!(store.operation_count(), before);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let store = Arc::new(MemoryStore::with_skills([go()]));
        let dispatcher = dispatcher(store.clone());
        store.fail_next(2);

        let disposition = dispatcher
            .dispatch(&record_for(&Action::update_description("go", "Gophers")))
            .await
            .unwrap();

        assert!(disposition.is_applied());
        assert_eq!(store.get_by_key("go").await.unwrap().description, "Gophers");
    }

    #[tokio::test]
    async fn test_exhausted_retries_leave_record_uncommitted() {
        let store = Arc::new(MemoryStore::with_skills([go()]));
        let dispatcher = dispatcher(store.clone());
        store.fail_next(100);

        let err = dispatcher
            .dispatch(&record_for(&Action::update_name("go", "gopher")))
            .await
            .unwrap_err();

        assert!(err.is_retriable());
        assert_eq!(err.action(), ActionKind::UpdateName);
        // Initial attempt + 3 retries
        assert_eq!(store.operation_count(), 4);
    }

    #[tokio::test]
    async fn test_closed_store_is_not_skipped() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher = dispatcher(store.clone());
        store.close().await.unwrap();

        let err = dispatcher
            .dispatch(&record_for(&Action::Create(go())))
            .await
            .unwrap_err();

        assert!(!err.is_rejection());
        assert!(matches!(err.store_error(), StoreError::Closed));
    }
}
