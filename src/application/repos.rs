//! Repository traits describing persistence adapters.
//!
//! Every write goes through the [`SignalBus`] so cache invalidation follows
//! persistence without the callers knowing about it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::cache::lock::{rw_read, rw_write};
use crate::invalidation::{Model, MutationPhase, SignalBus};

const SOURCE: &str = "application::repos";

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
}

#[async_trait]
pub trait Repository<M: Model>: Send + Sync {
    async fn get(&self, pk: &str) -> Result<Option<M>, RepoError>;

    async fn list(&self) -> Result<Vec<M>, RepoError>;

    /// Insert or replace the instance with the same primary key.
    async fn save(&self, instance: M) -> Result<M, RepoError>;

    async fn delete(&self, pk: &str) -> Result<M, RepoError>;
}

/// Process-local repository emitting lifecycle signals around each write.
pub struct MemoryRepository<M> {
    rows: RwLock<BTreeMap<String, M>>,
    signals: Arc<SignalBus>,
}

impl<M: Model + Clone> MemoryRepository<M> {
    pub fn new(signals: Arc<SignalBus>) -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            signals,
        }
    }

    pub fn signals(&self) -> &Arc<SignalBus> {
        &self.signals
    }

    pub fn len(&self) -> usize {
        rw_read(&self.rows, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<M: Model + Clone> Repository<M> for MemoryRepository<M> {
    async fn get(&self, pk: &str) -> Result<Option<M>, RepoError> {
        Ok(rw_read(&self.rows, SOURCE, "get").get(pk).cloned())
    }

    async fn list(&self) -> Result<Vec<M>, RepoError> {
        Ok(rw_read(&self.rows, SOURCE, "list").values().cloned().collect())
    }

    async fn save(&self, instance: M) -> Result<M, RepoError> {
        let pk = instance.pk();
        if pk.is_empty() {
            return Err(RepoError::InvalidInput {
                message: format!("{} without primary key", M::LABEL),
            });
        }

        // Pre-save carries the stored row: pages cached from it are stale once
        // the write lands. Inserts have nothing cached yet.
        let previous = rw_read(&self.rows, SOURCE, "save").get(&pk).cloned();
        if let Some(previous) = previous {
            self.signals
                .emit(MutationPhase::PreSave, M::LABEL, Arc::new(previous))
                .await;
        }

        rw_write(&self.rows, SOURCE, "save").insert(pk.clone(), instance.clone());
        debug!(model = M::LABEL, pk = %pk, "saved instance");

        self.signals
            .emit(MutationPhase::PostSave, M::LABEL, Arc::new(instance.clone()))
            .await;
        Ok(instance)
    }

    async fn delete(&self, pk: &str) -> Result<M, RepoError> {
        let removed = rw_write(&self.rows, SOURCE, "delete").remove(pk);
        let Some(instance) = removed else {
            return Err(RepoError::NotFound);
        };
        debug!(model = M::LABEL, pk, "deleted instance");

        self.signals
            .emit(MutationPhase::PostDelete, M::LABEL, Arc::new(instance.clone()))
            .await;
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde::Serialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Item {
        id: String,
        label: String,
    }

    impl Model for Item {
        const LABEL: &'static str = "item";

        fn pk(&self) -> String {
            self.id.clone()
        }
    }

    fn item(id: &str) -> Item {
        labelled(id, "")
    }

    fn labelled(id: &str, label: &str) -> Item {
        Item {
            id: id.to_string(),
            label: label.to_string(),
        }
    }

    fn recording_repo() -> (MemoryRepository<Item>, Arc<Mutex<Vec<String>>>) {
        let signals = Arc::new(SignalBus::new());
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        for phase in [
            MutationPhase::PreSave,
            MutationPhase::PostSave,
            MutationPhase::PostDelete,
        ] {
            let seen = Arc::clone(&seen);
            signals.on_mutation(phase, move |signal| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock()
                        .unwrap()
                        .push(format!("{}:{}", signal.phase, signal.instance.primary_key()));
                }
            });
        }
        (MemoryRepository::new(signals), seen)
    }

    #[tokio::test]
    async fn insert_emits_post_save_only() {
        let (repo, seen) = recording_repo();

        repo.save(item("a")).await.expect("save");

        assert_eq!(repo.get("a").await.expect("get"), Some(item("a")));
        assert_eq!(*seen.lock().unwrap(), vec!["post_save:a".to_string()]);
    }

    #[tokio::test]
    async fn replace_emits_pre_save_with_stored_row() {
        let signals = Arc::new(SignalBus::new());
        let before: Arc<Mutex<Vec<String>>> = Arc::default();
        let captured = Arc::clone(&before);
        signals.on_mutation(MutationPhase::PreSave, move |signal| {
            let captured = Arc::clone(&captured);
            async move {
                let snapshot = signal.instance.snapshot().expect("snapshot");
                let label = snapshot.fields["label"].as_str().unwrap_or_default();
                captured.lock().unwrap().push(label.to_string());
            }
        });
        let repo = MemoryRepository::new(signals);

        repo.save(labelled("a", "old")).await.expect("insert");
        repo.save(labelled("a", "new")).await.expect("replace");

        assert_eq!(*before.lock().unwrap(), vec!["old".to_string()]);
        assert_eq!(repo.get("a").await.expect("get"), Some(labelled("a", "new")));
    }

    #[tokio::test]
    async fn delete_emits_post_delete_and_reports_missing_rows() {
        let (repo, seen) = recording_repo();
        repo.save(item("a")).await.expect("save");
        seen.lock().unwrap().clear();

        repo.delete("a").await.expect("delete");
        assert!(matches!(repo.delete("a").await, Err(RepoError::NotFound)));

        assert!(repo.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec!["post_delete:a".to_string()]);
    }

    #[tokio::test]
    async fn save_requires_primary_key() {
        let (repo, seen) = recording_repo();
        assert!(matches!(
            repo.save(item("")).await,
            Err(RepoError::InvalidInput { .. })
        ));
        assert!(seen.lock().unwrap().is_empty());
    }
}
