//! In-memory [`CheckpointStore`] for tests and single-process runs.

use std::collections::HashMap;

use async_trait::async_trait;
use pipeline::{Checkpoint, CheckpointError, CheckpointStore, StateUpdate, ThreadId, WorkflowState};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    threads: RwLock<HashMap<ThreadId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.threads.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops the checkpoint for `thread_id`. Returns whether one existed.
    pub async fn remove(&self, thread_id: ThreadId) -> bool {
        self.threads.write().await.remove(&thread_id).is_some()
    }

    /// Drops every checkpoint with nothing left to run and returns how many
    /// were evicted. Paused threads are kept.
    pub async fn remove_finished(&self) -> usize {
        let mut threads = self.threads.write().await;
        let before = threads.len();
        threads.retain(|_, checkpoint| !checkpoint.is_finished());
        let evicted = before - threads.len();
        if evicted > 0 {
            tracing::debug!(evicted, remaining = threads.len(), "Evicted finished checkpoints");
        }
        evicted
    }

    pub async fn clear(&self) {
        self.threads.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_state(&self, thread_id: ThreadId) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.threads.read().await.get(&thread_id).cloned())
    }

    async fn update_state(
        &self,
        thread_id: ThreadId,
        update: StateUpdate,
    ) -> Result<(), CheckpointError> {
        let mut threads = self.threads.write().await;
        let checkpoint = threads
            .get_mut(&thread_id)
            .ok_or(CheckpointError::NotFound { thread_id })?;
        let corrupt = |e: pipeline::PipelineError| CheckpointError::Corrupt {
            thread_id,
            message: e.to_string(),
        };
        let mut state = WorkflowState::from_checkpoint(checkpoint.values.clone()).map_err(corrupt)?;
        state.apply(update);
        checkpoint.values = state.to_checkpoint().map_err(corrupt)?;
        Ok(())
    }

    async fn save(&self, thread_id: ThreadId, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        tracing::debug!(
            thread_id = %thread_id,
            pending = ?checkpoint.pending,
            "Saving checkpoint"
        );
        self.threads.write().await.insert(thread_id, checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pipeline::{Stage, TaskId};

    use super::*;

    #[tokio::test]
    async fn test_update_merges_into_saved_values_and_keeps_pending() {
        let store = InMemoryCheckpointStore::new();
        let thread = ThreadId::new_random();
        let mut state = WorkflowState::new(TaskId::new(5), "task");
        state.plan = "draft".into();
        store
            .save(
                thread,
                Checkpoint {
                    values: state.to_checkpoint().unwrap(),
                    pending: vec![Stage::Coder],
                },
            )
            .await
            .unwrap();

        store
            .update_state(thread, StateUpdate::new().with_plan("edited"))
            .await
            .unwrap();

        let checkpoint = store.get_state(thread).await.unwrap().unwrap();
        assert_eq!(checkpoint.pending, vec![Stage::Coder]);
        let reloaded = WorkflowState::from_checkpoint(checkpoint.values).unwrap();
        assert_eq!(reloaded.plan, "edited");
        assert_eq!(reloaded.task_description, "task");
    }

    async fn save_with_pending(store: &InMemoryCheckpointStore, pending: Vec<Stage>) -> ThreadId {
        let thread = ThreadId::new_random();
        let checkpoint = Checkpoint {
            values: WorkflowState::new(TaskId::new(6), "task").to_checkpoint().unwrap(),
            pending,
        };
        store.save(thread, checkpoint).await.unwrap();
        thread
    }

    #[tokio::test]
    async fn test_finished_threads_are_evicted_and_paused_kept() {
        let store = InMemoryCheckpointStore::new();
        let paused = save_with_pending(&store, vec![Stage::Coder]).await;
        let done = save_with_pending(&store, Vec::new()).await;

        assert_eq!(store.remove_finished().await, 1);

        assert_eq!(store.len().await, 1);
        assert!(store.get_state(paused).await.unwrap().is_some());
        assert!(store.get_state(done).await.unwrap().is_none());
        assert_eq!(store.remove_finished().await, 0);
    }

    #[tokio::test]
    async fn test_remove_and_clear_release_threads() {
        let store = InMemoryCheckpointStore::new();
        let first = save_with_pending(&store, vec![Stage::Tester]).await;
        save_with_pending(&store, vec![Stage::Reviewer]).await;

        assert!(store.remove(first).await);
        assert!(!store.remove(first).await);
        assert_eq!(store.len().await, 1);

        store.clear().await;
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_update_of_unknown_thread_is_not_found() {
        let store = InMemoryCheckpointStore::new();
        let thread = ThreadId::new_random();
        let err = store.update_state(thread, StateUpdate::new()).await.unwrap_err();
        assert_eq!(err, CheckpointError::NotFound { thread_id: thread });
        assert!(store.get_state(thread).await.unwrap().is_none());
    }
}
