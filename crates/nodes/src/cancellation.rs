//! Per-task cancellation tokens and the process-wide registry that owns them.
//!
//! The registry is the only mutable structure shared between concurrent runs.
//! Its lock guards insertion and removal of entries only; each token carries its
//! own synchronisation, so cancelling one task never contends with another.
//!
//! Cancellation is cooperative. The graph checks the token between stages and
//! races it against retry backoff sleeps; an in-flight stage call is allowed to
//! finish before the cancellation is observed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use pipeline::{CancellationTokenId, TaskId};
use tokio_util::sync::WaitForCancellationFuture;

/// Cancellation flag and reason for one task.
#[derive(Debug)]
pub struct CancellationToken {
    id: CancellationTokenId,
    task_id: TaskId,
    inner: tokio_util::sync::CancellationToken,
    reason: Mutex<Option<String>>,
}

impl CancellationToken {
    pub fn new(task_id: TaskId) -> Self {
        Self {
            id: CancellationTokenId::new_random(),
            task_id,
            inner: tokio_util::sync::CancellationToken::new(),
            reason: Mutex::new(None),
        }
    }

    pub fn id(&self) -> CancellationTokenId {
        self.id
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Flags the task as cancelled. The first reason recorded wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        {
            let mut slot = self.reason.lock().unwrap_or_else(|p| p.into_inner());
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn reason(&self) -> Option<String> {
        self.reason
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Resolves once the token is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.inner.cancelled()
    }
}

/// Process-wide map of live tokens keyed by task id.
///
/// Entries are created on first use and removed at the end of every run, so
/// the registry only ever holds tokens for tasks that are in flight (or that
/// were cancelled before they started).
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: Mutex<HashMap<TaskId, Arc<CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token for `task_id`, creating it if needed.
    pub fn get_or_create(&self, task_id: TaskId) -> Arc<CancellationToken> {
        let mut tokens = self.tokens.lock().unwrap_or_else(|p| p.into_inner());
        tokens
            .entry(task_id)
            .or_insert_with(|| Arc::new(CancellationToken::new(task_id)))
            .clone()
    }

    /// Installs a caller-supplied token, replacing any existing entry.
    pub fn register(&self, token: Arc<CancellationToken>) {
        let mut tokens = self.tokens.lock().unwrap_or_else(|p| p.into_inner());
        tokens.insert(token.task_id(), token);
    }

    /// Cancels `task_id`. A token is created if the task has not started yet,
    /// so a later run for the same id observes the cancellation immediately.
    pub fn request_cancel(&self, task_id: TaskId, reason: impl Into<String>) -> Arc<CancellationToken> {
        let reason = reason.into();
        tracing::info!(task_id = %task_id, reason = %reason, "Cancellation requested");
        let token = self.get_or_create(task_id);
        token.cancel(reason);
        token
    }

    /// Removes the entry for `task_id`. Returns `true` if one existed.
    pub fn release(&self, task_id: TaskId) -> bool {
        let mut tokens = self.tokens.lock().unwrap_or_else(|p| p.into_inner());
        tokens.remove(&task_id).is_some()
    }

    pub fn contains(&self, task_id: TaskId) -> bool {
        self.tokens
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Releases a task's registry entry when dropped.
///
/// Held for the lifetime of a run so the entry is removed on every exit path,
/// including a panicking stage. A run whose event stream was dropped is
/// cancelled and releases its entry once it stops at the next stage boundary.
#[derive(Debug)]
pub(crate) struct TokenLease {
    registry: Arc<CancellationRegistry>,
    task_id: TaskId,
}

impl TokenLease {
    pub(crate) fn new(registry: Arc<CancellationRegistry>, task_id: TaskId) -> Self {
        Self { registry, task_id }
    }
}

impl Drop for TokenLease {
    fn drop(&mut self) {
        if self.registry.release(self.task_id) {
            tracing::debug!(task_id = %self.task_id, "Released cancellation token");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_returns_same_token() {
        let registry = CancellationRegistry::new();
        let a = registry.get_or_create(TaskId::new(1));
        let b = registry.get_or_create(TaskId::new(1));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_first_reason_wins() {
        let registry = CancellationRegistry::new();
        registry.request_cancel(TaskId::new(1), "user request");
        let token = registry.request_cancel(TaskId::new(1), "shutdown");
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("user request"));
    }

    #[test]
    fn test_cancelling_one_task_leaves_others_alone() {
        let registry = CancellationRegistry::new();
        let other = registry.get_or_create(TaskId::new(2));
        registry.request_cancel(TaskId::new(1), "stop");
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let registry = Arc::new(CancellationRegistry::new());
        registry.get_or_create(TaskId::new(9));
        {
            let _lease = TokenLease::new(registry.clone(), TaskId::new(9));
            assert!(registry.contains(TaskId::new(9)));
        }
        assert!(registry.is_empty());
        assert!(!registry.release(TaskId::new(9)));
    }

    #[tokio::test]
    async fn test_cancelled_future_resolves_after_cancel() {
        let token = Arc::new(CancellationToken::new(TaskId::new(3)));
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        token.cancel("done");
        waiter.await.unwrap();
    }
}
