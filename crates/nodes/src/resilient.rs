//! Retry, fallback and skip handling around a single stage call.
//!
//! [`ResilientStage::run`] loops on the stage executor, asking the
//! [`ErrorHandler`] what to do after each failure. Backoff sleeps race the
//! task's cancellation token. Anything the wrapper cannot recover from itself
//! comes back as a [`StageEscalation`] for the graph to act on.

use std::borrow::Cow;

use pipeline::{
    ErrorHandler, ModelTier, Stage, StageContext, StageError, StageExecutor, StateUpdate,
    WorkflowState,
};
use serde_json::json;
use thiserror::Error;

use crate::cancellation::CancellationToken;
use crate::events::{EventEmitter, EventKind, StageEvent};

/// Why a stage did not produce an update.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageEscalation {
    /// Retries are exhausted but a weaker model tier is available. The caller
    /// rebuilds the call with `tier` and runs the stage again.
    #[error("fallback to {tier} required after: {error}")]
    Fallback { tier: ModelTier, error: StageError },

    /// Recovery is exhausted or not permitted; the original failure.
    #[error(transparent)]
    Fatal(StageError),

    /// The task was cancelled while waiting to retry.
    #[error("cancelled during retry backoff")]
    Cancelled,
}

/// A stage executor bound to the recovery state of one run.
pub struct ResilientStage<'a> {
    pub stage: Stage,
    pub executor: &'a dyn StageExecutor,
    pub handler: &'a ErrorHandler,
    pub cancel: &'a CancellationToken,
    pub events: &'a EventEmitter,
}

impl ResilientStage<'_> {
    /// Runs the stage on `tier` until it succeeds or escalates.
    pub async fn run(
        &self,
        state: &WorkflowState,
        tier: ModelTier,
    ) -> Result<StateUpdate, StageEscalation> {
        let mut input = Cow::Borrowed(state);
        let mut attempt = 1;
        loop {
            let ctx = StageContext {
                stage: self.stage,
                model_tier: tier,
                attempt,
            };
            let error = match self.executor.execute(&input, &ctx).await {
                Ok(update) => {
                    self.handler.reset_stage(self.stage);
                    return Ok(update);
                }
                Err(error) => error,
            };

            tracing::warn!(
                task_id = %state.task_id,
                stage = %self.stage,
                model_tier = %tier,
                attempt,
                error = %error,
                "Stage failed"
            );

            let action = self
                .handler
                .handle_error(&error, self.stage, &input, tier.as_str());

            if action.should_retry {
                self.events
                    .emit(StageEvent::for_stage(
                        EventKind::StageRetry,
                        self.stage,
                        json!({
                            "error_type": action.error_type,
                            "attempt": action.current_retry,
                            "max_retries": action.max_retries,
                            "delay_seconds": action.retry_delay_seconds(),
                            "model_tier": tier,
                            "notes": action.recovery_notes,
                        }),
                    ))
                    .await;

                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        tracing::info!(
                            task_id = %state.task_id,
                            stage = %self.stage,
                            "Cancelled during retry backoff"
                        );
                        return Err(StageEscalation::Cancelled);
                    }
                    _ = tokio::time::sleep(action.retry_delay) => {}
                }

                if let Some(modified) = action.modified_state {
                    input = Cow::Owned(modified);
                }
                attempt += 1;
                continue;
            }

            if action.should_fallback {
                if let Some(next) = action.fallback_model_tier {
                    return Err(StageEscalation::Fallback { tier: next, error });
                }
            }

            if action.should_skip {
                tracing::warn!(
                    task_id = %state.task_id,
                    stage = %self.stage,
                    error_type = %action.error_type,
                    "Skipping stage after exhausted recovery"
                );
                return Ok(StateUpdate::new());
            }

            return Err(StageEscalation::Fatal(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use pipeline::{RecoveryConfig, TaskId, TRUNCATION_MARKER};

    use super::*;

    /// Fails with each scripted error in turn, then succeeds.
    struct Scripted {
        failures: Mutex<Vec<StageError>>,
        seen: Mutex<Vec<(u32, usize)>>,
    }

    impl Scripted {
        fn new(failures: Vec<StageError>) -> Self {
            Self {
                failures: Mutex::new(failures.into_iter().rev().collect()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StageExecutor for Scripted {
        async fn execute(
            &self,
            state: &WorkflowState,
            ctx: &StageContext,
        ) -> Result<StateUpdate, StageError> {
            self.seen
                .lock()
                .unwrap()
                .push((ctx.attempt, state.plan.chars().count()));
            match self.failures.lock().unwrap().pop() {
                Some(e) => Err(e),
                None => Ok(StateUpdate::new().with_code("done")),
            }
        }
    }

    fn state() -> WorkflowState {
        WorkflowState::new(TaskId::new(1), "task")
    }

    async fn run(
        executor: &Scripted,
        handler: &ErrorHandler,
        cancel: &CancellationToken,
        state: &WorkflowState,
        tier: ModelTier,
    ) -> Result<StateUpdate, StageEscalation> {
        let events = EventEmitter::detached();
        ResilientStage {
            stage: Stage::Coder,
            executor,
            handler,
            cancel,
            events: &events,
        }
        .run(state, tier)
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_then_succeeds_and_resets_counters() {
        let executor = Scripted::new(vec![
            StageError::new("Error", "connection reset"),
            StageError::new("Error", "connection reset"),
        ]);
        let handler = ErrorHandler::new(RecoveryConfig::default());
        let cancel = CancellationToken::new(TaskId::new(1));
        let started = tokio::time::Instant::now();

        let update = run(&executor, &handler, &cancel, &state(), ModelTier::Sonnet)
            .await
            .unwrap();

        assert_eq!(update.code.as_deref(), Some("done"));
        // 2s + 4s of backoff on the paused clock.
        assert_eq!(started.elapsed(), Duration::from_secs(6));
        assert_eq!(
            handler.retry_count(Stage::Coder, pipeline::ErrorType::ConnectionError),
            0
        );
        let attempts: Vec<u32> = executor.seen.lock().unwrap().iter().map(|s| s.0).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_timeouts_escalate_to_fallback() {
        let timeouts = (0..4).map(|_| StageError::new("TimeoutError", "timed out")).collect();
        let executor = Scripted::new(timeouts);
        let handler = ErrorHandler::new(RecoveryConfig::default());
        let cancel = CancellationToken::new(TaskId::new(1));

        let err = run(&executor, &handler, &cancel, &state(), ModelTier::Opus)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StageEscalation::Fallback { tier: ModelTier::Sonnet, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_error_propagates_unchanged() {
        let original = StageError::new("AuthError", "unauthorized");
        let executor = Scripted::new(vec![original.clone()]);
        let handler = ErrorHandler::new(RecoveryConfig::default());
        let cancel = CancellationToken::new(TaskId::new(1));

        let err = run(&executor, &handler, &cancel, &state(), ModelTier::Opus)
            .await
            .unwrap_err();

        assert_eq!(err, StageEscalation::Fatal(original));
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_length_retry_uses_truncated_plan() {
        let executor = Scripted::new(vec![StageError::new("BadRequest", "context length exceeded")]);
        let handler = ErrorHandler::new(RecoveryConfig::default());
        let cancel = CancellationToken::new(TaskId::new(1));
        let mut s = state();
        s.plan = "x".repeat(10_000);

        run(&executor, &handler, &cancel, &s, ModelTier::Sonnet)
            .await
            .unwrap();

        let seen = executor.seen.lock().unwrap();
        assert_eq!(seen[0].1, 10_000);
        assert!(seen[1].1 <= 4001);
        assert!(TRUNCATION_MARKER.len() < seen[1].1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_skip_listed_stage_returns_empty_update() {
        let executor = Scripted::new(vec![StageError::new("Error", "something odd"); 2]);
        let handler = ErrorHandler::new(RecoveryConfig {
            skip_exhausted_stages: HashSet::from([Stage::Coder]),
            ..RecoveryConfig::default()
        });
        let cancel = CancellationToken::new(TaskId::new(1));

        let update = run(&executor, &handler, &cancel, &state(), ModelTier::Haiku)
            .await
            .unwrap();

        assert!(update.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let executor = Scripted::new(vec![StageError::new("RateLimitError", "429")]);
        let handler = ErrorHandler::new(RecoveryConfig::default());
        let cancel = CancellationToken::new(TaskId::new(1));
        cancel.cancel("user stop");

        let err = run(&executor, &handler, &cancel, &state(), ModelTier::Sonnet)
            .await
            .unwrap_err();

        assert_eq!(err, StageEscalation::Cancelled);
        assert_eq!(executor.seen.lock().unwrap().len(), 1);
    }
}
