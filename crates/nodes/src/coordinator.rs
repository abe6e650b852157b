//! End-to-end execution of one task: `invoke` and `stream`.
//!
//! The coordinator owns the run's envelope. It builds the initial state,
//! obtains the task's cancellation token, races the graph against the
//! wall-clock timeout, converts timeouts and cancellations into terminal
//! statuses, and on every exit path notifies the tracking sink and removes the
//! token from the registry. Callers always get a well-formed
//! [`WorkflowState`]; operational failures never surface as errors.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt};
use pipeline::{PipelineError, Stage, TaskId, ThreadId, WorkflowState, WorkflowStatus};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::cancellation::{CancellationRegistry, CancellationToken, TokenLease};
use crate::events::{EventEmitter, EventKind, StageEvent};
use crate::graph::{GraphInput, GraphRun, RunContext, WorkflowGraph};

const EVENT_BUFFER: usize = 64;

/// Per-call options for [`ExecutionCoordinator::invoke`] and
/// [`ExecutionCoordinator::stream`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Resumption key; generated when checkpointing is enabled and none is given.
    pub thread_id: Option<ThreadId>,
    /// Overrides the configured timeout.
    pub timeout: Option<Duration>,
    /// Caller-owned token. Registered under the task id for the run's duration.
    pub cancellation: Option<Arc<CancellationToken>>,
}

/// Outcome of a guarded run before it is reduced to a plain state.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: WorkflowState,
    pub paused_before: Option<Stage>,
}

#[derive(Debug, Clone)]
pub struct ExecutionCoordinator {
    graph: Arc<WorkflowGraph>,
    registry: Arc<CancellationRegistry>,
}

impl ExecutionCoordinator {
    pub fn new(graph: Arc<WorkflowGraph>, registry: Arc<CancellationRegistry>) -> Self {
        Self { graph, registry }
    }

    pub fn graph(&self) -> &Arc<WorkflowGraph> {
        &self.graph
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    /// Cancels a running (or not yet started) task.
    pub fn request_cancel(&self, task_id: TaskId, reason: impl Into<String>) {
        self.registry.request_cancel(task_id, reason);
    }

    /// Runs one task to completion and returns the final state.
    pub async fn invoke(&self, description: &str, task_id: TaskId, opts: InvokeOptions) -> WorkflowState {
        self.invoke_report(description, task_id, opts).await.state
    }

    /// Like [`invoke`](Self::invoke), but also reports whether the run paused
    /// at an interrupt point.
    pub async fn invoke_report(
        &self,
        description: &str,
        task_id: TaskId,
        opts: InvokeOptions,
    ) -> RunReport {
        let span = tracing::info_span!("invoke", task_id = %task_id);
        let state = WorkflowState::new(task_id, description);
        self.guarded(state, GraphInput::Fresh, opts, EventEmitter::detached())
            .instrument(span)
            .await
    }

    /// Continues a checkpointed run. `state` is the checkpointed state, used
    /// for the token lookup and as the fallback result on timeout.
    pub(crate) async fn resume_thread(
        &self,
        state: WorkflowState,
        thread_id: ThreadId,
        opts: InvokeOptions,
    ) -> RunReport {
        let span = tracing::info_span!("resume", task_id = %state.task_id, thread_id = %thread_id);
        let opts = InvokeOptions {
            thread_id: Some(thread_id),
            ..opts
        };
        self.guarded(state, |_| GraphInput::Resume(thread_id), opts, EventEmitter::detached())
            .instrument(span)
            .await
    }

    /// Runs one task and yields its lifecycle events.
    ///
    /// `kinds` is an allow-list over event kinds; the terminal
    /// `workflow_completed`/`workflow_error` event is always delivered. On
    /// timeout the stream yields a single `workflow_error` event and ends.
    ///
    /// Dropping the stream before its terminal event cancels the task; the
    /// run stops before its next stage.
    pub fn stream(
        &self,
        description: impl Into<String>,
        task_id: TaskId,
        mut opts: InvokeOptions,
        kinds: Option<HashSet<EventKind>>,
    ) -> BoxStream<'static, StageEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let token = match &opts.cancellation {
            Some(token) => token.clone(),
            None => {
                let token = self.registry.get_or_create(task_id);
                opts.cancellation = Some(token.clone());
                token
            }
        };
        let guard = CancelOnDrop { token: Some(token) };
        let coordinator = self.clone();
        let description = description.into();
        let span = tracing::info_span!("stream", task_id = %task_id);

        tokio::spawn(
            async move {
                let events = EventEmitter::new(tx);
                let state = WorkflowState::new(task_id, description);
                let report = coordinator
                    .guarded(state, GraphInput::Fresh, opts, events.clone())
                    .await;
                events.emit(terminal_event(&report)).await;
            }
            .instrument(span),
        );

        stream::unfold((rx, guard), |(mut rx, mut guard)| async move {
            let event = rx.recv().await?;
            if event.kind.is_terminal() {
                guard.disarm();
            }
            Some((event, (rx, guard)))
        })
        .filter(move |event| {
            let keep = event.kind.is_terminal()
                || kinds.as_ref().map_or(true, |k| k.contains(&event.kind));
            futures::future::ready(keep)
        })
        .boxed()
    }

    async fn guarded<F>(
        &self,
        mut state: WorkflowState,
        input: F,
        opts: InvokeOptions,
        events: EventEmitter,
    ) -> RunReport
    where
        F: FnOnce(WorkflowState) -> GraphInput,
    {
        let task_id = state.task_id;
        let token = match opts.cancellation {
            Some(token) if token.task_id() != task_id => {
                let error = PipelineError::config(format!(
                    "cancellation token belongs to task {}, not {task_id}",
                    token.task_id()
                ));
                tracing::error!(task_id = %task_id, error = %error, "Rejected cancellation token");
                state.fail(error.to_string());
                return self
                    .finish(
                        task_id,
                        RunReport {
                            state,
                            paused_before: None,
                        },
                    )
                    .await;
            }
            Some(token) => {
                self.registry.register(token.clone());
                token
            }
            None => self.registry.get_or_create(task_id),
        };
        let _lease = TokenLease::new(self.registry.clone(), task_id);

        if state.metadata.thread_id.is_none() {
            state.metadata.thread_id = opts
                .thread_id
                .or_else(|| self.graph.checkpoints().map(|_| ThreadId::new_random()));
        }
        state.metadata.cancellation_token_id = Some(token.id());
        let timeout = opts.timeout.unwrap_or_else(|| self.graph.config().timeout());

        let report = if token.is_cancelled() {
            tracing::info!(task_id = %task_id, "Task was cancelled before it started");
            cancelled(state, &token)
        } else {
            events
                .emit(StageEvent::new(
                    EventKind::WorkflowStarted,
                    None,
                    json!({
                        "task_id": task_id,
                        "thread_id": state.metadata.thread_id,
                        "timeout_seconds": timeout.as_secs_f64(),
                    }),
                ))
                .await;

            let fallback = state.clone();
            let ctx = RunContext {
                cancel: &token,
                events: &events,
            };
            match tokio::time::timeout(timeout, self.graph.run(input(state), ctx)).await {
                Err(_) => {
                    tracing::warn!(
                        task_id = %task_id,
                        timeout_seconds = timeout.as_secs_f64(),
                        "Workflow timed out"
                    );
                    let mut state = fallback;
                    state.finish_with(
                        WorkflowStatus::Timeout,
                        format!("Workflow timed out after {} seconds", timeout.as_secs_f64()),
                    );
                    RunReport {
                        state,
                        paused_before: None,
                    }
                }
                Ok(Err(error)) => {
                    tracing::error!(task_id = %task_id, error = %error, "Workflow failed");
                    let mut state = fallback;
                    state.fail(error.to_string());
                    RunReport {
                        state,
                        paused_before: None,
                    }
                }
                Ok(Ok(GraphRun { state, .. })) if token.is_cancelled() => cancelled(state, &token),
                Ok(Ok(GraphRun {
                    state,
                    paused_before,
                    ..
                })) => RunReport {
                    state,
                    paused_before,
                },
            }
        };

        self.finish(task_id, report).await
    }

    /// Notifies the tracking sink; shared by every exit path.
    async fn finish(&self, task_id: TaskId, report: RunReport) -> RunReport {
        if let Err(e) = self
            .graph
            .tracking()
            .task_finished(task_id, report.state.status)
            .await
        {
            tracing::warn!(task_id = %task_id, error = %e, "Tracking cleanup failed");
        }
        tracing::info!(
            task_id = %task_id,
            status = %report.state.status,
            iterations = report.state.iterations,
            "Workflow finished"
        );
        report
    }
}

/// Cancels the task when an event stream is dropped before its terminal event.
struct CancelOnDrop {
    token: Option<Arc<CancellationToken>>,
}

impl CancelOnDrop {
    fn disarm(&mut self) {
        self.token = None;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            tracing::info!(task_id = %token.task_id(), "Event stream dropped; cancelling task");
            token.cancel("Event stream dropped");
        }
    }
}

fn cancelled(mut state: WorkflowState, token: &CancellationToken) -> RunReport {
    let reason = token
        .reason()
        .unwrap_or_else(|| "Cancelled".to_string());
    state.metadata.cancel_reason = Some(reason.clone());
    state.finish_with(WorkflowStatus::Cancelled, format!("Workflow cancelled: {reason}"));
    RunReport {
        state,
        paused_before: None,
    }
}

fn terminal_event(report: &RunReport) -> StageEvent {
    let state = &report.state;
    let payload = json!({
        "status": state.status,
        "iterations": state.iterations,
        "verdict": state.metadata.verdict,
        "error": state.error,
        "paused_before": report.paused_before,
        "thread_id": state.metadata.thread_id,
    });
    let kind = match state.status {
        WorkflowStatus::Timeout | WorkflowStatus::Error | WorkflowStatus::Cancelled => {
            EventKind::WorkflowError
        }
        _ => EventKind::WorkflowCompleted,
    };
    StageEvent::new(kind, None, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_event_kind_follows_status() {
        let mut state = WorkflowState::new(TaskId::new(1), "task");
        state.status = WorkflowStatus::Complete;
        let report = RunReport {
            state: state.clone(),
            paused_before: None,
        };
        assert_eq!(terminal_event(&report).kind, EventKind::WorkflowCompleted);

        state.status = WorkflowStatus::Timeout;
        let report = RunReport {
            state,
            paused_before: None,
        };
        let event = terminal_event(&report);
        assert_eq!(event.kind, EventKind::WorkflowError);
        assert_eq!(event.payload["status"], "timeout");
    }

    #[test]
    fn test_cancelled_state_records_reason() {
        let token = CancellationToken::new(TaskId::new(1));
        token.cancel("user pressed stop");
        let report = cancelled(WorkflowState::new(TaskId::new(1), "task"), &token);
        assert_eq!(report.state.status, WorkflowStatus::Cancelled);
        assert_eq!(report.state.metadata.cancel_reason.as_deref(), Some("user pressed stop"));
        assert!(report.state.error.unwrap().contains("user pressed stop"));
    }
}
