//! Pausing for human approval and resuming afterwards.
//!
//! The graph pauses before any stage named by an active interrupt point and
//! checkpoints the state with that stage pending. [`InterruptController`]
//! inspects paused runs and resumes them: `continue`, `approve` and `modify`
//! merge the caller's modifications into the checkpoint and carry on from the
//! pending stage; `reject` persists a cancelled status and stops.

use std::sync::Arc;

use pipeline::{
    interrupt_status, Checkpoint, CheckpointStore, InterruptStatus, MetadataPatch, PipelineError,
    ResumeAction, Stage, StateUpdate, ThreadId, WorkflowState, WorkflowStatus,
};

use crate::coordinator::{ExecutionCoordinator, InvokeOptions, RunReport};

#[derive(Clone)]
pub struct InterruptController {
    coordinator: ExecutionCoordinator,
    store: Arc<dyn CheckpointStore>,
}

impl std::fmt::Debug for InterruptController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptController")
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

impl InterruptController {
    /// Fails when the coordinator's graph has no checkpoint store.
    pub fn new(coordinator: ExecutionCoordinator) -> Result<Self, PipelineError> {
        let store = coordinator
            .graph()
            .checkpoints()
            .cloned()
            .ok_or_else(|| PipelineError::config("interrupts require a checkpoint store"))?;
        Ok(Self { coordinator, store })
    }

    /// Where the checkpointed run for `thread_id` stands and what it awaits.
    pub async fn status(&self, thread_id: ThreadId) -> Result<InterruptStatus, PipelineError> {
        let (state, checkpoint_pending) = self.load(thread_id).await?;
        Ok(interrupt_status(&state, &checkpoint_pending))
    }

    /// Resumes a paused run.
    pub async fn resume(
        &self,
        thread_id: ThreadId,
        modifications: Option<StateUpdate>,
        action: ResumeAction,
    ) -> Result<WorkflowState, PipelineError> {
        self.resume_report(thread_id, modifications, action)
            .await
            .map(|report| report.state)
    }

    /// Like [`resume`](Self::resume), but also reports a further pause.
    pub async fn resume_report(
        &self,
        thread_id: ThreadId,
        modifications: Option<StateUpdate>,
        action: ResumeAction,
    ) -> Result<RunReport, PipelineError> {
        self.resume_with(thread_id, modifications, action, InvokeOptions::default())
            .await
    }

    /// Like [`resume_report`](Self::resume_report), with per-call options for
    /// the continued run. `opts.thread_id` is ignored.
    pub async fn resume_with(
        &self,
        thread_id: ThreadId,
        modifications: Option<StateUpdate>,
        action: ResumeAction,
        opts: InvokeOptions,
    ) -> Result<RunReport, PipelineError> {
        let (mut state, pending) = self.load(thread_id).await?;
        let Some(&paused_at) = pending.first() else {
            return Err(PipelineError::InvalidResume {
                message: format!("thread {thread_id} is not paused"),
            });
        };
        if state.status.is_terminal() {
            return Err(PipelineError::InvalidResume {
                message: format!("thread {thread_id} already finished with status {}", state.status),
            });
        }
        tracing::info!(
            task_id = %state.task_id,
            thread_id = %thread_id,
            stage = %paused_at,
            action = %action,
            "Resume requested"
        );

        if action == ResumeAction::Reject {
            let reason = format!("Rejected by reviewer before {paused_at}");
            state.apply(StateUpdate {
                status: Some(WorkflowStatus::Cancelled),
                error: Some(reason.clone()),
                metadata: Some(MetadataPatch {
                    cancel_reason: Some(reason),
                    rejected_stage: Some(paused_at),
                    ..MetadataPatch::default()
                }),
                ..StateUpdate::default()
            });
            self.store
                .save(
                    thread_id,
                    Checkpoint {
                        values: state.to_checkpoint()?,
                        pending: Vec::new(),
                    },
                )
                .await?;
            return Ok(RunReport {
                state,
                paused_before: None,
            });
        }

        match modifications {
            Some(update) if !update.is_empty() => {
                tracing::info!(thread_id = %thread_id, changes = %update.summary(), "Applying modifications");
                self.store.update_state(thread_id, update.clone()).await?;
                state.apply(update);
            }
            _ if action == ResumeAction::Modify => {
                tracing::warn!(thread_id = %thread_id, "Modify requested without modifications; continuing");
            }
            _ => {}
        }

        Ok(self.coordinator.resume_thread(state, thread_id, opts).await)
    }

    async fn load(&self, thread_id: ThreadId) -> Result<(WorkflowState, Vec<Stage>), PipelineError> {
        let checkpoint = self
            .store
            .get_state(thread_id)
            .await?
            .ok_or(PipelineError::CheckpointNotFound { thread_id })?;
        let state = WorkflowState::from_checkpoint(checkpoint.values)?;
        Ok((state, checkpoint.pending))
    }
}
