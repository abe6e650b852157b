//! Port traits implemented by external collaborators.
//!
//! The engine depends only on these seams. Stage executors and judges wrap an
//! LLM provider; checkpoint stores wrap a persistence engine; tracking sinks wrap
//! a metrics backend. None of those concerns live in this workspace beyond the
//! in-memory and dry-run adapters in the `nodes` crate.
//!
//! | Trait | Consumed by | Failure policy |
//! |-------|-------------|----------------|
//! | [`StageExecutor`] | Graph executor (through the resilient wrapper) | Classified and recovered |
//! | [`Judge`] | Council runner | Converted to a conservative verdict |
//! | [`CheckpointStore`] | Graph executor, interrupt controller | Surfaced as [`crate::PipelineError`] |
//! | [`TrackingSink`] | Graph executor, coordinator | Logged and ignored |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    CheckpointError, JudgeConfig, JudgeVerdict, ModelTier, Stage, StageError, StateUpdate,
    TaskId, ThreadId, TrackingError, WorkflowState, WorkflowStatus,
};

// ---------------------------------------------------------------------------
// Stages and judges
// ---------------------------------------------------------------------------

/// Per-call context handed to a stage executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageContext {
    pub stage: Stage,
    /// Model tier the stage should use for this attempt. Changes when the
    /// recovery policy falls back to a weaker tier.
    pub model_tier: ModelTier,
    /// 1-based attempt number within the current tier.
    pub attempt: u32,
}

/// One pipeline stage: reads the state, returns a partial update.
///
/// Implementations never see the graph topology.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    async fn execute(
        &self,
        state: &WorkflowState,
        ctx: &StageContext,
    ) -> Result<StateUpdate, StageError>;
}

/// One council judge.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate(
        &self,
        config: &JudgeConfig,
        state: &WorkflowState,
    ) -> Result<JudgeVerdict, StageError>;
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

/// Persisted snapshot of a paused or finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// State in its checkpoint (map-of-primitives) form.
    pub values: Map<String, Value>,
    /// Stages that will run next on resume. Empty once the run has ended.
    #[serde(default)]
    pub pending: Vec<Stage>,
}

impl Checkpoint {
    pub fn is_finished(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Opaque key-value store for checkpoints, keyed by thread id.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns the latest checkpoint for `thread_id`, if any.
    async fn get_state(&self, thread_id: ThreadId) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Merges `update` into the persisted values, keeping the pending stages.
    async fn update_state(
        &self,
        thread_id: ThreadId,
        update: StateUpdate,
    ) -> Result<(), CheckpointError>;

    /// Replaces the checkpoint for `thread_id`.
    async fn save(&self, thread_id: ThreadId, checkpoint: Checkpoint)
        -> Result<(), CheckpointError>;
}

// ---------------------------------------------------------------------------
// Tracking
// ---------------------------------------------------------------------------

/// External tracking/metrics sink.
///
/// Payloads are summaries (sizes, field names), never full state content.
#[async_trait]
pub trait TrackingSink: Send + Sync {
    async fn stage_started(
        &self,
        task_id: TaskId,
        stage: Stage,
        summary: &Value,
    ) -> Result<(), TrackingError>;

    async fn stage_finished(
        &self,
        task_id: TaskId,
        stage: Stage,
        summary: &Value,
    ) -> Result<(), TrackingError>;

    async fn stage_failed(
        &self,
        task_id: TaskId,
        stage: Stage,
        error: &StageError,
    ) -> Result<(), TrackingError>;

    /// Called once on every exit path of a run so the sink can release
    /// whatever it holds for the task.
    async fn task_finished(
        &self,
        task_id: TaskId,
        status: WorkflowStatus,
    ) -> Result<(), TrackingError>;
}

/// Sink that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracking;

#[async_trait]
impl TrackingSink for NoopTracking {
    async fn stage_started(&self, _: TaskId, _: Stage, _: &Value) -> Result<(), TrackingError> {
        Ok(())
    }

    async fn stage_finished(&self, _: TaskId, _: Stage, _: &Value) -> Result<(), TrackingError> {
        Ok(())
    }

    async fn stage_failed(&self, _: TaskId, _: Stage, _: &StageError) -> Result<(), TrackingError> {
        Ok(())
    }

    async fn task_finished(&self, _: TaskId, _: WorkflowStatus) -> Result<(), TrackingError> {
        Ok(())
    }
}
