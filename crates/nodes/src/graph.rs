//! The workflow graph executor.
//!
//! Drives the fixed stage set `{planner, coder, tester, reviewer}` in the order
//! chosen by the configured [`Topology`], merging each stage's partial update
//! into the running state before routing. Every stage call goes through a
//! [`ResilientStage`]; a fallback escalation re-runs the stage on the weaker
//! model tier, any other escalation ends the run with the failure recorded on
//! the state.
//!
//! When a checkpoint store is configured, the state is persisted after every
//! stage together with the stage that would run next, and the run pauses
//! before any stage named by an active interrupt point.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use pipeline::{
    route_after, supervise, Checkpoint, CheckpointStore, EngineConfig, ErrorHandler, Next,
    NoopTracking, PipelineError, Stage, StageError, StageExecutor, StateUpdate, ThreadId,
    Topology, TrackingSink, WorkflowState, WorkflowStatus,
};
use serde_json::json;
use tracing::Instrument;

use crate::cancellation::CancellationToken;
use crate::events::{EventEmitter, EventKind, StageEvent};
use crate::resilient::{ResilientStage, StageEscalation};

// ---------------------------------------------------------------------------
// Stage registry
// ---------------------------------------------------------------------------

/// Stage implementations keyed by stage, built once at startup.
#[derive(Clone, Default)]
pub struct StageRegistry {
    stages: HashMap<Stage, Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, stage: Stage, executor: Arc<dyn StageExecutor>) -> Self {
        self.stages.insert(stage, executor);
        self
    }

    pub fn register(&mut self, stage: Stage, executor: Arc<dyn StageExecutor>) {
        self.stages.insert(stage, executor);
    }

    pub fn get(&self, stage: Stage) -> Option<&Arc<dyn StageExecutor>> {
        self.stages.get(&stage)
    }

    fn validate(&self) -> Result<(), PipelineError> {
        let missing: Vec<&str> = Stage::ALL
            .iter()
            .filter(|s| !self.stages.contains_key(s))
            .map(|s| s.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::config(format!(
                "no executor registered for stage(s): {}",
                missing.join(", ")
            )))
        }
    }
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut stages: Vec<&Stage> = self.stages.keys().collect();
        stages.sort();
        f.debug_struct("StageRegistry").field("stages", &stages).finish()
    }
}

// ---------------------------------------------------------------------------
// Run input and outcome
// ---------------------------------------------------------------------------

/// What the graph is asked to run.
#[derive(Debug, Clone)]
pub enum GraphInput {
    /// Start a new run from this state.
    Fresh(WorkflowState),
    /// Continue the checkpointed run for this thread from its pending stage.
    Resume(ThreadId),
}

/// Result of one graph run.
#[derive(Debug, Clone)]
pub struct GraphRun {
    pub state: WorkflowState,
    /// Set when the run paused at an interrupt point.
    pub paused_before: Option<Stage>,
    /// Set when the run stopped because its cancellation token fired.
    pub cancelled: bool,
}

/// Per-run collaborators threaded through the graph.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub cancel: &'a CancellationToken,
    pub events: &'a EventEmitter,
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

pub struct WorkflowGraph {
    stages: StageRegistry,
    config: EngineConfig,
    pause_before: BTreeSet<Stage>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    tracking: Arc<dyn TrackingSink>,
}

impl std::fmt::Debug for WorkflowGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowGraph")
            .field("stages", &self.stages)
            .field("topology", &self.config.topology)
            .field("pause_before", &self.pause_before)
            .field("checkpointing", &self.checkpoints.is_some())
            .finish()
    }
}

impl WorkflowGraph {
    /// Builds a graph, failing fast on an invalid configuration, a missing
    /// stage executor, or interrupt points without a checkpoint store.
    pub fn new(
        stages: StageRegistry,
        config: EngineConfig,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        stages.validate()?;
        let pause_before = config.interrupts.pause_before();
        if !pause_before.is_empty() && checkpoints.is_none() {
            return Err(PipelineError::config(
                "interrupt points require a checkpoint store",
            ));
        }
        Ok(Self {
            stages,
            config,
            pause_before,
            checkpoints,
            tracking: Arc::new(NoopTracking),
        })
    }

    pub fn with_tracking(mut self, tracking: Arc<dyn TrackingSink>) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> Option<&Arc<dyn CheckpointStore>> {
        self.checkpoints.as_ref()
    }

    pub fn tracking(&self) -> &Arc<dyn TrackingSink> {
        &self.tracking
    }

    /// Runs the graph from START, or from a checkpoint's pending stage.
    pub async fn run(
        &self,
        input: GraphInput,
        ctx: RunContext<'_>,
    ) -> Result<GraphRun, PipelineError> {
        match input {
            GraphInput::Fresh(mut state) => {
                if self.checkpoints.is_some() && state.metadata.thread_id.is_none() {
                    state.metadata.thread_id = Some(ThreadId::new_random());
                }
                let first = match self.config.topology {
                    Topology::Linear => Next::Stage(Stage::Planner),
                    Topology::Supervised => {
                        supervise(&mut state, self.config.max_review_iterations)
                    }
                };
                self.drive(state, first, false, ctx).await
            }
            GraphInput::Resume(thread_id) => {
                let store = self.checkpoints.as_ref().ok_or_else(|| {
                    PipelineError::config("resuming requires a checkpoint store")
                })?;
                let checkpoint = store
                    .get_state(thread_id)
                    .await?
                    .ok_or(PipelineError::CheckpointNotFound { thread_id })?;
                let Some(&next) = checkpoint.pending.first() else {
                    return Err(PipelineError::InvalidResume {
                        message: format!("thread {thread_id} has no pending stage"),
                    });
                };
                let state = WorkflowState::from_checkpoint(checkpoint.values)?;
                tracing::info!(
                    task_id = %state.task_id,
                    thread_id = %thread_id,
                    stage = %next,
                    "Resuming from checkpoint"
                );
                self.drive(state, Next::Stage(next), true, ctx).await
            }
        }
    }

    async fn drive(
        &self,
        mut state: WorkflowState,
        mut next: Next,
        mut resuming: bool,
        ctx: RunContext<'_>,
    ) -> Result<GraphRun, PipelineError> {
        let handler = ErrorHandler::new(self.config.recovery.clone());
        let max = self.config.max_review_iterations;

        while let Next::Stage(stage) = next {
            if ctx.cancel.is_cancelled() {
                tracing::info!(task_id = %state.task_id, stage = %stage, "Cancelled before stage");
                return Ok(GraphRun {
                    state,
                    paused_before: None,
                    cancelled: true,
                });
            }

            if !resuming && self.pause_before.contains(&stage) {
                self.checkpoint(&state, vec![stage]).await?;
                tracing::info!(task_id = %state.task_id, stage = %stage, "Paused for approval");
                ctx.events
                    .emit(StageEvent::for_stage(
                        EventKind::Interrupted,
                        stage,
                        json!({ "thread_id": state.metadata.thread_id, "pending": [stage] }),
                    ))
                    .await;
                return Ok(GraphRun {
                    state,
                    paused_before: Some(stage),
                    cancelled: false,
                });
            }
            resuming = false;

            let revising = stage == Stage::Coder && state.metadata.last_stage == Some(Stage::Reviewer);
            let iterations_before = state.iterations;

            let span = tracing::info_span!("stage", task_id = %state.task_id, stage = %stage);
            let outcome = self.run_stage(stage, &mut state, &handler, ctx).instrument(span).await;

            match outcome {
                Ok(()) => {
                    if revising && state.iterations == iterations_before {
                        tracing::debug!(
                            task_id = %state.task_id,
                            "Coder did not record the revision; counting it"
                        );
                        state.iterations += 1;
                    }
                }
                Err(StageEscalation::Cancelled) => {
                    return Ok(GraphRun {
                        state,
                        paused_before: None,
                        cancelled: true,
                    });
                }
                Err(StageEscalation::Fatal(error) | StageEscalation::Fallback { error, .. }) => {
                    state.fail(format!("{stage} stage failed: {error}"));
                }
            }

            next = match self.config.topology {
                Topology::Linear => route_after(stage, &mut state, max),
                Topology::Supervised => supervise(&mut state, max),
            };

            let pending = match next {
                Next::Stage(s) => vec![s],
                Next::End => Vec::new(),
            };
            if !pending.is_empty() {
                self.checkpoint(&state, pending).await?;
            }
        }

        if !state.status.is_terminal() {
            state.status = WorkflowStatus::Complete;
        }
        self.checkpoint(&state, Vec::new()).await?;
        tracing::info!(
            task_id = %state.task_id,
            status = %state.status,
            iterations = state.iterations,
            "Workflow reached END"
        );
        Ok(GraphRun {
            state,
            paused_before: None,
            cancelled: false,
        })
    }

    /// Runs one stage to completion, following fallbacks, and merges its update.
    async fn run_stage(
        &self,
        stage: Stage,
        state: &mut WorkflowState,
        handler: &ErrorHandler,
        ctx: RunContext<'_>,
    ) -> Result<(), StageEscalation> {
        let executor = self.stages.get(stage).ok_or_else(|| {
            StageEscalation::Fatal(StageError::new(
                "ConfigurationError",
                format!("no executor for {stage}"),
            ))
        })?;

        state.apply(StateUpdate::new().with_status(in_progress_status(stage)));

        let mut tier = self.config.model_tier(stage);
        let started = json!({
            "iterations": state.iterations,
            "status": state.status,
            "model_tier": tier,
        });
        if let Err(e) = self.tracking.stage_started(state.task_id, stage, &started).await {
            tracing::warn!(task_id = %state.task_id, stage = %stage, error = %e, "Tracking sink failed");
        }
        ctx.events
            .emit(StageEvent::for_stage(EventKind::StageStarted, stage, started))
            .await;

        let resilient = ResilientStage {
            stage,
            executor: &**executor,
            handler,
            cancel: ctx.cancel,
            events: ctx.events,
        };

        let result = loop {
            match resilient.run(state, tier).await {
                Err(StageEscalation::Fallback { tier: weaker, error }) => {
                    tracing::warn!(
                        task_id = %state.task_id,
                        stage = %stage,
                        from = %tier,
                        to = %weaker,
                        error = %error,
                        "Falling back to weaker model tier"
                    );
                    ctx.events
                        .emit(StageEvent::for_stage(
                            EventKind::StageRetry,
                            stage,
                            json!({ "fallback_from": tier, "fallback_to": weaker, "error": error.to_string() }),
                        ))
                        .await;
                    handler.reset_stage(stage);
                    tier = weaker;
                }
                other => break other,
            }
        };

        match result {
            Ok(update) => {
                let summary = update.summary();
                state.apply(update);
                state.metadata.last_stage = Some(stage);
                if let Err(e) = self.tracking.stage_finished(state.task_id, stage, &summary).await {
                    tracing::warn!(task_id = %state.task_id, stage = %stage, error = %e, "Tracking sink failed");
                }
                ctx.events
                    .emit(StageEvent::for_stage(EventKind::StageOutput, stage, summary))
                    .await;
                ctx.events
                    .emit(StageEvent::for_stage(
                        EventKind::StageCompleted,
                        stage,
                        json!({ "status": state.status, "iterations": state.iterations }),
                    ))
                    .await;
                Ok(())
            }
            Err(escalation) => {
                state.metadata.last_stage = Some(stage);
                if let StageEscalation::Fatal(error) = &escalation {
                    if let Err(e) = self.tracking.stage_failed(state.task_id, stage, error).await {
                        tracing::warn!(task_id = %state.task_id, stage = %stage, error = %e, "Tracking sink failed");
                    }
                    ctx.events
                        .emit(StageEvent::for_stage(
                            EventKind::StageFailed,
                            stage,
                            json!({ "error": error.to_string() }),
                        ))
                        .await;
                }
                Err(escalation)
            }
        }
    }

    async fn checkpoint(&self, state: &WorkflowState, pending: Vec<Stage>) -> Result<(), PipelineError> {
        let (Some(store), Some(thread_id)) = (&self.checkpoints, state.metadata.thread_id) else {
            return Ok(());
        };
        let checkpoint = Checkpoint {
            values: state.to_checkpoint()?,
            pending,
        };
        store.save(thread_id, checkpoint).await?;
        Ok(())
    }
}

/// Status shown while `stage` runs.
fn in_progress_status(stage: Stage) -> WorkflowStatus {
    match stage {
        Stage::Planner => WorkflowStatus::Planning,
        Stage::Coder => WorkflowStatus::Coding,
        Stage::Tester => WorkflowStatus::Testing,
        Stage::Reviewer => WorkflowStatus::Reviewing,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use pipeline::{ModelTier, StageContext, TaskId, Verdict};

    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;

    struct Fixed(StateUpdate);

    #[async_trait]
    impl StageExecutor for Fixed {
        async fn execute(&self, _: &WorkflowState, _: &StageContext) -> Result<StateUpdate, StageError> {
            Ok(self.0.clone())
        }
    }

    /// Always asks for a revision.
    struct Reviser;

    #[async_trait]
    impl StageExecutor for Reviser {
        async fn execute(&self, _: &WorkflowState, _: &StageContext) -> Result<StateUpdate, StageError> {
            Ok(StateUpdate::new().with_review_feedback("REVISE - fix X"))
        }
    }

    /// Records the tier of every call and times out on anything above haiku.
    #[derive(Default)]
    struct TierSensitive {
        tiers: Mutex<Vec<ModelTier>>,
    }

    #[async_trait]
    impl StageExecutor for TierSensitive {
        async fn execute(&self, _: &WorkflowState, ctx: &StageContext) -> Result<StateUpdate, StageError> {
            self.tiers.lock().unwrap().push(ctx.model_tier);
            if ctx.model_tier == ModelTier::Haiku {
                Ok(StateUpdate::new().with_plan("small plan"))
            } else {
                Err(StageError::new("TimeoutError", "timed out"))
            }
        }
    }

    struct Counting(AtomicU32);

    #[async_trait]
    impl StageExecutor for Counting {
        async fn execute(&self, _: &WorkflowState, _: &StageContext) -> Result<StateUpdate, StageError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(StateUpdate::new().with_test_results("ok"))
        }
    }

    fn registry(reviewer: Arc<dyn StageExecutor>) -> StageRegistry {
        StageRegistry::new()
            .with(Stage::Planner, Arc::new(Fixed(StateUpdate::new().with_plan("1. do it"))))
            .with(Stage::Coder, Arc::new(Fixed(StateUpdate::new().with_code("fn x() {}"))))
            .with(Stage::Tester, Arc::new(Fixed(StateUpdate::new().with_test_results("ok"))))
            .with(Stage::Reviewer, reviewer)
    }

    async fn run(graph: &WorkflowGraph, state: WorkflowState) -> GraphRun {
        let cancel = CancellationToken::new(state.task_id);
        let events = EventEmitter::detached();
        graph
            .run(GraphInput::Fresh(state), RunContext { cancel: &cancel, events: &events })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_approved_run_completes() {
        let reviewer = Fixed(StateUpdate::new().with_verdict(Verdict::Approve, 0.9));
        let graph = WorkflowGraph::new(registry(Arc::new(reviewer)), EngineConfig::default(), None).unwrap();

        let run = run(&graph, WorkflowState::new(TaskId::new(1), "task")).await;

        assert_eq!(run.state.status, WorkflowStatus::Complete);
        assert_eq!(run.state.iterations, 0);
        assert_eq!(run.state.metadata.last_stage, Some(Stage::Reviewer));
    }

    #[tokio::test]
    async fn test_revision_loop_is_bounded_by_iteration_cap() {
        let graph = WorkflowGraph::new(registry(Arc::new(Reviser)), EngineConfig::default(), None).unwrap();

        let run = run(&graph, WorkflowState::new(TaskId::new(1), "task")).await;

        assert_eq!(run.state.iterations, 3);
        assert_eq!(run.state.status, WorkflowStatus::Complete);
        assert!(run.state.review_feedback.contains("Maximum review iterations (3) reached"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_reruns_stage_on_weaker_tier() {
        let planner = Arc::new(TierSensitive::default());
        let mut config = EngineConfig::default();
        config.stage_model_tiers.insert(Stage::Planner, ModelTier::Opus);
        let reviewer = Fixed(StateUpdate::new().with_verdict(Verdict::Approve, 0.9));
        let stages = registry(Arc::new(reviewer)).with(Stage::Planner, planner.clone());
        let graph = WorkflowGraph::new(stages, config, None).unwrap();

        let run = run(&graph, WorkflowState::new(TaskId::new(1), "task")).await;

        assert_eq!(run.state.plan, "small plan");
        let tiers = planner.tiers.lock().unwrap();
        // 1 + 3 retries per tier before each fallback.
        assert_eq!(tiers.iter().filter(|t| **t == ModelTier::Opus).count(), 4);
        assert_eq!(tiers.iter().filter(|t| **t == ModelTier::Sonnet).count(), 4);
        assert_eq!(tiers.last(), Some(&ModelTier::Haiku));
    }

    #[tokio::test]
    async fn test_fatal_stage_error_ends_run_with_error() {
        struct Broken;
        #[async_trait]
        impl StageExecutor for Broken {
            async fn execute(&self, _: &WorkflowState, _: &StageContext) -> Result<StateUpdate, StageError> {
                Err(StageError::new("AuthError", "invalid api key"))
            }
        }
        let tester = Arc::new(Counting(AtomicU32::new(0)));
        let stages = registry(Arc::new(Reviser))
            .with(Stage::Coder, Arc::new(Broken))
            .with(Stage::Tester, tester.clone());
        let graph = WorkflowGraph::new(stages, EngineConfig::default(), None).unwrap();

        let run = run(&graph, WorkflowState::new(TaskId::new(1), "task")).await;

        assert_eq!(run.state.status, WorkflowStatus::Error);
        assert!(run.state.error.as_deref().unwrap().contains("coder stage failed"));
        assert_eq!(tester.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_supervised_topology_skips_tester_for_simple_plan() {
        let tester = Arc::new(Counting(AtomicU32::new(0)));
        let reviewer = Fixed(StateUpdate::new().with_verdict(Verdict::Approve, 0.9));
        let stages = registry(Arc::new(reviewer)).with(Stage::Tester, tester.clone());
        let config = EngineConfig {
            topology: Topology::Supervised,
            ..EngineConfig::default()
        };
        let graph = WorkflowGraph::new(stages, config, None).unwrap();

        let run = run(&graph, WorkflowState::new(TaskId::new(1), "rename a field")).await;

        assert_eq!(run.state.status, WorkflowStatus::Complete);
        assert_eq!(tester.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_next_stage() {
        let graph = WorkflowGraph::new(registry(Arc::new(Reviser)), EngineConfig::default(), None).unwrap();
        let cancel = CancellationToken::new(TaskId::new(1));
        cancel.cancel("stop");
        let events = EventEmitter::detached();

        let run = graph
            .run(
                GraphInput::Fresh(WorkflowState::new(TaskId::new(1), "task")),
                RunContext { cancel: &cancel, events: &events },
            )
            .await
            .unwrap();

        assert!(run.cancelled);
        assert!(run.state.plan.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoints_final_state_with_no_pending_stage() {
        let store = Arc::new(InMemoryCheckpointStore::new());
        let reviewer = Fixed(StateUpdate::new().with_verdict(Verdict::Approve, 0.9));
        let graph = WorkflowGraph::new(
            registry(Arc::new(reviewer)),
            EngineConfig::default(),
            Some(store.clone()),
        )
        .unwrap();

        let run = run(&graph, WorkflowState::new(TaskId::new(1), "task")).await;

        let thread = run.state.metadata.thread_id.unwrap();
        let checkpoint = store.get_state(thread).await.unwrap().unwrap();
        assert!(checkpoint.is_finished());
        assert_eq!(WorkflowState::from_checkpoint(checkpoint.values).unwrap(), run.state);
    }

    #[test]
    fn test_missing_stage_fails_construction() {
        let stages = StageRegistry::new().with(Stage::Planner, Arc::new(Reviser));
        let err = WorkflowGraph::new(stages, EngineConfig::default(), None).unwrap_err();
        assert!(err.to_string().contains("coder"));
    }

    #[test]
    fn test_interrupts_without_store_fail_construction() {
        let mut config = EngineConfig::default();
        config.interrupts.active = vec![pipeline::InterruptPointName::new("plan_approval").unwrap()];
        let err = WorkflowGraph::new(registry(Arc::new(Reviser)), config, None).unwrap_err();
        assert!(matches!(err, PipelineError::ConfigurationError { .. }));
    }
}
