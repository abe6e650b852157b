//! Concurrent judge invocation and the council-backed reviewer stage.
//!
//! Every judge on the panel is called concurrently against the same state.
//! A judge that fails is replaced by a conservative REVISE verdict, so the
//! aggregate always covers the full panel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use pipeline::{
    aggregate, CouncilConfig, CouncilResult, Judge, JudgeConfig, JudgeName, JudgeVerdict,
    PipelineError, StageContext, StageError, StageExecutor, StateUpdate, WorkflowState,
    WorkflowStatus,
};
use tokio::time::Instant;
use tracing::Instrument;

/// Runs a council review: one judge call per seat, then aggregation.
pub struct CouncilRunner {
    config: CouncilConfig,
    default_judge: Arc<dyn Judge>,
    seats: HashMap<JudgeName, Arc<dyn Judge>>,
}

impl std::fmt::Debug for CouncilRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouncilRunner")
            .field("config", &self.config)
            .field("dedicated_seats", &self.seats.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CouncilRunner {
    /// Creates a runner that calls `default_judge` for every seat.
    pub fn new(config: CouncilConfig, default_judge: Arc<dyn Judge>) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            default_judge,
            seats: HashMap::new(),
        })
    }

    /// Routes one seat to a dedicated judge implementation.
    pub fn with_judge(mut self, name: JudgeName, judge: Arc<dyn Judge>) -> Result<Self, PipelineError> {
        if self.config.judge(&name).is_none() {
            return Err(PipelineError::config(format!("no council seat named '{name}'")));
        }
        self.seats.insert(name, judge);
        Ok(self)
    }

    pub fn config(&self) -> &CouncilConfig {
        &self.config
    }

    pub async fn review(&self, state: &WorkflowState) -> CouncilResult {
        let started = Instant::now();
        let calls = self.config.judges.iter().map(|seat| {
            let judge = self.seats.get(&seat.name).unwrap_or(&self.default_judge);
            let span = tracing::debug_span!("judge", judge = %seat.name);
            evaluate_seat(&**judge, seat, state).instrument(span)
        });
        let verdicts = join_all(calls).await;

        let mut result = aggregate(&self.config, verdicts);
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            task_id = %state.task_id,
            verdict = %result.final_verdict,
            consensus = %result.consensus_type,
            confidence = result.confidence_score.as_f64(),
            dissenting = result.dissenting_opinions.len(),
            elapsed_ms = result.elapsed_ms,
            "Council review complete"
        );
        result
    }
}

async fn evaluate_seat(judge: &dyn Judge, seat: &JudgeConfig, state: &WorkflowState) -> JudgeVerdict {
    let started = Instant::now();
    match judge.evaluate(seat, state).await {
        Ok(mut verdict) => {
            if verdict.judge_name != seat.name {
                tracing::warn!(
                    seat = %seat.name,
                    reported = %verdict.judge_name,
                    "Judge reported a different name; using the seat name"
                );
                verdict.judge_name = seat.name.clone();
            }
            if verdict.usage.latency_ms == 0 {
                verdict.usage.latency_ms = started.elapsed().as_millis() as u64;
            }
            verdict
        }
        Err(error) => {
            tracing::warn!(judge = %seat.name, error = %error, "Judge failed; recording conservative verdict");
            let mut verdict = JudgeVerdict::from_failure(seat.name.clone(), &error);
            verdict.usage.latency_ms = started.elapsed().as_millis() as u64;
            verdict
        }
    }
}

/// Reviewer stage backed by a council.
///
/// Writes the conclusion to `review_feedback` and the structured verdict,
/// confidence and council detail to the metadata, where the router prefers
/// them over free-text scanning.
#[derive(Debug)]
pub struct CouncilReviewer {
    runner: CouncilRunner,
}

impl CouncilReviewer {
    pub fn new(runner: CouncilRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl StageExecutor for CouncilReviewer {
    async fn execute(
        &self,
        state: &WorkflowState,
        _ctx: &StageContext,
    ) -> Result<StateUpdate, StageError> {
        let result = self.runner.review(state).await;
        Ok(StateUpdate::new()
            .with_status(WorkflowStatus::Reviewing)
            .with_review_feedback(result.conclusion.clone())
            .with_verdict(result.final_verdict, result.confidence_score.as_f64())
            .with_council_detail(result.detail()))
    }
}
