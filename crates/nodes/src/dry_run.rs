//! Deterministic offline stages.
//!
//! They let the `kiln` binary and the integration tests drive the whole
//! orchestration without an LLM provider. Output depends only on the state and
//! the options, so runs are reproducible.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pipeline::{
    Confidence, CouncilConfig, Issue, IssueSeverity, Judge, JudgeConfig, JudgeVerdict,
    PipelineError, Stage, StageContext, StageError, StageExecutor, StateUpdate, Verdict,
    WorkflowState,
};
use serde_json::{json, Map};

use crate::council_runner::{CouncilReviewer, CouncilRunner};
use crate::graph::StageRegistry;

/// Knobs for the dry-run stages.
#[derive(Debug, Clone)]
pub struct DryRunOptions {
    /// Simulated latency of every stage and judge call.
    pub latency: Duration,
    /// Number of revisions before the reviewer approves.
    pub approve_after: u32,
}

impl Default for DryRunOptions {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            approve_after: 1,
        }
    }
}

async fn simulate(latency: Duration) {
    if !latency.is_zero() {
        tokio::time::sleep(latency).await;
    }
}

/// Builds a registry of dry-run stages. With a council config, the reviewer
/// is a [`CouncilReviewer`] seated with [`DryRunJudge`]s.
pub fn stages(
    options: &DryRunOptions,
    council: Option<CouncilConfig>,
) -> Result<StageRegistry, PipelineError> {
    let reviewer: Arc<dyn StageExecutor> = match council {
        Some(config) => {
            let judge = Arc::new(DryRunJudge {
                options: options.clone(),
            });
            Arc::new(CouncilReviewer::new(CouncilRunner::new(config, judge)?))
        }
        None => Arc::new(DryRunReviewer {
            options: options.clone(),
        }),
    };
    Ok(StageRegistry::new()
        .with(Stage::Planner, Arc::new(DryRunPlanner { options: options.clone() }))
        .with(Stage::Coder, Arc::new(DryRunCoder { options: options.clone() }))
        .with(Stage::Tester, Arc::new(DryRunTester { options: options.clone() }))
        .with(Stage::Reviewer, reviewer))
}

#[derive(Debug, Clone)]
pub struct DryRunPlanner {
    pub options: DryRunOptions,
}

#[async_trait]
impl StageExecutor for DryRunPlanner {
    async fn execute(&self, state: &WorkflowState, _: &StageContext) -> Result<StateUpdate, StageError> {
        simulate(self.options.latency).await;
        let plan = format!(
            "1. Restate the task: {}\n2. Sketch the public interface\n3. Implement the core logic\n4. Cover edge cases with tests",
            state.task_description.trim()
        );
        Ok(StateUpdate::new().with_plan(plan))
    }
}

/// Writes a stub module; counts a revision when it runs straight after the reviewer.
#[derive(Debug, Clone)]
pub struct DryRunCoder {
    pub options: DryRunOptions,
}

#[async_trait]
impl StageExecutor for DryRunCoder {
    async fn execute(&self, state: &WorkflowState, _: &StageContext) -> Result<StateUpdate, StageError> {
        simulate(self.options.latency).await;
        let revision = if state.metadata.last_stage == Some(Stage::Reviewer) {
            state.iterations + 1
        } else {
            state.iterations
        };
        let code = format!(
            "//! {}\n// revision {revision}\n\npub fn solve() -> bool {{\n    true\n}}\n",
            state.task_description.lines().next().unwrap_or_default()
        );
        let mut files = pipeline::CodeFiles::new();
        files.insert("src/lib.rs".to_string(), code.clone());
        Ok(StateUpdate::new()
            .with_code(code)
            .with_code_files(files)
            .with_iterations(revision))
    }
}

#[derive(Debug, Clone)]
pub struct DryRunTester {
    pub options: DryRunOptions,
}

#[async_trait]
impl StageExecutor for DryRunTester {
    async fn execute(&self, state: &WorkflowState, _: &StageContext) -> Result<StateUpdate, StageError> {
        simulate(self.options.latency).await;
        let files = state.code_files.len().max(1);
        let mut analysis = Map::new();
        analysis.insert("tests_run".into(), json!(files * 3));
        analysis.insert("tests_failed".into(), json!(0));
        analysis.insert("files".into(), json!(files));
        Ok(StateUpdate::new()
            .with_test_results(format!("{} passed; 0 failed", files * 3))
            .with_test_analysis(analysis))
    }
}

/// Single reviewer: asks for revisions until `approve_after` is reached.
#[derive(Debug, Clone)]
pub struct DryRunReviewer {
    pub options: DryRunOptions,
}

#[async_trait]
impl StageExecutor for DryRunReviewer {
    async fn execute(&self, state: &WorkflowState, _: &StageContext) -> Result<StateUpdate, StageError> {
        simulate(self.options.latency).await;
        let feedback = if state.iterations >= self.options.approve_after {
            "APPROVE - the change matches the plan and tests pass.".to_string()
        } else {
            format!(
                "REVISE - revision {} needs clearer error handling.",
                state.iterations
            )
        };
        Ok(StateUpdate::new().with_review_feedback(feedback))
    }
}

/// Judge that mirrors [`DryRunReviewer`]'s decision with a fixed confidence.
#[derive(Debug, Clone)]
pub struct DryRunJudge {
    pub options: DryRunOptions,
}

#[async_trait]
impl Judge for DryRunJudge {
    async fn evaluate(&self, config: &JudgeConfig, state: &WorkflowState) -> Result<JudgeVerdict, StageError> {
        simulate(self.options.latency).await;
        let approve = state.iterations >= self.options.approve_after;
        let (verdict, confidence) = if approve {
            (Verdict::Approve, Confidence::clamped(0.9))
        } else {
            (Verdict::Revise, Confidence::clamped(0.6))
        };
        let mut out = JudgeVerdict::new(config.name.clone(), verdict, confidence);
        out.reasoning = format!("{} reviewed revision {}", config.persona, state.iterations);
        if approve {
            out.strengths.push("Plan and code agree".to_string());
        } else {
            out.issues.push(Issue {
                severity: IssueSeverity::Medium,
                category: config.name.to_string(),
                description: "Error paths are not covered".to_string(),
            });
            out.action_items.push("Handle and test error paths".to_string());
        }
        Ok(out)
    }
}
