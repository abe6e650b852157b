//! Human-in-the-loop interrupt points and resume actions.
//!
//! An interrupt point is a named set of stages the graph pauses *before*. When a
//! run is paused, [`interrupt_status`] reports what kind of input it is waiting
//! for; the caller then resumes it with a [`ResumeAction`].

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{InterruptPointName, PipelineError, Stage, WorkflowState, WorkflowStatus};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Named interrupt points and which of them are active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptConfig {
    pub points: BTreeMap<InterruptPointName, BTreeSet<Stage>>,
    /// Points that are switched on for a run. Empty means never pause.
    pub active: Vec<InterruptPointName>,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        let mut points = BTreeMap::new();
        for (name, stage) in [
            ("plan_approval", Stage::Coder),
            ("code_review", Stage::Tester),
            ("test_review", Stage::Reviewer),
        ] {
            if let Some(name) = InterruptPointName::new(name) {
                points.insert(name, BTreeSet::from([stage]));
            }
        }
        Self {
            points,
            active: Vec::new(),
        }
    }
}

impl InterruptConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        for name in &self.active {
            if !self.points.contains_key(name) {
                return Err(PipelineError::config(format!(
                    "Unknown interrupt point '{name}'"
                )));
            }
        }
        Ok(())
    }

    /// Union of the stages named by every active point.
    pub fn pause_before(&self) -> BTreeSet<Stage> {
        self.active
            .iter()
            .filter_map(|name| self.points.get(name))
            .flatten()
            .copied()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Status inference
// ---------------------------------------------------------------------------

/// The input a paused run is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AwaitedInput {
    PlanApproval,
    CodeReview,
    TestReview,
    ReviewOverride,
}

impl AwaitedInput {
    /// The input expected when the run is paused before `stage`.
    pub fn before(stage: Stage) -> Option<Self> {
        match stage {
            Stage::Planner => None,
            Stage::Coder => Some(AwaitedInput::PlanApproval),
            Stage::Tester => Some(AwaitedInput::CodeReview),
            Stage::Reviewer => Some(AwaitedInput::TestReview),
        }
    }
}

/// Snapshot of where a checkpointed run stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptStatus {
    pub is_interrupted: bool,
    pub pending: Vec<Stage>,
    pub awaiting: Option<AwaitedInput>,
    pub status: WorkflowStatus,
    pub iterations: u32,
}

/// Infers the awaited input from the pending stages, or from the state's shape
/// when no stage is pending.
pub fn interrupt_status(state: &WorkflowState, pending: &[Stage]) -> InterruptStatus {
    let awaiting = pending
        .first()
        .and_then(|s| AwaitedInput::before(*s))
        .or_else(|| infer_from_shape(state));
    InterruptStatus {
        is_interrupted: !pending.is_empty() && !state.status.is_terminal(),
        pending: pending.to_vec(),
        awaiting,
        status: state.status,
        iterations: state.iterations,
    }
}

fn infer_from_shape(state: &WorkflowState) -> Option<AwaitedInput> {
    let has = |s: &str| !s.trim().is_empty();
    if has(&state.plan) && !has(&state.code) {
        Some(AwaitedInput::PlanApproval)
    } else if has(&state.code) && !has(&state.test_results) {
        Some(AwaitedInput::CodeReview)
    } else if has(&state.test_results) && !has(&state.review_feedback) {
        Some(AwaitedInput::TestReview)
    } else if state.status == WorkflowStatus::Reviewing {
        Some(AwaitedInput::ReviewOverride)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Resume actions
// ---------------------------------------------------------------------------

/// What the human decided at an interrupt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeAction {
    #[default]
    Continue,
    /// Same as [`ResumeAction::Continue`]; recorded separately for audit.
    Approve,
    /// Cancel the run at the paused stage.
    Reject,
    /// Apply modifications, then continue.
    Modify,
}

impl ResumeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            ResumeAction::Continue => "continue",
            ResumeAction::Approve => "approve",
            ResumeAction::Reject => "reject",
            ResumeAction::Modify => "modify",
        }
    }
}

impl std::fmt::Display for ResumeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResumeAction {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "continue" => Ok(ResumeAction::Continue),
            "approve" => Ok(ResumeAction::Approve),
            "reject" => Ok(ResumeAction::Reject),
            "modify" => Ok(ResumeAction::Modify),
            other => Err(PipelineError::InvalidResume {
                message: format!("unknown action '{other}'"),
            }),
        }
    }
}
