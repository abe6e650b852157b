//! Routing rules for the workflow graph.
//!
//! Two topologies share the same per-stage contract:
//!
//! | Topology | Decision function | Notes |
//! |----------|-------------------|-------|
//! | Linear | [`route_after`] | `planner → coder → tester → reviewer`, reviewer may loop to coder |
//! | Supervised | [`supervise`] | A central supervisor picks each next stage from the state |
//!
//! Both short-circuit to [`Next::End`] as soon as the state carries an error, and
//! both bound the review loop with the same iteration cap. Neither increments
//! `iterations`: the coder does that when it performs a revision.

use serde::{Deserialize, Serialize};

use crate::{Stage, Verdict, WorkflowState, WorkflowStatus};

/// Default cap on REVISE-driven loops back to the coder.
pub const MAX_REVIEW_ITERATIONS: u32 = 3;

/// Where the graph goes after a stage finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Next {
    /// Run this stage next.
    Stage(Stage),
    /// Stop; the run is finished.
    End,
}

/// Graph topology selected by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Fixed stage order with a bounded review loop.
    #[default]
    Linear,
    /// Central supervisor chooses each next stage dynamically.
    Supervised,
}

// ---------------------------------------------------------------------------
// Linear routing
// ---------------------------------------------------------------------------

/// Chooses the next step after `completed` under the linear topology.
///
/// Takes the state mutably because reaching the iteration cap finalises the run
/// (status `complete` plus an explanatory note on the review feedback).
pub fn route_after(completed: Stage, state: &mut WorkflowState, max_iterations: u32) -> Next {
    if state.has_error() {
        return Next::End;
    }
    match completed {
        Stage::Reviewer => route_after_review(state, max_iterations),
        other => other.successor().map_or(Next::End, Next::Stage),
    }
}

/// Review-stage routing: loop to the coder on REVISE while under the cap.
pub fn route_after_review(state: &mut WorkflowState, max_iterations: u32) -> Next {
    if state.has_error() {
        return Next::End;
    }
    let verdict = derive_verdict(state);
    tracing::debug!(
        task_id = %state.task_id,
        verdict = %verdict,
        iterations = state.iterations,
        max_iterations,
        "Routing after review"
    );
    match verdict {
        Verdict::Revise if state.iterations < max_iterations => Next::Stage(Stage::Coder),
        Verdict::Revise => {
            finish_at_iteration_limit(state, max_iterations);
            Next::End
        }
        Verdict::Approve | Verdict::Reject => Next::End,
    }
}

/// The verdict the router acts on.
///
/// Prefers the structured `metadata.verdict`; otherwise scans the review
/// feedback for `REVISE`, then `APPROVE`, then `REJECT` (case-insensitive, first
/// match in that priority order). Defaults to REVISE.
pub fn derive_verdict(state: &WorkflowState) -> Verdict {
    if let Some(v) = state.metadata.verdict {
        return v;
    }
    scan_verdict(&state.review_feedback).unwrap_or(Verdict::Revise)
}

/// Minimal free-text verdict detection.
pub fn scan_verdict(text: &str) -> Option<Verdict> {
    let upper = text.to_uppercase();
    [Verdict::Revise, Verdict::Approve, Verdict::Reject]
        .into_iter()
        .find(|v| upper.contains(v.as_str()))
}

fn finish_at_iteration_limit(state: &mut WorkflowState, max_iterations: u32) {
    tracing::info!(
        task_id = %state.task_id,
        iterations = state.iterations,
        "Review iteration limit reached; finishing with current code"
    );
    state.status = WorkflowStatus::Complete;
    if !state.review_feedback.is_empty() {
        state.review_feedback.push_str("\n\n");
    }
    state.review_feedback.push_str(&format!(
        "[Maximum review iterations ({max_iterations}) reached. \
         Completing with the current code; remaining feedback was not addressed.]"
    ));
}

// ---------------------------------------------------------------------------
// Supervised routing
// ---------------------------------------------------------------------------

/// Keywords that mark a task or plan as security-sensitive.
pub const SECURITY_KEYWORDS: &[&str] = &[
    "auth",
    "password",
    "secret",
    "token",
    "crypto",
    "encrypt",
    "sql",
    "permission",
    "credential",
    "injection",
];

const LOW_COMPLEXITY_MAX_LINES: usize = 5;
const LOW_COMPLEXITY_MAX_CHARS: usize = 600;

/// Rough size class of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanComplexity {
    Low,
    High,
}

/// Classifies a plan by its non-empty line count and length.
pub fn plan_complexity(plan: &str) -> PlanComplexity {
    let lines = plan.lines().filter(|l| !l.trim().is_empty()).count();
    if lines < LOW_COMPLEXITY_MAX_LINES && plan.chars().count() < LOW_COMPLEXITY_MAX_CHARS {
        PlanComplexity::Low
    } else {
        PlanComplexity::High
    }
}

/// Returns `true` if the plan or task description mentions a security-sensitive
/// keyword.
pub fn is_security_sensitive(state: &WorkflowState) -> bool {
    let haystack = format!("{}\n{}", state.task_description, state.plan).to_lowercase();
    SECURITY_KEYWORDS.iter().any(|k| haystack.contains(k))
}

/// Supervisor decision for the supervised topology.
///
/// Uses `metadata.last_stage` to know where the run is. Low-complexity,
/// non-sensitive plans skip the tester and go straight to review.
pub fn supervise(state: &mut WorkflowState, max_iterations: u32) -> Next {
    if state.has_error() {
        return Next::End;
    }
    let next = match state.metadata.last_stage {
        None => Next::Stage(Stage::Planner),
        Some(Stage::Planner) => Next::Stage(Stage::Coder),
        Some(Stage::Coder) => {
            if plan_complexity(&state.plan) == PlanComplexity::Low && !is_security_sensitive(state)
            {
                Next::Stage(Stage::Reviewer)
            } else {
                Next::Stage(Stage::Tester)
            }
        }
        Some(Stage::Tester) => Next::Stage(Stage::Reviewer),
        Some(Stage::Reviewer) => route_after_review(state, max_iterations),
    };
    tracing::debug!(task_id = %state.task_id, ?next, "Supervisor decision");
    next
}
