//! The workflow state threaded through every stage, and the partial updates
//! stages return.
//!
//! A [`WorkflowState`] is created fresh per invocation, mutated only by merging
//! [`StateUpdate`]s returned from stages (or by the router), and discarded at the
//! end of the call unless a checkpoint store persists it. The checkpoint form is a
//! JSON object of primitives; [`WorkflowState::to_checkpoint`] and
//! [`WorkflowState::from_checkpoint`] are exact inverses.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    CancellationTokenId, PipelineError, Stage, TaskId, ThreadId, Timestamp, Verdict,
};

/// File path → file content for generated code.
pub type CodeFiles = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow run.
///
/// Transitions move towards a terminal value; the only oscillation is
/// `coding ↔ reviewing`, bounded by the review iteration cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Planning,
    Coding,
    Testing,
    Reviewing,
    Complete,
    Error,
    Cancelled,
    Timeout,
}

impl WorkflowStatus {
    /// Returns `true` for `complete`, `error`, `cancelled`, and `timeout`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Complete
                | WorkflowStatus::Error
                | WorkflowStatus::Cancelled
                | WorkflowStatus::Timeout
        )
    }

    /// Stable lower-case name.
    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowStatus::Planning => "planning",
            WorkflowStatus::Coding => "coding",
            WorkflowStatus::Testing => "testing",
            WorkflowStatus::Reviewing => "reviewing",
            WorkflowStatus::Complete => "complete",
            WorkflowStatus::Error => "error",
            WorkflowStatus::Cancelled => "cancelled",
            WorkflowStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Metadata
// ---------------------------------------------------------------------------

/// Metadata carried on the workflow state.
///
/// The fields the engine reads or writes are typed; anything else a stage
/// chooses to record lives in [`WorkflowMetadata::extra`] and is flattened into
/// the same object at the checkpoint boundary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,

    /// Structured verdict written by a reviewer or council. Takes precedence
    /// over scanning the free-text review feedback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_token_id: Option<CancellationTokenId>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,

    /// The most recent stage whose update was merged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stage: Option<Stage>,

    /// Nested council detail (consensus, dissent, per-judge verdicts).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub council: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,

    /// Stage the run was paused before when a human rejected it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_stage: Option<Stage>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Partial update to [`WorkflowMetadata`]; present fields overwrite, `extra`
/// keys merge one by one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub council: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected_stage: Option<Stage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MetadataPatch {
    fn is_empty(&self) -> bool {
        self.verdict.is_none()
            && self.confidence_score.is_none()
            && self.council.is_none()
            && self.cancel_reason.is_none()
            && self.rejected_stage.is_none()
            && self.extra.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Workflow state
// ---------------------------------------------------------------------------

/// The single record threaded through every stage of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub task_id: TaskId,
    pub task_description: String,
    #[serde(default)]
    pub plan: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub test_results: String,
    #[serde(default)]
    pub review_feedback: String,
    #[serde(default)]
    pub code_files: CodeFiles,
    #[serde(default)]
    pub test_analysis: Map<String, Value>,
    /// Number of REVISE-driven passes back through the coder.
    #[serde(default)]
    pub iterations: u32,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: WorkflowMetadata,
}

impl WorkflowState {
    /// Creates the initial state for a new run: status `planning`, creation
    /// timestamp set, every content field empty.
    pub fn new(task_id: TaskId, task_description: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Self {
            task_id,
            task_description: task_description.into(),
            plan: String::new(),
            code: String::new(),
            test_results: String::new(),
            review_feedback: String::new(),
            code_files: CodeFiles::new(),
            test_analysis: Map::new(),
            iterations: 0,
            status: WorkflowStatus::Planning,
            error: None,
            metadata: WorkflowMetadata {
                created_at: Some(now),
                updated_at: Some(now),
                ..WorkflowMetadata::default()
            },
        }
    }

    /// Returns `true` when the run has failed: status `error` or an error message set.
    pub fn has_error(&self) -> bool {
        self.status == WorkflowStatus::Error || self.error.is_some()
    }

    /// Marks the run as failed with `message`.
    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = WorkflowStatus::Error;
        self.error = Some(message.into());
        self.touch();
    }

    /// Moves the run to a terminal status with an explanatory message.
    ///
    /// Used for `timeout` and `cancelled`, which are outcomes rather than errors
    /// in the retry sense.
    pub fn finish_with(&mut self, status: WorkflowStatus, message: impl Into<String>) {
        self.status = status;
        self.error = Some(message.into());
        self.touch();
    }

    /// Merges a stage's partial update into this state.
    ///
    /// Present fields replace the current value; metadata `extra` keys merge
    /// individually. A terminal status is never replaced by a non-terminal one.
    pub fn apply(&mut self, update: StateUpdate) {
        let StateUpdate {
            task_description,
            plan,
            code,
            test_results,
            review_feedback,
            code_files,
            test_analysis,
            iterations,
            status,
            error,
            metadata,
        } = update;

        if let Some(v) = task_description {
            self.task_description = v;
        }
        if let Some(v) = plan {
            self.plan = v;
        }
        if let Some(v) = code {
            self.code = v;
        }
        if let Some(v) = test_results {
            self.test_results = v;
        }
        if let Some(v) = review_feedback {
            self.review_feedback = v;
        }
        if let Some(v) = code_files {
            self.code_files = v;
        }
        if let Some(v) = test_analysis {
            self.test_analysis = v;
        }
        if let Some(v) = iterations {
            self.iterations = v;
        }
        if let Some(v) = status {
            if self.status.is_terminal() && !v.is_terminal() {
                tracing::debug!(
                    task_id = %self.task_id,
                    current = %self.status,
                    requested = %v,
                    "Ignoring status regression from terminal state"
                );
            } else {
                self.status = v;
            }
        }
        if let Some(v) = error {
            self.error = Some(v);
        }
        if let Some(patch) = metadata {
            let m = &mut self.metadata;
            if let Some(v) = patch.verdict {
                m.verdict = Some(v);
            }
            if let Some(v) = patch.confidence_score {
                m.confidence_score = Some(v);
            }
            if let Some(v) = patch.council {
                m.council = Some(v);
            }
            if let Some(v) = patch.cancel_reason {
                m.cancel_reason = Some(v);
            }
            if let Some(v) = patch.rejected_stage {
                m.rejected_stage = Some(v);
            }
            m.extra.extend(patch.extra);
        }
        self.touch();
    }

    /// Converts the state into its checkpoint representation (a JSON object of
    /// primitives).
    pub fn to_checkpoint(&self) -> Result<Map<String, Value>, PipelineError> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(PipelineError::StateSerialization {
                message: format!("expected object, got {other}"),
            }),
        }
    }

    /// Rebuilds a state from its checkpoint representation.
    pub fn from_checkpoint(values: Map<String, Value>) -> Result<Self, PipelineError> {
        Ok(serde_json::from_value(Value::Object(values))?)
    }

    fn touch(&mut self) {
        self.metadata.updated_at = Some(Timestamp::now());
    }
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

/// Partial state returned by a stage and merged onto the running state.
///
/// Also the shape of externally supplied modifications when resuming a paused
/// run, so it deserialises from any JSON object naming a subset of fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_results: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub review_feedback: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_files: Option<CodeFiles>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_analysis: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetadataPatch>,
}

impl StateUpdate {
    /// An update that changes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, plan: impl Into<String>) -> Self {
        self.plan = Some(plan.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_code_files(mut self, files: CodeFiles) -> Self {
        self.code_files = Some(files);
        self
    }

    pub fn with_test_results(mut self, results: impl Into<String>) -> Self {
        self.test_results = Some(results.into());
        self
    }

    pub fn with_test_analysis(mut self, analysis: Map<String, Value>) -> Self {
        self.test_analysis = Some(analysis);
        self
    }

    pub fn with_review_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.review_feedback = Some(feedback.into());
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Records a structured verdict (and its confidence) for the router.
    pub fn with_verdict(mut self, verdict: Verdict, confidence: f64) -> Self {
        let patch = self.metadata.get_or_insert_with(MetadataPatch::default);
        patch.verdict = Some(verdict);
        patch.confidence_score = Some(confidence);
        self
    }

    /// Records nested council detail.
    pub fn with_council_detail(mut self, detail: Value) -> Self {
        self.metadata.get_or_insert_with(MetadataPatch::default).council = Some(detail);
        self
    }

    /// Sets an arbitrary metadata key.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(MetadataPatch::default)
            .extra
            .insert(key.into(), value);
        self
    }

    /// Returns `true` if applying this update would change nothing.
    pub fn is_empty(&self) -> bool {
        self.task_description.is_none()
            && self.plan.is_none()
            && self.code.is_none()
            && self.test_results.is_none()
            && self.review_feedback.is_none()
            && self.code_files.is_none()
            && self.test_analysis.is_none()
            && self.iterations.is_none()
            && self.status.is_none()
            && self.error.is_none()
            && self.metadata.as_ref().map_or(true, MetadataPatch::is_empty)
    }

    /// Content-free summary of this update for tracking sinks and events:
    /// which fields changed and how large text fields are, never their content.
    pub fn summary(&self) -> Value {
        let mut fields = Map::new();
        let mut text = |name: &str, v: &Option<String>| {
            if let Some(s) = v {
                fields.insert(format!("{name}_chars"), json!(s.chars().count()));
            }
        };
        text("plan", &self.plan);
        text("code", &self.code);
        text("test_results", &self.test_results);
        text("review_feedback", &self.review_feedback);
        if let Some(files) = &self.code_files {
            fields.insert("code_files".into(), json!(files.len()));
        }
        if let Some(v) = self.iterations {
            fields.insert("iterations".into(), json!(v));
        }
        if let Some(v) = self.status {
            fields.insert("status".into(), json!(v));
        }
        if self.error.is_some() {
            fields.insert("error".into(), json!(true));
        }
        if let Some(v) = self.metadata.as_ref().and_then(|m| m.verdict) {
            fields.insert("verdict".into(), json!(v));
        }
        Value::Object(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated_state() -> WorkflowState {
        let mut state = WorkflowState::new(TaskId::new(7), "Add a retry helper");
        let mut files = CodeFiles::new();
        files.insert("src/retry.rs".into(), "pub fn retry() {}".into());
        let mut analysis = Map::new();
        analysis.insert("passed".into(), json!(12));
        analysis.insert("coverage".into(), json!(0.83));
        state.apply(
            StateUpdate::new()
                .with_plan("1. write helper\n2. test it")
                .with_code("pub fn retry() {}")
                .with_code_files(files)
                .with_test_results("12 passed")
                .with_test_analysis(analysis)
                .with_review_feedback("APPROVE")
                .with_iterations(1)
                .with_status(WorkflowStatus::Reviewing)
                .with_verdict(Verdict::Approve, 0.91)
                .with_council_detail(json!({"consensus_type": "unanimous"}))
                .with_metadata("reviewer_model", json!("sonnet")),
        );
        state.metadata.thread_id = Some(ThreadId::new_random());
        state.metadata.cancellation_token_id = Some(CancellationTokenId::new_random());
        state.metadata.last_stage = Some(Stage::Reviewer);
        state
    }

    #[test]
    fn test_checkpoint_round_trip_is_identical() {
        let state = populated_state();
        let map = state.to_checkpoint().unwrap();
        let restored = WorkflowState::from_checkpoint(map).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_checkpoint_flattens_extra_metadata() {
        let state = populated_state();
        let map = state.to_checkpoint().unwrap();
        let metadata = map["metadata"].as_object().unwrap();
        assert_eq!(metadata["reviewer_model"], json!("sonnet"));
        assert_eq!(metadata["verdict"], json!("APPROVE"));
    }

    #[test]
    fn test_apply_does_not_regress_terminal_status() {
        let mut state = WorkflowState::new(TaskId::new(1), "x");
        state.apply(StateUpdate::new().with_status(WorkflowStatus::Cancelled));
        state.apply(StateUpdate::new().with_status(WorkflowStatus::Coding));
        assert_eq!(state.status, WorkflowStatus::Cancelled);
    }

    #[test]
    fn test_update_deserialises_from_partial_object() {
        let update: StateUpdate =
            serde_json::from_value(json!({"plan": "edited plan", "metadata": {"note": "hi"}}))
                .unwrap();
        assert_eq!(update.plan.as_deref(), Some("edited plan"));
        let mut state = WorkflowState::new(TaskId::new(1), "x");
        state.apply(update);
        assert_eq!(state.plan, "edited plan");
        assert_eq!(state.metadata.extra["note"], json!("hi"));
    }

    #[test]
    fn test_summary_omits_content() {
        let update = StateUpdate::new().with_code("secret body");
        let summary = update.summary();
        assert_eq!(summary["code_chars"], json!(11));
        assert!(!summary.to_string().contains("secret body"));
    }

    #[test]
    fn test_empty_update_detection() {
        assert!(StateUpdate::new().is_empty());
        assert!(!StateUpdate::new().with_iterations(0).is_empty());
    }
}
