//! Stage lifecycle events produced while a run is streamed.

use pipeline::{Stage, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Kind of a [`StageEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted,
    StageStarted,
    /// Summary of the update a stage produced.
    StageOutput,
    StageRetry,
    StageCompleted,
    StageFailed,
    Interrupted,
    WorkflowCompleted,
    WorkflowError,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::WorkflowStarted,
        EventKind::StageStarted,
        EventKind::StageOutput,
        EventKind::StageRetry,
        EventKind::StageCompleted,
        EventKind::StageFailed,
        EventKind::Interrupted,
        EventKind::WorkflowCompleted,
        EventKind::WorkflowError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::WorkflowStarted => "workflow_started",
            EventKind::StageStarted => "stage_started",
            EventKind::StageOutput => "stage_output",
            EventKind::StageRetry => "stage_retry",
            EventKind::StageCompleted => "stage_completed",
            EventKind::StageFailed => "stage_failed",
            EventKind::Interrupted => "interrupted",
            EventKind::WorkflowCompleted => "workflow_completed",
            EventKind::WorkflowError => "workflow_error",
        }
    }

    /// `true` for the event that ends a stream.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventKind::WorkflowCompleted | EventKind::WorkflowError)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("unknown event kind '{s}'"))
    }
}

/// One structured lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    pub payload: Value,
    pub timestamp: Timestamp,
}

impl StageEvent {
    pub fn new(kind: EventKind, stage: Option<Stage>, payload: Value) -> Self {
        Self {
            kind,
            stage,
            payload,
            timestamp: Timestamp::now(),
        }
    }

    pub fn for_stage(kind: EventKind, stage: Stage, payload: Value) -> Self {
        Self::new(kind, Some(stage), payload)
    }
}

/// Sending half handed down through the graph. A detached emitter (the
/// default, used by `invoke`) drops every event.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<StageEvent>>,
}

impl EventEmitter {
    pub fn new(tx: mpsc::Sender<StageEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub async fn emit(&self, event: StageEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).await.is_err() {
                tracing::trace!("Event receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_names_round_trip_through_from_str() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("stage_exploded".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_event_serialises_with_snake_case_kind() {
        let event = StageEvent::for_stage(EventKind::StageStarted, Stage::Coder, json!({}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "stage_started");
        assert_eq!(value["stage"], "coder");
    }

    #[tokio::test]
    async fn test_detached_emitter_drops_events() {
        EventEmitter::detached()
            .emit(StageEvent::new(EventKind::WorkflowStarted, None, json!({})))
            .await;
    }
}
