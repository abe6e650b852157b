//! Core workflow domain for Kiln.
//!
//! This crate contains every domain concept of the code-generation workflow:
//! identifiers, the state threaded through the stages, routing rules, error
//! classification and recovery policy, council aggregation, interrupt points,
//! and the port traits external collaborators implement. The orchestration
//! crate (`nodes`) drives these rules; it never adds domain rules of its own.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype identifiers (`TaskId`, `ThreadId`, `JudgeName`, etc.) |
//! | [`types`] | Shared value types (`Stage`, `ModelTier`, `Confidence`, etc.) |
//! | [`errors`] | `PipelineError`, `StageError`, and port error types |
//! | [`state`] | `WorkflowState`, `StateUpdate`, `WorkflowStatus` |
//! | [`routing`] | Linear router and supervisor decision |
//! | [`recovery`] | Error classifier, recovery policy, retry counters |
//! | [`council`] | Judge configuration and verdict aggregation |
//! | [`interrupt`] | Interrupt points, paused-run status, resume actions |
//! | [`config`] | `EngineConfig` |
//! | [`ports`] | `StageExecutor`, `Judge`, `CheckpointStore`, `TrackingSink` |

pub mod config;
pub mod council;
pub mod errors;
pub mod identifiers;
pub mod interrupt;
pub mod ports;
pub mod recovery;
pub mod routing;
pub mod state;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use config::{EngineConfig, DEFAULT_TIMEOUT_SECONDS};
pub use council::{
    aggregate, conclusion, default_panel, ConsensusType, CouncilConfig, CouncilResult, Issue,
    IssueSeverity, JudgeConfig, JudgeUsage, JudgeVerdict, Verdict, VoteTally,
};
pub use errors::{CheckpointError, PipelineError, StageError, TrackingError};
pub use identifiers::{CancellationTokenId, InterruptPointName, JudgeName, TaskId, ThreadId};
pub use interrupt::{interrupt_status, AwaitedInput, InterruptConfig, InterruptStatus, ResumeAction};
pub use ports::{
    Checkpoint, CheckpointStore, Judge, NoopTracking, StageContext, StageExecutor, TrackingSink,
};
pub use recovery::{
    classify, ErrorHandler, ErrorType, RecoveryAction, RecoveryConfig, RecoveryPolicy,
    TRUNCATION_MARKER,
};
pub use routing::{
    derive_verdict, route_after, route_after_review, supervise, Next, Topology,
    MAX_REVIEW_ITERATIONS,
};
pub use state::{CodeFiles, MetadataPatch, StateUpdate, WorkflowMetadata, WorkflowState, WorkflowStatus};
pub use types::{Confidence, ModelTier, Stage, Timestamp, TokenCost, TokenCount};
