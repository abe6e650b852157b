//! Kiln orchestration: drives the workflow rules defined in [`pipeline`].
//!
//! This crate provides the graph executor, the resilient stage wrapper, the
//! council runner, the execution coordinator (`invoke`/`stream` with timeout and
//! cancellation), the interrupt/resume controller, an in-memory checkpoint
//! store, and deterministic dry-run stages.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** Modules here sequence calls between business logic
//! in the [`pipeline`] crate and the port traits it defines (stage executors,
//! judges, checkpoint stores, tracking sinks). They contain no domain rules of
//! their own.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`cancellation`] | `CancellationToken`, `CancellationRegistry` |
//! | [`events`] | `StageEvent`, `EventKind`, `EventEmitter` |
//! | [`resilient`] | `ResilientStage`, `StageEscalation` |
//! | [`graph`] | `WorkflowGraph`, `StageRegistry` |
//! | [`council_runner`] | `CouncilRunner`, `CouncilReviewer` |
//! | [`coordinator`] | `ExecutionCoordinator`, `InvokeOptions` |
//! | [`interrupt`] | `InterruptController` |
//! | [`checkpoint`] | `InMemoryCheckpointStore` |
//! | [`dry_run`] | Offline stage and judge implementations |

pub mod cancellation;
pub mod checkpoint;
pub mod coordinator;
pub mod council_runner;
pub mod dry_run;
pub mod events;
pub mod graph;
pub mod interrupt;
pub mod resilient;

pub use cancellation::{CancellationRegistry, CancellationToken};
pub use checkpoint::InMemoryCheckpointStore;
pub use coordinator::{ExecutionCoordinator, InvokeOptions, RunReport};
pub use council_runner::{CouncilReviewer, CouncilRunner};
pub use dry_run::DryRunOptions;
pub use events::{EventEmitter, EventKind, StageEvent};
pub use graph::{GraphInput, GraphRun, RunContext, StageRegistry, WorkflowGraph};
pub use interrupt::InterruptController;
pub use resilient::{ResilientStage, StageEscalation};
