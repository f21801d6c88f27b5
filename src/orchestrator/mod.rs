//! Attack session orchestration.
//!
//! - `AttackOrchestrator`: the per-session state machine loop
//! - `BatchRunner`: dependency-ordered execution of a task file
//! - `CancelHandle`: cooperative cancellation, Ctrl-C aware
//! - `EventSink`: progress events for front ends

mod batch;
mod engine;
mod events;
mod report;
mod signal;
mod state;

pub use batch::{BatchPlan, BatchRunner};
pub use engine::AttackOrchestrator;
pub use events::{EventKind, EventSink, NullSink, SessionEvent};
pub use report::{BatchSummary, CategoryStats, SessionReport};
pub use signal::CancelHandle;
pub use state::{EngineState, SessionStatus};
