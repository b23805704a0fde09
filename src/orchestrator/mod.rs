//! Run orchestration.
//!
//! The orchestrator owns the run lifecycle. It picks the next ready gate
//! from the dependency resolver, hands it to the gate executor and persists
//! the run after every transition, each failed attempt included. Any process
//! can pick a run up with `resume` from exactly where the last write left it.
//!
//! ```text
//! PENDING ──resume──▶ RUNNING ──gate passes──▶ PASSED ──next gate──▶ RUNNING
//!                        │                                     │
//!                        └──budget spent──▶ GUTTER    no gates left──▶ COMPLETE
//!                                             │
//!                                  remediate ─┘──▶ PENDING
//! ```

mod runner;
mod state;

pub use runner::Orchestrator;
pub use state::{
    GateMetrics, PendingOutcome, PipelineRun, RunEvent, RunEventKind, RunResult, RunStatus,
};
