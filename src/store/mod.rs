//! Durable state: runs, escalations, cancel requests, per-gate metrics,
//! learning dispositions and the invariant registry.
//!
//! Writes that can race are compare-and-swap on a version number: the caller
//! passes the version it read (`None` for "must not exist yet") and the store
//! refuses the write if the stored record moved on.
//!
//! Two backends implement [`StateStore`]:
//! - [`MemoryStateStore`] for tests and embedding
//! - [`FileStateStore`], crash-safe JSON files under `.gauntlet/state`

mod file;
mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use crate::errors::StoreError;
use crate::escalation::EscalationRecord;
use crate::learning::{Decision, Invariant, InvariantEvent};
use crate::orchestrator::{GateMetrics, PipelineRun};

/// Typed persistence for everything the orchestrator must survive a crash with.
pub trait StateStore: Send + Sync {
    fn load_run(&self, run_id: &str) -> Result<Option<PipelineRun>, StoreError>;

    /// Store `run` (whose `version` is the new version) if the stored version
    /// is still `expected_version`.
    fn save_run(&self, run: &PipelineRun, expected_version: Option<u64>) -> Result<(), StoreError>;

    /// All run ids, oldest first.
    fn list_runs(&self) -> Result<Vec<String>, StoreError>;

    fn save_escalation(&self, record: &EscalationRecord) -> Result<(), StoreError>;

    fn load_escalation(&self, run_id: &str, gate_id: &str) -> Result<Option<EscalationRecord>, StoreError>;

    fn request_cancel(&self, run_id: &str) -> Result<(), StoreError>;

    fn cancel_requested(&self, run_id: &str) -> Result<bool, StoreError>;

    fn clear_cancel(&self, run_id: &str) -> Result<(), StoreError>;

    /// Store the metrics of a gate exit. A later exit of the same gate in the
    /// same run replaces the earlier one.
    fn save_gate_metrics(&self, metrics: &GateMetrics) -> Result<(), StoreError>;

    /// Metrics of every gate `run_id` has exited, oldest exit first.
    fn gate_metrics(&self, run_id: &str) -> Result<Vec<GateMetrics>, StoreError>;

    /// Append a learning disposition. Dispositions are never rewritten.
    fn append_decision(&self, decision: &Decision) -> Result<(), StoreError>;

    fn find_decision(&self, learning_id: &str) -> Result<Option<Decision>, StoreError>;

    fn load_invariant(&self, id: &str) -> Result<Option<Invariant>, StoreError>;

    fn list_invariants(&self) -> Result<Vec<Invariant>, StoreError>;

    /// Store the current version of an invariant (CAS on `expected_version`)
    /// and append its new history entries to the event log.
    fn put_invariant(&self, invariant: &Invariant, expected_version: Option<u64>) -> Result<(), StoreError>;

    /// Registry events, optionally for one invariant, in append order.
    fn invariant_events(&self, id: Option<&str>) -> Result<Vec<InvariantEvent>, StoreError>;
}

/// History entries newer than `expected_version`, as log events.
pub(crate) fn new_events(invariant: &Invariant, expected_version: Option<u64>) -> Vec<InvariantEvent> {
    let since = expected_version.unwrap_or(0);
    invariant
        .version_history
        .iter()
        .filter(|e| e.version > since)
        .map(|e| InvariantEvent::from_entry(invariant, e))
        .collect()
}

pub(crate) fn check_version(key: &str, expected: Option<u64>, found: Option<u64>) -> Result<(), StoreError> {
    if expected == found {
        Ok(())
    } else {
        Err(StoreError::VersionConflict {
            key: key.to_string(),
            expected,
            found,
        })
    }
}
