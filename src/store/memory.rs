use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::{StateStore, check_version, new_events};
use crate::errors::StoreError;
use crate::escalation::EscalationRecord;
use crate::learning::{Decision, Invariant, InvariantEvent};
use crate::orchestrator::{GateMetrics, PipelineRun};

#[derive(Default)]
struct Inner {
    runs: HashMap<String, PipelineRun>,
    run_order: Vec<String>,
    escalations: HashMap<(String, String), EscalationRecord>,
    cancels: HashSet<String>,
    metrics: HashMap<(String, String), GateMetrics>,
    decisions: Vec<Decision>,
    invariants: BTreeMap<String, Invariant>,
    events: Vec<InvariantEvent>,
}

/// Process-local state store.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

impl StateStore for MemoryStateStore {
    fn load_run(&self, run_id: &str) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.lock()?.runs.get(run_id).cloned())
    }

    fn save_run(&self, run: &PipelineRun, expected_version: Option<u64>) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let found = inner.runs.get(&run.id).map(|r| r.version);
        check_version(&run.id, expected_version, found)?;
        if found.is_none() {
            inner.run_order.push(run.id.clone());
        }
        inner.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn list_runs(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock()?.run_order.clone())
    }

    fn save_escalation(&self, record: &EscalationRecord) -> Result<(), StoreError> {
        self.lock()?.escalations.insert(
            (record.run_id.clone(), record.gate_id.clone()),
            record.clone(),
        );
        Ok(())
    }

    fn load_escalation(&self, run_id: &str, gate_id: &str) -> Result<Option<EscalationRecord>, StoreError> {
        Ok(self
            .lock()?
            .escalations
            .get(&(run_id.to_string(), gate_id.to_string()))
            .cloned())
    }

    fn request_cancel(&self, run_id: &str) -> Result<(), StoreError> {
        self.lock()?.cancels.insert(run_id.to_string());
        Ok(())
    }

    fn cancel_requested(&self, run_id: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.cancels.contains(run_id))
    }

    fn clear_cancel(&self, run_id: &str) -> Result<(), StoreError> {
        self.lock()?.cancels.remove(run_id);
        Ok(())
    }

    fn save_gate_metrics(&self, metrics: &GateMetrics) -> Result<(), StoreError> {
        self.lock()?.metrics.insert(
            (metrics.run_id.clone(), metrics.gate_id.clone()),
            metrics.clone(),
        );
        Ok(())
    }

    fn gate_metrics(&self, run_id: &str) -> Result<Vec<GateMetrics>, StoreError> {
        let mut found: Vec<GateMetrics> = self
            .lock()?
            .metrics
            .values()
            .filter(|m| m.run_id == run_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| m.finished_at);
        Ok(found)
    }

    fn append_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        self.lock()?.decisions.push(decision.clone());
        Ok(())
    }

    fn find_decision(&self, learning_id: &str) -> Result<Option<Decision>, StoreError> {
        Ok(self
            .lock()?
            .decisions
            .iter()
            .find(|d| d.learning_id == learning_id)
            .cloned())
    }

    fn load_invariant(&self, id: &str) -> Result<Option<Invariant>, StoreError> {
        Ok(self.lock()?.invariants.get(id).cloned())
    }

    fn list_invariants(&self) -> Result<Vec<Invariant>, StoreError> {
        Ok(self.lock()?.invariants.values().cloned().collect())
    }

    fn put_invariant(&self, invariant: &Invariant, expected_version: Option<u64>) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        let found = inner.invariants.get(&invariant.id).map(|i| i.version);
        check_version(&invariant.id, expected_version, found)?;
        inner
            .invariants
            .insert(invariant.id.clone(), invariant.clone());
        inner.events.extend(new_events(invariant, expected_version));
        Ok(())
    }

    fn invariant_events(&self, id: Option<&str>) -> Result<Vec<InvariantEvent>, StoreError> {
        Ok(self
            .lock()?
            .events
            .iter()
            .filter(|e| id.is_none_or(|id| e.invariant_id == id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;

    #[test]
    fn test_run_cas() {
        contract::run_cas(&MemoryStateStore::new());
    }

    #[test]
    fn test_escalations_and_cancel() {
        contract::escalations_and_cancel(&MemoryStateStore::new());
    }

    #[test]
    fn test_gate_metrics() {
        contract::gate_metrics(&MemoryStateStore::new());
    }

    #[test]
    fn test_decisions() {
        contract::decisions(&MemoryStateStore::new());
    }

    #[test]
    fn test_invariants() {
        contract::invariants(&MemoryStateStore::new());
    }
}
