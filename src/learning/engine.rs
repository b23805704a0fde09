use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{
    Decision, DecisionAction, HistoryEntry, HistoryKind, Invariant, InvariantStatus, Learning,
    PromotionPolicy, Provenance, classify, penalize_violation, smooth_validation,
};
use crate::errors::StoreError;
use crate::store::StateStore;

/// Attempts at a compare-and-swap write before giving up.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Turns learnings into dispositions and keeps invariant confidence current.
pub struct PromotionEngine {
    store: Arc<dyn StateStore>,
    policy: PromotionPolicy,
}

impl PromotionEngine {
    pub fn new(store: Arc<dyn StateStore>, policy: PromotionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &PromotionPolicy {
        &self.policy
    }

    /// Give `learning` its disposition.
    ///
    /// Idempotent by learning id: a learning that already has a recorded
    /// decision gets that decision back and nothing is written.
    pub fn process(&self, learning: &Learning) -> Result<Decision, StoreError> {
        if let Some(existing) = self.store.find_decision(&learning.id)? {
            debug!(learning = %learning.id, action = %existing.action, "learning already decided");
            return Ok(existing);
        }

        let action = classify(learning.confidence, &self.policy, learning.operator_forced);
        let invariant_id = match action {
            DecisionAction::Promote => Some(self.promote(learning)?),
            DecisionAction::Accept | DecisionAction::Reject => None,
        };

        let decision = Decision {
            learning_id: learning.id.clone(),
            run_id: learning.source_run_id.clone(),
            gate_id: learning.source_gate_id.clone(),
            action,
            confidence: learning.confidence,
            invariant_id,
            operator_forced: learning.operator_forced,
            decided_at: Utc::now(),
        };
        self.store.append_decision(&decision)?;
        info!(
            learning = %learning.id,
            action = %action,
            confidence = learning.confidence,
            forced = learning.operator_forced,
            "learning decided"
        );
        Ok(decision)
    }

    /// Record that run `run_id` satisfied `invariant_id`.
    ///
    /// Returns the updated invariant, or `None` if it is unknown, deprecated
    /// or already has an outcome from this run.
    pub fn validate(&self, invariant_id: &str, run_id: &str) -> Result<Option<Invariant>, StoreError> {
        let alpha = self.policy.smoothing_alpha;
        self.update(invariant_id, |current| {
            let mut inv = current.filter(|inv| open_to(inv, run_id))?;
            let before = inv.confidence;
            inv.confidence = smooth_validation(before, alpha);
            inv.validation_count += 1;
            push_history(&mut inv, HistoryKind::Validated, before, Some(run_id), None);
            Some(inv)
        })
    }

    /// Record that run `run_id` violated `invariant_id`. At most one outcome
    /// per run is recorded, as with [`validate`](Self::validate).
    ///
    /// An invariant whose confidence falls below the deprecation floor is
    /// deprecated, optionally naming a successor.
    pub fn violate(
        &self,
        invariant_id: &str,
        run_id: &str,
        successor: Option<&str>,
    ) -> Result<Option<Invariant>, StoreError> {
        let beta = self.policy.violation_penalty;
        let floor = self.policy.deprecation_floor;
        let updated = self.update(invariant_id, |current| {
            let mut inv = current.filter(|inv| open_to(inv, run_id))?;
            let before = inv.confidence;
            inv.confidence = penalize_violation(before, beta);
            inv.violation_count += 1;
            if inv.confidence < floor {
                inv.status = InvariantStatus::Deprecated;
                inv.successor = successor.map(str::to_string);
            }
            push_history(&mut inv, HistoryKind::Violated, before, Some(run_id), None);
            Some(inv)
        })?;
        if let Some(inv) = &updated
            && !inv.is_active()
        {
            warn!(invariant = %inv.id, confidence = inv.confidence, "invariant deprecated");
        }
        Ok(updated)
    }

    fn promote(&self, learning: &Learning) -> Result<String, StoreError> {
        let id = learning.invariant_id();
        let stored = self.update(&id, |current| match current {
            None => Some(Invariant::from_learning(learning)),
            // Already promoted from this learning (a retried call).
            Some(inv) if inv.has_evidence_from(&learning.id) => None,
            // Confidence moves only through validations and violations, so a
            // repeat promotion adds evidence and leaves status alone.
            Some(mut inv) => {
                let before = inv.confidence;
                let evidence = Provenance::from(learning);
                if inv.check.is_none() {
                    inv.check = learning.check.clone();
                }
                if !inv.is_active() {
                    info!(
                        invariant = %inv.id,
                        learning = %learning.id,
                        "evidence added to a deprecated invariant; it stays deprecated"
                    );
                }
                inv.provenance.push(evidence.clone());
                push_history(
                    &mut inv,
                    HistoryKind::Merged,
                    before,
                    Some(&learning.source_run_id),
                    Some(evidence),
                );
                Some(inv)
            }
        })?;
        if let Some(inv) = stored {
            info!(
                invariant = %inv.id,
                version = inv.version,
                confidence = inv.confidence,
                "invariant promoted"
            );
        }
        Ok(id)
    }

    /// Read-modify-write with compare-and-swap. `apply` returns `None` when
    /// there is nothing to write; it runs again after every lost race.
    fn update<F>(&self, id: &str, mut apply: F) -> Result<Option<Invariant>, StoreError>
    where
        F: FnMut(Option<Invariant>) -> Option<Invariant>,
    {
        let mut last_conflict = None;
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let current = self.store.load_invariant(id)?;
            let expected = current.as_ref().map(|inv| inv.version);
            let Some(mut next) = apply(current) else {
                return Ok(None);
            };
            next.version = expected.unwrap_or(0) + 1;
            match self.store.put_invariant(&next, expected) {
                Ok(()) => return Ok(Some(next)),
                Err(e) if e.is_conflict() => {
                    debug!(invariant = id, attempt, "invariant changed concurrently, retrying");
                    last_conflict = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_conflict.unwrap_or_else(|| StoreError::VersionConflict {
            key: id.to_string(),
            expected: None,
            found: None,
        }))
    }
}

fn open_to(inv: &Invariant, run_id: &str) -> bool {
    if !inv.is_active() {
        return false;
    }
    if inv.has_outcome_from(run_id) {
        debug!(invariant = %inv.id, run = run_id, "run already has an outcome for this invariant");
        return false;
    }
    true
}

fn push_history(
    inv: &mut Invariant,
    kind: HistoryKind,
    confidence_before: f64,
    run_id: Option<&str>,
    evidence: Option<Provenance>,
) {
    let now = Utc::now();
    inv.updated_at = now;
    inv.version_history.push(HistoryEntry {
        version: inv.version + 1,
        kind,
        at: now,
        confidence_before,
        confidence_after: inv.confidence,
        status_after: inv.status,
        run_id: run_id.map(str::to_string),
        evidence,
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::escalation::EscalationRecord;
    use crate::learning::InvariantEvent;
    use crate::orchestrator::{GateMetrics, PipelineRun};
    use crate::store::MemoryStateStore;

    fn engine() -> (Arc<MemoryStateStore>, PromotionEngine) {
        let store = Arc::new(MemoryStateStore::new());
        let engine = PromotionEngine::new(store.clone(), PromotionPolicy::default());
        (store, engine)
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_high_confidence_promotes_fresh_invariant() {
        let (store, engine) = engine();
        let learning = Learning::new("run-1", "structure", "Every API lists its error codes", 0.95);

        let decision = engine.process(&learning).unwrap();
        assert_eq!(decision.action, DecisionAction::Promote);
        let id = decision.invariant_id.unwrap();
        let inv = store.load_invariant(&id).unwrap().unwrap();
        assert_eq!(inv.validation_count, 0);
        assert_eq!(inv.version, 1);
        assert!(approx(inv.confidence, 0.95));
        assert_eq!(inv.provenance[0].learning_id, learning.id);
    }

    #[test]
    fn test_accept_and_reject_leave_registry_alone() {
        let (store, engine) = engine();
        let accepted = engine.process(&Learning::new("r", "g", "medium", 0.6)).unwrap();
        let rejected = engine.process(&Learning::new("r", "g", "weak", 0.2)).unwrap();
        assert_eq!(accepted.action, DecisionAction::Accept);
        assert_eq!(rejected.action, DecisionAction::Reject);
        assert!(store.list_invariants().unwrap().is_empty());
        assert!(store.find_decision(&rejected.learning_id).unwrap().is_some());
    }

    #[test]
    fn test_operator_override_promotes_and_is_tagged() {
        let (store, engine) = engine();
        let learning = Learning::new("r", "g", "operator knows best", 0.1).forced();
        let decision = engine.process(&learning).unwrap();
        assert_eq!(decision.action, DecisionAction::Promote);
        assert!(decision.operator_forced);
        let inv = store
            .load_invariant(decision.invariant_id.as_deref().unwrap())
            .unwrap()
            .unwrap();
        assert!(inv.provenance[0].operator_forced);
    }

    #[test]
    fn test_processing_twice_is_idempotent() {
        let (store, engine) = engine();
        let learning = Learning::new("r", "g", "rule", 0.9);
        let first = engine.process(&learning).unwrap();
        let second = engine.process(&learning).unwrap();
        assert_eq!(first, second);
        let inv = store.load_invariant(&learning.invariant_id()).unwrap().unwrap();
        assert_eq!(inv.version, 1);
        assert_eq!(store.invariant_events(None).unwrap().len(), 1);
    }

    #[test]
    fn test_validation_smooths_confidence() {
        let (store, engine) = engine();
        let learning = Learning::new("r", "g", "rule", 0.95);
        let id = engine.process(&learning).unwrap().invariant_id.unwrap();
        engine.validate(&id, "r2").unwrap();
        engine.validate(&id, "r3").unwrap();
        // Pin confidence back to 0.95 with two validations on record.
        let mut inv = store.load_invariant(&id).unwrap().unwrap();
        let expected = inv.version;
        inv.confidence = 0.95;
        inv.version += 1;
        store.put_invariant(&inv, Some(expected)).unwrap();

        let inv = engine.validate(&id, "r4").unwrap().unwrap();
        assert!(approx(inv.confidence, 0.955));
        assert_eq!(inv.validation_count, 3);
        assert_eq!(inv.version_history.last().unwrap().kind, HistoryKind::Validated);
    }

    #[test]
    fn test_violations_deprecate_below_floor() {
        let (_store, engine) = engine();
        let learning = Learning::new("r", "g", "rule", 0.7).forced();
        let id = engine.process(&learning).unwrap().invariant_id.unwrap();

        let inv = engine.violate(&id, "r2", Some("inv-next")).unwrap().unwrap();
        assert!(approx(inv.confidence, 0.525));
        assert!(inv.is_active());
        assert!(inv.successor.is_none());

        let inv = engine.violate(&id, "r3", Some("inv-next")).unwrap().unwrap();
        assert!(approx(inv.confidence, 0.39375));
        assert_eq!(inv.status, InvariantStatus::Deprecated);
        assert_eq!(inv.successor.as_deref(), Some("inv-next"));
        assert_eq!(inv.violation_count, 2);

        // Deprecated invariants no longer move.
        assert!(engine.violate(&id, "r4", None).unwrap().is_none());
        assert!(engine.validate(&id, "r4").unwrap().is_none());
    }

    #[test]
    fn test_every_change_is_one_history_entry_and_event() {
        let (store, engine) = engine();
        let id = engine
            .process(&Learning::new("r", "g", "rule", 0.9))
            .unwrap()
            .invariant_id
            .unwrap();
        engine.validate(&id, "r2").unwrap();
        engine.violate(&id, "r3", None).unwrap();

        let inv = store.load_invariant(&id).unwrap().unwrap();
        let versions: Vec<u64> = inv.version_history.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        let events = store.invariant_events(Some(&id)).unwrap();
        let kinds: Vec<HistoryKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![HistoryKind::Promoted, HistoryKind::Validated, HistoryKind::Violated]
        );
    }

    #[test]
    fn test_repeat_promotion_merges_evidence_and_keeps_confidence() {
        let (store, engine) = engine();
        let first = Learning::new("run-a", "g", "Same rule", 0.85);
        let id = engine.process(&first).unwrap().invariant_id.unwrap();
        engine.validate(&id, "run-b").unwrap();
        let earned = store.load_invariant(&id).unwrap().unwrap().confidence;

        let later = Learning::new("run-c", "g", "same   RULE", 0.99);
        let decision = engine.process(&later).unwrap();
        assert_eq!(decision.invariant_id.as_deref(), Some(id.as_str()));

        let inv = store.load_invariant(&id).unwrap().unwrap();
        assert!(approx(inv.confidence, earned));
        assert_eq!(inv.validation_count, 1);
        assert_eq!(inv.provenance.len(), 2);
        let last = inv.version_history.last().unwrap();
        assert_eq!(last.kind, HistoryKind::Merged);
        assert_eq!(last.evidence.as_ref().unwrap().learning_id, later.id);
    }

    #[test]
    fn test_repeat_promotion_does_not_reactivate_deprecated() {
        let (store, engine) = engine();
        let id = engine
            .process(&Learning::new("run-a", "g", "fragile rule", 0.7).forced())
            .unwrap()
            .invariant_id
            .unwrap();
        engine.violate(&id, "run-b", None).unwrap();
        engine.violate(&id, "run-c", None).unwrap();

        engine
            .process(&Learning::new("run-d", "g", "fragile rule", 0.95))
            .unwrap();
        let inv = store.load_invariant(&id).unwrap().unwrap();
        assert_eq!(inv.status, InvariantStatus::Deprecated);
        assert!(approx(inv.confidence, 0.39375));
        assert_eq!(inv.provenance.len(), 2);
    }

    #[test]
    fn test_one_outcome_per_run() {
        let (store, engine) = engine();
        let id = engine
            .process(&Learning::new("r", "g", "rule", 0.9))
            .unwrap()
            .invariant_id
            .unwrap();

        assert!(engine.validate(&id, "run-x").unwrap().is_some());
        assert!(engine.validate(&id, "run-x").unwrap().is_none());
        assert!(engine.violate(&id, "run-x", None).unwrap().is_none());

        let inv = store.load_invariant(&id).unwrap().unwrap();
        assert_eq!(inv.validation_count, 1);
        assert_eq!(inv.violation_count, 0);
        assert_eq!(inv.version_history.len(), 2);
        assert!(engine.validate(&id, "run-y").unwrap().is_some());
    }

    /// Store that lets a competing writer in just before the first
    /// invariant write.
    struct RacingStore {
        inner: MemoryStateStore,
        raced: AtomicBool,
    }

    impl StateStore for RacingStore {
        fn load_run(&self, run_id: &str) -> Result<Option<PipelineRun>, StoreError> {
            self.inner.load_run(run_id)
        }
        fn save_run(&self, run: &PipelineRun, expected: Option<u64>) -> Result<(), StoreError> {
            self.inner.save_run(run, expected)
        }
        fn list_runs(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_runs()
        }
        fn save_escalation(&self, record: &EscalationRecord) -> Result<(), StoreError> {
            self.inner.save_escalation(record)
        }
        fn load_escalation(&self, run_id: &str, gate_id: &str) -> Result<Option<EscalationRecord>, StoreError> {
            self.inner.load_escalation(run_id, gate_id)
        }
        fn request_cancel(&self, run_id: &str) -> Result<(), StoreError> {
            self.inner.request_cancel(run_id)
        }
        fn cancel_requested(&self, run_id: &str) -> Result<bool, StoreError> {
            self.inner.cancel_requested(run_id)
        }
        fn clear_cancel(&self, run_id: &str) -> Result<(), StoreError> {
            self.inner.clear_cancel(run_id)
        }
        fn save_gate_metrics(&self, metrics: &GateMetrics) -> Result<(), StoreError> {
            self.inner.save_gate_metrics(metrics)
        }
        fn gate_metrics(&self, run_id: &str) -> Result<Vec<GateMetrics>, StoreError> {
            self.inner.gate_metrics(run_id)
        }
        fn append_decision(&self, decision: &Decision) -> Result<(), StoreError> {
            self.inner.append_decision(decision)
        }
        fn find_decision(&self, learning_id: &str) -> Result<Option<Decision>, StoreError> {
            self.inner.find_decision(learning_id)
        }
        fn load_invariant(&self, id: &str) -> Result<Option<Invariant>, StoreError> {
            self.inner.load_invariant(id)
        }
        fn list_invariants(&self) -> Result<Vec<Invariant>, StoreError> {
            self.inner.list_invariants()
        }
        fn put_invariant(&self, invariant: &Invariant, expected: Option<u64>) -> Result<(), StoreError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let mut rival = self.inner.load_invariant(&invariant.id)?.expect("seeded");
                let found = rival.version;
                rival.validation_count += 10;
                rival.version += 1;
                self.inner.put_invariant(&rival, Some(found))?;
            }
            self.inner.put_invariant(invariant, expected)
        }
        fn invariant_events(&self, id: Option<&str>) -> Result<Vec<InvariantEvent>, StoreError> {
            self.inner.invariant_events(id)
        }
    }

    #[test]
    fn test_lost_race_is_retried_on_fresh_state() {
        let inner = MemoryStateStore::new();
        let learning = Learning::new("r", "g", "rule", 0.9);
        let mut seeded = Invariant::from_learning(&learning);
        seeded.version = 1;
        inner.put_invariant(&seeded, None).unwrap();

        let store = Arc::new(RacingStore {
            inner,
            raced: AtomicBool::new(false),
        });
        let engine = PromotionEngine::new(store.clone(), PromotionPolicy::default());

        let inv = engine.validate(&seeded.id, "r2").unwrap().unwrap();
        // The rival's update survived and ours landed on top of it.
        assert_eq!(inv.validation_count, 11);
        assert_eq!(inv.version, 3);
    }
}
