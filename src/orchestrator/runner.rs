use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::state::{PipelineRun, RunEventKind, RunResult, RunStatus};
use crate::advisory::AdvisoryClient;
use crate::artifact::ArtifactStore;
use crate::dag::TaskResolver;
use crate::errors::{PipelineError, TaskError};
use crate::escalation::{EscalationHandler, EscalationReason};
use crate::gates::{
    Assessment, AttemptRecord, AttemptSink, FixRecord, Gate, GateContext, GateExecutor, GateResult,
    GateStatus, GateTable,
};
use crate::learning::{DecisionAction, PromotionEngine, PromotionPolicy};
use crate::store::StateStore;

/// Persists every attempt and fix of the running gate before the loop moves on.
struct RunSink<'a> {
    store: &'a dyn StateStore,
    run: &'a mut PipelineRun,
}

impl AttemptSink for RunSink<'_> {
    fn record_attempt(&mut self, attempt: &AttemptRecord) -> Result<(), PipelineError> {
        let gate = Some(attempt.gate_id.as_str());
        self.run.retry_count = attempt.retry_count;
        self.run.artifact_hash = Some(attempt.artifact_hash.clone());
        self.run.last_errors = attempt.issues.iter().map(ToString::to_string).collect();
        self.run.record(
            RunEventKind::AttemptFailed,
            gate,
            format!(
                "attempt {} failed with {} issue(s)",
                attempt.retry_count,
                attempt.issues.len()
            ),
        );
        self.run.persist(self.store)?;
        Ok(())
    }

    fn record_external_edit(&mut self, gate_id: &str, hash: &str) -> Result<(), PipelineError> {
        self.run.artifact_hash = Some(hash.to_string());
        self.run
            .record(RunEventKind::ExternalEdit, Some(gate_id), &hash[..hash.len().min(12)]);
        self.run.persist(self.store)?;
        Ok(())
    }

    fn record_fix(&mut self, gate_id: &str, fix: &FixRecord) -> Result<(), PipelineError> {
        let detail = match (&fix.to_hash, &fix.error) {
            (Some(hash), _) => {
                self.run.artifact_hash = Some(hash.clone());
                format!("committed {}", &hash[..hash.len().min(12)])
            }
            (None, Some(err)) => {
                self.run.last_errors.push(err.to_string());
                err.to_string()
            }
            (None, None) => "no change".to_string(),
        };
        self.run.gate_fixes.push(fix.clone());
        self.run.record(RunEventKind::FixApplied, Some(gate_id), detail);
        self.run.persist(self.store)?;
        Ok(())
    }
}

/// Drives runs through the gate table.
pub struct Orchestrator {
    table: GateTable,
    store: Arc<dyn StateStore>,
    artifacts: Arc<dyn ArtifactStore>,
    advisory: Arc<dyn AdvisoryClient>,
    engine: PromotionEngine,
    escalations: EscalationHandler,
}

impl Orchestrator {
    pub fn new(
        table: GateTable,
        store: Arc<dyn StateStore>,
        artifacts: Arc<dyn ArtifactStore>,
        advisory: Arc<dyn AdvisoryClient>,
        policy: PromotionPolicy,
    ) -> Self {
        let engine = PromotionEngine::new(store.clone(), policy);
        let escalations = EscalationHandler::new(store.clone(), artifacts.clone());
        Self {
            table,
            store,
            artifacts,
            advisory,
            engine,
            escalations,
        }
    }

    pub fn table(&self) -> &GateTable {
        &self.table
    }

    pub fn engine(&self) -> &PromotionEngine {
        &self.engine
    }

    pub fn escalations(&self) -> &EscalationHandler {
        &self.escalations
    }

    /// Create and persist a run for `spec_reference`. No gate runs yet.
    pub fn start(&self, spec_reference: &str) -> Result<String, PipelineError> {
        let snapshot = self.artifacts.read(spec_reference)?;
        let resolver = TaskResolver::new(self.table.graph().clone());
        let id = Uuid::new_v4().to_string();

        let mut run = PipelineRun::new(id.clone(), spec_reference, resolver.snapshot());
        run.artifact_hash = Some(snapshot.hash);
        run.record(
            RunEventKind::Created,
            None,
            format!("{} gate(s)", self.table.len()),
        );
        run.persist(self.store.as_ref())?;
        info!(run = %id, spec = spec_reference, gates = self.table.len(), "run created");
        Ok(id)
    }

    /// Start a run and drive it until it completes or halts.
    pub async fn run(&self, spec_reference: &str) -> Result<RunResult, PipelineError> {
        let id = self.start(spec_reference)?;
        self.resume(&id).await
    }

    pub fn status(&self, run_id: &str) -> Result<PipelineRun, PipelineError> {
        self.store
            .load_run(run_id)?
            .ok_or_else(|| PipelineError::RunNotFound(run_id.to_string()))
    }

    /// All runs, oldest first.
    pub fn list(&self) -> Result<Vec<PipelineRun>, PipelineError> {
        let mut runs = Vec::new();
        for id in self.store.list_runs()? {
            if let Some(run) = self.store.load_run(&id)? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    /// Result view of a stored run, with its open escalation if halted.
    pub fn result(&self, run: &PipelineRun) -> Result<RunResult, PipelineError> {
        let escalation = match (&run.status, &run.current_gate_id) {
            (RunStatus::Gutter, Some(gate)) => self.escalations.load(&run.id, gate)?,
            _ => None,
        };
        Ok(RunResult::from_run(run).with_escalation(escalation))
    }

    /// Drive `run_id` from its last persisted state.
    ///
    /// A COMPLETE run is returned as is, and so is a GUTTER run that has not
    /// been remediated. Neither writes anything unless an earlier process
    /// stopped before settling the run's outcomes.
    #[tracing::instrument(skip(self), fields(run = run_id))]
    pub async fn resume(&self, run_id: &str) -> Result<RunResult, PipelineError> {
        let mut run = self.status(run_id)?;
        match run.status {
            RunStatus::Complete | RunStatus::Gutter => {
                info!(status = %run.status, "run is not resumable; returning recorded result");
                self.settle(&mut run)?;
                return self.result(&run);
            }
            RunStatus::Pending | RunStatus::Running | RunStatus::Passed => {}
        }

        let mut resolver = TaskResolver::restore(self.table.graph().clone(), &run.tasks)?;
        if run.status == RunStatus::Pending {
            let kind = if run.history.iter().any(|e| e.kind == RunEventKind::Started) {
                RunEventKind::Resumed
            } else {
                RunEventKind::Started
            };
            run.status = RunStatus::Running;
            run.record(kind, None, "");
            run.persist(self.store.as_ref())?;
        }
        // A gate exit interrupted before its learnings were decided.
        self.drain_learnings(&mut run)?;

        loop {
            if self.store.cancel_requested(&run.id)? {
                self.mark_cancelled(&mut run)?;
                return self.result(&run);
            }

            let gate_id = match resolver.running_tasks().into_iter().next() {
                Some(id) => {
                    info!(gate = %id, retry_count = run.retry_count, "resuming gate");
                    id
                }
                None => match resolver.next_ready() {
                    Some(id) => {
                        self.enter_gate(&mut run, &mut resolver, &id)?;
                        id
                    }
                    None => break,
                },
            };
            let gate = self
                .table
                .get(&gate_id)
                .ok_or_else(|| TaskError::UnknownTask(gate_id.clone()))?;

            if run.retry_count >= gate.max_retries {
                // Budget was spent before an interruption.
                return self.escalate(run, &mut resolver, gate, EscalationReason::BudgetExhausted, None);
            }

            let result = match self.execute(&mut run, gate).await {
                Ok(result) => result,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(gate = %gate.id, error = %e, "gate could not run");
                    let reason = EscalationReason::ExecutorError {
                        message: e.to_string(),
                    };
                    return self.escalate(run, &mut resolver, gate, reason, None);
                }
            };

            // The gate exit and what it observed become durable in one write.
            run.stage_gate_exit(&result);
            match result.status {
                GateStatus::Passed => {
                    let metrics =
                        run.gate_metrics(&gate.id, GateStatus::Passed, Some(&result.last_assessment));
                    self.store.save_gate_metrics(&metrics)?;
                    resolver.mark_complete(&gate.id)?;
                    run.tasks = resolver.snapshot();
                    run.status = RunStatus::Passed;
                    run.artifact_hash = Some(result.final_hash.clone());
                    run.reset_gate_state();
                    run.record(
                        RunEventKind::GatePassed,
                        Some(&gate.id),
                        format!("after {} attempt(s)", result.attempts),
                    );
                    run.persist(self.store.as_ref())?;
                    self.drain_learnings(&mut run)?;
                    info!(gate = %gate.id, attempts = result.attempts, "gate passed");
                }
                GateStatus::Gutter => {
                    return self.escalate(
                        run,
                        &mut resolver,
                        gate,
                        EscalationReason::BudgetExhausted,
                        Some(result.last_assessment),
                    );
                }
            }
        }

        run.status = RunStatus::Complete;
        run.current_gate_id = None;
        run.record(RunEventKind::Completed, None, "");
        run.persist(self.store.as_ref())?;
        self.settle(&mut run)?;
        info!("run complete");
        self.result(&run)
    }

    /// Cancel a run.
    ///
    /// A run that is not executing is cancelled at once. An executing run
    /// gets a durable request that it honours before its next gate.
    pub fn cancel(&self, run_id: &str) -> Result<PipelineRun, PipelineError> {
        let mut run = self.status(run_id)?;
        match run.status {
            RunStatus::Complete => {}
            RunStatus::Running | RunStatus::Passed => {
                self.store.request_cancel(run_id)?;
                info!(run = run_id, "cancel requested");
            }
            RunStatus::Pending | RunStatus::Gutter => self.mark_cancelled(&mut run)?,
        }
        Ok(run)
    }

    /// Human signal that a GUTTER run may continue. The escalated gate gets
    /// a fresh budget on the next `resume`.
    pub fn remediate(&self, run_id: &str, note: &str) -> Result<PipelineRun, PipelineError> {
        let mut run = self.status(run_id)?;
        if run.status != RunStatus::Gutter {
            return Err(PipelineError::InvalidState {
                run_id: run_id.to_string(),
                status: run.status.to_string(),
                action: "remediate".to_string(),
            });
        }
        let gate_id = run
            .current_gate_id
            .clone()
            .ok_or_else(|| PipelineError::CorruptState {
                location: format!("run {}", run_id),
                reason: "GUTTER run has no current gate".to_string(),
            })?;

        self.escalations.remediate(run_id, &gate_id, note)?;
        let mut resolver = TaskResolver::restore(self.table.graph().clone(), &run.tasks)?;
        resolver.retry(&gate_id)?;
        run.tasks = resolver.snapshot();
        run.reset_gate_state();
        run.status = RunStatus::Pending;
        run.record(RunEventKind::Remediated, Some(&gate_id), note);
        run.persist(self.store.as_ref())?;
        info!(run = run_id, gate = %gate_id, "run remediated");
        Ok(run)
    }

    fn enter_gate(
        &self,
        run: &mut PipelineRun,
        resolver: &mut TaskResolver,
        gate_id: &str,
    ) -> Result<(), PipelineError> {
        resolver.mark_running(gate_id)?;
        run.tasks = resolver.snapshot();
        run.current_gate_id = Some(gate_id.to_string());
        run.status = RunStatus::Running;
        run.reset_gate_state();
        run.gate_entry_hash = match self.artifacts.read(&run.spec_reference) {
            Ok(snapshot) => Some(snapshot.hash),
            Err(e) => {
                warn!(gate = gate_id, error = %e, "artifact unreadable on gate entry");
                None
            }
        };
        run.record(RunEventKind::GateEntered, Some(gate_id), "");
        run.persist(self.store.as_ref())?;
        info!(gate = gate_id, "gate entered");
        Ok(())
    }

    async fn execute(&self, run: &mut PipelineRun, gate: &Gate) -> Result<GateResult, PipelineError> {
        let invariants = self.store.list_invariants()?;
        let run_id = run.id.clone();
        let spec_reference = run.spec_reference.clone();
        let ctx = GateContext {
            run_id: &run_id,
            spec_reference: &spec_reference,
            invariants: &invariants,
            retry_count: run.retry_count,
            known_hash: run.artifact_hash.clone(),
            previous_errors: run.last_errors.clone(),
        };
        let executor = GateExecutor::new(self.artifacts.as_ref(), self.advisory.as_ref());
        let mut sink = RunSink {
            store: self.store.as_ref(),
            run,
        };
        executor.run_gate(gate, ctx, &mut sink).await
    }

    /// Apply what a run that reached COMPLETE or GUTTER observed: decide
    /// its learnings, then record each invariant outcome. Every step is
    /// persisted and the engine records one outcome per run, so a settle cut
    /// short by a crash is finished by the next `resume`.
    fn settle(&self, run: &mut PipelineRun) -> Result<(), PipelineError> {
        self.drain_learnings(run)?;
        while let Some(outcome) = run.pending_outcomes.first().cloned() {
            let (kind, updated) = if outcome.satisfied {
                (
                    RunEventKind::InvariantValidated,
                    self.engine.validate(&outcome.invariant_id, &run.id)?,
                )
            } else {
                (
                    RunEventKind::InvariantViolated,
                    self.engine.violate(&outcome.invariant_id, &run.id, None)?,
                )
            };
            if let Some(inv) = updated {
                run.record(
                    kind,
                    Some(&outcome.gate_id),
                    format!("{} confidence {:.3} ({})", inv.id, inv.confidence, inv.status),
                );
            }
            run.pending_outcomes.remove(0);
            run.persist(self.store.as_ref())?;
        }
        Ok(())
    }

    /// Decide every pending learning, persisting after each one.
    fn drain_learnings(&self, run: &mut PipelineRun) -> Result<(), PipelineError> {
        while let Some(learning) = run.pending_learnings.first().cloned() {
            let decision = self.engine.process(&learning)?;
            if decision.action == DecisionAction::Accept
                && !run.local_learnings.iter().any(|l| l.id == learning.id)
            {
                run.local_learnings.push(learning.clone());
            }
            run.pending_learnings.remove(0);
            run.record(
                RunEventKind::LearningDecided,
                Some(&learning.source_gate_id),
                format!("{} ({:.2}) {}", decision.action, learning.confidence, learning.observation),
            );
            run.persist(self.store.as_ref())?;
        }
        Ok(())
    }

    fn escalate(
        &self,
        mut run: PipelineRun,
        resolver: &mut TaskResolver,
        gate: &Gate,
        reason: EscalationReason,
        last_assessment: Option<Assessment>,
    ) -> Result<RunResult, PipelineError> {
        let metrics = run.gate_metrics(&gate.id, GateStatus::Gutter, last_assessment.as_ref());
        self.store.save_gate_metrics(&metrics)?;
        let record = self
            .escalations
            .escalate(&run, &gate.id, reason, last_assessment)?;
        resolver.mark_failed(&gate.id)?;
        run.tasks = resolver.snapshot();
        run.status = RunStatus::Gutter;
        run.current_gate_id = Some(gate.id.clone());
        run.record(
            RunEventKind::Escalated,
            Some(&gate.id),
            record.reason.describe(),
        );
        run.persist(self.store.as_ref())?;
        self.settle(&mut run)?;
        Ok(RunResult::from_run(&run).with_escalation(Some(record)))
    }

    fn mark_cancelled(&self, run: &mut PipelineRun) -> Result<(), PipelineError> {
        run.status = RunStatus::Complete;
        run.cancelled = true;
        let gate = run.current_gate_id.clone();
        run.record(RunEventKind::Cancelled, gate.as_deref(), "");
        run.persist(self.store.as_ref())?;
        self.store.clear_cancel(&run.id)?;
        self.settle(run)?;
        info!(run = %run.id, "run cancelled");
        Ok(())
    }
}
