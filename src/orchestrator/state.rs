use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{Task, TaskStatus};
use crate::errors::StoreError;
use crate::escalation::EscalationRecord;
use crate::gates::{Assessment, FixRecord, GateResult, GateStatus};
use crate::learning::Learning;
use crate::store::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Created, no gate entered yet (or remediated and waiting for resume).
    Pending,
    Running,
    /// The current gate passed durably; the next gate has not started.
    Passed,
    Gutter,
    Complete,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Passed => "PASSED",
            RunStatus::Gutter => "GUTTER",
            RunStatus::Complete => "COMPLETE",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Created,
    Started,
    Resumed,
    GateEntered,
    AttemptFailed,
    ExternalEdit,
    FixApplied,
    GatePassed,
    InvariantValidated,
    InvariantViolated,
    LearningDecided,
    Escalated,
    Remediated,
    Cancelled,
    Completed,
}

/// One line of a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    pub at: DateTime<Utc>,
    pub kind: RunEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_id: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

/// An invariant outcome waiting for the run to settle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingOutcome {
    pub gate_id: String,
    pub invariant_id: String,
    pub satisfied: bool,
}

/// Telemetry for one gate exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateMetrics {
    pub run_id: String,
    pub gate_id: String,
    pub outcome: GateStatus,
    /// Assessments since the gate was entered, across resumes.
    pub attempts: u32,
    pub fixes: u32,
    pub external_edits: u32,
    /// Issues left by the last assessment.
    pub open_issues: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_hash: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Durable state of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: String,
    pub spec_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_gate_id: Option<String>,
    /// Failed assessments of the current gate.
    pub retry_count: u32,
    pub status: RunStatus,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub history: Vec<RunEvent>,
    pub tasks: Vec<Task>,
    /// Learnings accepted for this run only.
    #[serde(default)]
    pub local_learnings: Vec<Learning>,
    /// Learnings surfaced by a finished gate and not yet decided.
    #[serde(default)]
    pub pending_learnings: Vec<Learning>,
    /// Invariant outcomes of finished gates, applied once the run reaches
    /// COMPLETE or GUTTER.
    #[serde(default)]
    pub pending_outcomes: Vec<PendingOutcome>,
    /// Last artifact hash this run saw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_hash: Option<String>,
    /// Artifact hash when the current gate was entered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_entry_hash: Option<String>,
    /// Fix steps taken in the current gate.
    #[serde(default)]
    pub gate_fixes: Vec<FixRecord>,
    /// Errors of the most recent failed attempt, fed to the next fix request.
    #[serde(default)]
    pub last_errors: Vec<String>,
    /// Stored version; 0 until first persisted.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(id: impl Into<String>, spec_reference: impl Into<String>, tasks: Vec<Task>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            spec_reference: spec_reference.into(),
            current_gate_id: None,
            retry_count: 0,
            status: RunStatus::Pending,
            cancelled: false,
            history: Vec::new(),
            tasks,
            local_learnings: Vec::new(),
            pending_learnings: Vec::new(),
            pending_outcomes: Vec::new(),
            artifact_hash: None,
            gate_entry_hash: None,
            gate_fixes: Vec::new(),
            last_errors: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Version to compare against on the next write.
    pub fn stored_version(&self) -> Option<u64> {
        (self.version > 0).then_some(self.version)
    }

    /// Write this run with compare-and-swap on its version.
    pub fn persist(&mut self, store: &dyn StateStore) -> Result<(), StoreError> {
        let expected = self.stored_version();
        self.version = expected.unwrap_or(0) + 1;
        self.updated_at = Utc::now();
        store.save_run(self, expected)
    }

    pub fn record(&mut self, kind: RunEventKind, gate_id: Option<&str>, detail: impl Into<String>) {
        self.history.push(RunEvent {
            at: Utc::now(),
            kind,
            gate_id: gate_id.map(str::to_string),
            detail: detail.into(),
        });
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn gates_with(&self, status: TaskStatus) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Queue what a finished gate observed, ahead of the write that makes
    /// the gate exit durable. The run keeps one outcome per invariant and a
    /// violation replaces an earlier satisfaction.
    pub(crate) fn stage_gate_exit(&mut self, result: &GateResult) {
        for outcome in &result.invariant_outcomes {
            let existing = self
                .pending_outcomes
                .iter_mut()
                .find(|p| p.invariant_id == outcome.invariant_id);
            match existing {
                Some(pending) => {
                    if pending.satisfied && !outcome.satisfied {
                        pending.satisfied = false;
                        pending.gate_id = result.gate_id.clone();
                    }
                }
                None => self.pending_outcomes.push(PendingOutcome {
                    gate_id: result.gate_id.clone(),
                    invariant_id: outcome.invariant_id.clone(),
                    satisfied: outcome.satisfied,
                }),
            }
        }
        self.pending_learnings.extend(result.learnings.iter().cloned());
    }

    /// Events of `gate_id` since it was last entered.
    fn since_entry(&self, gate_id: &str) -> &[RunEvent] {
        let start = self
            .history
            .iter()
            .rposition(|e| e.kind == RunEventKind::GateEntered && e.gate_id.as_deref() == Some(gate_id))
            .unwrap_or(0);
        &self.history[start..]
    }

    /// Metrics for `gate_id` as it exits with `outcome`. Call before the
    /// per-gate state is reset.
    pub fn gate_metrics(&self, gate_id: &str, outcome: GateStatus, last: Option<&Assessment>) -> GateMetrics {
        let events = self.since_entry(gate_id);
        let count = |kind: RunEventKind| {
            events
                .iter()
                .filter(|e| e.kind == kind && e.gate_id.as_deref() == Some(gate_id))
                .count() as u32
        };
        let failed = count(RunEventKind::AttemptFailed);
        let started_at = events
            .first()
            .filter(|e| e.kind == RunEventKind::GateEntered)
            .map_or(self.created_at, |e| e.at);
        let finished_at = Utc::now();
        GateMetrics {
            run_id: self.id.clone(),
            gate_id: gate_id.to_string(),
            outcome,
            attempts: failed + u32::from(outcome == GateStatus::Passed),
            fixes: self.gate_fixes.len() as u32,
            external_edits: count(RunEventKind::ExternalEdit),
            open_issues: last.map_or(0, |a| a.issues.len() as u32),
            final_confidence: last.and_then(|a| a.advisory_confidence),
            final_hash: last.map(|a| a.artifact_hash.clone()).or_else(|| self.artifact_hash.clone()),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
        }
    }

    /// Clear per-gate state for a fresh attempt budget.
    pub(crate) fn reset_gate_state(&mut self) {
        self.retry_count = 0;
        self.gate_fixes.clear();
        self.last_errors.clear();
    }
}

/// What a caller gets back from driving a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub cancelled: bool,
    pub current_gate_id: Option<String>,
    pub retry_count: u32,
    pub completed_gates: Vec<String>,
    pub escalation: Option<EscalationRecord>,
}

impl RunResult {
    pub fn from_run(run: &PipelineRun) -> Self {
        Self {
            run_id: run.id.clone(),
            status: run.status,
            cancelled: run.cancelled,
            current_gate_id: run.current_gate_id.clone(),
            retry_count: run.retry_count,
            completed_gates: run.gates_with(TaskStatus::Completed),
            escalation: None,
        }
    }

    pub fn with_escalation(mut self, record: Option<EscalationRecord>) -> Self {
        self.escalation = record;
        self
    }

    /// Process exit code: 0 complete, 2 GUTTER, 1 anything else.
    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Complete => 0,
            RunStatus::Gutter => 2,
            RunStatus::Pending | RunStatus::Running | RunStatus::Passed => 1,
        }
    }
}
