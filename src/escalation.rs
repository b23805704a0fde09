//! Escalation ("gutter") records.
//!
//! When a gate cannot pass within its budget, or fails in a way the retry
//! loop cannot absorb, the run halts and everything an operator needs to
//! decide what to do is persisted here, keyed by run and gate. Escalating
//! never ends the process; the orchestrator returns a GUTTER result and a
//! later `remediate` plus `resume` re-enters the gate with a fresh budget.

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::artifact::{ArtifactStore, unified_diff};
use crate::errors::PipelineError;
use crate::gates::{Assessment, FixRecord};
use crate::orchestrator::PipelineRun;
use crate::store::StateStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    /// Every allowed assessment failed.
    BudgetExhausted,
    /// The gate could not be run at all.
    ExecutorError { message: String },
}

impl EscalationReason {
    pub fn describe(&self) -> String {
        match self {
            EscalationReason::BudgetExhausted => "retry budget exhausted".to_string(),
            EscalationReason::ExecutorError { message } => format!("executor error: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub run_id: String,
    pub gate_id: String,
    pub escalated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub reason: EscalationReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_assessment: Option<Assessment>,
    #[serde(default)]
    pub fix_attempts: Vec<FixRecord>,
    /// Unified diff from the artifact as it entered the gate to the artifact
    /// as it stood at escalation.
    #[serde(default)]
    pub artifact_diff: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_note: Option<String>,
}

impl EscalationRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Plain-text report for the terminal.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Gate '{}' escalated at {}", self.gate_id, self.escalated_at.to_rfc3339());
        let _ = writeln!(out, "  reason:   {}", self.reason.describe());
        let _ = writeln!(out, "  attempts: {}", self.retry_count);
        if let Some(assessment) = &self.last_assessment {
            let _ = writeln!(out, "  last assessment ({}):", &assessment.artifact_hash[..assessment.artifact_hash.len().min(12)]);
            for issue in &assessment.issues {
                let _ = writeln!(out, "    - {}", issue);
            }
        }
        if !self.fix_attempts.is_empty() {
            let _ = writeln!(out, "  fixes:");
            for fix in &self.fix_attempts {
                match (&fix.to_hash, &fix.error) {
                    (Some(hash), _) => {
                        let _ = writeln!(out, "    #{} committed {}", fix.attempt, &hash[..hash.len().min(12)]);
                    }
                    (None, Some(err)) => {
                        let _ = writeln!(out, "    #{} {}", fix.attempt, err);
                    }
                    (None, None) => {
                        let _ = writeln!(out, "    #{} no change", fix.attempt);
                    }
                }
            }
        }
        if !self.artifact_diff.is_empty() {
            let _ = writeln!(out, "  diff since gate entry:");
            for line in self.artifact_diff.lines() {
                let _ = writeln!(out, "    {}", line);
            }
        }
        if let Some(at) = self.resolved_at {
            let _ = writeln!(
                out,
                "  resolved at {}: {}",
                at.to_rfc3339(),
                self.remediation_note.as_deref().unwrap_or("")
            );
        }
        out
    }
}

/// Persists escalations and their remediation.
pub struct EscalationHandler {
    store: Arc<dyn StateStore>,
    artifacts: Arc<dyn ArtifactStore>,
}

impl EscalationHandler {
    pub fn new(store: Arc<dyn StateStore>, artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { store, artifacts }
    }

    /// Record the failure context of `gate_id` for `run`.
    ///
    /// The run itself is not touched; the caller moves it to GUTTER after
    /// this returns.
    pub fn escalate(
        &self,
        run: &PipelineRun,
        gate_id: &str,
        reason: EscalationReason,
        last_assessment: Option<Assessment>,
    ) -> Result<EscalationRecord, PipelineError> {
        let record = EscalationRecord {
            run_id: run.id.clone(),
            gate_id: gate_id.to_string(),
            escalated_at: Utc::now(),
            retry_count: run.retry_count,
            reason,
            last_assessment,
            fix_attempts: run.gate_fixes.clone(),
            artifact_diff: self.diff_since_entry(run),
            resolved_at: None,
            remediation_note: None,
        };
        self.store.save_escalation(&record)?;
        warn!(
            run = %run.id,
            gate = gate_id,
            retry_count = record.retry_count,
            reason = %record.reason.describe(),
            "gate escalated"
        );
        Ok(record)
    }

    /// Mark the escalation of `gate_id` resolved.
    pub fn remediate(&self, run_id: &str, gate_id: &str, note: &str) -> Result<EscalationRecord, PipelineError> {
        let Some(mut record) = self.store.load_escalation(run_id, gate_id)? else {
            return Err(PipelineError::InvalidState {
                run_id: run_id.to_string(),
                status: format!("without an escalation record for gate '{}'", gate_id),
                action: "remediate".to_string(),
            });
        };
        record.resolved_at = Some(Utc::now());
        record.remediation_note = Some(note.to_string());
        self.store.save_escalation(&record)?;
        info!(run = run_id, gate = gate_id, "escalation resolved");
        Ok(record)
    }

    pub fn load(&self, run_id: &str, gate_id: &str) -> Result<Option<EscalationRecord>, PipelineError> {
        Ok(self.store.load_escalation(run_id, gate_id)?)
    }

    fn diff_since_entry(&self, run: &PipelineRun) -> String {
        let current = match self.artifacts.read(&run.spec_reference) {
            Ok(snapshot) => snapshot.content,
            Err(e) => return format!("(diff unavailable: {})", e),
        };
        let entry = run
            .gate_entry_hash
            .as_deref()
            .map(|hash| self.artifacts.load_version(&run.spec_reference, hash));
        match entry {
            Some(Ok(Some(before))) => unified_diff(&before, &current, &run.spec_reference),
            Some(Err(e)) => format!("(diff unavailable: {})", e),
            Some(Ok(None)) | None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use crate::gates::{Issue, IssueCode};
    use crate::store::MemoryStateStore;

    fn handler() -> (Arc<MemoryStateStore>, Arc<MemoryArtifactStore>, EscalationHandler) {
        let store = Arc::new(MemoryStateStore::new());
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let handler = EscalationHandler::new(store.clone(), artifacts.clone());
        (store, artifacts, handler)
    }

    fn assessment(hash: &str) -> Assessment {
        Assessment {
            passed: false,
            issues: vec![Issue::new(IssueCode::CheckFailed, "Missing required section 'Errors'")],
            artifact_hash: hash.to_string(),
            advisory_confidence: None,
            assessed_at: Utc::now(),
        }
    }

    #[test]
    fn test_escalation_persists_full_context() {
        let (store, artifacts, handler) = handler();
        let entry = artifacts.put("spec.md", "line one\n").unwrap();
        let now = artifacts.put("spec.md", "line one\nline two\n").unwrap();

        let mut run = PipelineRun::new("run-1", "spec.md", Vec::new());
        run.retry_count = 3;
        run.gate_entry_hash = Some(entry.hash.clone());
        run.gate_fixes.push(FixRecord {
            attempt: 1,
            instruction: "add errors".into(),
            from_hash: entry.hash.clone(),
            to_hash: Some(now.hash.clone()),
            error: None,
            at: Utc::now(),
        });

        let record = handler
            .escalate(&run, "structure", EscalationReason::BudgetExhausted, Some(assessment(&now.hash)))
            .unwrap();

        assert_eq!(record.retry_count, 3);
        assert_eq!(record.fix_attempts.len(), 1);
        assert!(record.artifact_diff.contains("+line two"));
        assert_eq!(store.load_escalation("run-1", "structure").unwrap(), Some(record.clone()));

        let report = record.render();
        assert!(report.contains("retry budget exhausted"));
        assert!(report.contains("[CHECK_FAILED]"));
    }

    #[test]
    fn test_diff_unavailable_when_artifact_missing() {
        let (_store, _artifacts, handler) = handler();
        let run = PipelineRun::new("run-1", "gone.md", Vec::new());
        let record = handler
            .escalate(
                &run,
                "g1",
                EscalationReason::ExecutorError {
                    message: "artifact not found".into(),
                },
                None,
            )
            .unwrap();
        assert!(record.artifact_diff.starts_with("(diff unavailable"));
    }

    #[test]
    fn test_remediate_marks_resolved() {
        let (_store, artifacts, handler) = handler();
        artifacts.put("spec.md", "x").unwrap();
        let run = PipelineRun::new("run-1", "spec.md", Vec::new());
        handler
            .escalate(&run, "g1", EscalationReason::BudgetExhausted, None)
            .unwrap();

        let record = handler.remediate("run-1", "g1", "rewrote the intro").unwrap();
        assert!(record.is_resolved());
        assert_eq!(record.remediation_note.as_deref(), Some("rewrote the intro"));
        assert!(handler.load("run-1", "g1").unwrap().unwrap().is_resolved());
    }

    #[test]
    fn test_remediate_without_record_is_rejected() {
        let (_store, _artifacts, handler) = handler();
        assert!(matches!(
            handler.remediate("run-1", "g1", "note"),
            Err(PipelineError::InvalidState { .. })
        ));
    }
}
