//! Gate executor: the assess → fix → commit → re-validate loop.
//!
//! Each pass through the loop starts from a fresh read of the artifact, so no
//! pass state survives between attempts. A failed assessment costs one unit
//! of the gate's budget; when the budget is spent the gate ends in GUTTER and
//! the caller escalates. A fix request only ever sees the current violations
//! and the error text of the attempt immediately before it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Gate, Issue, IssueCode};
use crate::advisory::{AdvisoryClient, AdvisoryRequest, SurfacedLearning};
use crate::artifact::{ArtifactSnapshot, ArtifactStore};
use crate::errors::{AdvisoryError, ArtifactError, PipelineError};
use crate::learning::{Invariant, Learning};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    Passed,
    Gutter,
}

/// Outcome of one assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub passed: bool,
    pub issues: Vec<Issue>,
    pub artifact_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory_confidence: Option<f64>,
    pub assessed_at: DateTime<Utc>,
}

/// One fix step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixRecord {
    pub attempt: u32,
    pub instruction: String,
    pub from_hash: String,
    /// Hash of the committed revision, if one was committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_hash: Option<String>,
    /// Why no revision was committed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Issue>,
    pub at: DateTime<Utc>,
}

/// Reported to the sink after every failed assessment.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub gate_id: String,
    pub attempt: u32,
    pub retry_count: u32,
    pub issues: Vec<Issue>,
    pub artifact_hash: String,
    pub external_edit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantOutcome {
    pub invariant_id: String,
    pub satisfied: bool,
}

#[derive(Debug, Clone)]
pub struct GateResult {
    pub gate_id: String,
    pub status: GateStatus,
    /// Assessments made in this call.
    pub attempts: u32,
    /// 0 after a pass; the spent budget after GUTTER.
    pub retry_count: u32,
    /// Issues of the last assessment.
    pub issues: Vec<Issue>,
    pub fixes_applied: Vec<FixRecord>,
    pub learnings: Vec<Learning>,
    pub last_assessment: Assessment,
    pub invariant_outcomes: Vec<InvariantOutcome>,
    pub final_hash: String,
    pub external_edits: u32,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.status == GateStatus::Passed
    }
}

/// Receives write-ahead notifications while a gate runs.
pub trait AttemptSink: Send {
    /// Called after a failed assessment, before any fix is attempted.
    fn record_attempt(&mut self, attempt: &AttemptRecord) -> Result<(), PipelineError>;

    /// Called when the artifact changed outside the pipeline.
    fn record_external_edit(&mut self, _gate_id: &str, _hash: &str) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Called after each fix step.
    fn record_fix(&mut self, _gate_id: &str, _fix: &FixRecord) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Sink that drops every notification.
impl AttemptSink for () {
    fn record_attempt(&mut self, _attempt: &AttemptRecord) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Per-call inputs.
pub struct GateContext<'a> {
    pub run_id: &'a str,
    pub spec_reference: &'a str,
    /// Invariants to enforce; inactive or out-of-scope entries are ignored.
    pub invariants: &'a [Invariant],
    /// Budget already spent on this gate (non-zero when resuming mid-gate).
    pub retry_count: u32,
    /// Hash the caller last saw; a different hash on read is an external edit.
    pub known_hash: Option<String>,
    /// Errors of the attempt before this call, when resuming.
    pub previous_errors: Vec<String>,
}

struct Evaluation {
    assessment: Assessment,
    outcomes: Vec<InvariantOutcome>,
    surfaced: Vec<SurfacedLearning>,
}

pub struct GateExecutor<'a> {
    artifacts: &'a dyn ArtifactStore,
    advisory: &'a dyn AdvisoryClient,
}

impl<'a> GateExecutor<'a> {
    pub fn new(artifacts: &'a dyn ArtifactStore, advisory: &'a dyn AdvisoryClient) -> Self {
        Self {
            artifacts,
            advisory,
        }
    }

    /// Run `gate` until it passes or its retry budget is spent.
    ///
    /// Returns `Err` only for failures outside the gate's own judgement, such
    /// as an unreadable artifact or a sink that cannot persist.
    #[tracing::instrument(skip_all, fields(gate = %gate.id, run = ctx.run_id))]
    pub async fn run_gate(
        &self,
        gate: &Gate,
        ctx: GateContext<'_>,
        sink: &mut dyn AttemptSink,
    ) -> Result<GateResult, PipelineError> {
        let mut retry_count = ctx.retry_count;
        let mut known_hash = ctx.known_hash.clone();
        let mut previous_errors = ctx.previous_errors.clone();
        let mut attempts = 0u32;
        let mut external_edits = 0u32;
        let mut fixes_applied = Vec::new();
        let mut learnings: Vec<Learning> = Vec::new();

        loop {
            let snapshot = self.artifacts.read(ctx.spec_reference)?;
            let external_edit = known_hash
                .as_deref()
                .is_some_and(|known| known != snapshot.hash);
            if external_edit {
                external_edits += 1;
                warn!(
                    expected = known_hash.as_deref().unwrap_or_default(),
                    found = snapshot.short_hash(),
                    "artifact changed outside the pipeline; assessing the new version"
                );
                sink.record_external_edit(&gate.id, &snapshot.hash)?;
            }
            known_hash = Some(snapshot.hash.clone());

            attempts += 1;
            let Evaluation {
                assessment,
                outcomes,
                surfaced,
            } = self.assess(gate, &ctx, &snapshot).await;
            collect_learnings(&mut learnings, surfaced, ctx.run_id, &gate.id);

            if assessment.passed {
                info!(attempts, "gate passed");
                let invariant_outcomes = exit_outcomes(gate, ctx.invariants, outcomes, true);
                return Ok(GateResult {
                    gate_id: gate.id.clone(),
                    status: GateStatus::Passed,
                    attempts,
                    retry_count: 0,
                    issues: Vec::new(),
                    fixes_applied,
                    learnings,
                    final_hash: snapshot.hash,
                    last_assessment: assessment,
                    invariant_outcomes,
                    external_edits,
                });
            }

            retry_count += 1;
            warn!(
                retry_count,
                max_retries = gate.max_retries,
                issues = assessment.issues.len(),
                "gate assessment failed"
            );
            for issue in &assessment.issues {
                debug!(%issue, "violation");
            }
            sink.record_attempt(&AttemptRecord {
                gate_id: gate.id.clone(),
                attempt: attempts,
                retry_count,
                issues: assessment.issues.clone(),
                artifact_hash: snapshot.hash.clone(),
                external_edit,
            })?;

            if retry_count >= gate.max_retries {
                warn!(retry_count, "retry budget exhausted");
                let invariant_outcomes = exit_outcomes(gate, ctx.invariants, outcomes, false);
                return Ok(GateResult {
                    gate_id: gate.id.clone(),
                    status: GateStatus::Gutter,
                    attempts,
                    retry_count,
                    issues: assessment.issues.clone(),
                    fixes_applied,
                    learnings,
                    final_hash: snapshot.hash,
                    last_assessment: assessment,
                    invariant_outcomes,
                    external_edits,
                });
            }

            let instruction = fix_instruction(gate, &assessment.issues, &previous_errors);
            let fix = self
                .fix(gate, ctx.spec_reference, &snapshot, instruction, attempts)
                .await?;
            if let Some(hash) = &fix.to_hash {
                known_hash = Some(hash.clone());
            }
            sink.record_fix(&gate.id, &fix)?;

            previous_errors = assessment.issues.iter().map(Issue::to_string).collect();
            if let Some(err) = &fix.error {
                previous_errors.push(err.to_string());
            }
            fixes_applied.push(fix);
        }
    }

    async fn assess(&self, gate: &Gate, ctx: &GateContext<'_>, snapshot: &ArtifactSnapshot) -> Evaluation {
        let content = snapshot.content.as_str();
        let mut issues: Vec<Issue> = gate
            .pass_condition
            .checks
            .iter()
            .filter_map(|check| check.evaluate(content))
            .map(|msg| Issue::new(IssueCode::CheckFailed, msg))
            .collect();

        let mut outcomes = Vec::new();
        for invariant in in_scope(gate, ctx.invariants) {
            let Some(spec) = &invariant.check else {
                continue;
            };
            let check = match spec.compile(&invariant.id) {
                Ok(check) => check,
                Err(e) => {
                    warn!(invariant = %invariant.id, error = %e, "skipping invariant with invalid check");
                    continue;
                }
            };
            let violation = check.evaluate(content);
            outcomes.push(InvariantOutcome {
                invariant_id: invariant.id.clone(),
                satisfied: violation.is_none(),
            });
            if let Some(msg) = violation {
                issues.push(Issue::for_invariant(
                    &invariant.id,
                    format!("{} (invariant: {})", msg, invariant.rule),
                ));
            }
        }

        let mut advisory_confidence = None;
        let mut surfaced = Vec::new();
        if let Some(requirement) = &gate.pass_condition.advisory {
            let request = AdvisoryRequest::assess(&gate.id, content, requirement.output_schema.as_ref());
            match self.advisory.advise(&request).await {
                Ok(response) => {
                    surfaced = response.learnings();
                    match response.confidence {
                        None => issues.push(Issue::new(
                            IssueCode::AdvisoryMalformed,
                            "assessment carried no confidence",
                        )),
                        Some(confidence) => {
                            advisory_confidence = Some(confidence);
                            if confidence < requirement.min_confidence {
                                issues.push(Issue::new(
                                    IssueCode::AdvisoryRejected,
                                    format!(
                                        "advisory confidence {:.2} below required {:.2}",
                                        confidence, requirement.min_confidence
                                    ),
                                ));
                                issues.extend(
                                    response
                                        .issues
                                        .iter()
                                        .map(|i| Issue::new(IssueCode::AdvisoryRejected, i.clone())),
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(backend = self.advisory.name(), error = %e, "advisory assessment failed");
                    issues.push(advisory_issue(&e));
                }
            }
        }

        Evaluation {
            assessment: Assessment {
                passed: issues.is_empty(),
                issues,
                artifact_hash: snapshot.hash.clone(),
                advisory_confidence,
                assessed_at: Utc::now(),
            },
            outcomes,
            surfaced,
        }
    }

    async fn fix(
        &self,
        gate: &Gate,
        reference: &str,
        snapshot: &ArtifactSnapshot,
        instruction: String,
        attempt: u32,
    ) -> Result<FixRecord, PipelineError> {
        let request = AdvisoryRequest::fix_suggest(&gate.id, &snapshot.content, instruction.clone());
        let mut record = FixRecord {
            attempt,
            instruction,
            from_hash: snapshot.hash.clone(),
            to_hash: None,
            error: None,
            at: Utc::now(),
        };

        let response = match self.advisory.advise(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "fix request failed");
                record.error = Some(advisory_issue(&e));
                return Ok(record);
            }
        };

        let revised = match response.revised_content() {
            Some(revised) if revised != snapshot.content => revised,
            _ => {
                record.error = Some(Issue::new(
                    IssueCode::FixUnavailable,
                    "advisory returned no revision",
                ));
                return Ok(record);
            }
        };

        let message = format!("{}: fix attempt {}", gate.id, attempt);
        match self
            .artifacts
            .commit(reference, &snapshot.hash, revised, &message)
        {
            Ok(committed) => {
                info!(attempt, to = committed.short_hash(), "fix committed");
                record.to_hash = Some(committed.hash);
            }
            Err(ArtifactError::Conflict { actual, .. }) => {
                warn!(attempt, "artifact changed before the fix could be committed");
                record.error = Some(Issue::new(
                    IssueCode::ArtifactConflict,
                    format!(
                        "artifact changed underneath the fix (now {})",
                        &actual[..actual.len().min(12)]
                    ),
                ));
            }
            Err(e) => return Err(e.into()),
        }
        Ok(record)
    }
}

fn advisory_issue(err: &AdvisoryError) -> Issue {
    match err {
        AdvisoryError::Unavailable(msg) => Issue::new(IssueCode::AdvisoryUnavailable, msg.clone()),
        AdvisoryError::Malformed(msg) => Issue::new(IssueCode::AdvisoryMalformed, msg.clone()),
    }
}

fn in_scope<'i>(gate: &'i Gate, invariants: &'i [Invariant]) -> impl Iterator<Item = &'i Invariant> {
    invariants
        .iter()
        .filter(move |inv| inv.is_active() && inv.applies_to(&gate.id))
}

/// Checked invariants report their last evaluation; unchecked ones count as
/// satisfied when the gate passes and are left alone otherwise.
fn exit_outcomes(
    gate: &Gate,
    invariants: &[Invariant],
    mut checked: Vec<InvariantOutcome>,
    passed: bool,
) -> Vec<InvariantOutcome> {
    if passed {
        checked.extend(
            in_scope(gate, invariants)
                .filter(|inv| inv.check.is_none())
                .map(|inv| InvariantOutcome {
                    invariant_id: inv.id.clone(),
                    satisfied: true,
                }),
        );
    }
    checked
}

/// Every surfaced learning is kept, repeats included, so each gets its own
/// decision. Repeats of one rule are merged by the promotion engine.
fn collect_learnings(into: &mut Vec<Learning>, surfaced: Vec<SurfacedLearning>, run_id: &str, gate_id: &str) {
    for s in surfaced {
        let mut learning = Learning::new(run_id, gate_id, s.observation, s.confidence);
        learning.scope = s.scope;
        learning.check = s.check;
        debug!(learning = %learning.id, invariant = %learning.invariant_id(), "learning surfaced");
        into.push(learning);
    }
}

/// Instruction for a fix request: the current violations plus, if any, the
/// errors of the attempt immediately before.
pub fn fix_instruction(gate: &Gate, issues: &[Issue], previous_errors: &[String]) -> String {
    let mut text = format!(
        "Revise the spec so it passes gate '{}' ({}).\n\nCurrent violations:\n",
        gate.name, gate.id
    );
    for issue in issues {
        text.push_str(&format!("- {}\n", issue));
    }
    if !previous_errors.is_empty() {
        text.push_str("\nErrors from the previous attempt:\n");
        for err in previous_errors {
            text.push_str(&format!("- {}\n", err));
        }
    }
    text.push_str("\nReturn the complete revised document in structured_fields.revised_content.");
    text
}
