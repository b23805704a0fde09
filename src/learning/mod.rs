//! Learnings and invariants.
//!
//! A learning is a single observation surfaced while a gate ran, carrying a
//! confidence score. The promotion engine gives each learning exactly one
//! disposition:
//!
//! | Confidence        | Action    | Effect                                     |
//! |-------------------|-----------|--------------------------------------------|
//! | `>= promote`      | `PROMOTE` | create or revise a global invariant        |
//! | `>= accept`       | `ACCEPT`  | kept on the originating run only           |
//! | below             | `REJECT`  | recorded in the disposition log only       |
//!
//! An operator override always promotes and is tagged as operator-forced.
//!
//! Invariant confidence then moves with evidence. A satisfied invariant is
//! smoothed toward 1 with `c' = c + alpha * (1 - c)`; a violated one decays
//! with `c' = c * (1 - beta)` and is deprecated once it drops below the
//! floor. Both results are clamped to `[0, 1]`.

mod engine;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use engine::PromotionEngine;

use crate::errors::ConfigError;
use crate::gates::CheckSpec;
use crate::util::sha256_hex;

/// Scope value for invariants that apply to every gate.
pub const GLOBAL_SCOPE: &str = "global";

/// Promotion thresholds and confidence dynamics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionPolicy {
    #[serde(default = "default_promote_threshold")]
    pub promote_threshold: f64,
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f64,
    /// Weight of a successful re-validation (alpha).
    #[serde(default = "default_smoothing_alpha")]
    pub smoothing_alpha: f64,
    /// Fraction of confidence lost on a violation (beta).
    #[serde(default = "default_violation_penalty")]
    pub violation_penalty: f64,
    #[serde(default = "default_deprecation_floor")]
    pub deprecation_floor: f64,
}

fn default_promote_threshold() -> f64 {
    0.80
}

fn default_accept_threshold() -> f64 {
    0.50
}

fn default_smoothing_alpha() -> f64 {
    0.10
}

fn default_violation_penalty() -> f64 {
    0.25
}

fn default_deprecation_floor() -> f64 {
    0.45
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            promote_threshold: default_promote_threshold(),
            accept_threshold: default_accept_threshold(),
            smoothing_alpha: default_smoothing_alpha(),
            violation_penalty: default_violation_penalty(),
            deprecation_floor: default_deprecation_floor(),
        }
    }
}

impl PromotionPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, reason: String| ConfigError::InvalidSetting {
            key: format!("promotion.{}", key),
            reason,
        };
        for (key, value) in [
            ("promote_threshold", self.promote_threshold),
            ("accept_threshold", self.accept_threshold),
            ("deprecation_floor", self.deprecation_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(invalid(key, format!("{} is outside [0, 1]", value)));
            }
        }
        if self.accept_threshold > self.promote_threshold {
            return Err(invalid(
                "accept_threshold",
                format!(
                    "{} is above promote_threshold {}",
                    self.accept_threshold, self.promote_threshold
                ),
            ));
        }
        if !(self.smoothing_alpha > 0.0 && self.smoothing_alpha <= 1.0) {
            return Err(invalid(
                "smoothing_alpha",
                format!("{} is outside (0, 1]", self.smoothing_alpha),
            ));
        }
        if !(self.violation_penalty > 0.0 && self.violation_penalty < 1.0) {
            return Err(invalid(
                "violation_penalty",
                format!("{} is outside (0, 1)", self.violation_penalty),
            ));
        }
        Ok(())
    }
}

/// Terminal disposition of a learning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DecisionAction {
    Reject,
    Accept,
    Promote,
}

impl DecisionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionAction::Reject => "REJECT",
            DecisionAction::Accept => "ACCEPT",
            DecisionAction::Promote => "PROMOTE",
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a confidence to a disposition.
pub fn classify(confidence: f64, policy: &PromotionPolicy, manual_override: bool) -> DecisionAction {
    if manual_override || confidence >= policy.promote_threshold {
        DecisionAction::Promote
    } else if confidence >= policy.accept_threshold {
        DecisionAction::Accept
    } else {
        DecisionAction::Reject
    }
}

/// Confidence after a successful re-validation.
pub fn smooth_validation(confidence: f64, alpha: f64) -> f64 {
    (confidence + alpha * (1.0 - confidence)).clamp(0.0, 1.0)
}

/// Confidence after a violation.
pub fn penalize_violation(confidence: f64, beta: f64) -> f64 {
    (confidence * (1.0 - beta)).clamp(0.0, 1.0)
}

/// Stable invariant id for a rule within a scope.
///
/// Case and whitespace differences in the rule text map to the same id.
pub fn invariant_id(scope: &str, rule: &str) -> String {
    let normalized = rule
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let digest = sha256_hex(format!("{}\n{}", scope, normalized).as_bytes());
    format!("inv-{}", &digest[..16])
}

/// An observation surfaced during a gate run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Learning {
    pub id: String,
    pub source_run_id: String,
    pub source_gate_id: String,
    pub observation: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    /// Gate id or `global`; defaults to the source gate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckSpec>,
    #[serde(default)]
    pub operator_forced: bool,
}

impl Learning {
    pub fn new(run_id: &str, gate_id: &str, observation: impl Into<String>, confidence: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_run_id: run_id.to_string(),
            source_gate_id: gate_id.to_string(),
            observation: observation.into(),
            confidence: confidence.clamp(0.0, 1.0),
            timestamp: Utc::now(),
            scope: None,
            check: None,
            operator_forced: false,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_check(mut self, check: CheckSpec) -> Self {
        self.check = Some(check);
        self
    }

    pub fn forced(mut self) -> Self {
        self.operator_forced = true;
        self
    }

    pub fn effective_scope(&self) -> &str {
        self.scope.as_deref().unwrap_or(&self.source_gate_id)
    }

    pub fn invariant_id(&self) -> String {
        invariant_id(self.effective_scope(), &self.observation)
    }
}

/// Recorded disposition of one learning. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub learning_id: String,
    pub run_id: String,
    pub gate_id: String,
    pub action: DecisionAction,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invariant_id: Option<String>,
    #[serde(default)]
    pub operator_forced: bool,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InvariantStatus {
    Active,
    Deprecated,
}

impl fmt::Display for InvariantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantStatus::Active => write!(f, "ACTIVE"),
            InvariantStatus::Deprecated => write!(f, "DEPRECATED"),
        }
    }
}

/// Where a promotion came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub learning_id: String,
    pub run_id: String,
    pub gate_id: String,
    pub observation: String,
    pub confidence: f64,
    pub observed_at: DateTime<Utc>,
    #[serde(default)]
    pub operator_forced: bool,
}

impl From<&Learning> for Provenance {
    fn from(learning: &Learning) -> Self {
        Self {
            learning_id: learning.id.clone(),
            run_id: learning.source_run_id.clone(),
            gate_id: learning.source_gate_id.clone(),
            observation: learning.observation.clone(),
            confidence: learning.confidence,
            observed_at: learning.timestamp,
            operator_forced: learning.operator_forced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// First promotion.
    Promoted,
    /// A later promotion of the same rule; only its evidence is kept.
    Merged,
    Validated,
    Violated,
}

/// One entry of an invariant's version history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub kind: HistoryKind,
    pub at: DateTime<Utc>,
    pub confidence_before: f64,
    pub confidence_after: f64,
    pub status_after: InvariantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Provenance>,
}

/// A promoted, durable constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invariant {
    pub id: String,
    pub rule: String,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<CheckSpec>,
    pub confidence: f64,
    pub status: InvariantStatus,
    pub validation_count: u64,
    pub violation_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successor: Option<String>,
    pub provenance: Vec<Provenance>,
    /// Incremented on every stored revision.
    pub version: u64,
    /// Timestamp of the learning behind the current confidence.
    pub promoted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version_history: Vec<HistoryEntry>,
}

impl Invariant {
    /// Fresh invariant from a promoted learning. Not yet stored (version 0).
    pub fn from_learning(learning: &Learning) -> Self {
        let now = Utc::now();
        let provenance = Provenance::from(learning);
        Self {
            id: learning.invariant_id(),
            rule: learning.observation.trim().to_string(),
            scope: learning.effective_scope().to_string(),
            check: learning.check.clone(),
            confidence: learning.confidence,
            status: InvariantStatus::Active,
            validation_count: 0,
            violation_count: 0,
            successor: None,
            provenance: vec![provenance.clone()],
            version: 0,
            promoted_at: learning.timestamp,
            updated_at: now,
            version_history: vec![HistoryEntry {
                version: 1,
                kind: HistoryKind::Promoted,
                at: now,
                confidence_before: 0.0,
                confidence_after: learning.confidence,
                status_after: InvariantStatus::Active,
                run_id: Some(learning.source_run_id.clone()),
                evidence: Some(provenance),
            }],
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == InvariantStatus::Active
    }

    /// Whether this invariant is checked when `gate_id` runs.
    pub fn applies_to(&self, gate_id: &str) -> bool {
        self.scope == GLOBAL_SCOPE || self.scope == gate_id
    }

    pub fn has_evidence_from(&self, learning_id: &str) -> bool {
        self.provenance.iter().any(|p| p.learning_id == learning_id)
    }

    /// Whether `run_id` already validated or violated this invariant.
    pub fn has_outcome_from(&self, run_id: &str) -> bool {
        self.version_history.iter().any(|e| {
            matches!(e.kind, HistoryKind::Validated | HistoryKind::Violated)
                && e.run_id.as_deref() == Some(run_id)
        })
    }
}

/// Append-only log entry for the invariant registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvariantEvent {
    pub invariant_id: String,
    pub version: u64,
    pub kind: HistoryKind,
    pub at: DateTime<Utc>,
    pub confidence: f64,
    pub status: InvariantStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_id: Option<String>,
}

impl InvariantEvent {
    pub fn from_entry(invariant: &Invariant, entry: &HistoryEntry) -> Self {
        Self {
            invariant_id: invariant.id.clone(),
            version: entry.version,
            kind: entry.kind,
            at: entry.at,
            confidence: entry.confidence_after,
            status: entry.status_after,
            run_id: entry.run_id.clone(),
            learning_id: entry.evidence.as_ref().map(|e| e.learning_id.clone()),
        }
    }
}
