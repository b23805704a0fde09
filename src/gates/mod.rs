//! Gate definitions and the static gate table.
//!
//! A gate is an ordered quality check on the spec artifact. Gates declare the
//! gates they depend on; the table compiles every pass condition and builds
//! the dependency graph once, so a table that exists can always execute.

pub mod checks;
pub mod executor;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use checks::{Check, CheckSpec};
pub use executor::{
    Assessment, AttemptRecord, AttemptSink, FixRecord, GateContext, GateExecutor, GateResult,
    GateStatus, InvariantOutcome,
};

use crate::dag::{DagBuilder, TaskGraph, TaskSpec};
use crate::errors::ConfigError;

/// Default retry budget when neither the gate nor the config sets one.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Why an assessment failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueCode {
    CheckFailed,
    InvariantViolated,
    AdvisoryRejected,
    AdvisoryUnavailable,
    AdvisoryMalformed,
    FixUnavailable,
    ArtifactConflict,
}

impl IssueCode {
    pub fn as_str(self) -> &'static str {
        match self {
            IssueCode::CheckFailed => "CHECK_FAILED",
            IssueCode::InvariantViolated => "INVARIANT_VIOLATED",
            IssueCode::AdvisoryRejected => "ADVISORY_REJECTED",
            IssueCode::AdvisoryUnavailable => "ADVISORY_UNAVAILABLE",
            IssueCode::AdvisoryMalformed => "ADVISORY_MALFORMED",
            IssueCode::FixUnavailable => "FIX_UNAVAILABLE",
            IssueCode::ArtifactConflict => "ARTIFACT_CONFLICT",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One problem found by an assessment or a fix step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub code: IssueCode,
    pub message: String,
    /// Invariant id when the issue came from an invariant check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invariant_id: Option<String>,
}

impl Issue {
    pub fn new(code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            invariant_id: None,
        }
    }

    pub fn for_invariant(id: &str, message: impl Into<String>) -> Self {
        Self {
            code: IssueCode::InvariantViolated,
            message: message.into(),
            invariant_id: Some(id.to_string()),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// The advisory part of a pass condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisoryRequirement {
    /// Minimum confidence the advisory assessment must report.
    pub min_confidence: f64,
    /// JSON schema hint passed along with the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

/// Gate as declared in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDef {
    pub id: String,
    pub name: String,
    pub order: u32,
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<AdvisoryRequirement>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Assessment attempts allowed; falls back to `[defaults] max_retries`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

/// Compiled pass condition.
#[derive(Debug, Clone)]
pub struct PassCondition {
    pub checks: Vec<Check>,
    pub advisory: Option<AdvisoryRequirement>,
}

impl PassCondition {
    pub fn len(&self) -> usize {
        self.checks.len() + usize::from(self.advisory.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A gate ready for execution.
#[derive(Debug, Clone)]
pub struct Gate {
    pub id: String,
    pub name: String,
    pub order: u32,
    pub pass_condition: PassCondition,
    pub dependency_ids: Vec<String>,
    pub max_retries: u32,
}

impl Gate {
    fn compile(def: &GateDef, default_retries: u32) -> Result<Self, ConfigError> {
        let max_retries = def.max_retries.unwrap_or(default_retries);
        if max_retries == 0 {
            return Err(ConfigError::ZeroRetries(def.id.clone()));
        }
        if def.checks.is_empty() && def.advisory.is_none() {
            return Err(ConfigError::EmptyPassCondition(def.id.clone()));
        }
        if let Some(advisory) = &def.advisory
            && !(0.0..=1.0).contains(&advisory.min_confidence)
        {
            return Err(ConfigError::InvalidSetting {
                key: format!("gates.{}.advisory.min_confidence", def.id),
                reason: format!("{} is outside [0, 1]", advisory.min_confidence),
            });
        }
        let checks = def
            .checks
            .iter()
            .map(|c| c.compile(&def.id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: def.id.clone(),
            name: def.name.clone(),
            order: def.order,
            pass_condition: PassCondition {
                checks,
                advisory: def.advisory.clone(),
            },
            dependency_ids: def.depends_on.clone(),
            max_retries,
        })
    }
}

/// The static, validated set of gates for a pipeline.
#[derive(Debug, Clone)]
pub struct GateTable {
    /// Sorted by `order`, then id.
    gates: Vec<Gate>,
    graph: TaskGraph,
}

impl GateTable {
    /// Compile and validate gate declarations.
    ///
    /// Rejects empty tables, gates without checks or budget, bad patterns,
    /// unknown dependencies and cycles.
    pub fn new(defs: &[GateDef], default_retries: u32) -> Result<Self, ConfigError> {
        if defs.is_empty() {
            return Err(ConfigError::InvalidSetting {
                key: "gates".into(),
                reason: "gate table is empty".into(),
            });
        }
        let mut gates = defs
            .iter()
            .map(|d| Gate::compile(d, default_retries))
            .collect::<Result<Vec<_>, _>>()?;
        gates.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));

        let graph = DagBuilder::new(
            gates
                .iter()
                .map(|g| TaskSpec::new(g.id.clone(), g.dependency_ids.clone()))
                .collect(),
        )
        .build()?;

        Ok(Self { gates, graph })
    }

    /// The built-in spec-hardening table.
    pub fn default_table(default_retries: u32) -> Result<Self, ConfigError> {
        Self::new(&default_gate_defs(), default_retries)
    }

    pub fn gates(&self) -> &[Gate] {
        &self.gates
    }

    pub fn get(&self, id: &str) -> Option<&Gate> {
        self.gates.iter().find(|g| g.id == id)
    }

    /// Dependency graph over gate ids, in gate order.
    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}

const VAGUE_WORDS: &[&str] = &[
    "properly",
    "correctly",
    "appropriately",
    "easily",
    "simply",
    "just",
    "obviously",
];

/// Built-in gates: wording, structure, error coverage, security, acceptance.
pub fn default_gate_defs() -> Vec<GateDef> {
    vec![
        GateDef {
            id: "stress-test".into(),
            name: "Stress test".into(),
            order: 1,
            checks: vec![
                CheckSpec::MinLength { chars: 200 },
                CheckSpec::ForbidWords {
                    words: VAGUE_WORDS.iter().map(|w| w.to_string()).collect(),
                },
            ],
            advisory: None,
            depends_on: vec![],
            max_retries: None,
        },
        GateDef {
            id: "structure".into(),
            name: "Structure validation".into(),
            order: 2,
            checks: ["Overview", "Requirements", "Acceptance Criteria"]
                .iter()
                .map(|h| CheckSpec::RequireSection {
                    heading: h.to_string(),
                })
                .collect(),
            advisory: None,
            depends_on: vec!["stress-test".into()],
            max_retries: None,
        },
        GateDef {
            id: "error-states".into(),
            name: "Error state coverage".into(),
            order: 3,
            checks: vec![CheckSpec::RequirePattern {
                pattern: r"(?i)\b(error|failure|invalid)".into(),
                message: Some("No error states described".into()),
            }],
            advisory: None,
            depends_on: vec!["structure".into()],
            max_retries: None,
        },
        GateDef {
            id: "security-scan".into(),
            name: "Security scan".into(),
            order: 4,
            checks: vec![
                CheckSpec::ForbidPattern {
                    pattern: r#"(?i)(password|secret|api[_-]?key|token)\s*[:=]\s*["'][^"'\s]+["']"#.into(),
                    message: Some("Hardcoded credential in spec".into()),
                },
                CheckSpec::ForbidPattern {
                    pattern: r"(?i)\b(eval|exec)\s*\(".into(),
                    message: Some("Dynamic code execution in spec".into()),
                },
                CheckSpec::ForbidPattern {
                    pattern: r"(?i)http://".into(),
                    message: Some("Plain-text HTTP endpoint".into()),
                },
            ],
            advisory: None,
            depends_on: vec!["stress-test".into()],
            max_retries: None,
        },
        GateDef {
            id: "acceptance-review".into(),
            name: "Acceptance review".into(),
            order: 5,
            checks: vec![CheckSpec::ForbidPattern {
                pattern: r"\b(TBD|TODO|FIXME|XXX)\b".into(),
                message: Some("Unresolved placeholder".into()),
            }],
            advisory: Some(AdvisoryRequirement {
                min_confidence: 0.7,
                output_schema: None,
            }),
            depends_on: vec!["error-states".into(), "security-scan".into()],
            max_retries: None,
        },
    ]
}
