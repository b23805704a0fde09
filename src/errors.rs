//! Typed error hierarchy for the gauntlet orchestrator.
//!
//! - `ConfigError`: a gate table or settings that can never execute
//! - `StoreError`: state store I/O, integrity and version conflicts
//! - `ArtifactError`: spec artifact reads and hash-checked commits
//! - `AdvisoryError`: advisory transport and response parsing
//! - `TaskError`: invalid task-graph transitions
//! - `PipelineError`: what the orchestrator surfaces to callers
//!
//! Gate failures are not errors: the executor recovers them inside its
//! retry loop and reports them through `GateResult`.

use std::path::PathBuf;

use thiserror::Error;

use crate::dag::TaskStatus;

/// A gate table or configuration value that is rejected before any gate runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cycle detected in gate dependencies. Involved gates: {involved:?}")]
    Cycle { involved: Vec<String> },

    #[error("Unknown dependency '{dependency}' in gate '{gate}': no gate with that id exists")]
    UnknownDependency { gate: String, dependency: String },

    #[error("Duplicate gate id: {0}")]
    DuplicateId(String),

    #[error("Gate '{0}' has an empty pass condition")]
    EmptyPassCondition(String),

    #[error("Gate '{0}' must allow at least one attempt (max_retries = 0)")]
    ZeroRetries(String),

    #[error("Invalid pattern '{pattern}' in gate '{gate}': {source}")]
    InvalidPattern {
        gate: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Invalid setting {key}: {reason}")]
    InvalidSetting { key: String, reason: String },
}

/// Errors from a state store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("State store I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize {what}: {source}")]
    Serialize {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Corrupt record at {location}: {reason}")]
    Corrupt { location: String, reason: String },

    #[error("Version conflict on {key}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("State store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Errors from an artifact store.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Artifact I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact {reference} changed underneath the commit: expected {expected}, found {actual}")]
    Conflict {
        reference: String,
        expected: String,
        actual: String,
    },

    #[error("Artifact store lock poisoned")]
    LockPoisoned,
}

/// Errors from an advisory client call.
///
/// Both variants are turned into ordinary gate failures by the executor.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdvisoryError {
    #[error("Advisory service unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed advisory response: {0}")]
    Malformed(String),
}

/// Invalid operations on the task graph.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Task '{task}' cannot move from {from} to {to}")]
    InvalidTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Persisted task snapshot does not match the gate table: {0}")]
    SnapshotMismatch(String),
}

/// Errors surfaced by the orchestrator.
///
/// Only configuration problems, corrupt state and store failures end a
/// call with `Err`; every other failure ends in a GUTTER result.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Corrupt state at {location}: {reason}")]
    CorruptState { location: String, reason: String },

    #[error("Run {0} not found")]
    RunNotFound(String),

    #[error("Run {run_id} was modified concurrently (expected version {expected:?}, found {found:?})")]
    VersionConflict {
        run_id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Run {run_id} is {status}; {action} is not allowed")]
    InvalidState {
        run_id: String,
        status: String,
        action: String,
    },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Corrupt { location, reason } => {
                PipelineError::CorruptState { location, reason }
            }
            StoreError::VersionConflict {
                key,
                expected,
                found,
            } => PipelineError::VersionConflict {
                run_id: key,
                expected,
                found,
            },
            other => PipelineError::Store(other),
        }
    }
}

impl PipelineError {
    /// Errors that must propagate to the caller instead of parking the run
    /// in GUTTER.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Configuration(_)
                | PipelineError::CorruptState { .. }
                | PipelineError::Store(_)
                | PipelineError::VersionConflict { .. }
                | PipelineError::Task(TaskError::SnapshotMismatch(_))
        )
    }
}
