//! Versioned spec artifacts.
//!
//! Every version is addressed by the SHA-256 of its text. Commits are
//! compare-and-swap on that hash, so a fix computed against one version can
//! never overwrite an edit made in between.

mod file;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use git2::{DiffOptions, Patch};
use serde::{Deserialize, Serialize};

pub use file::FileArtifactStore;

use crate::errors::ArtifactError;
use crate::util::sha256_hex;

/// Hex SHA-256 of `content`.
pub fn content_hash(content: &str) -> String {
    sha256_hex(content.as_bytes())
}

/// One version of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSnapshot {
    pub content: String,
    pub hash: String,
}

impl ArtifactSnapshot {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let hash = content_hash(&content);
        Self { content, hash }
    }

    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }
}

/// Unified diff between two versions, labelled with `label`.
///
/// Returns an empty string when the texts are identical.
pub fn unified_diff(old: &str, new: &str, label: &str) -> String {
    if old == new {
        return String::new();
    }
    let path = Path::new(label);
    let mut opts = DiffOptions::new();
    opts.context_lines(3);
    let rendered = Patch::from_buffers(
        old.as_bytes(),
        Some(path),
        new.as_bytes(),
        Some(path),
        Some(&mut opts),
    )
    .and_then(|mut patch| patch.to_buf())
    .map(|buf| String::from_utf8_lossy(&buf).into_owned());

    match rendered {
        Ok(diff) => diff,
        Err(e) => {
            tracing::warn!(error = %e, "failed to render diff");
            format!("--- {label}\n+++ {label}\n(diff unavailable: {e})\n")
        }
    }
}

/// Storage for spec artifacts, keyed by reference (a path for file stores).
pub trait ArtifactStore: Send + Sync {
    /// Current version.
    fn read(&self, reference: &str) -> Result<ArtifactSnapshot, ArtifactError>;

    /// Replace the current version if it still hashes to `expected_hash`.
    fn commit(
        &self,
        reference: &str,
        expected_hash: &str,
        content: &str,
        message: &str,
    ) -> Result<ArtifactSnapshot, ArtifactError>;

    /// A previously seen version, by hash.
    fn load_version(&self, reference: &str, hash: &str) -> Result<Option<String>, ArtifactError>;
}

#[derive(Debug, Default)]
struct MemoryArtifact {
    current: String,
    versions: HashMap<String, String>,
}

/// In-memory artifact store.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<HashMap<String, MemoryArtifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the current text of `reference`, bypassing the hash check.
    ///
    /// This is how tests model an edit made outside the pipeline.
    pub fn put(&self, reference: &str, content: &str) -> Result<ArtifactSnapshot, ArtifactError> {
        let mut artifacts = self
            .artifacts
            .lock()
            .map_err(|_| ArtifactError::LockPoisoned)?;
        let snapshot = ArtifactSnapshot::new(content);
        let entry = artifacts.entry(reference.to_string()).or_default();
        entry.current = snapshot.content.clone();
        entry
            .versions
            .insert(snapshot.hash.clone(), snapshot.content.clone());
        Ok(snapshot)
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn read(&self, reference: &str) -> Result<ArtifactSnapshot, ArtifactError> {
        let artifacts = self
            .artifacts
            .lock()
            .map_err(|_| ArtifactError::LockPoisoned)?;
        artifacts
            .get(reference)
            .map(|a| ArtifactSnapshot::new(a.current.clone()))
            .ok_or_else(|| ArtifactError::NotFound(reference.to_string()))
    }

    fn commit(
        &self,
        reference: &str,
        expected_hash: &str,
        content: &str,
        _message: &str,
    ) -> Result<ArtifactSnapshot, ArtifactError> {
        let mut artifacts = self
            .artifacts
            .lock()
            .map_err(|_| ArtifactError::LockPoisoned)?;
        let entry = artifacts
            .get_mut(reference)
            .ok_or_else(|| ArtifactError::NotFound(reference.to_string()))?;
        let actual = content_hash(&entry.current);
        if actual != expected_hash {
            return Err(ArtifactError::Conflict {
                reference: reference.to_string(),
                expected: expected_hash.to_string(),
                actual,
            });
        }
        let snapshot = ArtifactSnapshot::new(content);
        entry.current = snapshot.content.clone();
        entry
            .versions
            .insert(snapshot.hash.clone(), snapshot.content.clone());
        Ok(snapshot)
    }

    fn load_version(&self, reference: &str, hash: &str) -> Result<Option<String>, ArtifactError> {
        let artifacts = self
            .artifacts
            .lock()
            .map_err(|_| ArtifactError::LockPoisoned)?;
        Ok(artifacts
            .get(reference)
            .and_then(|a| a.versions.get(hash).cloned()))
    }
}
