//! File-backed state store.
//!
//! ```text
//! <root>/
//!   runs/<run_id>.json                 checksummed envelope
//!   escalations/<run_id>--<gate>.json  checksummed envelope
//!   cancel/<run_id>                    marker file
//!   metrics/<run_id>/<gate>.json       checksummed envelope per gate exit
//!   learnings.jsonl                    append-only dispositions
//! <invariant_root>/
//!   <invariant_id>.json                current version (checksummed envelope)
//!   events.jsonl                       append-only registry log
//! ```
//!
//! Envelopes are written with a temp file and rename, and read back only if
//! their checksum matches. Writes that compare versions or append to a log
//! hold an exclusive `fs2` lock on `<root>/.lock` (or the invariant root's).

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{StateStore, check_version, new_events};
use crate::errors::StoreError;
use crate::escalation::EscalationRecord;
use crate::learning::{Decision, Invariant, InvariantEvent};
use crate::orchestrator::{GateMetrics, PipelineRun};
use crate::util::{sha256_hex, write_atomic};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u64,
    checksum: String,
    written_at: DateTime<Utc>,
    payload: Value,
}

fn checksum(version: u64, payload: &Value) -> String {
    sha256_hex(format!("{}:{}", version, payload).as_bytes())
}

/// Keep file names portable whatever the id contains.
fn file_key(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub struct FileStateStore {
    root: PathBuf,
    invariant_root: PathBuf,
}

impl FileStateStore {
    /// Store rooted at `root`, with invariants under `root/invariants`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let invariant_root = root.join("invariants");
        Self {
            root,
            invariant_root,
        }
    }

    /// Keep the invariant registry elsewhere, e.g. a directory shared by
    /// every project.
    pub fn with_invariant_root(mut self, dir: impl Into<PathBuf>) -> Self {
        self.invariant_root = dir.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn invariant_root(&self) -> &Path {
        &self.invariant_root
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(format!("{}.json", file_key(run_id)))
    }

    fn escalation_path(&self, run_id: &str, gate_id: &str) -> PathBuf {
        self.root
            .join("escalations")
            .join(format!("{}--{}.json", file_key(run_id), file_key(gate_id)))
    }

    fn cancel_path(&self, run_id: &str) -> PathBuf {
        self.root.join("cancel").join(file_key(run_id))
    }

    fn metrics_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("metrics").join(file_key(run_id))
    }

    fn decisions_path(&self) -> PathBuf {
        self.root.join("learnings.jsonl")
    }

    fn invariant_path(&self, id: &str) -> PathBuf {
        self.invariant_root.join(format!("{}.json", file_key(id)))
    }

    fn events_path(&self) -> PathBuf {
        self.invariant_root.join("events.jsonl")
    }

    fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))
    }

    /// Exclusive lock on `<dir>/.lock`, released when the file drops.
    fn lock(dir: &Path) -> Result<File, StoreError> {
        Self::ensure_dir(dir)?;
        let path = dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::io(&path, e))?;
        file.lock_exclusive().map_err(|e| StoreError::io(&path, e))?;
        Ok(file)
    }

    fn read_envelope<T: DeserializeOwned>(path: &Path) -> Result<Option<(u64, T)>, StoreError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let corrupt = |reason: String| StoreError::Corrupt {
            location: path.display().to_string(),
            reason,
        };
        let envelope: Envelope =
            serde_json::from_str(&raw).map_err(|e| corrupt(format!("unreadable envelope: {}", e)))?;
        if checksum(envelope.version, &envelope.payload) != envelope.checksum {
            return Err(corrupt("checksum mismatch".into()));
        }
        let value = serde_json::from_value(envelope.payload)
            .map_err(|e| corrupt(format!("unexpected payload: {}", e)))?;
        Ok(Some((envelope.version, value)))
    }

    fn write_envelope<T: Serialize>(path: &Path, version: u64, value: &T, what: &str) -> Result<(), StoreError> {
        let payload = serde_json::to_value(value).map_err(|source| StoreError::Serialize {
            what: what.to_string(),
            source,
        })?;
        let envelope = Envelope {
            version,
            checksum: checksum(version, &payload),
            written_at: Utc::now(),
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(|source| StoreError::Serialize {
            what: what.to_string(),
            source,
        })?;
        if let Some(parent) = path.parent() {
            Self::ensure_dir(parent)?;
        }
        write_atomic(path, &bytes).map_err(|e| StoreError::io(path, e))
    }

    fn append_line<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(value).map_err(|source| StoreError::Serialize {
            what: what.to_string(),
            source,
        })?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.sync_data())
            .map_err(|e| StoreError::io(path, e))
    }

    fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StoreError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(path, e)),
        };
        let mut items = Vec::new();
        for (n, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| StoreError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let item = serde_json::from_str(&line).map_err(|e| StoreError::Corrupt {
                location: format!("{}:{}", path.display(), n + 1),
                reason: e.to_string(),
            })?;
            items.push(item);
        }
        Ok(items)
    }

    fn list_json_stems(dir: &Path) -> Result<Vec<(std::time::SystemTime, String)>, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(dir, e)),
        };
        let mut stems = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let created = entry
                .metadata()
                .and_then(|m| m.created().or_else(|_| m.modified()))
                .unwrap_or(std::time::UNIX_EPOCH);
            stems.push((created, stem.to_string()));
        }
        stems.sort();
        Ok(stems)
    }
}

impl StateStore for FileStateStore {
    fn load_run(&self, run_id: &str) -> Result<Option<PipelineRun>, StoreError> {
        Ok(Self::read_envelope::<PipelineRun>(&self.run_path(run_id))?.map(|(_, run)| run))
    }

    fn save_run(&self, run: &PipelineRun, expected_version: Option<u64>) -> Result<(), StoreError> {
        let _lock = Self::lock(&self.root)?;
        let path = self.run_path(&run.id);
        let found = Self::read_envelope::<PipelineRun>(&path)?.map(|(v, _)| v);
        check_version(&run.id, expected_version, found)?;
        Self::write_envelope(&path, run.version, run, "run")
    }

    fn list_runs(&self) -> Result<Vec<String>, StoreError> {
        let runs = Self::list_json_stems(&self.root.join("runs"))?;
        Ok(runs.into_iter().map(|(_, id)| id).collect())
    }

    fn save_escalation(&self, record: &EscalationRecord) -> Result<(), StoreError> {
        let path = self.escalation_path(&record.run_id, &record.gate_id);
        Self::write_envelope(&path, 1, record, "escalation")
    }

    fn load_escalation(&self, run_id: &str, gate_id: &str) -> Result<Option<EscalationRecord>, StoreError> {
        Ok(Self::read_envelope(&self.escalation_path(run_id, gate_id))?.map(|(_, r)| r))
    }

    fn request_cancel(&self, run_id: &str) -> Result<(), StoreError> {
        let path = self.cancel_path(run_id);
        if let Some(parent) = path.parent() {
            Self::ensure_dir(parent)?;
        }
        write_atomic(&path, Utc::now().to_rfc3339().as_bytes()).map_err(|e| StoreError::io(&path, e))
    }

    fn cancel_requested(&self, run_id: &str) -> Result<bool, StoreError> {
        Ok(self.cancel_path(run_id).exists())
    }

    fn clear_cancel(&self, run_id: &str) -> Result<(), StoreError> {
        let path = self.cancel_path(run_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    fn save_gate_metrics(&self, metrics: &GateMetrics) -> Result<(), StoreError> {
        let path = self
            .metrics_dir(&metrics.run_id)
            .join(format!("{}.json", file_key(&metrics.gate_id)));
        Self::write_envelope(&path, 1, metrics, "gate metrics")
    }

    fn gate_metrics(&self, run_id: &str) -> Result<Vec<GateMetrics>, StoreError> {
        let dir = self.metrics_dir(run_id);
        let mut found = Vec::new();
        for (_, stem) in Self::list_json_stems(&dir)? {
            if let Some((_, metrics)) = Self::read_envelope::<GateMetrics>(&dir.join(format!("{}.json", stem)))? {
                found.push(metrics);
            }
        }
        found.sort_by_key(|m: &GateMetrics| m.finished_at);
        Ok(found)
    }

    fn append_decision(&self, decision: &Decision) -> Result<(), StoreError> {
        let _lock = Self::lock(&self.root)?;
        Self::append_line(&self.decisions_path(), decision, "decision")
    }

    fn find_decision(&self, learning_id: &str) -> Result<Option<Decision>, StoreError> {
        Ok(Self::read_lines::<Decision>(&self.decisions_path())?
            .into_iter()
            .find(|d| d.learning_id == learning_id))
    }

    fn load_invariant(&self, id: &str) -> Result<Option<Invariant>, StoreError> {
        Ok(Self::read_envelope(&self.invariant_path(id))?.map(|(_, inv)| inv))
    }

    fn list_invariants(&self) -> Result<Vec<Invariant>, StoreError> {
        let mut ids: Vec<String> = Self::list_json_stems(&self.invariant_root)?
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        ids.sort();
        let mut invariants = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(inv) = self.load_invariant(&id)? {
                invariants.push(inv);
            }
        }
        Ok(invariants)
    }

    fn put_invariant(&self, invariant: &Invariant, expected_version: Option<u64>) -> Result<(), StoreError> {
        let _lock = Self::lock(&self.invariant_root)?;
        let path = self.invariant_path(&invariant.id);
        let found = Self::read_envelope::<Invariant>(&path)?.map(|(v, _)| v);
        check_version(&invariant.id, expected_version, found)?;
        Self::write_envelope(&path, invariant.version, invariant, "invariant")?;
        for event in new_events(invariant, expected_version) {
            Self::append_line(&self.events_path(), &event, "invariant event")?;
        }
        Ok(())
    }

    fn invariant_events(&self, id: Option<&str>) -> Result<Vec<InvariantEvent>, StoreError> {
        Ok(Self::read_lines::<InvariantEvent>(&self.events_path())?
            .into_iter()
            .filter(|e| id.is_none_or(|id| e.invariant_id == id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::contract;
    use tempfile::tempdir;

    #[test]
    fn test_run_cas() {
        let dir = tempdir().unwrap();
        contract::run_cas(&FileStateStore::new(dir.path()));
    }

    #[test]
    fn test_escalations_and_cancel() {
        let dir = tempdir().unwrap();
        contract::escalations_and_cancel(&FileStateStore::new(dir.path()));
    }

    #[test]
    fn test_gate_metrics() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        contract::gate_metrics(&store);
        assert!(dir.path().join("metrics/r1/g1.json").exists());
    }

    #[test]
    fn test_decisions() {
        let dir = tempdir().unwrap();
        contract::decisions(&FileStateStore::new(dir.path()));
    }

    #[test]
    fn test_invariants() {
        let dir = tempdir().unwrap();
        contract::invariants(&FileStateStore::new(dir.path()));
    }

    #[test]
    fn test_recovery_after_restart() {
        let dir = tempdir().unwrap();
        {
            let store = FileStateStore::new(dir.path());
            let mut run = contract::run("r-restart");
            run.version = 1;
            run.retry_count = 2;
            store.save_run(&run, None).unwrap();
        }
        let store = FileStateStore::new(dir.path());
        let run = store.load_run("r-restart").unwrap().unwrap();
        assert_eq!(run.retry_count, 2);
        assert_eq!(run.version, 1);
    }

    #[test]
    fn test_tampered_run_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let mut run = contract::run("r-tamper");
        run.version = 1;
        store.save_run(&run, None).unwrap();

        let path = dir.path().join("runs/r-tamper.json");
        let raw = fs::read_to_string(&path).unwrap();
        fs::write(&path, raw.replace("\"retry_count\": 0", "\"retry_count\": 9")).unwrap();

        let err = store.load_run("r-tamper").unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { ref reason, .. } if reason.contains("checksum")));
    }

    #[test]
    fn test_truncated_run_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        fs::create_dir_all(dir.path().join("runs")).unwrap();
        fs::write(dir.path().join("runs/r-bad.json"), "{\"version\": 1, \"chec").unwrap();
        assert!(matches!(
            store.load_run("r-bad"),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_garbled_log_line_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        fs::write(dir.path().join("learnings.jsonl"), "not json\n").unwrap();
        assert!(matches!(
            store.find_decision("x"),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_shared_invariant_root() {
        let dir = tempdir().unwrap();
        let shared = dir.path().join("shared");
        let a = FileStateStore::new(dir.path().join("a")).with_invariant_root(&shared);
        let b = FileStateStore::new(dir.path().join("b")).with_invariant_root(&shared);

        contract::invariants(&a);
        assert_eq!(b.list_invariants().unwrap().len(), 1);
    }

    #[test]
    fn test_file_key_sanitizes() {
        assert_eq!(file_key("a/b c"), "a_b_c");
    }
}
