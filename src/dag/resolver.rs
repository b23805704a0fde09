//! Ready-set tracking over a task graph.
//!
//! Readiness is recomputed when a task completes, and only for that task's
//! dependents. A failed task never releases anything it blocks.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dag::builder::{TaskGraph, TaskIndex};
use crate::errors::TaskError;

/// Lifecycle of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Blocked,
    Ready,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Blocked => "blocked",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted view of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub blocks: Vec<String>,
    #[serde(default)]
    pub blocked_by: Vec<String>,
    pub status: TaskStatus,
}

/// Tracks task status over an immutable graph.
#[derive(Debug, Clone)]
pub struct TaskResolver {
    graph: TaskGraph,
    statuses: Vec<TaskStatus>,
}

impl TaskResolver {
    /// Fresh resolver: roots are ready, everything else is blocked.
    pub fn new(graph: TaskGraph) -> Self {
        let statuses = (0..graph.len())
            .map(|i| {
                if graph.dependencies(i).is_empty() {
                    TaskStatus::Ready
                } else {
                    TaskStatus::Blocked
                }
            })
            .collect();
        Self { graph, statuses }
    }

    /// Rebuild a resolver from a persisted snapshot.
    ///
    /// The snapshot must name exactly the tasks of `graph`.
    pub fn restore(graph: TaskGraph, tasks: &[Task]) -> Result<Self, TaskError> {
        if tasks.len() != graph.len() {
            return Err(TaskError::SnapshotMismatch(format!(
                "snapshot has {} tasks, graph has {}",
                tasks.len(),
                graph.len()
            )));
        }
        let mut statuses = vec![TaskStatus::Blocked; graph.len()];
        let mut seen = vec![false; graph.len()];
        for task in tasks {
            let idx = graph
                .index_of(&task.id)
                .ok_or_else(|| TaskError::SnapshotMismatch(format!("unknown task '{}'", task.id)))?;
            if seen[idx] {
                return Err(TaskError::SnapshotMismatch(format!(
                    "task '{}' appears twice",
                    task.id
                )));
            }
            seen[idx] = true;
            statuses[idx] = task.status;
        }
        Ok(Self { graph, statuses })
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    fn index(&self, id: &str) -> Result<TaskIndex, TaskError> {
        self.graph
            .index_of(id)
            .ok_or_else(|| TaskError::UnknownTask(id.to_string()))
    }

    pub fn status(&self, id: &str) -> Option<TaskStatus> {
        self.graph.index_of(id).map(|i| self.statuses[i])
    }

    /// Ids of all ready tasks, in declaration order.
    pub fn ready_tasks(&self) -> Vec<String> {
        self.ids_with(TaskStatus::Ready)
    }

    /// Ids of tasks currently running.
    pub fn running_tasks(&self) -> Vec<String> {
        self.ids_with(TaskStatus::Running)
    }

    /// The first ready task in declaration order.
    pub fn next_ready(&self) -> Option<String> {
        self.statuses
            .iter()
            .position(|s| *s == TaskStatus::Ready)
            .and_then(|i| self.graph.id(i))
            .map(str::to_string)
    }

    fn ids_with(&self, status: TaskStatus) -> Vec<String> {
        self.statuses
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == status)
            .filter_map(|(i, _)| self.graph.id(i).map(str::to_string))
            .collect()
    }

    fn transition(&mut self, id: &str, from: &[TaskStatus], to: TaskStatus) -> Result<TaskIndex, TaskError> {
        let idx = self.index(id)?;
        let current = self.statuses[idx];
        if !from.contains(&current) {
            return Err(TaskError::InvalidTransition {
                task: id.to_string(),
                from: current,
                to,
            });
        }
        self.statuses[idx] = to;
        Ok(idx)
    }

    pub fn mark_running(&mut self, id: &str) -> Result<(), TaskError> {
        self.transition(id, &[TaskStatus::Ready], TaskStatus::Running)
            .map(|_| ())
    }

    /// Complete a task and return the ids that became ready as a result.
    pub fn mark_complete(&mut self, id: &str) -> Result<Vec<String>, TaskError> {
        let idx = self.transition(
            id,
            &[TaskStatus::Ready, TaskStatus::Running],
            TaskStatus::Completed,
        )?;

        let mut unblocked = Vec::new();
        for &dependent in self.graph.dependents(idx) {
            if self.statuses[dependent] != TaskStatus::Blocked {
                continue;
            }
            let satisfied = self
                .graph
                .dependencies(dependent)
                .iter()
                .all(|&d| self.statuses[d] == TaskStatus::Completed);
            if satisfied {
                self.statuses[dependent] = TaskStatus::Ready;
                if let Some(dep_id) = self.graph.id(dependent) {
                    unblocked.push(dep_id.to_string());
                }
            }
        }
        Ok(unblocked)
    }

    pub fn mark_failed(&mut self, id: &str) -> Result<(), TaskError> {
        self.transition(
            id,
            &[TaskStatus::Ready, TaskStatus::Running],
            TaskStatus::Failed,
        )
        .map(|_| ())
    }

    /// Put a failed task back in the ready set after remediation.
    pub fn retry(&mut self, id: &str) -> Result<(), TaskError> {
        self.transition(id, &[TaskStatus::Failed], TaskStatus::Ready)
            .map(|_| ())
    }

    /// True when nothing is ready or running.
    pub fn is_drained(&self) -> bool {
        !self
            .statuses
            .iter()
            .any(|s| matches!(s, TaskStatus::Ready | TaskStatus::Running))
    }

    pub fn all_completed(&self) -> bool {
        self.statuses.iter().all(|s| *s == TaskStatus::Completed)
    }

    pub fn snapshot(&self) -> Vec<Task> {
        (0..self.graph.len())
            .map(|i| Task {
                id: self.graph.ids()[i].clone(),
                blocks: self.graph.blocks_ids(i),
                blocked_by: self.graph.blocked_by_ids(i),
                status: self.statuses[i],
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::builder::{DagBuilder, TaskSpec};

    fn chain() -> TaskGraph {
        DagBuilder::new(vec![
            TaskSpec::new("g1", vec![]),
            TaskSpec::new("g2", vec!["g1".into()]),
            TaskSpec::new("g3", vec!["g2".into()]),
        ])
        .build()
        .unwrap()
    }

    fn diamond() -> TaskGraph {
        DagBuilder::new(vec![
            TaskSpec::new("a", vec![]),
            TaskSpec::new("b", vec!["a".into()]),
            TaskSpec::new("c", vec!["a".into()]),
            TaskSpec::new("d", vec!["b".into(), "c".into()]),
        ])
        .build()
        .unwrap()
    }

    #[test]
    fn test_initial_ready_set_is_roots() {
        let resolver = TaskResolver::new(diamond());
        assert_eq!(resolver.ready_tasks(), vec!["a".to_string()]);
        assert_eq!(resolver.status("d"), Some(TaskStatus::Blocked));
    }

    #[test]
    fn test_completion_unblocks_only_when_all_deps_done() {
        let mut resolver = TaskResolver::new(diamond());
        let unblocked = resolver.mark_complete("a").unwrap();
        assert_eq!(unblocked, vec!["b".to_string(), "c".to_string()]);

        assert!(resolver.mark_complete("b").unwrap().is_empty());
        assert_eq!(resolver.status("d"), Some(TaskStatus::Blocked));

        assert_eq!(resolver.mark_complete("c").unwrap(), vec!["d".to_string()]);
        assert_eq!(resolver.next_ready().as_deref(), Some("d"));
    }

    #[test]
    fn test_failed_task_never_releases_dependents() {
        let mut resolver = TaskResolver::new(chain());
        resolver.mark_running("g1").unwrap();
        resolver.mark_failed("g1").unwrap();

        assert!(resolver.ready_tasks().is_empty());
        assert_eq!(resolver.status("g2"), Some(TaskStatus::Blocked));
        assert_eq!(resolver.status("g3"), Some(TaskStatus::Blocked));
        assert!(resolver.is_drained());
        assert!(!resolver.all_completed());
    }

    #[test]
    fn test_retry_after_failure() {
        let mut resolver = TaskResolver::new(chain());
        resolver.mark_running("g1").unwrap();
        resolver.mark_failed("g1").unwrap();
        resolver.retry("g1").unwrap();
        assert_eq!(resolver.next_ready().as_deref(), Some("g1"));
    }

    #[test]
    fn test_invalid_transitions() {
        let mut resolver = TaskResolver::new(chain());
        let err = resolver.mark_running("g2").unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        assert!(err.to_string().contains("blocked"));

        assert!(matches!(
            resolver.mark_complete("nope"),
            Err(TaskError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut resolver = TaskResolver::new(diamond());
        resolver.mark_complete("a").unwrap();
        resolver.mark_running("b").unwrap();

        let snapshot = resolver.snapshot();
        assert_eq!(snapshot[0].blocks, vec!["b".to_string(), "c".to_string()]);

        let restored = TaskResolver::restore(diamond(), &snapshot).unwrap();
        assert_eq!(restored.running_tasks(), vec!["b".to_string()]);
        assert_eq!(restored.ready_tasks(), vec!["c".to_string()]);
    }

    #[test]
    fn test_restore_rejects_foreign_snapshot() {
        let snapshot = TaskResolver::new(chain()).snapshot();
        let err = TaskResolver::restore(diamond(), &snapshot).unwrap_err();
        assert!(matches!(err, TaskError::SnapshotMismatch(_)));
    }

    #[test]
    fn test_drained_after_all_complete() {
        let mut resolver = TaskResolver::new(chain());
        for id in ["g1", "g2", "g3"] {
            resolver.mark_running(id).unwrap();
            resolver.mark_complete(id).unwrap();
        }
        assert!(resolver.is_drained());
        assert!(resolver.all_completed());
    }
}
