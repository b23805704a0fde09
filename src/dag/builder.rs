//! DAG builder for gate/task dependency graphs.
//!
//! The builder takes task declarations with their `blocked_by` edges and
//! constructs a directed acyclic graph. Construction is the only place cycles
//! are checked; a graph that exists is acyclic.

use std::collections::HashMap;

use crate::errors::ConfigError;

/// Index into the task list.
pub type TaskIndex = usize;

/// A task declaration: an id and the ids that must complete before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub id: String,
    pub blocked_by: Vec<String>,
}

impl TaskSpec {
    pub fn new(id: impl Into<String>, blocked_by: Vec<String>) -> Self {
        Self {
            id: id.into(),
            blocked_by,
        }
    }
}

/// A directed acyclic graph of tasks.
///
/// Tasks keep their declaration order, so lower indices are preferred when
/// several tasks are ready at once.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    ids: Vec<String>,
    index_map: HashMap<String, TaskIndex>,
    /// index -> tasks it blocks
    forward_edges: Vec<Vec<TaskIndex>>,
    /// index -> tasks it is blocked by
    reverse_edges: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, index: TaskIndex) -> Option<&str> {
        self.ids.get(index).map(String::as_str)
    }

    pub fn index_of(&self, id: &str) -> Option<TaskIndex> {
        self.index_map.get(id).copied()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Tasks blocked by the given task.
    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks the given task is blocked by.
    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks with no dependencies.
    pub fn roots(&self) -> Vec<TaskIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    fn ids_of(&self, indices: &[TaskIndex]) -> Vec<String> {
        indices.iter().map(|&i| self.ids[i].clone()).collect()
    }

    /// Ids of the tasks blocked by `index`.
    pub fn blocks_ids(&self, index: TaskIndex) -> Vec<String> {
        self.ids_of(self.dependents(index))
    }

    /// Ids of the tasks `index` is blocked by.
    pub fn blocked_by_ids(&self, index: TaskIndex) -> Vec<String> {
        self.ids_of(self.dependencies(index))
    }
}

/// Builder for task graphs.
pub struct DagBuilder {
    tasks: Vec<TaskSpec>,
}

impl DagBuilder {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }

    /// Build the graph.
    ///
    /// Fails when an id is duplicated, a dependency names an unknown task, or
    /// the edges contain a cycle.
    pub fn build(self) -> Result<TaskGraph, ConfigError> {
        let mut index_map = HashMap::with_capacity(self.tasks.len());
        for (i, task) in self.tasks.iter().enumerate() {
            if index_map.insert(task.id.clone(), i).is_some() {
                return Err(ConfigError::DuplicateId(task.id.clone()));
            }
        }

        let mut forward_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];
        let mut reverse_edges: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];

        for (to_idx, task) in self.tasks.iter().enumerate() {
            for dep in &task.blocked_by {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| ConfigError::UnknownDependency {
                            gate: task.id.clone(),
                            dependency: dep.clone(),
                        })?;
                if reverse_edges[to_idx].contains(&from_idx) {
                    continue;
                }
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = TaskGraph {
            ids: self.tasks.into_iter().map(|t| t.id).collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Kahn's algorithm: every node must be drained from the zero in-degree
    /// queue, otherwise the leftovers sit on a cycle.
    fn validate_no_cycles(graph: &TaskGraph) -> Result<(), ConfigError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(Vec::len).collect();

        let mut queue: Vec<TaskIndex> = graph.roots();
        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            let involved = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| graph.ids[i].clone())
                .collect();
            return Err(ConfigError::Cycle { involved });
        }

        Ok(())
    }
}
