//! Dependency DAG produced for one task.

/// Structural analysis (topological order, critical path).
pub mod analysis;
/// Decomposition strategies and the graph builder.
pub mod builder;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::module::{EngineError, Subtask, SubtaskId, SubtaskStatus, TaskId};

/// The subtask DAG for one task. Structure is immutable after construction;
/// only node status fields mutate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGraph {
    task_id: TaskId,
    nodes: IndexMap<SubtaskId, Subtask>,
}

impl TaskGraph {
    /// Assembles a graph from prepared nodes.
    #[must_use]
    pub fn from_nodes(task_id: TaskId, nodes: Vec<Subtask>) -> Self {
        Self {
            task_id,
            nodes: nodes.into_iter().map(|node| (node.id, node)).collect(),
        }
    }

    /// Owning task id.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up one node.
    #[must_use]
    pub fn node(&self, id: SubtaskId) -> Option<&Subtask> {
        self.nodes.get(&id)
    }

    /// Mutable access to one node's status fields.
    pub fn node_mut(&mut self, id: SubtaskId) -> Option<&mut Subtask> {
        self.nodes.get_mut(&id)
    }

    /// Iterates nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Subtask> {
        self.nodes.values()
    }

    /// Direct dependents of the given node.
    #[must_use]
    pub fn dependents(&self, id: SubtaskId) -> Vec<SubtaskId> {
        self.nodes
            .values()
            .filter(|node| node.depends_on.contains(&id))
            .map(|node| node.id)
            .collect()
    }

    /// Every node reachable through dependent edges from the given node.
    #[must_use]
    pub fn transitive_dependents(&self, id: SubtaskId) -> Vec<SubtaskId> {
        let mut seen: Vec<SubtaskId> = Vec::new();
        let mut frontier = self.dependents(id);
        while let Some(next) = frontier.pop() {
            if seen.contains(&next) {
                continue;
            }
            seen.push(next);
            frontier.extend(self.dependents(next));
        }
        seen
    }

    /// Count of not-yet-completed predecessors per node.
    #[must_use]
    pub fn pending_predecessors(&self) -> IndexMap<SubtaskId, usize> {
        self.nodes
            .values()
            .map(|node| {
                let pending = node
                    .depends_on
                    .iter()
                    .filter(|dep| {
                        self.nodes
                            .get(*dep)
                            .is_some_and(|d| d.status != SubtaskStatus::Completed)
                    })
                    .count();
                (node.id, pending)
            })
            .collect()
    }

    /// Verifies the dependency relation is acyclic and references only nodes
    /// inside the graph. A violation is a decomposition-policy defect.
    pub fn validate(&self) -> Result<(), EngineError> {
        for node in self.nodes.values() {
            for dep in &node.depends_on {
                if !self.nodes.contains_key(dep) {
                    return Err(EngineError::InvariantViolation(format!(
                        "node {} depends on unknown node {dep}",
                        node.id
                    )));
                }
            }
        }
        analysis::topological_order(self).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn node(task_id: TaskId, deps: Vec<SubtaskId>) -> Subtask {
        Subtask {
            id: Uuid::new_v4(),
            task_id,
            kind: "unit".into(),
            description: "node".into(),
            complexity: 0.1,
            estimated_ms: 100,
            depends_on: deps,
            optional: false,
            status: SubtaskStatus::Pending,
            assigned_worker: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output: None,
        }
    }

    #[test]
    fn transitive_dependents_walk_the_whole_chain() {
        let task_id = Uuid::new_v4();
        let a = node(task_id, vec![]);
        let b = node(task_id, vec![a.id]);
        let c = node(task_id, vec![b.id]);
        let a_id = a.id;
        let graph = TaskGraph::from_nodes(task_id, vec![a, b, c]);

        assert_eq!(graph.dependents(a_id).len(), 1);
        assert_eq!(graph.transitive_dependents(a_id).len(), 2);
    }

    #[test]
    fn validate_rejects_unknown_dependency() {
        let task_id = Uuid::new_v4();
        let stray = Uuid::new_v4();
        let a = node(task_id, vec![stray]);
        let graph = TaskGraph::from_nodes(task_id, vec![a]);
        assert!(matches!(
            graph.validate(),
            Err(EngineError::InvariantViolation(_))
        ));
    }

    #[test]
    fn pending_predecessors_track_completion() {
        let task_id = Uuid::new_v4();
        let a = node(task_id, vec![]);
        let b = node(task_id, vec![a.id]);
        let a_id = a.id;
        let b_id = b.id;
        let mut graph = TaskGraph::from_nodes(task_id, vec![a, b]);

        assert_eq!(graph.pending_predecessors()[&b_id], 1);
        graph.node_mut(a_id).unwrap().status = SubtaskStatus::Completed;
        assert_eq!(graph.pending_predecessors()[&b_id], 0);
    }
}
