//! Structural analysis over task graphs.

use indexmap::IndexMap;

use super::TaskGraph;
use crate::module::{EngineError, SubtaskId};

/// Kahn topological order. A cycle is a fatal decomposition defect.
pub fn topological_order(graph: &TaskGraph) -> Result<Vec<SubtaskId>, EngineError> {
    let mut in_degree: IndexMap<SubtaskId, usize> = graph
        .nodes()
        .map(|node| (node.id, node.depends_on.len()))
        .collect();
    let mut order = Vec::with_capacity(in_degree.len());
    let mut queue: Vec<SubtaskId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();

    while let Some(id) = queue.pop() {
        order.push(id);
        for dependent in graph.dependents(id) {
            let degree = in_degree
                .get_mut(&dependent)
                .unwrap_or_else(|| unreachable!("dependents come from the same graph"));
            *degree -= 1;
            if *degree == 0 {
                queue.push(dependent);
            }
        }
    }

    if order.len() == in_degree.len() {
        Ok(order)
    } else {
        Err(EngineError::InvariantViolation(format!(
            "dependency cycle in graph for task {}",
            graph.task_id()
        )))
    }
}

/// Longest weighted dependency chain (weights are estimated durations).
/// Used for scheduling priority and reporting, not for correctness.
pub fn critical_path(graph: &TaskGraph) -> Result<(Vec<SubtaskId>, u64), EngineError> {
    let order = topological_order(graph)?;
    // Longest path ending at each node, walked in topological order.
    let mut best: IndexMap<SubtaskId, (u64, Option<SubtaskId>)> = IndexMap::new();
    for id in &order {
        let node = graph
            .node(*id)
            .unwrap_or_else(|| unreachable!("order comes from the same graph"));
        let (prefix, via) = node
            .depends_on
            .iter()
            .filter_map(|dep| best.get(dep).map(|(w, _)| (*w, Some(*dep))))
            .max_by_key(|(w, _)| *w)
            .unwrap_or((0, None));
        best.insert(*id, (prefix + node.estimated_ms, via));
    }

    let Some((&tail, &(total, _))) = best.iter().max_by_key(|(_, (w, _))| *w) else {
        return Ok((Vec::new(), 0));
    };
    let mut path = vec![tail];
    let mut cursor = tail;
    while let Some((_, Some(via))) = best.get(&cursor) {
        path.push(*via);
        cursor = *via;
    }
    path.reverse();
    Ok((path, total))
}

/// For each node, the heaviest chain of work that still depends on it
/// (inclusive of the node itself). Drives longest-remaining-path-first
/// dispatch ordering.
pub fn remaining_weights(graph: &TaskGraph) -> Result<IndexMap<SubtaskId, u64>, EngineError> {
    let order = topological_order(graph)?;
    let mut weights: IndexMap<SubtaskId, u64> = IndexMap::new();
    for id in order.iter().rev() {
        let node = graph
            .node(*id)
            .unwrap_or_else(|| unreachable!("order comes from the same graph"));
        let suffix = graph
            .dependents(*id)
            .iter()
            .filter_map(|dep| weights.get(dep))
            .max()
            .copied()
            .unwrap_or(0);
        weights.insert(*id, node.estimated_ms + suffix);
    }
    Ok(weights)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{Subtask, SubtaskStatus, TaskId};
    use chrono::Utc;
    use uuid::Uuid;

    fn node(task_id: TaskId, estimated_ms: u64, deps: Vec<SubtaskId>) -> Subtask {
        Subtask {
            id: Uuid::new_v4(),
            task_id,
            kind: "unit".into(),
            description: "node".into(),
            complexity: 0.1,
            estimated_ms,
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
    fn critical_path_picks_heaviest_chain() {
        let task_id = Uuid::new_v4();
        let root = node(task_id, 100, vec![]);
        let light = node(task_id, 50, vec![root.id]);
        let heavy_a = node(task_id, 400, vec![root.id]);
        let heavy_b = node(task_id, 300, vec![heavy_a.id]);
        let heavy_b_id = heavy_b.id;
        let graph = TaskGraph::from_nodes(task_id, vec![root, light, heavy_a, heavy_b]);

        let (path, total) = critical_path(&graph).unwrap();
        assert_eq!(total, 800);
        assert_eq!(path.len(), 3);
        assert_eq!(*path.last().unwrap(), heavy_b_id);
    }

    #[test]
    fn remaining_weights_include_downstream_work() {
        let task_id = Uuid::new_v4();
        let first = node(task_id, 100, vec![]);
        let second = node(task_id, 200, vec![first.id]);
        let first_id = first.id;
        let second_id = second.id;
        let graph = TaskGraph::from_nodes(task_id, vec![first, second]);

        let weights = remaining_weights(&graph).unwrap();
        assert_eq!(weights[&first_id], 300);
        assert_eq!(weights[&second_id], 200);
    }

    #[test]
    fn cycle_is_reported_as_invariant_violation() {
        let task_id = Uuid::new_v4();
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        let mut a = node(task_id, 10, vec![id_b]);
        let mut b = node(task_id, 10, vec![id_a]);
        a.id = id_a;
        b.id = id_b;
        let graph = TaskGraph::from_nodes(task_id, vec![a, b]);

        assert!(matches!(
            topological_order(&graph),
            Err(EngineError::InvariantViolation(_))
        ));
    }
}
