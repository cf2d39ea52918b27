//! Decomposition of tasks into dependency graphs.

use std::{fmt, sync::Arc};

use chrono::Utc;
use indexmap::IndexMap;
use uuid::Uuid;

use super::TaskGraph;
use crate::module::{
    EngineError, ParameterStore, Subtask, SubtaskId, SubtaskStatus, TaskRecord, TuningParameters,
};

/// Parent context handed to a decomposition policy.
#[derive(Debug, Clone)]
pub struct SubtaskSeed {
    /// Kind of the node being split.
    pub kind: String,
    /// Description of the node being split.
    pub description: String,
    /// Complexity of the node being split.
    pub complexity: f32,
    /// Current recursion depth (root = 0).
    pub depth: u32,
}

/// One child produced by a decomposition policy.
#[derive(Debug, Clone)]
pub struct ChildBlueprint {
    /// Kind (and required skill) of the child.
    pub kind: String,
    /// Human-readable description.
    pub description: String,
    /// Complexity in [0, 1].
    pub complexity: f32,
    /// Best-effort branch: terminal failure does not fail the task.
    pub optional: bool,
    /// Indices of sibling children this child depends on.
    pub after: Vec<usize>,
}

impl ChildBlueprint {
    /// Creates an independent child.
    #[must_use]
    pub fn new(kind: impl Into<String>, description: impl Into<String>, complexity: f32) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            complexity: complexity.clamp(0.0, 1.0),
            optional: false,
            after: Vec::new(),
        }
    }

    /// Marks the child as best-effort.
    #[must_use]
    pub const fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Declares sibling dependencies by child index.
    #[must_use]
    pub fn after(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.after = indices.into_iter().collect();
        self
    }
}

/// Callback supplying an explicit child layout for hybrid decomposition.
pub trait DecompositionPolicy: Send + Sync {
    /// Returns the children (and their adjacency) for the given parent.
    fn split(&self, parent: &SubtaskSeed) -> Vec<ChildBlueprint>;
}

/// Decomposition strategy, selected per task kind.
#[derive(Clone)]
pub enum Strategy {
    /// Chain of children, each depending on the prior.
    Sequential,
    /// Independent children joined by one synchronization sink.
    Parallel,
    /// Explicit adjacency supplied by a policy callback.
    Hybrid(Arc<dyn DecompositionPolicy>),
}

impl fmt::Debug for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "Sequential"),
            Self::Parallel => write!(f, "Parallel"),
            Self::Hybrid(_) => write!(f, "Hybrid(..)"),
        }
    }
}

/// Builds a validated subtask DAG for each accepted task.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    params: ParameterStore,
    strategies: IndexMap<String, Strategy>,
    default_strategy: Strategy,
    base_duration_ms: u64,
    min_duration_ms: u64,
}

impl GraphBuilder {
    /// Creates a builder reading thresholds from the given parameter store.
    #[must_use]
    pub fn new(params: ParameterStore) -> Self {
        Self {
            params,
            strategies: IndexMap::new(),
            default_strategy: Strategy::Sequential,
            base_duration_ms: 1000,
            min_duration_ms: 50,
        }
    }

    /// Registers the strategy used for a task kind.
    #[must_use]
    pub fn with_strategy(mut self, kind: impl Into<String>, strategy: Strategy) -> Self {
        self.strategies.insert(kind.into(), strategy);
        self
    }

    /// Sets the strategy used for kinds without an explicit registration.
    #[must_use]
    pub fn with_default_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Sets the duration model (floor + complexity-proportional base).
    #[must_use]
    pub const fn with_duration_model(mut self, base_ms: u64, min_ms: u64) -> Self {
        self.base_duration_ms = base_ms;
        self.min_duration_ms = min_ms;
        self
    }

    /// Converts one task into a validated subtask DAG.
    ///
    /// Below-threshold tasks become a single leaf node. Recursion stops at
    /// the configured maximum depth; an over-threshold node at that depth is
    /// accepted as-is so decomposition always terminates. A cycle coming out
    /// of a policy is a fatal [`EngineError::InvariantViolation`].
    pub fn decompose(&self, record: &TaskRecord) -> Result<TaskGraph, EngineError> {
        let params = self.params.load();
        let seed = SubtaskSeed {
            kind: record.kind.clone(),
            description: format!("{} :: root", record.kind),
            complexity: record.complexity,
            depth: 0,
        };
        let mut nodes = Vec::new();
        self.expand(record, &seed, false, &params, &mut nodes)?;
        let graph = TaskGraph::from_nodes(record.id, nodes);
        graph.validate()?;
        Ok(graph)
    }

    fn expand(
        &self,
        record: &TaskRecord,
        seed: &SubtaskSeed,
        optional: bool,
        params: &TuningParameters,
        nodes: &mut Vec<Subtask>,
    ) -> Result<Span, EngineError> {
        if seed.complexity < params.decomposition_threshold || seed.depth >= params.max_depth {
            let id = self.push_leaf(record, seed, optional, nodes);
            return Ok(Span {
                entries: vec![id],
                exits: vec![id],
            });
        }

        let strategy = self
            .strategies
            .get(&seed.kind)
            .unwrap_or(&self.default_strategy)
            .clone();
        let blueprints = match &strategy {
            Strategy::Sequential => default_children(seed, "stage"),
            Strategy::Parallel => default_children(seed, "branch"),
            Strategy::Hybrid(policy) => policy.split(seed),
        };
        if blueprints.is_empty() {
            let id = self.push_leaf(record, seed, optional, nodes);
            return Ok(Span {
                entries: vec![id],
                exits: vec![id],
            });
        }

        let mut spans = Vec::with_capacity(blueprints.len());
        for blueprint in &blueprints {
            let child_seed = SubtaskSeed {
                kind: blueprint.kind.clone(),
                description: blueprint.description.clone(),
                complexity: blueprint.complexity,
                depth: seed.depth + 1,
            };
            let span = self.expand(
                record,
                &child_seed,
                optional || blueprint.optional,
                params,
                nodes,
            )?;
            spans.push(span);
        }

        match strategy {
            Strategy::Sequential => {
                for idx in 1..spans.len() {
                    let deps = spans[idx - 1].exits.clone();
                    add_dependencies(nodes, &spans[idx].entries, &deps);
                }
                Ok(Span {
                    entries: spans
                        .first()
                        .map(|span| span.entries.clone())
                        .unwrap_or_default(),
                    exits: spans
                        .last()
                        .map(|span| span.exits.clone())
                        .unwrap_or_default(),
                })
            }
            Strategy::Parallel => {
                let sink_seed = SubtaskSeed {
                    kind: seed.kind.clone(),
                    description: format!("{} :: join", seed.description),
                    complexity: 0.0,
                    depth: seed.depth + 1,
                };
                let sink = self.push_leaf(record, &sink_seed, optional, nodes);
                let deps: Vec<SubtaskId> =
                    spans.iter().flat_map(|span| span.exits.clone()).collect();
                add_dependencies(nodes, &[sink], &deps);
                Ok(Span {
                    entries: spans.iter().flat_map(|span| span.entries.clone()).collect(),
                    exits: vec![sink],
                })
            }
            Strategy::Hybrid(_) => {
                for (idx, blueprint) in blueprints.iter().enumerate() {
                    for &pred in &blueprint.after {
                        if pred >= blueprints.len() {
                            return Err(EngineError::InvariantViolation(format!(
                                "policy for kind {} references child {pred} of {}",
                                seed.kind,
                                blueprints.len()
                            )));
                        }
                        let deps = spans[pred].exits.clone();
                        add_dependencies(nodes, &spans[idx].entries, &deps);
                    }
                }
                // Exits are the children no sibling depends on; a cyclic
                // layout leaves this empty and fails validation later.
                let referenced: Vec<usize> = blueprints
                    .iter()
                    .flat_map(|blueprint| blueprint.after.clone())
                    .collect();
                let exits = spans
                    .iter()
                    .enumerate()
                    .filter(|(idx, _)| !referenced.contains(idx))
                    .flat_map(|(_, span)| span.exits.clone())
                    .collect();
                let entries = blueprints
                    .iter()
                    .zip(&spans)
                    .filter(|(blueprint, _)| blueprint.after.is_empty())
                    .flat_map(|(_, span)| span.entries.clone())
                    .collect();
                Ok(Span { entries, exits })
            }
        }
    }

    fn push_leaf(
        &self,
        record: &TaskRecord,
        seed: &SubtaskSeed,
        optional: bool,
        nodes: &mut Vec<Subtask>,
    ) -> SubtaskId {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let estimated_ms = self.min_duration_ms
            + (f64::from(seed.complexity) * self.base_duration_ms as f64) as u64;
        let node = Subtask {
            id: Uuid::new_v4(),
            task_id: record.id,
            kind: seed.kind.clone(),
            description: seed.description.clone(),
            complexity: seed.complexity,
            estimated_ms,
            depends_on: Vec::new(),
            optional,
            status: SubtaskStatus::Pending,
            assigned_worker: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output: None,
        };
        let id = node.id;
        nodes.push(node);
        id
    }
}

struct Span {
    entries: Vec<SubtaskId>,
    exits: Vec<SubtaskId>,
}

fn default_children(seed: &SubtaskSeed, label: &str) -> Vec<ChildBlueprint> {
    let count = if seed.complexity > 0.75 { 3 } else { 2 };
    (0..count)
        .map(|idx| {
            ChildBlueprint::new(
                seed.kind.clone(),
                format!("{} :: {label} {}", seed.description, idx + 1),
                seed.complexity * 0.5,
            )
        })
        .collect()
}

fn add_dependencies(nodes: &mut [Subtask], targets: &[SubtaskId], deps: &[SubtaskId]) {
    for node in nodes.iter_mut() {
        if targets.contains(&node.id) {
            for dep in deps {
                if !node.depends_on.contains(dep) {
                    node.depends_on.push(*dep);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::analysis;
    use crate::module::TaskRequest;
    use parking_lot::Mutex;
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use serde_json::json;

    fn record(kind: &str, complexity: f32) -> TaskRecord {
        TaskRecord::accept(
            TaskRequest::new(kind, json!({ "input": "x" })).with_complexity(complexity),
        )
    }

    fn builder(params: TuningParameters) -> GraphBuilder {
        GraphBuilder::new(ParameterStore::new(params))
    }

    #[test]
    fn below_threshold_yields_single_node() {
        let builder = builder(TuningParameters::default());
        let graph = builder.decompose(&record("summarize", 0.2)).unwrap();
        assert_eq!(graph.len(), 1);
        let only = graph.nodes().next().unwrap();
        assert!(only.depends_on.is_empty());
    }

    #[test]
    fn sequential_strategy_builds_a_chain() {
        let builder = builder(TuningParameters {
            max_depth: 1,
            ..TuningParameters::default()
        });
        let graph = builder.decompose(&record("summarize", 0.6)).unwrap();
        assert_eq!(graph.len(), 2);
        let with_dep = graph
            .nodes()
            .filter(|node| !node.depends_on.is_empty())
            .count();
        assert_eq!(with_dep, 1);
    }

    #[test]
    fn parallel_strategy_adds_a_join_sink() {
        let builder = builder(TuningParameters {
            max_depth: 1,
            ..TuningParameters::default()
        })
        .with_strategy("ingest", Strategy::Parallel);
        let graph = builder.decompose(&record("ingest", 0.9)).unwrap();
        // Three branches plus the synchronization sink.
        assert_eq!(graph.len(), 4);
        let sink = graph
            .nodes()
            .find(|node| node.depends_on.len() == 3)
            .expect("sink depends on every branch");
        assert!(sink.description.ends_with("join"));
    }

    #[test]
    fn recursion_stops_at_max_depth() {
        let builder = builder(TuningParameters {
            decomposition_threshold: 0.01,
            max_depth: 2,
            ..TuningParameters::default()
        });
        let graph = builder.decompose(&record("deep", 1.0)).unwrap();
        // Every leaf at the depth cap is accepted as-is, never split further.
        assert!(graph.len() <= 9);
        assert!(analysis::topological_order(&graph).is_ok());
    }

    struct Diamond;

    impl DecompositionPolicy for Diamond {
        fn split(&self, parent: &SubtaskSeed) -> Vec<ChildBlueprint> {
            vec![
                ChildBlueprint::new(&parent.kind, "fetch", 0.1),
                ChildBlueprint::new(&parent.kind, "left", 0.1).after([0]),
                ChildBlueprint::new(&parent.kind, "right", 0.1).after([0]),
                ChildBlueprint::new(&parent.kind, "merge", 0.1).after([1, 2]),
            ]
        }
    }

    #[test]
    fn hybrid_policy_wires_explicit_adjacency() {
        let builder = builder(TuningParameters {
            max_depth: 1,
            ..TuningParameters::default()
        })
        .with_strategy("etl", Strategy::Hybrid(Arc::new(Diamond)));
        let graph = builder.decompose(&record("etl", 0.8)).unwrap();
        assert_eq!(graph.len(), 4);
        let merge = graph
            .nodes()
            .find(|node| node.description == "merge")
            .unwrap();
        assert_eq!(merge.depends_on.len(), 2);
    }

    struct CyclicPolicy;

    impl DecompositionPolicy for CyclicPolicy {
        fn split(&self, parent: &SubtaskSeed) -> Vec<ChildBlueprint> {
            vec![
                ChildBlueprint::new(&parent.kind, "a", 0.1).after([1]),
                ChildBlueprint::new(&parent.kind, "b", 0.1).after([0]),
            ]
        }
    }

    #[test]
    fn cyclic_policy_is_a_fatal_defect() {
        let builder = builder(TuningParameters::default())
            .with_strategy("bad", Strategy::Hybrid(Arc::new(CyclicPolicy)));
        assert!(matches!(
            builder.decompose(&record("bad", 0.8)),
            Err(EngineError::InvariantViolation(_))
        ));
    }

    struct OutOfRange;

    impl DecompositionPolicy for OutOfRange {
        fn split(&self, parent: &SubtaskSeed) -> Vec<ChildBlueprint> {
            vec![ChildBlueprint::new(&parent.kind, "a", 0.1).after([7])]
        }
    }

    #[test]
    fn out_of_range_index_is_a_fatal_defect() {
        let builder = builder(TuningParameters::default())
            .with_strategy("bad", Strategy::Hybrid(Arc::new(OutOfRange)));
        assert!(matches!(
            builder.decompose(&record("bad", 0.8)),
            Err(EngineError::InvariantViolation(_))
        ));
    }

    struct RandomForward {
        rng: Mutex<SmallRng>,
    }

    impl DecompositionPolicy for RandomForward {
        fn split(&self, parent: &SubtaskSeed) -> Vec<ChildBlueprint> {
            let mut rng = self.rng.lock();
            let count = rng.gen_range(2..5);
            (0..count)
                .map(|idx| {
                    let after: Vec<usize> =
                        (0..idx).filter(|_| rng.gen_bool(0.5)).collect();
                    ChildBlueprint::new(
                        &parent.kind,
                        format!("random {idx}"),
                        rng.gen_range(0.0..1.0),
                    )
                    .after(after)
                })
                .collect()
        }
    }

    #[test]
    fn random_forward_policies_always_produce_dags() {
        for seed in 0..32_u64 {
            let builder = builder(TuningParameters {
                decomposition_threshold: 0.3,
                max_depth: 3,
                ..TuningParameters::default()
            })
            .with_strategy(
                "fuzz",
                Strategy::Hybrid(Arc::new(RandomForward {
                    rng: Mutex::new(SmallRng::seed_from_u64(seed)),
                })),
            );
            let graph = builder.decompose(&record("fuzz", 0.95)).unwrap();
            assert!(analysis::topological_order(&graph).is_ok(), "seed {seed}");
        }
    }

    #[test]
    fn optional_flag_propagates_to_children() {
        struct OneOptional;
        impl DecompositionPolicy for OneOptional {
            fn split(&self, parent: &SubtaskSeed) -> Vec<ChildBlueprint> {
                vec![
                    ChildBlueprint::new(&parent.kind, "required", 0.1),
                    ChildBlueprint::new(&parent.kind, "best effort", 0.1).optional(),
                ]
            }
        }
        let builder = builder(TuningParameters {
            max_depth: 1,
            ..TuningParameters::default()
        })
        .with_strategy("mixed", Strategy::Hybrid(Arc::new(OneOptional)));
        let graph = builder.decompose(&record("mixed", 0.8)).unwrap();
        let optional = graph.nodes().filter(|node| node.optional).count();
        assert_eq!(optional, 1);
    }
}
