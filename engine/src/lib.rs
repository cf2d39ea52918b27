#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Foreman task decomposition and delegation engine with a feedback-driven
//! self-tuning loop.

/// Scheduler, execution supervisor, and retry policy.
#[path = "../dispatch/main.rs"]
pub mod dispatch;

/// Feedback loop, candidate enumeration, and offline replay.
#[path = "../feedback/main.rs"]
pub mod feedback;

/// Task graphs, structural analysis, and decomposition.
#[path = "../graph/main.rs"]
pub mod graph;

/// Domain model and tunable parameters.
#[path = "../module.rs"]
pub mod module;

/// Durable task, transition, and outcome journals.
#[path = "../persistence.rs"]
pub mod persistence;

/// Capability registry and worker statistics.
#[path = "../registry/main.rs"]
pub mod registry;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Built-in worker executors.
#[path = "../workers.rs"]
pub mod workers;

/// Runtime entrypoints and orchestration helpers.
#[path = "../main.rs"]
pub mod orchestration_entry;

pub use dispatch::backoff::BackoffPolicy;
pub use dispatch::supervisor::{
    ExecutionSupervisor, SupervisorConfig, WorkAssignment, WorkerExecutor, WorkerFailure,
};
pub use dispatch::{Scheduler, SchedulerConfig, TaskSnapshot};
pub use feedback::{
    DeploymentEvent, FeedbackConfig, FeedbackHandle, FeedbackLoop, OutcomeHistory, WindowMetrics,
};
pub use graph::builder::{ChildBlueprint, DecompositionPolicy, GraphBuilder, Strategy, SubtaskSeed};
pub use graph::TaskGraph;
pub use module::{
    EngineError, EngineLimits, ErrorCategory, ExecutionOutcome, ParameterStore, ScoringWeights,
    Subtask, SubtaskId, SubtaskStatus, TaskId, TaskRecord, TaskRequest, TaskStatus,
    TuningParameters, WorkerId,
};
pub use orchestration_entry::{EngineRuntime, EngineRuntimeBuilder};
pub use persistence::{
    JsonlTaskStore, MemoryTaskStore, StatusFilter, SubtaskTransition, TaskStore,
};
pub use registry::{CapabilityRegistry, WorkerProfile, WorkerView};
pub use telemetry::{EngineTelemetry, EngineTelemetryBuilder};
pub use workers::{LoopbackExecutor, ScriptedExecutor, SimulatedExecutor};
