//! Runs exactly one subtask attempt against a worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{sleep, timeout, Instant},
};

use crate::module::{ErrorCategory, ExecutionOutcome, Subtask, SubtaskId, TaskId, WorkerId};

/// Everything a worker needs to execute one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkAssignment {
    /// Subtask being attempted.
    pub subtask_id: SubtaskId,
    /// Owning task.
    pub task_id: TaskId,
    /// Worker selected for the attempt.
    pub worker_id: WorkerId,
    /// Required skill / task kind.
    pub kind: String,
    /// Subtask description.
    pub description: String,
    /// Task input payload.
    pub payload: serde_json::Value,
    /// Subtask complexity.
    pub complexity: f32,
    /// Estimated duration in milliseconds.
    pub estimated_ms: u64,
    /// Attempt number (0 = first try).
    pub attempt: u32,
}

/// Failure raised by a worker implementation.
#[derive(Debug, Error)]
pub enum WorkerFailure {
    /// The worker started but could not finish the assignment.
    #[error("execution failure: {0}")]
    Execution(String),
    /// The worker refused the assignment outright.
    #[error("assignment rejected: {0}")]
    Rejected(String),
}

/// External collaborator that executes assignments. Cancellation is
/// cooperative: the supervisor stops awaiting after a grace period.
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    /// Executes one assignment, returning its output.
    async fn run(&self, assignment: WorkAssignment) -> Result<serde_json::Value, WorkerFailure>;
}

/// Timeout and cancellation discipline for attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Deadline multiplier applied to the estimated duration.
    pub slack_factor: f64,
    /// Floor on the attempt deadline, in milliseconds.
    pub min_timeout_ms: u64,
    /// How long a cancelled attempt may keep running before the hard cutoff.
    pub cancel_grace_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            slack_factor: 2.5,
            min_timeout_ms: 250,
            cancel_grace_ms: 100,
        }
    }
}

/// Result of one supervised attempt: the recorded outcome plus any output.
#[derive(Debug)]
pub struct AttemptResult {
    /// The immutable attempt record.
    pub outcome: ExecutionOutcome,
    /// Worker output, present on success.
    pub output: Option<serde_json::Value>,
}

/// Enforces time and cancellation discipline around worker calls.
pub struct ExecutionSupervisor {
    executor: Arc<dyn WorkerExecutor>,
    config: SupervisorConfig,
}

impl std::fmt::Debug for ExecutionSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSupervisor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ExecutionSupervisor {
    /// Creates a supervisor around the given executor.
    #[must_use]
    pub fn new(executor: Arc<dyn WorkerExecutor>, config: SupervisorConfig) -> Self {
        Self { executor, config }
    }

    /// Runs exactly one attempt. Every call produces exactly one outcome,
    /// whatever happens to the worker.
    pub async fn execute(
        &self,
        subtask: &Subtask,
        worker_id: WorkerId,
        payload: serde_json::Value,
        mut cancel: watch::Receiver<bool>,
    ) -> AttemptResult {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let deadline_ms = ((subtask.estimated_ms as f64) * self.config.slack_factor) as u64;
        let deadline = Duration::from_millis(deadline_ms.max(self.config.min_timeout_ms));

        let assignment = WorkAssignment {
            subtask_id: subtask.id,
            task_id: subtask.task_id,
            worker_id,
            kind: subtask.kind.clone(),
            description: subtask.description.clone(),
            payload,
            complexity: subtask.complexity,
            estimated_ms: subtask.estimated_ms,
            attempt: subtask.retry_count,
        };

        let started = Instant::now();
        let fut = self.executor.run(assignment);
        tokio::pin!(fut);

        let elapsed_ms = |started: Instant| -> u64 {
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
        };

        tokio::select! {
            result = &mut fut => match result {
                Ok(output) => AttemptResult {
                    outcome: ExecutionOutcome::success(subtask, worker_id, elapsed_ms(started)),
                    output: Some(output),
                },
                Err(_) => AttemptResult {
                    outcome: ExecutionOutcome::failure(
                        subtask,
                        worker_id,
                        elapsed_ms(started),
                        ErrorCategory::ExecutionError,
                    ),
                    output: None,
                },
            },
            () = sleep(deadline) => AttemptResult {
                outcome: ExecutionOutcome::failure(
                    subtask,
                    worker_id,
                    elapsed_ms(started),
                    ErrorCategory::Timeout,
                ),
                output: None,
            },
            () = cancelled(&mut cancel) => {
                // Grace window for the worker to acknowledge, then hard cutoff.
                let _ = timeout(
                    Duration::from_millis(self.config.cancel_grace_ms),
                    &mut fut,
                )
                .await;
                AttemptResult {
                    outcome: ExecutionOutcome::failure(
                        subtask,
                        worker_id,
                        elapsed_ms(started),
                        ErrorCategory::Cancelled,
                    ),
                    output: None,
                }
            }
        }
    }
}

async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: the task can no longer be cancelled this way.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::SubtaskStatus;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn subtask(estimated_ms: u64) -> Subtask {
        Subtask {
            id: Uuid::new_v4(),
            task_id: Uuid::new_v4(),
            kind: "unit".into(),
            description: "attempt".into(),
            complexity: 0.2,
            estimated_ms,
            depends_on: Vec::new(),
            optional: false,
            status: SubtaskStatus::Running,
            assigned_worker: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            output: None,
        }
    }

    struct Echo;

    #[async_trait]
    impl WorkerExecutor for Echo {
        async fn run(&self, assignment: WorkAssignment) -> Result<serde_json::Value, WorkerFailure> {
            Ok(json!({ "echo": assignment.payload }))
        }
    }

    struct Slow;

    #[async_trait]
    impl WorkerExecutor for Slow {
        async fn run(&self, _: WorkAssignment) -> Result<serde_json::Value, WorkerFailure> {
            sleep(Duration::from_secs(30)).await;
            Ok(json!({}))
        }
    }

    struct Broken;

    #[async_trait]
    impl WorkerExecutor for Broken {
        async fn run(&self, _: WorkAssignment) -> Result<serde_json::Value, WorkerFailure> {
            Err(WorkerFailure::Execution("backend unavailable".into()))
        }
    }

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            slack_factor: 2.0,
            min_timeout_ms: 50,
            cancel_grace_ms: 10,
        }
    }

    #[tokio::test]
    async fn success_attaches_output() {
        let supervisor = ExecutionSupervisor::new(Arc::new(Echo), config());
        let (_tx, rx) = watch::channel(false);
        let result = supervisor
            .execute(&subtask(10), Uuid::new_v4(), json!({ "doc": "x" }), rx)
            .await;
        assert!(result.outcome.success);
        assert!(result.outcome.error.is_none());
        assert_eq!(result.output.unwrap()["echo"]["doc"], "x");
    }

    #[tokio::test]
    async fn deadline_produces_timeout_category() {
        let supervisor = ExecutionSupervisor::new(Arc::new(Slow), config());
        let (_tx, rx) = watch::channel(false);
        let result = supervisor
            .execute(&subtask(10), Uuid::new_v4(), json!("input"), rx)
            .await;
        assert!(!result.outcome.success);
        assert_eq!(result.outcome.error, Some(ErrorCategory::Timeout));
    }

    #[tokio::test]
    async fn worker_error_produces_execution_category() {
        let supervisor = ExecutionSupervisor::new(Arc::new(Broken), config());
        let (_tx, rx) = watch::channel(false);
        let result = supervisor
            .execute(&subtask(10), Uuid::new_v4(), json!("input"), rx)
            .await;
        assert_eq!(result.outcome.error, Some(ErrorCategory::ExecutionError));
    }

    #[tokio::test]
    async fn cancel_signal_wins_over_slow_worker() {
        let supervisor = ExecutionSupervisor::new(Arc::new(Slow), config());
        let (tx, rx) = watch::channel(false);
        let node = subtask(100_000);
        let handle = tokio::spawn(async move {
            supervisor
                .execute(&node, Uuid::new_v4(), json!("input"), rx)
                .await
        });
        sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        let result = handle.await.unwrap();
        assert_eq!(result.outcome.error, Some(ErrorCategory::Cancelled));
    }
}
