//! Append-only persistence port for tasks, transitions, and outcomes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::{fs::OpenOptions, io::AsyncWriteExt};

use crate::module::{
    EngineError, ExecutionOutcome, SubtaskId, SubtaskStatus, TaskId, TaskRecord, TaskStatus,
};

fn latest_by_id(records: impl IntoIterator<Item = TaskRecord>) -> Vec<TaskRecord> {
    let mut latest: IndexMap<TaskId, TaskRecord> = IndexMap::new();
    for record in records {
        latest.insert(record.id, record);
    }
    latest.into_values().collect()
}

/// Coarse task-status filter for journal queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFilter {
    /// Tasks still in flight.
    Running,
    /// Tasks that completed.
    Completed,
    /// Tasks that failed terminally.
    Failed,
    /// Tasks cancelled by the caller.
    Cancelled,
}

impl StatusFilter {
    /// Whether a task status falls under this filter.
    #[must_use]
    pub const fn matches(self, status: &TaskStatus) -> bool {
        matches!(
            (self, status),
            (Self::Running, TaskStatus::Running)
                | (Self::Completed, TaskStatus::Completed)
                | (Self::Failed, TaskStatus::Failed { .. })
                | (Self::Cancelled, TaskStatus::Cancelled)
        )
    }
}

/// One subtask status change, recorded as it happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskTransition {
    /// Owning task.
    pub task_id: TaskId,
    /// Subtask that changed state.
    pub subtask_id: SubtaskId,
    /// State entered.
    pub status: SubtaskStatus,
    /// Attempt count at the time of the transition.
    pub retry_count: u32,
    /// When the transition happened.
    pub at: DateTime<Utc>,
}

impl SubtaskTransition {
    /// Records a transition stamped with the current time.
    #[must_use]
    pub fn now(task_id: TaskId, subtask_id: SubtaskId, status: SubtaskStatus, retry_count: u32) -> Self {
        Self {
            task_id,
            subtask_id,
            status,
            retry_count,
            at: Utc::now(),
        }
    }
}

/// Append-only sink for the engine's durable history. Implementations never
/// rewrite past entries; later records supersede earlier ones on read.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Appends a task record (submission or terminal update).
    async fn record_task(&self, record: &TaskRecord) -> Result<(), EngineError>;
    /// Appends a subtask transition.
    async fn record_transition(&self, transition: &SubtaskTransition) -> Result<(), EngineError>;
    /// Appends an execution outcome.
    async fn record_outcome(&self, outcome: &ExecutionOutcome) -> Result<(), EngineError>;
    /// Latest recorded state of a task, if any.
    async fn task(&self, id: TaskId) -> Result<Option<TaskRecord>, EngineError>;
    /// Latest recorded state of every task whose status matches the filter.
    async fn tasks_by_status(&self, filter: StatusFilter) -> Result<Vec<TaskRecord>, EngineError>;
    /// Every transition recorded for a task, in append order.
    async fn transitions(&self, id: TaskId) -> Result<Vec<SubtaskTransition>, EngineError>;
    /// Every outcome recorded for a task, in append order.
    async fn outcomes(&self, id: TaskId) -> Result<Vec<ExecutionOutcome>, EngineError>;
}

/// In-memory store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<Vec<TaskRecord>>,
    transitions: Mutex<Vec<SubtaskTransition>>,
    outcomes: Mutex<Vec<ExecutionOutcome>>,
}

impl MemoryTaskStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of appended entries across all streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().len() + self.transitions.lock().len() + self.outcomes.lock().len()
    }

    /// Whether nothing has been appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn record_task(&self, record: &TaskRecord) -> Result<(), EngineError> {
        self.tasks.lock().push(record.clone());
        Ok(())
    }

    async fn record_transition(&self, transition: &SubtaskTransition) -> Result<(), EngineError> {
        self.transitions.lock().push(transition.clone());
        Ok(())
    }

    async fn record_outcome(&self, outcome: &ExecutionOutcome) -> Result<(), EngineError> {
        self.outcomes.lock().push(outcome.clone());
        Ok(())
    }

    async fn task(&self, id: TaskId) -> Result<Option<TaskRecord>, EngineError> {
        Ok(self
            .tasks
            .lock()
            .iter()
            .rev()
            .find(|record| record.id == id)
            .cloned())
    }

    async fn tasks_by_status(&self, filter: StatusFilter) -> Result<Vec<TaskRecord>, EngineError> {
        let mut records = latest_by_id(self.tasks.lock().iter().cloned());
        records.retain(|record| filter.matches(&record.status));
        Ok(records)
    }

    async fn transitions(&self, id: TaskId) -> Result<Vec<SubtaskTransition>, EngineError> {
        Ok(self
            .transitions
            .lock()
            .iter()
            .filter(|t| t.task_id == id)
            .cloned()
            .collect())
    }

    async fn outcomes(&self, id: TaskId) -> Result<Vec<ExecutionOutcome>, EngineError> {
        Ok(self
            .outcomes
            .lock()
            .iter()
            .filter(|o| o.task_id == id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum JournalEntry {
    Task(TaskRecord),
    Transition(SubtaskTransition),
    Outcome(ExecutionOutcome),
}

/// JSONL journal on disk, one entry per line.
#[derive(Debug)]
pub struct JsonlTaskStore {
    path: PathBuf,
    // Serializes appends so interleaved writers cannot tear lines.
    write_gate: tokio::sync::Mutex<()>,
}

impl JsonlTaskStore {
    /// Creates a journal at the given path. The file is created on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Journal file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, entry: &JournalEntry) -> Result<(), EngineError> {
        let mut line = serde_json::to_string(entry)
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        line.push('\n');
        let _gate = self.write_gate.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn read_entries(&self) -> Result<Vec<JournalEntry>, EngineError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(EngineError::Storage(e.to_string())),
        };
        let mut entries = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            let entry = serde_json::from_str(line)
                .map_err(|e| EngineError::Storage(e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[async_trait]
impl TaskStore for JsonlTaskStore {
    async fn record_task(&self, record: &TaskRecord) -> Result<(), EngineError> {
        self.append(&JournalEntry::Task(record.clone())).await
    }

    async fn record_transition(&self, transition: &SubtaskTransition) -> Result<(), EngineError> {
        self.append(&JournalEntry::Transition(transition.clone())).await
    }

    async fn record_outcome(&self, outcome: &ExecutionOutcome) -> Result<(), EngineError> {
        self.append(&JournalEntry::Outcome(outcome.clone())).await
    }

    async fn task(&self, id: TaskId) -> Result<Option<TaskRecord>, EngineError> {
        let mut latest = None;
        for entry in self.read_entries().await? {
            if let JournalEntry::Task(record) = entry {
                if record.id == id {
                    latest = Some(record);
                }
            }
        }
        Ok(latest)
    }

    async fn tasks_by_status(&self, filter: StatusFilter) -> Result<Vec<TaskRecord>, EngineError> {
        let records = self.read_entries().await?.into_iter().filter_map(|entry| {
            if let JournalEntry::Task(record) = entry {
                Some(record)
            } else {
                None
            }
        });
        let mut records = latest_by_id(records);
        records.retain(|record| filter.matches(&record.status));
        Ok(records)
    }

    async fn transitions(&self, id: TaskId) -> Result<Vec<SubtaskTransition>, EngineError> {
        Ok(self
            .read_entries()
            .await?
            .into_iter()
            .filter_map(|entry| match entry {
                JournalEntry::Transition(t) if t.task_id == id => Some(t),
                _ => None,
            })
            .collect())
    }

    async fn outcomes(&self, id: TaskId) -> Result<Vec<ExecutionOutcome>, EngineError> {
        Ok(self
            .read_entries()
            .await?
            .into_iter()
            .filter_map(|entry| match entry {
                JournalEntry::Outcome(o) if o.task_id == id => Some(o),
                _ => None,
            })
            .collect())
    }
}
