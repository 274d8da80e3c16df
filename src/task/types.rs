//! Core task types for the batch execution core.
//!
//! This module defines the type-safe task lifecycle using the typestate
//! pattern. A task progresses through distinct states, enforced at compile
//! time:
//!
//! ```text
//! pending → running → succeeded
//!                   → failed
//!         ↘ cancelled (from pending or running)
//! running → pending   (retryable failure with budget left)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::batch::BatchId;
use crate::error::TaskErrorKind;

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        TaskId(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        TaskId(uuid)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Identifier of the worker that claimed a running task.
pub type WorkerId = Uuid;

/// Input snapshot for one task: parameter name → scalar value, in the
/// column order of the source sheet.
pub type InputMap = serde_json::Map<String, serde_json::Value>;

/// Marker trait for valid task states.
pub trait TaskState: Send + Sync {}

/// A single row's invocation against the remote workflow.
///
/// The generic parameter `T` is the current lifecycle state; operations on a
/// task are only available in the states that permit them.
#[derive(Debug, Clone)]
pub struct Task<T: TaskState> {
    /// The current state of the task.
    pub state: T,
    /// The immutable task data, snapshotted at batch creation.
    pub data: TaskData,
}

/// Immutable per-task data.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskData {
    pub id: TaskId,
    pub batch_id: BatchId,
    /// 0-based row position in the unmodified input sheet. This is the
    /// stable alignment key for result assembly and is unique per batch.
    pub source_row_index: u32,
    pub inputs: InputMap,
    /// Attempt budget, resolved from the batch at creation
    pub max_attempts: u32,
}

// ============================================================================
// Task states
// ============================================================================

/// Task is waiting to be claimed by a dispatcher worker.
#[derive(Debug, Clone)]
pub struct Pending {
    /// Remote calls already dispatched for this task
    pub attempts: u32,
    /// Earliest claim time; set by retry backoff
    pub not_before: Option<DateTime<Utc>>,
}

impl TaskState for Pending {}

/// Task has been claimed and its remote call is (about to be) in flight.
#[derive(Debug, Clone)]
pub struct Running {
    pub worker_id: WorkerId,
    /// 1-based attempt number of the call this claim dispatches
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

impl TaskState for Running {}

/// Task completed successfully.
#[derive(Debug, Clone)]
pub struct Succeeded {
    /// Displayable result text extracted from the remote response
    pub output: String,
    pub external_run_id: Option<String>,
    pub elapsed_ms: u64,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TaskState for Succeeded {}

/// Task failed terminally.
#[derive(Debug, Clone)]
pub struct Failed {
    pub kind: TaskErrorKind,
    pub detail: String,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
}

impl TaskState for Failed {}

/// Task was cancelled along with its batch.
#[derive(Debug, Clone)]
pub struct Cancelled {
    pub cancelled_at: DateTime<Utc>,
}

impl TaskState for Cancelled {}

/// Fieldless discriminant for task states; used for store filters, counts
/// and persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStateKind {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStateKind {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStateKind::Succeeded | TaskStateKind::Failed | TaskStateKind::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStateKind::Pending => "pending",
            TaskStateKind::Running => "running",
            TaskStateKind::Succeeded => "succeeded",
            TaskStateKind::Failed => "failed",
            TaskStateKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStateKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStateKind::Pending),
            "running" => Ok(TaskStateKind::Running),
            "succeeded" => Ok(TaskStateKind::Succeeded),
            "failed" => Ok(TaskStateKind::Failed),
            "cancelled" => Ok(TaskStateKind::Cancelled),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

// ============================================================================
// Unified task representation
// ============================================================================

/// Enum that can hold a task in any state, for storage and read APIs.
#[derive(Debug, Clone)]
pub enum AnyTask {
    Pending(Task<Pending>),
    Running(Task<Running>),
    Succeeded(Task<Succeeded>),
    Failed(Task<Failed>),
    Cancelled(Task<Cancelled>),
}

impl AnyTask {
    pub fn id(&self) -> TaskId {
        self.data().id
    }

    pub fn data(&self) -> &TaskData {
        match self {
            AnyTask::Pending(t) => &t.data,
            AnyTask::Running(t) => &t.data,
            AnyTask::Succeeded(t) => &t.data,
            AnyTask::Failed(t) => &t.data,
            AnyTask::Cancelled(t) => &t.data,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.data().batch_id
    }

    pub fn source_row_index(&self) -> u32 {
        self.data().source_row_index
    }

    pub fn kind(&self) -> TaskStateKind {
        match self {
            AnyTask::Pending(_) => TaskStateKind::Pending,
            AnyTask::Running(_) => TaskStateKind::Running,
            AnyTask::Succeeded(_) => TaskStateKind::Succeeded,
            AnyTask::Failed(_) => TaskStateKind::Failed,
            AnyTask::Cancelled(_) => TaskStateKind::Cancelled,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }

    /// Remote calls dispatched so far.
    pub fn attempts(&self) -> u32 {
        match self {
            AnyTask::Pending(t) => t.state.attempts,
            AnyTask::Running(t) => t.state.attempt,
            AnyTask::Succeeded(t) => t.state.attempts,
            AnyTask::Failed(t) => t.state.attempts,
            AnyTask::Cancelled(_) => 0,
        }
    }

    pub fn as_pending(&self) -> Option<&Task<Pending>> {
        match self {
            AnyTask::Pending(t) => Some(t),
            _ => None,
        }
    }

    /// The text written into this task's `execution_result` cell, or `None`
    /// for tasks that have not reached a terminal state.
    ///
    /// Failed and cancelled tasks produce a diagnostic rather than a blank
    /// cell so misalignment stays visible to the operator.
    pub fn result_cell(&self) -> Option<String> {
        match self {
            AnyTask::Succeeded(t) => Some(t.state.output.clone()),
            AnyTask::Failed(t) => Some(format!("[error:{}] {}", t.state.kind, t.state.detail)),
            AnyTask::Cancelled(_) => Some("[error:cancelled] batch cancelled".to_string()),
            AnyTask::Pending(_) | AnyTask::Running(_) => None,
        }
    }
}

impl From<Task<Pending>> for AnyTask {
    fn from(t: Task<Pending>) -> Self {
        AnyTask::Pending(t)
    }
}

impl From<Task<Running>> for AnyTask {
    fn from(t: Task<Running>) -> Self {
        AnyTask::Running(t)
    }
}

impl From<Task<Succeeded>> for AnyTask {
    fn from(t: Task<Succeeded>) -> Self {
        AnyTask::Succeeded(t)
    }
}

impl From<Task<Failed>> for AnyTask {
    fn from(t: Task<Failed>) -> Self {
        AnyTask::Failed(t)
    }
}

impl From<Task<Cancelled>> for AnyTask {
    fn from(t: Task<Cancelled>) -> Self {
        AnyTask::Cancelled(t)
    }
}
