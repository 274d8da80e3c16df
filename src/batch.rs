//! Batch types and the batch state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::binding::BindingId;

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        BatchId(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for BatchId {
    fn from(uuid: Uuid) -> Self {
        BatchId(uuid)
    }
}

impl std::ops::Deref for BatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Lifecycle state of a batch.
///
/// ```text
/// created → running → { paused ↔ running } → completed
///                                           → failed
/// running|paused → cancelling → completed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Created,
    Running,
    Paused,
    Cancelling,
    Completed,
    Failed,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchState::Completed | BatchState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchState::Created => "created",
            BatchState::Running => "running",
            BatchState::Paused => "paused",
            BatchState::Cancelling => "cancelling",
            BatchState::Completed => "completed",
            BatchState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(BatchState::Created),
            "running" => Ok(BatchState::Running),
            "paused" => Ok(BatchState::Paused),
            "cancelling" => Ok(BatchState::Cancelling),
            "completed" => Ok(BatchState::Completed),
            "failed" => Ok(BatchState::Failed),
            other => Err(format!("unknown batch state: {other}")),
        }
    }
}

/// Per-state task counts of a batch, computed from the task store.
///
/// `cancelled` is carried alongside the other counters so the aggregate
/// always sums to `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: u64,
    pub pending: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl BatchCounts {
    /// Tasks that still need dispatcher attention.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.running
    }

    /// All tasks have reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.outstanding() == 0
    }
}

/// A batch of tasks produced from one input sheet against one binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub binding_id: BindingId,
    /// Caller-supplied reference to the uploaded file (display only)
    pub source_file_ref: String,
    pub created_at: DateTime<Utc>,
    pub state: BatchState,
    pub concurrency_limit: usize,
    pub max_attempts: u32,
    /// Template expression applied by an outer rendering layer; stored and
    /// passed through untouched
    pub result_template: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Status snapshot returned by `get_batch`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSnapshot {
    pub id: BatchId,
    pub state: BatchState,
    pub counts: BatchCounts,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}
