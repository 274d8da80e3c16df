//! Error types for the batch execution core.
//!
//! Two layers live here: [`VolleyError`], the crate-wide error enum returned
//! by every fallible operation, and [`TaskErrorKind`], the normative
//! taxonomy recorded on tasks that reach a failed terminal state.

use thiserror::Error;

use crate::batch::{BatchId, BatchState};
use crate::binding::{BindingId, RowError};
use crate::task::TaskId;

/// Result type for volley operations.
pub type Result<T> = std::result::Result<T, VolleyError>;

/// Errors that can occur in the batch execution core.
#[derive(Debug, Error)]
pub enum VolleyError {
    /// Database operation failed
    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// HTTP transport failure outside the per-task error taxonomy
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The input workbook could not be read or written
    #[error("workbook error: {0}")]
    Workbook(String),

    /// One or more sheet rows failed validation against the binding schema
    #[error("sheet validation failed for {} row(s)", .0.len())]
    Validation(Vec<RowError>),

    /// The workflow service rejected the supplied credential
    #[error("credentials rejected by the workflow service: {0}")]
    Auth(String),

    /// The workflow service could not be reached
    #[error("workflow service unreachable: {0}")]
    Unreachable(String),

    /// The workflow service answered with something we cannot interpret
    #[error("malformed workflow service response: {0}")]
    Protocol(String),

    /// Binding not found
    #[error("binding not found: {0}")]
    BindingNotFound(BindingId),

    /// Binding exists but is flagged inactive
    #[error("binding {0} is inactive")]
    BindingInactive(BindingId),

    /// Binding is referenced by a batch that has not reached a terminal state
    #[error("binding {0} is in use by a non-terminal batch")]
    BindingInUse(BindingId),

    /// Batch not found
    #[error("batch not found: {0}")]
    BatchNotFound(BatchId),

    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    /// A batch operation was attempted from a state that does not permit it
    #[error("batch {batch} cannot {action} from state {state}")]
    InvalidBatchState {
        batch: BatchId,
        state: BatchState,
        action: &'static str,
    },

    /// A task state write would violate the lifecycle (e.g. overwrite a
    /// terminal state)
    #[error("task {0} is in state {1}, expected {2}")]
    InvalidTaskState(TaskId, String, String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Task-level error taxonomy.
///
/// Every failed task records exactly one of these kinds. The retry decision
/// in the dispatcher is driven by [`TaskErrorKind::is_retryable`] alone; the
/// kind also ends up in the result spreadsheet as `[error:<kind>] <detail>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// Input row rejected at parse; surfaces at batch creation
    Validation,
    /// Connect/TLS/read error
    Transport,
    /// Per-call deadline exceeded
    Timeout,
    /// HTTP 5xx, 408 or 429
    Retryable,
    /// HTTP 4xx other than 408/429
    Permanent,
    /// HTTP 2xx with an application-level failed status
    Application,
    /// Malformed remote response
    Protocol,
    /// Batch cancelled while the task was pending or running
    Cancelled,
}

impl TaskErrorKind {
    /// Whether the dispatcher may re-enqueue a task that failed with this
    /// kind (subject to the attempt budget).
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            TaskErrorKind::Transport | TaskErrorKind::Timeout | TaskErrorKind::Retryable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskErrorKind::Validation => "validation",
            TaskErrorKind::Transport => "transport",
            TaskErrorKind::Timeout => "timeout",
            TaskErrorKind::Retryable => "retryable",
            TaskErrorKind::Permanent => "permanent",
            TaskErrorKind::Application => "application",
            TaskErrorKind::Protocol => "protocol",
            TaskErrorKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "validation" => Ok(TaskErrorKind::Validation),
            "transport" => Ok(TaskErrorKind::Transport),
            "timeout" => Ok(TaskErrorKind::Timeout),
            "retryable" => Ok(TaskErrorKind::Retryable),
            "permanent" => Ok(TaskErrorKind::Permanent),
            "application" => Ok(TaskErrorKind::Application),
            "protocol" => Ok(TaskErrorKind::Protocol),
            "cancelled" => Ok(TaskErrorKind::Cancelled),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_the_taxonomy() {
        assert!(TaskErrorKind::Transport.is_retryable());
        assert!(TaskErrorKind::Timeout.is_retryable());
        assert!(TaskErrorKind::Retryable.is_retryable());

        assert!(!TaskErrorKind::Validation.is_retryable());
        assert!(!TaskErrorKind::Permanent.is_retryable());
        assert!(!TaskErrorKind::Application.is_retryable());
        assert!(!TaskErrorKind::Protocol.is_retryable());
        assert!(!TaskErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            TaskErrorKind::Validation,
            TaskErrorKind::Transport,
            TaskErrorKind::Timeout,
            TaskErrorKind::Retryable,
            TaskErrorKind::Permanent,
            TaskErrorKind::Application,
            TaskErrorKind::Protocol,
            TaskErrorKind::Cancelled,
        ] {
            assert_eq!(kind.as_str().parse::<TaskErrorKind>().unwrap(), kind);
        }
    }
}
