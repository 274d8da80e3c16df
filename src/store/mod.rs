//! Storage trait for bindings, batches and tasks.
//!
//! The store provides the atomic operations the rest of the core builds on:
//! the FIFO `pending → running` claim, guarded batch-state transitions, and
//! task persistence that refuses to overwrite terminal states. The type
//! system handles the rest of the task lifecycle, so implementations do not
//! validate transitions beyond those rules.

use async_trait::async_trait;

use crate::batch::{Batch, BatchCounts, BatchId, BatchState};
use crate::binding::{BindingId, WorkflowBinding};
use crate::error::Result;
use crate::task::{AnyTask, Pending, Running, Task, TaskId, TaskState, TaskStateKind, WorkerId};

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(test)]
mod tests;

/// Durable storage for the batch execution core.
///
/// Writes are serialized per task id; every method that persists a state is
/// atomic, and callers emit progress events only after the corresponding
/// call returns.
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------

    /// Insert a new binding.
    ///
    /// # Errors
    /// - If a binding with the same ID already exists
    async fn insert_binding(&self, binding: WorkflowBinding) -> Result<()>;

    /// Replace an existing binding.
    async fn update_binding(&self, binding: WorkflowBinding) -> Result<()>;

    /// Delete a binding. The registry checks the in-use rule first.
    async fn remove_binding(&self, id: BindingId) -> Result<()>;

    async fn binding(&self, id: BindingId) -> Result<WorkflowBinding>;

    async fn bindings(&self) -> Result<Vec<WorkflowBinding>>;

    /// Whether any batch referencing this binding is in a non-terminal state.
    async fn binding_in_use(&self, id: BindingId) -> Result<bool>;

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Insert a batch, its original sheet bytes, and its materialized tasks
    /// in one atomic write.
    async fn insert_batch(
        &self,
        batch: Batch,
        sheet: Vec<u8>,
        tasks: Vec<Task<Pending>>,
    ) -> Result<()>;

    async fn batch(&self, id: BatchId) -> Result<Batch>;

    async fn batches(&self) -> Result<Vec<Batch>>;

    /// The original sheet bytes the batch was created from.
    async fn sheet(&self, id: BatchId) -> Result<Vec<u8>>;

    /// Atomically transition a batch's state.
    ///
    /// Fails with `InvalidBatchState` unless the current state is one of
    /// `from`. Maintains `started_at` (first transition into `Running`) and
    /// `finished_at` (transition into a terminal state).
    async fn transition_batch(
        &self,
        id: BatchId,
        from: &[BatchState],
        to: BatchState,
        action: &'static str,
    ) -> Result<Batch>;

    /// All batches currently in one of the given states.
    async fn batches_in_state(&self, states: &[BatchState]) -> Result<Vec<Batch>>;

    /// Aggregate per-state task counts for a batch.
    async fn counts(&self, id: BatchId) -> Result<BatchCounts>;

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Atomically claim the next eligible pending task of a batch.
    ///
    /// Eligible means `not_before` is unset or in the past. Tasks are
    /// claimed FIFO by `source_row_index`, and the claim transitions the
    /// task to `Running` with its attempt counter incremented before it is
    /// returned. `None` when nothing is eligible right now.
    async fn claim_next(&self, batch_id: BatchId, worker: WorkerId)
    -> Result<Option<Task<Running>>>;

    /// Persist a task's state.
    ///
    /// Terminal states are immutable: overwriting one fails with
    /// `InvalidTaskState`.
    async fn persist<T: TaskState + Clone>(&self, task: &Task<T>) -> Result<()>
    where
        AnyTask: From<Task<T>>;

    async fn task(&self, id: TaskId) -> Result<AnyTask>;

    /// Tasks of a batch ordered by `source_row_index`, optionally filtered
    /// by state.
    async fn tasks(&self, batch_id: BatchId, filter: Option<TaskStateKind>)
    -> Result<Vec<AnyTask>>;

    /// Move every pending task of a batch to `cancelled`, returning the
    /// tasks that were cancelled.
    async fn cancel_pending_tasks(&self, batch_id: BatchId) -> Result<Vec<AnyTask>>;

    /// Return every running task of a batch to `pending` for re-dispatch
    /// after a process restart. Attempt counters are preserved.
    async fn repend_running_tasks(&self, batch_id: BatchId) -> Result<u64>;
}
