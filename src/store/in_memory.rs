//! In-memory store implementation.
//!
//! Suitable for tests and single-process runs where durability across
//! restarts is not required. All state lives in concurrent maps; the write
//! lock makes each operation atomic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::batch::{Batch, BatchCounts, BatchId, BatchState};
use crate::binding::{BindingId, WorkflowBinding};
use crate::error::{Result, VolleyError};
use crate::task::{
    AnyTask, Cancelled, Pending, Running, Task, TaskId, TaskState, TaskStateKind, WorkerId,
};

use super::Store;

#[derive(Default)]
struct Inner {
    bindings: HashMap<BindingId, WorkflowBinding>,
    batches: HashMap<BatchId, Batch>,
    sheets: HashMap<BatchId, Vec<u8>>,
    tasks: HashMap<TaskId, AnyTask>,
    /// Task ids per batch, sorted by `source_row_index` at insert
    by_batch: HashMap<BatchId, Vec<TaskId>>,
}

/// In-memory implementation of the [`Store`] trait.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_binding(&self, binding: WorkflowBinding) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.bindings.contains_key(&binding.id) {
            return Err(VolleyError::Internal(anyhow::anyhow!(
                "binding {} already exists",
                binding.id
            )));
        }
        inner.bindings.insert(binding.id, binding);
        Ok(())
    }

    async fn update_binding(&self, binding: WorkflowBinding) -> Result<()> {
        let mut inner = self.inner.write();
        if !inner.bindings.contains_key(&binding.id) {
            return Err(VolleyError::BindingNotFound(binding.id));
        }
        inner.bindings.insert(binding.id, binding);
        Ok(())
    }

    async fn remove_binding(&self, id: BindingId) -> Result<()> {
        let mut inner = self.inner.write();
        inner
            .bindings
            .remove(&id)
            .map(|_| ())
            .ok_or(VolleyError::BindingNotFound(id))
    }

    async fn binding(&self, id: BindingId) -> Result<WorkflowBinding> {
        self.inner
            .read()
            .bindings
            .get(&id)
            .cloned()
            .ok_or(VolleyError::BindingNotFound(id))
    }

    async fn bindings(&self) -> Result<Vec<WorkflowBinding>> {
        let mut bindings: Vec<_> = self.inner.read().bindings.values().cloned().collect();
        bindings.sort_by_key(|b| b.created_at);
        Ok(bindings)
    }

    async fn binding_in_use(&self, id: BindingId) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .batches
            .values()
            .any(|b| b.binding_id == id && !b.state.is_terminal()))
    }

    async fn insert_batch(
        &self,
        batch: Batch,
        sheet: Vec<u8>,
        tasks: Vec<Task<Pending>>,
    ) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.batches.contains_key(&batch.id) {
            return Err(VolleyError::Internal(anyhow::anyhow!(
                "batch {} already exists",
                batch.id
            )));
        }

        let mut ids: Vec<(u32, TaskId)> = Vec::with_capacity(tasks.len());
        for task in tasks {
            ids.push((task.data.source_row_index, task.data.id));
            inner.tasks.insert(task.data.id, task.into());
        }
        ids.sort_by_key(|(row, _)| *row);

        inner
            .by_batch
            .insert(batch.id, ids.into_iter().map(|(_, id)| id).collect());
        inner.sheets.insert(batch.id, sheet);
        inner.batches.insert(batch.id, batch);
        Ok(())
    }

    async fn batch(&self, id: BatchId) -> Result<Batch> {
        self.inner
            .read()
            .batches
            .get(&id)
            .cloned()
            .ok_or(VolleyError::BatchNotFound(id))
    }

    async fn batches(&self) -> Result<Vec<Batch>> {
        let mut batches: Vec<_> = self.inner.read().batches.values().cloned().collect();
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }

    async fn sheet(&self, id: BatchId) -> Result<Vec<u8>> {
        self.inner
            .read()
            .sheets
            .get(&id)
            .cloned()
            .ok_or(VolleyError::BatchNotFound(id))
    }

    async fn transition_batch(
        &self,
        id: BatchId,
        from: &[BatchState],
        to: BatchState,
        action: &'static str,
    ) -> Result<Batch> {
        let mut inner = self.inner.write();
        let batch = inner
            .batches
            .get_mut(&id)
            .ok_or(VolleyError::BatchNotFound(id))?;

        if !from.contains(&batch.state) {
            return Err(VolleyError::InvalidBatchState {
                batch: id,
                state: batch.state,
                action,
            });
        }

        batch.state = to;
        let now = Utc::now();
        if to == BatchState::Running && batch.started_at.is_none() {
            batch.started_at = Some(now);
        }
        if to.is_terminal() {
            batch.finished_at = Some(now);
        }
        Ok(batch.clone())
    }

    async fn batches_in_state(&self, states: &[BatchState]) -> Result<Vec<Batch>> {
        let mut batches: Vec<_> = self
            .inner
            .read()
            .batches
            .values()
            .filter(|b| states.contains(&b.state))
            .cloned()
            .collect();
        batches.sort_by_key(|b| b.created_at);
        Ok(batches)
    }

    async fn counts(&self, id: BatchId) -> Result<BatchCounts> {
        let inner = self.inner.read();
        let ids = inner
            .by_batch
            .get(&id)
            .ok_or(VolleyError::BatchNotFound(id))?;

        let mut counts = BatchCounts::default();
        for task_id in ids {
            let Some(task) = inner.tasks.get(task_id) else {
                continue;
            };
            counts.total += 1;
            match task.kind() {
                TaskStateKind::Pending => counts.pending += 1,
                TaskStateKind::Running => counts.running += 1,
                TaskStateKind::Succeeded => counts.succeeded += 1,
                TaskStateKind::Failed => counts.failed += 1,
                TaskStateKind::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn claim_next(
        &self,
        batch_id: BatchId,
        worker: WorkerId,
    ) -> Result<Option<Task<Running>>> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let Some(ids) = inner.by_batch.get(&batch_id) else {
            return Err(VolleyError::BatchNotFound(batch_id));
        };

        // Ids are kept in source_row_index order, so the first eligible
        // pending task is the FIFO head.
        let claimed = ids.iter().find_map(|task_id| {
            let task = inner.tasks.get(task_id)?;
            let pending = task.as_pending()?;
            let eligible = pending.state.not_before.is_none_or(|t| t <= now);
            eligible.then(|| Task {
                state: Running {
                    worker_id: worker,
                    attempt: pending.state.attempts + 1,
                    started_at: now,
                },
                data: pending.data.clone(),
            })
        });

        if let Some(running) = &claimed {
            inner
                .tasks
                .insert(running.data.id, AnyTask::Running(running.clone()));
        }
        Ok(claimed)
    }

    async fn persist<T: TaskState + Clone>(&self, task: &Task<T>) -> Result<()>
    where
        AnyTask: From<Task<T>>,
    {
        let mut inner = self.inner.write();
        let id = task.data.id;

        let Some(existing) = inner.tasks.get_mut(&id) else {
            return Err(VolleyError::TaskNotFound(id));
        };

        // Terminal task states are immutable.
        if existing.is_terminal() {
            return Err(VolleyError::InvalidTaskState(
                id,
                existing.kind().to_string(),
                "non-terminal state".to_string(),
            ));
        }

        *existing = task.clone().into();
        Ok(())
    }

    async fn task(&self, id: TaskId) -> Result<AnyTask> {
        self.inner
            .read()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(VolleyError::TaskNotFound(id))
    }

    async fn tasks(
        &self,
        batch_id: BatchId,
        filter: Option<TaskStateKind>,
    ) -> Result<Vec<AnyTask>> {
        let inner = self.inner.read();
        let ids = inner
            .by_batch
            .get(&batch_id)
            .ok_or(VolleyError::BatchNotFound(batch_id))?;

        Ok(ids
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|task| filter.is_none_or(|f| task.kind() == f))
            .cloned()
            .collect())
    }

    async fn cancel_pending_tasks(&self, batch_id: BatchId) -> Result<Vec<AnyTask>> {
        let mut inner = self.inner.write();
        let now = Utc::now();

        let Some(ids) = inner.by_batch.get(&batch_id).cloned() else {
            return Err(VolleyError::BatchNotFound(batch_id));
        };

        let mut cancelled = Vec::new();
        for id in ids {
            let Some(task) = inner.tasks.get_mut(&id) else {
                continue;
            };
            if let Some(pending) = task.as_pending() {
                let next = AnyTask::Cancelled(Task {
                    state: Cancelled { cancelled_at: now },
                    data: pending.data.clone(),
                });
                *task = next.clone();
                cancelled.push(next);
            }
        }
        Ok(cancelled)
    }

    async fn repend_running_tasks(&self, batch_id: BatchId) -> Result<u64> {
        let mut inner = self.inner.write();

        let Some(ids) = inner.by_batch.get(&batch_id).cloned() else {
            return Err(VolleyError::BatchNotFound(batch_id));
        };

        let mut repended = 0;
        for id in ids {
            let Some(task) = inner.tasks.get_mut(&id) else {
                continue;
            };
            if let AnyTask::Running(running) = task {
                // The interrupted call stays counted (the remote may have
                // run it), capped so the re-dispatch still fits the budget.
                let cap = running.data.max_attempts.saturating_sub(1);
                *task = AnyTask::Pending(Task {
                    state: Pending {
                        attempts: running.state.attempt.min(cap),
                        not_before: None,
                    },
                    data: running.data.clone(),
                });
                repended += 1;
            }
        }
        Ok(repended)
    }
}
