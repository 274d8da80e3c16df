//! The per-batch dispatcher: a bounded pool of workers draining pending
//! tasks.
//!
//! Workers claim tasks FIFO by source row, run each remote call on a fresh
//! client instance, and apply the retry table. The dispatcher is the single
//! writer of task transitions out of `running`; it never writes batch state,
//! it only reads it to decide whether to keep claiming.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchId, BatchState};
use crate::binding::WorkflowBinding;
use crate::client::{RunStatus, WorkflowClient, extract_output};
use crate::config::{RetryPolicy, RunnerConfig};
use crate::error::{Result, TaskErrorKind};
use crate::events::{BatchEvent, EventBus};
use crate::store::Store;
use crate::task::{Running, Task};

/// Why the dispatcher's claim loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    /// No pending or running tasks remain; the coordinator may complete the
    /// batch.
    Drained,
    /// The batch was paused; in-flight tasks have run to a terminal state
    /// and the rest stay pending.
    Paused,
}

pub(crate) struct Dispatcher<S, C> {
    pub batch_id: BatchId,
    pub store: Arc<S>,
    pub client: C,
    pub events: EventBus,
    pub config: RunnerConfig,
    pub cancel: CancellationToken,
    /// Process-wide ceiling shared across all batches
    pub global_permits: Arc<Semaphore>,
    /// Set after every task transition; drives the debounced progress tick
    pub progress_dirty: Arc<AtomicBool>,
}

impl<S, C> Dispatcher<S, C>
where
    S: Store + 'static,
    C: WorkflowClient,
{
    /// Run the claim loop until the batch pauses or drains.
    #[tracing::instrument(skip(self), fields(batch_id = %self.batch_id))]
    pub(crate) async fn run(self) -> Result<DispatchOutcome> {
        let batch = self.store.batch(self.batch_id).await?;
        let binding = Arc::new(self.store.binding(batch.binding_id).await?);
        let retry = RetryPolicy {
            max_attempts: batch.max_attempts,
            ..self.config.retry
        };
        let limit = batch
            .concurrency_limit
            .clamp(1, self.config.max_concurrent_tasks.max(1));
        let semaphore = Arc::new(Semaphore::new(limit));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let mut workers: JoinSet<Result<()>> = JoinSet::new();

        tracing::info!(concurrency = limit, "dispatcher starting");

        let outcome = loop {
            // Reap finished workers (non-blocking).
            while let Some(joined) = workers.try_join_next() {
                log_worker_result(self.batch_id, joined);
            }

            match self.store.batch(self.batch_id).await?.state {
                BatchState::Running => {}
                BatchState::Paused => {
                    // Pause is advisory: stop claiming, let in-flight calls
                    // run to a terminal state.
                    self.drain(&mut workers).await;
                    break DispatchOutcome::Paused;
                }
                BatchState::Cancelling => {
                    self.cancel.cancel();
                    self.cancel_pending().await?;
                    self.drain(&mut workers).await;
                    // A worker may have rescheduled its task between the
                    // sweep and the drain; sweep again so nothing survives.
                    self.cancel_pending().await?;
                    break DispatchOutcome::Drained;
                }
                state => {
                    tracing::warn!(%state, "dispatcher running against a settled batch");
                    self.drain(&mut workers).await;
                    break DispatchOutcome::Drained;
                }
            }

            // Per-batch capacity first; when full, wait for a worker instead
            // of spinning.
            let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                if let Some(joined) = workers.join_next().await {
                    log_worker_result(self.batch_id, joined);
                }
                continue;
            };

            // Then the process-wide ceiling. Bounded wait so pause/cancel
            // stay responsive even when other batches hold every permit.
            let global = tokio::select! {
                acquired = self.global_permits.clone().acquire_owned() => match acquired {
                    Ok(p) => p,
                    Err(_) => break DispatchOutcome::Drained,
                },
                _ = tokio::time::sleep(self.config.claim_interval()) => {
                    continue;
                }
            };

            let worker_id = uuid::Uuid::new_v4();
            match self.store.claim_next(self.batch_id, worker_id).await? {
                Some(task) => {
                    self.events.emit(BatchEvent::TaskStarted {
                        batch_id: self.batch_id,
                        task_id: task.data.id,
                        source_row_index: task.data.source_row_index,
                        attempt: task.state.attempt,
                    });

                    in_flight.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        task_id = %task.data.id,
                        source_row_index = task.data.source_row_index,
                        attempt = task.state.attempt,
                        in_flight = in_flight.load(Ordering::Relaxed),
                        "claimed task"
                    );

                    let worker = Worker {
                        batch_id: self.batch_id,
                        store: self.store.clone(),
                        client: self.client.clone(),
                        events: self.events.clone(),
                        binding: binding.clone(),
                        retry,
                        timeout: self.config.request_timeout(),
                        cancel: self.cancel.clone(),
                        progress_dirty: self.progress_dirty.clone(),
                    };
                    let counter = in_flight.clone();
                    workers.spawn(async move {
                        // Both permits are held for the lifetime of the call.
                        let _permit = permit;
                        let _global = global;
                        let _guard = scopeguard::guard((), move |_| {
                            counter.fetch_sub(1, Ordering::Relaxed);
                        });
                        worker.run_task(task).await
                    });
                }
                None => {
                    drop(permit);
                    drop(global);
                    let counts = self.store.counts(self.batch_id).await?;
                    if counts.outstanding() == 0 && workers.is_empty() {
                        break DispatchOutcome::Drained;
                    }
                    // Nothing eligible right now: tasks are backing off or
                    // still in flight.
                    tokio::time::sleep(self.config.claim_interval()).await;
                }
            }
        };

        tracing::info!(?outcome, "dispatcher finished");
        Ok(outcome)
    }

    async fn drain(&self, workers: &mut JoinSet<Result<()>>) {
        while let Some(joined) = workers.join_next().await {
            log_worker_result(self.batch_id, joined);
        }
    }

    /// Sweep every pending task of the batch to `cancelled`.
    async fn cancel_pending(&self) -> Result<()> {
        let cancelled = self.store.cancel_pending_tasks(self.batch_id).await?;
        if cancelled.is_empty() {
            return Ok(());
        }
        tracing::info!(count = cancelled.len(), "cancelled pending tasks");
        for task in &cancelled {
            self.events.emit(BatchEvent::TaskFailed {
                batch_id: self.batch_id,
                task_id: task.id(),
                source_row_index: task.source_row_index(),
                kind: TaskErrorKind::Cancelled,
                detail: "batch cancelled".to_string(),
            });
        }
        self.progress_dirty.store(true, Ordering::Relaxed);
        Ok(())
    }
}

fn log_worker_result(
    batch_id: BatchId,
    joined: std::result::Result<Result<()>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(%batch_id, error = %e, "worker failed"),
        Err(join_error) => tracing::error!(%batch_id, error = %join_error, "worker panicked"),
    }
}

/// Everything one worker needs to take a claimed task to a terminal state.
struct Worker<S, C> {
    batch_id: BatchId,
    store: Arc<S>,
    client: C,
    events: EventBus,
    binding: Arc<WorkflowBinding>,
    retry: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
    progress_dirty: Arc<AtomicBool>,
}

impl<S, C> Worker<S, C>
where
    S: Store,
    C: WorkflowClient,
{
    async fn run_task(&self, task: Task<Running>) -> Result<()> {
        let task_id = task.data.id;
        let source_row_index = task.data.source_row_index;
        let attempt = task.state.attempt;
        let max_attempts = task.data.max_attempts;

        // The call future owns its fresh client; dropping it on cancellation
        // closes that call's connection and nobody else's.
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            result = self.client.run(&self.binding, &task.data.inputs, self.timeout) => Some(result),
        };

        match outcome {
            None => {
                task.cancel(self.store.as_ref()).await?;
                self.emit_failed(task_id, source_row_index, TaskErrorKind::Cancelled, "batch cancelled");
            }
            Some(Ok(run)) if run.status == RunStatus::Succeeded => {
                let output = extract_output(&run.outputs);
                task.succeed(output.clone(), run.external_run_id, run.elapsed_ms, self.store.as_ref())
                    .await?;
                tracing::debug!(%task_id, source_row_index, "task succeeded");
                self.events.emit(BatchEvent::TaskSucceeded {
                    batch_id: self.batch_id,
                    task_id,
                    source_row_index,
                    output,
                });
            }
            Some(Ok(run)) => {
                // 2xx with an application-level failure: terminal, no retry.
                let detail = run
                    .error_detail
                    .unwrap_or_else(|| "workflow reported failure".to_string());
                task.fail(TaskErrorKind::Application, detail.clone(), self.store.as_ref())
                    .await?;
                self.emit_failed(task_id, source_row_index, TaskErrorKind::Application, &detail);
            }
            Some(Err(err)) => {
                if self.cancel.is_cancelled() {
                    // The deadline fired as part of cancellation; the
                    // outcome is discarded.
                    task.cancel(self.store.as_ref()).await?;
                    self.emit_failed(
                        task_id,
                        source_row_index,
                        TaskErrorKind::Cancelled,
                        "batch cancelled",
                    );
                } else if err.kind.is_retryable() && attempt < max_attempts {
                    let delay_ms = jittered(self.retry.backoff_ms(attempt));
                    let not_before = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
                    tracing::warn!(
                        %task_id,
                        source_row_index,
                        attempt,
                        kind = %err.kind,
                        delay_ms,
                        "task failed, queued for retry"
                    );
                    task.reschedule(not_before, self.store.as_ref()).await?;
                } else {
                    tracing::warn!(
                        %task_id,
                        source_row_index,
                        attempt,
                        kind = %err.kind,
                        "task failed terminally"
                    );
                    task.fail(err.kind, err.detail.clone(), self.store.as_ref())
                        .await?;
                    self.emit_failed(task_id, source_row_index, err.kind, &err.detail);
                }
            }
        }

        self.progress_dirty.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn emit_failed(
        &self,
        task_id: crate::task::TaskId,
        source_row_index: u32,
        kind: TaskErrorKind,
        detail: &str,
    ) {
        self.events.emit(BatchEvent::TaskFailed {
            batch_id: self.batch_id,
            task_id,
            source_row_index,
            kind,
            detail: detail.to_string(),
        });
    }
}

/// Apply ±25% jitter to a backoff delay.
fn jittered(ms: u64) -> u64 {
    let factor = rand::rng().random_range(0.75..=1.25);
    (ms as f64 * factor) as u64
}
