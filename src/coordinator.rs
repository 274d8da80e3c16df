//! The batch coordinator.
//!
//! Owns every batch-state transition (the dispatcher only reads batch
//! state), supervises one dispatcher per running batch, completes batches
//! when they drain, emits the debounced progress tick, and re-materializes
//! running batches after a process restart.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::batch::{BatchId, BatchState};
use crate::client::WorkflowClient;
use crate::config::RunnerConfig;
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::error::{Result, VolleyError};
use crate::events::{BatchEvent, EventBus};
use crate::store::Store;

pub struct Coordinator<S, C> {
    store: Arc<S>,
    client: C,
    config: RunnerConfig,
    events: EventBus,
    /// Process-wide in-flight ceiling, shared by every dispatcher
    global_permits: Arc<Semaphore>,
    /// Cancellation token per live dispatcher
    active: Arc<DashMap<BatchId, CancellationToken>>,
}

impl<S, C> Coordinator<S, C>
where
    S: Store + 'static,
    C: WorkflowClient,
{
    pub fn new(store: Arc<S>, client: C, config: RunnerConfig, events: EventBus) -> Self {
        let global_permits = Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1)));
        Self {
            store,
            client,
            config,
            events,
            global_permits,
            active: Arc::new(DashMap::new()),
        }
    }

    /// `created|paused → running`. Starting a batch that is already running
    /// is a no-op.
    pub async fn start(&self, id: BatchId) -> Result<()> {
        let batch = self.store.batch(id).await?;
        match batch.state {
            BatchState::Running => {
                self.spawn_dispatcher(id);
                return Ok(());
            }
            BatchState::Created | BatchState::Paused => {}
            state => {
                return Err(VolleyError::InvalidBatchState {
                    batch: id,
                    state,
                    action: "start",
                });
            }
        }

        let batch = self
            .store
            .transition_batch(
                id,
                &[BatchState::Created, BatchState::Paused],
                BatchState::Running,
                "start",
            )
            .await?;
        self.events.emit(BatchEvent::BatchStateChanged {
            batch_id: id,
            state: batch.state,
        });
        self.spawn_dispatcher(id);
        Ok(())
    }

    /// `running → paused`. In-flight tasks run to a terminal state; no new
    /// tasks are claimed. Pausing a paused batch is a no-op.
    pub async fn pause(&self, id: BatchId) -> Result<()> {
        let batch = self.store.batch(id).await?;
        match batch.state {
            BatchState::Paused => return Ok(()),
            BatchState::Running => {}
            state => {
                return Err(VolleyError::InvalidBatchState {
                    batch: id,
                    state,
                    action: "pause",
                });
            }
        }

        let batch = self
            .store
            .transition_batch(id, &[BatchState::Running], BatchState::Paused, "pause")
            .await?;
        self.events.emit(BatchEvent::BatchStateChanged {
            batch_id: id,
            state: batch.state,
        });
        Ok(())
    }

    /// `paused → running`. Resuming a running batch is a no-op.
    pub async fn resume(&self, id: BatchId) -> Result<()> {
        let batch = self.store.batch(id).await?;
        match batch.state {
            BatchState::Running => {
                self.spawn_dispatcher(id);
                return Ok(());
            }
            BatchState::Paused => {}
            state => {
                return Err(VolleyError::InvalidBatchState {
                    batch: id,
                    state,
                    action: "resume",
                });
            }
        }

        let batch = self
            .store
            .transition_batch(id, &[BatchState::Paused], BatchState::Running, "resume")
            .await?;
        self.events.emit(BatchEvent::BatchStateChanged {
            batch_id: id,
            state: batch.state,
        });
        self.spawn_dispatcher(id);
        Ok(())
    }

    /// Any non-terminal state → `cancelling`. Cancelling a batch that has
    /// already settled is a no-op.
    pub async fn cancel(&self, id: BatchId) -> Result<()> {
        let batch = self.store.batch(id).await?;
        if batch.state.is_terminal() || batch.state == BatchState::Cancelling {
            return Ok(());
        }

        let transitioned = self
            .store
            .transition_batch(
                id,
                &[BatchState::Created, BatchState::Running, BatchState::Paused],
                BatchState::Cancelling,
                "cancel",
            )
            .await;
        match transitioned {
            Ok(batch) => {
                self.events.emit(BatchEvent::BatchStateChanged {
                    batch_id: id,
                    state: batch.state,
                });
            }
            Err(VolleyError::InvalidBatchState { .. }) => {
                // Lost the race against completion; cancel stays a no-op.
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        // Abort in-flight calls promptly and make sure a dispatcher is
        // driving the batch to completion (a paused or created batch has
        // none).
        if let Some(entry) = self.active.get(&id) {
            entry.value().cancel();
        }
        self.spawn_dispatcher(id);
        Ok(())
    }

    /// Re-materialize batches after a process restart: orphaned `running`
    /// tasks go back to `pending`, and batches that were running or
    /// cancelling get their dispatcher back.
    pub async fn recover(&self) -> Result<usize> {
        let batches = self
            .store
            .batches_in_state(&[
                BatchState::Running,
                BatchState::Paused,
                BatchState::Cancelling,
            ])
            .await?;

        let mut resumed = 0;
        for batch in batches {
            let repended = self.store.repend_running_tasks(batch.id).await?;
            if repended > 0 {
                tracing::info!(
                    batch_id = %batch.id,
                    repended,
                    "returned orphaned running tasks to pending"
                );
            }
            if matches!(batch.state, BatchState::Running | BatchState::Cancelling) {
                self.spawn_dispatcher(batch.id);
                resumed += 1;
            }
        }
        Ok(resumed)
    }

    /// Spawn the dispatcher + supervisor pair for a batch, unless one is
    /// already live.
    fn spawn_dispatcher(&self, id: BatchId) {
        let token = CancellationToken::new();
        match self.active.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(token.clone());
            }
        }

        let progress_dirty = Arc::new(AtomicBool::new(false));
        let ticker_stop = CancellationToken::new();
        tokio::spawn(progress_ticker(
            self.store.clone(),
            self.events.clone(),
            id,
            progress_dirty.clone(),
            self.config.progress_tick(),
            ticker_stop.clone(),
        ));

        let supervisor = Supervisor {
            batch_id: id,
            store: self.store.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            cancel: token,
            global_permits: self.global_permits.clone(),
            progress_dirty,
            active: self.active.clone(),
            ticker_stop,
        };
        tokio::spawn(supervisor.run());
    }
}

/// Drives one batch's dispatcher to its conclusion and applies the
/// resulting batch-state transition.
struct Supervisor<S, C> {
    batch_id: BatchId,
    store: Arc<S>,
    client: C,
    config: RunnerConfig,
    events: EventBus,
    cancel: CancellationToken,
    global_permits: Arc<Semaphore>,
    progress_dirty: Arc<AtomicBool>,
    active: Arc<DashMap<BatchId, CancellationToken>>,
    ticker_stop: CancellationToken,
}

impl<S, C> Supervisor<S, C>
where
    S: Store + 'static,
    C: WorkflowClient,
{
    async fn run(self) {
        let id = self.batch_id;
        loop {
            let dispatcher = Dispatcher {
                batch_id: id,
                store: self.store.clone(),
                client: self.client.clone(),
                events: self.events.clone(),
                config: self.config.clone(),
                cancel: self.cancel.clone(),
                global_permits: self.global_permits.clone(),
                progress_dirty: self.progress_dirty.clone(),
            };

            match dispatcher.run().await {
                Ok(DispatchOutcome::Paused) => {
                    // A resume that lands while the dispatcher is draining
                    // its in-flight tasks must not leave the batch stalled.
                    match self.store.batch(id).await {
                        Ok(batch) if batch.state == BatchState::Running => continue,
                        _ => {}
                    }
                }
                Ok(DispatchOutcome::Drained) => {
                    self.complete().await;
                }
                Err(e) => {
                    tracing::error!(batch_id = %id, error = %e, "dispatcher failed");
                    self.fail().await;
                }
            }

            // Deregister, then close the race where a resume landed between
            // the state read above and this removal: a batch left running
            // needs a dispatcher, so take the registration back and go
            // around again.
            self.active.remove(&id);
            match self.store.batch(id).await {
                Ok(batch)
                    if matches!(batch.state, BatchState::Running | BatchState::Cancelling) =>
                {
                    match self.active.entry(id) {
                        dashmap::mapref::entry::Entry::Vacant(vacant) => {
                            vacant.insert(self.cancel.clone());
                            continue;
                        }
                        // Someone else already spawned a dispatcher.
                        dashmap::mapref::entry::Entry::Occupied(_) => break,
                    }
                }
                _ => break,
            }
        }

        self.ticker_stop.cancel();
    }

    async fn complete(&self) {
        let id = self.batch_id;
        match self
            .store
            .transition_batch(
                id,
                &[BatchState::Running, BatchState::Cancelling],
                BatchState::Completed,
                "complete",
            )
            .await
        {
            Ok(batch) => {
                tracing::info!(batch_id = %id, "batch completed");
                self.events.emit(BatchEvent::BatchStateChanged {
                    batch_id: id,
                    state: batch.state,
                });
                // Final counts so subscribers see the settled picture even
                // if the last tick already fired.
                if let Ok(counts) = self.store.counts(id).await {
                    self.events
                        .emit(BatchEvent::BatchProgress { batch_id: id, counts });
                }
            }
            Err(VolleyError::InvalidBatchState { state, .. }) => {
                tracing::debug!(batch_id = %id, %state, "drained batch settled elsewhere");
            }
            Err(e) => {
                tracing::error!(batch_id = %id, error = %e, "failed to complete batch");
            }
        }
    }

    /// Unrecoverable coordinator error: park the batch in `failed`.
    async fn fail(&self) {
        let id = self.batch_id;
        let result = self
            .store
            .transition_batch(
                id,
                &[
                    BatchState::Created,
                    BatchState::Running,
                    BatchState::Paused,
                    BatchState::Cancelling,
                ],
                BatchState::Failed,
                "fail",
            )
            .await;
        match result {
            Ok(batch) => {
                self.events.emit(BatchEvent::BatchStateChanged {
                    batch_id: id,
                    state: batch.state,
                });
            }
            Err(e) => {
                tracing::error!(batch_id = %id, error = %e, "failed to mark batch failed");
            }
        }
    }
}

/// Emit at most one `batch_progress` per tick, and only when something
/// changed since the last one.
async fn progress_ticker<S: Store>(
    store: Arc<S>,
    events: EventBus,
    batch_id: BatchId,
    dirty: Arc<AtomicBool>,
    tick: Duration,
    stop: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = interval.tick() => {
                if dirty.swap(false, Ordering::Relaxed) {
                    match store.counts(batch_id).await {
                        Ok(counts) => {
                            events.emit(BatchEvent::BatchProgress { batch_id, counts });
                        }
                        Err(e) => {
                            tracing::warn!(%batch_id, error = %e, "progress tick failed");
                        }
                    }
                }
            }
        }
    }
}
