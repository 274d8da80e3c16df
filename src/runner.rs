//! The top-level entry point: everything the admin layer calls.
//!
//! `BatchRunner` composes the registry, the sheet parser/assembler, the
//! store and the coordinator behind the inbound operations of the core:
//! binding CRUD, batch creation from sheet bytes, lifecycle control, status
//! reads, the progress subscription, and result download.

use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::Stream;

use crate::batch::{Batch, BatchId, BatchSnapshot, BatchState};
use crate::binding::{BindingId, BindingUpdate, WorkflowBinding};
use crate::client::WorkflowClient;
use crate::config::RunnerConfig;
use crate::coordinator::Coordinator;
use crate::error::{Result, VolleyError};
use crate::events::{BatchEvent, EventBus};
use crate::registry::WorkflowRegistry;
use crate::sheet;
use crate::store::Store;
use crate::task::{AnyTask, Pending, Task, TaskData, TaskId, TaskStateKind};

/// Per-batch overrides accepted at creation time.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    pub concurrency: Option<usize>,
    pub max_attempts: Option<u32>,
    /// Template expression applied by an outer rendering layer; stored and
    /// passed through untouched
    pub result_template: Option<String>,
    /// Display name of the uploaded file
    pub source_file_ref: Option<String>,
}

/// The batch execution core, assembled.
///
/// Generic over the store backend and the workflow client so tests can swap
/// either side out, exactly like the daemon managers it is modeled on.
pub struct BatchRunner<S, C> {
    store: Arc<S>,
    config: RunnerConfig,
    events: EventBus,
    registry: WorkflowRegistry<S, C>,
    coordinator: Coordinator<S, C>,
}

impl<S, C> BatchRunner<S, C>
where
    S: Store + 'static,
    C: WorkflowClient,
{
    /// Create a runner with the default configuration.
    pub fn new(store: Arc<S>, client: C) -> Self {
        Self::with_config(store, client, RunnerConfig::default())
    }

    pub fn with_config(store: Arc<S>, client: C, config: RunnerConfig) -> Self {
        let events = EventBus::default();
        let registry =
            WorkflowRegistry::new(store.clone(), client.clone(), config.request_timeout());
        let coordinator =
            Coordinator::new(store.clone(), client, config.clone(), events.clone());
        Self {
            store,
            config,
            events,
            registry,
            coordinator,
        }
    }

    // ------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------

    pub async fn create_binding(
        &self,
        name: String,
        description: Option<String>,
        base_url: String,
        credential: String,
    ) -> Result<WorkflowBinding> {
        self.registry
            .create(name, description, base_url, credential)
            .await
    }

    pub async fn sync_binding(&self, id: BindingId) -> Result<WorkflowBinding> {
        self.registry.sync(id).await
    }

    pub async fn update_binding(
        &self,
        id: BindingId,
        update: BindingUpdate,
    ) -> Result<WorkflowBinding> {
        self.registry.update(id, update).await
    }

    pub async fn delete_binding(&self, id: BindingId) -> Result<()> {
        self.registry.delete(id).await
    }

    pub async fn get_binding(&self, id: BindingId) -> Result<WorkflowBinding> {
        self.registry.get(id).await
    }

    pub async fn list_bindings(&self) -> Result<Vec<WorkflowBinding>> {
        self.registry.list().await
    }

    // ------------------------------------------------------------------
    // Batches
    // ------------------------------------------------------------------

    /// Parse and validate an input sheet, materialize its tasks, and store
    /// the batch in `created` state.
    ///
    /// Every data row is validated against the binding's cached schema; any
    /// failure rejects the whole batch with the offending row indices and
    /// fields.
    #[tracing::instrument(skip(self, sheet_bytes, options))]
    pub async fn create_batch(
        &self,
        binding_id: BindingId,
        sheet_bytes: Vec<u8>,
        options: BatchOptions,
    ) -> Result<BatchId> {
        let binding = self.store.binding(binding_id).await?;
        if !binding.active {
            return Err(VolleyError::BindingInactive(binding_id));
        }
        let schema = binding
            .schema
            .ok_or_else(|| VolleyError::Protocol("binding has no cached schema".to_string()))?;

        let grid = sheet::read_grid(&sheet_bytes)?;
        let parsed = sheet::parse_rows(&grid, &schema)?;
        let errors = sheet::validate_rows(&parsed, &schema);
        if !errors.is_empty() {
            return Err(VolleyError::Validation(errors));
        }
        if parsed.rows.is_empty() {
            return Err(VolleyError::Workbook(
                "sheet contains no data rows".to_string(),
            ));
        }

        let concurrency = options
            .concurrency
            .unwrap_or(self.config.default_concurrency)
            .clamp(1, self.config.max_concurrent_tasks.max(1));
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.retry.max_attempts)
            .max(1);

        let batch = Batch {
            id: BatchId::new(),
            binding_id,
            source_file_ref: options
                .source_file_ref
                .unwrap_or_else(|| "batch_data.xlsx".to_string()),
            created_at: Utc::now(),
            state: BatchState::Created,
            concurrency_limit: concurrency,
            max_attempts,
            result_template: options.result_template,
            started_at: None,
            finished_at: None,
        };

        let tasks: Vec<Task<Pending>> = parsed
            .rows
            .into_iter()
            .map(|row| Task {
                state: Pending {
                    attempts: 0,
                    not_before: None,
                },
                data: TaskData {
                    id: TaskId::new(),
                    batch_id: batch.id,
                    source_row_index: row.source_row_index,
                    inputs: row.inputs,
                    max_attempts,
                },
            })
            .collect();

        let batch_id = batch.id;
        let rows = tasks.len();
        self.store.insert_batch(batch, sheet_bytes, tasks).await?;
        tracing::info!(%batch_id, rows, concurrency, "batch created");
        Ok(batch_id)
    }

    pub async fn start_batch(&self, id: BatchId) -> Result<()> {
        self.coordinator.start(id).await
    }

    pub async fn pause_batch(&self, id: BatchId) -> Result<()> {
        self.coordinator.pause(id).await
    }

    pub async fn resume_batch(&self, id: BatchId) -> Result<()> {
        self.coordinator.resume(id).await
    }

    pub async fn cancel_batch(&self, id: BatchId) -> Result<()> {
        self.coordinator.cancel(id).await
    }

    /// Status snapshot: state, counts, timestamps.
    pub async fn get_batch(&self, id: BatchId) -> Result<BatchSnapshot> {
        let batch = self.store.batch(id).await?;
        let counts = self.store.counts(id).await?;
        Ok(BatchSnapshot {
            id,
            state: batch.state,
            counts,
            created_at: batch.created_at,
            started_at: batch.started_at,
            finished_at: batch.finished_at,
        })
    }

    pub async fn list_batches(&self) -> Result<Vec<Batch>> {
        self.store.batches().await
    }

    pub async fn list_tasks(
        &self,
        batch_id: BatchId,
        filter: Option<TaskStateKind>,
    ) -> Result<Vec<AnyTask>> {
        self.store.tasks(batch_id, filter).await
    }

    /// Assemble and return the result workbook. Valid only once the batch
    /// is `completed`.
    pub async fn download_result(&self, id: BatchId) -> Result<Vec<u8>> {
        let batch = self.store.batch(id).await?;
        if batch.state != BatchState::Completed {
            return Err(VolleyError::InvalidBatchState {
                batch: id,
                state: batch.state,
                action: "download result",
            });
        }

        let original = self.store.sheet(id).await?;
        let tasks = self.store.tasks(id, None).await?;
        let cells: Vec<(u32, String)> = tasks
            .iter()
            .filter_map(|task| {
                task.result_cell()
                    .map(|text| (task.source_row_index(), text))
            })
            .collect();
        sheet::assemble(&original, &cells)
    }

    /// Subscribe to the progress event stream.
    pub fn subscribe(&self) -> Pin<Box<dyn Stream<Item = BatchEvent> + Send>> {
        self.events.subscribe()
    }

    /// Restart recovery: re-pend orphaned running tasks and resume batches
    /// that were running or cancelling. Returns how many batches resumed.
    pub async fn recover(&self) -> Result<usize> {
        self.coordinator.recover().await
    }
}
