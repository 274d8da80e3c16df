//! Batch execution core for driving spreadsheets of inputs through a remote
//! LLM workflow service.
//!
//! A user registers *workflow bindings* (endpoint + credential + cached
//! parameter schema), uploads a spreadsheet of inputs, and gets the same
//! spreadsheet back with one appended `execution_result` column. Behind the
//! scenes a bounded-concurrency dispatcher drives one remote call per data
//! row, retries transient failures with exponential backoff, supports
//! pause/resume/cancel on a running batch, and persists enough state to
//! resume after a process restart. Row/result alignment is guaranteed by
//! filtering rows exactly once at parse time and writing results back by
//! absolute source row index.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use volley::{BatchOptions, BatchRunner, HttpWorkflowClient, InMemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(InMemoryStore::new());
//!     let runner = BatchRunner::new(store, HttpWorkflowClient::new());
//!
//!     // Register a binding; the endpoint is validated by fetching its
//!     // parameter schema.
//!     let binding = runner
//!         .create_binding(
//!             "keyword-research".to_string(),
//!             None,
//!             "https://workflows.example.com/v1".to_string(),
//!             "app-xxxxxxxx".to_string(),
//!         )
//!         .await?;
//!
//!     // Create and run a batch from uploaded sheet bytes.
//!     let sheet = std::fs::read("inputs.xlsx")?;
//!     let batch_id = runner
//!         .create_batch(binding.id, sheet, BatchOptions::default())
//!         .await?;
//!     runner.start_batch(batch_id).await?;
//!
//!     // ... poll `runner.get_batch(batch_id)` or consume
//!     // `runner.subscribe()` until the batch completes, then:
//!     let result = runner.download_result(batch_id).await?;
//!     std::fs::write("results.xlsx", result)?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod binding;
pub mod client;
pub mod config;
pub mod coordinator;
mod dispatcher;
pub mod error;
pub mod events;
pub mod registry;
pub mod runner;
pub mod sheet;
pub mod store;
pub mod task;

// Re-export the types most users interact with, so `use volley::BatchRunner`
// works without knowing the module layout.
pub use batch::{Batch, BatchCounts, BatchId, BatchSnapshot, BatchState};
pub use binding::{
    BindingId, BindingUpdate, ParameterSchema, ParameterSpec, ParameterType, RowError,
    WorkflowBinding,
};
pub use client::{
    HttpWorkflowClient, MockWorkflowClient, RunError, RunResult, RunStatus, WorkflowClient,
    extract_output,
};
pub use config::{RetryPolicy, RunnerConfig};
pub use error::{Result, TaskErrorKind, VolleyError};
pub use events::{BatchEvent, EventBus};
pub use registry::WorkflowRegistry;
pub use runner::{BatchOptions, BatchRunner};
pub use store::Store;
pub use store::in_memory::InMemoryStore;
pub use task::{AnyTask, InputMap, Task, TaskId, TaskStateKind};

#[cfg(feature = "sqlite")]
pub use store::sqlite::SqliteStore;
