//! Shared store test suite, run against every backend.

use chrono::Utc;
use rstest::{fixture, rstest};
use uuid::Uuid;

use crate::batch::{Batch, BatchId, BatchState};
use crate::binding::{BindingId, WorkflowBinding};
use crate::error::{TaskErrorKind, VolleyError};
use crate::task::{AnyTask, InputMap, Pending, Task, TaskData, TaskId, TaskStateKind};

use super::Store;
use super::in_memory::InMemoryStore;

fn sample_binding() -> WorkflowBinding {
    WorkflowBinding {
        id: BindingId::new(),
        name: "search".to_string(),
        description: Some("test binding".to_string()),
        base_url: "https://workflows.example.com/v1".to_string(),
        credential: "app-key".to_string(),
        schema: Some(crate::binding::ParameterSchema::default()),
        synced_at: Some(Utc::now()),
        active: true,
        created_at: Utc::now(),
    }
}

fn sample_batch(binding_id: BindingId) -> Batch {
    Batch {
        id: BatchId::new(),
        binding_id,
        source_file_ref: "batch_data.xlsx".to_string(),
        created_at: Utc::now(),
        state: BatchState::Created,
        concurrency_limit: 4,
        max_attempts: 3,
        result_template: None,
        started_at: None,
        finished_at: None,
    }
}

fn sample_task(batch_id: BatchId, source_row_index: u32) -> Task<Pending> {
    let mut inputs = InputMap::new();
    inputs.insert(
        "q".to_string(),
        serde_json::Value::String(format!("row-{source_row_index}")),
    );
    Task {
        state: Pending {
            attempts: 0,
            not_before: None,
        },
        data: TaskData {
            id: TaskId::new(),
            batch_id,
            source_row_index,
            inputs,
            max_attempts: 3,
        },
    }
}

/// Insert a binding + batch with tasks at the given source rows.
async fn seed<S: Store>(store: &S, rows: &[u32]) -> (BindingId, BatchId) {
    let binding = sample_binding();
    let binding_id = binding.id;
    store.insert_binding(binding).await.unwrap();

    let batch = sample_batch(binding_id);
    let batch_id = batch.id;
    let tasks = rows.iter().map(|r| sample_task(batch_id, *r)).collect();
    store.insert_batch(batch, b"sheet-bytes".to_vec(), tasks).await.unwrap();
    (binding_id, batch_id)
}

async fn run_claim_is_fifo_by_source_row<S: Store>(store: &S) {
    // Insert out of order; claims must come back ascending.
    let (_, batch_id) = seed(store, &[7, 3, 5]).await;
    let worker = Uuid::new_v4();

    let first = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    let second = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    let third = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    assert_eq!(first.data.source_row_index, 3);
    assert_eq!(second.data.source_row_index, 5);
    assert_eq!(third.data.source_row_index, 7);
    assert_eq!(first.state.attempt, 1);

    assert!(store.claim_next(batch_id, worker).await.unwrap().is_none());
}

async fn run_claim_respects_not_before<S: Store>(store: &S) {
    let (_, batch_id) = seed(store, &[0]).await;
    let worker = Uuid::new_v4();

    let running = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    let far_future = Utc::now() + chrono::Duration::seconds(3600);
    running.reschedule(far_future, store).await.unwrap();

    // Backed-off task is not eligible yet.
    assert!(store.claim_next(batch_id, worker).await.unwrap().is_none());

    let counts = store.counts(batch_id).await.unwrap();
    assert_eq!(counts.pending, 1);
}

async fn run_reschedule_preserves_attempts<S: Store>(store: &S) {
    let (_, batch_id) = seed(store, &[0]).await;
    let worker = Uuid::new_v4();

    let running = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    assert_eq!(running.state.attempt, 1);
    let past = Utc::now() - chrono::Duration::seconds(1);
    running.reschedule(past, store).await.unwrap();

    let running = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    assert_eq!(running.state.attempt, 2);
}

async fn run_terminal_states_are_immutable<S: Store>(store: &S) {
    let (_, batch_id) = seed(store, &[0]).await;
    let worker = Uuid::new_v4();

    let running = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    let task_id = running.data.id;
    let succeeded = running
        .succeed("done".to_string(), Some("run-1".to_string()), 12, store)
        .await
        .unwrap();

    // Any further write to this task must be rejected.
    let result = succeeded.clone().fail_like_attempt(store).await;
    assert!(matches!(result, Err(VolleyError::InvalidTaskState(..))));

    let fetched = store.task(task_id).await.unwrap();
    let AnyTask::Succeeded(task) = fetched else {
        panic!("expected succeeded task");
    };
    assert_eq!(task.state.output, "done");
    assert_eq!(task.state.external_run_id.as_deref(), Some("run-1"));
    assert_eq!(task.state.attempts, 1);
}

async fn run_counts_aggregate_states<S: Store>(store: &S) {
    let (_, batch_id) = seed(store, &[0, 1, 2, 3]).await;
    let worker = Uuid::new_v4();

    let first = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    first
        .succeed("ok".to_string(), None, 1, store)
        .await
        .unwrap();
    let second = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    second
        .fail(TaskErrorKind::Permanent, "HTTP 400".to_string(), store)
        .await
        .unwrap();
    let _third = store.claim_next(batch_id, worker).await.unwrap().unwrap();

    let counts = store.counts(batch_id).await.unwrap();
    assert_eq!(counts.total, 4);
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.running, 1);
    assert_eq!(counts.succeeded, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.cancelled, 0);
}

async fn run_cancel_pending_tasks<S: Store>(store: &S) {
    let (_, batch_id) = seed(store, &[0, 1, 2]).await;
    let worker = Uuid::new_v4();
    let _running = store.claim_next(batch_id, worker).await.unwrap().unwrap();

    let cancelled = store.cancel_pending_tasks(batch_id).await.unwrap();
    assert_eq!(cancelled.len(), 2);
    assert!(cancelled.iter().all(|t| t.kind() == TaskStateKind::Cancelled));

    let counts = store.counts(batch_id).await.unwrap();
    assert_eq!(counts.cancelled, 2);
    assert_eq!(counts.running, 1);
    assert!(store.claim_next(batch_id, worker).await.unwrap().is_none());
}

async fn run_repend_running_tasks<S: Store>(store: &S) {
    let (_, batch_id) = seed(store, &[0, 1]).await;
    let worker = Uuid::new_v4();
    let one = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    let _two = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    let interrupted_attempt = one.state.attempt;

    let repended = store.repend_running_tasks(batch_id).await.unwrap();
    assert_eq!(repended, 2);

    // The interrupted call stays counted against the budget.
    let reclaimed = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    assert_eq!(reclaimed.state.attempt, interrupted_attempt + 1);
}

async fn run_repend_caps_attempts_at_the_budget<S: Store>(store: &S) {
    // A task interrupted mid-flight on its final attempt must still be
    // claimable after recovery without blowing the attempt budget.
    let (_, batch_id) = seed(store, &[0]).await;
    let worker = Uuid::new_v4();
    let past = Utc::now() - chrono::Duration::seconds(1);

    // Drive the task to its third and final attempt (max_attempts is 3).
    for expected in 1..=2u32 {
        let running = store.claim_next(batch_id, worker).await.unwrap().unwrap();
        assert_eq!(running.state.attempt, expected);
        running.reschedule(past, store).await.unwrap();
    }
    let running = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    assert_eq!(running.state.attempt, 3);

    // Crash here. Recovery re-pends; the re-dispatch consumes the final
    // budgeted attempt rather than exceeding it.
    store.repend_running_tasks(batch_id).await.unwrap();
    let reclaimed = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    assert_eq!(reclaimed.state.attempt, 3);
    assert!(reclaimed.state.attempt <= reclaimed.data.max_attempts);
}

async fn run_batch_transitions_are_guarded<S: Store>(store: &S) {
    let (_, batch_id) = seed(store, &[0]).await;

    let err = store
        .transition_batch(batch_id, &[BatchState::Paused], BatchState::Running, "resume")
        .await
        .unwrap_err();
    assert!(matches!(err, VolleyError::InvalidBatchState { .. }));

    let batch = store
        .transition_batch(
            batch_id,
            &[BatchState::Created, BatchState::Paused],
            BatchState::Running,
            "start",
        )
        .await
        .unwrap();
    assert_eq!(batch.state, BatchState::Running);
    assert!(batch.started_at.is_some());
    assert!(batch.finished_at.is_none());

    let batch = store
        .transition_batch(
            batch_id,
            &[BatchState::Running, BatchState::Cancelling],
            BatchState::Completed,
            "complete",
        )
        .await
        .unwrap();
    assert!(batch.finished_at.is_some());
}

async fn run_binding_in_use_tracks_batch_lifecycle<S: Store>(store: &S) {
    let (binding_id, batch_id) = seed(store, &[0]).await;
    assert!(store.binding_in_use(binding_id).await.unwrap());

    store
        .transition_batch(batch_id, &[BatchState::Created], BatchState::Running, "start")
        .await
        .unwrap();
    store
        .transition_batch(batch_id, &[BatchState::Running], BatchState::Completed, "complete")
        .await
        .unwrap();
    assert!(!store.binding_in_use(binding_id).await.unwrap());
}

async fn run_sheet_bytes_round_trip<S: Store>(store: &S) {
    let (_, batch_id) = seed(store, &[0]).await;
    assert_eq!(store.sheet(batch_id).await.unwrap(), b"sheet-bytes");
    assert!(matches!(
        store.sheet(BatchId::new()).await,
        Err(VolleyError::BatchNotFound(_))
    ));
}

async fn run_tasks_are_ordered_and_filterable<S: Store>(store: &S) {
    let (_, batch_id) = seed(store, &[9, 1, 4]).await;
    let worker = Uuid::new_v4();
    let claimed = store.claim_next(batch_id, worker).await.unwrap().unwrap();
    assert_eq!(claimed.data.source_row_index, 1);

    let all = store.tasks(batch_id, None).await.unwrap();
    let rows: Vec<u32> = all.iter().map(|t| t.source_row_index()).collect();
    assert_eq!(rows, vec![1, 4, 9]);

    let pending = store
        .tasks(batch_id, Some(TaskStateKind::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 2);
}

// An operation that always tries to overwrite whatever state the task is in,
// used to probe terminal-state protection.
impl Task<crate::task::Succeeded> {
    async fn fail_like_attempt<S: Store + ?Sized>(
        self,
        store: &S,
    ) -> crate::error::Result<()> {
        let task = Task {
            state: Pending {
                attempts: self.state.attempts,
                not_before: None,
            },
            data: self.data,
        };
        store.persist(&task).await
    }
}

#[fixture]
fn in_memory() -> InMemoryStore {
    InMemoryStore::new()
}

#[cfg(feature = "sqlite")]
async fn sqlite() -> super::sqlite::SqliteStore {
    super::sqlite::SqliteStore::connect("sqlite::memory:")
        .await
        .unwrap()
}

macro_rules! store_tests {
    ($($name:ident => $runner:ident),* $(,)?) => {
        $(
            #[rstest]
            #[tokio::test]
            async fn $name(in_memory: InMemoryStore) {
                $runner(&in_memory).await;
            }
        )*

        #[cfg(feature = "sqlite")]
        mod sqlite_backend {
            use super::*;

            $(
                #[tokio::test]
                async fn $name() {
                    let store = sqlite().await;
                    $runner(&store).await;
                }
            )*
        }
    };
}

store_tests! {
    claim_is_fifo_by_source_row => run_claim_is_fifo_by_source_row,
    claim_respects_not_before => run_claim_respects_not_before,
    reschedule_preserves_attempts => run_reschedule_preserves_attempts,
    terminal_states_are_immutable => run_terminal_states_are_immutable,
    counts_aggregate_states => run_counts_aggregate_states,
    cancel_pending_tasks => run_cancel_pending_tasks,
    repend_running_tasks => run_repend_running_tasks,
    repend_caps_attempts_at_the_budget => run_repend_caps_attempts_at_the_budget,
    batch_transitions_are_guarded => run_batch_transitions_are_guarded,
    binding_in_use_tracks_batch_lifecycle => run_binding_in_use_tracks_batch_lifecycle,
    sheet_bytes_round_trip => run_sheet_bytes_round_trip,
    tasks_are_ordered_and_filterable => run_tasks_are_ordered_and_filterable,
}
