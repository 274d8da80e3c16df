//! SQLite store implementation.
//!
//! Backs the core with a local transactional database so batches survive
//! process restarts. Queries are runtime-checked and the pool is capped at a
//! single connection: the core is single-process and the store contract only
//! requires serialized writes per task.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use uuid::Uuid;

use crate::batch::{Batch, BatchCounts, BatchId, BatchState};
use crate::binding::{BindingId, ParameterSchema, WorkflowBinding};
use crate::error::{Result, TaskErrorKind, VolleyError};
use crate::task::{
    AnyTask, Cancelled, Failed, InputMap, Pending, Running, Succeeded, Task, TaskData, TaskId,
    TaskState, TaskStateKind, WorkerId,
};

use super::Store;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bindings (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    description TEXT,
    base_url    TEXT NOT NULL,
    credential  TEXT NOT NULL,
    schema      TEXT,
    synced_at   TEXT,
    active      INTEGER NOT NULL DEFAULT 1,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batches (
    id                TEXT PRIMARY KEY,
    binding_id        TEXT NOT NULL REFERENCES bindings(id),
    source_file_ref   TEXT NOT NULL,
    created_at        TEXT NOT NULL,
    state             TEXT NOT NULL,
    concurrency_limit INTEGER NOT NULL,
    max_attempts      INTEGER NOT NULL,
    result_template   TEXT,
    started_at        TEXT,
    finished_at       TEXT,
    sheet             BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
    id               TEXT PRIMARY KEY,
    batch_id         TEXT NOT NULL REFERENCES batches(id),
    source_row_index INTEGER NOT NULL,
    inputs           TEXT NOT NULL,
    state            TEXT NOT NULL,
    attempts         INTEGER NOT NULL DEFAULT 0,
    max_attempts     INTEGER NOT NULL,
    not_before       TEXT,
    worker_id        TEXT,
    external_run_id  TEXT,
    output           TEXT,
    error_kind       TEXT,
    error_detail     TEXT,
    elapsed_ms       INTEGER,
    started_at       TEXT,
    finished_at      TEXT,
    UNIQUE (batch_id, source_row_index)
);

CREATE INDEX IF NOT EXISTS idx_tasks_batch_state ON tasks (batch_id, state);
CREATE INDEX IF NOT EXISTS idx_tasks_batch_row ON tasks (batch_id, source_row_index);
"#;

/// SQLite implementation of the [`Store`] trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and apply the schema.
    ///
    /// Use `sqlite::memory:` for an ephemeral database.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool and apply the schema.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_uuid(text: &str) -> Result<Uuid> {
    Uuid::parse_str(text)
        .map_err(|e| VolleyError::Internal(anyhow::anyhow!("invalid uuid in store: {e}")))
}

fn binding_from_row(row: &SqliteRow) -> Result<WorkflowBinding> {
    let id: String = row.try_get("id")?;
    let schema: Option<String> = row.try_get("schema")?;
    let schema = schema
        .map(|text| serde_json::from_str::<ParameterSchema>(&text))
        .transpose()?;
    Ok(WorkflowBinding {
        id: BindingId(parse_uuid(&id)?),
        name: row.try_get("name")?,
        description: row.try_get("description")?,
        base_url: row.try_get("base_url")?,
        credential: row.try_get("credential")?,
        schema,
        synced_at: row.try_get("synced_at")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
    })
}

fn batch_from_row(row: &SqliteRow) -> Result<Batch> {
    let id: String = row.try_get("id")?;
    let binding_id: String = row.try_get("binding_id")?;
    let state: String = row.try_get("state")?;
    let concurrency: i64 = row.try_get("concurrency_limit")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    Ok(Batch {
        id: BatchId(parse_uuid(&id)?),
        binding_id: BindingId(parse_uuid(&binding_id)?),
        source_file_ref: row.try_get("source_file_ref")?,
        created_at: row.try_get("created_at")?,
        state: state
            .parse::<BatchState>()
            .map_err(|e| VolleyError::Internal(anyhow::anyhow!(e)))?,
        concurrency_limit: concurrency as usize,
        max_attempts: max_attempts as u32,
        result_template: row.try_get("result_template")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<AnyTask> {
    let id: String = row.try_get("id")?;
    let batch_id: String = row.try_get("batch_id")?;
    let source_row_index: i64 = row.try_get("source_row_index")?;
    let inputs_text: String = row.try_get("inputs")?;
    let inputs: InputMap = serde_json::from_str(&inputs_text)?;
    let max_attempts: i64 = row.try_get("max_attempts")?;
    let attempts: i64 = row.try_get("attempts")?;
    let state: String = row.try_get("state")?;

    let data = TaskData {
        id: TaskId(parse_uuid(&id)?),
        batch_id: BatchId(parse_uuid(&batch_id)?),
        source_row_index: source_row_index as u32,
        inputs,
        max_attempts: max_attempts as u32,
    };

    let kind = state
        .parse::<TaskStateKind>()
        .map_err(|e| VolleyError::Internal(anyhow::anyhow!(e)))?;

    let started_at: Option<DateTime<Utc>> = row.try_get("started_at")?;
    let finished_at: Option<DateTime<Utc>> = row.try_get("finished_at")?;

    let task = match kind {
        TaskStateKind::Pending => AnyTask::Pending(Task {
            state: Pending {
                attempts: attempts as u32,
                not_before: row.try_get("not_before")?,
            },
            data,
        }),
        TaskStateKind::Running => {
            let worker: Option<String> = row.try_get("worker_id")?;
            AnyTask::Running(Task {
                state: Running {
                    worker_id: worker
                        .as_deref()
                        .map(parse_uuid)
                        .transpose()?
                        .unwrap_or_else(Uuid::nil),
                    attempt: attempts as u32,
                    started_at: started_at.unwrap_or_else(Utc::now),
                },
                data,
            })
        }
        TaskStateKind::Succeeded => {
            let output: Option<String> = row.try_get("output")?;
            let elapsed: Option<i64> = row.try_get("elapsed_ms")?;
            AnyTask::Succeeded(Task {
                state: Succeeded {
                    output: output.unwrap_or_default(),
                    external_run_id: row.try_get("external_run_id")?,
                    elapsed_ms: elapsed.unwrap_or(0) as u64,
                    attempts: attempts as u32,
                    started_at: started_at.unwrap_or_else(Utc::now),
                    finished_at: finished_at.unwrap_or_else(Utc::now),
                },
                data,
            })
        }
        TaskStateKind::Failed => {
            let kind_text: Option<String> = row.try_get("error_kind")?;
            let kind = kind_text
                .as_deref()
                .and_then(|k| k.parse::<TaskErrorKind>().ok())
                .unwrap_or(TaskErrorKind::Protocol);
            let detail: Option<String> = row.try_get("error_detail")?;
            AnyTask::Failed(Task {
                state: Failed {
                    kind,
                    detail: detail.unwrap_or_default(),
                    attempts: attempts as u32,
                    finished_at: finished_at.unwrap_or_else(Utc::now),
                },
                data,
            })
        }
        TaskStateKind::Cancelled => AnyTask::Cancelled(Task {
            state: Cancelled {
                cancelled_at: finished_at.unwrap_or_else(Utc::now),
            },
            data,
        }),
    };
    Ok(task)
}

/// Per-state column values for a task UPDATE.
struct TaskColumns {
    state: &'static str,
    attempts: i64,
    not_before: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    external_run_id: Option<String>,
    output: Option<String>,
    error_kind: Option<&'static str>,
    error_detail: Option<String>,
    elapsed_ms: Option<i64>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

fn task_columns(task: &AnyTask) -> TaskColumns {
    match task {
        AnyTask::Pending(t) => TaskColumns {
            state: "pending",
            attempts: i64::from(t.state.attempts),
            not_before: t.state.not_before,
            worker_id: None,
            external_run_id: None,
            output: None,
            error_kind: None,
            error_detail: None,
            elapsed_ms: None,
            started_at: None,
            finished_at: None,
        },
        AnyTask::Running(t) => TaskColumns {
            state: "running",
            attempts: i64::from(t.state.attempt),
            not_before: None,
            worker_id: Some(t.state.worker_id.to_string()),
            external_run_id: None,
            output: None,
            error_kind: None,
            error_detail: None,
            elapsed_ms: None,
            started_at: Some(t.state.started_at),
            finished_at: None,
        },
        AnyTask::Succeeded(t) => TaskColumns {
            state: "succeeded",
            attempts: i64::from(t.state.attempts),
            not_before: None,
            worker_id: None,
            external_run_id: t.state.external_run_id.clone(),
            output: Some(t.state.output.clone()),
            error_kind: None,
            error_detail: None,
            elapsed_ms: Some(t.state.elapsed_ms as i64),
            started_at: Some(t.state.started_at),
            finished_at: Some(t.state.finished_at),
        },
        AnyTask::Failed(t) => TaskColumns {
            state: "failed",
            attempts: i64::from(t.state.attempts),
            not_before: None,
            worker_id: None,
            external_run_id: None,
            output: None,
            error_kind: Some(t.state.kind.as_str()),
            error_detail: Some(t.state.detail.clone()),
            elapsed_ms: None,
            started_at: None,
            finished_at: Some(t.state.finished_at),
        },
        AnyTask::Cancelled(t) => TaskColumns {
            state: "cancelled",
            attempts: 0,
            not_before: None,
            worker_id: None,
            external_run_id: None,
            output: None,
            error_kind: None,
            error_detail: None,
            elapsed_ms: None,
            started_at: None,
            finished_at: Some(t.state.cancelled_at),
        },
    }
}

const TASK_SELECT: &str = "SELECT id, batch_id, source_row_index, inputs, state, attempts, \
     max_attempts, not_before, worker_id, external_run_id, output, error_kind, error_detail, \
     elapsed_ms, started_at, finished_at FROM tasks";

#[async_trait]
impl Store for SqliteStore {
    async fn insert_binding(&self, binding: WorkflowBinding) -> Result<()> {
        let schema = binding
            .schema
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            "INSERT INTO bindings (id, name, description, base_url, credential, schema, \
             synced_at, active, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(binding.id.0.to_string())
        .bind(&binding.name)
        .bind(&binding.description)
        .bind(&binding.base_url)
        .bind(&binding.credential)
        .bind(schema)
        .bind(binding.synced_at)
        .bind(binding.active)
        .bind(binding.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_binding(&self, binding: WorkflowBinding) -> Result<()> {
        let schema = binding
            .schema
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let result = sqlx::query(
            "UPDATE bindings SET name = ?, description = ?, credential = ?, schema = ?, \
             synced_at = ?, active = ? WHERE id = ?",
        )
        .bind(&binding.name)
        .bind(&binding.description)
        .bind(&binding.credential)
        .bind(schema)
        .bind(binding.synced_at)
        .bind(binding.active)
        .bind(binding.id.0.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(VolleyError::BindingNotFound(binding.id));
        }
        Ok(())
    }

    async fn remove_binding(&self, id: BindingId) -> Result<()> {
        let result = sqlx::query("DELETE FROM bindings WHERE id = ?")
            .bind(id.0.to_string())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(VolleyError::BindingNotFound(id));
        }
        Ok(())
    }

    async fn binding(&self, id: BindingId) -> Result<WorkflowBinding> {
        let row = sqlx::query("SELECT * FROM bindings WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(VolleyError::BindingNotFound(id))?;
        binding_from_row(&row)
    }

    async fn bindings(&self) -> Result<Vec<WorkflowBinding>> {
        let rows = sqlx::query("SELECT * FROM bindings ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(binding_from_row).collect()
    }

    async fn binding_in_use(&self, id: BindingId) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM batches WHERE binding_id = ? \
             AND state NOT IN ('completed', 'failed')",
        )
        .bind(id.0.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn insert_batch(
        &self,
        batch: Batch,
        sheet: Vec<u8>,
        tasks: Vec<Task<Pending>>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO batches (id, binding_id, source_file_ref, created_at, state, \
             concurrency_limit, max_attempts, result_template, started_at, finished_at, sheet) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(batch.id.0.to_string())
        .bind(batch.binding_id.0.to_string())
        .bind(&batch.source_file_ref)
        .bind(batch.created_at)
        .bind(batch.state.as_str())
        .bind(batch.concurrency_limit as i64)
        .bind(i64::from(batch.max_attempts))
        .bind(&batch.result_template)
        .bind(batch.started_at)
        .bind(batch.finished_at)
        .bind(sheet)
        .execute(&mut *tx)
        .await?;

        for task in &tasks {
            sqlx::query(
                "INSERT INTO tasks (id, batch_id, source_row_index, inputs, state, attempts, \
                 max_attempts, not_before) VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)",
            )
            .bind(task.data.id.0.to_string())
            .bind(task.data.batch_id.0.to_string())
            .bind(i64::from(task.data.source_row_index))
            .bind(serde_json::to_string(&task.data.inputs)?)
            .bind(i64::from(task.state.attempts))
            .bind(i64::from(task.data.max_attempts))
            .bind(task.state.not_before)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn batch(&self, id: BatchId) -> Result<Batch> {
        let row = sqlx::query("SELECT * FROM batches WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(VolleyError::BatchNotFound(id))?;
        batch_from_row(&row)
    }

    async fn batches(&self) -> Result<Vec<Batch>> {
        let rows = sqlx::query("SELECT * FROM batches ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(batch_from_row).collect()
    }

    async fn sheet(&self, id: BatchId) -> Result<Vec<u8>> {
        let sheet: Option<Vec<u8>> = sqlx::query_scalar("SELECT sheet FROM batches WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?;
        sheet.ok_or(VolleyError::BatchNotFound(id))
    }

    async fn transition_batch(
        &self,
        id: BatchId,
        from: &[BatchState],
        to: BatchState,
        action: &'static str,
    ) -> Result<Batch> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM batches WHERE id = ?")
            .bind(id.0.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(VolleyError::BatchNotFound(id))?;
        let mut batch = batch_from_row(&row)?;

        if !from.contains(&batch.state) {
            return Err(VolleyError::InvalidBatchState {
                batch: id,
                state: batch.state,
                action,
            });
        }

        let now = Utc::now();
        batch.state = to;
        if to == BatchState::Running && batch.started_at.is_none() {
            batch.started_at = Some(now);
        }
        if to.is_terminal() {
            batch.finished_at = Some(now);
        }

        sqlx::query("UPDATE batches SET state = ?, started_at = ?, finished_at = ? WHERE id = ?")
            .bind(batch.state.as_str())
            .bind(batch.started_at)
            .bind(batch.finished_at)
            .bind(id.0.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(batch)
    }

    async fn batches_in_state(&self, states: &[BatchState]) -> Result<Vec<Batch>> {
        // States are a small fixed set; filter in Rust rather than building
        // a dynamic IN clause.
        Ok(self
            .batches()
            .await?
            .into_iter()
            .filter(|b| states.contains(&b.state))
            .collect())
    }

    async fn counts(&self, id: BatchId) -> Result<BatchCounts> {
        // Existence check first so a missing batch is not an empty count.
        self.batch(id).await?;

        let rows = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM tasks WHERE batch_id = ? GROUP BY state",
        )
        .bind(id.0.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = BatchCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let n: i64 = row.try_get("n")?;
            let n = n as u64;
            counts.total += n;
            match state.parse::<TaskStateKind>() {
                Ok(TaskStateKind::Pending) => counts.pending += n,
                Ok(TaskStateKind::Running) => counts.running += n,
                Ok(TaskStateKind::Succeeded) => counts.succeeded += n,
                Ok(TaskStateKind::Failed) => counts.failed += n,
                Ok(TaskStateKind::Cancelled) => counts.cancelled += n,
                Err(e) => return Err(VolleyError::Internal(anyhow::anyhow!(e))),
            }
        }
        Ok(counts)
    }

    async fn claim_next(
        &self,
        batch_id: BatchId,
        worker: WorkerId,
    ) -> Result<Option<Task<Running>>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let rows = sqlx::query(&format!(
            "{TASK_SELECT} WHERE batch_id = ? AND state = 'pending' ORDER BY source_row_index"
        ))
        .bind(batch_id.0.to_string())
        .fetch_all(&mut *tx)
        .await?;

        let mut claimed = None;
        for row in &rows {
            let AnyTask::Pending(pending) = task_from_row(row)? else {
                continue;
            };
            if pending.state.not_before.is_none_or(|t| t <= now) {
                claimed = Some(Task {
                    state: Running {
                        worker_id: worker,
                        attempt: pending.state.attempts + 1,
                        started_at: now,
                    },
                    data: pending.data,
                });
                break;
            }
        }

        if let Some(running) = &claimed {
            sqlx::query(
                "UPDATE tasks SET state = 'running', attempts = ?, worker_id = ?, \
                 started_at = ?, not_before = NULL WHERE id = ? AND state = 'pending'",
            )
            .bind(i64::from(running.state.attempt))
            .bind(running.state.worker_id.to_string())
            .bind(running.state.started_at)
            .bind(running.data.id.0.to_string())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn persist<T: TaskState + Clone>(&self, task: &Task<T>) -> Result<()>
    where
        AnyTask: From<Task<T>>,
    {
        let any = AnyTask::from(task.clone());
        let id = any.id();
        let columns = task_columns(&any);

        // Terminal task states are immutable, so the guard is in the WHERE
        // clause; zero affected rows is disambiguated below.
        let result = sqlx::query(
            "UPDATE tasks SET state = ?, attempts = ?, not_before = ?, worker_id = ?, \
             external_run_id = ?, output = ?, error_kind = ?, error_detail = ?, elapsed_ms = ?, \
             started_at = ?, finished_at = ? \
             WHERE id = ? AND state IN ('pending', 'running')",
        )
        .bind(columns.state)
        .bind(columns.attempts)
        .bind(columns.not_before)
        .bind(columns.worker_id)
        .bind(columns.external_run_id)
        .bind(columns.output)
        .bind(columns.error_kind)
        .bind(columns.error_detail)
        .bind(columns.elapsed_ms)
        .bind(columns.started_at)
        .bind(columns.finished_at)
        .bind(id.0.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let existing: Option<String> = sqlx::query_scalar("SELECT state FROM tasks WHERE id = ?")
                .bind(id.0.to_string())
                .fetch_optional(&self.pool)
                .await?;
            return match existing {
                None => Err(VolleyError::TaskNotFound(id)),
                Some(state) => Err(VolleyError::InvalidTaskState(
                    id,
                    state,
                    "non-terminal state".to_string(),
                )),
            };
        }
        Ok(())
    }

    async fn task(&self, id: TaskId) -> Result<AnyTask> {
        let row = sqlx::query(&format!("{TASK_SELECT} WHERE id = ?"))
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(VolleyError::TaskNotFound(id))?;
        task_from_row(&row)
    }

    async fn tasks(
        &self,
        batch_id: BatchId,
        filter: Option<TaskStateKind>,
    ) -> Result<Vec<AnyTask>> {
        self.batch(batch_id).await?;

        let rows = match filter {
            Some(kind) => {
                sqlx::query(&format!(
                    "{TASK_SELECT} WHERE batch_id = ? AND state = ? ORDER BY source_row_index"
                ))
                .bind(batch_id.0.to_string())
                .bind(kind.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "{TASK_SELECT} WHERE batch_id = ? ORDER BY source_row_index"
                ))
                .bind(batch_id.0.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(task_from_row).collect()
    }

    async fn cancel_pending_tasks(&self, batch_id: BatchId) -> Result<Vec<AnyTask>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let rows = sqlx::query(&format!(
            "{TASK_SELECT} WHERE batch_id = ? AND state = 'pending' ORDER BY source_row_index"
        ))
        .bind(batch_id.0.to_string())
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE tasks SET state = 'cancelled', not_before = NULL, finished_at = ? \
             WHERE batch_id = ? AND state = 'pending'",
        )
        .bind(now)
        .bind(batch_id.0.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut cancelled = Vec::with_capacity(rows.len());
        for row in &rows {
            let task = task_from_row(row)?;
            cancelled.push(AnyTask::Cancelled(Task {
                state: Cancelled { cancelled_at: now },
                data: task.data().clone(),
            }));
        }
        Ok(cancelled)
    }

    async fn repend_running_tasks(&self, batch_id: BatchId) -> Result<u64> {
        // The interrupted call stays counted, capped so the re-dispatch
        // still fits the attempt budget.
        let result = sqlx::query(
            "UPDATE tasks SET state = 'pending', not_before = NULL, worker_id = NULL, \
             attempts = MIN(attempts, MAX(max_attempts - 1, 0)) \
             WHERE batch_id = ? AND state = 'running'",
        )
        .bind(batch_id.0.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
