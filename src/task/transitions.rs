//! Task state transitions.
//!
//! Every transition persists the new state through the store before
//! returning, so a transition that returns `Ok` is durable. The claim
//! transition (`pending → running`) lives on the store itself because it
//! must be atomic against concurrent workers.

use chrono::{DateTime, Utc};

use crate::error::{Result, TaskErrorKind};
use crate::store::Store;

use super::types::{Cancelled, Failed, Pending, Running, Succeeded, Task};

impl Task<Pending> {
    pub async fn cancel<S: Store + ?Sized>(self, store: &S) -> Result<Task<Cancelled>> {
        let task = Task {
            data: self.data,
            state: Cancelled {
                cancelled_at: Utc::now(),
            },
        };
        store.persist(&task).await?;
        Ok(task)
    }
}

impl Task<Running> {
    pub async fn succeed<S: Store + ?Sized>(
        self,
        output: String,
        external_run_id: Option<String>,
        elapsed_ms: u64,
        store: &S,
    ) -> Result<Task<Succeeded>> {
        let task = Task {
            state: Succeeded {
                output,
                external_run_id,
                elapsed_ms,
                attempts: self.state.attempt,
                started_at: self.state.started_at,
                finished_at: Utc::now(),
            },
            data: self.data,
        };
        store.persist(&task).await?;
        Ok(task)
    }

    pub async fn fail<S: Store + ?Sized>(
        self,
        kind: TaskErrorKind,
        detail: String,
        store: &S,
    ) -> Result<Task<Failed>> {
        let task = Task {
            state: Failed {
                kind,
                detail,
                attempts: self.state.attempt,
                finished_at: Utc::now(),
            },
            data: self.data,
        };
        store.persist(&task).await?;
        Ok(task)
    }

    /// Return the task to the pending queue after a retryable failure.
    ///
    /// The attempt counter is carried over; `not_before` delays the next
    /// claim until the backoff has elapsed. The caller is responsible for
    /// checking the attempt budget first.
    pub async fn reschedule<S: Store + ?Sized>(
        self,
        not_before: DateTime<Utc>,
        store: &S,
    ) -> Result<Task<Pending>> {
        let task = Task {
            state: Pending {
                attempts: self.state.attempt,
                not_before: Some(not_before),
            },
            data: self.data,
        };
        store.persist(&task).await?;
        Ok(task)
    }

    pub async fn cancel<S: Store + ?Sized>(self, store: &S) -> Result<Task<Cancelled>> {
        let task = Task {
            data: self.data,
            state: Cancelled {
                cancelled_at: Utc::now(),
            },
        };
        store.persist(&task).await?;
        Ok(task)
    }
}
