//! Progress events and their fan-out.
//!
//! Workers and the coordinator publish [`BatchEvent`]s onto a broadcast
//! channel; outside consumers subscribe through [`EventBus::subscribe`] and
//! take care of their own transport. Events for a single task are totally
//! ordered (`task_started` before its terminal event); nothing is guaranteed
//! across tasks. Every event is emitted only after the state it describes
//! has been persisted.

use std::pin::Pin;

use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::batch::{BatchCounts, BatchId, BatchState};
use crate::error::TaskErrorKind;
use crate::task::TaskId;

/// Progress event emitted by a running batch.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BatchEvent {
    TaskStarted {
        batch_id: BatchId,
        task_id: TaskId,
        source_row_index: u32,
        attempt: u32,
    },
    TaskSucceeded {
        batch_id: BatchId,
        task_id: TaskId,
        source_row_index: u32,
        output: String,
    },
    TaskFailed {
        batch_id: BatchId,
        task_id: TaskId,
        source_row_index: u32,
        kind: TaskErrorKind,
        detail: String,
    },
    BatchStateChanged {
        batch_id: BatchId,
        state: BatchState,
    },
    /// Debounced snapshot, at most one per progress tick per batch.
    BatchProgress {
        batch_id: BatchId,
        counts: BatchCounts,
    },
}

/// Broadcast-backed event fan-out.
///
/// Slow subscribers lose the oldest events rather than applying
/// backpressure to workers; the stream logs and skips over any gap.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BatchEvent>,
}

impl EventBus {
    /// Each task produces a small, bounded number of events, so the default
    /// buffer comfortably absorbs bursts from large batches.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn emit(&self, event: BatchEvent) {
        // Send only fails when there are no subscribers, which is fine.
        let _ = self.tx.send(event);
    }

    /// Subscribe to all events from this point on.
    pub fn subscribe(&self) -> Pin<Box<dyn Stream<Item = BatchEvent> + Send>> {
        let rx = self.tx.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "event subscriber lagged, skipping");
                    None
                }
            }
        }))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(8192)
    }
}
