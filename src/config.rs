//! Runtime configuration for the batch execution core.

/// Retry behaviour for a single batch.
///
/// Delays are exponential: `base_delay_ms * multiplier^(attempt - 1)`,
/// capped at `max_delay_ms`, with ±25% jitter applied by the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of remote calls per task, including the first
    pub max_attempts: u32,

    /// Base backoff duration in milliseconds
    pub base_delay_ms: u64,

    /// Factor by which the delay grows with each retry
    pub multiplier: u32,

    /// Ceiling for a single backoff delay in milliseconds
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            multiplier: 2,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next call after `attempt` calls have been made.
    ///
    /// `attempt` is 1-based, so the delay after the first failed call is
    /// exactly `base_delay_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponential = self
            .base_delay_ms
            .saturating_mul(u64::from(self.multiplier).saturating_pow(attempt.saturating_sub(1)));
        exponential.min(self.max_delay_ms)
    }
}

/// Configuration for a [`BatchRunner`](crate::runner::BatchRunner).
///
/// Per-batch knobs here are defaults; `create_batch` accepts overrides for
/// concurrency and attempt budget. `max_concurrent_tasks` is a process-wide
/// ceiling enforced across all running batches.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Default per-batch worker count
    pub default_concurrency: usize,

    /// Hard ceiling on in-flight tasks across all batches
    pub max_concurrent_tasks: usize,

    /// Per-call deadline covering connect, headers and body, in milliseconds
    pub request_timeout_ms: u64,

    /// Default retry policy for new batches
    pub retry: RetryPolicy,

    /// How long an idle worker loop sleeps before re-polling the store
    pub claim_interval_ms: u64,

    /// Debounce interval for `batch_progress` events
    pub progress_tick_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 10,
            max_concurrent_tasks: 64,
            request_timeout_ms: 60_000,
            retry: RetryPolicy::default(),
            claim_interval_ms: 100,
            progress_tick_ms: 500,
        }
    }
}

impl RunnerConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.request_timeout_ms)
    }

    pub fn claim_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.claim_interval_ms)
    }

    pub fn progress_tick(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.progress_tick_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 100,
            multiplier: 2,
            max_delay_ms: 500,
        };

        assert_eq!(policy.backoff_ms(1), 100);
        assert_eq!(policy.backoff_ms(2), 200);
        assert_eq!(policy.backoff_ms(3), 400);
        // Capped at max_delay_ms from here on
        assert_eq!(policy.backoff_ms(4), 500);
        assert_eq!(policy.backoff_ms(10), 500);
    }
}
