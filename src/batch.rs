//! Batched execution of mutating calls with retry
//!
//! Ids are cut into fixed-size batches in their original order and sent one
//! batch at a time. A batch that fails transiently is retried with capped
//! exponential backoff; one that fails permanently, or runs out of attempts,
//! has every id recorded as failed and the run moves on. Only a systemic
//! error (lost authorization) stops the run.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::client::GmailClient;
use crate::config::JobsConfig;
use crate::error::Result;
use crate::models::{BatchResult, BulkAction, ItemFailure};

/// Backoff settings for a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total tries per batch, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &JobsConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    /// Wait before the retry that follows failed attempt `attempt` (1-based)
    ///
    /// Doubles from the base delay and is capped, but never shorter than a
    /// provider Retry-After hint.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<u64>) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        match retry_after {
            Some(secs) => backoff.max(Duration::from_secs(secs)),
            None => backoff,
        }
    }
}

/// Running totals over a whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchTotals {
    pub batches: usize,
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub failures: Vec<ItemFailure>,
}

impl BatchTotals {
    fn record(&mut self, result: &BatchResult) {
        self.batches += 1;
        self.processed += result.attempted;
        self.succeeded += result.succeeded;
        self.failed += result.failed();
        self.failures.extend(result.failures.iter().cloned());
    }
}

/// Sends ids through the provider in bounded batches
#[derive(Clone)]
pub struct BatchExecutor {
    client: Arc<dyn GmailClient>,
    batch_size: usize,
    retry: RetryPolicy,
}

impl BatchExecutor {
    pub fn new(client: Arc<dyn GmailClient>, batch_size: usize, retry: RetryPolicy) -> Self {
        Self {
            client,
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Apply `action` to `ids`, calling `on_batch_complete` after each batch
    ///
    /// # Errors
    /// Only systemic provider errors are returned; everything else ends up
    /// as item failures in the totals.
    pub async fn run<F>(
        &self,
        ids: &[String],
        action: BulkAction,
        mut on_batch_complete: F,
    ) -> Result<BatchTotals>
    where
        F: FnMut(&BatchResult),
    {
        let mut totals = BatchTotals::default();

        for (index, chunk) in ids.chunks(self.batch_size).enumerate() {
            let mut result = self.run_batch(index, chunk, action).await?;
            result.batch_index = index;

            debug!(
                "Batch {} done: {}/{} {}",
                index,
                result.succeeded,
                result.attempted,
                action.past_tense()
            );

            totals.record(&result);
            on_batch_complete(&result);
        }

        Ok(totals)
    }

    async fn run_batch(&self, index: usize, chunk: &[String], action: BulkAction) -> Result<BatchResult> {
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.client.batch_mutate(chunk, action).await {
                Ok(mut result) => {
                    // The provider only knows the ids it was handed
                    result.attempted = chunk.len();
                    result.succeeded = chunk.len().saturating_sub(result.failures.len());
                    return Ok(result);
                }
                Err(e) if e.is_systemic() => {
                    warn!("Batch {} aborted the run: {}", index, e);
                    return Err(e);
                }
                Err(e) if e.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt, e.retry_after());
                    warn!(
                        "Batch {} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        index, attempt, self.retry.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        "Batch {} of {} ids failed after {} attempt(s): {}",
                        index,
                        chunk.len(),
                        attempt,
                        e
                    );
                    return Ok(BatchResult::all_failed(chunk, &e.to_string()));
                }
            }
        }
    }
}
