//! Retrying worker calls with exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::warn;

use super::client::{StepRequest, StepResult, WorkerClient};
use super::WorkerError;
use crate::config::RetrySettings;
use crate::domain::{CheckedVersion, Version};

/// Exponential backoff bounded by a total time budget
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialRetryPolicy {
    /// Delay before the first retry
    pub base: Duration,

    /// Ceiling for a single delay
    pub max: Duration,

    /// Give up once retrying would take longer than this in total
    pub budget: Duration,
}

impl Default for ExponentialRetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for ExponentialRetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            base: settings.base,
            max: settings.max,
            budget: settings.budget,
        }
    }
}

impl ExponentialRetryPolicy {
    /// Delay after a failed attempt (1-indexed): base, 2×base, 4×base, ...
    /// capped at `max`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.base.min(self.max);
        }

        let factor = 2u32.checked_pow(attempt - 1).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Check whether another attempt fits in the budget
    pub fn should_retry(&self, elapsed: Duration, next_delay: Duration) -> bool {
        elapsed + next_delay <= self.budget
    }
}

/// Wraps a worker client so every call is retried on transport failure.
///
/// When the budget runs out the last error is reported as
/// [`WorkerError::Unavailable`].
#[derive(Clone)]
pub struct RetryableWorker {
    worker: String,
    inner: Arc<dyn WorkerClient>,
    policy: ExponentialRetryPolicy,
}

impl RetryableWorker {
    pub fn new(
        worker: impl Into<String>,
        inner: Arc<dyn WorkerClient>,
        policy: ExponentialRetryPolicy,
    ) -> Self {
        Self {
            worker: worker.into(),
            inner,
            policy,
        }
    }

    async fn retry<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, WorkerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, WorkerError>>,
    {
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let err = match call().await {
                Err(e) if e.is_retryable() => e,
                other => return other,
            };

            let delay = self.policy.delay_for_attempt(attempt);
            if !self.policy.should_retry(started.elapsed(), delay) {
                warn!(
                    worker = %self.worker,
                    operation,
                    attempt,
                    error = %err,
                    "Retry budget exhausted"
                );
                return Err(WorkerError::Unavailable(format!(
                    "{} unreachable after {} attempts: {}",
                    self.worker, attempt, err
                )));
            }

            warn!(
                worker = %self.worker,
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Worker call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl WorkerClient for RetryableWorker {
    async fn ping(&self) -> Result<(), WorkerError> {
        self.retry("ping", || self.inner.ping()).await
    }

    async fn run_check(
        &self,
        resource_type: &str,
        source: &serde_json::Value,
        cursor: Option<&Version>,
    ) -> Result<Vec<CheckedVersion>, WorkerError> {
        self.retry("check", || self.inner.run_check(resource_type, source, cursor))
            .await
    }

    async fn run_step(&self, request: &StepRequest) -> Result<StepResult, WorkerError> {
        self.retry("step", || self.inner.run_step(request)).await
    }
}
