use {
    crate::domain::error::ChargeError,
    backon::{ExponentialBuilder, Retryable},
    std::{future::Future, time::Duration},
};

/// Bounded exponential backoff with jitter. Only `Transient` errors are retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts.saturating_sub(1))
            .with_jitter()
    }

    pub async fn run<T, F, Fut>(&self, operation: &str, f: F) -> Result<T, ChargeError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChargeError>>,
    {
        f.retry(self.backoff())
            .when(ChargeError::is_transient)
            .notify(|err: &ChargeError, delay: Duration| {
                tracing::warn!(operation, error = %err, ?delay, "transient failure, retrying");
            })
            .await
    }
}
