use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::DataLayerError;
use crate::error::RemoteError;

/// Retry/backoff counters shared between the read path and the write queue.
#[derive(Debug, Default)]
pub(crate) struct RetryCounters {
    pub(crate) attempts: AtomicU64,
    pub(crate) backoffs: AtomicU64,
}

/// Bounded retry with linear backoff: after failed attempt `n` the next one starts `base_delay * n` later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    #[inline]
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Total wait performed when all `retries` attempts fail.
    pub fn worst_case_wait(&self, retries: u32) -> Duration {
        (1..retries.max(1)).map(|attempt| self.backoff(attempt)).sum()
    }

    /// Runs `operation` up to `retries` times (at least once). Rejections are not retried.
    pub(crate) async fn run<T, F, Fut>(
        &self,
        label: &str,
        retries: u32,
        mut operation: F,
        counters: &RetryCounters,
    ) -> Result<T, DataLayerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let retries = retries.max(1);
        let mut attempt = 1;

        loop {
            counters.attempts.fetch_add(1, Ordering::Relaxed);

            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        log::debug!("[{label}] succeeded on attempt {attempt}/{retries}");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                log::warn!("[{label}] attempt {attempt}/{retries} rejected: {err}");
                return Err(DataLayerError::RemoteRejected {
                    attempts: attempt,
                    source:   err,
                });
            }

            if attempt >= retries {
                log::warn!("[{label}] giving up after {attempt} attempt(s): {err}");
                return Err(DataLayerError::RetriesExhausted {
                    attempts: attempt,
                    source:   err,
                });
            }

            let delay = self.backoff(attempt);
            log::debug!("[{label}] attempt {attempt}/{retries} failed ({err}), next in {delay:?}");
            counters.backoffs.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
