use std::{future::Future, time::Duration};

use {
    relay_channels::SinkError,
    relay_config::DeliveryConfig,
    tokio_util::sync::CancellationToken,
    tracing::warn,
};

#[cfg(feature = "metrics")]
use relay_metrics::{counter, forwarding as fwd_metrics};

use crate::error::{Error, Result};

/// Capped exponential backoff for sink calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryConfig::default())
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base: config.base_backoff(),
            max: config.max_backoff(),
        }
    }

    /// Delay before retry number `attempt + 1` (`attempt` starts at 0).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        std::cmp::min(
            self.base.saturating_mul(2u32.saturating_pow(attempt)),
            self.max,
        )
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out.
    ///
    /// Only [`SinkError::Transient`] is retried. A `retry_after` hint from the
    /// sink stretches the delay. Cancellation interrupts the wait, never the
    /// call itself.
    pub async fn run<T, F, Fut>(&self, op_name: &str, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, SinkError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            attempt += 1;
            if !err.is_transient() || attempt >= self.max_attempts {
                return Err(err.into());
            }

            let delay = self
                .backoff(attempt - 1)
                .max(err.retry_after().unwrap_or_default());
            warn!(
                op = op_name,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "sink call failed, retrying"
            );
            #[cfg(feature = "metrics")]
            counter!(fwd_metrics::SINK_RETRIES_TOTAL).increment(1);

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = tokio::time::sleep(delay) => {},
            }
        }
    }
}
