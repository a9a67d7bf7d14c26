//! Exponential backoff for transient broker failures.

use std::future::Future;
use std::time::Duration;

use crate::broker::BrokerResult;
use crate::models::config::WorkerSettings;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.retry_base_ms),
            Duration::from_millis(settings.retry_max_ms),
        )
    }

    /// Delay before retry number `attempt` (zero-based), doubling up to the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Runs `op` until it succeeds or `retries` extra attempts have failed.
///
/// The last error is returned once the budget is spent.
pub async fn retry_broker<T, F, Fut>(
    backoff: Backoff,
    retries: u32,
    operation: &str,
    mut op: F,
) -> BrokerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BrokerResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if attempt < retries => {
                let delay = backoff.delay(attempt);
                log::warn!(
                    "{operation} failed (attempt {}/{}): {error}; retrying in {delay:?}",
                    attempt + 1,
                    retries + 1
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}
