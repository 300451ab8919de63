// Retry utilities

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

const BASE_DELAY_MS: u64 = 500;
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Delay before retry number `attempt` (1-based): doubles each time, capped at 30s
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = Duration::from_millis(BASE_DELAY_MS.saturating_mul(1u64 << exp));
    delay.min(MAX_DELAY)
}

/// Run `operation` until it succeeds or `max_retries` attempts have failed
pub async fn with_retry<F, Fut, T, E>(mut operation: F, max_retries: u32) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(error) => {
                attempt += 1;
                if attempt >= max_retries {
                    return Err(error);
                }

                let delay = backoff_delay(attempt);
                tracing::debug!(attempt, error = %error, retry_in_ms = delay.as_millis() as u64, "Retrying");
                sleep(delay).await;
            }
        }
    }
}
