//! Generic retry utilities.
//!
//! [`retry_with_linear_backoff`] bounds the number of attempts and is used
//! by the health gate. [`retry_until_deadline`] bounds wall-clock time and
//! is used when waiting for a started process to answer.

use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

/// Retry an operation up to `max_retries` times. The delay before retry `n`
/// (1-based) is `n * step`, so three attempts with a one second step wait
/// 1s then 2s. Attempts never overlap.
///
/// Total attempts = 1 + `max_retries`. Non-retryable errors are returned
/// immediately without further attempts.
pub async fn retry_with_linear_backoff<T, E, F, Fut, R>(
    max_retries: u32,
    step: Duration,
    description: &str,
    mut attempt_fn: F,
    mut is_retryable: R,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
    R: FnMut(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match attempt_fn().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if !is_retryable(&e) || attempt == max_retries {
                    return Err(e);
                }
                attempt += 1;
                let delay = step * attempt;
                warn!(
                    attempt,
                    max_retries,
                    delay_ms = delay.as_millis() as u64,
                    description,
                    error = %e,
                    "Attempt failed, retrying with backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Poll `attempt` every `poll_interval` until it succeeds or `timeout`
/// elapses. `abort_check` runs after every failed attempt; an `Err` from it
/// ends the wait at once, e.g. when the process being polled has exited.
pub async fn retry_until_deadline<T, F, Fut, A, AFut>(
    timeout: Duration,
    poll_interval: Duration,
    description: &str,
    mut attempt: F,
    mut abort_check: A,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    A: FnMut() -> AFut,
    AFut: std::future::Future<Output = Result<()>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let last_err = match attempt().await {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };
        debug!(attempts, description, error = %last_err, "not ready yet");

        abort_check().await?;

        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(last_err.context(format!(
                "Timeout {} after {:?} ({} attempts)",
                description, timeout, attempts
            )));
        }
        tokio::time::sleep(poll_interval.min(deadline - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result: Result<i32> = retry_until_deadline(
            Duration::from_secs(1),
            Duration::from_millis(10),
            "test op",
            || async { Ok(42) },
            || async { Ok(()) },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_times_out() {
        let result: Result<i32> = retry_until_deadline(
            Duration::from_millis(50),
            Duration::from_millis(10),
            "waiting for health endpoint",
            || async { anyhow::bail!("connection refused") },
            || async { Ok(()) },
        )
        .await;
        let err = format!("{:#}", result.unwrap_err());
        assert!(err.contains("Timeout"));
        assert!(err.contains("waiting for health endpoint"));
        assert!(err.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_abort_check_stops_early() {
        let result: Result<i32> = retry_until_deadline(
            Duration::from_secs(10),
            Duration::from_millis(10),
            "test op",
            || async { anyhow::bail!("fail") },
            || async { anyhow::bail!("process exited") },
        )
        .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("process exited"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_delays() {
        let start = tokio::time::Instant::now();
        let mut count = 0;
        let result: std::result::Result<i32, String> = retry_with_linear_backoff(
            2,
            Duration::from_secs(1),
            "test op",
            || {
                count += 1;
                let c = count;
                async move {
                    if c < 3 {
                        Err(format!("fail {}", c))
                    } else {
                        Ok(c)
                    }
                }
            },
            |_: &String| true,
        )
        .await;
        assert_eq!(result.unwrap(), 3);
        // 1s + 2s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_millis(3100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_exhausts_retries() {
        let mut count = 0;
        let result: std::result::Result<i32, String> = retry_with_linear_backoff(
            2,
            Duration::from_secs(1),
            "test op",
            || {
                count += 1;
                async { Err("always fails".to_string()) }
            },
            |_: &String| true,
        )
        .await;
        assert_eq!(result.unwrap_err(), "always fails");
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_linear_backoff_non_retryable_stops_early() {
        let mut count = 0;
        let result: std::result::Result<i32, String> = retry_with_linear_backoff(
            5,
            Duration::from_millis(1),
            "test op",
            || {
                count += 1;
                let c = count;
                async move { Err(format!("error {}", c)) }
            },
            |e: &String| e != "error 2",
        )
        .await;
        assert_eq!(result.unwrap_err(), "error 2");
        assert_eq!(count, 2);
    }
}
