//! Exponential backoff with jitter (C5), wrapping provider calls.
//!
//! Ported from the original retry handler: only [`PerseptorError::is_retryable`]
//! errors are retried, server-supplied `retry_after` takes precedence over the
//! computed backoff, and the delay is capped at [`crate::config::RetryConfig::max_delay`].

use crate::config::RetryConfig;
use crate::error::PerseptorError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Runs `op`, retrying on retryable errors up to `cfg.max_retries` additional
/// times. Returns the last error if every attempt fails.
pub async fn with_retry<F, Fut, T>(cfg: &RetryConfig, op: F) -> Result<T, PerseptorError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, PerseptorError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < cfg.max_retries => {
                let delay = retry_after(&err).unwrap_or_else(|| backoff_delay(cfg, attempt));
                warn!(
                    attempt,
                    provider = err.provider().unwrap_or("unknown"),
                    delay_ms = delay.as_millis() as u64,
                    "retrying after retryable error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn retry_after(err: &PerseptorError) -> Option<Duration> {
    match err {
        PerseptorError::RateLimited {
            retry_after_secs: Some(secs),
            ..
        } => Some(Duration::from_secs_f64(secs.max(0.0))),
        _ => None,
    }
}

/// `min(base_delay * 2^attempt, max_delay) * (0.5 + random())`, same jitter
/// formula as the original `retry_handler.py`'s `delay *= 0.5 + random.random()`.
fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let exp = cfg.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = exp.min(cfg.max_delay.as_secs_f64());
    let jitter = 0.5 + rand::rng().random::<f64>();
    Duration::from_secs_f64(capped * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let cfg = RetryConfig::default();
        let result: Result<u32, PerseptorError> = with_retry(&cfg, || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let cfg = RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        };
        let attempts = AtomicU32::new(0);
        let result = with_retry(&cfg, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PerseptorError::Transient {
                        provider: Some("openai".into()),
                        message: "503".into(),
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_fatal() {
        let cfg = RetryConfig::default();
        let attempts = AtomicU32::new(0);
        let result: Result<(), PerseptorError> = with_retry(&cfg, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(PerseptorError::Fatal {
                    provider: None,
                    message: "bad request".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retries_then_returns_err() {
        let cfg = RetryConfig {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let attempts = AtomicU32::new(0);
        let result: Result<(), PerseptorError> = with_retry(&cfg, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                Err(PerseptorError::RateLimited {
                    provider: Some("anthropic".into()),
                    message: "429".into(),
                    retry_after_secs: Some(0.001),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
