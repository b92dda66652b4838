
//! Bounded retry with exponential backoff and jitter for upstream calls
use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Run `operation` up to `config.max_attempts` times. Only transient errors
/// are retried; a permanent error surfaces on the first occurrence. Backoff
/// doubles from `backoff_base_ms` with full jitter and is capped at
/// `backoff_max_ms`.
pub async fn with_retry<T, F, Fut>(
    config: &UpstreamConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                let exp = config.backoff_base_ms.saturating_mul(1u64 << (attempt - 1));
                let capped = exp.min(config.backoff_max_ms);
                let delay = rand::thread_rng().gen_range(0..=capped);
                warn!(
                    "{} attempt {}/{} failed transiently: {} (retrying in {}ms)",
                    operation_name, attempt, attempts, e, delay
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error.unwrap_or_else(|| UpstreamError::Transient("retry budget exhausted".to_string())))
}
