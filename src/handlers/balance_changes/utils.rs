//! Utility Functions
//!
//! Common helpers shared by the balance change modules: transport retry,
//! timestamp conversion and decimal parsing.

use bigdecimal::BigDecimal;
use sqlx::types::chrono::{DateTime, Utc};
use std::future::Future;
use std::str::FromStr;
use tokio::time::{Duration, sleep};

use super::error::{LedgerError, LedgerResult};

const MAX_TRANSPORT_RETRIES: u32 = 3;
const BASE_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Check if an error is a transient transport/network error that should be retried
pub fn is_transport_error(err_debug: &str) -> bool {
    err_debug.contains("TransportError")
        || err_debug.contains("SendError")
        || err_debug.contains("DispatchGone")
        || err_debug.contains("sending payload")
        || err_debug.contains("error sending request")
        || err_debug.contains("connection")
        || err_debug.contains("timed out")
}

/// Backoff schedule for in-place retries: `base_delay * 2^(attempt-1)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_TRANSPORT_RETRIES,
            base_delay: BASE_RETRY_DELAY,
        }
    }
}

/// Retry an async operation while `is_retryable` holds, with exponential backoff.
///
/// With the default policy this retries up to 3 times with delays of 200ms, 400ms, 800ms.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    label: &str,
    policy: RetryPolicy,
    is_retryable: R,
    mut make_call: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        match make_call().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < policy.max_retries && is_retryable(&e) => {
                attempt += 1;
                let delay = policy.base_delay * 2u32.pow(attempt - 1);
                log::warn!(
                    "{}: transport error, retrying in {}ms (attempt {}/{})",
                    label,
                    delay.as_millis(),
                    attempt + 1,
                    policy.max_retries + 1
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Retry a raw RPC client call on transient transport errors.
/// Non-transport errors are returned immediately without retrying.
pub async fn with_transport_retry<T, E, F, Fut>(label: &str, make_call: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    retry_with_backoff(
        label,
        RetryPolicy::default(),
        |e: &E| is_transport_error(&format!("{:?}", e)),
        make_call,
    )
    .await
}

/// Retry a ledger operation while it fails with [`LedgerError::RpcUnavailable`].
pub async fn with_ledger_retry<T, F, Fut>(
    label: &str,
    policy: RetryPolicy,
    make_call: F,
) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    retry_with_backoff(label, policy, LedgerError::is_retryable, make_call).await
}

/// Convert NEAR block timestamp (nanoseconds) to DateTime<Utc>
///
/// Falls back to the current time if the value is out of range.
pub fn block_timestamp_to_datetime(timestamp_nanos: i64) -> DateTime<Utc> {
    let secs = timestamp_nanos / 1_000_000_000;
    let nsecs = (timestamp_nanos % 1_000_000_000) as u32;
    DateTime::from_timestamp(secs, nsecs).unwrap_or_else(Utc::now)
}

/// Parse a raw integer balance string as returned by view calls.
pub fn parse_balance(raw: &str) -> LedgerResult<BigDecimal> {
    BigDecimal::from_str(raw.trim())
        .map_err(|e| LedgerError::Decode(format!("invalid balance '{}': {}", raw, e)))
}
