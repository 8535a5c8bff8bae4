mod policy;

pub use policy::RetryPolicy;

use crate::error::ConnectError;
use std::future::Future;
use std::time::Duration;

/// Classification of transient retry causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The socket could not be opened.
    Unreachable,
    /// The gateway went quiet mid-handshake.
    HandshakeTimeout,
}

impl RetryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreachable => "unreachable",
            Self::HandshakeTimeout => "handshake_timeout",
        }
    }
}

/// Retry decision for one attempt result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { reason: RetryReason },
    DoNotRetry,
}

/// Metadata for one scheduled retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub delay: Duration,
    pub reason: RetryReason,
}

/// Classify a connect attempt into retry/no-retry.
///
/// Transport failures and silent gateways are retried. A rejection or an identity
/// problem means the configuration is wrong and must reach the caller.
pub fn classify_connect_error<T>(result: &Result<T, ConnectError>) -> RetryDecision {
    match result {
        Err(ConnectError::Unreachable(_)) => RetryDecision::Retry {
            reason: RetryReason::Unreachable,
        },
        Err(ConnectError::HandshakeTimeout(_)) => RetryDecision::Retry {
            reason: RetryReason::HandshakeTimeout,
        },
        _ => RetryDecision::DoNotRetry,
    }
}

/// Retry an async operation with backoff according to `policy`.
///
/// - `operation(attempt)` is called with a 1-based attempt number.
/// - `classify(result)` decides whether to retry.
/// - `on_retry(info)` is called right before sleeping.
pub async fn retry_with_backoff<T, E, Op, Fut, Classify, OnRetry>(
    policy: &RetryPolicy,
    mut operation: Op,
    mut classify: Classify,
    mut on_retry: OnRetry,
) -> Result<T, E>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Classify: FnMut(&Result<T, E>) -> RetryDecision,
    OnRetry: FnMut(RetryAttempt),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let result = operation(attempt).await;
        if result.is_ok() || attempt >= max_attempts {
            return result;
        }
        let RetryDecision::Retry { reason } = classify(&result) else {
            return result;
        };
        let delay = policy.with_jitter(policy.backoff_delay(attempt));
        on_retry(RetryAttempt {
            attempt,
            delay,
            reason,
        });
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
