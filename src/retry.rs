//! Retry/backoff policy for provider requests.
//!
//! Rate limiting backs off exponentially; server errors and transport
//! failures back off linearly. Both share one attempt ceiling. Delays are a
//! pure function of (failure class, attempt) so they can be checked without
//! sleeping.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts per request, first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Why an attempt failed in a retryable way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// HTTP 429
    RateLimited,
    /// HTTP 5xx
    ServerError,
    /// Connect/timeout/body errors
    Transport,
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts()
    }

    /// Sleep before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, class: FailureClass, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match class {
            FailureClass::RateLimited => {
                let exponent = 2u64.saturating_pow(attempt - 1);
                self.base_delay_ms.saturating_mul(exponent)
            }
            FailureClass::ServerError | FailureClass::Transport => {
                self.base_delay_ms.saturating_mul(u64::from(attempt))
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Honour a provider `Retry-After` (seconds) when present, capped by the policy.
    pub fn delay_with_hint(
        &self,
        class: FailureClass,
        attempt: u32,
        retry_after: Option<&str>,
    ) -> Duration {
        if let Some(secs) = retry_after.and_then(|v| v.trim().parse::<u64>().ok()) {
            return Duration::from_millis(secs.saturating_mul(1_000).min(self.max_delay_ms));
        }
        self.delay_for(class, attempt)
    }
}

/// Result of one attempt inside `with_retry`.
pub enum Attempt<T> {
    Done(T),
    Retry {
        class: FailureClass,
        error: SyncError,
        retry_after: Option<String>,
    },
}

/// Run `attempt` until it is done, fails terminally, or the policy runs out.
///
/// Exhaustion yields `RetriesExhausted` carrying the last failure.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut attempt: F,
) -> Result<T, SyncError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Attempt<T>, SyncError>>,
{
    let attempts = policy.attempts();
    let mut n = 0;
    loop {
        n += 1;
        let (class, error, retry_after) = match attempt().await? {
            Attempt::Done(value) => return Ok(value),
            Attempt::Retry {
                class,
                error,
                retry_after,
            } => (class, error, retry_after),
        };

        if !policy.should_retry(n) {
            return Err(SyncError::RetriesExhausted {
                attempts,
                last_error: error.to_string(),
            });
        }
        let delay = policy.delay_with_hint(class, n, retry_after.as_deref());
        log::warn!(
            "{} retry {}/{} after {:?}: {} (sleep {:?})",
            label,
            n,
            attempts,
            class,
            error,
            delay
        );
        tokio::time::sleep(delay).await;
    }
}
