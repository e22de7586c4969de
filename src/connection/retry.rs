//! Generic retry helper every venue call goes through.

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde_json::Value;
use tracing::debug;

use super::manager::ConnectionManager;
use super::rate_limiter::RateLimiter;
use crate::error::ApiError;

/// Venue error codes that no amount of retrying will fix.
pub const FATAL_CODES: &[&str] = &[
    "InvalidToken",
    "AuthorizationRequired",
    "InsufficientBalance",
    "InvalidContractProposal",
    "ContractBuyValidationError",
];

/// How long a call keeps retrying.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// `None` retries until a fatal error
    pub max_elapsed: Option<Duration>,
    /// Bound on a single attempt; an expired attempt is retried
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn unbounded() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            max_elapsed: None,
            attempt_timeout: None,
        }
    }

    pub fn bounded(budget: Duration) -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(5),
            max_elapsed: Some(budget),
            attempt_timeout: None,
        }
    }

    pub fn with_attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_max_elapsed_time(self.max_elapsed)
            .build()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

/// Map a failure to permanent (codes in `fatal`, undecodable responses)
/// or transient (everything else).
pub fn classify(err: ApiError, fatal: &[&str]) -> backoff::Error<ApiError> {
    let permanent = match &err {
        ApiError::Venue { code, .. } => fatal.contains(&code.as_str()),
        ApiError::Decode(_) => true,
        _ => false,
    };
    if permanent {
        backoff::Error::permanent(err)
    } else {
        backoff::Error::transient(err)
    }
}

/// Send `payload`, retrying recoverable failures and reopening the
/// transport when it is down. Stops at once on a code in `fatal`.
///
/// With `pacing`, every attempt (retries included) waits for its own
/// limiter slot right before the request goes out.
pub async fn send_with_retry(
    conn: &ConnectionManager,
    payload: &Value,
    fatal: &[&str],
    policy: RetryPolicy,
    pacing: Option<&RateLimiter>,
) -> Result<Value, ApiError> {
    backoff::future::retry(policy.backoff(), move || async move {
        if !conn.is_open() {
            conn.init(false)
                .await
                .map_err(|e| backoff::Error::transient(ApiError::Transport(e.to_string())))?;
        }
        if let Some(limiter) = pacing {
            limiter.acquire().await;
        }
        let reply = match policy.attempt_timeout {
            Some(limit) => conn.request_timeout(payload.clone(), limit).await,
            None => conn.request(payload.clone()).await,
        };
        reply.map_err(|err| {
            debug!(connection = %conn.label(), error = %err, "Venue call failed");
            classify(err, fatal)
        })
    })
    .await
}
