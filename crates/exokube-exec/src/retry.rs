//! Constant-backoff retry for connection establishment

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::error::ExecError;

/// Retry budget for reaching a node that may still be booting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRetryPolicy {
    /// Total connection attempts, including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Constant delay between two attempts
    #[serde(default = "default_interval", with = "duration_secs")]
    pub interval: Duration,
}

fn default_max_attempts() -> u32 {
    6
}

fn default_interval() -> Duration {
    Duration::from_secs(10)
}

impl Default for ConnectRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval: default_interval(),
        }
    }
}

impl ConnectRetryPolicy {
    /// Upper bound of time spent sleeping between attempts
    #[must_use]
    pub fn total_backoff(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt budget is spent.
///
/// `notify` is called before every sleep with the error that triggered the
/// retry and the delay about to be waited.
///
/// # Errors
/// Returns the first non-retryable error, or `ExecError::RetriesExhausted`
/// once `policy.max_attempts` attempts have failed.
pub async fn retry_notify<F, Fut, T, N>(
    policy: &ConnectRetryPolicy,
    mut operation: F,
    mut notify: N,
) -> Result<T, ExecError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExecError>>,
    N: FnMut(&ExecError, Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= max_attempts {
                    error!(attempts = attempt, error = %e, "giving up on connection");
                    return Err(ExecError::RetriesExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }

                warn!(
                    attempt = attempt,
                    error = %e,
                    delay = ?policy.interval,
                    "connection attempt failed, retrying"
                );
                notify(&e, policy.interval);
                tokio::time::sleep(policy.interval).await;
            }
        }
    }
}

/// Serde adapter storing a `Duration` as whole seconds
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
