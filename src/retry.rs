/// Bounded retry execution with exponential backoff for upstream calls
use log::debug;
use pingora_timeout::sleep;
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};

use crate::config::RetryPolicyConfig;
use crate::proxy::{CallError, UpstreamResponse};

/// Aggregated failure after every allowed attempt was spent (or the
/// deadline cut the loop short)
#[derive(Debug)]
pub struct RetryError {
    /// Attempts actually performed
    pub attempts: u32,
    /// The last failure observed
    pub last: CallError,
}

impl std::fmt::Display for RetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "upstream call failed after {} attempt(s): {}",
            self.attempts, self.last
        )
    }
}

impl std::error::Error for RetryError {}

/// Backoff delay before attempt `next_attempt` (1-based, >= 2), before
/// jitter: min(base_delay * multiplier^(next_attempt - 2), max_delay)
pub fn backoff_delay(policy: &RetryPolicyConfig, next_attempt: u32) -> Duration {
    let exponent = next_attempt.saturating_sub(2);
    let millis = policy.base_delay.as_millis() as f64 * policy.multiplier.powi(exponent as i32);
    let capped = millis.min(policy.max_delay.as_millis() as f64);
    Duration::from_millis(capped as u64)
}

/// Overall deadline budget for one dispatched request: the per-attempt
/// timeout summed across every configured attempt
pub fn deadline_budget(policy: &RetryPolicyConfig) -> Duration {
    policy.attempt_timeout.saturating_mul(policy.max_attempts)
}

fn jittered(delay: Duration) -> Duration {
    let max = delay.as_millis() as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max))
}

/// Execute an upstream call under a retry policy.
///
/// Only transport failures, timeouts and 5xx responses are retried; any
/// other response (4xx included) is returned as-is from the first attempt
/// that produced it. The loop never sleeps past `deadline`: when the next
/// backoff would cross it, the last observed failure is surfaced instead.
pub async fn execute<F, Fut>(
    policy: &RetryPolicyConfig,
    deadline: Instant,
    mut call: F,
) -> Result<UpstreamResponse, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<UpstreamResponse, CallError>>,
{
    let mut last = CallError::Timeout;

    for attempt in 1..=policy.max_attempts {
        match call(attempt).await {
            Ok(response) if response.is_server_error() => {
                debug!(
                    "Attempt {}/{} got {}",
                    attempt, policy.max_attempts, response.status
                );
                last = CallError::Status(response.status);
            }
            Ok(response) => return Ok(response),
            Err(e) => {
                debug!("Attempt {}/{} failed: {}", attempt, policy.max_attempts, e);
                last = e;
            }
        }

        if attempt == policy.max_attempts {
            break;
        }

        let mut delay = backoff_delay(policy, attempt + 1);
        if policy.jitter {
            delay = jittered(delay);
        }

        if Instant::now() + delay >= deadline {
            debug!("Deadline reached after {} attempt(s), stopping retries", attempt);
            return Err(RetryError { attempts: attempt, last });
        }

        sleep(delay).await;
    }

    Err(RetryError {
        attempts: policy.max_attempts,
        last,
    })
}
