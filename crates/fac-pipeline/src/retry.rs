//! Bounded retry with exponential backoff
//!
//! Each request is driven by a small state machine:
//!
//! ```text
//! Pending -> InFlight -> Succeeded
//!               |
//!               +-> Retrying -> InFlight ...   (transient failure, attempts left)
//!               +-> Failed                     (permanent failure or attempts exhausted)
//! ```
//!
//! [`RetryMachine`] only tracks state, attempt count and backoff; it does not
//! sleep. [`with_retry`] drives it on the tokio runtime.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry limits for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before attempt `failed_attempt + 1`: `base * 2^(failed_attempt - 1)`, capped
    pub fn backoff_for(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// State of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    InFlight { attempt: u32 },
    Retrying { attempt: u32, backoff: Duration },
    Succeeded { attempts: u32 },
    Failed { attempts: u32 },
}

/// Failure of a single attempt, classified for retry purposes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub transient: bool,
    pub message: String,
}

impl AttemptError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            transient: true,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            transient: false,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Final failure after the machine reached `Failed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: AttemptError,
}

impl std::fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.last_error.transient {
            write!(f, "{} (gave up after {} attempts)", self.last_error, self.attempts)
        } else {
            write!(f, "{} (not retryable)", self.last_error)
        }
    }
}

/// Bounded-attempt state machine
#[derive(Debug, Clone)]
pub struct RetryMachine {
    policy: RetryPolicy,
    state: AttemptState,
    attempt: u32,
    backoff: Duration,
}

impl RetryMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: AttemptState::Pending,
            attempt: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn state(&self) -> &AttemptState {
        &self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// Move to `InFlight`; returns the 1-based attempt number
    ///
    /// Returns `None` when the machine is already terminal or in flight.
    pub fn begin(&mut self) -> Option<u32> {
        match self.state {
            AttemptState::Pending | AttemptState::Retrying { .. } => {
                self.attempt += 1;
                self.state = AttemptState::InFlight {
                    attempt: self.attempt,
                };
                Some(self.attempt)
            },
            _ => None,
        }
    }

    pub fn succeed(&mut self) {
        if let AttemptState::InFlight { attempt } = self.state {
            self.state = AttemptState::Succeeded { attempts: attempt };
        }
    }

    /// Record a failed attempt; returns the backoff to wait when retrying
    pub fn fail(&mut self, error: &AttemptError) -> Option<Duration> {
        let AttemptState::InFlight { attempt } = self.state else {
            return None;
        };

        if error.transient && attempt < self.policy.max_attempts {
            self.backoff = self.policy.backoff_for(attempt);
            self.state = AttemptState::Retrying {
                attempt,
                backoff: self.backoff,
            };
            Some(self.backoff)
        } else {
            self.state = AttemptState::Failed { attempts: attempt };
            None
        }
    }
}

/// Run `op` until it succeeds, fails permanently or runs out of attempts
///
/// `op` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut op: F,
) -> std::result::Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, AttemptError>>,
{
    let mut machine = RetryMachine::new(policy);

    while let Some(attempt) = machine.begin() {
        match op(attempt).await {
            Ok(value) => {
                machine.succeed();
                if attempt > 1 {
                    debug!(label, attempt, "Request succeeded after retry");
                }
                return Ok(value);
            },
            Err(error) => match machine.fail(&error) {
                Some(backoff) => {
                    warn!(
                        label,
                        attempt,
                        max_attempts = policy.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                },
                None => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: error,
                    });
                },
            },
        }
    }

    // begin() only returns None from a terminal state, which both arms above return from
    Err(RetryExhausted {
        attempts: machine.attempt(),
        last_error: AttemptError::permanent(format!("{label}: retry machine stopped unexpectedly")),
    })
}
