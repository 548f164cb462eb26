//! Retry with exponential backoff, shared by fetch, annotate and write

use std::time::Duration;

use rand::Rng;

use crate::cancel::CancelToken;
use crate::error::ServiceError;

/// Result of a single attempt, as seen by [`retry_with_backoff`].
#[derive(Debug)]
pub enum Outcome<T, E> {
    Ok(T),
    /// Worth another attempt after a backoff
    Retryable(E),
    /// Give up immediately
    Fatal(E),
}

impl<T> From<Result<T, ServiceError>> for Outcome<T, ServiceError> {
    fn from(result: Result<T, ServiceError>) -> Self {
        match result {
            Ok(v) => Self::Ok(v),
            Err(e) if e.is_retryable() => Self::Retryable(e),
            Err(e) => Self::Fatal(e),
        }
    }
}

/// Errors that may carry a server-provided delay
pub trait RetryHint {
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryHint for ServiceError {
    fn retry_after(&self) -> Option<Duration> {
        ServiceError::retry_after(self)
    }
}

/// Why [`retry_with_backoff`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error ended the loop
    Fatal(E),
    /// Cancelled while waiting between attempts
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying error, if the loop ended on one
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Fatal(e) => Some(e),
            Self::Cancelled => None,
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted { attempts, last } => {
                write!(f, "gave up after {attempts} attempts: {last}")
            }
            Self::Fatal(e) => write!(f, "{e}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl<E: std::fmt::Debug + std::fmt::Display> std::error::Error for RetryError<E> {}

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    /// Upper bound for computed delays and server hints
    pub max_delay: Duration,
    /// Randomize each delay within `[delay/2, delay]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy without any waiting between attempts
    pub fn no_delay(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Exponential backoff for retry number `attempt` (1-based): base, 2·base, 4·base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }
        let delay = self.backoff(attempt);
        if self.jitter && !delay.is_zero() {
            let half = delay / 2;
            let extra = rand::rng().random_range(0..=half.as_millis() as u64);
            half + Duration::from_millis(extra)
        } else {
            delay
        }
    }
}

/// Run `attempt_fn` until it succeeds, fails fatally, or the retry budget runs out.
///
/// `attempt_fn` receives the 0-based attempt number. Sleeps between attempts
/// honor the error's [`RetryHint`] and wake early on cancellation.
pub fn retry_with_backoff<T, E>(
    label: &str,
    policy: &RetryPolicy,
    cancel: &CancelToken,
    mut attempt_fn: impl FnMut(u32) -> Outcome<T, E>,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display + RetryHint,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match attempt_fn(attempt) {
            Outcome::Ok(v) => return Ok(v),
            Outcome::Retryable(e) if attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt, e.retry_after());
                log::warn!(
                    "{label}: attempt {attempt}/{} failed: {e}, retrying in {:.1}s",
                    policy.max_retries + 1,
                    delay.as_secs_f64()
                );
                if !cancel.sleep(delay) {
                    return Err(RetryError::Cancelled);
                }
            }
            Outcome::Retryable(e) => {
                log::error!("{label}: failed permanently after {} attempts: {e}", attempt + 1);
                return Err(RetryError::Exhausted {
                    attempts: attempt + 1,
                    last: e,
                });
            }
            Outcome::Fatal(e) => {
                log::error!("{label}: failed permanently: {e}");
                return Err(RetryError::Fatal(e));
            }
        }
    }
}
