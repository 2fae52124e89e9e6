//! Bounded exponential backoff shared by the fetcher and the upserter.

use crate::data::StoreError;
use crate::upstream::UpstreamError;
use crate::utils::fmt_duration;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time;
use tracing::warn;

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    Success(T),
    /// Worth retrying after a delay.
    Transient(E),
    /// Retrying cannot help.
    Fatal(E),
}

/// Errors that know whether they are retryable.
pub trait Classify {
    fn is_transient(&self) -> bool;
}

impl Classify for UpstreamError {
    fn is_transient(&self) -> bool {
        UpstreamError::is_transient(self)
    }
}

impl Classify for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

impl<T, E: Classify> Attempt<T, E> {
    pub fn classify(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Attempt::Success(value),
            Err(e) if e.is_transient() => Attempt::Transient(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("failed on attempt {attempt}: {error}")]
    Fatal { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } => *attempts,
            Self::Fatal { attempt, .. } => *attempt,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last, .. } => last,
            Self::Fatal { error, .. } => error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; at least 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each delay into `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before attempt `attempt + 1`, given `attempt` failures so far.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half = delay / 2;
        let extra_ms = rand::rng().random_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(extra_ms)
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number and must re-issue the
    /// identical request each time.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Attempt::Success(value) => return Ok(value),
                Attempt::Fatal(error) => return Err(RetryError::Fatal { attempt, error }),
                Attempt::Transient(last) if attempt >= max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last,
                    });
                }
                Attempt::Transient(error) => {
                    let delay = self.jittered(self.delay_for(attempt));
                    warn!(
                        operation = label,
                        attempt,
                        max_attempts,
                        delay = fmt_duration(delay),
                        error = %error,
                        "transient failure, backing off"
                    );
                    time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
