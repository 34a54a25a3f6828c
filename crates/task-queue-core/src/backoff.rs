//! Retry delay arithmetic.
//!
//! [`compute_delay`] turns a task's backoff policy into the countdown of the
//! next retry. [`retry_over_time`] is the generic retry loop used for
//! operations that must survive transient failures, such as broker setup.

use crate::policy::Backoff;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Source of randomness for jittered delays
pub trait JitterSource: Send {
    /// Uniform integer in `[0, upper)`. Only called with `upper > 0`.
    fn below(&mut self, upper: u64) -> u64;
}

/// Jitter drawn from the thread-local RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn below(&mut self, upper: u64) -> u64 {
        rand::thread_rng().gen_range(0..upper)
    }
}

/// `factor * 2^retries` capped at `maximum`, optionally replaced by a uniform
/// draw from `[0, capped)`.
pub fn exponential_backoff_interval(
    factor: u64,
    retries: u32,
    maximum: u64,
    full_jitter: bool,
    jitter: &mut dyn JitterSource,
) -> u64 {
    let exp = 2u64.checked_pow(retries).unwrap_or(u64::MAX);
    let countdown = factor.saturating_mul(exp).min(maximum);

    if full_jitter && countdown > 0 {
        jitter.below(countdown)
    } else {
        countdown
    }
}

/// Countdown for the retry following `attempt` prior retries, or `None` when
/// backoff is disabled and the caller should use its default delay.
pub fn compute_delay(
    attempt: u32,
    backoff: Backoff,
    backoff_max: u64,
    jitter_enabled: bool,
    jitter: &mut dyn JitterSource,
) -> Option<u64> {
    let factor = backoff.multiplier()?;
    Some(exponential_backoff_interval(
        factor,
        attempt,
        backoff_max,
        jitter_enabled,
        jitter,
    ))
}

/// Retry ceiling and sleep intervals for [`retry_over_time`]
#[derive(Debug, Clone, PartialEq)]
pub struct RetrySchedule {
    /// Retries after the first attempt; `None` retries forever
    pub max_retries: Option<u32>,
    pub interval_start: Duration,
    pub interval_max: Duration,
}

impl RetrySchedule {
    pub fn new(max_retries: Option<u32>, interval_start: Duration, interval_max: Duration) -> Self {
        RetrySchedule {
            max_retries,
            interval_start,
            interval_max,
        }
    }

    pub fn intervals(&self) -> Intervals {
        Intervals {
            next: self.interval_start.min(self.interval_max),
            max: self.interval_max,
        }
    }
}

/// Endless sequence of doubling intervals, pinned at the maximum once reached
#[derive(Debug, Clone)]
pub struct Intervals {
    next: Duration,
    max: Duration,
}

impl Iterator for Intervals {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let current = self.next;
        self.next = current.saturating_mul(2).min(self.max);
        Some(current)
    }
}

/// Run `op` until it succeeds, retrying errors accepted by `is_retryable`.
///
/// After each retryable failure `errback` receives the error, the interval
/// sequence and the zero-based retry index, and returns how long to sleep
/// before the next try. Once `max_retries` retries have failed, or on an error
/// `is_retryable` rejects, the last error is returned.
pub async fn retry_over_time<T, E, F, Fut, P, B>(
    mut op: F,
    is_retryable: P,
    mut errback: B,
    schedule: &RetrySchedule,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    B: FnMut(&E, &mut Intervals, u32) -> Duration,
{
    let mut intervals = schedule.intervals();
    let mut retries: u32 = 0;

    loop {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_retryable(&err) {
            return Err(err);
        }
        if schedule.max_retries.map_or(false, |max| retries >= max) {
            return Err(err);
        }

        let sleep_for = errback(&err, &mut intervals, retries);
        if !sleep_for.is_zero() {
            tokio::time::sleep(sleep_for).await;
        }
        retries += 1;
    }
}
