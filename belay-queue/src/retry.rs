//! Retry and failure policy.

use crate::error::JobError;
use crate::job::Job;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How far a failed job is pushed back before its next attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Backoff {
    /// `attempts^4` seconds plus `base`. Slow at first, steep later.
    Polynomial {
        #[serde(with = "humantime_serde")]
        base: Duration,
    },
    /// `initial * 2^(attempts - 1)`, capped at `max`.
    Exponential {
        #[serde(with = "humantime_serde")]
        initial: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
    /// Same delay every time.
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Polynomial {
            base: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Delay after the `attempts`-th failed attempt (1-based).
    pub fn delay(&self, attempts: u32) -> Duration {
        match self {
            Self::Polynomial { base } => {
                let secs = u64::from(attempts).saturating_pow(4);
                Duration::from_secs(secs).saturating_add(*base)
            }
            Self::Exponential { initial, max } => {
                let exponent = attempts.saturating_sub(1).min(63) as i32;
                let secs = initial.as_secs_f64() * 2_f64.powi(exponent);
                Duration::try_from_secs_f64(secs.min(max.as_secs_f64())).unwrap_or(*max)
            }
            Self::Fixed { delay } => *delay,
        }
    }
}

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Release the claim and make the job claimable again at `run_at`.
    Retry {
        /// Next earliest run time
        run_at: DateTime<Utc>,
    },
    /// Mark the job failed; it is never claimed again.
    Fail,
}

/// Retry budget and backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempt budget given to jobs that do not set their own
    pub max_attempts: u32,

    /// Backoff strategy
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 25,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Next run time after the `attempts`-th failure.
    pub fn next_run_at(&self, attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.backoff.delay(attempts))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Decide the fate of `job`, whose current attempt just failed with `error`.
    ///
    /// The job's own `max_attempts` is the budget; the attempt that just
    /// failed counts against it.
    pub fn disposition(&self, job: &Job, error: &JobError, now: DateTime<Utc>) -> Disposition {
        if error.is_retryable() && job.can_retry() {
            Disposition::Retry {
                run_at: self.next_run_at(job.attempts + 1, now),
            }
        } else {
            Disposition::Fail
        }
    }
}
