use std::time::Duration;

/// Delay schedule between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * factor^(retry - 1)`, capped at `max`
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
    },
}

/// How many times a page request is attempted and how long to wait in between.
/// Pure data: the extractor does the sleeping through its clock.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Longest delay the schedule ever produces. Server retry hints are capped to it.
    pub fn max_delay(&self) -> Duration {
        match &self.backoff {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { max, .. } => *max,
        }
    }

    /// Delay to wait before attempt number `attempt` (1-based). The first attempt
    /// never waits on the policy.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        match &self.backoff {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base, factor, max } => {
                let exponent = (attempt - 2) as i32;
                let secs = base.as_secs_f64() * factor.powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            crate::constants::DEFAULT_MAX_ATTEMPTS,
            Backoff::Fixed(Duration::from_secs_f64(
                crate::constants::DEFAULT_RATE_LIMIT_DELAY_SECS,
            )),
        )
    }
}
