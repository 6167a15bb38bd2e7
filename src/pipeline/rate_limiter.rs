use crate::app::ports::Clock;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

/// Enforces a minimum spacing between consecutive requests.
///
/// The limiter is an explicit value owned by the orchestrator for one run and
/// lent to the extractor; nothing about it is process-wide.
pub struct RateLimiter {
    delay: Duration,
    clock: Arc<dyn Clock>,
    // time the previous `wait` returned
    last_call: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(delay: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            delay,
            clock,
            last_call: Mutex::new(None),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Suspends until at least `delay` has passed since the previous call
    /// returned. The first call returns immediately.
    pub async fn wait(&self) {
        let now = self.clock.now();
        let remaining = self
            .last()
            .map(|last| (last + self.delay).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        if !remaining.is_zero() {
            debug!("Rate limiter sleeping {:.3}s", remaining.as_secs_f64());
            self.clock.sleep(remaining).await;
        }

        let returned_at = self.clock.now();
        *self.last_call.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(returned_at);
    }

    fn last(&self) -> Option<Instant> {
        *self.last_call.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
