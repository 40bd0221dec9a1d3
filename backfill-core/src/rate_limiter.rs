//! Pacing rate limiter with a throttling cooldown.
//!
//! Every permit is spaced at least `delay` after the previous one. When the
//! provider answers HTTP 429 the limiter enters `Cooldown` and withholds all
//! permits until the full cooldown has elapsed, then resumes pacing.
//!
//! ```text
//! Idle ──acquire──▶ Paced ──throttled──▶ Cooldown ──(cooldown elapsed)──▶ Paced
//! ```

use crate::clock::Clock;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Default wait after a throttling response.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// State of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterState {
    /// No permit issued yet.
    Idle,
    /// Permits are spaced by the pacing delay.
    Paced,
    /// Throttled: no permits until `until`.
    Cooldown { until: Instant },
}

/// Spacing that keeps "at most `max_requests` per `period`" while never going
/// below the configured minimum `delay`.
pub fn effective_delay(max_requests: u32, period: Duration, delay: Duration) -> Duration {
    let derived = if max_requests == 0 {
        period
    } else {
        period / max_requests
    };
    derived.max(delay)
}

/// Single-threaded pacing limiter. Waits block the caller through the [`Clock`].
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    delay: Duration,
    cooldown: Duration,
    state: LimiterState,
    last_permit: Option<Instant>,
    permits_issued: u64,
    cooldowns_entered: u32,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, delay: Duration, cooldown: Duration) -> Self {
        Self {
            clock,
            delay,
            cooldown,
            state: LimiterState::Idle,
            last_permit: None,
            permits_issued: 0,
            cooldowns_entered: 0,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Current state. A cooldown whose deadline has passed still reads as
    /// `Cooldown` until the next `acquire` observes it.
    pub fn state(&self) -> LimiterState {
        self.state
    }

    pub fn permits_issued(&self) -> u64 {
        self.permits_issued
    }

    pub fn cooldowns_entered(&self) -> u32 {
        self.cooldowns_entered
    }

    /// Block until a request may be sent. Returns the total time waited.
    pub fn acquire(&mut self) -> Duration {
        let mut waited = Duration::ZERO;

        if let LimiterState::Cooldown { until } = self.state {
            let now = self.clock.now();
            if now < until {
                let remaining = until - now;
                tracing::debug!(remaining_secs = remaining.as_secs_f64(), "waiting out cooldown");
                self.clock.sleep(remaining);
                waited += remaining;
            }
            self.state = LimiterState::Paced;
        }

        if let Some(last) = self.last_permit {
            let earliest = last + self.delay;
            let now = self.clock.now();
            if now < earliest {
                let gap = earliest - now;
                self.clock.sleep(gap);
                waited += gap;
            }
        }

        self.last_permit = Some(self.clock.now());
        self.state = LimiterState::Paced;
        self.permits_issued += 1;
        waited
    }

    /// Record a throttling response. Starts (or extends) a full cooldown.
    pub fn throttled(&mut self) {
        let until = self.clock.now() + self.cooldown;
        let until = match self.state {
            LimiterState::Cooldown { until: existing } => existing.max(until),
            _ => until,
        };
        self.state = LimiterState::Cooldown { until };
        self.cooldowns_entered += 1;
        tracing::warn!(
            cooldown_secs = self.cooldown.as_secs_f64(),
            "provider throttled requests, cooling down"
        );
    }

    /// Remaining cooldown time (zero when not cooling down).
    pub fn remaining_cooldown(&self) -> Duration {
        match self.state {
            LimiterState::Cooldown { until } => until.saturating_duration_since(self.clock.now()),
            _ => Duration::ZERO,
        }
    }
}
