/// Delay used to coalesce bursts of region changes into one batch.
pub const SHORT_DELAY: f64 = 0.1;
/// Settling window after session start.
pub const LONG_DELAY: f64 = 1.0;

/// Coalesces rapid successive triggers into a single firing.
///
/// Times are world seconds supplied by the caller; the timer never reads a
/// clock itself. Every trigger pushes the deadline out, and a poll that finds
/// the opposite operation still running re-arms instead of firing.
#[derive(Debug, Clone)]
pub struct Debounce {
    delay: f64,
    armed_at: Option<f64>,
    fired: u64,
}

impl Debounce {
    pub fn new(delay: f64) -> Self {
        Self {
            delay,
            armed_at: None,
            fired: 0,
        }
    }

    /// Arm the timer, or push an armed timer's deadline out to `now + delay`.
    pub fn trigger(&mut self, now: f64) {
        self.armed_at = Some(now);
    }

    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    /// Returns true exactly once per burst: when armed, the delay has passed
    /// since the last trigger, and nothing blocks it. A blocked poll re-arms.
    pub fn poll(&mut self, now: f64, blocked: bool) -> bool {
        let Some(armed_at) = self.armed_at else {
            return false;
        };
        if now - armed_at < self.delay {
            return false;
        }
        if blocked {
            tracing::trace!(now, "debounce blocked, re-arming");
            self.armed_at = Some(now);
            return false;
        }
        self.armed_at = None;
        self.fired += 1;
        true
    }

    pub fn cancel(&mut self) {
        self.armed_at = None;
    }

    /// How many times the timer has fired.
    pub fn fired(&self) -> u64 {
        self.fired
    }
}

impl Default for Debounce {
    fn default() -> Self {
        Self::new(SHORT_DELAY)
    }
}
