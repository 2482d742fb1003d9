// Reconnection backoff policy
use std::time::Duration;

/// Exponential backoff with a delay cap and an attempt cap.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            multiplier: multiplier.max(1.0),
            max_delay,
            max_attempts,
        }
    }

    /// Delay before reconnection attempt `attempt` (1-based).
    /// `None` once the attempt cap is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Some(Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 2.0, Duration::from_secs(30), 5)
    }
}
