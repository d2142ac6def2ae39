use crate::config::StreamSettings;
use std::time::Duration;

const BACKOFF_FACTOR: f64 = 1.5;

/// Reconnect timing: `delay = min(base × 1.5^attempt, max)`
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed cycles allowed before the feed is declared dead
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: 20,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        // Cap the exponent; 1.5^64 is already far beyond any sane max_delay
        let exp = BACKOFF_FACTOR.powi(attempt.min(64) as i32);
        Duration::from_secs_f64((base * exp).min(max))
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl From<&StreamSettings> for ReconnectPolicy {
    fn from(settings: &StreamSettings) -> Self {
        Self {
            base_delay: Duration::from_secs_f64(settings.reconnect_base_secs),
            max_delay: Duration::from_secs_f64(settings.reconnect_max_secs),
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}
