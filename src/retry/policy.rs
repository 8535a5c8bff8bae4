use std::time::Duration;

/// How hard `ensure_connected` tries before reporting the gateway down.
///
/// Only unreachable sockets and handshake timeouts are retried; a rejected
/// credential fails on the first attempt whatever the policy says.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Dial + handshake attempts per `ensure_connected`, counting the first.
    pub max_attempts: u32,
    /// Pause before the second attempt. Doubles after each failure.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the pause randomized either way.
    pub jitter_ratio: f64,
}

impl RetryPolicy {
    /// Three attempts, 250 ms then 500 ms apart, pauses capped at 2 s.
    pub fn connect_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            jitter_ratio: 0.20,
        }
    }

    /// Dial once. Tests use this against the mock gateway.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_ratio: 0.0,
        }
    }

    /// Pause before retry `retry_index` (1 = the second attempt).
    pub fn backoff_delay(&self, retry_index: u32) -> Duration {
        let doublings = retry_index.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1 << doublings)
            .min(self.max_delay)
    }

    /// Spread `delay` uniformly over `delay * (1 ± jitter_ratio)`.
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio.is_nan() || ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + ratio * (2.0 * rand::random::<f64>() - 1.0);
        delay.mul_f64(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::connect_default()
    }
}
