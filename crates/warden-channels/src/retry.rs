//! Retry policy for failed deliveries: bounded exponential backoff with jitter.

use std::time::Duration;

use warden_core::config::NotifyConfig;

/// Jitter fraction applied to each delay (+0 … 10 %).
const JITTER_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per event, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay, before jitter.
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay to wait after `attempts` failed attempts (1-indexed), without jitter.
    ///
    /// `base * multiplier^(attempts-1)`, capped at `max_delay`.
    /// With base=1s: 1s → 2s → 4s → … → 60s.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// [`backoff`](Self::backoff) plus up to 10 % jitter so lanes retrying
    /// the same endpoint do not fire in lockstep.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base = self.backoff(attempts);
        base + jitter(base)
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&NotifyConfig::default())
    }
}

impl From<&NotifyConfig> for RetryPolicy {
    fn from(cfg: &NotifyConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms.max(cfg.base_delay_ms)),
            multiplier: 2.0,
        }
    }
}

/// Pseudo-random jitter in `[0, JITTER_FRACTION * base)`, derived from the
/// clock's sub-second nanos to avoid a rand dependency.
fn jitter(base: Duration) -> Duration {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let max_jitter = (base.as_nanos() as f64 * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(u64::from(nanos) % max_jitter)
}
