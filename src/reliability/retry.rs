use crate::app::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff for one payload.
///
/// Delay for retry `n` (0-based) is `min_backoff * 2^n` capped at
/// `max_backoff`. Jitter scales it by a factor in `[0.5, 1.5)` and the result
/// is clamped back into `[min_backoff, max_backoff]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    retries: u32,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, retries: 0 }
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// True once `max_retries` retries have been used. Never true for 0.
    pub fn exhausted(&self) -> bool {
        self.config.max_retries != 0 && self.retries >= self.config.max_retries
    }

    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let min = self.config.min_backoff;
        let max = self.config.max_backoff;

        let base = 2_u32
            .checked_pow(attempt)
            .and_then(|factor| min.checked_mul(factor))
            .map_or(max, |delay| delay.min(max));

        if self.config.jitter {
            apply_jitter(base).clamp(min, max)
        } else {
            base
        }
    }

    /// Consumes one retry and returns how long to wait before it. A server
    /// hint replaces the computed delay but is held to the same bounds.
    pub fn next_delay(&mut self, hint: Option<Duration>) -> Duration {
        let delay = match hint {
            Some(hint) => hint.clamp(self.config.min_backoff, self.config.max_backoff),
            None => self.calculate_delay(self.retries),
        };
        self.retries = self.retries.saturating_add(1);
        delay
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let mut rng = rand::rng();
    let jitter_factor = rng.random_range(0.5..1.5); // ±50% jitter
    delay.mul_f64(jitter_factor)
}
