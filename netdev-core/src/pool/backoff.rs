//! Reconnect delays.

use std::time::Duration;

use rand::Rng;

use crate::settings::BackoffConfig;

/// Exponential backoff with jitter.
///
/// `delay = min(base * factor^attempt, cap) * (1 ± jitter)`, `attempt`
/// counting from zero.
pub fn delay(attempt: u32, config: &BackoffConfig) -> Duration {
    let exp = config.factor.powi(attempt.min(32) as i32);
    let raw = config.base.as_secs_f64() * exp;
    let capped = raw.min(config.cap.as_secs_f64());

    let jitter = config.jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };

    Duration::from_secs_f64((capped * factor).max(0.0))
}
