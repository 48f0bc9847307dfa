//! Backoff curves with jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ServiceRetryConfig;

/// Shape of the delay curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffType {
    /// `base * multiplier^(n-1)`
    #[default]
    Exponential,
    /// `base * n`
    Linear,
    /// `base`
    Fixed,
}

/// Delay before retry number `attempt` (1-based), capped at `max_delay_ms`.
/// With jitter enabled up to 10% is added on top of the capped value.
pub fn compute_delay(attempt: u32, config: &ServiceRetryConfig) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let base = config.base_delay_ms;
    let delay_ms = match config.backoff {
        BackoffType::Exponential => {
            let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
            let factor = config.multiplier.max(1.0).powi(exponent);
            let scaled = base as f64 * factor;
            if scaled.is_finite() && scaled < u64::MAX as f64 {
                scaled as u64
            } else {
                u64::MAX
            }
        }
        BackoffType::Linear => base.saturating_mul(u64::from(attempt)),
        BackoffType::Fixed => base,
    };
    let capped_delay = delay_ms.min(config.max_delay_ms);

    let jitter_range = capped_delay / 10;
    let jitter = if config.jitter && jitter_range > 0 {
        rand::thread_rng().gen_range(0..=jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}
