//! Backoff delay strategies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Floor applied to every computed delay, before and after jitter. Only a
/// configured maximum delay below it can go lower.
pub const MIN_DELAY: Duration = Duration::from_secs(1);

/// Named delay strategy.
///
/// Kept as data (not a closure) so policies stay comparable and serialisable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DelayStrategy {
    /// `min(cap, step * retry_count)`
    Linear { step: Duration, cap: Duration },
    /// `base * factor^(retry_count - 1)`
    Exponential { base: Duration, factor: f64 },
    /// Constant delay.
    Fixed { delay: Duration },
    /// Exponential, always jittered regardless of the policy's jitter flag.
    ExponentialWithJitter { base: Duration, factor: f64 },
}

impl Default for DelayStrategy {
    fn default() -> Self {
        Self::Linear {
            step: Duration::from_secs(2),
            cap: Duration::from_secs(60),
        }
    }
}

impl DelayStrategy {
    pub fn linear(step: Duration, cap: Duration) -> Self {
        Self::Linear { step, cap }
    }

    pub fn exponential(base: Duration, factor: f64) -> Self {
        Self::Exponential { base, factor }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Whether this strategy jitters even when the policy does not ask for it.
    pub fn forces_jitter(&self) -> bool {
        matches!(self, Self::ExponentialWithJitter { .. })
    }

    /// Un-jittered delay for the given retry count, floored at [`MIN_DELAY`].
    ///
    /// Non-decreasing in `retry_count` for every strategy with `factor >= 1`.
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let delay = match *self {
            Self::Linear { step, cap } => step.saturating_mul(retry_count).min(cap),
            Self::Exponential { base, factor } | Self::ExponentialWithJitter { base, factor } => {
                let exponent = retry_count.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = base.as_secs_f64() * factor.max(1.0).powi(exponent);
                duration_from_secs_saturating(secs)
            }
            Self::Fixed { delay } => delay,
        };
        delay.max(MIN_DELAY)
    }
}

/// Convert seconds to a `Duration`, saturating on overflow and NaN.
pub(crate) fn duration_from_secs_saturating(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}
