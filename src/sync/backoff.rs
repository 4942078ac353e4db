//! Jittered exponential retry delay.

use std::time::Duration;

use rand::Rng;

/// Delay before the first retry, before jitter.
pub const BASE_DELAY_MS: u64 = 1_000;
/// Upper bound on any retry delay (five minutes).
pub const MAX_DELAY_MS: u64 = 300_000;
/// Jitter multiplier range, lower bound inclusive, upper bound exclusive.
pub const JITTER_RANGE: std::ops::Range<f64> = 1.0..1.5;

// 2^30 s already dwarfs the cap; keeps the float exponent bounded.
const MAX_EXPONENT: i32 = 30;

/// Retry delay for the given attempt number with a random jitter draw.
///
/// Attempts below 1 are treated as 1.
#[must_use]
pub fn compute_backoff_delay(attempt: i64) -> Duration {
    let jitter = rand::rng().random_range(JITTER_RANGE);
    backoff_delay_with_jitter(attempt, jitter)
}

/// Deterministic core of [`compute_backoff_delay`].
///
/// `jitter` is clamped into [`JITTER_RANGE`]; the cap applies after jitter.
#[must_use]
pub fn backoff_delay_with_jitter(attempt: i64, jitter: f64) -> Duration {
    let attempt = attempt.max(1);
    let exponent = i32::try_from(attempt - 1).map_or(MAX_EXPONENT, |e| e.min(MAX_EXPONENT));
    let jitter = if jitter.is_finite() {
        jitter.clamp(JITTER_RANGE.start, JITTER_RANGE.end)
    } else {
        JITTER_RANGE.start
    };

    #[allow(clippy::cast_precision_loss)]
    let raw = BASE_DELAY_MS as f64 * 2f64.powi(exponent) * jitter;

    #[allow(clippy::cast_precision_loss)]
    let capped = raw.min(MAX_DELAY_MS as f64);

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Duration::from_millis(capped.floor() as u64)
}
