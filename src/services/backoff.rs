use chrono::Duration;
use rand::Rng;

const BASE_DELAY_SECS: f64 = 2.0;
const MAX_DELAY_SECS: f64 = 300.0;
const JITTER: f64 = 0.2;

/// Upper bound on a transport-requested cooldown. Reports arrive over an
/// open HTTP surface, so the hint cannot be trusted to stay in timestamp
/// arithmetic range.
const MAX_RETRY_AFTER_SECS: f64 = 86_400.0;

/// Retry delay for a failed delivery attempt.
///
/// Exponential in the attempt count with ±20% uniform jitter, capped at
/// five minutes. When the transport asked for an explicit cooldown
/// (`retry_after`, a rate-limit signal) that value is a floor: we never
/// retry sooner than the transport told us to.
pub fn retry_delay(attempts: i32, retry_after_seconds: Option<u64>) -> Duration {
    let exp = BASE_DELAY_SECS * 2f64.powi(attempts.saturating_sub(1).max(0));
    let capped = exp.min(MAX_DELAY_SECS);
    let factor = rand::rng().random_range(1.0 - JITTER..=1.0 + JITTER);
    let mut secs = capped * factor;

    if let Some(floor) = retry_after_seconds {
        secs = secs.max((floor as f64).min(MAX_RETRY_AFTER_SECS));
    }

    Duration::milliseconds((secs * 1000.0) as i64)
}
