//! Exponential backoff for transient delivery failures.

use cadence_core::RetryConfig;
use chrono::Duration;
use rand::Rng;

/// Delay before the next attempt, given the number of consecutive failures
/// so far (1 = first failure just happened). Doubles per failure up to
/// `max_attempts` doublings, capped at `max_backoff_secs`, with up to 10%
/// jitter when enabled.
pub fn delay(failure_count: u32, retry: &RetryConfig) -> Duration {
    let exponent = failure_count.saturating_sub(1).min(retry.max_attempts).min(20);
    let secs = retry
        .base_backoff_secs
        .saturating_mul(1u64 << exponent)
        .min(retry.max_backoff_secs);

    let secs = if retry.jitter && secs > 0 {
        let jitter = rand::thread_rng().gen_range(0..=secs / 10);
        (secs + jitter).min(retry.max_backoff_secs)
    } else {
        secs
    };
    Duration::seconds(secs as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            base_backoff_secs: 60,
            max_backoff_secs: 3600,
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let retry = no_jitter();
        assert_eq!(delay(1, &retry).num_seconds(), 60);
        assert_eq!(delay(2, &retry).num_seconds(), 120);
        assert_eq!(delay(3, &retry).num_seconds(), 240);
        assert_eq!(delay(4, &retry).num_seconds(), 480);
    }

    #[test]
    fn test_capped_at_max() {
        let retry = no_jitter();
        assert_eq!(delay(10, &retry).num_seconds(), 1920.min(3600));
        let long = RetryConfig {
            max_attempts: 30,
            ..no_jitter()
        };
        assert_eq!(delay(30, &long).num_seconds(), 3600);
    }

    #[test]
    fn test_jitter_stays_bounded() {
        let retry = RetryConfig {
            jitter: true,
            ..no_jitter()
        };
        for _ in 0..50 {
            let d = delay(2, &retry).num_seconds();
            assert!((120..=132).contains(&d));
        }
    }
}
