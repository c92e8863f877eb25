//! Retry policy and backoff computation used by the router's retry middleware.

use std::time::Duration;

/// Backoff settings for in-process retries of a failed message.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: u32,

    /// Delay before the first retry.
    pub initial_interval: Duration,

    /// Upper bound for any single delay.
    pub max_interval: Duration,

    /// Growth factor between consecutive delays. Values below 1 shrink the delays.
    pub multiplier: f64,

    /// Applies ±10% jitter to each delay so replicas failing on the same message spread out.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_millis(400),
            max_interval: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Calculates the delay before retry number `attempt` (0-indexed).
///
/// The base delay is `min(initial_interval * multiplier^attempt, max_interval)`. When
/// `config.jitter` is set a ±10% jitter is applied and the result is capped again.
pub fn calculate_retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base_delay_ms = base_delay_ms(config, attempt);
    if !config.jitter || base_delay_ms == 0 {
        return Duration::from_millis(base_delay_ms);
    }

    let jitter_range = (base_delay_ms as f64 * 0.1) as u64;
    if jitter_range == 0 {
        return Duration::from_millis(base_delay_ms);
    }

    use rand::Rng;
    let mut rng = rand::thread_rng();
    let jitter: i64 = rng.gen_range(-(jitter_range as i64)..=(jitter_range as i64));
    let final_delay_ms = (base_delay_ms as i64 + jitter).max(1) as u64;

    Duration::from_millis(final_delay_ms.min(config.max_interval.as_millis() as u64))
}

fn base_delay_ms(config: &RetryConfig, attempt: u32) -> u64 {
    let initial_ms = config.initial_interval.as_millis() as f64;
    let max_ms = config.max_interval.as_millis() as f64;

    // powi saturates to infinity, which `min` folds back to the cap
    let exponent = attempt.min(i32::MAX as u32) as i32;
    let delay_ms = (initial_ms * config.multiplier.powi(exponent)).min(max_ms);

    delay_ms as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial: Duration, max: Duration, multiplier: f64) -> RetryConfig {
        RetryConfig {
            initial_interval: initial,
            max_interval: max,
            multiplier,
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_service_policy() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_interval, Duration::from_millis(400));
        assert_eq!(config.max_interval, Duration::from_secs(1));
        assert_eq!(config.multiplier, 2.0);
    }

    #[test]
    fn retry_delay_grows_by_multiplier_until_capped() {
        let config = no_jitter(Duration::from_millis(400), Duration::from_secs(1), 2.0);

        assert_eq!(calculate_retry_delay(&config, 0), Duration::from_millis(400));
        assert_eq!(calculate_retry_delay(&config, 1), Duration::from_millis(800));
        assert_eq!(calculate_retry_delay(&config, 2), Duration::from_secs(1));
        assert_eq!(calculate_retry_delay(&config, 3), Duration::from_secs(1));
    }

    #[test]
    fn retry_delay_supports_fractional_multiplier() {
        let config = no_jitter(Duration::from_millis(100), Duration::from_secs(10), 1.5);

        assert_eq!(calculate_retry_delay(&config, 1), Duration::from_millis(150));
        assert_eq!(calculate_retry_delay(&config, 2), Duration::from_millis(225));
    }

    #[test]
    fn retry_delay_handles_large_attempt_numbers() {
        let config = no_jitter(Duration::from_secs(1), Duration::from_secs(60), 2.0);
        assert_eq!(calculate_retry_delay(&config, 10_000), Duration::from_secs(60));
    }

    #[test]
    fn retry_delay_with_jitter_stays_within_bounds() {
        let config = RetryConfig {
            initial_interval: Duration::from_secs(10),
            max_interval: Duration::from_secs(60),
            ..Default::default()
        };

        for _ in 0..100 {
            let delay = calculate_retry_delay(&config, 0);
            assert!(
                delay >= Duration::from_secs(9) && delay <= Duration::from_secs(11),
                "Delay {:?} out of expected range",
                delay
            );
        }
    }

    #[test]
    fn jitter_never_exceeds_the_cap() {
        let config = RetryConfig::default();
        for _ in 0..100 {
            assert!(calculate_retry_delay(&config, 5) <= config.max_interval);
        }
    }
}
