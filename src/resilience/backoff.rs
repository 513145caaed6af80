//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Un-jittered delay after failed attempt `attempt` (1-based).
pub fn base_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
    let delay = config.base_delay.as_secs_f64() * config.multiplier.powi(exponent);
    let capped = delay.min(config.max_delay.as_secs_f64());

    if capped.is_finite() {
        Duration::from_secs_f64(capped.max(0.0))
    } else {
        config.max_delay
    }
}

/// Scale `delay` by a uniform factor in `[1 - jitter, 1 + jitter]`, kept within `[0, max]`.
pub fn apply_jitter(delay: Duration, jitter_percent: f64, max: Duration) -> Duration {
    if jitter_percent <= 0.0 || delay.is_zero() {
        return delay.min(max);
    }

    let factor = rand::thread_rng().gen_range((1.0 - jitter_percent)..=(1.0 + jitter_percent));
    let jittered = (delay.as_secs_f64() * factor).clamp(0.0, max.as_secs_f64());
    Duration::from_secs_f64(jittered)
}

/// Delay to sleep after failed attempt `attempt`, jitter included.
pub fn calculate_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    apply_jitter(
        base_backoff(config, attempt),
        config.jitter_percent,
        config.max_delay,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(jitter: f64) -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_percent: jitter,
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let cfg = config(0.0);
        assert_eq!(calculate_backoff(&cfg, 1), Duration::from_millis(100));
        assert_eq!(calculate_backoff(&cfg, 2), Duration::from_millis(200));
        assert_eq!(calculate_backoff(&cfg, 4), Duration::from_millis(800));
        assert_eq!(calculate_backoff(&cfg, 5), Duration::from_secs(1));
        assert_eq!(calculate_backoff(&cfg, 30), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let cfg = config(0.5);
        for _ in 0..200 {
            let d = calculate_backoff(&cfg, 2);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_jitter_never_exceeds_max_delay() {
        let cfg = config(1.0);
        for _ in 0..200 {
            assert!(calculate_backoff(&cfg, 10) <= cfg.max_delay);
        }
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let mut cfg = config(0.0);
        cfg.multiplier = 10.0;
        assert_eq!(base_backoff(&cfg, u32::MAX), cfg.max_delay);
    }
}
