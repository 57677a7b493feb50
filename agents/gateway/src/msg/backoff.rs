//! Retry budget and backoff schedule.

use std::time::Duration;

use rand::Rng;

use smsgate_base::Settings;

/// Jitter applied around the computed delay, as a fraction of it.
const JITTER_FRACTION: f64 = 0.25;

/// Retry knobs derived from settings once at startup.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Base delay before the first retry.
    pub base: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Exponential growth factor.
    pub factor: f64,
    /// Attempt budget for normal messages.
    pub max_attempts: u32,
    /// Attempt budget for express messages.
    pub express_max_attempts: u32,
}

impl RetryPolicy {
    /// Build from the loaded settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base: settings.retry_min_delay,
            max_delay: settings.retry_max_delay,
            factor: settings.retry_factor,
            max_attempts: settings.max_attempts,
            express_max_attempts: settings.express_max_attempts,
        }
    }

    /// Attempt budget for a message of the given class.
    pub fn max_attempts_for(&self, express: bool) -> u32 {
        if express {
            self.express_max_attempts
        } else {
            self.max_attempts
        }
    }

    /// Delay before attempt `attempt + 1`, given that `attempt` (1-based)
    /// just failed. Express messages start from half the base delay.
    pub fn delay_after_attempt(&self, attempt: u32, express: bool) -> Duration {
        let base = if express {
            self.base.as_secs_f64() / 2.0
        } else {
            self.base.as_secs_f64()
        };
        let exponent = attempt.saturating_sub(1).min(32);
        let raw = base * self.factor.powi(exponent as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());

        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        let jittered = (capped * (1.0 + jitter)).max(0.0);
        Duration::from_secs_f64(jittered.min(self.max_delay.as_secs_f64()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(15),
            max_delay: Duration::from_secs(30 * 60),
            factor: 2.0,
            max_attempts: 3,
            express_max_attempts: 5,
        }
    }

    #[test]
    fn attempt_budget_by_class() {
        let p = policy();
        assert_eq!(p.max_attempts_for(false), 3);
        assert_eq!(p.max_attempts_for(true), 5);
    }

    #[test]
    fn delay_grows_and_stays_within_jitter_band() {
        let p = policy();
        for (attempt, nominal) in [(1u32, 15.0f64), (2, 30.0), (3, 60.0)] {
            for _ in 0..50 {
                let d = p.delay_after_attempt(attempt, false).as_secs_f64();
                assert!(d >= nominal * 0.75 - 1e-6, "attempt {attempt}: {d} too small");
                assert!(d <= nominal * 1.25 + 1e-6, "attempt {attempt}: {d} too large");
            }
        }
    }

    #[test]
    fn delay_is_capped_at_max() {
        let p = policy();
        // 15 * 2^30 is far past the 30 minute cap.
        let d = p.delay_after_attempt(31, false);
        assert!(d <= p.max_delay);
    }

    #[test]
    fn express_halves_the_base() {
        let p = policy();
        for _ in 0..50 {
            let d = p.delay_after_attempt(1, true).as_secs_f64();
            assert!((7.5 * 0.75..=7.5 * 1.25).contains(&d));
        }
    }
}
