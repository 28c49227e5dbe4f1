//! Retry delay for failed executions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sked_core::{BackoffConfig, BackoffKind, Execution};
use sked_store::query::latest_storable_instant;

/// Maps the number of consecutive failures recorded *before* the current
/// failure to a retry delay.
///
/// The delay never decreases as failures accumulate and is capped at
/// `max_delay`. Because a success resets `consecutive_failures` to zero, the
/// first failure after a success always waits `base_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    kind: BackoffKind,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
        }
    }

    /// `base * (1 + multiplier * failures)`; negative multipliers count as zero.
    pub fn linear(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Linear,
            base_delay,
            multiplier: multiplier.max(0.0),
            max_delay: max_delay.max(base_delay),
        }
    }

    /// `base * multiplier ^ failures`; multipliers below one count as one.
    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay,
            multiplier: multiplier.max(1.0),
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn kind(&self) -> BackoffKind {
        self.kind
    }

    pub fn delay(&self, prior_failures: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let n = f64::from(prior_failures);
        let secs = match self.kind {
            BackoffKind::Fixed => base,
            BackoffKind::Linear => base * (1.0 + self.multiplier * n),
            BackoffKind::Exponential => {
                base * self.multiplier.powi(i32::try_from(prior_failures).unwrap_or(i32::MAX))
            }
        };
        let max = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= max {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Next attempt for an execution that just failed at `now`, capped at
    /// the last instant the store can hold.
    pub fn next_attempt(&self, execution: &Execution, now: DateTime<Utc>) -> DateTime<Utc> {
        let latest = latest_storable_instant();
        chrono::Duration::from_std(self.delay(execution.consecutive_failures))
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .map_or(latest, |next| next.min(latest))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        let base = Duration::from_millis(config.base_delay_ms);
        let max = Duration::from_millis(config.max_delay_ms);
        match config.kind {
            BackoffKind::Fixed => BackoffPolicy::fixed(base),
            BackoffKind::Linear => BackoffPolicy::linear(base, config.multiplier, max),
            BackoffKind::Exponential => BackoffPolicy::exponential(base, config.multiplier, max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const S: Duration = Duration::from_secs(1);

    #[test]
    fn exponential_doubles_until_cap() {
        let p = BackoffPolicy::exponential(2 * S, 2.0, 30 * S);
        let delays: Vec<_> = (0..6).map(|n| p.delay(n).as_secs()).collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn linear_adds_a_step_per_failure() {
        let p = BackoffPolicy::linear(10 * S, 0.5, 60 * S);
        assert_eq!(p.delay(0), 10 * S);
        assert_eq!(p.delay(1), 15 * S);
        assert_eq!(p.delay(4), 30 * S);
        assert_eq!(p.delay(100), 60 * S);
    }

    #[test]
    fn fixed_ignores_failure_count() {
        let p = BackoffPolicy::fixed(5 * S);
        assert_eq!(p.delay(0), p.delay(1_000));
    }

    #[rstest]
    #[case(BackoffPolicy::fixed(3 * S))]
    #[case(BackoffPolicy::linear(S, 1.0, 3600 * S))]
    #[case(BackoffPolicy::linear(S, -4.0, 3600 * S))]
    #[case(BackoffPolicy::exponential(S, 3.0, 3600 * S))]
    #[case(BackoffPolicy::exponential(S, 0.5, 3600 * S))]
    fn delay_never_decreases(#[case] policy: BackoffPolicy) {
        let mut previous = Duration::ZERO;
        for n in [0, 1, 2, 3, 10, 50, 1_000, u32::MAX] {
            let d = policy.delay(n);
            assert!(d >= previous, "{policy:?} decreased at {n}");
            previous = d;
        }
    }

    #[test]
    fn from_config_defaults_to_exponential() {
        let p = BackoffPolicy::from(&BackoffConfig::default());
        assert_eq!(p.kind(), BackoffKind::Exponential);
        assert_eq!(p.delay(0), Duration::from_secs(10));
        assert_eq!(p.delay(1), Duration::from_secs(20));
    }

    #[rstest]
    #[case(35)]
    #[case(40)]
    #[case(u32::MAX)]
    fn unbounded_backoff_stays_storable(#[case] failures: u32) {
        let p = BackoffPolicy::exponential(10 * S, 2.0, Duration::MAX);
        let mut execution = Execution::new(sked_core::TaskInstance::new("t", "i"), Utc::now());
        execution.consecutive_failures = failures;

        let next = p.next_attempt(&execution, Utc::now());
        assert!(sked_store::query::is_storable(next), "{failures} failures gave {next}");
        assert!(next > Utc::now());
    }

    #[test]
    fn ordinary_backoff_is_not_clamped() {
        let p = BackoffPolicy::fixed(5 * S);
        let now = Utc::now();
        let execution = Execution::new(sked_core::TaskInstance::new("t", "i"), now);
        assert_eq!(p.next_attempt(&execution, now), now + chrono::Duration::seconds(5));
    }
}
