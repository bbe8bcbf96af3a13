//! Redelivery policy: attempt ceiling and delay computation.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Result, RouteflowError};
use crate::utils::duration_ms;

/// How many times, and how far apart, a failed stage is retried.
///
/// A `maximum_redeliveries` of `N` permits `N` retries after the first
/// attempt; a negative value retries forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryPolicy {
    /// Retries permitted after the first attempt. Negative means forever.
    pub maximum_redeliveries: i32,
    /// Delay before the first retry.
    #[serde(rename = "redelivery_delay_ms", with = "duration_ms")]
    pub redelivery_delay: Duration,
    /// Upper bound for any computed delay. Zero disables the cap.
    #[serde(rename = "maximum_redelivery_delay_ms", with = "duration_ms")]
    pub maximum_redelivery_delay: Duration,
    /// Multiply the previous delay by `back_off_multiplier` on each retry.
    pub use_exponential_back_off: bool,
    /// Back-off multiplier, only applied when greater than 1.
    pub back_off_multiplier: f64,
    /// Randomly widen or narrow each delay by up to `collision_avoidance_factor`.
    pub use_collision_avoidance: bool,
    /// Fraction used by collision avoidance.
    pub collision_avoidance_factor: f64,
    /// `"count:delay_ms;count:delay_ms"`. Overrides the other delay settings.
    pub delay_pattern: Option<String>,
    /// Wait for the delay on a scheduler instead of the route thread.
    pub async_delayed_redelivery: bool,
    /// Keep redelivering after the handler was asked to stop.
    pub allow_redelivery_while_stopping: bool,
    /// Log every retry attempt.
    pub log_retry_attempted: bool,
    /// Only log every n-th retry attempt.
    pub retry_attempted_log_interval: u32,
    /// Log when redelivery is exhausted.
    pub log_exhausted: bool,
    /// Log failures raised by the terminal sink.
    pub log_new_exception: bool,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: Duration::from_secs(1),
            maximum_redelivery_delay: Duration::from_secs(60),
            use_exponential_back_off: false,
            back_off_multiplier: 2.0,
            use_collision_avoidance: false,
            collision_avoidance_factor: 0.15,
            delay_pattern: None,
            async_delayed_redelivery: false,
            allow_redelivery_while_stopping: true,
            log_retry_attempted: true,
            retry_attempted_log_interval: 1,
            log_exhausted: true,
            log_new_exception: true,
        }
    }
}

impl RedeliveryPolicy {
    /// Creates a policy with `maximum_redeliveries` retries and no delay.
    #[must_use]
    pub fn new(maximum_redeliveries: i32) -> Self {
        Self {
            maximum_redeliveries,
            redelivery_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Sets the retry ceiling.
    #[must_use]
    pub fn with_maximum_redeliveries(mut self, maximum: i32) -> Self {
        self.maximum_redeliveries = maximum;
        self
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_maximum_redelivery_delay(mut self, delay: Duration) -> Self {
        self.maximum_redelivery_delay = delay;
        self
    }

    /// Enables exponential back-off.
    #[must_use]
    pub fn with_exponential_back_off(mut self, multiplier: f64) -> Self {
        self.use_exponential_back_off = true;
        self.back_off_multiplier = multiplier;
        self
    }

    /// Enables collision avoidance.
    #[must_use]
    pub fn with_collision_avoidance(mut self, factor: f64) -> Self {
        self.use_collision_avoidance = true;
        self.collision_avoidance_factor = factor;
        self
    }

    /// Sets a delay pattern.
    #[must_use]
    pub fn with_delay_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.delay_pattern = Some(pattern.into());
        self
    }

    /// Waits for delays on a scheduler instead of the route thread.
    #[must_use]
    pub fn with_async_delayed_redelivery(mut self, enabled: bool) -> Self {
        self.async_delayed_redelivery = enabled;
        self
    }

    /// Sets whether redelivery continues once the handler is stopping.
    #[must_use]
    pub fn with_allow_redelivery_while_stopping(mut self, allow: bool) -> Self {
        self.allow_redelivery_while_stopping = allow;
        self
    }

    /// Logs only every n-th retry attempt.
    #[must_use]
    pub fn with_retry_attempted_log_interval(mut self, interval: u32) -> Self {
        self.retry_attempted_log_interval = interval;
        self
    }

    /// Checks the numeric settings and the delay pattern.
    ///
    /// # Errors
    ///
    /// `InvalidConfiguration` naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        if !(self.back_off_multiplier.is_finite() && self.back_off_multiplier > 0.0) {
            return Err(RouteflowError::InvalidConfiguration(format!(
                "back_off_multiplier must be positive, got {}",
                self.back_off_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.collision_avoidance_factor) {
            return Err(RouteflowError::InvalidConfiguration(format!(
                "collision_avoidance_factor must be within [0, 1], got {}",
                self.collision_avoidance_factor
            )));
        }
        if let Some(pattern) = &self.delay_pattern {
            parse_delay_pattern(pattern)?;
        }
        Ok(())
    }

    /// Returns true if the attempt ceiling permits retry number `redelivery_counter`.
    ///
    /// `redelivery_counter` is the number the next retry would carry, so the
    /// first retry is 1.
    #[must_use]
    pub fn allows_redelivery(&self, redelivery_counter: u32) -> bool {
        u32::try_from(self.maximum_redeliveries).map_or(true, |max| redelivery_counter <= max)
    }

    /// Computes the delay before retry number `redelivery_counter`.
    ///
    /// `previous` is the delay used before the previous retry, zero for the
    /// first one.
    #[must_use]
    pub fn delay_for(&self, previous: Duration, redelivery_counter: u32) -> Duration {
        if let Some(pattern) = &self.delay_pattern {
            return parse_delay_pattern(pattern)
                .map(|groups| delay_from_pattern(&groups, redelivery_counter))
                .unwrap_or(Duration::ZERO);
        }

        let mut delay = if previous.is_zero() {
            self.redelivery_delay
        } else if self.use_exponential_back_off && self.back_off_multiplier > 1.0 {
            scale(previous, self.back_off_multiplier)
        } else {
            previous
        };

        if self.use_collision_avoidance && !delay.is_zero() {
            let mut rng = rand::thread_rng();
            let direction = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            let variance = direction * self.collision_avoidance_factor * rng.gen::<f64>();
            delay = scale(delay, 1.0 + variance);
        }

        if !self.maximum_redelivery_delay.is_zero() && delay > self.maximum_redelivery_delay {
            delay = self.maximum_redelivery_delay;
        }
        delay
    }
}

/// Multiplies a delay, saturating at `Duration::MAX` and flooring at zero.
fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64((delay.as_secs_f64() * factor).max(0.0)).unwrap_or(Duration::MAX)
}

fn parse_delay_pattern(pattern: &str) -> Result<Vec<(u32, Duration)>> {
    let invalid = |group: &str| {
        RouteflowError::InvalidConfiguration(format!(
            "delay_pattern group '{group}' must be 'count:delay_ms'"
        ))
    };

    let mut groups = Vec::new();
    for group in pattern.split(';').map(str::trim).filter(|g| !g.is_empty()) {
        let (count, delay) = group.split_once(':').ok_or_else(|| invalid(group))?;
        let count: u32 = count.trim().parse().map_err(|_| invalid(group))?;
        let delay: u64 = delay.trim().parse().map_err(|_| invalid(group))?;
        groups.push((count, Duration::from_millis(delay)));
    }
    Ok(groups)
}

/// The delay of the last group whose count does not exceed the counter wins.
fn delay_from_pattern(groups: &[(u32, Duration)], redelivery_counter: u32) -> Duration {
    groups
        .iter()
        .take_while(|(count, _)| *count <= redelivery_counter)
        .last()
        .map_or(Duration::ZERO, |(_, delay)| *delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_attempt_ceiling() {
        let policy = RedeliveryPolicy::new(3);
        assert!(policy.allows_redelivery(1));
        assert!(policy.allows_redelivery(3));
        assert!(!policy.allows_redelivery(4));

        assert!(!RedeliveryPolicy::new(0).allows_redelivery(1));
        assert!(RedeliveryPolicy::new(-1).allows_redelivery(10_000));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RedeliveryPolicy::new(3).with_redelivery_delay(Duration::from_millis(100));
        let first = policy.delay_for(Duration::ZERO, 1);
        let second = policy.delay_for(first, 2);

        assert_eq!(first, Duration::from_millis(100));
        assert_eq!(second, Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_back_off_is_capped() {
        let policy = RedeliveryPolicy::new(10)
            .with_redelivery_delay(Duration::from_millis(100))
            .with_exponential_back_off(2.0)
            .with_maximum_redelivery_delay(Duration::from_millis(500));

        let mut delays = Vec::new();
        let mut previous = Duration::ZERO;
        for counter in 1..=5 {
            previous = policy.delay_for(previous, counter);
            delays.push(previous.as_millis());
        }

        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_uncapped_back_off_saturates() {
        let policy = RedeliveryPolicy::new(-1)
            .with_redelivery_delay(Duration::from_secs(1))
            .with_maximum_redelivery_delay(Duration::ZERO)
            .with_exponential_back_off(1000.0);

        let mut delay = Duration::ZERO;
        for counter in 1..=20 {
            delay = policy.delay_for(delay, counter);
        }

        assert_eq!(delay, Duration::MAX);
        assert_eq!(policy.delay_for(Duration::MAX, 21), Duration::MAX);
    }

    #[test]
    fn test_collision_avoidance_stays_within_factor() {
        let policy = RedeliveryPolicy::new(1)
            .with_redelivery_delay(Duration::from_millis(1000))
            .with_collision_avoidance(0.15);

        for _ in 0..100 {
            let delay = policy.delay_for(Duration::ZERO, 1).as_millis();
            assert!((850..=1150).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_delay_pattern() {
        let policy = RedeliveryPolicy::new(10).with_delay_pattern("0:10;3:500;5:2000");

        assert_eq!(policy.delay_for(Duration::ZERO, 1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(Duration::ZERO, 2), Duration::from_millis(10));
        assert_eq!(policy.delay_for(Duration::ZERO, 3), Duration::from_millis(500));
        assert_eq!(policy.delay_for(Duration::ZERO, 7), Duration::from_millis(2000));
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let err = RedeliveryPolicy::new(1)
            .with_delay_pattern("1:100;oops")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("oops"));

        assert!(RedeliveryPolicy::new(1).with_collision_avoidance(2.0).validate().is_err());
        assert!(RedeliveryPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_serde_uses_milliseconds() {
        let policy = RedeliveryPolicy::new(2).with_redelivery_delay(Duration::from_millis(250));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["redelivery_delay_ms"], 250);
        assert_eq!(json["maximum_redelivery_delay_ms"], 60_000);

        let parsed: RedeliveryPolicy =
            serde_json::from_value(serde_json::json!({"maximum_redeliveries": 5, "redelivery_delay_ms": 10}))
                .unwrap();
        assert_eq!(parsed.maximum_redeliveries, 5);
        assert_eq!(parsed.redelivery_delay, Duration::from_millis(10));
        assert!(parsed.log_exhausted);
    }
}
