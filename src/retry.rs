//! Reconnect policy for subscription loops.
//!
//! This module provides [`ReconnectPolicy`], consulted by the subscription
//! loop every time a session fails to open or drops while listening.
//!
//! # Reconnect Strategy
//!
//! - Default: a fixed 5 second pause, retried forever
//! - Optional exponential growth via `multiplier`, capped at `max_delay`
//! - Optional ±25% jitter so that many subscriptions do not reconnect in step
//! - Optional attempt cap: after `max_attempts` consecutive failures the loop
//!   gives up and stops
//!
//! "Consecutive" is reset whenever a session reaches the listening state,
//! so a long-lived subscription that drops once a day never exhausts its
//! budget.

use std::collections::hash_map::RandomState;
use std::hash::BuildHasher;
use std::time::Duration;

/// Default pause between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Backoff settings for re-establishing a subscription session.
///
/// # Example
///
/// ```
/// use mom_pubsub::ReconnectPolicy;
/// use std::time::Duration;
///
/// // Fixed interval, retried forever (the default is 5 seconds).
/// let fixed = ReconnectPolicy::fixed(Duration::from_secs(1));
/// assert_eq!(fixed.delay_for(0), Duration::from_secs(1));
/// assert_eq!(fixed.delay_for(10), Duration::from_secs(1));
///
/// // Exponential, capped, at most 10 consecutive failures.
/// let bounded = ReconnectPolicy::exponential(
///     Duration::from_millis(100),
///     2.0,
///     Duration::from_secs(5),
/// )
/// .with_max_attempts(10);
/// assert_eq!(bounded.delay_for(1), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,

    /// Growth factor applied per consecutive failure (1.0 = fixed interval).
    pub multiplier: f32,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Apply ±25% randomization to each delay.
    pub jitter: bool,

    /// Give up after this many consecutive failures (`None` = never).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    /// Fixed 5 second interval, no jitter, unlimited attempts.
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

impl ReconnectPolicy {
    /// Constant delay between attempts, retried forever.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: false,
            max_attempts: None,
        }
    }

    /// Delay growing by `multiplier` per consecutive failure, capped at `max_delay`.
    pub fn exponential(initial_delay: Duration, multiplier: f32, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            multiplier,
            max_delay,
            jitter: false,
            max_attempts: None,
        }
    }

    /// Enable ±25% jitter.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Stop the subscription after `attempts` consecutive failures.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay to wait after `failures` previous consecutive failures (0-indexed).
    ///
    /// The base is `initial_delay × multiplier^failures`, clamped to
    /// `max_delay`; jitter, when enabled, is applied to the clamped base.
    pub fn delay_for(&self, failures: u32) -> Duration {
        // ---
        let multiplier = f64::from(self.multiplier.max(1.0));
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let base_secs = self.initial_delay.as_secs_f64() * multiplier.powi(exponent);

        let base = if base_secs.is_finite() && base_secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(base_secs)
        } else {
            self.max_delay
        };

        if self.jitter {
            apply_jitter(base)
        } else {
            base
        }
    }

    /// Whether another attempt is allowed after `failures` consecutive failures.
    pub fn allows_attempt(&self, failures: u32) -> bool {
        match self.max_attempts {
            Some(max) => failures < max,
            None => true,
        }
    }
}

/// Apply ±25% jitter to a duration.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    // Convert to 0.0..1.0 range
    let random_factor = (hash % 1000) as f64 / 1000.0;

    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}
