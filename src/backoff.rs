//! Backoff delay calculation for the retry controller.
//!
//! Computes exponential backoff with optional jitter. The jitter draw goes
//! through a [`JitterSource`] trait rather than reaching for
//! `rand::random::<u64>()` directly, so tests can supply a fixed sequence
//! and assert exact delays.

use crate::retry::RetryConfig;
use rand::Rng;

/// Supplies the uniform draw in `[-1.0, 1.0]` used for symmetric jitter.
/// `RngJitterSource` is the production implementation; tests provide a fixed
/// or cyclical source instead.
pub trait JitterSource {
  fn next_unit(&mut self) -> f64;
}

/// Jitter source backed by `rand::thread_rng`.
pub struct RngJitterSource;

impl JitterSource for RngJitterSource {
  fn next_unit(&mut self) -> f64 {
    rand::thread_rng().gen_range(-1.0..=1.0)
  }
}

/// A jitter source that always returns the same value, useful for
/// deterministic property tests (P2, P3).
pub struct FixedJitterSource(pub f64);

impl JitterSource for FixedJitterSource {
  fn next_unit(&mut self) -> f64 {
    self.0
  }
}

/// Compute the delay, in milliseconds, that should precede retry attempt
/// `attempt_number` (1-based) under `policy`.
///
/// `base = clamp(initialDelayMs * backoffMultiplier^(attempt_number - 1), 0, maxDelayMs)`.
/// With jitter enabled the result is `base` adjusted by up to ±25% using
/// `jitter`, then floored at 0.
pub fn delay_for(attempt_number: u32, policy: &RetryConfig, jitter: &mut dyn JitterSource) -> u64 {
  let exponent = attempt_number.saturating_sub(1) as i32;
  let raw = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);
  let base = raw.min(policy.max_delay_ms as f64);

  let delay = if policy.use_jitter {
    let offset = jitter.next_unit() * 0.25 * base;
    base + offset
  } else {
    base
  };

  delay.max(0.0).round() as u64
}
