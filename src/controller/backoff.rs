//! # Exponential Backoff
//!
//! Doubling backoff used for broker-transient retries, catalog-miss retries and
//! async-operation polling. Each resource keeps its own instance so a failing
//! resource never slows down the others.
//!
//! ## Usage
//!
//! ```rust
//! use service_catalog_controller::controller::backoff::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(1));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(2));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(4));
//! assert_eq!(backoff.next_backoff(), Duration::from_secs(5));
//! ```

use std::time::Duration;

/// Exponential backoff calculator
///
/// Starts at `min`, doubles on every call and is capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    min: Duration,
    current: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff; `max` below `min` is raised to `min`
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            current: min,
            max: max.max(min),
        }
    }

    /// Get the next backoff duration and advance the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        result
    }

    /// The duration the next call will return, without advancing
    #[must_use]
    pub fn peek(&self) -> Duration {
        self.current
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current = self.min;
    }
}
