//! Meter primitive
//!
//! A meter is a monotonic counter backed by a prometheus [`IntCounter`].
//! Clones share one value, so a connection can hold its own handle while the
//! same counter stays registered for gathering.

use std::fmt;

use peerwire_common::{PeerwireError, Result};
use prometheus::IntCounter;

/// Monotonic byte or event counter
#[derive(Clone)]
pub struct Meter {
    counter: IntCounter,
}

impl Meter {
    /// Create an unregistered meter. `name` must be a valid prometheus
    /// metric name.
    pub fn new(name: &str, help: &str) -> Result<Self> {
        let counter = IntCounter::new(name, help).map_err(|e| {
            PeerwireError::Internal(format!("Failed to create meter {}: {}", name, e))
        })?;
        Ok(Self { counter })
    }

    pub(crate) fn from_counter(counter: IntCounter) -> Self {
        Self { counter }
    }

    /// Record `n` events
    pub fn mark(&self, n: u64) {
        if n > 0 {
            self.counter.inc_by(n);
        }
    }

    /// Cumulative total, never decreasing
    pub fn count(&self) -> u64 {
        self.counter.get()
    }

    /// Underlying prometheus counter
    pub fn counter(&self) -> &IntCounter {
        &self.counter
    }
}

impl fmt::Debug for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Meter").field("count", &self.count()).finish()
    }
}
