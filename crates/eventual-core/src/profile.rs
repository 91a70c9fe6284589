//! Opt-in timing of hot paths.

use std::time::Instant;
use tracing::info;

/// Logs how long it lived when dropped, if enabled.
#[must_use = "the timer reports when dropped"]
pub struct Timer {
    operation: &'static str,
    started: Option<Instant>,
}

impl Timer {
    /// Start timing `operation`. A disabled timer does nothing.
    pub fn start(operation: &'static str, enabled: bool) -> Self {
        Self {
            operation,
            started: enabled.then(Instant::now),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(started) = self.started {
            info!(operation = self.operation, elapsed = ?started.elapsed(), "profile");
        }
    }
}
