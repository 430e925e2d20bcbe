//! Progress Tracking
//!
//! Derives a monotonic 0-100 completion percentage from backend progress
//! frames. Regressions and repeats are dropped; a terminal 100 is
//! guaranteed before the session completes, synthesized if the backend
//! never sent one.

/// Monotonic progress filter
#[derive(Debug, Default)]
pub(crate) struct ProgressTracker {
    last: Option<u8>,
}

impl ProgressTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Observe a backend-reported value; returns the value to forward, if
    /// any. Values above 100 are clamped.
    pub(crate) fn observe(&mut self, value: u8) -> Option<u8> {
        let value = value.min(100);
        match self.last {
            Some(last) if value <= last => None,
            _ => {
                self.last = Some(value);
                Some(value)
            }
        }
    }

    /// Ensure a terminal 100 was emitted; returns `Some(100)` if the
    /// caller still needs to forward it
    pub(crate) fn finalize(&mut self) -> Option<u8> {
        if self.last == Some(100) {
            None
        } else {
            self.last = Some(100);
            Some(100)
        }
    }
}
