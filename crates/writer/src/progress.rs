//! Progress reporting collaborator.

use std::sync::atomic::{AtomicU32, Ordering};
use tracing::info;

/// Receives fractional progress from the writer and the finalizer.
pub trait Progress: Send + Sync {
    /// Fraction complete in `[0, 1]` for the current phase.
    fn set_progress(&self, fraction: f32);

    /// A new named sub-phase has started.
    fn sub(&self, phase: &str);
}

/// Discards all reports.
#[derive(Debug, Default)]
pub struct NoProgress;

impl Progress for NoProgress {
    fn set_progress(&self, _fraction: f32) {}

    fn sub(&self, _phase: &str) {}
}

/// Logs progress each time it crosses a whole-percent step.
#[derive(Debug)]
pub struct LogProgress {
    step: u32,
    last: AtomicU32,
}

impl LogProgress {
    /// Log every `step` percent.
    pub fn new(step: u32) -> Self {
        Self {
            step: step.max(1),
            last: AtomicU32::new(u32::MAX),
        }
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new(5)
    }
}

impl Progress for LogProgress {
    fn set_progress(&self, fraction: f32) {
        let percent = (fraction.clamp(0.0, 1.0) * 100.0) as u32;
        let bucket = percent / self.step;
        if self.last.swap(bucket, Ordering::Relaxed) != bucket {
            info!(percent, "progress");
        }
    }

    fn sub(&self, phase: &str) {
        self.last.store(u32::MAX, Ordering::Relaxed);
        info!(phase, "starting");
    }
}
