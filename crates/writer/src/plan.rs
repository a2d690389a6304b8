//! Writer planning module
//!
//! Derives how many encoded frames the writer may hold in memory from the
//! encoding thread count and configuration.

use crate::config::Config;

/// Memory plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct WriterPlan {
    /// Number of threads producing encoded frames
    pub encoding_threads: u32,
    /// Resident FULL frames allowed before producers block and the writer spills
    pub maximum_frames_in_memory: usize,
    /// Effective (clamped) frames-per-thread factor
    pub memory_factor: f32,
}

impl WriterPlan {
    /// Derive a writer plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if no thread count is configured
    /// - Clamps memory_factor to [1.0, 4.0]
    /// - maximum_frames_in_memory = round(threads × factor), at least 1
    pub fn derive(cfg: &Config) -> Self {
        Self::for_threads(cfg.encoding_threads(), cfg.encoding.memory_factor)
    }

    /// Plan for an explicit thread count
    pub fn for_threads(encoding_threads: u32, memory_factor: f32) -> Self {
        let memory_factor = clamp_factor(memory_factor);
        Self {
            encoding_threads,
            maximum_frames_in_memory: maximum_frames_in_memory(encoding_threads, memory_factor),
            memory_factor,
        }
    }
}

/// Frames the writer may hold for `threads` encoders
pub fn maximum_frames_in_memory(threads: u32, memory_factor: f32) -> usize {
    let frames = (threads as f32 * clamp_factor(memory_factor)).round();
    if frames.is_finite() && frames >= 1.0 {
        frames as usize
    } else {
        1
    }
}

/// Clamp factor to valid range [1.0, 4.0]; NaN falls back to the default
fn clamp_factor(factor: f32) -> f32 {
    if factor.is_nan() {
        1.1
    } else {
        factor.clamp(1.0, 4.0)
    }
}

/// Public function to derive a writer plan from configuration
pub fn derive_plan(cfg: &Config) -> WriterPlan {
    WriterPlan::derive(cfg)
}
