//! Commit counters reported when a run is finalized.

use serde::{Deserialize, Serialize};

/// What the writer thread did with the frames it was given.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStats {
    /// Frames committed with their encoded bytes
    pub full_written: u64,
    /// Frames accounted for from a previous run's asset
    pub fake_written: u64,
    /// Frames committed as a copy of the previous frame
    pub repeat_written: u64,
    /// Frames pushed to disk under memory pressure and later reloaded
    pub pushed_to_disk: u64,
}

impl WriterStats {
    pub fn committed(&self) -> u64 {
        self.full_written + self.fake_written + self.repeat_written
    }
}
