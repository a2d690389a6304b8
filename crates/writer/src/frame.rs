//! Frame identity and commit ordering.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which view of a frame a unit of picture data belongs to.
///
/// 2D content uses `Both` exclusively. Stereoscopic content always supplies a
/// `Left` and a `Right` unit per frame index and never `Both`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Eyes {
    Both,
    Left,
    Right,
}

impl Eyes {
    /// Sort rank within a single frame index; left is committed before right.
    ///
    /// Every value ranks distinctly so that key ordering agrees with equality.
    pub fn rank(self) -> u8 {
        match self {
            Eyes::Both => 0,
            Eyes::Left => 1,
            Eyes::Right => 2,
        }
    }

    /// Whether a key with these eyes can be committed to the target.
    pub fn fits_target(self, stereoscopic: bool) -> bool {
        stereoscopic || self == Eyes::Both
    }

    /// Slot in per-eye tables such as the last-written cache.
    pub fn index(self) -> usize {
        match self {
            Eyes::Both => 0,
            Eyes::Left => 1,
            Eyes::Right => 2,
        }
    }

    /// Filename suffix for per-frame files.
    pub fn suffix(self) -> &'static str {
        match self {
            Eyes::Both => "",
            Eyes::Left => ".L",
            Eyes::Right => ".R",
        }
    }
}

impl fmt::Display for Eyes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eyes::Both => write!(f, "both"),
            Eyes::Left => write!(f, "left"),
            Eyes::Right => write!(f, "right"),
        }
    }
}

/// Number of distinct `Eyes` values.
pub const EYES_COUNT: usize = 3;

/// Uniquely identifies one committable unit of picture data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameKey {
    pub frame: u64,
    pub eyes: Eyes,
}

impl FrameKey {
    pub fn new(frame: u64, eyes: Eyes) -> Self {
        Self { frame, eyes }
    }

    /// The first key ever committed to a picture asset.
    pub fn first(stereoscopic: bool) -> Self {
        if stereoscopic {
            Self::new(0, Eyes::Left)
        } else {
            Self::new(0, Eyes::Both)
        }
    }

    /// The key that must be committed immediately after this one.
    pub fn successor(self) -> Self {
        match self.eyes {
            Eyes::Both => Self::new(self.frame + 1, Eyes::Both),
            Eyes::Left => Self::new(self.frame, Eyes::Right),
            Eyes::Right => Self::new(self.frame + 1, Eyes::Left),
        }
    }

    /// Position of this key's record in the frame info store.
    pub fn info_index(self) -> u64 {
        match self.eyes {
            Eyes::Both => self.frame,
            Eyes::Left => self.frame * 2,
            Eyes::Right => self.frame * 2 + 1,
        }
    }
}

impl Ord for FrameKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.frame, self.eyes.rank()).cmp(&(other.frame, other.eyes.rank()))
    }
}

impl PartialOrd for FrameKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FrameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.eyes {
            Eyes::Both => write!(f, "{}", self.frame),
            eyes => write!(f, "{}/{}", self.frame, eyes),
        }
    }
}

/// Expand a producer-supplied key into the keys actually committed.
///
/// A `Both` key against a stereoscopic target becomes a left/right pair so
/// 2D sources can be packaged as 3D without special handling downstream.
pub fn expand_for_target(key: FrameKey, stereoscopic: bool) -> Vec<FrameKey> {
    if stereoscopic && key.eyes == Eyes::Both {
        vec![
            FrameKey::new(key.frame, Eyes::Left),
            FrameKey::new(key.frame, Eyes::Right),
        ]
    } else {
        vec![key]
    }
}
