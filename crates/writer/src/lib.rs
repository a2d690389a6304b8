//! Reelpack
//!
//! Commits independently encoded, possibly out-of-order picture frames and a
//! serial audio stream to asset files in frame order, with bounded memory and
//! resumption of interrupted runs, then finalizes them into a package.

pub mod asset;
pub mod digest;
pub mod finalize;
pub mod frame;
pub mod frame_files;
pub mod frame_info;
pub mod manifest;
pub mod plan;
pub mod progress;
pub mod queue;
pub mod resume;
pub mod stats;
pub mod writer;

pub use reelpack_config as config;
pub use reelpack_config::Config;
pub use asset::{AssetError, AssetKind, AssetWriter, AudioBuffers, EssenceWriter, SoundWriter, WriteInfo};
pub use digest::{file_digest, frame_hash, frame_hash_reader, FrameHash};
pub use finalize::{finalize, link_or_copy, FinalizeOptions, FinalizeReport};
pub use frame::{Eyes, FrameKey};
pub use frame_files::{FrameFileError, FrameFiles};
pub use frame_info::{FrameInfoError, FrameInfoRecord, FrameInfoStore};
pub use manifest::{signer_from_config, HmacSigner, Manifest, ManifestAsset, SignError, Signer};
pub use plan::{derive_plan, WriterPlan};
pub use progress::{LogProgress, NoProgress, Progress};
pub use resume::{check_existing, ResumeState};
pub use stats::WriterStats;
pub use writer::{Committed, Writer, WriterError, WriterOptions};
