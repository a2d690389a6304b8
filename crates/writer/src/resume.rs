//! Resume validation against the output of an interrupted run.
//!
//! Each frame's stored record is replayed against the existing asset: the
//! recorded span is read back and re-hashed. The first frame that is missing,
//! short or mismatched ends the verified prefix. Nothing here is an error to
//! the caller; a bad asset just means less can be reused.

use crate::digest::frame_hash_reader;
use crate::frame::{Eyes, FrameKey};
use crate::frame_info::{FrameInfoRecord, FrameInfoStore};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use tracing::{debug, info, warn};

/// What a previous run left behind that can be trusted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeState {
    first_nonexistant_frame: u64,
    /// Verified records, indexed by `FrameKey::info_index`.
    records: Vec<FrameInfoRecord>,
    stereoscopic: bool,
}

impl ResumeState {
    /// A fresh run with nothing to reuse.
    pub fn empty(stereoscopic: bool) -> Self {
        Self {
            first_nonexistant_frame: 0,
            records: Vec::new(),
            stereoscopic,
        }
    }

    /// Number of leading frames whose bytes are verified durable.
    pub fn first_nonexistant_frame(&self) -> u64 {
        self.first_nonexistant_frame
    }

    /// Frame 0 is always written for real so the asset writer can set itself
    /// up from genuine data.
    pub fn can_fake_write(&self, frame: u64) -> bool {
        frame != 0 && frame < self.first_nonexistant_frame
    }

    /// The verified record for `key`, if it lies inside the verified prefix.
    pub fn record(&self, key: FrameKey) -> Option<&FrameInfoRecord> {
        if key.frame >= self.first_nonexistant_frame {
            return None;
        }
        self.records.get(key.info_index() as usize)
    }

    pub fn is_resuming(&self) -> bool {
        self.first_nonexistant_frame > 0
    }
}

fn frame_keys(frame: u64, stereoscopic: bool) -> Vec<FrameKey> {
    if stereoscopic {
        vec![FrameKey::new(frame, Eyes::Left), FrameKey::new(frame, Eyes::Right)]
    } else {
        vec![FrameKey::new(frame, Eyes::Both)]
    }
}

/// Check one record against the asset bytes it describes.
fn check_frame(asset: &mut File, asset_len: u64, key: FrameKey, record: &FrameInfoRecord) -> bool {
    match record.offset.checked_add(record.size) {
        Some(end) if end <= asset_len => {}
        _ => {
            debug!(key = %key, offset = record.offset, size = record.size, "frame lies beyond end of asset");
            return false;
        }
    }

    let hashed = asset
        .seek(SeekFrom::Start(record.offset))
        .and_then(|_| frame_hash_reader(&mut *asset, record.size));
    let hash = match hashed {
        Ok((hash, read)) if read == record.size => hash,
        Ok((_, read)) => {
            debug!(key = %key, read, size = record.size, "short read of existing frame");
            return false;
        }
        Err(e) => {
            debug!(key = %key, error = %e, "could not read existing frame");
            return false;
        }
    };

    if hash != record.hash {
        info!(key = %key, "existing frame failed hash check");
        return false;
    }

    true
}

/// Work out how many leading frames of an existing asset can be reused.
///
/// A stereoscopic frame only counts if both eyes verify.
pub fn check_existing(asset_path: &Path, info_path: &Path, stereoscopic: bool) -> ResumeState {
    let mut state = ResumeState::empty(stereoscopic);

    let mut asset = match File::open(asset_path) {
        Ok(f) => f,
        Err(_) => return state,
    };
    let asset_len = match asset.metadata() {
        Ok(m) => m.len(),
        Err(e) => {
            warn!(path = %asset_path.display(), error = %e, "could not stat existing asset");
            return state;
        }
    };
    let mut store = match FrameInfoStore::open_read_only(info_path) {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "no frame info for existing asset");
            return state;
        }
    };

    'frames: loop {
        let frame = state.first_nonexistant_frame;
        let mut verified = Vec::with_capacity(2);

        for key in frame_keys(frame, stereoscopic) {
            let record = match store.read(key) {
                Ok(Some(r)) => r,
                Ok(None) => break 'frames,
                Err(e) => {
                    warn!(error = %e, "frame info unreadable; stopping resume check");
                    break 'frames;
                }
            };
            if !check_frame(&mut asset, asset_len, key, &record) {
                break 'frames;
            }
            verified.push(record);
        }

        debug!(frame, "have existing frame");
        state.records.extend(verified);
        state.first_nonexistant_frame += 1;
    }

    if state.is_resuming() {
        info!(
            frames = state.first_nonexistant_frame,
            asset = %asset_path.display(),
            "resuming from existing asset"
        );
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::frame_hash;
    use std::fs;
    use tempfile::TempDir;

    /// Lay out frames back to back after a 16-byte header, with records.
    fn fixture(dir: &TempDir, frames: &[(FrameKey, &str)]) -> (std::path::PathBuf, std::path::PathBuf) {
        let asset = dir.path().join("asset.rpk");
        let info = dir.path().join("asset.info");
        let mut bytes = vec![0u8; 16];
        let mut store = FrameInfoStore::open(&info).unwrap();
        for (key, data) in frames {
            let data = data.as_bytes();
            let record = FrameInfoRecord {
                offset: bytes.len() as u64,
                size: data.len() as u64,
                hash: frame_hash(data),
            };
            store.write(*key, &record).unwrap();
            bytes.extend_from_slice(data);
        }
        fs::write(&asset, bytes).unwrap();
        (asset, info)
    }

    fn both(frame: u64) -> FrameKey {
        FrameKey::new(frame, Eyes::Both)
    }

    #[test]
    fn test_missing_asset_means_fresh_run() {
        let dir = TempDir::new().unwrap();
        let state = check_existing(&dir.path().join("a"), &dir.path().join("b"), false);
        assert_eq!(state.first_nonexistant_frame(), 0);
        assert!(!state.can_fake_write(0));
    }

    #[test]
    fn test_all_frames_verify() {
        let dir = TempDir::new().unwrap();
        let (asset, info) = fixture(&dir, &[(both(0), "AAAA"), (both(1), "BB"), (both(2), "CCC")]);
        let state = check_existing(&asset, &info, false);

        assert_eq!(state.first_nonexistant_frame(), 3);
        assert!(!state.can_fake_write(0));
        assert!(state.can_fake_write(1));
        assert!(state.can_fake_write(2));
        assert!(!state.can_fake_write(3));
        assert_eq!(state.record(both(1)).unwrap().size, 2);
        assert!(state.record(both(3)).is_none());
    }

    #[test]
    fn test_corrupt_byte_stops_at_that_frame() {
        let dir = TempDir::new().unwrap();
        let (asset, info) = fixture(
            &dir,
            &[(both(0), "AAAA"), (both(1), "BBBB"), (both(2), "CCCC"), (both(3), "DDDD")],
        );
        let mut bytes = fs::read(&asset).unwrap();
        // Frame 2 occupies 24..28
        bytes[25] ^= 0xff;
        fs::write(&asset, bytes).unwrap();

        assert_eq!(check_existing(&asset, &info, false).first_nonexistant_frame(), 2);
    }

    #[test]
    fn test_truncated_asset_stops_at_short_frame() {
        let dir = TempDir::new().unwrap();
        let (asset, info) = fixture(&dir, &[(both(0), "AAAA"), (both(1), "BBBB")]);
        let file = fs::OpenOptions::new().write(true).open(&asset).unwrap();
        file.set_len(22).unwrap();

        assert_eq!(check_existing(&asset, &info, false).first_nonexistant_frame(), 1);
    }

    #[test]
    fn test_stereo_frame_needs_both_eyes() {
        let dir = TempDir::new().unwrap();
        let (asset, info) = fixture(
            &dir,
            &[
                (FrameKey::new(0, Eyes::Left), "L0"),
                (FrameKey::new(0, Eyes::Right), "R0"),
                (FrameKey::new(1, Eyes::Left), "L1"),
            ],
        );
        let state = check_existing(&asset, &info, true);
        assert_eq!(state.first_nonexistant_frame(), 1);
        assert!(state.record(FrameKey::new(0, Eyes::Right)).is_some());
        assert!(state.record(FrameKey::new(1, Eyes::Left)).is_none());
    }
}
