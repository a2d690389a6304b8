//! Per-frame files: one file per frame key holding exactly its encoded bytes.
//!
//! Producers and the writer agree on locations purely from the key, so a
//! frame spilled under memory pressure can be found again without any extra
//! bookkeeping.

use crate::frame::FrameKey;
use bytes::Bytes;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors moving frame bytes to or from their per-frame file.
#[derive(Debug, Error)]
pub enum FrameFileError {
    #[error("Failed to write frame {key} to {path}: {source}")]
    Write {
        key: FrameKey,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read frame {key} from {path}: {source}")]
    Read {
        key: FrameKey,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Directory of per-frame files for one asset kind.
#[derive(Debug, Clone)]
pub struct FrameFiles {
    dir: PathBuf,
    extension: String,
}

impl FrameFiles {
    pub fn new(dir: impl Into<PathBuf>, extension: &str) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the complete file for `key`, e.g. `00000042.L.j2c`.
    pub fn path(&self, key: FrameKey) -> PathBuf {
        self.dir.join(format!(
            "{:08}{}.{}",
            key.frame,
            key.eyes.suffix(),
            self.extension
        ))
    }

    fn temp_path(&self, key: FrameKey) -> PathBuf {
        let mut p = self.path(key).into_os_string();
        p.push(".tmp");
        PathBuf::from(p)
    }

    /// Write a frame's bytes, renaming into place only once complete.
    pub fn write(&self, key: FrameKey, data: &[u8]) -> Result<PathBuf, FrameFileError> {
        let path = self.path(key);
        let temp = self.temp_path(key);
        let wrap = |source| FrameFileError::Write {
            key,
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(wrap)?;
        fs::write(&temp, data).map_err(wrap)?;
        fs::rename(&temp, &path).map_err(wrap)?;
        Ok(path)
    }

    /// Read a frame back. A missing file is an error: the frame is unrecoverable.
    pub fn read(&self, key: FrameKey) -> Result<Bytes, FrameFileError> {
        let path = self.path(key);
        fs::read(&path)
            .map(Bytes::from)
            .map_err(|source| FrameFileError::Read { key, path, source })
    }

    pub fn exists(&self, key: FrameKey) -> bool {
        self.path(key).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Eyes;
    use tempfile::TempDir;

    #[test]
    fn test_path_naming() {
        let files = FrameFiles::new("/work/j2c", ".j2c");
        assert_eq!(
            files.path(FrameKey::new(42, Eyes::Both)),
            PathBuf::from("/work/j2c/00000042.j2c")
        );
        assert_eq!(
            files.path(FrameKey::new(7, Eyes::Left)),
            PathBuf::from("/work/j2c/00000007.L.j2c")
        );
        assert_eq!(
            files.path(FrameKey::new(7, Eyes::Right)),
            PathBuf::from("/work/j2c/00000007.R.j2c")
        );
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let files = FrameFiles::new(dir.path().join("nested"), "j2c");
        let key = FrameKey::new(3, Eyes::Both);

        let path = files.write(key, b"payload").unwrap();
        assert!(path.is_file());
        assert!(!files.temp_path(key).exists());
        assert_eq!(files.read(key).unwrap(), Bytes::from_static(b"payload"));
    }

    #[test]
    fn test_read_missing_is_error() {
        let dir = TempDir::new().unwrap();
        let files = FrameFiles::new(dir.path(), "j2c");
        let err = files.read(FrameKey::new(9, Eyes::Both)).unwrap_err();
        assert!(matches!(err, FrameFileError::Read { .. }));
        assert!(err.to_string().contains("00000009.j2c"));
    }
}
