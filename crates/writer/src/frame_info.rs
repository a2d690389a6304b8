//! Frame info store: one fixed-width record per committed frame.
//!
//! Records are `{offset: u64 LE, size: u64 LE, hash: 32 bytes}` and sit at
//! `info_index × 48` in the file, so any frame's record can be read directly.
//! The store is what lets a later run check the bytes of an interrupted
//! asset without re-encoding them.

use crate::digest::{FrameHash, HASH_LENGTH};
use crate::frame::FrameKey;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bytes per record on disk.
pub const RECORD_SIZE: usize = 8 + 8 + HASH_LENGTH;

/// Errors from reading or writing the frame info store.
#[derive(Debug, Error)]
pub enum FrameInfoError {
    #[error("Failed to open frame info store {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read frame info record {index} from {path}: {source}")]
    Read {
        path: PathBuf,
        index: u64,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write frame info record {index} to {path}: {source}")]
    Write {
        path: PathBuf,
        index: u64,
        #[source]
        source: io::Error,
    },
}

/// Where a committed frame landed in its asset, and what it hashed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfoRecord {
    pub offset: u64,
    pub size: u64,
    pub hash: FrameHash,
}

impl FrameInfoRecord {
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut out = [0u8; RECORD_SIZE];
        out[0..8].copy_from_slice(&self.offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..].copy_from_slice(self.hash.as_bytes());
        out
    }

    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Self {
        let mut offset = [0u8; 8];
        let mut size = [0u8; 8];
        let mut hash = [0u8; HASH_LENGTH];
        offset.copy_from_slice(&buf[0..8]);
        size.copy_from_slice(&buf[8..16]);
        hash.copy_from_slice(&buf[16..]);
        Self {
            offset: u64::from_le_bytes(offset),
            size: u64::from_le_bytes(size),
            hash: FrameHash::from_bytes(hash),
        }
    }
}

/// Handle on a frame info file.
pub struct FrameInfoStore {
    path: PathBuf,
    file: File,
}

impl FrameInfoStore {
    /// Open for reading and writing, creating the file if needed.
    ///
    /// Existing records are kept; a resumed run overwrites them in place.
    pub fn open(path: &Path) -> Result<Self, FrameInfoError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| FrameInfoError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Open an existing store without write access.
    pub fn open_read_only(path: &Path) -> Result<Self, FrameInfoError> {
        let file = File::open(path).map_err(|source| FrameInfoError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Read the record for `key`, or `None` if the file ends before it.
    pub fn read(&mut self, key: FrameKey) -> Result<Option<FrameInfoRecord>, FrameInfoError> {
        let index = key.info_index();
        let mut buf = [0u8; RECORD_SIZE];
        let result = self
            .file
            .seek(SeekFrom::Start(index * RECORD_SIZE as u64))
            .and_then(|_| self.file.read_exact(&mut buf));

        match result {
            Ok(()) => Ok(Some(FrameInfoRecord::decode(&buf))),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
            Err(source) => Err(FrameInfoError::Read {
                path: self.path.clone(),
                index,
                source,
            }),
        }
    }

    /// Write the record for `key` at its fixed position.
    pub fn write(&mut self, key: FrameKey, record: &FrameInfoRecord) -> Result<(), FrameInfoError> {
        let index = key.info_index();
        self.file
            .seek(SeekFrom::Start(index * RECORD_SIZE as u64))
            .and_then(|_| self.file.write_all(&record.encode()))
            .map_err(|source| FrameInfoError::Write {
                path: self.path.clone(),
                index,
                source,
            })
    }

    /// Flush records to stable storage.
    pub fn sync(&mut self) -> Result<(), FrameInfoError> {
        self.file.sync_data().map_err(|source| FrameInfoError::Write {
            path: self.path.clone(),
            index: 0,
            source,
        })
    }
}
