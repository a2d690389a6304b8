//! Asset writers: the container files that committed frames end up in.
//!
//! The writer core only depends on the [`AssetWriter`] trait. [`EssenceWriter`]
//! is the container used by the package tooling: a flat file with a small
//! header, frames appended verbatim and a trailer written on finalize.

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const HEADER_MAGIC: &[u8; 4] = b"RPAK";
const TRAILER_MAGIC: &[u8; 4] = b"RPKE";
const FORMAT_VERSION: u32 = 1;

/// Bytes before the first frame in an essence file.
pub const HEADER_SIZE: u64 = 16;
/// Bytes after the last frame in a finalized essence file.
pub const TRAILER_SIZE: u64 = 16;

/// Errors raised by asset writers.
#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Failed to open asset {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to write asset {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to finalize asset {path}: {source}")]
    Finalize {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Asset {0} is not open for writing")]
    NotOpen(PathBuf),

    #[error("Audio has {got} channels but the sound asset has {expected}")]
    ChannelMismatch { expected: usize, got: usize },

    #[error("Channel {channel} out of range for {channels}-channel audio")]
    ChannelOutOfRange { channel: usize, channels: usize },
}

/// What an asset holds. Chosen once when the writer is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssetKind {
    Picture { stereoscopic: bool },
    Sound { channels: u32, sample_rate: u32 },
}

impl AssetKind {
    fn tag(self) -> u8 {
        match self {
            AssetKind::Picture {
                stereoscopic: false,
            } => 0,
            AssetKind::Picture { stereoscopic: true } => 1,
            AssetKind::Sound { .. } => 2,
        }
    }

    /// Filename prefix used when the asset is placed in a package.
    pub fn file_prefix(self) -> &'static str {
        match self {
            AssetKind::Picture { .. } => "j2c",
            AssetKind::Sound { .. } => "pcm",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AssetKind::Picture { .. } => "picture",
            AssetKind::Sound { .. } => "sound",
        }
    }
}

/// Where a write landed in the asset file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteInfo {
    pub offset: u64,
    pub size: u64,
}

/// The narrow contract the writer core needs from a container.
pub trait AssetWriter: Send {
    /// Open the container. With `resume`, existing content is kept and the
    /// caller is expected to fake-write the frames that are already present.
    fn open(&mut self, resume: bool) -> Result<(), AssetError>;

    /// Append one frame.
    fn write(&mut self, data: &[u8]) -> Result<WriteInfo, AssetError>;

    /// Account for a frame of `size` bytes that is already in the file.
    fn fake_write(&mut self, size: u64) -> Result<(), AssetError>;

    /// Flush trailing container structures, including the declared duration.
    fn finalize(&mut self) -> Result<(), AssetError>;

    /// Declare the asset's length in picture frames. Must be called before
    /// `finalize` to be recorded in the container.
    fn set_duration(&mut self, frames: u64);

    /// The declared length, if one was set.
    fn duration(&self) -> Option<u64>;

    /// Frames written or fake-written since open.
    fn frames(&self) -> u64;

    fn path(&self) -> &Path;

    fn kind(&self) -> AssetKind;
}

/// Flat-file container: header, frames back to back, trailer.
pub struct EssenceWriter {
    path: PathBuf,
    kind: AssetKind,
    file: Option<File>,
    cursor: u64,
    frames: u64,
    duration: Option<u64>,
}

impl EssenceWriter {
    pub fn new(path: impl Into<PathBuf>, kind: AssetKind) -> Self {
        Self {
            path: path.into(),
            kind,
            file: None,
            cursor: HEADER_SIZE,
            frames: 0,
            duration: None,
        }
    }

    fn header(&self) -> [u8; HEADER_SIZE as usize] {
        let mut out = [0u8; HEADER_SIZE as usize];
        out[0..4].copy_from_slice(HEADER_MAGIC);
        out[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        out[8] = self.kind.tag();
        out
    }

    fn file(&mut self) -> Result<&mut File, AssetError> {
        match self.file.as_mut() {
            Some(f) => Ok(f),
            None => Err(AssetError::NotOpen(self.path.clone())),
        }
    }
}

impl AssetWriter for EssenceWriter {
    fn open(&mut self, resume: bool) -> Result<(), AssetError> {
        let open_err = |source| AssetError::Open {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(open_err)?;
        }

        let resuming = resume && self.path.is_file();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(!resuming)
            .open(&self.path)
            .map_err(open_err)?;

        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&self.header()))
            .map_err(open_err)?;

        self.file = Some(file);
        self.cursor = HEADER_SIZE;
        self.frames = 0;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<WriteInfo, AssetError> {
        let offset = self.cursor;
        let path = self.path.clone();
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))
            .and_then(|_| file.write_all(data))
            .map_err(|source| AssetError::Write { path, source })?;

        let size = data.len() as u64;
        self.cursor += size;
        self.frames += 1;
        Ok(WriteInfo { offset, size })
    }

    fn fake_write(&mut self, size: u64) -> Result<(), AssetError> {
        self.file()?;
        self.cursor += size;
        self.frames += 1;
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), AssetError> {
        let mut trailer = [0u8; TRAILER_SIZE as usize];
        let duration = self.duration.unwrap_or(self.frames);
        trailer[0..8].copy_from_slice(&duration.to_le_bytes());
        trailer[8..12].copy_from_slice(TRAILER_MAGIC);

        let cursor = self.cursor;
        let path = self.path.clone();
        let mut file = self
            .file
            .take()
            .ok_or_else(|| AssetError::NotOpen(path.clone()))?;

        file.set_len(cursor)
            .and_then(|_| file.seek(SeekFrom::Start(cursor)))
            .and_then(|_| file.write_all(&trailer))
            .and_then(|_| file.sync_all())
            .map_err(|source| AssetError::Finalize { path, source })
    }

    fn set_duration(&mut self, frames: u64) {
        self.duration = Some(frames);
    }

    fn duration(&self) -> Option<u64> {
        self.duration
    }

    fn frames(&self) -> u64 {
        self.frames
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn kind(&self) -> AssetKind {
        self.kind
    }
}

/// Planar audio: one sample vector per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffers {
    channels: Vec<Vec<f32>>,
}

impl AudioBuffers {
    /// Silent buffers of the given shape.
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            channels: vec![vec![0.0; frames]; channels],
        }
    }

    pub fn from_channels(channels: Vec<Vec<f32>>) -> Self {
        Self { channels }
    }

    /// De-interleave `data`; a trailing partial sample frame is dropped.
    pub fn from_interleaved(data: &[f32], channels: usize) -> Self {
        if channels == 0 {
            return Self { channels: Vec::new() };
        }
        let frames = data.len() / channels;
        let mut out = vec![Vec::with_capacity(frames); channels];
        for frame in data.chunks_exact(channels) {
            for (c, sample) in frame.iter().enumerate() {
                out[c].push(*sample);
            }
        }
        Self { channels: out }
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    /// Sample frames; the shortest channel wins if they differ.
    pub fn frames(&self) -> usize {
        self.channels.iter().map(Vec::len).min().unwrap_or(0)
    }

    pub fn channel(&self, channel: usize) -> Result<&[f32], AssetError> {
        self.channels
            .get(channel)
            .map(Vec::as_slice)
            .ok_or(AssetError::ChannelOutOfRange {
                channel,
                channels: self.channels.len(),
            })
    }

    /// Interleaved signed 24-bit little-endian PCM.
    pub fn to_pcm24(&self) -> Vec<u8> {
        let frames = self.frames();
        let mut out = Vec::with_capacity(frames * self.channels.len() * 3);
        for i in 0..frames {
            for channel in &self.channels {
                let sample = (channel[i].clamp(-1.0, 1.0) * 8_388_607.0).round() as i32;
                out.extend_from_slice(&sample.to_le_bytes()[0..3]);
            }
        }
        out
    }
}

/// Sound asset: packs audio buffers into its own asset writer.
///
/// Audio arrives in order from a single producer, so there is no queue.
pub struct SoundWriter {
    writer: Box<dyn AssetWriter>,
    channels: usize,
    samples_written: u64,
}

impl SoundWriter {
    pub fn new(writer: Box<dyn AssetWriter>, channels: usize) -> Self {
        Self {
            writer,
            channels,
            samples_written: 0,
        }
    }

    pub fn open(&mut self) -> Result<(), AssetError> {
        self.writer.open(false)
    }

    pub fn write(&mut self, audio: &AudioBuffers) -> Result<(), AssetError> {
        if audio.channels() != self.channels {
            return Err(AssetError::ChannelMismatch {
                expected: self.channels,
                got: audio.channels(),
            });
        }
        if audio.frames() == 0 {
            return Ok(());
        }
        self.writer.write(&audio.to_pcm24())?;
        self.samples_written += audio.frames() as u64;
        Ok(())
    }

    pub fn samples_written(&self) -> u64 {
        self.samples_written
    }

    pub fn into_inner(self) -> Box<dyn AssetWriter> {
        self.writer
    }
}
