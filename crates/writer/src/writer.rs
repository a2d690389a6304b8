//! The writer: commits encoded frames to the picture asset in frame order.
//!
//! Any number of producer threads hand frames over in whatever order they
//! finish encoding. One dedicated writer thread drains them strictly in
//! [`FrameKey`] order, spilling payloads to their per-frame files when too
//! many are waiting behind a gap. The writer thread is the only owner of the
//! picture asset writer and the frame info store.
//!
//! All queue bookkeeping sits behind one mutex with two condition variables:
//! `work_available` wakes the writer thread, `capacity_freed` wakes producers
//! blocked on the memory bound.

use crate::asset::{AssetError, AssetWriter, AudioBuffers, SoundWriter};
use crate::digest::{frame_hash, FrameHash};
use crate::frame::{expand_for_target, Eyes, FrameKey, EYES_COUNT};
use crate::frame_files::{FrameFileError, FrameFiles};
use crate::frame_info::{FrameInfoError, FrameInfoRecord, FrameInfoStore};
use crate::manifest::SignError;
use crate::plan::{maximum_frames_in_memory, WriterPlan};
use crate::progress::Progress;
use crate::queue::{QueueItem, QueueKind, Rejected, WriterState};
use crate::resume::{check_existing, ResumeState};
use crate::stats::WriterStats;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error, info, trace};

/// Errors from producer calls, the writer thread and finalization.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error(transparent)]
    FrameInfo(#[from] FrameInfoError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    FrameFile(#[from] FrameFileError),

    #[error("Cannot repeat frame {key}: no earlier frame with the same eyes")]
    NothingToRepeat { key: FrameKey },

    #[error("Frame {key} has no verified data from a previous run to fake-write")]
    NotFakeable { key: FrameKey },

    #[error("Frame {key} has per-eye data but the picture asset is 2D")]
    EyesMismatch { key: FrameKey },

    #[error("Frame {key} was already committed")]
    AlreadyCommitted { key: FrameKey },

    #[error("Frame {key} is already queued")]
    AlreadyQueued { key: FrameKey },

    #[error("Writer is finishing and accepts no more frames")]
    Finished,

    #[error("Writer thread failed; the cause is returned by finish()")]
    WriterThreadFailed,

    #[error("Writer thread panicked")]
    WriterThreadPanicked,

    #[error("Writer has already been finished")]
    AlreadyFinished,

    #[error("No sound asset is configured")]
    NoSoundAsset,

    #[error("Failed to start writer thread: {0}")]
    Spawn(std::io::Error),

    #[error("Failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to move asset {from} to {to}: {source}")]
    Relocate {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to compute digest of {path}: {source}")]
    Digest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode manifest: {0}")]
    ManifestEncode(#[from] serde_json::Error),

    #[error(transparent)]
    Sign(#[from] SignError),
}

/// How the writer is set up for one run.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Picture asset holds separate left/right frames
    pub stereoscopic: bool,
    /// Resident FULL frames allowed before producers block
    pub maximum_frames_in_memory: usize,
    /// Frames-per-encoder factor used by `set_encoder_threads`
    pub memory_factor: f32,
    /// Frame info store for the picture asset
    pub info_path: PathBuf,
    /// Per-frame files used for spilling and reloading
    pub frame_files: FrameFiles,
    /// Expected frame count, for progress only
    pub total_frames: Option<u64>,
}

impl WriterOptions {
    pub fn new(plan: &WriterPlan, stereoscopic: bool, info_path: PathBuf, frame_files: FrameFiles) -> Self {
        Self {
            stereoscopic,
            maximum_frames_in_memory: plan.maximum_frames_in_memory,
            memory_factor: plan.memory_factor,
            info_path,
            frame_files,
            total_frames: None,
        }
    }
}

/// Everything the finalizer needs once the writer thread has been joined.
pub struct Committed {
    pub picture: Box<dyn AssetWriter>,
    pub sound: Option<SoundWriter>,
    pub stats: WriterStats,
    pub last_committed: Option<FrameKey>,
    /// Items left queued behind a gap when the writer finished.
    pub abandoned: usize,
}

impl Committed {
    /// Frames in the picture asset: one past the last committed frame index.
    pub fn duration(&self) -> u64 {
        self.last_committed.map_or(0, |key| key.frame + 1)
    }
}

struct Shared {
    state: Mutex<WriterState>,
    work_available: Condvar,
    capacity_freed: Condvar,
}

struct ThreadOutcome {
    picture: Box<dyn AssetWriter>,
    stats: WriterStats,
    last_committed: Option<FrameKey>,
    abandoned: usize,
}

/// Most recently committed FULL frame for one eyes value.
struct LastWritten {
    key: FrameKey,
    /// `None` if the frame had been spilled; it is re-read from its file.
    payload: Option<Bytes>,
    hash: FrameHash,
}

/// State owned exclusively by the writer thread.
struct CommitContext {
    picture: Box<dyn AssetWriter>,
    info: FrameInfoStore,
    frame_files: FrameFiles,
    last_written: [Option<LastWritten>; EYES_COUNT],
    stats: WriterStats,
    progress: Arc<dyn Progress>,
    total_keys: Option<u64>,
    committed: u64,
}

impl CommitContext {
    fn commit(&mut self, item: QueueItem) -> Result<(), WriterError> {
        match item.kind {
            QueueKind::Full => self.commit_full(item)?,
            QueueKind::Fake => self.commit_fake(item)?,
            QueueKind::Repeat => self.commit_repeat(item.key)?,
        }

        self.committed += 1;
        if let Some(total) = self.total_keys.filter(|&t| t > 0) {
            self.progress
                .set_progress((self.committed as f32 / total as f32).min(1.0));
        }
        Ok(())
    }

    fn commit_full(&mut self, item: QueueItem) -> Result<(), WriterError> {
        let key = item.key;
        let (data, resident) = match item.payload {
            Some(payload) => (payload, true),
            None => {
                debug!(key = %key, "writer pulls frame back from disk");
                (self.frame_files.read(key)?, false)
            }
        };

        debug!(key = %key, size = data.len(), "writer FULL-writes frame");
        let written = self.picture.write(&data)?;
        let hash = frame_hash(&data);
        self.info.write(
            key,
            &FrameInfoRecord {
                offset: written.offset,
                size: written.size,
                hash,
            },
        )?;

        self.last_written[key.eyes.index()] = Some(LastWritten {
            key,
            payload: resident.then_some(data),
            hash,
        });
        self.stats.full_written += 1;
        Ok(())
    }

    fn commit_fake(&mut self, item: QueueItem) -> Result<(), WriterError> {
        debug!(key = %item.key, size = item.size, "writer FAKE-writes frame");
        self.picture.fake_write(item.size)?;
        // A fake frame's bytes are not in memory, so it cannot be repeated
        self.last_written[item.key.eyes.index()] = None;
        self.stats.fake_written += 1;
        Ok(())
    }

    fn commit_repeat(&mut self, key: FrameKey) -> Result<(), WriterError> {
        let (source, hash, payload) = match &self.last_written[key.eyes.index()] {
            Some(last) => (last.key, last.hash, last.payload.clone()),
            None => return Err(WriterError::NothingToRepeat { key }),
        };
        let data = match payload {
            Some(data) => data,
            None => self.frame_files.read(source)?,
        };

        debug!(key = %key, source = %source, "writer REPEAT-writes frame");
        let written = self.picture.write(&data)?;
        self.info.write(
            key,
            &FrameInfoRecord {
                offset: written.offset,
                size: written.size,
                hash,
            },
        )?;
        self.stats.repeat_written += 1;
        Ok(())
    }

    fn spill(&mut self, key: FrameKey, awaiting: FrameKey, payload: &[u8]) -> Result<(), WriterError> {
        info!(key = %key, awaiting = %awaiting, "writer full; pushes frame to disk");
        self.frame_files.write(key, payload)?;
        self.stats.pushed_to_disk += 1;
        Ok(())
    }
}

/// Drain loop. Returns the number of items abandoned behind a gap.
fn run(shared: &Shared, ctx: &mut CommitContext) -> Result<usize, WriterError> {
    let mut state = shared.state.lock();
    loop {
        while !(state.finish_requested || state.over_bound() || state.has_sequenced_head()) {
            trace!(queue = state.len(), "writer sleeps");
            shared.work_available.wait(&mut state);
        }

        if state.finish_requested && !state.has_sequenced_head() {
            let abandoned = state.len();
            if abandoned > 0 {
                state.log_abandoned();
            }
            drop(state);
            ctx.info.sync()?;
            return Ok(abandoned);
        }

        while let Some(item) = state.pop_sequenced() {
            let key = item.key;
            MutexGuard::unlocked(&mut state, || ctx.commit(item))?;
            state.mark_committed(key);
            shared.capacity_freed.notify_all();
        }

        // Only a gap keeps frames waiting, so spilling only happens behind one
        while state.over_bound() && !state.has_sequenced_head() {
            let Some((key, payload)) = state.take_spill_candidate() else {
                break;
            };
            let awaiting = state.next_key();
            MutexGuard::unlocked(&mut state, || ctx.spill(key, awaiting, &payload))?;
            state.spill_done();
            shared.capacity_freed.notify_all();
        }
    }
}

fn writer_thread(shared: Arc<Shared>, mut ctx: CommitContext) -> Result<ThreadOutcome, WriterError> {
    let result = run(&shared, &mut ctx);

    let last_committed = {
        let mut state = shared.state.lock();
        state.stopped = true;
        state.failed = result.is_err();
        state.last_committed()
    };
    shared.capacity_freed.notify_all();

    match result {
        Ok(abandoned) => Ok(ThreadOutcome {
            picture: ctx.picture,
            stats: ctx.stats,
            last_committed,
            abandoned,
        }),
        Err(e) => {
            error!(error = %e, last_committed = ?last_committed, "writer thread failed");
            Err(e)
        }
    }
}

/// Producer-facing handle on a running writer.
///
/// Share it between producer threads with an `Arc`; audio goes through
/// [`Writer::write_audio`] from a single thread of its own.
pub struct Writer {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<Result<ThreadOutcome, WriterError>>>>,
    sound: Mutex<Option<SoundWriter>>,
    has_sound: bool,
    resume: ResumeState,
    stereoscopic: bool,
    memory_factor: f32,
}

impl Writer {
    /// Check what an interrupted run left behind, open the assets and start
    /// the writer thread.
    pub fn new(
        options: WriterOptions,
        mut picture: Box<dyn AssetWriter>,
        mut sound: Option<SoundWriter>,
        progress: Arc<dyn Progress>,
    ) -> Result<Self, WriterError> {
        let resume = check_existing(picture.path(), &options.info_path, options.stereoscopic);

        picture.open(resume.is_resuming())?;
        if let Some(sound) = sound.as_mut() {
            sound.open()?;
        }

        if let Some(parent) = options.info_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| FrameInfoError::Open {
                path: options.info_path.clone(),
                source,
            })?;
        }
        let info = FrameInfoStore::open(&options.info_path)?;

        let shared = Arc::new(Shared {
            state: Mutex::new(WriterState::new(
                options.maximum_frames_in_memory,
                options.stereoscopic,
            )),
            work_available: Condvar::new(),
            capacity_freed: Condvar::new(),
        });

        let ctx = CommitContext {
            picture,
            info,
            frame_files: options.frame_files,
            last_written: [None, None, None],
            stats: WriterStats::default(),
            progress,
            total_keys: options
                .total_frames
                .map(|f| if options.stereoscopic { f * 2 } else { f }),
            committed: 0,
        };

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("reelpack-writer".to_string())
            .spawn(move || writer_thread(thread_shared, ctx))
            .map_err(WriterError::Spawn)?;

        info!(
            maximum_frames_in_memory = options.maximum_frames_in_memory,
            stereoscopic = options.stereoscopic,
            resume_from = resume.first_nonexistant_frame(),
            "writer started"
        );

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
            has_sound: sound.is_some(),
            sound: Mutex::new(sound),
            resume,
            stereoscopic: options.stereoscopic,
            memory_factor: options.memory_factor,
        })
    }

    /// Whether `frame` is already durable from a previous run and may be
    /// supplied with [`Writer::fake_write`] instead of being encoded.
    pub fn can_fake_write(&self, frame: u64) -> bool {
        self.resume.can_fake_write(frame)
    }

    pub fn first_nonexistant_frame(&self) -> u64 {
        self.resume.first_nonexistant_frame()
    }

    /// Keys to queue for a producer call; per-eye keys are refused on a 2D target.
    fn target_keys(&self, frame: u64, eyes: Eyes) -> Result<Vec<FrameKey>, WriterError> {
        let key = FrameKey::new(frame, eyes);
        if !eyes.fits_target(self.stereoscopic) {
            return Err(WriterError::EyesMismatch { key });
        }
        Ok(expand_for_target(key, self.stereoscopic))
    }

    /// Queue an encoded frame, blocking while too many are held in memory.
    pub fn write(&self, payload: Bytes, frame: u64, eyes: Eyes) -> Result<(), WriterError> {
        let keys = self.target_keys(frame, eyes)?;
        let mut state = self.shared.state.lock();
        for key in keys {
            while state.over_bound() && !state.stopped {
                self.shared.capacity_freed.wait(&mut state);
            }
            self.push(&mut state, QueueItem::full(key, payload.clone()))?;
        }
        Ok(())
    }

    /// Queue a frame whose bytes a previous run already left in the asset.
    pub fn fake_write(&self, frame: u64, eyes: Eyes) -> Result<(), WriterError> {
        let items = self
            .target_keys(frame, eyes)?
            .into_iter()
            .map(|key| {
                self.resume
                    .record(key)
                    .map(|record| QueueItem::fake(key, record.size))
                    .ok_or(WriterError::NotFakeable { key })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.shared.state.lock();
        for item in items {
            self.push(&mut state, item)?;
        }
        Ok(())
    }

    /// Queue a repeat of the last frame written for the same eyes.
    pub fn repeat(&self, frame: u64, eyes: Eyes) -> Result<(), WriterError> {
        let keys = self.target_keys(frame, eyes)?;
        let mut state = self.shared.state.lock();
        for key in keys {
            self.push(&mut state, QueueItem::repeat(key))?;
        }
        Ok(())
    }

    fn push(&self, state: &mut WriterState, item: QueueItem) -> Result<(), WriterError> {
        if state.failed {
            return Err(WriterError::WriterThreadFailed);
        }
        if state.stopped || state.finish_requested {
            return Err(WriterError::Finished);
        }

        let key = item.key;
        state.insert(item).map_err(|rejected| match rejected {
            Rejected::AlreadyCommitted => WriterError::AlreadyCommitted { key },
            Rejected::AlreadyQueued => WriterError::AlreadyQueued { key },
        })?;
        self.shared.work_available.notify_all();
        Ok(())
    }

    /// Write audio straight to the sound asset. Call from one thread only.
    pub fn write_audio(&self, audio: &AudioBuffers) -> Result<(), WriterError> {
        if !self.has_sound {
            return Err(WriterError::NoSoundAsset);
        }
        match self.sound.lock().as_mut() {
            Some(sound) => Ok(sound.write(audio)?),
            None => Err(WriterError::Finished),
        }
    }

    /// Resize the memory bound for a new number of encoding threads.
    pub fn set_encoder_threads(&self, threads: u32) {
        let frames = maximum_frames_in_memory(threads, self.memory_factor);
        self.shared.state.lock().set_maximum_frames_in_memory(frames);
        debug!(threads, frames, "writer memory bound changed");
        self.shared.work_available.notify_all();
        self.shared.capacity_freed.notify_all();
    }

    pub fn last_committed(&self) -> Option<FrameKey> {
        self.shared.state.lock().last_committed()
    }

    /// Request finish, wait for the writer thread and hand back the assets.
    ///
    /// Sequenced work still queued is committed first; nothing is forced
    /// through a gap. Errors raised on the writer thread are returned here.
    pub fn finish(&self) -> Result<Committed, WriterError> {
        let handle = self
            .thread
            .lock()
            .take()
            .ok_or(WriterError::AlreadyFinished)?;

        self.shared.state.lock().finish_requested = true;
        self.shared.work_available.notify_all();

        let outcome = match handle.join() {
            Ok(result) => result?,
            Err(_) => {
                {
                    let mut state = self.shared.state.lock();
                    state.stopped = true;
                    state.failed = true;
                }
                self.shared.capacity_freed.notify_all();
                return Err(WriterError::WriterThreadPanicked);
            }
        };

        info!(
            full = outcome.stats.full_written,
            fake = outcome.stats.fake_written,
            repeat = outcome.stats.repeat_written,
            pushed_to_disk = outcome.stats.pushed_to_disk,
            "writer finished"
        );

        Ok(Committed {
            picture: outcome.picture,
            sound: self.sound.lock().take(),
            stats: outcome.stats,
            last_committed: outcome.last_committed,
            abandoned: outcome.abandoned,
        })
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if let Some(handle) = self.thread.get_mut().take() {
            self.shared.state.lock().finish_requested = true;
            self.shared.work_available.notify_all();
            if let Ok(Err(e)) = handle.join() {
                error!(error = %e, "writer dropped after failure");
            }
        }
    }
}
