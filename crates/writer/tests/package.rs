//! End-to-end: frames and audio through the writer, then into a package.

use bytes::Bytes;
use hmac::{Hmac, Mac};
use reelpack::asset::TRAILER_SIZE;
use reelpack::config::SigningConfig;
use reelpack::manifest::{MANIFEST_FILE, SIGNATURE_FILE};
use reelpack::{
    file_digest, finalize, signer_from_config, AssetKind, AudioBuffers, EssenceWriter, Eyes,
    FinalizeOptions, FrameFiles, Manifest, NoProgress, Progress, SoundWriter, Writer, WriterError,
    WriterOptions, WriterPlan,
};
use sha2::Sha256;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[derive(Default)]
struct RecordingProgress {
    phases: Mutex<Vec<String>>,
    last: Mutex<f32>,
}

impl Progress for RecordingProgress {
    fn set_progress(&self, fraction: f32) {
        *self.last.lock().unwrap() = fraction;
    }

    fn sub(&self, phase: &str) {
        self.phases.lock().unwrap().push(phase.to_string());
    }
}

fn start(work: &Path, stereoscopic: bool, channels: Option<usize>, progress: Arc<dyn Progress>) -> Writer {
    let plan = WriterPlan::for_threads(4, 1.1);
    let mut options = WriterOptions::new(
        &plan,
        stereoscopic,
        work.join("picture").join("reel.info"),
        FrameFiles::new(work.join("spill"), "j2c"),
    );
    options.total_frames = Some(4);
    let picture = EssenceWriter::new(
        work.join("picture").join("reel.rpk"),
        AssetKind::Picture { stereoscopic },
    );
    let sound = channels.map(|channels| {
        SoundWriter::new(
            Box::new(EssenceWriter::new(
                work.join("sound").join("reel.rpk"),
                AssetKind::Sound {
                    channels: channels as u32,
                    sample_rate: 48000,
                },
            )),
            channels,
        )
    });
    Writer::new(options, Box::new(picture), sound, progress).unwrap()
}

fn options(package: &Path, signing: &SigningConfig) -> FinalizeOptions {
    FinalizeOptions {
        package_dir: package.to_path_buf(),
        name: "reel".to_string(),
        frame_rate: 24,
        stereoscopic: false,
        signer: signer_from_config(signing).unwrap(),
    }
}

fn trailer_duration(path: &Path) -> u64 {
    let bytes = fs::read(path).unwrap();
    let trailer = &bytes[bytes.len() - TRAILER_SIZE as usize..];
    u64::from_le_bytes(trailer[0..8].try_into().unwrap())
}

#[test]
fn test_package_with_sound_and_signature() {
    let work = TempDir::new().unwrap();
    let package = TempDir::new().unwrap();
    let progress = Arc::new(RecordingProgress::default());
    let writer = start(work.path(), false, Some(2), progress.clone());

    for (f, data) in [(2u64, "C"), (0, "A"), (1, "B")] {
        writer.write(Bytes::from(data), f, Eyes::Both).unwrap();
    }
    writer.repeat(3, Eyes::Both).unwrap();
    writer
        .write_audio(&AudioBuffers::from_interleaved(&[0.0, 0.5, -0.5, 1.0], 2))
        .unwrap();

    let committed = writer.finish().unwrap();
    assert_eq!(*progress.last.lock().unwrap(), 1.0);

    let signing = SigningConfig {
        enabled: true,
        key: Some("reel-secret".to_string()),
    };
    let report = finalize(committed, &options(package.path(), &signing), progress.as_ref()).unwrap();

    assert_eq!(report.duration, 4);
    assert_eq!(report.stats.full_written, 3);
    assert_eq!(report.stats.repeat_written, 1);
    assert_eq!(
        *progress.phases.lock().unwrap(),
        vec!["Computing picture digest", "Computing sound digest"]
    );

    let json = fs::read(package.path().join(MANIFEST_FILE)).unwrap();
    let manifest: Manifest = serde_json::from_slice(&json).unwrap();
    assert_eq!(manifest.duration, 4);
    assert_eq!(manifest.assets.len(), 2);

    let picture = manifest.asset("picture").unwrap();
    let picture_path = package.path().join(&picture.file);
    assert_eq!(picture_path, report.picture);
    assert!(picture.file.starts_with("j2c_"));
    assert_eq!(picture.digest, file_digest(&picture_path, |_| {}).unwrap());
    assert_eq!(picture.size, fs::metadata(&picture_path).unwrap().len());

    let sound = manifest.asset("sound").unwrap();
    assert!(sound.file.starts_with("pcm_"));
    assert_eq!(sound.duration, 4);
    // One audio write, but the trailer carries the package duration
    assert_eq!(trailer_duration(&package.path().join(&sound.file)), 4);
    assert_eq!(trailer_duration(&picture_path), 4);
    assert_eq!(
        sound.digest,
        file_digest(&package.path().join(&sound.file), |_| {}).unwrap()
    );

    let signature = fs::read_to_string(package.path().join(SIGNATURE_FILE)).unwrap();
    let mut mac = Hmac::<Sha256>::new_from_slice(b"reel-secret").unwrap();
    mac.update(&json);
    assert!(mac.verify_slice(&hex::decode(signature).unwrap()).is_ok());
}

#[test]
fn test_package_without_signing_has_no_sidecar() {
    let work = TempDir::new().unwrap();
    let package = TempDir::new().unwrap();
    let writer = start(work.path(), false, None, Arc::new(NoProgress));
    writer.write(Bytes::from_static(b"only"), 0, Eyes::Both).unwrap();

    let committed = writer.finish().unwrap();
    let report = finalize(committed, &options(package.path(), &SigningConfig::default()), &NoProgress).unwrap();

    assert_eq!(report.duration, 1);
    assert!(report.signature.is_none());
    assert!(report.sound.is_none());
    assert!(!package.path().join(SIGNATURE_FILE).exists());

    // The packaged picture is the finalized work asset
    assert_eq!(
        fs::read(&report.picture).unwrap(),
        fs::read(work.path().join("picture").join("reel.rpk")).unwrap()
    );
}

#[test]
fn test_interrupted_run_resumes_into_identical_package() {
    let frames: Vec<Vec<u8>> = (0..6u8).map(|f| vec![f; 32 + f as usize]).collect();

    // Reference run in one go
    let reference = TempDir::new().unwrap();
    let writer = start(reference.path(), false, None, Arc::new(NoProgress));
    for (f, data) in frames.iter().enumerate() {
        writer.write(Bytes::from(data.clone()), f as u64, Eyes::Both).unwrap();
    }
    let mut committed = writer.finish().unwrap();
    committed.picture.finalize().unwrap();

    // Interrupted after four frames, then resumed
    let work = TempDir::new().unwrap();
    let writer = start(work.path(), false, None, Arc::new(NoProgress));
    for (f, data) in frames.iter().enumerate().take(4) {
        writer.write(Bytes::from(data.clone()), f as u64, Eyes::Both).unwrap();
    }
    drop(writer);

    let writer = start(work.path(), false, None, Arc::new(NoProgress));
    assert_eq!(writer.first_nonexistant_frame(), 4);
    for (f, data) in frames.iter().enumerate() {
        let f = f as u64;
        if writer.can_fake_write(f) {
            writer.fake_write(f, Eyes::Both).unwrap();
        } else {
            writer.write(Bytes::from(data.clone()), f, Eyes::Both).unwrap();
        }
    }
    let mut committed = writer.finish().unwrap();
    assert_eq!(committed.stats.fake_written, 3);
    committed.picture.finalize().unwrap();

    assert_eq!(
        fs::read(work.path().join("picture").join("reel.rpk")).unwrap(),
        fs::read(reference.path().join("picture").join("reel.rpk")).unwrap()
    );
}

#[test]
fn test_writer_failure_surfaces_at_finish_and_blocks_nothing() {
    let work = TempDir::new().unwrap();
    let writer = start(work.path(), false, None, Arc::new(NoProgress));
    writer.repeat(0, Eyes::Both).unwrap();

    assert!(matches!(
        writer.finish(),
        Err(WriterError::NothingToRepeat { .. })
    ));
    assert!(matches!(
        writer.write(Bytes::from_static(b"late"), 1, Eyes::Both),
        Err(WriterError::WriterThreadFailed)
    ));
}
