//! CLI entry point for reelpack
//!
//! Feeds pre-encoded per-frame files through the writer, resuming any
//! interrupted run in the work directory, and finalizes a package.

use reelpack::{
    derive_plan, finalize, signer_from_config, AssetKind, AudioBuffers, Config, EssenceWriter,
    Eyes, FinalizeOptions, FinalizeReport, FrameFiles, FrameKey, LogProgress, SoundWriter, Writer,
    WriterOptions,
};
use clap::Parser;
use std::error::Error;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn Error + Send + Sync>;

/// Reelpack - ordered, resumable packaging of encoded frames
#[derive(Parser, Debug)]
#[command(name = "reelpack")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "reelpack.toml")]
    config: PathBuf,

    /// Directory of encoded frames named <frame:08>[.L|.R].j2c
    #[arg(long)]
    frames_dir: PathBuf,

    /// Directory for in-progress assets, frame info and spilled frames
    #[arg(short, long, default_value = "/tmp/reelpack")]
    work_dir: PathBuf,

    /// Package output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Number of frames to package
    #[arg(long)]
    frames: u64,

    /// Raw interleaved little-endian f32 audio
    #[arg(long)]
    audio: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

fn load_config(path: &Path) -> Result<Config, BoxError> {
    if path.is_file() {
        Ok(Config::load(path)?)
    } else {
        info!(path = %path.display(), "no config file; using defaults");
        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }
}

/// Hand one frame to the writer, from the previous run or from its file.
fn supply_frame(writer: &Writer, inputs: &FrameFiles, frame: u64, stereoscopic: bool) -> Result<(), BoxError> {
    if writer.can_fake_write(frame) {
        writer.fake_write(frame, Eyes::Both)?;
        return Ok(());
    }

    let left = FrameKey::new(frame, Eyes::Left);
    let right = FrameKey::new(frame, Eyes::Right);
    if stereoscopic && inputs.exists(left) && inputs.exists(right) {
        writer.write(inputs.read(left)?, frame, Eyes::Left)?;
        writer.write(inputs.read(right)?, frame, Eyes::Right)?;
    } else {
        let data = inputs.read(FrameKey::new(frame, Eyes::Both))?;
        writer.write(data, frame, Eyes::Both)?;
    }
    Ok(())
}

/// Fill `buf` as far as the reader allows; returns bytes read.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Stream audio to the sound asset, one video frame's worth at a time.
fn write_audio(writer: &Writer, path: &Path, channels: usize, samples_per_frame: usize) -> Result<(), BoxError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = vec![0u8; samples_per_frame.max(1) * channels * 4];
    loop {
        let n = read_up_to(&mut reader, &mut buf)?;
        let usable = n - n % (channels * 4);
        if usable == 0 {
            break;
        }
        let samples: Vec<f32> = buf[..usable]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        writer.write_audio(&AudioBuffers::from_interleaved(&samples, channels))?;
        if n < buf.len() {
            break;
        }
    }
    Ok(())
}

async fn run(args: Args) -> Result<FinalizeReport, BoxError> {
    let config = load_config(&args.config)?;
    let plan = derive_plan(&config);
    let package = &config.package;
    let stereoscopic = package.stereoscopic;
    info!(
        threads = plan.encoding_threads,
        maximum_frames_in_memory = plan.maximum_frames_in_memory,
        "writer plan"
    );

    let name = &package.name;
    let picture_dir = args.work_dir.join("picture");
    let picture = EssenceWriter::new(
        picture_dir.join(format!("{name}.rpk")),
        AssetKind::Picture { stereoscopic },
    );

    let channels = package.audio_channels as usize;
    let sound = match (&args.audio, channels) {
        (Some(_), 0) => return Err("--audio given but audio_channels is 0".into()),
        (Some(_), _) => Some(SoundWriter::new(
            Box::new(EssenceWriter::new(
                args.work_dir.join("sound").join(format!("{name}.rpk")),
                AssetKind::Sound {
                    channels: package.audio_channels,
                    sample_rate: package.sample_rate,
                },
            )),
            channels,
        )),
        (None, _) => None,
    };

    let mut options = WriterOptions::new(
        &plan,
        stereoscopic,
        picture_dir.join(format!("{name}.info")),
        FrameFiles::new(args.work_dir.join("spill"), "j2c"),
    );
    options.total_frames = Some(package.total_frames.unwrap_or(args.frames));

    let progress = Arc::new(LogProgress::default());
    let writer = Arc::new(Writer::new(options, Box::new(picture), sound, progress.clone())?);
    info!(
        frames = args.frames,
        reusable = writer.first_nonexistant_frame(),
        "feeding frames"
    );

    let audio = match &args.audio {
        Some(path) => {
            let writer = writer.clone();
            let path = path.clone();
            let samples_per_frame = (package.sample_rate / package.frame_rate.max(1)) as usize;
            Some(
                std::thread::Builder::new()
                    .name("reelpack-audio".to_string())
                    .spawn(move || write_audio(&writer, &path, channels, samples_per_frame))?,
            )
        }
        None => None,
    };

    let inputs = FrameFiles::new(&args.frames_dir, "j2c");
    let semaphore = Arc::new(Semaphore::new(plan.encoding_threads.max(1) as usize));
    let mut producers = Vec::with_capacity(args.frames as usize);
    for frame in 0..args.frames {
        let permit = semaphore.clone().acquire_owned().await?;
        let writer = writer.clone();
        let inputs = inputs.clone();
        producers.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            debug!(frame, "supplying frame");
            supply_frame(&writer, &inputs, frame, stereoscopic)
        }));
    }

    let mut first_error: Option<BoxError> = None;
    for producer in producers {
        match producer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "producer failed");
                first_error.get_or_insert(e);
            }
            Err(e) => {
                first_error.get_or_insert(Box::new(e));
            }
        }
    }

    if let Some(handle) = audio {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(error = %e, "audio failed");
                first_error.get_or_insert(e);
            }
            Err(_) => {
                first_error.get_or_insert("audio thread panicked".into());
            }
        }
    }

    // The writer's own failure explains a producer failure, so report it first
    let committed = writer.finish()?;
    if let Some(e) = first_error {
        return Err(e);
    }

    let finalize_options = FinalizeOptions {
        package_dir: args.output.clone(),
        name: name.clone(),
        frame_rate: package.frame_rate,
        stereoscopic,
        signer: signer_from_config(&config.signing)?,
    };
    Ok(finalize(committed, &finalize_options, progress.as_ref())?)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{}", json);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("Failed to encode report: {}", e);
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("reelpack failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
