//! Asset finalizer: turns the committed assets into a package.
//!
//! Runs once, after [`Writer::finish`](crate::writer::Writer::finish) has
//! joined the writer thread. Any failure aborts finalization; files already
//! produced are left where they are for inspection.

use crate::asset::AssetWriter;
use crate::digest::file_digest;
use crate::manifest::{Manifest, ManifestAsset, Signer, MANIFEST_FILE, SIGNATURE_FILE};
use crate::progress::Progress;
use crate::stats::WriterStats;
use crate::writer::{Committed, WriterError};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Extension of relocated asset files.
pub const ASSET_EXTENSION: &str = "rpk";

pub struct FinalizeOptions {
    pub package_dir: PathBuf,
    pub name: String,
    pub frame_rate: u32,
    pub stereoscopic: bool,
    pub signer: Option<Box<dyn Signer>>,
}

/// What finalization produced.
#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub package_dir: PathBuf,
    pub manifest: PathBuf,
    pub signature: Option<PathBuf>,
    pub picture: PathBuf,
    pub sound: Option<PathBuf>,
    pub duration: u64,
    pub stats: WriterStats,
    pub abandoned: usize,
}

/// Hard-link `from` to `to`, falling back to a byte copy.
///
/// # Arguments
///
/// * `from` - Finalized asset in the work directory
/// * `to` - Destination inside the package directory
///
/// # Returns
///
/// `true` if a hard link was made, `false` if the file was copied.
pub fn link_or_copy(from: &Path, to: &Path) -> Result<bool, WriterError> {
    match fs::hard_link(from, to) {
        Ok(()) => {
            debug!(from = %from.display(), to = %to.display(), "hard-linked asset");
            Ok(true)
        }
        Err(e) => {
            warn!(
                from = %from.display(),
                to = %to.display(),
                error = %e,
                "hard link failed; copying asset instead"
            );
            fs::copy(from, to).map_err(|source| WriterError::Relocate {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                source,
            })?;
            Ok(false)
        }
    }
}

/// Relocate one finalized asset and describe it for the manifest.
fn package_asset(
    asset: &dyn AssetWriter,
    package_dir: &Path,
    phase: &str,
    progress: &dyn Progress,
) -> Result<(ManifestAsset, PathBuf), WriterError> {
    let id = Uuid::new_v4();
    let kind = asset.kind();
    let duration = asset.duration().unwrap_or_else(|| asset.frames());
    let file = format!("{}_{}.{}", kind.file_prefix(), id, ASSET_EXTENSION);
    let target = package_dir.join(&file);

    link_or_copy(asset.path(), &target)?;

    progress.sub(phase);
    let digest = file_digest(&target, |f| progress.set_progress(f)).map_err(|source| {
        WriterError::Digest {
            path: target.clone(),
            source,
        }
    })?;
    let size = fs::metadata(&target)
        .map_err(|source| WriterError::Digest {
            path: target.clone(),
            source,
        })?
        .len();

    Ok((
        ManifestAsset {
            id,
            kind,
            file,
            size,
            digest,
            duration,
        },
        target,
    ))
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), WriterError> {
    fs::write(path, contents).map_err(|source| WriterError::Manifest {
        path: path.to_path_buf(),
        source,
    })
}

/// Finalize the assets, lay out the package and write its manifest.
pub fn finalize(
    committed: Committed,
    options: &FinalizeOptions,
    progress: &dyn Progress,
) -> Result<FinalizeReport, WriterError> {
    let duration = committed.duration();
    let Committed {
        mut picture,
        sound,
        stats,
        abandoned,
        ..
    } = committed;

    // Duration is declared first so the container trailer records it
    picture.set_duration(duration);
    picture.finalize()?;
    let sound = match sound {
        Some(sound) => {
            debug!(samples = sound.samples_written(), "finalizing sound asset");
            let mut writer = sound.into_inner();
            writer.set_duration(duration);
            writer.finalize()?;
            Some(writer)
        }
        None => None,
    };

    fs::create_dir_all(&options.package_dir).map_err(|source| WriterError::CreateDir {
        path: options.package_dir.clone(),
        source,
    })?;

    let (picture_entry, picture_path) = package_asset(
        &*picture,
        &options.package_dir,
        "Computing picture digest",
        progress,
    )?;
    let mut assets = vec![picture_entry];
    let mut sound_path = None;
    if let Some(sound) = sound.as_deref() {
        let (entry, path) = package_asset(
            sound,
            &options.package_dir,
            "Computing sound digest",
            progress,
        )?;
        assets.push(entry);
        sound_path = Some(path);
    }

    let manifest = Manifest {
        id: Uuid::new_v4(),
        name: options.name.clone(),
        frame_rate: options.frame_rate,
        duration,
        stereoscopic: options.stereoscopic,
        assets,
    };
    let json = manifest.to_json()?;
    let manifest_path = options.package_dir.join(MANIFEST_FILE);
    write_file(&manifest_path, &json)?;

    let signature = match options.signer.as_deref() {
        Some(signer) => {
            let path = options.package_dir.join(SIGNATURE_FILE);
            write_file(&path, hex::encode(signer.sign(&json)?).as_bytes())?;
            Some(path)
        }
        None => None,
    };

    info!(
        committed = stats.committed(),
        full = stats.full_written,
        fake = stats.fake_written,
        repeat = stats.repeat_written,
        pushed_to_disk = stats.pushed_to_disk,
        "frames committed"
    );
    info!(
        package = %options.package_dir.display(),
        duration,
        signed = signature.is_some(),
        "package finalized"
    );

    Ok(FinalizeReport {
        package_dir: options.package_dir.clone(),
        manifest: manifest_path,
        signature,
        picture: picture_path,
        sound: sound_path,
        duration,
        stats,
        abandoned,
    })
}
