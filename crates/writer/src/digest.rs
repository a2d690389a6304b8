//! Frame hashes and whole-file content digests.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Length of a frame hash on disk: lowercase hex MD5.
pub const HASH_LENGTH: usize = 32;

const DIGEST_BUFFER_SIZE: usize = 64 * 1024;

/// Hex MD5 of one committed frame's bytes, as stored in frame info records.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHash([u8; HASH_LENGTH]);

impl FrameHash {
    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("<invalid>")
    }
}

impl fmt::Debug for FrameHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameHash({})", self.as_str())
    }
}

impl fmt::Display for FrameHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn from_digest(digest: md5::Digest) -> FrameHash {
    let hex = format!("{:x}", digest);
    let mut bytes = [0u8; HASH_LENGTH];
    bytes.copy_from_slice(hex.as_bytes());
    FrameHash(bytes)
}

/// Hash a frame's bytes.
pub fn frame_hash(data: &[u8]) -> FrameHash {
    from_digest(md5::compute(data))
}

/// Hash at most `len` bytes streamed from `reader`.
///
/// Returns the hash and the number of bytes actually read, which is short of
/// `len` if the reader ran out first.
pub fn frame_hash_reader<R: Read>(reader: R, len: u64) -> io::Result<(FrameHash, u64)> {
    let mut context = md5::Context::new();
    let read = io::copy(&mut reader.take(len), &mut context)?;
    Ok((from_digest(context.finalize()), read))
}

/// Stream a file through SHA-256, reporting the fraction read so far.
///
/// Returns the lowercase hex digest.
pub fn file_digest<F>(path: &Path, mut progress: F) -> io::Result<String>
where
    F: FnMut(f32),
{
    let mut file = File::open(path)?;
    let total = file.metadata()?.len();
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DIGEST_BUFFER_SIZE];
    let mut done: u64 = 0;

    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        done += n as u64;
        if total > 0 {
            progress(done as f32 / total as f32);
        }
    }

    progress(1.0);
    Ok(hex::encode(hasher.finalize()))
}
