//! Content fingerprints used for identity and deduplication.
//!
//! Two algorithms coexist:
//! - legacy: digest of (Exif bytes, first 8 KiB of the file, decimal file size)
//! - v2: digest of the first and last 100 KiB of the file, independent of format
//!
//! Both are BLAKE3 digests rendered as lowercase hex. They identify a file,
//! they do not prove integrity.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::Result;

/// Bytes from the start of the file fed into the legacy fingerprint.
pub const LEGACY_HEAD_BYTES: usize = 8192;
/// Window size at each end of the file for the v2 fingerprint.
pub const V2_WINDOW_BYTES: u64 = 100 * 1024;

/// Legacy fingerprint over metadata bytes and the file head.
pub fn unique_hash(path: &Path, exif: &[u8]) -> Result<String> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();

    let mut head = Vec::with_capacity(LEGACY_HEAD_BYTES);
    (&mut file)
        .take(LEGACY_HEAD_BYTES as u64)
        .read_to_end(&mut head)?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(exif);
    hasher.update(&head);
    hasher.update(size.to_string().as_bytes());
    Ok(hasher.finalize().to_hex().to_string())
}

/// V2 fingerprint over the first and last 100 KiB.
///
/// Files shorter than the window contribute their full content twice.
pub fn unique_hash_v2(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let window = size.min(V2_WINDOW_BYTES);

    let mut buf = vec![0u8; window as usize];
    let mut hasher = blake3::Hasher::new();

    file.read_exact(&mut buf)?;
    hasher.update(&buf);

    file.seek(SeekFrom::Start(size - window))?;
    file.read_exact(&mut buf)?;
    hasher.update(&buf);

    Ok(hasher.finalize().to_hex().to_string())
}
