//! File format identification.
//!
//! Detection looks at the extension first, since some TIFF files also pass
//! RAW identification, then sniffs the first bytes of the file. Anything
//! unrecognised is handed to the generic loader.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::loaders::ppm;
use crate::raw;

const HEADER_LEN: usize = 9;

const JPEG_MAGIC: [u8; 2] = [0xFF, 0xD8];
const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const TIFF_BE_MAGIC: [u8; 2] = *b"MM";
const TIFF_LE_MAGIC: [u8; 2] = *b"II";
const JP2_BOX_MAGIC: [u8; 5] = [0x6A, 0x50, 0x20, 0x20, 0x0D];
const J2K_CODESTREAM_MAGIC: [u8; 2] = [0xFF, 0x4F];
const PGF_MAGIC: [u8; 3] = *b"PGF";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FileFormat {
    #[default]
    None,
    Jpeg,
    Png,
    Tiff,
    /// 16-bit binary PPM.
    Ppm,
    Raw,
    Jp2k,
    Pgf,
    /// Anything else, decoded by the generic loader.
    QImage,
}

impl FileFormat {
    /// Stable integer code stored in the `detectedFileFormat` attribute.
    pub fn code(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Jpeg => 1,
            Self::Png => 2,
            Self::Tiff => 3,
            Self::Ppm => 4,
            Self::Raw => 5,
            Self::Jp2k => 6,
            Self::Pgf => 7,
            Self::QImage => 8,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Jpeg,
            2 => Self::Png,
            3 => Self::Tiff,
            4 => Self::Ppm,
            5 => Self::Raw,
            6 => Self::Jp2k,
            7 => Self::Pgf,
            8 => Self::QImage,
            _ => Self::None,
        }
    }

    /// Format from a file extension, case-insensitive.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_uppercase();
        match ext.as_str() {
            "JPEG" | "JPG" | "JPE" => Some(Self::Jpeg),
            "PNG" => Some(Self::Png),
            "TIFF" | "TIF" => Some(Self::Tiff),
            "JP2" | "JPX" | "JPC" | "J2K" | "PGX" => Some(Self::Jp2k),
            "PGF" => Some(Self::Pgf),
            _ if raw::is_raw_extension(&ext) => Some(Self::Raw),
            _ => None,
        }
    }

    /// Format from a save format string such as "JPG" or "tif".
    pub fn from_format_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "PPM" => Self::Ppm,
            other => Self::from_extension(other).unwrap_or(Self::QImage),
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "NONE",
            Self::Jpeg => "JPEG",
            Self::Png => "PNG",
            Self::Tiff => "TIFF",
            Self::Ppm => "PPM",
            Self::Raw => "RAW",
            Self::Jp2k => "JP2K",
            Self::Pgf => "PGF",
            Self::QImage => "QIMAGE",
        };
        f.write_str(name)
    }
}

/// Short type name used in save dialogs and attributes; empty for formats
/// without one.
pub fn format_to_mime_type(format: FileFormat) -> &'static str {
    match format {
        FileFormat::Jpeg => "JPG",
        FileFormat::Tiff => "TIF",
        FileFormat::Png => "PNG",
        FileFormat::Ppm => "PPM",
        FileFormat::Jp2k => "JP2",
        FileFormat::Pgf => "PGF",
        _ => "",
    }
}

/// Identify the format of the file at `path`.
pub fn file_format(path: &Path) -> FileFormat {
    if !path.exists() {
        tracing::debug!("file {} does not exist", path.display());
        return FileFormat::None;
    }

    if let Some(format) = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(FileFormat::from_extension)
    {
        return format;
    }

    let mut header = [0u8; HEADER_LEN];
    let read = File::open(path).and_then(|mut f| f.read_exact(&mut header));
    if let Err(e) = read {
        tracing::debug!("cannot read header of {}: {e}", path.display());
        return FileFormat::None;
    }

    sniff(path, &header)
}

fn sniff(path: &Path, header: &[u8; HEADER_LEN]) -> FileFormat {
    if header.starts_with(&JPEG_MAGIC) {
        FileFormat::Jpeg
    } else if header.starts_with(&PNG_MAGIC) {
        FileFormat::Png
    } else if header[0] == b'P' && header[2] == b'\n' {
        // Only 16-bit PPM has a dedicated loader.
        match ppm::read_header_from_path(path) {
            Ok(h) if h.max_value > 255 => FileFormat::Ppm,
            _ => FileFormat::QImage,
        }
    } else if raw::raw_decoder().is_some_and(|decoder| decoder.identify(path).is_some()) {
        // RAW containers are often TIFF-structured, so this precedes TIFF.
        FileFormat::Raw
    } else if header.starts_with(&TIFF_BE_MAGIC) || header.starts_with(&TIFF_LE_MAGIC) {
        FileFormat::Tiff
    } else if header[4..9] == JP2_BOX_MAGIC || header.starts_with(&J2K_CODESTREAM_MAGIC) {
        FileFormat::Jp2k
    } else if header.starts_with(&PGF_MAGIC) {
        FileFormat::Pgf
    } else {
        FileFormat::QImage
    }
}
