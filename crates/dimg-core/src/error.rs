//! Error type shared by the loaders and the image operations.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum DImgError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot identify image format of {}", .0.display())]
    UnknownFormat(PathBuf),
    #[error("{format} decode failed: {message}")]
    Decode {
        format: &'static str,
        message: String,
    },
    #[error("{format} encode failed: {message}")]
    Encode {
        format: &'static str,
        message: String,
    },
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("cannot allocate {width}x{height} image with {bytes_per_pixel} bytes per pixel")]
    Allocation {
        width: u32,
        height: u32,
        bytes_per_pixel: usize,
    },
    #[error("operation cancelled by observer")]
    Cancelled,
    #[error("image is null")]
    NullImage,
    #[error("image history error: {0}")]
    History(String),
    #[error("raw decoder error: {0}")]
    RawDecoder(String),
    #[error("metadata error: {0}")]
    Metadata(String),
}

impl DImgError {
    pub fn decode(format: &'static str, message: impl ToString) -> Self {
        Self::Decode {
            format,
            message: message.to_string(),
        }
    }

    pub fn encode(format: &'static str, message: impl ToString) -> Self {
        Self::Encode {
            format,
            message: message.to_string(),
        }
    }
}

impl From<png::DecodingError> for DImgError {
    fn from(err: png::DecodingError) -> Self {
        match err {
            png::DecodingError::IoError(io) => Self::Io(io),
            other => Self::decode("PNG", other),
        }
    }
}

impl From<png::EncodingError> for DImgError {
    fn from(err: png::EncodingError) -> Self {
        match err {
            png::EncodingError::IoError(io) => Self::Io(io),
            other => Self::encode("PNG", other),
        }
    }
}

impl From<tiff::TiffError> for DImgError {
    fn from(err: tiff::TiffError) -> Self {
        match err {
            tiff::TiffError::IoError(io) => Self::Io(io),
            other => Self::decode("TIFF", other),
        }
    }
}

impl From<image::ImageError> for DImgError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(io) => Self::Io(io),
            image::ImageError::Encoding(e) => Self::encode("image", e),
            image::ImageError::Limits(_) | image::ImageError::Unsupported(_) => {
                Self::Unsupported(err.to_string())
            }
            other => Self::decode("image", other),
        }
    }
}

impl From<quick_xml::Error> for DImgError {
    fn from(err: quick_xml::Error) -> Self {
        Self::History(err.to_string())
    }
}

impl From<exif::Error> for DImgError {
    fn from(err: exif::Error) -> Self {
        Self::Metadata(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DImgError>;
