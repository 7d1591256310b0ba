//! DImg Core: an in-memory image engine.
//!
//! A bit-depth-agnostic pixel buffer (8 or 16 bits per channel, always
//! four interleaved BGRA channels), a format dispatcher with per-format
//! loaders, pixel and geometry operations, and the provenance layer
//! (attributes, embedded text, ICC profile, image history, fingerprints).
//! No GUI and no color management.

pub mod color;
pub mod composer;
pub mod config;
pub mod error;
pub mod filelock;
pub mod format;
pub mod hash;
pub mod history;
pub mod image;
pub mod loaders;
pub mod metadata;
pub mod observer;
pub mod ops;
pub mod raw;

// Re-exports for convenience.
pub use color::DColor;
pub use composer::{DColorComposer, MultiplicationFlags, PorterDuffRule};
pub use config::{EngineConfig, SaveSettings};
pub use error::DImgError;
pub use format::FileFormat;
pub use history::{DImageHistory, FilterAction, HistoryImageId, HistoryImageIdType};
pub use image::attributes::AttributeValue;
pub use image::{AspectRatioMode, BitDepth, ColorModel, DImg, IccProfile};
pub use loaders::jp2k::{Jpeg2000Codec, set_jpeg2000_codec};
pub use loaders::pgf::{PgfCodec, set_pgf_codec};
pub use loaders::{CodecPixels, LoadFlags};
pub use metadata::ImageMetadata;
pub use observer::{CancellationToken, DImgLoaderObserver, NoopObserver};
pub use ops::{Angle, Flip, RectF, Region, TransformAction};
pub use raw::{RawDecoder, RawDecodingSettings, set_raw_decoder};
