//! Per-format codecs behind one interface.
//!
//! A loader decodes a file into a [`LoadedImage`] in the canonical BGRA
//! layout and encodes a [`DImg`] back into its container. Loaders never
//! touch image internals: the dispatcher in `image::io` installs what they
//! return.

pub mod generic;
pub mod jp2k;
pub mod jpeg;
pub mod pgf;
pub mod png;
pub mod ppm;
pub mod raw;
pub mod tiff;

use std::collections::BTreeMap;
use std::path::Path;

use bitflags::bitflags;

use crate::config::{SaveSettings, save_settings};
use crate::error::{DImgError, Result};
use crate::format::FileFormat;
use crate::history::DImageHistory;
use crate::image::attributes::{AttributeMap, AttributeValue, keys};
use crate::image::{ColorModel, DImg, IccProfile, allocate_buffer};
use crate::metadata::{ExifColorSpace, ImageMetadata};
use crate::observer::{self, DImgLoaderObserver};
use crate::raw::RawDecodingSettings;

bitflags! {
    /// Parts of a file a load materializes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LoadFlags: u8 {
        const IMAGE_INFO = 1 << 0;
        const METADATA = 1 << 1;
        const ICC_DATA = 1 << 2;
        const IMAGE_DATA = 1 << 3;
        const UNIQUE_HASH = 1 << 4;
        const UNIQUE_HASH_V2 = 1 << 5;
        const IMAGE_HISTORY = 1 << 6;

        const ALL = Self::IMAGE_INFO.bits()
            | Self::METADATA.bits()
            | Self::ICC_DATA.bits()
            | Self::IMAGE_DATA.bits()
            | Self::UNIQUE_HASH.bits()
            | Self::UNIQUE_HASH_V2.bits()
            | Self::IMAGE_HISTORY.bits();
        /// Everything except pixel data and fingerprints.
        const INFO_ONLY = Self::IMAGE_INFO.bits()
            | Self::METADATA.bits()
            | Self::ICC_DATA.bits()
            | Self::IMAGE_HISTORY.bits();
    }
}

impl Default for LoadFlags {
    fn default() -> Self {
        Self::ALL
    }
}

/// Inputs shared by every loader for one load call.
pub struct LoadContext<'a> {
    pub flags: LoadFlags,
    pub observer: Option<&'a dyn DImgLoaderObserver>,
    pub raw_settings: RawDecodingSettings,
}

impl<'a> LoadContext<'a> {
    pub fn new(flags: LoadFlags, observer: Option<&'a dyn DImgLoaderObserver>) -> Self {
        Self {
            flags,
            observer,
            raw_settings: RawDecodingSettings::default(),
        }
    }

    pub fn wants(&self, flag: LoadFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn wants_pixels(&self) -> bool {
        self.flags.contains(LoadFlags::IMAGE_DATA)
    }

    /// Poll the observer; `Cancelled` when it asks to stop.
    pub fn check_cancel(&self) -> Result<()> {
        if observer::should_continue(self.observer) {
            Ok(())
        } else {
            Err(DImgError::Cancelled)
        }
    }

    pub fn report(&self, progress: f32) {
        observer::report(self.observer, progress);
    }

    /// Row checkpoints covering `0.1 + span * row / total` of the bar.
    pub fn rows(&self, total: u32, span: f32) -> RowProgress<'a> {
        RowProgress {
            observer: self.observer,
            total: total.max(1),
            step: observer::granularity(self.observer, total as usize, span) as u32,
            start: 0.1,
            span,
        }
    }
}

/// Cooperative checkpoints for a row or strip loop.
pub struct RowProgress<'a> {
    observer: Option<&'a dyn DImgLoaderObserver>,
    total: u32,
    step: u32,
    start: f32,
    span: f32,
}

impl RowProgress<'_> {
    /// Poll and report at every `step` rows.
    pub fn checkpoint(&self, row: u32) -> Result<()> {
        if self.observer.is_none() || row % self.step != 0 {
            return Ok(());
        }
        if !observer::should_continue(self.observer) {
            return Err(DImgError::Cancelled);
        }
        observer::report(
            self.observer,
            self.start + self.span * row as f32 / self.total as f32,
        );
        Ok(())
    }
}

/// Inputs for one save call: the observer and the effective settings
/// after per-image `quality` / `compress` attributes are applied.
pub struct SaveContext<'a> {
    pub observer: Option<&'a dyn DImgLoaderObserver>,
    pub settings: SaveSettings,
    /// Explicit `quality` attribute, when the caller set one.
    pub quality: Option<u8>,
    /// Explicit `compress` attribute, when the caller set one.
    pub compress: Option<bool>,
    pub software: String,
}

impl<'a> SaveContext<'a> {
    pub fn for_image(image: &DImg, observer: Option<&'a dyn DImgLoaderObserver>) -> Self {
        let quality = image
            .attribute(keys::QUALITY)
            .and_then(AttributeValue::as_int)
            .map(|q| q.clamp(0, 100) as u8);
        let compress = image.attribute(keys::COMPRESS).and_then(AttributeValue::as_bool);
        Self {
            observer,
            settings: save_settings(),
            quality,
            compress,
            software: crate::config::engine_config().software_stamp,
        }
    }

    pub fn check_cancel(&self) -> Result<()> {
        if observer::should_continue(self.observer) {
            Ok(())
        } else {
            Err(DImgError::Cancelled)
        }
    }

    pub fn report(&self, progress: f32) {
        observer::report(self.observer, progress);
    }

    pub fn rows(&self, total: u32, span: f32) -> RowProgress<'a> {
        RowProgress {
            observer: self.observer,
            total: total.max(1),
            step: observer::granularity(self.observer, total as usize, span) as u32,
            start: 0.1,
            span,
        }
    }
}

/// Everything a loader produced, ready to be installed into a `DImg`.
#[derive(Debug, Clone, Default)]
pub struct LoadedImage {
    pub width: u32,
    pub height: u32,
    pub sixteen_bit: bool,
    pub alpha: bool,
    /// Canonical BGRA buffer; empty when pixel data was not requested.
    pub data: Vec<u8>,
    pub attributes: AttributeMap,
    pub embedded_text: BTreeMap<String, String>,
    pub icc: IccProfile,
    pub metadata: ImageMetadata,
    pub history: Option<DImageHistory>,
}

impl LoadedImage {
    pub fn new(width: u32, height: u32, sixteen_bit: bool, alpha: bool) -> Self {
        Self {
            width,
            height,
            sixteen_bit,
            alpha,
            ..Self::default()
        }
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    /// Record the source description every loader reports.
    pub fn set_origin(&mut self, format: &str, model: ColorModel, bit_depth: u32) {
        self.set_attribute(keys::FORMAT, format);
        self.set_attribute(keys::ORIGINAL_COLOR_MODEL, model.code());
        self.set_attribute(keys::ORIGINAL_BIT_DEPTH, bit_depth);
        self.set_attribute(keys::ORIGINAL_SIZE, (self.width, self.height));
    }

    /// Zeroed canonical buffer for the current geometry.
    pub fn allocate(&mut self) -> Result<()> {
        self.data = allocate_buffer(self.width, self.height, self.sixteen_bit)?;
        Ok(())
    }

    pub fn bytes_depth(&self) -> usize {
        if self.sixteen_bit { 8 } else { 4 }
    }

    /// Parse the XMP history into both the history and the
    /// `originalImageHistory` attribute.
    pub fn read_history(&mut self, ctx: &LoadContext<'_>) {
        if !ctx.wants(LoadFlags::IMAGE_HISTORY) {
            return;
        }
        let Some(xml) = self.metadata.image_history_xml() else {
            return;
        };
        match DImageHistory::from_xml(xml) {
            Ok(history) => {
                self.set_attribute(keys::ORIGINAL_IMAGE_HISTORY, history.clone());
                self.history = Some(history);
            }
            Err(e) => tracing::warn!("ignoring unreadable image history: {e}"),
        }
    }

    /// Without embedded profile bytes, infer a working space from Exif.
    pub fn infer_icc_from_exif(&mut self) {
        if !self.icc.is_null() {
            return;
        }
        self.icc = match self.metadata.color_space() {
            ExifColorSpace::Srgb => IccProfile::Srgb,
            ExifColorSpace::AdobeRgb => IccProfile::AdobeRgb,
            ExifColorSpace::Unknown => IccProfile::None,
        };
    }
}

/// Flags a loader reports about its last load or save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoaderState {
    pub alpha: bool,
    pub sixteen_bit: bool,
}

/// One codec.
pub trait DImgLoader {
    fn format_name(&self) -> &'static str;

    fn load(&mut self, path: &Path, ctx: &LoadContext<'_>) -> Result<LoadedImage>;

    fn save(&mut self, path: &Path, image: &DImg, ctx: &SaveContext<'_>) -> Result<()>;

    fn state(&self) -> LoaderState;

    fn has_alpha(&self) -> bool {
        self.state().alpha
    }

    fn sixteen_bit(&self) -> bool {
        self.state().sixteen_bit
    }

    /// Whether the loader can write back what it reads.
    fn is_read_only(&self) -> bool {
        false
    }
}

/// Loader instance for `format`; the generic loader for anything without
/// a dedicated codec.
pub fn loader_for(format: FileFormat) -> Box<dyn DImgLoader> {
    match format {
        FileFormat::Jpeg => Box::new(jpeg::JpegLoader::default()),
        FileFormat::Png => Box::new(png::PngLoader::default()),
        FileFormat::Tiff => Box::new(tiff::TiffLoader::default()),
        FileFormat::Ppm => Box::new(ppm::PpmLoader::default()),
        FileFormat::Raw => Box::new(raw::RawLoader::default()),
        FileFormat::Jp2k => Box::new(jp2k::Jp2kLoader::default()),
        FileFormat::Pgf => Box::new(pgf::PgfLoader::default()),
        FileFormat::None | FileFormat::QImage => Box::new(generic::GenericLoader::default()),
    }
}

/// Interleaved pixels exchanged with an external codec backend.
///
/// `channels` is 1 (gray), 2 (gray + alpha), 3 (RGB) or 4 (RGBA); every
/// sample holds a value of `bits` depth.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecPixels {
    pub width: u32,
    pub height: u32,
    pub channels: usize,
    pub bits: u32,
    pub samples: Vec<u16>,
}

impl CodecPixels {
    /// RGB or RGBA samples of `image` at its own depth.
    pub fn from_image(image: &DImg) -> Self {
        let sixteen_bit = image.sixteen_bit();
        let channels = if image.has_alpha() { 4 } else { 3 };
        let mut samples = Vec::with_capacity(image.num_pixels() * channels);
        for px in image.bits().chunks_exact(image.bytes_depth()) {
            let rgba = get_rgba(px, sixteen_bit);
            samples.extend_from_slice(&rgba[..channels]);
        }
        Self {
            width: image.width(),
            height: image.height(),
            channels,
            bits: image.bits_depth(),
            samples,
        }
    }

    /// Convert into the canonical buffer of `image`, adopting the codec's
    /// geometry, depth and alpha.
    pub fn install(&self, image: &mut LoadedImage, ctx: &LoadContext<'_>) -> Result<()> {
        if !(1..=4).contains(&self.channels)
            || self.samples.len() < self.width as usize * self.height as usize * self.channels
        {
            return Err(DImgError::decode("codec", "short or malformed pixel buffer"));
        }
        image.width = self.width;
        image.height = self.height;
        image.sixteen_bit = self.bits > 8;
        image.alpha = self.channels % 2 == 0;
        image.allocate()?;

        let bpp = image.bytes_depth();
        let sixteen_bit = image.sixteen_bit;
        let level = |v: u16| {
            let v = scale_to_u16(u32::from(v), self.bits);
            if sixteen_bit { v } else { v >> 8 }
        };
        let opaque = if sixteen_bit { u16::MAX } else { 255 };
        let row_len = self.width as usize * self.channels;
        let rows = ctx.rows(self.height, 0.8);
        for (y, (src, dst)) in self
            .samples
            .chunks_exact(row_len.max(1))
            .zip(image.data.chunks_exact_mut(self.width as usize * bpp))
            .enumerate()
        {
            rows.checkpoint(y as u32)?;
            for (s, d) in src.chunks_exact(self.channels).zip(dst.chunks_exact_mut(bpp)) {
                let (r, g, b, a) = match self.channels {
                    1 => (s[0], s[0], s[0], None),
                    2 => (s[0], s[0], s[0], Some(s[1])),
                    3 => (s[0], s[1], s[2], None),
                    _ => (s[0], s[1], s[2], Some(s[3])),
                };
                put_bgra(d, sixteen_bit, level(r), level(g), level(b), a.map_or(opaque, level));
            }
        }
        Ok(())
    }
}

/// Scale a sample of `bits` depth to the full 16-bit range.
pub(crate) fn scale_to_u16(value: u32, bits: u32) -> u16 {
    match bits {
        16 => value as u16,
        0 => 0,
        b if b > 16 => (value >> (b - 16)) as u16,
        b => {
            let max = (1u32 << b) - 1;
            ((value.min(max) * 65535 + max / 2) / max) as u16
        }
    }
}

/// Write one canonical pixel from RGBA samples at the buffer depth.
#[inline]
pub(crate) fn put_bgra(dst: &mut [u8], sixteen_bit: bool, r: u16, g: u16, b: u16, a: u16) {
    if sixteen_bit {
        dst[0..2].copy_from_slice(&b.to_ne_bytes());
        dst[2..4].copy_from_slice(&g.to_ne_bytes());
        dst[4..6].copy_from_slice(&r.to_ne_bytes());
        dst[6..8].copy_from_slice(&a.to_ne_bytes());
    } else {
        dst[0] = b as u8;
        dst[1] = g as u8;
        dst[2] = r as u8;
        dst[3] = a as u8;
    }
}

/// Read one canonical pixel as `[r, g, b, a]`.
#[inline]
pub(crate) fn get_rgba(src: &[u8], sixteen_bit: bool) -> [u16; 4] {
    if sixteen_bit {
        let s = |i: usize| u16::from_ne_bytes([src[i], src[i + 1]]);
        [s(4), s(2), s(0), s(6)]
    } else {
        [src[2] as u16, src[1] as u16, src[0] as u16, src[3] as u16]
    }
}

/// Write `data` to a sibling temporary file and move it over `path`, so a
/// failed write leaves an existing file untouched.
pub(crate) fn write_atomically(
    path: &Path,
    write: impl FnOnce(&Path) -> Result<()>,
) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.dimg-{}.tmp", std::process::id()));
    // Keep the real extension last for encoders that look at it.
    let temp = match path.extension() {
        Some(ext) => temp.with_extension(format!("tmp.{}", ext.to_string_lossy())),
        None => temp,
    };

    match write(&temp) {
        Ok(()) => {
            std::fs::rename(&temp, path)?;
            Ok(())
        }
        Err(e) => {
            let _ = std::fs::remove_file(&temp);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::CancellationToken;

    #[test]
    fn test_info_only_excludes_pixels() {
        assert!(!LoadFlags::INFO_ONLY.contains(LoadFlags::IMAGE_DATA));
        assert!(LoadFlags::ALL.contains(LoadFlags::INFO_ONLY));
        assert_eq!(LoadFlags::default(), LoadFlags::ALL);
    }

    #[test]
    fn test_scale_to_u16() {
        assert_eq!(scale_to_u16(255, 8), 65535);
        assert_eq!(scale_to_u16(0, 8), 0);
        assert_eq!(scale_to_u16(1, 1), 65535);
        assert_eq!(scale_to_u16(15, 4), 65535);
        assert_eq!(scale_to_u16(1234, 16), 1234);
        assert_eq!(scale_to_u16(u32::MAX, 32), 65535);
    }

    #[test]
    fn test_pixel_helpers_are_inverse() {
        let mut px = [0u8; 8];
        put_bgra(&mut px, true, 1, 2, 3, 4);
        assert_eq!(get_rgba(&px, true), [1, 2, 3, 4]);
        let mut px = [0u8; 4];
        put_bgra(&mut px, false, 10, 20, 30, 40);
        assert_eq!(px, [30, 20, 10, 40]);
        assert_eq!(get_rgba(&px, false), [10, 20, 30, 40]);
    }

    #[test]
    fn test_row_progress_cancels() {
        let token = CancellationToken::new();
        let ctx = LoadContext::new(LoadFlags::ALL, Some(&token));
        let rows = ctx.rows(100, 0.8);
        assert!(rows.checkpoint(0).is_ok());
        token.cancel();
        assert!(matches!(rows.checkpoint(0), Err(DImgError::Cancelled)));
        assert!(!token.reported().is_empty());
    }

    #[test]
    fn test_atomic_write_keeps_original_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.png");
        std::fs::write(&path, b"original").unwrap();
        let result = write_atomically(&path, |tmp| {
            std::fs::write(tmp, b"partial")?;
            Err(DImgError::encode("PNG", "boom"))
        });
        assert!(result.is_err());
        assert_eq!(std::fs::read(&path).unwrap(), b"original");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        write_atomically(&path, |tmp| Ok(std::fs::write(tmp, b"new")?)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
    }
}
