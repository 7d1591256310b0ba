//! The image value: pixel buffer, flags and everything that travels with it.
//!
//! # Layout
//! Pixels are always four interleaved channels in Blue, Green, Red, Alpha
//! order, one byte per channel for 8-bit images and one native-endian
//! `u16` per channel for 16-bit images. Images without alpha still carry
//! the fourth channel, pinned to the maximum value.
//!
//! # Sharing
//! `DImg` is a handle to reference-counted shared state. `clone()` is O(1)
//! and shares the buffer; equality compares identity, not pixels. Every
//! mutating method detaches first, deep-copying the state when another
//! handle still refers to it. Use [`DImg::copy`] for an explicit deep copy.

pub mod attributes;
mod io;
mod provenance;

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::color::DColor;
use crate::config::engine_config;
use crate::error::{DImgError, Result};
use crate::history::DImageHistory;
use crate::metadata::ImageMetadata;

use attributes::AttributeValue;

/// Channel depth of an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitDepth {
    /// 8 bits per channel, 4 bytes per pixel.
    Eight,
    /// 16 bits per channel, 8 bytes per pixel.
    Sixteen,
}

impl BitDepth {
    pub fn from_sixteen_bit(sixteen_bit: bool) -> Self {
        if sixteen_bit { Self::Sixteen } else { Self::Eight }
    }

    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Eight => 4,
            Self::Sixteen => 8,
        }
    }

    pub fn bits_per_channel(self) -> u32 {
        match self {
            Self::Eight => 8,
            Self::Sixteen => 16,
        }
    }
}

impl fmt::Display for BitDepth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Eight => write!(f, "8-bit"),
            Self::Sixteen => write!(f, "16-bit"),
        }
    }
}

impl From<u8> for BitDepth {
    fn from(bits: u8) -> Self {
        if bits > 8 { Self::Sixteen } else { Self::Eight }
    }
}

/// Color model of the source file before canonicalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ColorModel {
    Rgb,
    Grayscale,
    Monochrome,
    Indexed,
    YCbCr,
    Cmyk,
    CieLab,
    /// Undemosaiced sensor data.
    Raw,
    #[default]
    Unknown,
}

impl ColorModel {
    /// Stable integer code stored in the `originalColorModel` attribute.
    pub fn code(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Rgb => 1,
            Self::Grayscale => 2,
            Self::Monochrome => 3,
            Self::Indexed => 4,
            Self::YCbCr => 5,
            Self::Cmyk => 6,
            Self::CieLab => 7,
            Self::Raw => 8,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Rgb,
            2 => Self::Grayscale,
            3 => Self::Monochrome,
            4 => Self::Indexed,
            5 => Self::YCbCr,
            6 => Self::Cmyk,
            7 => Self::CieLab,
            8 => Self::Raw,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ColorModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rgb => "RGB",
            Self::Grayscale => "Grayscale",
            Self::Monochrome => "Monochrome",
            Self::Indexed => "Indexed",
            Self::YCbCr => "YCbCr",
            Self::Cmyk => "CMYK",
            Self::CieLab => "CIE L*a*b*",
            Self::Raw => "Uncalibrated (RAW)",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// ICC profile attached to an image.
///
/// `Srgb` and `AdobeRgb` mark a well-known working space inferred from
/// Exif when the file carries no profile bytes; they are not written
/// back as profiles.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IccProfile {
    #[default]
    None,
    Embedded(Vec<u8>),
    Srgb,
    AdobeRgb,
}

impl IccProfile {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Profile bytes, for profiles that have them.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::Embedded(data) if !data.is_empty() => Some(data),
            _ => None,
        }
    }
}

/// How [`DImg::smooth_scale`] treats the requested size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AspectRatioMode {
    /// Scale to exactly the requested size.
    #[default]
    Ignore,
    /// Largest size fitting inside the request, keeping aspect.
    Keep,
    /// Smallest size covering the request, keeping aspect.
    KeepByExpanding,
}

/// Shared state behind a [`DImg`] handle.
#[derive(Debug, Clone, Default)]
pub(crate) struct DImgData {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) sixteen_bit: bool,
    pub(crate) alpha: bool,
    pub(crate) data: Vec<u8>,
    pub(crate) attributes: BTreeMap<String, AttributeValue>,
    pub(crate) embedded_text: BTreeMap<String, String>,
    pub(crate) icc: IccProfile,
    pub(crate) metadata: ImageMetadata,
    pub(crate) history: DImageHistory,
}

impl DImgData {
    fn copy_meta_from(&mut self, other: &DImgData) {
        self.attributes = other.attributes.clone();
        self.embedded_text = other.embedded_text.clone();
        self.icc = other.icc.clone();
        self.metadata = other.metadata.clone();
        self.history = other.history.clone();
    }

    fn set_null(&mut self) {
        self.width = 0;
        self.height = 0;
        self.data = Vec::new();
    }
}

/// Allocate a zeroed canonical buffer, refusing sizes that overflow or
/// exceed the configured limit.
pub(crate) fn allocate_buffer(width: u32, height: u32, sixteen_bit: bool) -> Result<Vec<u8>> {
    let bytes_per_pixel = BitDepth::from_sixteen_bit(sixteen_bit).bytes_per_pixel();
    let err = || DImgError::Allocation {
        width,
        height,
        bytes_per_pixel,
    };

    let size = u64::from(width)
        .checked_mul(u64::from(height))
        .and_then(|n| n.checked_mul(bytes_per_pixel as u64))
        .ok_or_else(err)?;
    if size == 0 || size > engine_config().max_allocation_bytes {
        return Err(err());
    }
    let size = usize::try_from(size).map_err(|_| err())?;

    let mut buffer = Vec::new();
    buffer.try_reserve_exact(size).map_err(|_| err())?;
    buffer.resize(size, 0);
    Ok(buffer)
}

/// Copy-on-write image handle.
#[derive(Debug, Clone, Default)]
pub struct DImg {
    pub(crate) d: Arc<DImgData>,
}

impl PartialEq for DImg {
    /// Identity comparison: true when both handles share one state.
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.d, &other.d)
    }
}

impl Eq for DImg {}

impl DImg {
    /// A null image.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every part of the file at `path`. Null when loading fails.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let mut image = Self::new();
        image.load_all(path);
        image
    }

    /// Allocate a `width x height` image. With `data`, the pixels are
    /// copied from it and it must hold at least the full buffer; without,
    /// the color samples are zeroed and, for images without alpha, the
    /// alpha sample is pinned to its maximum. Null when allocation fails.
    pub fn from_data(
        width: u32,
        height: u32,
        sixteen_bit: bool,
        alpha: bool,
        data: Option<&[u8]>,
    ) -> Self {
        let mut image = Self::new();
        let d = image.d_mut();
        d.sixteen_bit = sixteen_bit;
        d.alpha = alpha;
        match allocate_buffer(width, height, sixteen_bit) {
            Ok(mut buffer) => {
                if let Some(src) = data {
                    if src.len() < buffer.len() {
                        tracing::warn!(
                            "source buffer too short for {width}x{height}: {} bytes",
                            src.len()
                        );
                        return Self::new();
                    }
                    let len = buffer.len();
                    buffer.copy_from_slice(&src[..len]);
                } else if !alpha {
                    let depth = if sixteen_bit { 8 } else { 4 };
                    for px in buffer.chunks_exact_mut(depth) {
                        px[depth / 4 * 3..].fill(0xFF);
                    }
                }
                d.width = width;
                d.height = height;
                d.data = buffer;
            }
            Err(e) => tracing::warn!("{e}"),
        }
        image
    }

    /// New blank `width x height` buffer carrying this image's flags and
    /// metadata. Used by crop and scale.
    pub fn with_size_of(&self, width: u32, height: u32) -> Self {
        let mut image = Self::from_data(width, height, self.sixteen_bit(), self.has_alpha(), None);
        let d = image.d_mut();
        d.sixteen_bit = self.d.sixteen_bit;
        d.alpha = self.d.alpha;
        d.copy_meta_from(&self.d);
        image
    }

    pub(crate) fn d_mut(&mut self) -> &mut DImgData {
        Arc::make_mut(&mut self.d)
    }

    /// Make the state unique to this handle, deep-copying if shared.
    pub fn detach(&mut self) {
        Arc::make_mut(&mut self.d);
    }

    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.d) > 1
    }

    /// Drop everything and become a fresh null image.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Deep copy of pixels and metadata.
    pub fn copy(&self) -> Self {
        Self {
            d: Arc::new((*self.d).clone()),
        }
    }

    /// Deep copy of the pixels only; metadata is left empty.
    pub fn copy_image_data(&self) -> Self {
        let mut image = Self::new();
        let d = image.d_mut();
        d.width = self.d.width;
        d.height = self.d.height;
        d.sixteen_bit = self.d.sixteen_bit;
        d.alpha = self.d.alpha;
        d.data = self.d.data.clone();
        image
    }

    /// Null image carrying this image's metadata and flags.
    pub fn copy_meta_data(&self) -> Self {
        let mut image = Self::new();
        let d = image.d_mut();
        d.sixteen_bit = self.d.sixteen_bit;
        d.alpha = self.d.alpha;
        d.copy_meta_from(&self.d);
        image
    }

    /// Take ownership of `data` as the pixel buffer. Returns false, leaving
    /// the image unchanged, when the length does not match the geometry.
    pub fn put_image_data(
        &mut self,
        width: u32,
        height: u32,
        sixteen_bit: bool,
        alpha: bool,
        data: Vec<u8>,
    ) -> bool {
        let expected = width as usize * height as usize * BitDepth::from_sixteen_bit(sixteen_bit).bytes_per_pixel();
        if data.len() != expected {
            tracing::warn!(
                "put_image_data: {} bytes for {width}x{height} (expected {expected})",
                data.len()
            );
            return false;
        }
        let d = self.d_mut();
        d.sixteen_bit = sixteen_bit;
        d.alpha = alpha;
        if data.is_empty() {
            d.set_null();
        } else {
            d.width = width;
            d.height = height;
            d.data = data;
        }
        true
    }

    /// Replace the buffer keeping the current geometry and flags.
    pub fn put_image_data_same(&mut self, data: Vec<u8>) -> bool {
        let (w, h, s, a) = (self.width(), self.height(), self.sixteen_bit(), self.has_alpha());
        self.put_image_data(w, h, s, a, data)
    }

    /// Hand the buffer to the caller; the image becomes null but keeps
    /// its metadata.
    pub fn strip_image_data(&mut self) -> Option<Vec<u8>> {
        if self.is_null() {
            return None;
        }
        let d = self.d_mut();
        let data = std::mem::take(&mut d.data);
        d.set_null();
        Some(data)
    }

    /// Clear attributes, embedded text, ICC, Exif/IPTC/XMP and history.
    pub fn reset_meta_data(&mut self) {
        let d = self.d_mut();
        d.attributes.clear();
        d.embedded_text.clear();
        d.icc = IccProfile::None;
        d.metadata = ImageMetadata::default();
        d.history = DImageHistory::default();
    }

    pub(crate) fn set_null(&mut self) {
        self.d_mut().set_null();
    }

    pub fn is_null(&self) -> bool {
        self.d.data.is_empty()
    }

    pub fn width(&self) -> u32 {
        self.d.width
    }

    pub fn height(&self) -> u32 {
        self.d.height
    }

    pub fn size(&self) -> (u32, u32) {
        (self.d.width, self.d.height)
    }

    pub fn sixteen_bit(&self) -> bool {
        self.d.sixteen_bit
    }

    pub fn has_alpha(&self) -> bool {
        self.d.alpha
    }

    /// Change the alpha flag only; pixel alpha values are untouched.
    pub fn set_has_alpha(&mut self, alpha: bool) {
        if self.d.alpha != alpha {
            self.d_mut().alpha = alpha;
        }
    }

    pub fn bit_depth(&self) -> BitDepth {
        BitDepth::from_sixteen_bit(self.d.sixteen_bit)
    }

    /// Bytes per pixel: 4 or 8.
    pub fn bytes_depth(&self) -> usize {
        self.bit_depth().bytes_per_pixel()
    }

    /// Bits per channel: 8 or 16.
    pub fn bits_depth(&self) -> u32 {
        self.bit_depth().bits_per_channel()
    }

    pub fn num_pixels(&self) -> usize {
        self.d.width as usize * self.d.height as usize
    }

    pub fn num_bytes(&self) -> usize {
        self.d.data.len()
    }

    pub fn bytes_per_line(&self) -> usize {
        self.d.width as usize * self.bytes_depth()
    }

    pub fn bits(&self) -> &[u8] {
        &self.d.data
    }

    /// Mutable pixels; detaches first.
    pub fn bits_mut(&mut self) -> &mut [u8] {
        &mut self.d_mut().data
    }

    pub fn copy_bits(&self) -> Vec<u8> {
        self.d.data.clone()
    }

    pub fn scan_line(&self, y: u32) -> Option<&[u8]> {
        if y >= self.d.height || self.is_null() {
            return None;
        }
        let bpl = self.bytes_per_line();
        let start = y as usize * bpl;
        Some(&self.d.data[start..start + bpl])
    }

    pub fn scan_line_mut(&mut self, y: u32) -> Option<&mut [u8]> {
        if y >= self.d.height || self.is_null() {
            return None;
        }
        let bpl = self.bytes_per_line();
        let start = y as usize * bpl;
        Some(&mut self.d_mut().data[start..start + bpl])
    }

    fn pixel_offset(&self, x: u32, y: u32) -> Option<usize> {
        if self.is_null() || x >= self.d.width || y >= self.d.height {
            return None;
        }
        Some((y as usize * self.d.width as usize + x as usize) * self.bytes_depth())
    }

    /// Color at `(x, y)`; a default color when out of bounds or null.
    pub fn get_pixel_color(&self, x: u32, y: u32) -> DColor {
        match self.pixel_offset(x, y) {
            Some(offset) => DColor::from_pixel(&self.d.data[offset..], self.d.sixteen_bit),
            None => DColor::default(),
        }
    }

    /// Write a color at `(x, y)`. Ignored when out of bounds, null, or
    /// when the color depth differs from the image depth.
    pub fn set_pixel_color(&mut self, x: u32, y: u32, color: DColor) {
        if color.sixteen_bit != self.d.sixteen_bit {
            tracing::debug!("set_pixel_color: depth mismatch");
            return;
        }
        if let Some(offset) = self.pixel_offset(x, y) {
            let bpp = self.bytes_depth();
            color.set_pixel(&mut self.d_mut().data[offset..offset + bpp]);
        }
    }

    /// Set every pixel to `color`, converted to the image depth.
    pub fn fill(&mut self, color: DColor) {
        if self.is_null() {
            return;
        }
        let color = color.converted_to_depth(self.sixteen_bit());
        let bpp = self.bytes_depth();
        let mut pixel = [0u8; 8];
        color.set_pixel(&mut pixel[..bpp]);
        for chunk in self.d_mut().data.chunks_exact_mut(bpp) {
            chunk.copy_from_slice(&pixel[..bpp]);
        }
    }

    /// True when the image has alpha and at least one pixel is not opaque.
    pub fn has_transparent_pixels(&self) -> bool {
        if self.is_null() || !self.has_alpha() {
            return false;
        }
        if self.sixteen_bit() {
            self.d
                .data
                .chunks_exact(8)
                .any(|px| u16::from_ne_bytes([px[6], px[7]]) != u16::MAX)
        } else {
            self.d.data.chunks_exact(4).any(|px| px[3] != u8::MAX)
        }
    }

    pub fn icc_profile(&self) -> &IccProfile {
        &self.d.icc
    }

    pub fn set_icc_profile(&mut self, profile: IccProfile) {
        self.d_mut().icc = profile;
    }

    pub fn metadata(&self) -> &ImageMetadata {
        &self.d.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut ImageMetadata {
        &mut self.d_mut().metadata
    }

    pub fn set_metadata(&mut self, metadata: ImageMetadata) {
        self.d_mut().metadata = metadata;
    }

    pub fn embedded_text(&self, key: &str) -> Option<&str> {
        self.d.embedded_text.get(key).map(String::as_str)
    }

    pub fn embedded_text_map(&self) -> &BTreeMap<String, String> {
        &self.d.embedded_text
    }

    pub fn set_embedded_text(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.d_mut().embedded_text.insert(key.into(), value.into());
    }

    pub fn remove_embedded_text(&mut self, key: &str) {
        self.d_mut().embedded_text.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> DImg {
        let mut image = DImg::from_data(width, height, false, true, None);
        for y in 0..height {
            for x in 0..width {
                image.set_pixel_color(x, y, DColor::new(x as i32, y as i32, 7, 255, false));
            }
        }
        image
    }

    #[test]
    fn test_null_image_has_no_buffer() {
        let image = DImg::new();
        assert!(image.is_null());
        assert_eq!(image.size(), (0, 0));
        assert!(image.bits().is_empty());
        assert_eq!(image.get_pixel_color(0, 0), DColor::default());
        assert!(!image.has_transparent_pixels());
    }

    #[test]
    fn test_buffer_length_matches_geometry() {
        let a = DImg::from_data(13, 7, false, false, None);
        assert_eq!(a.num_bytes(), 13 * 7 * 4);
        let b = DImg::from_data(13, 7, true, false, None);
        assert_eq!(b.num_bytes(), 13 * 7 * 8);
        assert_eq!(b.bytes_depth(), 8);
        assert_eq!(b.bits_depth(), 16);
    }

    #[test]
    fn test_blank_opaque_image_has_full_alpha() {
        let eight = DImg::from_data(2, 2, false, false, None);
        assert_eq!(eight.get_pixel_color(0, 0), DColor::new(0, 0, 0, 255, false));
        assert_eq!(eight.get_pixel_color(1, 1).alpha, 255);
        let sixteen = DImg::from_data(3, 1, true, false, None);
        assert_eq!(sixteen.get_pixel_color(2, 0), DColor::new(0, 0, 0, 65535, true));
        let cropped = sixteen.with_size_of(1, 1);
        assert_eq!(cropped.get_pixel_color(0, 0).alpha, 65535);

        let transparent = DImg::from_data(2, 2, false, true, None);
        assert_eq!(transparent.get_pixel_color(0, 0).alpha, 0);
    }

    #[test]
    fn test_clone_shares_and_compares_by_identity() {
        let a = gradient(4, 4);
        let b = a.clone();
        assert_eq!(a, b);
        assert!(a.is_shared());
        let c = a.copy();
        assert_ne!(a, c);
        assert_eq!(a.bits(), c.bits());
    }

    #[test]
    fn test_detach_isolates_writes() {
        let a = gradient(4, 4);
        let before = a.copy_bits();
        let mut b = a.clone();
        b.detach();
        b.fill(DColor::rgb(1, 2, 3));
        assert_eq!(a.bits(), &before[..]);
        assert_eq!(b.get_pixel_color(3, 3), DColor::rgb(1, 2, 3));
    }

    #[test]
    fn test_mutation_without_explicit_detach_still_isolates() {
        let a = gradient(2, 2);
        let mut b = a.clone();
        b.set_pixel_color(0, 0, DColor::rgb(9, 9, 9));
        assert_ne!(a.get_pixel_color(0, 0), b.get_pixel_color(0, 0));
    }

    #[test]
    fn test_oversized_allocation_yields_null() {
        let image = DImg::from_data(u32::MAX, u32::MAX, true, false, None);
        assert!(image.is_null());
        assert_eq!(image.size(), (0, 0));
    }

    #[test]
    fn test_copy_granularities() {
        let mut a = gradient(3, 3);
        a.set_embedded_text("Comment", "hi");
        let pixels = a.copy_image_data();
        assert!(pixels.embedded_text("Comment").is_none());
        assert_eq!(pixels.bits(), a.bits());

        let meta = a.copy_meta_data();
        assert!(meta.is_null());
        assert_eq!(meta.embedded_text("Comment"), Some("hi"));
        assert!(meta.has_alpha());
    }

    #[test]
    fn test_put_and_strip_image_data() {
        let mut image = DImg::new();
        assert!(!image.put_image_data(2, 2, false, false, vec![0; 3]));
        assert!(image.put_image_data(2, 2, false, false, vec![5; 16]));
        assert_eq!(image.size(), (2, 2));
        let data = image.strip_image_data().unwrap();
        assert_eq!(data.len(), 16);
        assert!(image.is_null());
        assert_eq!(image.size(), (0, 0));
    }

    #[test]
    fn test_transparency_detection() {
        let mut image = DImg::from_data(2, 1, true, true, None);
        image.fill(DColor::white(true));
        assert!(!image.has_transparent_pixels());
        image.set_pixel_color(1, 0, DColor::new(0, 0, 0, 100, true));
        assert!(image.has_transparent_pixels());
        image.set_has_alpha(false);
        assert!(!image.has_transparent_pixels());
    }

    #[test]
    fn test_with_size_of_keeps_metadata() {
        let mut a = gradient(4, 4);
        a.set_embedded_text("Title", "x");
        let b = a.with_size_of(2, 3);
        assert_eq!(b.size(), (2, 3));
        assert_eq!(b.embedded_text("Title"), Some("x"));
        assert!(b.has_alpha());
    }
}
