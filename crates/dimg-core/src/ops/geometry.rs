//! Crop, rotate, flip and EXIF orientation handling.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::image::attributes::keys;
use crate::image::{AspectRatioMode, DImg};
use crate::metadata::orientation;

/// Right-angle rotation, clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Angle {
    Rot90,
    Rot180,
    Rot270,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Flip {
    Horizontal,
    Vertical,
}

/// Lossless transformation requested by a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransformAction {
    #[default]
    None,
    FlipHorizontal,
    FlipVertical,
    Rotate90,
    Rotate180,
    Rotate270,
}

/// Rectangle in coordinates relative to the image size (`0.0..=1.0`).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RectF {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl RectF {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

/// Intersect `(x, y, w, h)` with a `width x height` area. False when the
/// intersection is empty.
pub(crate) fn clip_rect(x: &mut i32, y: &mut i32, w: &mut i32, h: &mut i32, width: u32, height: u32) -> bool {
    if *w <= 0 || *h <= 0 {
        return false;
    }
    let left = i64::from(*x).max(0);
    let top = i64::from(*y).max(0);
    let right = (i64::from(*x) + i64::from(*w)).min(i64::from(width));
    let bottom = (i64::from(*y) + i64::from(*h)).min(i64::from(height));
    if right <= left || bottom <= top {
        return false;
    }
    *x = left as i32;
    *y = top as i32;
    *w = (right - left) as i32;
    *h = (bottom - top) as i32;
    true
}

impl DImg {
    /// New image holding the given rectangle, clipped to the image, with
    /// this image's metadata. Null when the rectangle misses the image.
    pub fn copy_rect(&self, x: i32, y: i32, w: i32, h: i32) -> DImg {
        let (mut x, mut y, mut w, mut h) = (x, y, w, h);
        if self.is_null() || !clip_rect(&mut x, &mut y, &mut w, &mut h, self.width(), self.height()) {
            return DImg::new();
        }
        let mut image = self.with_size_of(w as u32, h as u32);
        image.bit_blt_image(self, x, y, w, h, 0, 0);
        image
    }

    /// [`Self::copy_rect`] with a rectangle relative to the image size.
    pub fn copy_rel(&self, rect: RectF) -> DImg {
        if self.is_null() || !rect.is_valid() {
            return DImg::new();
        }
        let (w, h) = (f64::from(self.width()), f64::from(self.height()));
        self.copy_rect(
            (rect.x * w).round() as i32,
            (rect.y * h).round() as i32,
            (rect.width * w).round() as i32,
            (rect.height * h).round() as i32,
        )
    }

    /// Replace the image with the given rectangle. The image becomes null
    /// when the rectangle misses it.
    pub fn crop(&mut self, x: i32, y: i32, w: i32, h: i32) {
        if self.is_null() {
            return;
        }
        let cropped = self.copy_rect(x, y, w, h);
        if cropped.is_null() {
            tracing::debug!("crop {x},{y} {w}x{h} outside {}x{}", self.width(), self.height());
            self.set_null();
        } else {
            *self = cropped;
        }
    }

    pub fn rotate(&mut self, angle: Angle) {
        if self.is_null() {
            return;
        }
        let (w, h) = (self.width() as usize, self.height() as usize);
        let bpp = self.bytes_depth();
        let src = self.bits();
        let mut out = vec![0u8; src.len()];

        // Destination index of source pixel (x, y).
        let target = |x: usize, y: usize| match angle {
            Angle::Rot90 => x * h + (h - 1 - y),
            Angle::Rot180 => (h - 1 - y) * w + (w - 1 - x),
            Angle::Rot270 => (w - 1 - x) * h + y,
        };
        for y in 0..h {
            for x in 0..w {
                let s = (y * w + x) * bpp;
                let d = target(x, y) * bpp;
                out[d..d + bpp].copy_from_slice(&src[s..s + bpp]);
            }
        }

        let swap = angle != Angle::Rot180;
        let d = self.d_mut();
        d.data = out;
        if swap {
            std::mem::swap(&mut d.width, &mut d.height);
            if let Some((ow, oh)) = self.attribute(keys::ORIGINAL_SIZE).and_then(|v| v.as_size()) {
                self.set_attribute(keys::ORIGINAL_SIZE, (oh, ow));
            }
        }
    }

    pub fn flip(&mut self, direction: Flip) {
        if self.is_null() {
            return;
        }
        let (w, h) = (self.width() as usize, self.height() as usize);
        let bpp = self.bytes_depth();
        let stride = w * bpp;
        let bits = self.bits_mut();
        match direction {
            Flip::Horizontal => {
                for row in bits.chunks_exact_mut(stride) {
                    for x in 0..w / 2 {
                        let (a, b) = (x * bpp, (w - 1 - x) * bpp);
                        let (left, right) = row.split_at_mut(b);
                        left[a..a + bpp].swap_with_slice(&mut right[..bpp]);
                    }
                }
            }
            Flip::Vertical => {
                for y in 0..h / 2 {
                    let (top, bottom) = bits.split_at_mut((h - 1 - y) * stride);
                    top[y * stride..(y + 1) * stride].swap_with_slice(&mut bottom[..stride]);
                }
            }
        }
    }

    /// Apply an EXIF orientation (1..=8) so the image displays upright.
    /// False for normal, unspecified or unknown values.
    pub fn rotate_and_flip(&mut self, exif_orientation: u16) -> bool {
        match exif_orientation {
            orientation::HFLIP => self.flip(Flip::Horizontal),
            orientation::ROT_180 => self.rotate(Angle::Rot180),
            orientation::VFLIP => self.flip(Flip::Vertical),
            orientation::ROT_90_HFLIP => {
                self.rotate(Angle::Rot90);
                self.flip(Flip::Horizontal);
            }
            orientation::ROT_90 => self.rotate(Angle::Rot90),
            orientation::ROT_90_VFLIP => {
                self.rotate(Angle::Rot90);
                self.flip(Flip::Vertical);
            }
            orientation::ROT_270 => self.rotate(Angle::Rot270),
            _ => return false,
        }
        true
    }

    /// Undo [`Self::rotate_and_flip`] for the same orientation.
    pub fn reverse_rotate_and_flip(&mut self, exif_orientation: u16) -> bool {
        match exif_orientation {
            orientation::HFLIP => self.flip(Flip::Horizontal),
            orientation::ROT_180 => self.rotate(Angle::Rot180),
            orientation::VFLIP => self.flip(Flip::Vertical),
            orientation::ROT_90_HFLIP => {
                self.flip(Flip::Horizontal);
                self.rotate(Angle::Rot270);
            }
            orientation::ROT_90 => self.rotate(Angle::Rot270),
            orientation::ROT_90_VFLIP => {
                self.flip(Flip::Vertical);
                self.rotate(Angle::Rot270);
            }
            orientation::ROT_270 => self.rotate(Angle::Rot90),
            _ => return false,
        }
        true
    }

    pub fn transform(&mut self, action: TransformAction) -> bool {
        match action {
            TransformAction::None => return false,
            TransformAction::FlipHorizontal => self.flip(Flip::Horizontal),
            TransformAction::FlipVertical => self.flip(Flip::Vertical),
            TransformAction::Rotate90 => self.rotate(Angle::Rot90),
            TransformAction::Rotate180 => self.rotate(Angle::Rot180),
            TransformAction::Rotate270 => self.rotate(Angle::Rot270),
        }
        true
    }

    /// Orientation stored in this image's Exif block.
    pub fn exif_orientation(&self) -> u16 {
        self.metadata().orientation()
    }

    /// Orientation stored in the file at `path`, read with a metadata-only
    /// load.
    pub fn exif_orientation_of(path: &Path) -> u16 {
        let mut probe = DImg::new();
        if !probe.load_image_info(path, true, false, false, false) {
            return orientation::UNSPECIFIED;
        }
        probe.exif_orientation()
    }

    /// Bring the pixels upright according to the Exif orientation and
    /// reset the stored orientation to normal.
    pub fn apply_exif_orientation(&mut self) -> bool {
        let value = self.exif_orientation();
        if !self.rotate_and_flip(value) {
            return false;
        }
        if let Err(e) = self.metadata_mut().set_orientation(orientation::NORMAL) {
            tracing::warn!("cannot reset Exif orientation: {e}");
        }
        true
    }

    /// Replace the image with a smooth scale to exactly `w x h`.
    pub fn resize(&mut self, w: u32, h: u32) {
        if self.is_null() || w == 0 || h == 0 {
            return;
        }
        let scaled = self.smooth_scale(w, h, AspectRatioMode::Ignore);
        if !scaled.is_null() {
            *self = scaled;
        }
    }
}
