//! Single color value in either 8- or 16-bit channel range.

use serde::{Deserialize, Serialize};

/// A color with integer channels. Channels hold `0..=255` when
/// `sixteen_bit` is false and `0..=65535` when it is true.
///
/// Intermediate blending results may temporarily leave that range;
/// call [`DColor::blend_clamp`] before writing to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DColor {
    pub red: i32,
    pub green: i32,
    pub blue: i32,
    pub alpha: i32,
    pub sixteen_bit: bool,
}

/// `v * num / den` without overflowing 16-bit products.
fn scale(v: i32, num: i32, den: i32) -> i32 {
    (v as i64 * num as i64 / den as i64) as i32
}

impl DColor {
    pub const fn new(red: i32, green: i32, blue: i32, alpha: i32, sixteen_bit: bool) -> Self {
        Self {
            red,
            green,
            blue,
            alpha,
            sixteen_bit,
        }
    }

    /// Opaque 8-bit color.
    pub const fn rgb(red: u8, green: u8, blue: u8) -> Self {
        Self::new(red as i32, green as i32, blue as i32, 255, false)
    }

    pub const fn white(sixteen_bit: bool) -> Self {
        let max = Self::max_for(sixteen_bit);
        Self::new(max, max, max, max, sixteen_bit)
    }

    pub const fn black(sixteen_bit: bool) -> Self {
        Self::new(0, 0, 0, Self::max_for(sixteen_bit), sixteen_bit)
    }

    pub const fn max_for(sixteen_bit: bool) -> i32 {
        if sixteen_bit { 65535 } else { 255 }
    }

    pub const fn max_value(&self) -> i32 {
        Self::max_for(self.sixteen_bit)
    }

    /// Read one BGRA pixel from a canonical buffer slice.
    ///
    /// `pixel` must hold at least 4 bytes (8-bit) or 8 bytes (16-bit).
    pub fn from_pixel(pixel: &[u8], sixteen_bit: bool) -> Self {
        if sixteen_bit {
            let ch = |i: usize| u16::from_ne_bytes([pixel[i * 2], pixel[i * 2 + 1]]) as i32;
            Self::new(ch(2), ch(1), ch(0), ch(3), true)
        } else {
            Self::new(
                pixel[2] as i32,
                pixel[1] as i32,
                pixel[0] as i32,
                pixel[3] as i32,
                false,
            )
        }
    }

    /// Write this color as one BGRA pixel. The caller guarantees the
    /// depth of `self` matches the buffer.
    pub fn set_pixel(&self, pixel: &mut [u8]) {
        if self.sixteen_bit {
            let channels = [self.blue, self.green, self.red, self.alpha];
            for (i, v) in channels.iter().enumerate() {
                let bytes = (*v).clamp(0, 65535).to_ne_bytes();
                pixel[i * 2] = bytes[0];
                pixel[i * 2 + 1] = bytes[1];
            }
        } else {
            pixel[0] = self.blue.clamp(0, 255) as u8;
            pixel[1] = self.green.clamp(0, 255) as u8;
            pixel[2] = self.red.clamp(0, 255) as u8;
            pixel[3] = self.alpha.clamp(0, 255) as u8;
        }
    }

    /// Widen to 16 bits per channel. `v * 257` maps 255 to 65535.
    pub fn convert_to_sixteen_bit(&mut self) {
        if self.sixteen_bit {
            return;
        }
        self.red *= 257;
        self.green *= 257;
        self.blue *= 257;
        self.alpha *= 257;
        self.sixteen_bit = true;
    }

    /// Narrow to 8 bits per channel with `v * 256 / 65536`.
    pub fn convert_to_eight_bit(&mut self) {
        if !self.sixteen_bit {
            return;
        }
        self.red = self.red * 256 / 65536;
        self.green = self.green * 256 / 65536;
        self.blue = self.blue * 256 / 65536;
        self.alpha = self.alpha * 256 / 65536;
        self.sixteen_bit = false;
    }

    /// Convert to the requested depth in place.
    pub fn convert_to_depth(&mut self, sixteen_bit: bool) {
        if sixteen_bit {
            self.convert_to_sixteen_bit();
        } else {
            self.convert_to_eight_bit();
        }
    }

    pub fn converted_to_depth(mut self, sixteen_bit: bool) -> Self {
        self.convert_to_depth(sixteen_bit);
        self
    }

    pub fn premultiply(&mut self) {
        let max = self.max_value();
        let a = self.alpha;
        self.red = scale(self.red, a, max);
        self.green = scale(self.green, a, max);
        self.blue = scale(self.blue, a, max);
    }

    pub fn demultiply(&mut self) {
        if self.alpha == 0 {
            return;
        }
        let max = self.max_value();
        let a = self.alpha;
        self.red = scale(self.red, max, a).min(max);
        self.green = scale(self.green, max, a).min(max);
        self.blue = scale(self.blue, max, a).min(max);
    }

    /// Scale all channels by `factor / max`, using the color's own range.
    pub fn blend_alpha(&mut self, factor: i32) {
        let max = self.max_value();
        self.red = scale(self.red, factor, max);
        self.green = scale(self.green, factor, max);
        self.blue = scale(self.blue, factor, max);
        self.alpha = scale(self.alpha, factor, max);
    }

    /// Scale the color channels by `1 - factor / max`.
    pub fn blend_inverted_alpha(&mut self, factor: i32) {
        let max = self.max_value();
        let inv = max - factor;
        self.red = scale(self.red, inv, max);
        self.green = scale(self.green, inv, max);
        self.blue = scale(self.blue, inv, max);
        self.alpha = scale(self.alpha, inv, max);
    }

    /// Channel-wise sum. Use [`DColor::blend_clamp`] afterwards.
    pub fn blend_add(&mut self, src: &DColor) {
        self.red += src.red;
        self.green += src.green;
        self.blue += src.blue;
        self.alpha += src.alpha;
    }

    pub fn blend_clamp(&mut self) {
        let max = self.max_value();
        self.red = self.red.clamp(0, max);
        self.green = self.green.clamp(0, max);
        self.blue = self.blue.clamp(0, max);
        self.alpha = self.alpha.clamp(0, max);
    }

    pub fn is_pure_gray(&self) -> bool {
        self.red == self.green && self.red == self.blue
    }
}
