//! Color lookup at fractional coordinates.
//!
//! [`DImg::get_sub_pixel_color`] evaluates a radial Lanczos kernel with
//! support 2 over the surrounding pixels. The kernel is tabulated once per
//! process by squared distance, `RES` entries per unit. Entries are 12-bit
//! fixed point unless the `lanczos-float` feature selects `f32`.

use std::sync::OnceLock;

use crate::color::DColor;
use crate::image::DImg;

pub const LANCZOS_SUPPORT: usize = 2;
pub const LANCZOS_TABLE_RES: usize = 256;
const TABLE_LEN: usize = LANCZOS_SUPPORT * LANCZOS_SUPPORT * LANCZOS_TABLE_RES;

#[cfg(not(feature = "lanczos-float"))]
type Weight = i64;
#[cfg(feature = "lanczos-float")]
type Weight = f32;

#[cfg(not(feature = "lanczos-float"))]
pub const LANCZOS_DATA_ONE: i64 = 4096;
#[cfg(feature = "lanczos-float")]
pub const LANCZOS_DATA_ONE: f32 = 1.0;

static KERNEL: OnceLock<Vec<Weight>> = OnceLock::new();

#[cfg(not(feature = "lanczos-float"))]
fn to_weight(v: f64) -> Weight {
    (v * LANCZOS_DATA_ONE as f64) as i64
}

#[cfg(feature = "lanczos-float")]
fn to_weight(v: f64) -> Weight {
    v as f32
}

#[cfg(not(feature = "lanczos-float"))]
fn to_channel(v: Weight) -> i32 {
    v as i32
}

#[cfg(feature = "lanczos-float")]
fn to_channel(v: Weight) -> i32 {
    v.round() as i32
}

fn build_kernel() -> Vec<Weight> {
    let support = LANCZOS_SUPPORT as f64;
    let pi = std::f64::consts::PI;
    (0..TABLE_LEN)
        .map(|i| {
            if i == 0 {
                return to_weight(1.0);
            }
            let d = (i as f64 / LANCZOS_TABLE_RES as f64).sqrt();
            to_weight(support * (pi * d).sin() * (pi / support * d).sin() / (pi * pi * d * d))
        })
        .collect()
}

fn kernel() -> &'static [Weight] {
    KERNEL.get_or_init(build_kernel)
}

impl DImg {
    /// Build the kernel table ahead of the first lookup.
    pub fn prepare_sub_pixel_access(&self) {
        kernel();
    }

    /// Lanczos-filtered color at `(x, y)`, coordinates clamped to the
    /// image. Taps outside the image contribute no weight; the sum is
    /// normalized by the weights actually applied.
    pub fn get_sub_pixel_color(&self, x: f32, y: f32) -> DColor {
        if self.is_null() {
            return DColor::default();
        }
        let (w, h) = (self.width() as f32, self.height() as f32);
        let x = x.clamp(0.0, w - 1.0);
        let y = y.clamp(0.0, h - 1.0);

        let support = LANCZOS_SUPPORT as f32;
        let (xs, xe) = ((x.ceil() - support).max(0.0), (x.floor() + support).min(w - 1.0));
        let (ys, ye) = ((y.ceil() - support).max(0.0), (y.floor() + support).min(h - 1.0));

        let table = kernel();
        let sixteen_bit = self.sixteen_bit();
        let mut sum = [Weight::default(); 4];
        let mut normalization = Weight::default();
        for yc in ys as u32..=ye as u32 {
            for xc in xs as u32..=xe as u32 {
                let d = (xc as f32 - x).powi(2) + (yc as f32 - y).powi(2);
                let index = (d * LANCZOS_TABLE_RES as f32) as usize;
                let Some(&weight) = table.get(index) else { continue };
                let c = self.get_pixel_color(xc, yc);
                for (acc, v) in sum.iter_mut().zip([c.red, c.green, c.blue, c.alpha]) {
                    *acc += v as Weight * weight;
                }
                normalization += weight;
            }
        }
        if normalization == Weight::default() {
            return self.get_sub_pixel_color_fast(x, y);
        }

        let [r, g, b, a] = sum.map(|v| to_channel(v / normalization));
        let mut color = DColor::new(r, g, b, a, sixteen_bit);
        color.blend_clamp();
        color
    }

    /// Bilinear color at `(x, y)`, coordinates clamped to the image.
    pub fn get_sub_pixel_color_fast(&self, x: f32, y: f32) -> DColor {
        if self.is_null() {
            return DColor::default();
        }
        let x = x.clamp(0.0, self.width() as f32 - 1.0);
        let y = y.clamp(0.0, self.height() as f32 - 1.0);
        let (x0, y0) = (x as u32, y as u32);
        let x1 = (x0 + 1).min(self.width() - 1);
        let y1 = (y0 + 1).min(self.height() - 1);
        let (fx, fy) = (x - x0 as f32, y - y0 as f32);

        let c00 = self.get_pixel_color(x0, y0);
        let c10 = self.get_pixel_color(x1, y0);
        let c01 = self.get_pixel_color(x0, y1);
        let c11 = self.get_pixel_color(x1, y1);
        let mix = |a: i32, b: i32, c: i32, d: i32| {
            let top = a as f32 * (1.0 - fx) + b as f32 * fx;
            let bottom = c as f32 * (1.0 - fx) + d as f32 * fx;
            (top * (1.0 - fy) + bottom * fy).round() as i32
        };
        let mut color = DColor::new(
            mix(c00.red, c10.red, c01.red, c11.red),
            mix(c00.green, c10.green, c01.green, c11.green),
            mix(c00.blue, c10.blue, c01.blue, c11.blue),
            mix(c00.alpha, c10.alpha, c01.alpha, c11.alpha),
            self.sixteen_bit(),
        );
        color.blend_clamp();
        color
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(color: DColor) -> DImg {
        let mut image = DImg::from_data(8, 8, color.sixteen_bit, true, None);
        image.fill(color);
        image
    }

    #[test]
    fn test_kernel_shape() {
        let table = kernel();
        assert_eq!(table.len(), TABLE_LEN);
        assert_eq!(table[0], LANCZOS_DATA_ONE);
        // Zero crossing at distance 1: squared distance 1.0.
        assert!(to_channel(table[LANCZOS_TABLE_RES]).abs() <= 1);
    }

    #[test]
    fn test_lanczos_reproduces_flat_color() {
        let color = DColor::new(120, 60, 30, 255, false);
        let image = flat(color);
        image.prepare_sub_pixel_access();
        let c = image.get_sub_pixel_color(3.5, 4.25);
        assert!((c.red - 120).abs() <= 1 && (c.green - 60).abs() <= 1, "{c:?}");
        assert_eq!(image.get_sub_pixel_color(3.0, 3.0), color);
    }

    #[test]
    fn test_border_uses_clipped_kernel() {
        let mut image = DImg::from_data(8, 8, false, false, None);
        for y in 0..8 {
            for x in 0..8 {
                let v = if x % 2 == 0 { 0 } else { 200 };
                image.set_pixel_color(x, y, DColor::new(v, v, v, 255, false));
            }
        }
        let border = image.get_sub_pixel_color(0.25, 4.0);
        let fast = image.get_sub_pixel_color_fast(0.25, 4.0);
        assert_eq!(fast.red, 50);
        assert_ne!(border, fast);
        // Dominated by the 0-valued column under the sample point.
        assert!(border.red < 30, "{border:?}");
        assert_eq!(border.alpha, 255);

        let corner = flat(DColor::new(1000, 2000, 3000, 65535, true));
        let c = corner.get_sub_pixel_color(0.5, 0.5);
        assert!((c.red - 1000).abs() <= 2 && (c.blue - 3000).abs() <= 4, "{c:?}");
    }

    #[test]
    fn test_bilinear_midpoint() {
        let mut image = DImg::from_data(2, 1, false, false, None);
        image.set_pixel_color(0, 0, DColor::new(0, 0, 0, 255, false));
        image.set_pixel_color(1, 0, DColor::new(200, 100, 50, 255, false));
        let c = image.get_sub_pixel_color_fast(0.5, 0.0);
        assert_eq!((c.red, c.green, c.blue, c.alpha), (100, 50, 25, 255));
        assert_eq!(image.get_sub_pixel_color_fast(5.0, -3.0), image.get_pixel_color(1, 0));
        assert_eq!(DImg::new().get_sub_pixel_color(1.0, 1.0), DColor::default());
    }
}
