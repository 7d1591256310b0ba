//! Smooth scaling.
//!
//! # Algorithm
//! Separable two-pass resampling with integer weights in 1/256 units.
//! Per axis, shrinking uses area averaging: each destination pixel covers
//! `src / dst` source pixels and every source pixel contributes the length
//! of its overlap, so partial edge pixels get fractional weights. Growing
//! uses linear interpolation between the two nearest source centers.
//! Equal lengths map pixels one to one.
//!
//! The horizontal pass keeps 8 extra bits of precision for the vertical
//! pass; each pass rounds to nearest. Alpha is averaged like any other
//! channel.

use crate::image::{AspectRatioMode, DImg};
use crate::ops::geometry::clip_rect;

const WEIGHT_ONE: u64 = 256;

/// Source pixels feeding one destination pixel along one axis.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Contribution {
    first: usize,
    weights: Vec<u32>,
    total: u64,
}

/// Contributions for each destination index `0..dst_len` when mapping a
/// source span of `src_len` pixels starting at `src_start`.
fn contributions(src_start: usize, src_len: usize, dst_len: usize) -> Vec<Contribution> {
    let (src, dst) = (src_len as u64, dst_len as u64);
    (0..dst)
        .map(|i| {
            if src == dst {
                Contribution {
                    first: src_start + i as usize,
                    weights: vec![WEIGHT_ONE as u32],
                    total: WEIGHT_ONE,
                }
            } else if src > dst {
                // Covered interval in 1/256 source pixels.
                let a = i * src * WEIGHT_ONE / dst;
                let b = (i + 1) * src * WEIGHT_ONE / dst;
                let first = a / WEIGHT_ONE;
                let last = b.div_ceil(WEIGHT_ONE).min(src);
                let weights: Vec<u32> = (first..last)
                    .map(|j| {
                        let lo = a.max(j * WEIGHT_ONE);
                        let hi = b.min((j + 1) * WEIGHT_ONE);
                        hi.saturating_sub(lo) as u32
                    })
                    .collect();
                Contribution {
                    first: src_start + first as usize,
                    total: weights.iter().map(|&w| u64::from(w)).sum::<u64>().max(1),
                    weights,
                }
            } else {
                // Center of destination pixel i in source coordinates,
                // minus half a pixel, clamped to the valid span.
                let center = ((2 * i + 1) * src * WEIGHT_ONE / (2 * dst)).saturating_sub(WEIGHT_ONE / 2);
                let pos = center.min((src - 1) * WEIGHT_ONE);
                let j = pos / WEIGHT_ONE;
                let frac = pos % WEIGHT_ONE;
                let weights = if frac == 0 || j + 1 >= src {
                    vec![WEIGHT_ONE as u32]
                } else {
                    vec![(WEIGHT_ONE - frac) as u32, frac as u32]
                };
                Contribution {
                    first: src_start + j as usize,
                    weights,
                    total: WEIGHT_ONE,
                }
            }
        })
        .collect()
}

/// Read channel `c` of pixel `x` in a canonical row.
fn sample(row: &[u8], x: usize, c: usize, sixteen_bit: bool) -> u64 {
    if sixteen_bit {
        let at = x * 8 + c * 2;
        u64::from(u16::from_ne_bytes([row[at], row[at + 1]]))
    } else {
        u64::from(row[x * 4 + c])
    }
}

/// Resample the source span `(sx, sy, sw, sh)` of `src` to `dw x dh` and
/// return the `clip` rectangle of that virtual result.
fn resample(src: &DImg, span: (u32, u32, u32, u32), dw: u32, dh: u32, clip: (u32, u32, u32, u32)) -> DImg {
    let (sx, sy, sw, sh) = span;
    let (cx, cy, cw, ch) = clip;
    let sixteen_bit = src.sixteen_bit();
    let bpp = src.bytes_depth();
    let max = if sixteen_bit { 65535 } else { 255 };

    let cols = contributions(sx as usize, sw as usize, dw as usize);
    let rows = contributions(sy as usize, sh as usize, dh as usize);
    let cols = &cols[cx as usize..(cx + cw) as usize];
    let rows = &rows[cy as usize..(cy + ch) as usize];

    let mut out = src.with_size_of(cw, ch);
    if out.is_null() {
        return out;
    }

    // Horizontal pass over the source rows the clip needs.
    let row_lo = rows.iter().map(|r| r.first).min().unwrap_or(0);
    let row_hi = rows
        .iter()
        .map(|r| r.first + r.weights.len())
        .max()
        .unwrap_or(0);
    let width = cw as usize;
    let mut horizontal = vec![0u64; (row_hi - row_lo) * width * 4];
    for y in row_lo..row_hi {
        let Some(line) = src.scan_line(y as u32) else { continue };
        let base = (y - row_lo) * width * 4;
        for (x, col) in cols.iter().enumerate() {
            for c in 0..4 {
                let sum: u64 = col
                    .weights
                    .iter()
                    .enumerate()
                    .map(|(k, &w)| sample(line, col.first + k, c, sixteen_bit) * u64::from(w))
                    .sum();
                horizontal[base + x * 4 + c] = (sum * WEIGHT_ONE + col.total / 2) / col.total;
            }
        }
    }

    // Vertical pass.
    let bits = out.bits_mut();
    for (y, row) in rows.iter().enumerate() {
        for x in 0..width {
            let dst = (y * width + x) * bpp;
            for c in 0..4 {
                let sum: u64 = row
                    .weights
                    .iter()
                    .enumerate()
                    .map(|(k, &w)| horizontal[((row.first + k - row_lo) * width + x) * 4 + c] * u64::from(w))
                    .sum();
                let denom = row.total * WEIGHT_ONE;
                let value = ((sum + denom / 2) / denom).min(max);
                if sixteen_bit {
                    bits[dst + c * 2..dst + c * 2 + 2].copy_from_slice(&(value as u16).to_ne_bytes());
                } else {
                    bits[dst + c] = value as u8;
                }
            }
        }
    }
    out
}

/// Fit `(w, h)` into `(dw, dh)` according to `mode`.
pub fn scaled_size(w: u32, h: u32, dw: u32, dh: u32, mode: AspectRatioMode) -> (u32, u32) {
    if mode == AspectRatioMode::Ignore || w == 0 || h == 0 {
        return (dw, dh);
    }
    let rw = u64::from(dh) * u64::from(w) / u64::from(h);
    let use_height = match mode {
        AspectRatioMode::Keep => rw <= u64::from(dw),
        _ => rw >= u64::from(dw),
    };
    if use_height {
        (rw as u32, dh)
    } else {
        (dw, (u64::from(dw) * u64::from(h) / u64::from(w)) as u32)
    }
}

impl DImg {
    /// Scaled copy of the whole image. Null for a null image or an empty
    /// target size.
    pub fn smooth_scale(&self, dw: u32, dh: u32, mode: AspectRatioMode) -> DImg {
        if self.is_null() || dw == 0 || dh == 0 {
            return DImg::new();
        }
        let (w, h) = scaled_size(self.width(), self.height(), dw, dh, mode);
        if w == 0 || h == 0 {
            return DImg::new();
        }
        self.smooth_scale_clipped(w, h, 0, 0, w as i32, h as i32)
    }

    /// The `(clip_x, clip_y, clip_w, clip_h)` part of the image scaled to
    /// `dw x dh`, computed without scaling the rest.
    pub fn smooth_scale_clipped(&self, dw: u32, dh: u32, clip_x: i32, clip_y: i32, clip_w: i32, clip_h: i32) -> DImg {
        if self.is_null() || dw == 0 || dh == 0 {
            return DImg::new();
        }
        let (mut cx, mut cy, mut cw, mut ch) = (clip_x, clip_y, clip_w, clip_h);
        if !clip_rect(&mut cx, &mut cy, &mut cw, &mut ch, dw, dh) {
            return DImg::new();
        }
        let (w, h) = self.size();
        if (w, h) == (dw, dh) {
            return self.copy_rect(cx, cy, cw, ch);
        }
        resample(self, (0, 0, w, h), dw, dh, (cx as u32, cy as u32, cw as u32, ch as u32))
    }

    /// The source rectangle `(sx, sy, sw, sh)`, clipped to the image,
    /// scaled to `dw x dh`.
    #[allow(clippy::too_many_arguments)]
    pub fn smooth_scale_section(&self, sx: i32, sy: i32, sw: i32, sh: i32, dw: u32, dh: u32) -> DImg {
        if self.is_null() || dw == 0 || dh == 0 {
            return DImg::new();
        }
        let (mut sx, mut sy, mut sw, mut sh) = (sx, sy, sw, sh);
        if !clip_rect(&mut sx, &mut sy, &mut sw, &mut sh, self.width(), self.height()) {
            return DImg::new();
        }
        if (sw as u32, sh as u32) == (dw, dh) {
            return self.copy_rect(sx, sy, sw, sh);
        }
        resample(self, (sx as u32, sy as u32, sw as u32, sh as u32), dw, dh, (0, 0, dw, dh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::DColor;

    fn checker(size: u32) -> DImg {
        let mut image = DImg::from_data(size, size, false, false, None);
        for y in 0..size {
            for x in 0..size {
                let v = if (x + y) % 2 == 0 { 0 } else { 200 };
                image.set_pixel_color(x, y, DColor::new(v, v, v, 255, false));
            }
        }
        image
    }

    #[test]
    fn test_area_average_downscale() {
        let scaled = checker(4).smooth_scale(2, 2, AspectRatioMode::Ignore);
        assert_eq!(scaled.size(), (2, 2));
        for (x, y) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
            assert_eq!(scaled.get_pixel_color(x, y), DColor::new(100, 100, 100, 255, false));
        }
    }

    #[test]
    fn test_fractional_edge_weights() {
        let c = contributions(0, 3, 2);
        assert_eq!(c[0].first, 0);
        assert_eq!(c[0].weights, vec![256, 128]);
        assert_eq!(c[1].first, 1);
        assert_eq!(c[1].weights, vec![128, 256]);
    }

    #[test]
    fn test_linear_upscale_interpolates() {
        let mut image = DImg::from_data(2, 1, true, false, None);
        image.set_pixel_color(0, 0, DColor::new(0, 0, 0, 65535, true));
        image.set_pixel_color(1, 0, DColor::new(65535, 65535, 65535, 65535, true));
        let scaled = image.smooth_scale(4, 1, AspectRatioMode::Ignore);
        let reds: Vec<i32> = (0..4).map(|x| scaled.get_pixel_color(x, 0).red).collect();
        assert_eq!(reds[0], 0);
        assert_eq!(reds[3], 65535);
        assert!(reds[1] > 0 && reds[1] < reds[2] && reds[2] < 65535, "{reds:?}");
        assert_eq!(scaled.get_pixel_color(2, 0).alpha, 65535);
    }

    #[test]
    fn test_aspect_ratio_modes() {
        assert_eq!(scaled_size(400, 200, 100, 100, AspectRatioMode::Ignore), (100, 100));
        assert_eq!(scaled_size(400, 200, 100, 100, AspectRatioMode::Keep), (100, 50));
        assert_eq!(scaled_size(400, 200, 100, 100, AspectRatioMode::KeepByExpanding), (200, 100));
        let scaled = checker(8).smooth_scale(4, 2, AspectRatioMode::Keep);
        assert_eq!(scaled.size(), (2, 2));
    }

    #[test]
    fn test_clipped_matches_full_scale() {
        let image = checker(9);
        let full = image.smooth_scale(6, 6, AspectRatioMode::Ignore);
        let part = image.smooth_scale_clipped(6, 6, 2, 3, 3, 2);
        assert_eq!(part.size(), (3, 2));
        for y in 0..2 {
            for x in 0..3 {
                assert_eq!(part.get_pixel_color(x, y), full.get_pixel_color(x + 2, y + 3));
            }
        }
    }

    #[test]
    fn test_same_size_is_a_copy_and_section_scales_subrect() {
        let image = checker(4);
        let same = image.smooth_scale(4, 4, AspectRatioMode::Ignore);
        assert_eq!(same.bits(), image.bits());
        assert_ne!(same, image);

        let section = image.smooth_scale_section(0, 0, 2, 2, 1, 1);
        assert_eq!(section.get_pixel_color(0, 0).red, 100);
        assert!(image.smooth_scale_section(10, 10, 2, 2, 1, 1).is_null());
        assert!(image.smooth_scale(0, 4, AspectRatioMode::Ignore).is_null());
    }

    #[test]
    fn test_resize_replaces_in_place() {
        let mut image = checker(4);
        image.set_embedded_text("k", "v");
        image.resize(2, 1);
        assert_eq!(image.size(), (2, 1));
        assert_eq!(image.embedded_text("k"), Some("v"));
    }
}
