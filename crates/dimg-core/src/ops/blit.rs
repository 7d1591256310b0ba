//! Rectangle copies and blends between buffers of the same depth.

use crate::color::DColor;
use crate::composer::{DColorComposer, MultiplicationFlags, PorterDuffRule};
use crate::image::DImg;

/// Source rectangle plus destination origin of a blit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub sx: i32,
    pub sy: i32,
    pub w: i32,
    pub h: i32,
    pub dx: i32,
    pub dy: i32,
}

impl Region {
    pub const fn new(sx: i32, sy: i32, w: i32, h: i32, dx: i32, dy: i32) -> Self {
        Self {
            sx,
            sy,
            w,
            h,
            dx,
            dy,
        }
    }

    /// Whole `width x height` area mapped onto itself.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32, 0, 0)
    }
}

/// Clip `region` so that it lies inside a `src` buffer and lands inside a
/// `dst` buffer. Negative origins move the opposite origin and shrink the
/// size. False when nothing is left to copy.
pub fn normalize_region_arguments(region: &mut Region, src: (u32, u32), dst: (u32, u32)) -> bool {
    let r = region;
    if r.sx < 0 {
        r.dx -= r.sx;
        r.w += r.sx;
        r.sx = 0;
    }
    if r.sy < 0 {
        r.dy -= r.sy;
        r.h += r.sy;
        r.sy = 0;
    }
    if r.dx < 0 {
        r.sx -= r.dx;
        r.w += r.dx;
        r.dx = 0;
    }
    if r.dy < 0 {
        r.sy -= r.dy;
        r.h += r.dy;
        r.dy = 0;
    }

    let (sw, sh) = (src.0 as i64, src.1 as i64);
    let (dw, dh) = (dst.0 as i64, dst.1 as i64);
    let mut w = i64::from(r.w);
    let mut h = i64::from(r.h);
    w = w.min(sw - i64::from(r.sx)).min(dw - i64::from(r.dx));
    h = h.min(sh - i64::from(r.sy)).min(dh - i64::from(r.dy));
    if w <= 0 || h <= 0 {
        return false;
    }
    r.w = w as i32;
    r.h = h as i32;
    true
}

/// Row-wise copy of a normalized region between two canonical buffers.
fn blit_rows(src: &[u8], src_width: u32, dst: &mut [u8], dst_width: u32, r: &Region, bpp: usize) {
    let len = r.w as usize * bpp;
    for row in 0..r.h as usize {
        let s = ((r.sy as usize + row) * src_width as usize + r.sx as usize) * bpp;
        let d = ((r.dy as usize + row) * dst_width as usize + r.dx as usize) * bpp;
        dst[d..d + len].copy_from_slice(&src[s..s + len]);
    }
}

impl DImg {
    /// Copy `w x h` pixels at `(sx, sy)` of `src` to `(dx, dy)` of this
    /// image. Both images must share one depth.
    #[allow(clippy::too_many_arguments)]
    pub fn bit_blt_image(&mut self, src: &DImg, sx: i32, sy: i32, w: i32, h: i32, dx: i32, dy: i32) {
        if self.is_null() || src.is_null() {
            return;
        }
        if src.sixteen_bit() != self.sixteen_bit() {
            tracing::warn!("blit between images of different depth is not supported");
            return;
        }
        if self == src && sx == dx && sy == dy {
            return;
        }
        let mut region = Region::new(sx, sy, w, h, dx, dy);
        if !normalize_region_arguments(&mut region, src.size(), self.size()) {
            return;
        }
        let bpp = self.bytes_depth();
        let dst_width = self.width();
        blit_rows(src.bits(), src.width(), self.bits_mut(), dst_width, &region, bpp);
    }

    /// Copy all of `src` to `(dx, dy)`.
    pub fn bit_blt_image_at(&mut self, src: &DImg, dx: i32, dy: i32) {
        self.bit_blt_image(src, 0, 0, src.width() as i32, src.height() as i32, dx, dy);
    }

    /// Copy from a raw canonical buffer of `src_size` pixels.
    pub fn bit_blt_from_raw(&mut self, src: &[u8], src_size: (u32, u32), sixteen_bit: bool, region: Region) {
        if self.is_null() {
            return;
        }
        if sixteen_bit != self.sixteen_bit() {
            tracing::warn!("blit between buffers of different depth is not supported");
            return;
        }
        let bpp = self.bytes_depth();
        if src.len() < src_size.0 as usize * src_size.1 as usize * bpp {
            tracing::warn!("raw blit source shorter than {}x{}", src_size.0, src_size.1);
            return;
        }
        let mut region = region;
        if !normalize_region_arguments(&mut region, src_size, self.size()) {
            return;
        }
        let dst_width = self.width();
        blit_rows(src, src_size.0, self.bits_mut(), dst_width, &region, bpp);
    }

    /// Copy a region of this image into a raw canonical buffer of
    /// `dst_size` pixels.
    pub fn bit_blt_to_raw(&self, dst: &mut [u8], dst_size: (u32, u32), region: Region) {
        if self.is_null() {
            return;
        }
        let bpp = self.bytes_depth();
        if dst.len() < dst_size.0 as usize * dst_size.1 as usize * bpp {
            tracing::warn!("raw blit target shorter than {}x{}", dst_size.0, dst_size.1);
            return;
        }
        let mut region = region;
        if !normalize_region_arguments(&mut region, self.size(), dst_size) {
            return;
        }
        blit_rows(self.bits(), self.width(), dst, dst_size.0, &region, bpp);
    }

    /// Composite a region of `src` onto this image with `composer`.
    pub fn bit_blend_image(
        &mut self,
        composer: &dyn DColorComposer,
        src: &DImg,
        region: Region,
        flags: MultiplicationFlags,
    ) {
        if self.is_null() || src.is_null() {
            return;
        }
        if src.sixteen_bit() != self.sixteen_bit() {
            tracing::warn!("blend between images of different depth is not supported");
            return;
        }
        let mut r = region;
        if !normalize_region_arguments(&mut r, src.size(), self.size()) {
            return;
        }

        let sixteen_bit = self.sixteen_bit();
        let bpp = self.bytes_depth();
        let (src_width, dst_width) = (src.width() as usize, self.width() as usize);
        let src_bits = src.bits();
        let dst_bits = self.bits_mut();
        for row in 0..r.h as usize {
            for col in 0..r.w as usize {
                let s = ((r.sy as usize + row) * src_width + r.sx as usize + col) * bpp;
                let d = ((r.dy as usize + row) * dst_width + r.dx as usize + col) * bpp;
                let source = DColor::from_pixel(&src_bits[s..s + bpp], sixteen_bit);
                let mut dest = DColor::from_pixel(&dst_bits[d..d + bpp], sixteen_bit);
                composer.compose_with_flags(&mut dest, source, flags);
                dest.set_pixel(&mut dst_bits[d..d + bpp]);
            }
        }
    }

    /// Blend every pixel of this image onto a solid `color`.
    pub fn bit_blend_image_on_color(&mut self, color: DColor) {
        let flags = if self.has_alpha() {
            MultiplicationFlags::FOR_DIMG
        } else {
            MultiplicationFlags::empty()
        };
        let (w, h) = (self.width() as i32, self.height() as i32);
        self.bit_blend_image_on_color_rect(&PorterDuffRule::None.composer(), color, 0, 0, w, h, flags);
    }

    /// Blend the pixels inside a rectangle onto `color`: each pixel is the
    /// source, the color the destination.
    #[allow(clippy::too_many_arguments)]
    pub fn bit_blend_image_on_color_rect(
        &mut self,
        composer: &dyn DColorComposer,
        color: DColor,
        x: i32,
        y: i32,
        w: i32,
        h: i32,
        flags: MultiplicationFlags,
    ) {
        if self.is_null() {
            return;
        }
        let mut r = Region::new(x, y, w, h, x, y);
        if !normalize_region_arguments(&mut r, self.size(), self.size()) {
            return;
        }
        let sixteen_bit = self.sixteen_bit();
        let color = color.converted_to_depth(sixteen_bit);
        let bpp = self.bytes_depth();
        let width = self.width() as usize;
        let bits = self.bits_mut();
        for row in r.sy as usize..(r.sy + r.h) as usize {
            let start = (row * width + r.sx as usize) * bpp;
            let end = start + r.w as usize * bpp;
            for px in bits[start..end].chunks_exact_mut(bpp) {
                let source = DColor::from_pixel(px, sixteen_bit);
                let mut dest = color;
                composer.compose_with_flags(&mut dest, source, flags);
                dest.set_pixel(px);
            }
        }
    }

    /// Flatten onto white and drop the alpha channel.
    pub fn remove_alpha_channel(&mut self) {
        self.remove_alpha_channel_on(DColor::white(false));
    }

    /// Flatten onto `background` and drop the alpha channel. Every alpha
    /// sample ends at the maximum value.
    pub fn remove_alpha_channel_on(&mut self, background: DColor) {
        if self.is_null() || !self.has_alpha() {
            return;
        }
        self.bit_blend_image_on_color(background);

        let sixteen_bit = self.sixteen_bit();
        for px in self.bits_mut().chunks_exact_mut(if sixteen_bit { 8 } else { 4 }) {
            if sixteen_bit {
                px[6..8].copy_from_slice(&u16::MAX.to_ne_bytes());
            } else {
                px[3] = u8::MAX;
            }
        }
        self.set_has_alpha(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(width: u32, height: u32) -> DImg {
        let mut image = DImg::from_data(width, height, false, false, None);
        for y in 0..height {
            for x in 0..width {
                let v = (y * width + x) as i32;
                image.set_pixel_color(x, y, DColor::new(v, v, v, 255, false));
            }
        }
        image
    }

    #[test]
    fn test_normalize_shifts_negative_origins() {
        let mut r = Region::new(-2, -1, 5, 4, 0, 0);
        assert!(normalize_region_arguments(&mut r, (10, 10), (10, 10)));
        assert_eq!(r, Region::new(0, 0, 3, 3, 2, 1));

        let mut r = Region::new(0, 0, 5, 5, -3, 0);
        assert!(normalize_region_arguments(&mut r, (10, 10), (10, 10)));
        assert_eq!(r, Region::new(3, 0, 2, 5, 0, 0));
    }

    #[test]
    fn test_normalize_clips_to_both_buffers() {
        let mut r = Region::new(6, 0, 10, 10, 0, 7);
        assert!(normalize_region_arguments(&mut r, (8, 20), (20, 9)));
        assert_eq!((r.w, r.h), (2, 2));
    }

    #[test]
    fn test_normalize_fully_outside_is_rejected() {
        let mut r = Region::new(20, 0, 5, 5, 0, 0);
        assert!(!normalize_region_arguments(&mut r, (10, 10), (10, 10)));
        let mut r = Region::new(0, 0, 5, 5, -5, 0);
        assert!(!normalize_region_arguments(&mut r, (10, 10), (10, 10)));
    }

    #[test]
    fn test_blit_copies_rectangle() {
        let src = numbered(4, 4);
        let mut dst = DImg::from_data(4, 4, false, false, None);
        dst.bit_blt_image(&src, 1, 1, 2, 2, 0, 0);
        assert_eq!(dst.get_pixel_color(0, 0).red, 5);
        assert_eq!(dst.get_pixel_color(1, 1).red, 10);
        assert_eq!(dst.get_pixel_color(2, 2).red, 0);
    }

    #[test]
    fn test_blit_onto_shared_copy_detaches() {
        let mut image = numbered(3, 3);
        let original = image.clone();
        image.bit_blt_image(&original, 0, 0, 1, 1, 2, 2);
        assert_eq!(image.get_pixel_color(2, 2).red, 0);
        assert_eq!(original.get_pixel_color(2, 2).red, 8);
    }

    #[test]
    fn test_blit_depth_mismatch_is_ignored() {
        let src = DImg::from_data(2, 2, true, false, None);
        let mut dst = numbered(2, 2);
        let before = dst.copy_bits();
        dst.bit_blt_image_at(&src, 0, 0);
        assert_eq!(dst.bits(), before.as_slice());
    }

    #[test]
    fn test_raw_blit_both_ways() {
        let image = numbered(3, 2);
        let mut raw = vec![0u8; 2 * 2 * 4];
        image.bit_blt_to_raw(&mut raw, (2, 2), Region::new(1, 0, 2, 2, 0, 0));
        assert_eq!(DColor::from_pixel(&raw[12..], false).red, 5);

        let mut target = DImg::from_data(2, 2, false, false, None);
        target.bit_blt_from_raw(&raw, (2, 2), false, Region::full(2, 2));
        assert_eq!(target.get_pixel_color(1, 1).red, 5);
    }

    #[test]
    fn test_blend_src_over_with_transparent_source_keeps_dest() {
        let mut dst = numbered(2, 2);
        let mut src = DImg::from_data(2, 2, false, true, None);
        src.fill(DColor::new(255, 0, 0, 0, false));
        dst.bit_blend_image(
            &PorterDuffRule::SrcOver.composer(),
            &src,
            Region::full(2, 2),
            MultiplicationFlags::FOR_DIMG,
        );
        assert_eq!(dst.get_pixel_color(1, 1), DColor::new(3, 3, 3, 255, false));
    }

    #[test]
    fn test_remove_alpha_flattens_onto_white() {
        let mut image = DImg::from_data(2, 1, true, true, None);
        image.set_pixel_color(1, 0, DColor::new(0, 0, 0, 65535, true));
        image.remove_alpha_channel();
        assert!(!image.has_alpha());
        assert_eq!(image.get_pixel_color(0, 0), DColor::white(true));
        assert_eq!(image.get_pixel_color(1, 0), DColor::black(true));
    }
}
