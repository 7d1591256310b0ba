//! Pixel compositing strategies.
//!
//! # Algorithm
//! Porter-Duff (1984) compositing on premultiplied colors. Each rule is
//! a pair of factors `(Fa, Fb)` so that every channel, alpha included,
//! becomes
//! ```text
//! result = src × Fa + dst × Fb
//! ```
//! with `Fa`, `Fb` drawn from `{0, 1, αs, αd, 1 − αs, 1 − αd}`.
//! `None` is the odd one out: a plain alpha blend of the color channels
//! that leaves destination alpha untouched, used to flatten an image onto
//! an opaque background.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::color::DColor;

bitflags! {
    /// Pre/post-processing applied around [`DColorComposer::compose`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MultiplicationFlags: u8 {
        const PREMULTIPLY_SRC = 1;
        const PREMULTIPLY_DST = 1 << 1;
        const DEMULTIPLY_DST = 1 << 2;
        /// What straight-alpha buffers need for the Porter-Duff rules.
        const FOR_DIMG = Self::PREMULTIPLY_SRC.bits()
            | Self::PREMULTIPLY_DST.bits()
            | Self::DEMULTIPLY_DST.bits();
    }
}

/// Compositing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PorterDuffRule {
    None,
    Clear,
    Src,
    SrcOver,
    DstOver,
    SrcIn,
    DstIn,
    SrcOut,
    DstOut,
    SrcAtop,
    DstAtop,
    Xor,
}

/// A compositing strategy combining a source color into a destination.
pub trait DColorComposer: Send + Sync {
    /// Composite `src` into `dest`. Colors are expected premultiplied
    /// unless the rule says otherwise.
    fn compose(&self, dest: &mut DColor, src: DColor);

    /// Composite with optional (de)multiplication around the rule.
    fn compose_with_flags(&self, dest: &mut DColor, mut src: DColor, flags: MultiplicationFlags) {
        if flags.contains(MultiplicationFlags::PREMULTIPLY_SRC) {
            src.premultiply();
        }
        if flags.contains(MultiplicationFlags::PREMULTIPLY_DST) {
            dest.premultiply();
        }
        self.compose(dest, src);
        if flags.contains(MultiplicationFlags::DEMULTIPLY_DST) {
            dest.demultiply();
        }
    }
}

/// Stateless composer for one [`PorterDuffRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PorterDuffComposer {
    pub rule: PorterDuffRule,
}

impl PorterDuffRule {
    pub fn composer(self) -> PorterDuffComposer {
        PorterDuffComposer { rule: self }
    }
}

#[derive(Clone, Copy)]
enum Factor {
    Zero,
    One,
    SrcAlpha,
    DstAlpha,
    InvSrcAlpha,
    InvDstAlpha,
}

impl Factor {
    fn value(self, src: &DColor, dst: &DColor, max: i32) -> i32 {
        match self {
            Self::Zero => 0,
            Self::One => max,
            Self::SrcAlpha => src.alpha,
            Self::DstAlpha => dst.alpha,
            Self::InvSrcAlpha => max - src.alpha,
            Self::InvDstAlpha => max - dst.alpha,
        }
    }
}

impl PorterDuffComposer {
    fn factors(&self) -> (Factor, Factor) {
        use Factor::*;
        match self.rule {
            PorterDuffRule::None | PorterDuffRule::SrcOver => (One, InvSrcAlpha),
            PorterDuffRule::Clear => (Zero, Zero),
            PorterDuffRule::Src => (One, Zero),
            PorterDuffRule::DstOver => (InvDstAlpha, One),
            PorterDuffRule::SrcIn => (DstAlpha, Zero),
            PorterDuffRule::DstIn => (Zero, SrcAlpha),
            PorterDuffRule::SrcOut => (InvDstAlpha, Zero),
            PorterDuffRule::DstOut => (Zero, InvSrcAlpha),
            PorterDuffRule::SrcAtop => (DstAlpha, InvSrcAlpha),
            PorterDuffRule::DstAtop => (InvDstAlpha, SrcAlpha),
            PorterDuffRule::Xor => (InvDstAlpha, InvSrcAlpha),
        }
    }
}

impl DColorComposer for PorterDuffComposer {
    fn compose(&self, dest: &mut DColor, src: DColor) {
        let max = dest.max_value();

        if self.rule == PorterDuffRule::None {
            // Straight alpha blend; destination alpha stays as is.
            let sa = src.alpha as i64;
            let inv = max as i64 - sa;
            let blend = |s: i32, d: i32| ((s as i64 * sa + d as i64 * inv) / max as i64) as i32;
            dest.red = blend(src.red, dest.red);
            dest.green = blend(src.green, dest.green);
            dest.blue = blend(src.blue, dest.blue);
            dest.blend_clamp();
            return;
        }

        let (fa, fb) = self.factors();
        let fa = fa.value(&src, dest, max) as i64;
        let fb = fb.value(&src, dest, max) as i64;
        let mix = |s: i32, d: i32| ((s as i64 * fa + d as i64 * fb) / max as i64) as i32;
        dest.red = mix(src.red, dest.red);
        dest.green = mix(src.green, dest.green);
        dest.blue = mix(src.blue, dest.blue);
        dest.alpha = mix(src.alpha, dest.alpha);
        dest.blend_clamp();
    }

    fn compose_with_flags(&self, dest: &mut DColor, mut src: DColor, flags: MultiplicationFlags) {
        // The straight blend works on unmultiplied colors.
        let straight = self.rule == PorterDuffRule::None;
        if !straight && flags.contains(MultiplicationFlags::PREMULTIPLY_SRC) {
            src.premultiply();
        }
        if !straight && flags.contains(MultiplicationFlags::PREMULTIPLY_DST) {
            dest.premultiply();
        }
        self.compose(dest, src);
        if !straight && flags.contains(MultiplicationFlags::DEMULTIPLY_DST) {
            dest.demultiply();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_blends_onto_opaque_background() {
        let mut dest = DColor::white(false);
        let src = DColor::new(0, 0, 0, 0, false);
        PorterDuffRule::None.composer().compose(&mut dest, src);
        assert_eq!(dest, DColor::white(false));

        let mut dest = DColor::white(false);
        let src = DColor::new(0, 0, 0, 255, false);
        PorterDuffRule::None.composer().compose(&mut dest, src);
        assert_eq!(dest, DColor::black(false));
    }

    #[test]
    fn test_src_over_opaque_source_replaces() {
        let mut dest = DColor::new(10, 20, 30, 255, false);
        let src = DColor::new(200, 100, 50, 255, false);
        PorterDuffRule::SrcOver.composer().compose(&mut dest, src);
        assert_eq!(dest, src);
    }

    #[test]
    fn test_clear_zeroes_everything() {
        let mut dest = DColor::new(10, 20, 30, 255, true);
        PorterDuffRule::Clear
            .composer()
            .compose(&mut dest, DColor::white(true));
        assert_eq!(dest, DColor::new(0, 0, 0, 0, true));
    }

    #[test]
    fn test_dst_in_uses_source_alpha() {
        let mut dest = DColor::new(200, 200, 200, 255, false);
        let src = DColor::new(0, 0, 0, 0, false);
        PorterDuffRule::DstIn
            .composer()
            .compose_with_flags(&mut dest, src, MultiplicationFlags::FOR_DIMG);
        assert_eq!(dest.alpha, 0);
    }
}
