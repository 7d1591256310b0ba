//! 8 <-> 16 bit conversion of the whole buffer.
//!
//! Narrowing keeps the high byte. Widening multiplies color channels by
//! 256 and adds noise in `0..=255` so that smooth 8-bit gradients do not
//! turn into visible steps after later 16-bit processing. The noise is
//! blake3 extendable output keyed by a fixed seed: converting the same
//! image twice gives the same result. Alpha is widened without noise as
//! `v * 257`, keeping opaque pixels opaque.

use crate::image::{BitDepth, DImg};

/// Seed of the widening noise stream.
pub const DEPTH_NOISE_SEED: u64 = 0x4449_6d67;

fn noise_stream(seed: u64) -> blake3::OutputReader {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&seed.to_le_bytes());
    hasher.update(b"dimg depth noise");
    hasher.finalize_xof()
}

fn narrow(data: &[u8]) -> Vec<u8> {
    data.chunks_exact(2)
        .map(|s| ((u32::from(u16::from_ne_bytes([s[0], s[1]])) * 256) / 65536) as u8)
        .collect()
}

fn widen(data: &[u8]) -> Vec<u8> {
    let mut noise = noise_stream(DEPTH_NOISE_SEED);
    let mut out = Vec::with_capacity(data.len() * 2);
    let mut dither = [0u8; 3];
    for px in data.chunks_exact(4) {
        noise.fill(&mut dither);
        for (&v, &d) in px[..3].iter().zip(&dither) {
            out.extend_from_slice(&(u16::from(v) * 256 + u16::from(d)).to_ne_bytes());
        }
        out.extend_from_slice(&(u16::from(px[3]) * 257).to_ne_bytes());
    }
    out
}

impl DImg {
    /// Convert the buffer to `depth`. No-op for a null image or when the
    /// depth already matches.
    pub fn convert_depth(&mut self, depth: BitDepth) {
        if self.is_null() || self.bit_depth() == depth {
            return;
        }
        let sixteen_bit = depth == BitDepth::Sixteen;
        let converted = if sixteen_bit {
            widen(self.bits())
        } else {
            narrow(self.bits())
        };
        let d = self.d_mut();
        d.data = converted;
        d.sixteen_bit = sixteen_bit;
    }

    pub fn convert_to_sixteen_bit(&mut self) {
        self.convert_depth(BitDepth::Sixteen);
    }

    pub fn convert_to_eight_bit(&mut self) {
        self.convert_depth(BitDepth::Eight);
    }

    pub fn convert_to_depth_of(&mut self, other: &DImg) {
        self.convert_depth(other.bit_depth());
    }
}
