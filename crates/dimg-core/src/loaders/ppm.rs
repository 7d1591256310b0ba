//! Binary PPM (P6) and PGM (P5) with up to 16 bits per sample.
//!
//! Eight-bit PPM is left to the generic loader; this codec exists for the
//! 16-bit variant, whose samples are stored big-endian.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use super::{
    DImgLoader, LoadContext, LoadedImage, LoaderState, SaveContext, get_rgba, put_bgra,
    scale_to_u16, write_atomically,
};
use crate::error::{DImgError, Result};
use crate::image::{ColorModel, DImg};

/// Header of a binary netpbm file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpmHeader {
    /// `b'6'` for color, `b'5'` for gray.
    pub kind: u8,
    pub width: u32,
    pub height: u32,
    pub max_value: u32,
}

impl PpmHeader {
    pub fn channels(&self) -> usize {
        if self.kind == b'5' { 1 } else { 3 }
    }

    pub fn bytes_per_sample(&self) -> usize {
        if self.max_value > 255 { 2 } else { 1 }
    }
}

/// Parse the header at the start of `reader`, leaving it positioned on
/// the first sample byte.
pub fn read_header<R: BufRead>(reader: &mut R) -> Result<PpmHeader> {
    let mut magic = [0u8; 2];
    reader.read_exact(&mut magic)?;
    if magic[0] != b'P' || !matches!(magic[1], b'5' | b'6') {
        return Err(DImgError::decode("PPM", "not a binary PPM/PGM file"));
    }

    let width = read_number(reader)?;
    let height = read_number(reader)?;
    let max_value = read_number(reader)?;
    if width == 0 || height == 0 || !(1..=65535).contains(&max_value) {
        return Err(DImgError::decode(
            "PPM",
            format!("bad header {width}x{height} max {max_value}"),
        ));
    }

    Ok(PpmHeader {
        kind: magic[1],
        width,
        height,
        max_value,
    })
}

pub fn read_header_from_path(path: &Path) -> Result<PpmHeader> {
    read_header(&mut BufReader::new(File::open(path)?))
}

fn next_byte<R: BufRead>(reader: &mut R) -> Result<u8> {
    let mut byte = [0u8; 1];
    reader.read_exact(&mut byte)?;
    Ok(byte[0])
}

/// Decimal field preceded by whitespace or `#` comments. Consumes the one
/// whitespace byte that terminates it.
fn read_number<R: BufRead>(reader: &mut R) -> Result<u32> {
    let mut byte = next_byte(reader)?;
    loop {
        if byte == b'#' {
            let mut comment = Vec::new();
            reader.read_until(b'\n', &mut comment)?;
            byte = next_byte(reader)?;
        } else if byte.is_ascii_whitespace() {
            byte = next_byte(reader)?;
        } else {
            break;
        }
    }

    let mut value: u32 = 0;
    let mut digits = 0;
    while byte.is_ascii_digit() {
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u32::from(byte - b'0')))
            .ok_or_else(|| DImgError::decode("PPM", "header number overflows"))?;
        digits += 1;
        byte = next_byte(reader)?;
    }
    if digits == 0 || !byte.is_ascii_whitespace() {
        return Err(DImgError::decode("PPM", "malformed header number"));
    }
    Ok(value)
}

#[derive(Debug, Default)]
pub struct PpmLoader {
    state: LoaderState,
}

impl DImgLoader for PpmLoader {
    fn format_name(&self) -> &'static str {
        "PPM"
    }

    fn state(&self) -> LoaderState {
        self.state
    }

    fn load(&mut self, path: &Path, ctx: &LoadContext<'_>) -> Result<LoadedImage> {
        let mut reader = BufReader::new(File::open(path)?);
        let header = read_header(&mut reader)?;
        tracing::debug!(
            "PPM P{} {}x{} max {}",
            header.kind as char,
            header.width,
            header.height,
            header.max_value
        );

        let sixteen_bit = header.max_value > 255;
        let mut image = LoadedImage::new(header.width, header.height, sixteen_bit, false);
        ctx.report(0.1);

        if ctx.wants_pixels() {
            image.allocate()?;
            let channels = header.channels();
            let sample_bytes = header.bytes_per_sample();
            let bits = 32 - header.max_value.leading_zeros();
            let full_range = header.max_value == (1 << bits) - 1;
            let mut row = vec![0u8; header.width as usize * channels * sample_bytes];
            let bpp = image.bytes_depth();
            let stride = header.width as usize * bpp;
            let rows = ctx.rows(header.height, 0.8);

            for y in 0..header.height {
                rows.checkpoint(y)?;
                reader.read_exact(&mut row)?;
                let line = &mut image.data[y as usize * stride..(y as usize + 1) * stride];
                for (src, dst) in row.chunks_exact(channels * sample_bytes).zip(line.chunks_exact_mut(bpp)) {
                    let sample = |i: usize| -> u16 {
                        let raw = if sample_bytes == 2 {
                            u32::from(u16::from_be_bytes([src[i * 2], src[i * 2 + 1]]))
                        } else {
                            u32::from(src[i])
                        };
                        let level = if full_range {
                            scale_to_u16(raw, bits)
                        } else {
                            (raw.min(header.max_value) * 65535 / header.max_value) as u16
                        };
                        if sixteen_bit { level } else { level >> 8 }
                    };
                    let (r, g, b) = if channels == 1 {
                        let v = sample(0);
                        (v, v, v)
                    } else {
                        (sample(0), sample(1), sample(2))
                    };
                    let opaque = if sixteen_bit { u16::MAX } else { 255 };
                    put_bgra(dst, sixteen_bit, r, g, b, opaque);
                }
            }
            ctx.report(0.9);
        }

        let model = if header.channels() == 1 {
            ColorModel::Grayscale
        } else {
            ColorModel::Rgb
        };
        image.set_origin("PPM", model, if sixteen_bit { 16 } else { 8 });
        ctx.report(1.0);
        self.state = LoaderState {
            alpha: false,
            sixteen_bit,
        };
        Ok(image)
    }

    fn save(&mut self, path: &Path, image: &DImg, ctx: &SaveContext<'_>) -> Result<()> {
        let (width, height) = image.size();
        let sixteen_bit = image.sixteen_bit();
        let max_value = if sixteen_bit { 65535 } else { 255 };
        let bpp = image.bytes_depth();

        write_atomically(path, |target| {
            let mut out = BufWriter::new(File::create(target)?);
            write!(out, "P6\n{width} {height}\n{max_value}\n")?;
            let rows = ctx.rows(height, 0.8);
            let mut buf = Vec::with_capacity(width as usize * 3 * if sixteen_bit { 2 } else { 1 });
            for y in 0..height {
                rows.checkpoint(y)?;
                let Some(line) = image.scan_line(y) else { break };
                buf.clear();
                for px in line.chunks_exact(bpp) {
                    let [r, g, b, _] = get_rgba(px, sixteen_bit);
                    for v in [r, g, b] {
                        if sixteen_bit {
                            buf.extend_from_slice(&v.to_be_bytes());
                        } else {
                            buf.push(v as u8);
                        }
                    }
                }
                out.write_all(&buf)?;
            }
            out.flush()?;
            Ok(())
        })?;

        ctx.report(1.0);
        self.state = LoaderState {
            alpha: false,
            sixteen_bit,
        };
        Ok(())
    }
}
