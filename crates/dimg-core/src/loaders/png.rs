//! PNG codec on top of the `png` crate.
//!
//! Reading expands palette, low-bit gray and tRNS to full samples, then
//! canonicalizes rows to BGRA. Text chunks become embedded text, except
//! the XMP packet and ImageMagick raw profiles which feed the metadata.

use std::borrow::Cow;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use super::{
    DImgLoader, LoadContext, LoadFlags, LoadedImage, LoaderState, SaveContext, get_rgba, put_bgra,
    write_atomically,
};
use crate::config::SaveSettings;
use crate::error::{DImgError, Result};
use crate::image::attributes::keys;
use crate::image::{ColorModel, DImg, IccProfile};

const XMP_KEYWORD: &str = "XML:com.adobe.xmp";
const RAW_PROFILE_PREFIX: &str = "Raw profile type ";
const SOFTWARE_KEY: &str = "Software";
/// Keys never copied from embedded text into a saved file.
const RESERVED_KEYS: [&str; 2] = [SOFTWARE_KEY, "Comment"];

#[derive(Debug, Default)]
pub struct PngLoader {
    state: LoaderState,
}

impl DImgLoader for PngLoader {
    fn format_name(&self) -> &'static str {
        "PNG"
    }

    fn state(&self) -> LoaderState {
        self.state
    }

    fn load(&mut self, path: &Path, ctx: &LoadContext<'_>) -> Result<LoadedImage> {
        let file = BufReader::new(File::open(path)?);
        let mut decoder = png::Decoder::new(file);
        decoder.set_transformations(png::Transformations::EXPAND);
        let mut reader = decoder.read_info()?;

        let (width, height, bit_depth, color_type, interlaced, has_trns) = {
            let info = reader.info();
            (
                info.width,
                info.height,
                info.bit_depth as u32,
                info.color_type,
                info.interlaced,
                info.trns.is_some(),
            )
        };
        let sixteen_bit = bit_depth == 16;
        let alpha = matches!(color_type, png::ColorType::Rgba | png::ColorType::GrayscaleAlpha) || has_trns;
        let color_model = match color_type {
            png::ColorType::Grayscale if bit_depth == 1 => ColorModel::Monochrome,
            png::ColorType::Grayscale | png::ColorType::GrayscaleAlpha => ColorModel::Grayscale,
            png::ColorType::Indexed => ColorModel::Indexed,
            png::ColorType::Rgb | png::ColorType::Rgba => ColorModel::Rgb,
        };
        tracing::debug!("PNG {width}x{height}, {bit_depth} bits, {color_type:?}, alpha={alpha}");

        let mut image = LoadedImage::new(width, height, sixteen_bit, alpha);
        ctx.report(0.1);

        if ctx.wants_pixels() {
            image.allocate()?;
            let (out_type, out_depth) = reader.output_color_type();
            let src_sixteen = out_depth == png::BitDepth::Sixteen;
            let bpl = width as usize * image.bytes_depth();
            let rows = ctx.rows(height, 0.7);

            if interlaced {
                let size = reader
                    .output_buffer_size()
                    .ok_or_else(|| DImgError::decode("PNG", "image too large"))?;
                let mut frame = vec![0u8; size];
                let out = reader.next_frame(&mut frame)?;
                for y in 0..height as usize {
                    rows.checkpoint(y as u32)?;
                    let src = &frame[y * out.line_size..(y + 1) * out.line_size];
                    convert_row(src, &mut image.data[y * bpl..(y + 1) * bpl], out_type, src_sixteen, sixteen_bit);
                }
            } else {
                let mut y = 0usize;
                while let Some(row) = reader.next_row()? {
                    if y >= height as usize {
                        break;
                    }
                    rows.checkpoint(y as u32)?;
                    convert_row(row.data(), &mut image.data[y * bpl..(y + 1) * bpl], out_type, src_sixteen, sixteen_bit);
                    y += 1;
                }
                if y < height as usize {
                    return Err(DImgError::decode("PNG", "truncated image data"));
                }
            }
            reader.finish()?;
        } else if let Err(e) = reader.finish() {
            // Trailing chunks are best effort without pixel data.
            tracing::debug!("PNG trailing chunks unreadable: {e}");
        }

        let info = reader.info();
        if ctx.wants(LoadFlags::ICC_DATA) {
            if let Some(icc) = info.icc_profile.as_ref() {
                image.icc = IccProfile::Embedded(icc.to_vec());
            }
        }
        if ctx.wants(LoadFlags::METADATA) {
            if let Some(exif) = info.exif_metadata.as_ref() {
                image.metadata.set_exif(exif);
            }
            for (key, text) in text_chunks(info) {
                store_text(&mut image, key, text);
            }
            image.read_history(ctx);
        }
        if ctx.wants(LoadFlags::ICC_DATA) {
            image.infer_icc_from_exif();
        }

        image.set_origin("PNG", color_model, bit_depth);
        ctx.report(1.0);
        self.state = LoaderState { alpha, sixteen_bit };
        Ok(image)
    }

    fn save(&mut self, path: &Path, image: &DImg, ctx: &SaveContext<'_>) -> Result<()> {
        let (width, height) = image.size();
        let sixteen_bit = image.sixteen_bit();
        let alpha = image.has_alpha();

        let quality = ctx.quality.unwrap_or(ctx.settings.png_quality).clamp(1, 99);
        let level = SaveSettings::png_compression_level(quality);
        tracing::debug!("PNG compression level {level}");

        let mut info = png::Info::with_size(width, height);
        info.color_type = if alpha { png::ColorType::Rgba } else { png::ColorType::Rgb };
        info.bit_depth = if sixteen_bit { png::BitDepth::Sixteen } else { png::BitDepth::Eight };
        if let Some(icc) = image.icc_profile().data() {
            info.icc_profile = Some(Cow::Borrowed(icc));
        }
        let exif = image.metadata().exif();
        if !exif.is_empty() {
            info.exif_metadata = Some(Cow::Borrowed(exif));
        }

        write_atomically(path, |target| {
            let out = BufWriter::new(File::create(target)?);
            let mut encoder = png::Encoder::with_info(out, info)?;
            encoder.set_deflate_compression(png::DeflateCompression::Level(level));

            for (key, value) in image.embedded_text_map() {
                if RESERVED_KEYS.contains(&key.as_str()) {
                    continue;
                }
                encoder.add_ztxt_chunk(key.clone(), value.clone())?;
            }
            encoder.add_ztxt_chunk(SOFTWARE_KEY.to_string(), format!("{} (png-rs)", ctx.software))?;

            let xmp = image.metadata().xmp();
            if !xmp.is_empty() {
                encoder.add_itxt_chunk(XMP_KEYWORD.to_string(), xmp.to_packet()?)?;
            }
            let iptc = image.metadata().iptc();
            if !iptc.is_empty() {
                encoder.add_ztxt_chunk(format!("{RAW_PROFILE_PREFIX}iptc"), encode_raw_profile("iptc", iptc))?;
            }
            ctx.report(0.2);

            let mut writer = encoder.write_header()?;
            let channels = if alpha { 4 } else { 3 };
            let sample_bytes = if sixteen_bit { 2 } else { 1 };
            let bpp = image.bytes_depth();
            let mut out = Vec::with_capacity(image.num_pixels() * channels * sample_bytes);
            let rows = ctx.rows(height, 0.8);

            for y in 0..height {
                rows.checkpoint(y)?;
                let Some(line) = image.scan_line(y) else { break };
                for px in line.chunks_exact(bpp) {
                    let rgba = get_rgba(px, sixteen_bit);
                    for &sample in &rgba[..channels] {
                        if sixteen_bit {
                            out.extend_from_slice(&sample.to_be_bytes());
                        } else {
                            out.push(sample as u8);
                        }
                    }
                }
            }
            writer.write_image_data(&out)?;
            writer.finish()?;
            Ok(())
        })?;

        ctx.report(1.0);
        self.state = LoaderState { alpha, sixteen_bit };
        Ok(())
    }
}

/// Expanded PNG row (big-endian 16-bit samples) to canonical BGRA.
fn convert_row(src: &[u8], dst: &mut [u8], color_type: png::ColorType, src_sixteen: bool, dst_sixteen: bool) {
    let channels = color_type.samples();
    let sample_bytes = if src_sixteen { 2 } else { 1 };
    let max: u16 = if dst_sixteen { u16::MAX } else { u8::MAX as u16 };
    let bpp = if dst_sixteen { 8 } else { 4 };

    let sample = |px: &[u8], i: usize| -> u16 {
        if src_sixteen {
            u16::from_be_bytes([px[2 * i], px[2 * i + 1]])
        } else {
            px[i] as u16
        }
    };

    for (px, out) in src.chunks_exact(channels * sample_bytes).zip(dst.chunks_exact_mut(bpp)) {
        let (r, g, b, a) = match channels {
            1 => {
                let v = sample(px, 0);
                (v, v, v, max)
            }
            2 => {
                let v = sample(px, 0);
                (v, v, v, sample(px, 1))
            }
            3 => (sample(px, 0), sample(px, 1), sample(px, 2), max),
            _ => (sample(px, 0), sample(px, 1), sample(px, 2), sample(px, 3)),
        };
        put_bgra(out, dst_sixteen, r, g, b, a);
    }
}

fn text_chunks(info: &png::Info<'_>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for chunk in &info.uncompressed_latin1_text {
        out.push((chunk.keyword.clone(), chunk.text.clone()));
    }
    for chunk in &info.compressed_latin1_text {
        match chunk.get_text() {
            Ok(text) => out.push((chunk.keyword.clone(), text)),
            Err(e) => tracing::warn!("skipping zTXt {}: {e}", chunk.keyword),
        }
    }
    for chunk in &info.utf8_text {
        match chunk.get_text() {
            Ok(text) => out.push((chunk.keyword.clone(), text)),
            Err(e) => tracing::warn!("skipping iTXt {}: {e}", chunk.keyword),
        }
    }
    out
}

fn store_text(image: &mut LoadedImage, key: String, text: String) {
    if key == XMP_KEYWORD {
        if let Err(e) = image.metadata.load_xmp_packet(text.as_bytes()) {
            tracing::warn!("ignoring unreadable XMP packet: {e}");
        }
        return;
    }
    if let Some(kind) = key.strip_prefix(RAW_PROFILE_PREFIX) {
        match (kind, decode_raw_profile(&text)) {
            ("exif" | "APP1", Some(data)) => image.metadata.set_exif(&data),
            ("iptc", Some(data)) => image.metadata.set_iptc(data),
            ("xmp", Some(data)) => {
                if let Err(e) = image.metadata.load_xmp_packet(&data) {
                    tracing::warn!("ignoring unreadable XMP profile: {e}");
                }
            }
            _ => tracing::debug!("ignoring raw profile {kind}"),
        }
        return;
    }
    tracing::debug!("PNG text {key}={text}");
    image.embedded_text.insert(key, text);
}

/// ImageMagick raw profile: `\n<name>\n<length>\n<hex lines>`.
fn encode_raw_profile(name: &str, data: &[u8]) -> String {
    let mut out = format!("\n{name}\n{:8}\n", data.len());
    for line in data.chunks(36) {
        for b in line {
            let _ = write!(out, "{b:02x}");
        }
        out.push('\n');
    }
    out
}

fn decode_raw_profile(text: &str) -> Option<Vec<u8>> {
    let mut lines = text.trim_start_matches('\n').splitn(3, '\n');
    let _name = lines.next()?;
    let length: usize = lines.next()?.trim().parse().ok()?;
    let hex: Vec<u8> = lines
        .next()?
        .bytes()
        .filter(u8::is_ascii_hexdigit)
        .collect();
    if hex.len() < length * 2 {
        return None;
    }
    let nibble = |c: u8| (c as char).to_digit(16).map(|d| d as u8);
    hex.chunks_exact(2)
        .take(length)
        .map(|pair| Some(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect()
}
