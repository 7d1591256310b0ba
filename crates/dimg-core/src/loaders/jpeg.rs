//! JPEG codec using the `image` crate's decoder and encoder.
//!
//! Pixels, ICC and Exif go through the crate. XMP, IPTC and comment
//! segments are read and written by a small marker scanner, since the
//! crate does not surface them.
//!
//! The encoder always writes 4:4:4 (no chroma subsampling). A
//! `subsampling` attribute asking for another ratio is not honored; saving
//! logs a warning and proceeds at 4:4:4.

use std::fs::File;
use std::io::{BufWriter, Cursor, Write};
use std::path::Path;

use image::codecs::jpeg::{JpegDecoder, JpegEncoder};
use image::{ColorType, ExtendedColorType, ImageDecoder, ImageEncoder};

use super::{
    DImgLoader, LoadContext, LoadFlags, LoadedImage, LoaderState, SaveContext, get_rgba, put_bgra,
    write_atomically,
};
use crate::error::{DImgError, Result};
use crate::image::attributes::{AttributeValue, keys};
use crate::image::{ColorModel, DImg, IccProfile};

const SOI: u8 = 0xD8;
const SOS: u8 = 0xDA;
const EOI: u8 = 0xD9;
const APP1: u8 = 0xE1;
const APP13: u8 = 0xED;
const COM: u8 = 0xFE;
const XMP_SIGNATURE: &[u8] = b"http://ns.adobe.com/xap/1.0/\0";
const PHOTOSHOP_SIGNATURE: &[u8] = b"Photoshop 3.0\0";
const COMMENT_KEY: &str = "Comment";

#[derive(Debug, Default)]
pub struct JpegLoader {
    state: LoaderState,
}

/// Metadata segments found before the first scan.
#[derive(Debug, Default, PartialEq, Eq)]
struct Segments {
    xmp: Option<Vec<u8>>,
    iptc: Option<Vec<u8>>,
    comment: Option<String>,
}

impl DImgLoader for JpegLoader {
    fn format_name(&self) -> &'static str {
        "JPEG"
    }

    fn state(&self) -> LoaderState {
        self.state
    }

    fn load(&mut self, path: &Path, ctx: &LoadContext<'_>) -> Result<LoadedImage> {
        let bytes = std::fs::read(path)?;
        let mut decoder = JpegDecoder::new(Cursor::new(bytes.as_slice()))?;
        let (width, height) = decoder.dimensions();
        let color_type = decoder.color_type();
        let color_model = match color_type {
            ColorType::L8 | ColorType::L16 | ColorType::La8 | ColorType::La16 => ColorModel::Grayscale,
            _ => ColorModel::YCbCr,
        };
        tracing::debug!("JPEG {width}x{height}, {color_type:?}");

        let mut image = LoadedImage::new(width, height, false, false);
        ctx.report(0.1);

        if ctx.wants(LoadFlags::ICC_DATA) {
            if let Some(icc) = decoder.icc_profile()? {
                image.icc = IccProfile::Embedded(icc);
            }
        }
        if ctx.wants(LoadFlags::METADATA) {
            if let Some(exif) = decoder.exif_metadata()? {
                image.metadata.set_exif(&exif);
            }
            let segments = scan_segments(&bytes);
            if let Some(xmp) = segments.xmp {
                if let Err(e) = image.metadata.load_xmp_packet(&xmp) {
                    tracing::warn!("ignoring unreadable XMP packet: {e}");
                }
            }
            if let Some(iptc) = segments.iptc {
                image.metadata.set_iptc(iptc);
            }
            if let Some(comment) = segments.comment {
                image.embedded_text.insert(COMMENT_KEY.to_string(), comment);
            }
            image.read_history(ctx);
        }
        if ctx.wants(LoadFlags::ICC_DATA) {
            image.infer_icc_from_exif();
        }

        if ctx.wants_pixels() {
            ctx.check_cancel()?;
            image.allocate()?;
            let mut raw = vec![0u8; usize::try_from(decoder.total_bytes()).map_err(|_| DImgError::decode("JPEG", "image too large"))?];
            decoder.read_image(&mut raw)?;
            ctx.report(0.9);
            ctx.check_cancel()?;

            let channels = usize::from(color_type.channel_count());
            for (src, dst) in raw.chunks_exact(channels).zip(image.data.chunks_exact_mut(4)) {
                let (r, g, b) = if channels < 3 {
                    (src[0], src[0], src[0])
                } else {
                    (src[0], src[1], src[2])
                };
                put_bgra(dst, false, r.into(), g.into(), b.into(), 255);
            }
        }

        image.set_origin("JPG", color_model, 8);
        ctx.report(1.0);
        self.state = LoaderState::default();
        Ok(image)
    }

    fn save(&mut self, path: &Path, image: &DImg, ctx: &SaveContext<'_>) -> Result<()> {
        let (width, height) = image.size();
        let quality = ctx.quality.unwrap_or(ctx.settings.jpeg_quality).clamp(1, 100);
        if let Some(sub) = image.attribute(keys::SUBSAMPLING).and_then(AttributeValue::as_int) {
            let ratio = chroma_ratio(sub);
            if ratio != ENCODER_CHROMA_RATIO {
                tracing::warn!("JPEG subsampling {ratio} is not supported; writing {ENCODER_CHROMA_RATIO}");
            }
        }
        tracing::debug!("JPEG quality {quality}");

        let sixteen_bit = image.sixteen_bit();
        let bpp = image.bytes_depth();
        let mut rgb = Vec::with_capacity(image.num_pixels() * 3);
        let rows = ctx.rows(height, 0.7);
        for y in 0..height {
            rows.checkpoint(y)?;
            let Some(line) = image.scan_line(y) else { break };
            for px in line.chunks_exact(bpp) {
                let [r, g, b, _] = get_rgba(px, sixteen_bit);
                if sixteen_bit {
                    rgb.extend_from_slice(&[(r >> 8) as u8, (g >> 8) as u8, (b >> 8) as u8]);
                } else {
                    rgb.extend_from_slice(&[r as u8, g as u8, b as u8]);
                }
            }
        }

        let mut encoded = Vec::new();
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut encoded, quality);
            if let Some(icc) = image.icc_profile().data() {
                encoder
                    .set_icc_profile(icc.to_vec())
                    .map_err(|e| DImgError::encode("JPEG", e))?;
            }
            let exif = image.metadata().exif();
            if !exif.is_empty() {
                encoder
                    .set_exif_metadata(exif.to_vec())
                    .map_err(|e| DImgError::encode("JPEG", e))?;
            }
            encoder.write_image(&rgb, width, height, ExtendedColorType::Rgb8)?;
        }
        ctx.report(0.9);

        let mut extra = Vec::new();
        let xmp = image.metadata().xmp();
        if !xmp.is_empty() {
            let mut payload = XMP_SIGNATURE.to_vec();
            payload.extend_from_slice(xmp.to_packet()?.as_bytes());
            extra.push((APP1, payload));
        }
        if let Some(comment) = image.embedded_text(COMMENT_KEY) {
            extra.push((COM, comment.as_bytes().to_vec()));
        }
        let encoded = insert_segments(encoded, &extra)?;

        write_atomically(path, |target| {
            let mut out = BufWriter::new(File::create(target)?);
            out.write_all(&encoded)?;
            out.flush()?;
            Ok(())
        })?;

        ctx.report(1.0);
        self.state = LoaderState::default();
        Ok(())
    }
}

/// Chroma ratio the encoder produces.
pub const ENCODER_CHROMA_RATIO: &str = "4:4:4";

/// Ratio named by a `subsampling` attribute value: 1 is 4:2:2, 2 is 4:2:0,
/// 3 is 4:1:1 and anything else 4:4:4.
pub fn chroma_ratio(subsampling: i64) -> &'static str {
    match subsampling {
        1 => "4:2:2",
        2 => "4:2:0",
        3 => "4:1:1",
        _ => "4:4:4",
    }
}

/// Walk marker segments up to the first scan.
fn scan_segments(data: &[u8]) -> Segments {
    let mut segments = Segments::default();
    if data.len() < 4 || data[0] != 0xFF || data[1] != SOI {
        return segments;
    }
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            break;
        }
        let marker = data[pos + 1];
        if marker == 0xFF {
            pos += 1;
            continue;
        }
        if marker == SOS || marker == EOI {
            break;
        }
        let len = usize::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));
        if len < 2 || pos + 2 + len > data.len() {
            break;
        }
        let payload = &data[pos + 4..pos + 2 + len];
        match marker {
            APP1 if payload.starts_with(XMP_SIGNATURE) => {
                segments.xmp = Some(payload[XMP_SIGNATURE.len()..].to_vec());
            }
            APP13 if payload.starts_with(PHOTOSHOP_SIGNATURE) => {
                segments.iptc = Some(payload[PHOTOSHOP_SIGNATURE.len()..].to_vec());
            }
            COM => segments.comment = Some(String::from_utf8_lossy(payload).into_owned()),
            _ => {}
        }
        pos += 2 + len;
    }
    segments
}

/// Splice `segments` in after the leading APPn run of an encoded stream.
fn insert_segments(mut jpeg: Vec<u8>, segments: &[(u8, Vec<u8>)]) -> Result<Vec<u8>> {
    if segments.is_empty() {
        return Ok(jpeg);
    }
    let mut pos = 2;
    while pos + 4 <= jpeg.len() && jpeg[pos] == 0xFF && (0xE0..=0xEF).contains(&jpeg[pos + 1]) {
        let len = usize::from(u16::from_be_bytes([jpeg[pos + 2], jpeg[pos + 3]]));
        pos += 2 + len;
    }
    let pos = pos.min(jpeg.len());

    let mut block = Vec::new();
    for (marker, payload) in segments {
        let len = u16::try_from(payload.len() + 2)
            .map_err(|_| DImgError::encode("JPEG", "metadata segment exceeds 64 KiB"))?;
        block.extend_from_slice(&[0xFF, *marker]);
        block.extend_from_slice(&len.to_be_bytes());
        block.extend_from_slice(payload);
    }
    jpeg.splice(pos..pos, block);
    Ok(jpeg)
}
