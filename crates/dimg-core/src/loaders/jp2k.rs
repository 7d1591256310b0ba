//! JPEG 2000, both the JP2 box container and bare codestreams.
//!
//! Headers, the `colr` box and the XMP / Exif `uuid` boxes are parsed
//! natively. Wavelet coding is delegated to a [`Jpeg2000Codec`] registered
//! with [`set_jpeg2000_codec`]; without one, info loads still work and
//! pixel loads fail with `Unsupported`.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::{
    CodecPixels, DImgLoader, LoadContext, LoadFlags, LoadedImage, LoaderState, SaveContext,
    write_atomically,
};
use crate::error::{DImgError, Result};
use crate::image::{ColorModel, DImg, IccProfile};
use crate::observer::DImgLoaderObserver;

const JP2_SIGNATURE: [u8; 12] = [0, 0, 0, 0x0C, b'j', b'P', b' ', b' ', 0x0D, 0x0A, 0x87, 0x0A];
const SOC: [u8; 2] = [0xFF, 0x4F];
const SIZ: [u8; 2] = [0xFF, 0x51];

const XMP_UUID: [u8; 16] = [
    0xBE, 0x7A, 0xCF, 0xCB, 0x97, 0xA9, 0x42, 0xE8, 0x9C, 0x71, 0x99, 0x94, 0x91, 0xE3, 0xAF, 0xAC,
];
const EXIF_UUID: [u8; 16] = *b"JpgTiffExif->JP2";

/// Enumerated color spaces of the `colr` box.
const CS_SRGB: u32 = 16;
const CS_GRAY: u32 = 17;
const CS_SYCC: u32 = 18;

/// External JPEG 2000 codec.
pub trait Jpeg2000Codec: Send + Sync {
    /// Decode a JP2 file or raw codestream.
    fn decode(&self, data: &[u8], observer: Option<&dyn DImgLoaderObserver>) -> Result<CodecPixels>;

    /// Encode to a JP2 file. `quality` 100 requests lossless coding.
    fn encode(&self, pixels: &CodecPixels, quality: u8) -> Result<Vec<u8>>;
}

static CODEC: OnceLock<RwLock<Option<Arc<dyn Jpeg2000Codec>>>> = OnceLock::new();

fn slot() -> &'static RwLock<Option<Arc<dyn Jpeg2000Codec>>> {
    CODEC.get_or_init(|| RwLock::new(None))
}

pub fn set_jpeg2000_codec(codec: Arc<dyn Jpeg2000Codec>) {
    *slot().write() = Some(codec);
}

pub fn clear_jpeg2000_codec() {
    *slot().write() = None;
}

pub fn jpeg2000_codec() -> Option<Arc<dyn Jpeg2000Codec>> {
    slot().read().clone()
}

/// What the headers say about the image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Jp2Info {
    pub width: u32,
    pub height: u32,
    pub components: u16,
    /// Bits per component of the first component.
    pub bits: u8,
    pub color_space: Option<u32>,
    pub icc: Option<Vec<u8>>,
    pub xmp: Option<Vec<u8>>,
    pub exif: Option<Vec<u8>>,
}

impl Jp2Info {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.starts_with(&JP2_SIGNATURE) {
            let mut info = Self::default();
            walk_boxes(data, &mut info)?;
            if info.width == 0 || info.height == 0 {
                return Err(DImgError::decode("JP2", "no image header box"));
            }
            Ok(info)
        } else if data.starts_with(&SOC) {
            parse_codestream(data)
        } else {
            Err(DImgError::decode("JP2", "neither a JP2 file nor a codestream"))
        }
    }

    fn color_model(&self) -> ColorModel {
        match self.color_space {
            Some(CS_GRAY) => ColorModel::Grayscale,
            Some(CS_SYCC) => ColorModel::YCbCr,
            _ if self.components < 3 => ColorModel::Grayscale,
            _ => ColorModel::Rgb,
        }
    }

    fn has_alpha(&self) -> bool {
        self.components == 2 || self.components >= 4
    }
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes(data.get(at..at + 2)?.try_into().ok()?))
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

fn be_u64(data: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_be_bytes(data.get(at..at + 8)?.try_into().ok()?))
}

/// Iterate `(type, payload)` over the boxes of one level.
fn boxes(data: &[u8]) -> impl Iterator<Item = Result<([u8; 4], &[u8])>> + '_ {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos + 8 > data.len() {
            return None;
        }
        let truncated = || Some(Err(DImgError::decode("JP2", "truncated box")));
        let Some(len) = be_u32(data, pos) else { return truncated() };
        let kind: [u8; 4] = data[pos + 4..pos + 8].try_into().ok()?;
        let (header, total) = match len {
            0 => (8, data.len() - pos),
            1 => match be_u64(data, pos + 8).and_then(|l| usize::try_from(l).ok()) {
                Some(l) => (16, l),
                None => return truncated(),
            },
            l => (8, l as usize),
        };
        if total < header || pos + total > data.len() {
            return truncated();
        }
        let payload = &data[pos + header..pos + total];
        pos += total;
        Some(Ok((kind, payload)))
    })
}

fn walk_boxes(data: &[u8], info: &mut Jp2Info) -> Result<()> {
    for entry in boxes(data) {
        let (kind, payload) = entry?;
        match &kind {
            b"jp2h" => walk_boxes(payload, info)?,
            b"ihdr" if payload.len() >= 14 => {
                info.height = be_u32(payload, 0).unwrap_or(0);
                info.width = be_u32(payload, 4).unwrap_or(0);
                info.components = be_u16(payload, 8).unwrap_or(0);
                info.bits = (payload[10] & 0x7F) + 1;
            }
            b"colr" if payload.len() >= 3 => match payload[0] {
                1 => info.color_space = be_u32(payload, 3),
                2 | 3 => info.icc = Some(payload[3..].to_vec()),
                _ => {}
            },
            b"uuid" if payload.len() >= 16 => {
                let (id, body) = payload.split_at(16);
                if id == XMP_UUID {
                    info.xmp = Some(body.to_vec());
                } else if id == EXIF_UUID {
                    info.exif = Some(body.to_vec());
                }
            }
            b"jp2c" if info.width == 0 => {
                let stream = parse_codestream(payload)?;
                info.width = stream.width;
                info.height = stream.height;
                info.components = stream.components;
                info.bits = stream.bits;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Geometry from the SIZ marker that follows SOC.
fn parse_codestream(data: &[u8]) -> Result<Jp2Info> {
    let malformed = || DImgError::decode("JP2", "malformed SIZ marker");
    if !data.starts_with(&SOC) || data.get(2..4) != Some(&SIZ[..]) {
        return Err(malformed());
    }
    let siz = &data[4..];
    let field = |at| be_u32(siz, at).ok_or_else(malformed);
    let (x, y, x_off, y_off) = (field(4)?, field(8)?, field(12)?, field(16)?);
    let components = be_u16(siz, 36).ok_or_else(malformed)?;
    let bits = siz.get(38).map(|s| (s & 0x7F) + 1).ok_or_else(malformed)?;
    Ok(Jp2Info {
        width: x.saturating_sub(x_off),
        height: y.saturating_sub(y_off),
        components,
        bits,
        ..Jp2Info::default()
    })
}

fn uuid_box(id: &[u8; 16], body: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(8 + 16 + body.len())
        .map_err(|_| DImgError::encode("JP2", "metadata box too large"))?;
    let mut out = Vec::with_capacity(len as usize);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(b"uuid");
    out.extend_from_slice(id);
    out.extend_from_slice(body);
    Ok(out)
}

#[derive(Debug, Default)]
pub struct Jp2kLoader {
    state: LoaderState,
}

impl DImgLoader for Jp2kLoader {
    fn format_name(&self) -> &'static str {
        "JP2"
    }

    fn state(&self) -> LoaderState {
        self.state
    }

    fn load(&mut self, path: &Path, ctx: &LoadContext<'_>) -> Result<LoadedImage> {
        let data = std::fs::read(path)?;
        let info = Jp2Info::parse(&data)?;
        tracing::debug!(
            "JP2 {}x{}, {} components of {} bits",
            info.width,
            info.height,
            info.components,
            info.bits
        );

        let mut image = LoadedImage::new(info.width, info.height, info.bits > 8, info.has_alpha());
        ctx.report(0.1);

        if ctx.wants(LoadFlags::ICC_DATA) {
            image.icc = match (&info.icc, info.color_space) {
                (Some(icc), _) => IccProfile::Embedded(icc.clone()),
                (None, Some(CS_SRGB)) => IccProfile::Srgb,
                _ => IccProfile::None,
            };
        }
        if ctx.wants(LoadFlags::METADATA) {
            if let Some(exif) = &info.exif {
                image.metadata.set_exif(exif);
            }
            if let Some(xmp) = &info.xmp {
                if let Err(e) = image.metadata.load_xmp_packet(xmp) {
                    tracing::warn!("ignoring unreadable XMP packet: {e}");
                }
            }
            image.read_history(ctx);
        }
        if ctx.wants(LoadFlags::ICC_DATA) {
            image.infer_icc_from_exif();
        }

        if ctx.wants_pixels() {
            let codec = jpeg2000_codec()
                .ok_or_else(|| DImgError::Unsupported("no JPEG 2000 codec registered".into()))?;
            ctx.check_cancel()?;
            let pixels = codec.decode(&data, ctx.observer)?;
            pixels.install(&mut image, ctx)?;
            ctx.report(0.9);
        }

        image.set_origin("JP2", info.color_model(), u32::from(info.bits));
        ctx.report(1.0);
        self.state = LoaderState {
            alpha: image.alpha,
            sixteen_bit: image.sixteen_bit,
        };
        Ok(image)
    }

    fn save(&mut self, path: &Path, image: &DImg, ctx: &SaveContext<'_>) -> Result<()> {
        let codec = jpeg2000_codec()
            .ok_or_else(|| DImgError::Unsupported("no JPEG 2000 codec registered".into()))?;
        let quality = ctx.quality.unwrap_or(ctx.settings.jp2k_quality).clamp(1, 100);
        tracing::debug!("JP2 quality {quality}{}", if quality == 100 { " (lossless)" } else { "" });

        ctx.check_cancel()?;
        let mut encoded = codec.encode(&CodecPixels::from_image(image), quality)?;
        ctx.report(0.8);

        // Metadata boxes may follow the codestream in a JP2 container.
        if encoded.starts_with(&JP2_SIGNATURE) {
            let xmp = image.metadata().xmp();
            if !xmp.is_empty() {
                encoded.extend(uuid_box(&XMP_UUID, xmp.to_packet()?.as_bytes())?);
            }
            let exif = image.metadata().exif();
            if !exif.is_empty() {
                encoded.extend(uuid_box(&EXIF_UUID, exif)?);
            }
        }

        write_atomically(path, |target| Ok(std::fs::write(target, &encoded)?))?;
        ctx.report(1.0);
        self.state = LoaderState {
            alpha: image.has_alpha(),
            sixteen_bit: image.sixteen_bit(),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jp2_box(kind: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
        out.extend_from_slice(kind);
        out.extend_from_slice(payload);
        out
    }

    fn sample_file() -> Vec<u8> {
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&480u32.to_be_bytes());
        ihdr.extend_from_slice(&640u32.to_be_bytes());
        ihdr.extend_from_slice(&3u16.to_be_bytes());
        ihdr.extend_from_slice(&[15, 7, 0, 0]);
        let colr = [2u8, 0, 0, 0xAA, 0xBB];
        let jp2h = [jp2_box(b"ihdr", &ihdr), jp2_box(b"colr", &colr)].concat();

        let mut data = JP2_SIGNATURE.to_vec();
        data.extend(jp2_box(b"ftyp", b"jp2 \0\0\0\0jp2 "));
        data.extend(jp2_box(b"jp2h", &jp2h));
        data.extend(uuid_box(&XMP_UUID, b"<x:xmpmeta/>").unwrap());
        data
    }

    #[test]
    fn test_box_header_parse() {
        let info = Jp2Info::parse(&sample_file()).unwrap();
        assert_eq!((info.width, info.height), (640, 480));
        assert_eq!(info.components, 3);
        assert_eq!(info.bits, 16);
        assert_eq!(info.icc.as_deref(), Some(&[0xAA, 0xBB][..]));
        assert_eq!(info.xmp.as_deref(), Some(&b"<x:xmpmeta/>"[..]));
        assert_eq!(info.color_model(), ColorModel::Rgb);
    }

    #[test]
    fn test_codestream_siz_parse() {
        let mut data = vec![0xFF, 0x4F, 0xFF, 0x51, 0, 41, 0, 0];
        for v in [100u32, 50, 10, 0, 100, 50, 0, 0] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&[7, 1, 1]);
        let info = Jp2Info::parse(&data).unwrap();
        assert_eq!((info.width, info.height), (90, 50));
        assert_eq!(info.components, 1);
        assert_eq!(info.bits, 8);
        assert_eq!(info.color_model(), ColorModel::Grayscale);
    }

    #[test]
    fn test_truncated_box_is_an_error() {
        let mut data = sample_file();
        data.extend_from_slice(&[0, 0, 0x10, 0, b'j', b'p', b'2', b'c']);
        assert!(Jp2Info::parse(&data).is_err());
    }

    #[test]
    fn test_info_load_without_codec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jp2");
        std::fs::write(&path, sample_file()).unwrap();

        let mut loader = Jp2kLoader::default();
        let info = loader
            .load(&path, &LoadContext::new(LoadFlags::INFO_ONLY, None))
            .unwrap();
        assert_eq!((info.width, info.height), (640, 480));
        assert!(info.data.is_empty());
        assert_eq!(info.icc, IccProfile::Embedded(vec![0xAA, 0xBB]));
    }
}
