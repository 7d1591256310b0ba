//! Progressive Graphics File.
//!
//! The pre-header and header are parsed here for info loads; the wavelet
//! codec is external, registered through [`set_pgf_codec`].

use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use super::{
    CodecPixels, DImgLoader, LoadContext, LoadedImage, LoaderState, SaveContext,
    write_atomically,
};
use crate::error::{DImgError, Result};
use crate::image::{ColorModel, DImg};
use crate::observer::DImgLoaderObserver;

const MAGIC: &[u8; 3] = b"PGF";
/// Version flag announcing a 32-bit header size.
const VERSION6: u8 = 0x20;
const HEADER_SIZE: usize = 16;

/// Image modes, numbered like Photoshop's.
pub mod mode {
    pub const BITMAP: u8 = 0;
    pub const GRAYSCALE: u8 = 1;
    pub const INDEXED: u8 = 2;
    pub const RGB: u8 = 3;
    pub const CMYK: u8 = 4;
    pub const LAB: u8 = 9;
    pub const GRAY16: u8 = 10;
    pub const RGB48: u8 = 11;
    pub const LAB48: u8 = 12;
    pub const CMYK64: u8 = 13;
    pub const RGBA: u8 = 17;
    pub const GRAY32: u8 = 18;
    pub const RGB12: u8 = 19;
    pub const RGB16: u8 = 20;
}

/// External PGF codec.
pub trait PgfCodec: Send + Sync {
    fn decode(&self, data: &[u8], observer: Option<&dyn DImgLoaderObserver>) -> Result<CodecPixels>;

    /// `quality` 0 is lossless; higher levels trade detail for size.
    fn encode(&self, pixels: &CodecPixels, quality: u8) -> Result<Vec<u8>>;
}

static CODEC: OnceLock<RwLock<Option<Arc<dyn PgfCodec>>>> = OnceLock::new();

fn slot() -> &'static RwLock<Option<Arc<dyn PgfCodec>>> {
    CODEC.get_or_init(|| RwLock::new(None))
}

pub fn set_pgf_codec(codec: Arc<dyn PgfCodec>) {
    *slot().write() = Some(codec);
}

pub fn clear_pgf_codec() {
    *slot().write() = None;
}

pub fn pgf_codec() -> Option<Arc<dyn PgfCodec>> {
    slot().read().clone()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgfHeader {
    pub version: u8,
    pub width: u32,
    pub height: u32,
    pub levels: u8,
    pub quality: u8,
    pub bpp: u8,
    pub channels: u8,
    pub mode: u8,
}

impl PgfHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let short = || DImgError::decode("PGF", "truncated header");
        if !data.starts_with(MAGIC) {
            return Err(DImgError::decode("PGF", "bad magic"));
        }
        let version = *data.get(3).ok_or_else(short)?;
        let header_at = if version & VERSION6 != 0 { 8 } else { 6 };
        let header = data
            .get(header_at..header_at + HEADER_SIZE)
            .ok_or_else(short)?;
        let le = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
        Ok(Self {
            version,
            width: le(0),
            height: le(4),
            levels: header[8],
            quality: header[9],
            bpp: header[10],
            channels: header[11],
            mode: header[12],
        })
    }

    pub fn sixteen_bit(&self) -> bool {
        matches!(
            self.mode,
            mode::GRAY16 | mode::RGB48 | mode::LAB48 | mode::CMYK64 | mode::GRAY32
        )
    }

    pub fn has_alpha(&self) -> bool {
        self.mode == mode::RGBA
    }

    pub fn color_model(&self) -> ColorModel {
        match self.mode {
            mode::BITMAP => ColorModel::Monochrome,
            mode::GRAYSCALE | mode::GRAY16 | mode::GRAY32 => ColorModel::Grayscale,
            mode::INDEXED => ColorModel::Indexed,
            mode::CMYK | mode::CMYK64 => ColorModel::Cmyk,
            mode::LAB | mode::LAB48 => ColorModel::CieLab,
            mode::RGB | mode::RGB48 | mode::RGBA | mode::RGB12 | mode::RGB16 => ColorModel::Rgb,
            _ => ColorModel::Unknown,
        }
    }

    pub fn bits_per_channel(&self) -> u32 {
        match self.channels {
            0 => 0,
            c => u32::from(self.bpp) / u32::from(c),
        }
    }
}

#[derive(Debug, Default)]
pub struct PgfLoader {
    state: LoaderState,
}

impl DImgLoader for PgfLoader {
    fn format_name(&self) -> &'static str {
        "PGF"
    }

    fn state(&self) -> LoaderState {
        self.state
    }

    fn load(&mut self, path: &Path, ctx: &LoadContext<'_>) -> Result<LoadedImage> {
        let data = std::fs::read(path)?;
        let header = PgfHeader::parse(&data)?;
        tracing::debug!(
            "PGF {}x{}, mode {}, {} levels, quality {}",
            header.width,
            header.height,
            header.mode,
            header.levels,
            header.quality
        );

        let mut image =
            LoadedImage::new(header.width, header.height, header.sixteen_bit(), header.has_alpha());
        ctx.report(0.1);

        if ctx.wants_pixels() {
            let codec =
                pgf_codec().ok_or_else(|| DImgError::Unsupported("no PGF codec registered".into()))?;
            ctx.check_cancel()?;
            let pixels = codec.decode(&data, ctx.observer)?;
            pixels.install(&mut image, ctx)?;
            ctx.report(0.9);
        }

        image.set_origin("PGF", header.color_model(), header.bits_per_channel());
        ctx.report(1.0);
        self.state = LoaderState {
            alpha: image.alpha,
            sixteen_bit: image.sixteen_bit,
        };
        Ok(image)
    }

    fn save(&mut self, path: &Path, image: &DImg, ctx: &SaveContext<'_>) -> Result<()> {
        let codec =
            pgf_codec().ok_or_else(|| DImgError::Unsupported("no PGF codec registered".into()))?;
        let quality = ctx.quality.unwrap_or(ctx.settings.pgf_quality).min(99);
        tracing::debug!("PGF quality {quality}");

        ctx.check_cancel()?;
        let encoded = codec.encode(&CodecPixels::from_image(image), quality)?;
        ctx.report(0.8);
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
    use crate::loaders::LoadFlags;

    fn header_bytes(version: u8, mode_value: u8) -> Vec<u8> {
        let mut data = b"PGF".to_vec();
        data.push(version);
        if version & VERSION6 != 0 {
            data.extend_from_slice(&16u32.to_le_bytes());
        } else {
            data.extend_from_slice(&16u16.to_le_bytes());
        }
        data.extend_from_slice(&320u32.to_le_bytes());
        data.extend_from_slice(&200u32.to_le_bytes());
        data.extend_from_slice(&[4, 0, 48, 3, mode_value, 16, 0, 0]);
        data
    }

    #[test]
    fn test_header_versions() {
        for version in [0x15, 0x36] {
            let header = PgfHeader::parse(&header_bytes(version, mode::RGB48)).unwrap();
            assert_eq!((header.width, header.height), (320, 200));
            assert_eq!(header.levels, 4);
            assert!(header.sixteen_bit());
            assert_eq!(header.bits_per_channel(), 16);
            assert_eq!(header.color_model(), ColorModel::Rgb);
        }
    }

    #[test]
    fn test_header_rejects_truncation() {
        assert!(PgfHeader::parse(b"PGF").is_err());
        assert!(PgfHeader::parse(&header_bytes(0x36, mode::RGB)[..12]).is_err());
        assert!(PgfHeader::parse(b"PNG\x36xxxxxxxxxxxxxxxxxxxxxxxx").is_err());
    }

    #[test]
    fn test_info_load_and_missing_codec() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pgf");
        std::fs::write(&path, header_bytes(0x36, mode::RGBA)).unwrap();

        let info = PgfLoader::default()
            .load(&path, &LoadContext::new(LoadFlags::INFO_ONLY, None))
            .unwrap();
        assert_eq!((info.width, info.height), (320, 200));
        assert!(info.alpha);

        if pgf_codec().is_none() {
            let err = PgfLoader::default()
                .load(&path, &LoadContext::new(LoadFlags::ALL, None))
                .unwrap_err();
            assert!(matches!(err, DImgError::Unsupported(_)));
        }
    }
}
