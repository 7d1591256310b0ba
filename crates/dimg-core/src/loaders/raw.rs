//! Camera RAW through the registered [`RawDecoder`](crate::raw::RawDecoder).
//!
//! Read-only. The decoder demosaics into interleaved RGB, which is
//! converted to the canonical layout here; post-processing runs in the
//! dispatcher once the result is installed into a `DImg`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use super::{DImgLoader, LoadContext, LoadFlags, LoadedImage, LoaderState, SaveContext, put_bgra};
use crate::error::{DImgError, Result};
use crate::image::attributes::keys;
use crate::image::{ColorModel, DImg, IccProfile};
use crate::raw::{RawImage, raw_decoder};

#[derive(Debug, Default)]
pub struct RawLoader {
    state: LoaderState,
}

/// Canonical buffer from the decoder's RGB output.
fn rgb_to_bgra(raw: &RawImage, image: &mut LoadedImage, ctx: &LoadContext<'_>) -> Result<()> {
    let src_bpp = if raw.sixteen_bit { 6 } else { 3 };
    let expected = raw.width as usize * raw.height as usize * src_bpp;
    if raw.rgb.len() < expected {
        return Err(DImgError::RawDecoder(format!(
            "decoder returned {} bytes, expected {expected}",
            raw.rgb.len()
        )));
    }

    image.width = raw.width;
    image.height = raw.height;
    image.sixteen_bit = raw.sixteen_bit;
    image.alpha = false;
    image.allocate()?;

    let dst_bpp = image.bytes_depth();
    let row_src = raw.width as usize * src_bpp;
    let row_dst = raw.width as usize * dst_bpp;
    let rows = ctx.rows(raw.height, 0.8);
    for (y, (src, dst)) in raw
        .rgb
        .chunks_exact(row_src.max(1))
        .zip(image.data.chunks_exact_mut(row_dst.max(1)))
        .enumerate()
    {
        rows.checkpoint(y as u32)?;
        for (s, d) in src.chunks_exact(src_bpp).zip(dst.chunks_exact_mut(dst_bpp)) {
            if raw.sixteen_bit {
                let v = |i: usize| u16::from_ne_bytes([s[i * 2], s[i * 2 + 1]]);
                put_bgra(d, true, v(0), v(1), v(2), u16::MAX);
            } else {
                put_bgra(d, false, s[0].into(), s[1].into(), s[2].into(), 255);
            }
        }
    }
    Ok(())
}

impl DImgLoader for RawLoader {
    fn format_name(&self) -> &'static str {
        "RAW"
    }

    fn state(&self) -> LoaderState {
        self.state
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn load(&mut self, path: &Path, ctx: &LoadContext<'_>) -> Result<LoadedImage> {
        let decoder =
            raw_decoder().ok_or_else(|| DImgError::Unsupported("no RAW decoder registered".into()))?;
        let info = decoder
            .identify(path)
            .ok_or_else(|| DImgError::RawDecoder(format!("{} is not a RAW file", path.display())))?;
        tracing::debug!("RAW {} {} {}x{}", info.make, info.model, info.width, info.height);

        let settings = &ctx.raw_settings;
        let mut image =
            LoadedImage::new(info.width, info.height, settings.decoder.sixteen_bits_image, false);
        ctx.report(0.1);

        if ctx.wants(LoadFlags::METADATA) {
            // Most RAW containers are TIFF-structured and carry plain Exif.
            let exif = File::open(path)
                .map_err(exif::Error::from)
                .and_then(|f| exif::Reader::new().read_from_container(&mut BufReader::new(f)));
            match exif {
                Ok(exif) => image.metadata.set_exif(exif.buf()),
                Err(e) => tracing::debug!("no Exif in RAW container: {e}"),
            }
        }

        if ctx.wants_pixels() {
            ctx.check_cancel()?;
            let raw = decoder.decode(path, &settings.decoder, ctx.observer)?;
            ctx.check_cancel()?;
            rgb_to_bgra(&raw, &mut image, ctx)?;
            if ctx.wants(LoadFlags::ICC_DATA) {
                if let Some(icc) = raw.icc_profile {
                    image.icc = IccProfile::Embedded(icc);
                }
            }
            ctx.report(0.9);
        }
        if ctx.wants(LoadFlags::ICC_DATA) {
            image.infer_icc_from_exif();
        }

        image.set_attribute(keys::RAW_DECODING_SETTINGS, settings.clone());
        image.set_attribute(keys::RAW_DECODING_FILTER_ACTION, settings.to_filter_action());
        image.set_origin("RAW", ColorModel::Raw, 16);
        ctx.report(1.0);
        self.state = LoaderState {
            alpha: false,
            sixteen_bit: image.sixteen_bit,
        };
        Ok(image)
    }

    fn save(&mut self, path: &Path, _image: &DImg, _ctx: &SaveContext<'_>) -> Result<()> {
        Err(DImgError::Unsupported(format!(
            "cannot write RAW file {}",
            path.display()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::CancellationToken;

    #[test]
    fn test_rgb_conversion_both_depths() {
        let ctx = LoadContext::new(LoadFlags::ALL, None);
        let raw = RawImage {
            width: 2,
            height: 1,
            sixteen_bit: false,
            rgb: vec![10, 20, 30, 40, 50, 60],
            icc_profile: None,
        };
        let mut image = LoadedImage::default();
        rgb_to_bgra(&raw, &mut image, &ctx).unwrap();
        assert_eq!(image.data, vec![30, 20, 10, 255, 60, 50, 40, 255]);

        let rgb: Vec<u8> = [1000u16, 2000, 3000].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let raw = RawImage {
            width: 1,
            height: 1,
            sixteen_bit: true,
            rgb,
            icc_profile: None,
        };
        rgb_to_bgra(&raw, &mut image, &ctx).unwrap();
        assert!(image.sixteen_bit);
        assert_eq!(super::super::get_rgba(&image.data, true), [1000, 2000, 3000, 65535]);
    }

    #[test]
    fn test_short_decoder_output_is_rejected() {
        let raw = RawImage {
            width: 4,
            height: 4,
            sixteen_bit: false,
            rgb: vec![0; 10],
            icc_profile: None,
        };
        let err = rgb_to_bgra(&raw, &mut LoadedImage::default(), &LoadContext::new(LoadFlags::ALL, None))
            .unwrap_err();
        assert!(matches!(err, DImgError::RawDecoder(_)));
    }

    #[test]
    fn test_conversion_honours_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = LoadContext::new(LoadFlags::ALL, Some(&token));
        let raw = RawImage {
            width: 1,
            height: 1,
            sixteen_bit: false,
            rgb: vec![0; 3],
            icc_profile: None,
        };
        let err = rgb_to_bgra(&raw, &mut LoadedImage::default(), &ctx).unwrap_err();
        assert!(matches!(err, DImgError::Cancelled));
    }

    #[test]
    fn test_raw_is_read_only() {
        let loader = RawLoader::default();
        assert!(loader.is_read_only());
        let dir = tempfile::tempdir().unwrap();
        let image = DImg::from_data(1, 1, false, false, None);
        let ctx = SaveContext::for_image(&image, None);
        assert!(
            RawLoader::default()
                .save(&dir.path().join("x.nef"), &image, &ctx)
                .is_err()
        );
    }
}
