//! Catch-all codec backed by the `image` crate.
//!
//! Handles whatever the crate can decode (GIF, BMP, WebP, 8-bit PPM, ...)
//! and is the last resort when a dedicated loader fails. Saving picks the
//! encoder from the requested format name, falling back to the path's
//! extension.

use std::path::Path;

use image::{DynamicImage, ImageFormat, ImageReader};

use super::{DImgLoader, LoadContext, LoadedImage, LoaderState, SaveContext, get_rgba, put_bgra};
use crate::error::{DImgError, Result};
use crate::image::{ColorModel, DImg};

#[derive(Debug, Default)]
pub struct GenericLoader {
    state: LoaderState,
    /// Format name requested by the caller of a save.
    format: Option<String>,
}

impl GenericLoader {
    pub fn for_format(format: &str) -> Self {
        Self {
            state: LoaderState::default(),
            format: Some(format.to_string()),
        }
    }

    fn target_format(&self, path: &Path) -> Result<ImageFormat> {
        self.format
            .as_deref()
            .and_then(ImageFormat::from_extension)
            .or_else(|| ImageFormat::from_path(path).ok())
            .ok_or_else(|| {
                DImgError::Unsupported(format!(
                    "no encoder for {}",
                    self.format.as_deref().unwrap_or("unknown format")
                ))
            })
    }
}

fn format_label(format: Option<ImageFormat>) -> String {
    format
        .and_then(|f| f.extensions_str().first().copied())
        .map(str::to_ascii_uppercase)
        .unwrap_or_else(|| "QIMAGE".to_string())
}

impl DImgLoader for GenericLoader {
    fn format_name(&self) -> &'static str {
        "QIMAGE"
    }

    fn state(&self) -> LoaderState {
        self.state
    }

    fn load(&mut self, path: &Path, ctx: &LoadContext<'_>) -> Result<LoadedImage> {
        let reader = ImageReader::open(path)?.with_guessed_format()?;
        let format = reader.format();
        let label = format_label(format);

        if !ctx.wants_pixels() {
            let (width, height) = reader.into_dimensions()?;
            let mut image = LoadedImage::new(width, height, false, false);
            image.set_origin(&label, ColorModel::Rgb, 8);
            ctx.report(1.0);
            self.state = LoaderState::default();
            return Ok(image);
        }

        ctx.check_cancel()?;
        let decoded = reader.decode()?;
        ctx.report(0.5);

        let color = decoded.color();
        let sixteen_bit = color.bytes_per_pixel() / color.channel_count() > 1;
        let alpha = color.has_alpha();
        let model = if color.has_color() {
            ColorModel::Rgb
        } else {
            ColorModel::Grayscale
        };
        tracing::debug!("{label} via generic decoder: {color:?}");

        let mut image = LoadedImage::new(decoded.width(), decoded.height(), sixteen_bit, alpha);
        image.allocate()?;
        let bpp = image.bytes_depth();
        if sixteen_bit {
            let rgba = decoded.into_rgba16();
            for (src, dst) in rgba.pixels().zip(image.data.chunks_exact_mut(bpp)) {
                let [r, g, b, a] = src.0;
                put_bgra(dst, true, r, g, b, if alpha { a } else { u16::MAX });
            }
        } else {
            let rgba = decoded.into_rgba8();
            for (src, dst) in rgba.pixels().zip(image.data.chunks_exact_mut(bpp)) {
                let [r, g, b, a] = src.0.map(u16::from);
                put_bgra(dst, false, r, g, b, if alpha { a } else { 255 });
            }
        }
        ctx.report(0.9);

        image.set_origin(&label, model, if sixteen_bit { 16 } else { 8 });
        ctx.report(1.0);
        self.state = LoaderState { alpha, sixteen_bit };
        Ok(image)
    }

    fn save(&mut self, path: &Path, image: &DImg, ctx: &SaveContext<'_>) -> Result<()> {
        let format = self.target_format(path)?;
        let (width, height) = image.size();
        let sixteen_bit = image.sixteen_bit();
        let alpha = image.has_alpha();

        let mut samples = Vec::with_capacity(image.num_pixels() * 4);
        for px in image.bits().chunks_exact(image.bytes_depth()) {
            samples.extend(get_rgba(px, sixteen_bit));
        }
        let buffer_error = || DImgError::encode("image", "pixel buffer does not match geometry");
        let full = if sixteen_bit {
            image::ImageBuffer::from_raw(width, height, samples)
                .map(DynamicImage::ImageRgba16)
                .ok_or_else(buffer_error)?
        } else {
            let bytes = samples.into_iter().map(|v| v as u8).collect();
            image::ImageBuffer::from_raw(width, height, bytes)
                .map(DynamicImage::ImageRgba8)
                .ok_or_else(buffer_error)?
        };
        ctx.report(0.5);
        ctx.check_cancel()?;

        // Narrow until the encoder accepts the layout.
        let mut candidates = Vec::new();
        match (sixteen_bit, alpha) {
            (true, true) => candidates.push(full.clone()),
            (true, false) => candidates.push(DynamicImage::ImageRgb16(full.to_rgb16())),
            _ => {}
        }
        if alpha {
            candidates.push(DynamicImage::ImageRgba8(full.to_rgba8()));
        }
        candidates.push(DynamicImage::ImageRgb8(full.to_rgb8()));

        let mut last_error = None;
        super::write_atomically(path, |target| {
            for candidate in &candidates {
                match candidate.save_with_format(target, format) {
                    Ok(()) => return Ok(()),
                    Err(e @ image::ImageError::Unsupported(_)) => {
                        tracing::debug!("{format:?} rejected {:?}: {e}", candidate.color());
                        last_error = Some(e);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            Err(last_error
                .take()
                .map(DImgError::from)
                .unwrap_or_else(|| DImgError::Unsupported(format!("{format:?} encoder"))))
        })?;

        ctx.report(1.0);
        self.state = LoaderState { alpha, sixteen_bit };
        Ok(())
    }
}
