//! Load and save dispatch.
//!
//! Picks the loader for a path, installs what it returns, and falls back
//! to the generic codec when a dedicated one fails. Both directions hold
//! the process-wide path lock for the duration of the call.

use std::path::Path;

use super::DImg;
use super::attributes::keys;
use crate::error::{DImgError, Result};
use crate::filelock::{FileReadLocker, FileWriteLocker};
use crate::format::{FileFormat, file_format};
use crate::hash;
use crate::loaders::generic::GenericLoader;
use crate::loaders::{DImgLoader, LoadContext, LoadFlags, LoadedImage, SaveContext, loader_for};
use crate::observer::{self, DImgLoaderObserver};
use crate::raw::{RawDecodingSettings, raw_decoder};

impl DImg {
    /// Load the parts of `path` selected by `flags`. False when nothing
    /// could be decoded or the observer cancelled; the image is then null.
    pub fn load(
        &mut self,
        path: impl AsRef<Path>,
        flags: LoadFlags,
        observer: Option<&dyn DImgLoaderObserver>,
        raw_settings: RawDecodingSettings,
    ) -> bool {
        let path = path.as_ref();
        match self.try_load(path, flags, observer, raw_settings) {
            Ok(()) => true,
            Err(DImgError::Cancelled) => {
                tracing::debug!("loading {} cancelled", path.display());
                false
            }
            Err(e) => {
                tracing::warn!("cannot load {}: {e}", path.display());
                false
            }
        }
    }

    /// [`Self::load`] reporting why it failed.
    pub fn try_load(
        &mut self,
        path: &Path,
        flags: LoadFlags,
        observer: Option<&dyn DImgLoaderObserver>,
        raw_settings: RawDecodingSettings,
    ) -> Result<()> {
        *self = DImg::new();
        // Held from the sniff through the hashes so a writer cannot swap the
        // file in between.
        let _lock = FileReadLocker::new(path);
        let format = file_format(path);
        self.set_attribute(keys::DETECTED_FILE_FORMAT, format.code());
        self.set_attribute(keys::ORIGINAL_FILE_PATH, path);
        if format == FileFormat::None {
            return Err(DImgError::UnknownFormat(path.to_path_buf()));
        }

        let mut ctx = LoadContext::new(flags, observer);
        ctx.raw_settings = raw_settings;

        let result = match self.run_loader(path, format, &ctx) {
            Err(DImgError::Cancelled) => Err(DImgError::Cancelled),
            Err(e) if format != FileFormat::QImage => {
                tracing::debug!("{format} loader failed on {}: {e}", path.display());
                if observer::should_continue(observer) {
                    self.run_loader(path, FileFormat::QImage, &ctx)
                } else {
                    Err(DImgError::Cancelled)
                }
            }
            other => other,
        };
        let result = match result {
            Ok(()) => self.finish_load(path, format, &ctx),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            *self = DImg::new();
            self.set_attribute(keys::DETECTED_FILE_FORMAT, format.code());
            self.set_attribute(keys::ORIGINAL_FILE_PATH, path);
            return Err(e);
        }
        Ok(())
    }

    /// Steps after the pixels are installed: RAW post-processing and the
    /// fingerprints.
    fn finish_load(&mut self, path: &Path, format: FileFormat, ctx: &LoadContext<'_>) -> Result<()> {
        if format == FileFormat::Raw && ctx.wants_pixels() && ctx.raw_settings.post_processing_is_dirty() {
            if let Some(decoder) = raw_decoder() {
                decoder.post_process(self, &ctx.raw_settings)?;
            }
        }

        if ctx.flags.contains(LoadFlags::UNIQUE_HASH) {
            let digest = hash::unique_hash(path, self.metadata().exif())?;
            self.set_attribute(keys::UNIQUE_HASH, digest);
        }
        if ctx.flags.contains(LoadFlags::UNIQUE_HASH_V2) {
            let digest = hash::unique_hash_v2(path)?;
            self.set_attribute(keys::UNIQUE_HASH_V2, digest);
        }
        Ok(())
    }

    fn run_loader(&mut self, path: &Path, format: FileFormat, ctx: &LoadContext<'_>) -> Result<()> {
        let mut loader = loader_for(format);
        let loaded = loader.load(path, ctx)?;
        tracing::debug!(
            "{} loaded {} ({}x{}, {} bit, alpha {})",
            loader.format_name(),
            path.display(),
            loaded.width,
            loaded.height,
            if loaded.sixteen_bit { 16 } else { 8 },
            loaded.alpha
        );
        self.install(loaded, loader.is_read_only());
        Ok(())
    }

    fn install(&mut self, loaded: LoadedImage, read_only: bool) {
        let d = self.d_mut();
        d.width = loaded.width;
        d.height = loaded.height;
        d.sixteen_bit = loaded.sixteen_bit;
        d.alpha = loaded.alpha;
        d.data = loaded.data;
        d.attributes.extend(loaded.attributes);
        d.attributes.insert(keys::IS_READ_ONLY.to_string(), read_only.into());
        d.embedded_text = loaded.embedded_text;
        d.icc = loaded.icc;
        d.metadata = loaded.metadata;
        if let Some(history) = loaded.history {
            d.history = history;
        }
    }

    /// Load selected parts without pixel data.
    pub fn load_image_info(
        &mut self,
        path: impl AsRef<Path>,
        metadata: bool,
        icc: bool,
        unique_hash: bool,
        history: bool,
    ) -> bool {
        let mut flags = LoadFlags::IMAGE_INFO;
        flags.set(LoadFlags::METADATA, metadata);
        flags.set(LoadFlags::ICC_DATA, icc);
        flags.set(LoadFlags::UNIQUE_HASH, unique_hash);
        flags.set(LoadFlags::IMAGE_HISTORY, history);
        self.load(path, flags, None, RawDecodingSettings::default())
    }

    /// Load the pixels plus the selected parts.
    #[allow(clippy::too_many_arguments)]
    pub fn load_with(
        &mut self,
        path: impl AsRef<Path>,
        metadata: bool,
        icc: bool,
        unique_hash: bool,
        history: bool,
        observer: Option<&dyn DImgLoaderObserver>,
        raw_settings: RawDecodingSettings,
    ) -> bool {
        let mut flags = LoadFlags::IMAGE_INFO | LoadFlags::IMAGE_DATA;
        flags.set(LoadFlags::METADATA, metadata);
        flags.set(LoadFlags::ICC_DATA, icc);
        flags.set(LoadFlags::UNIQUE_HASH, unique_hash);
        flags.set(LoadFlags::IMAGE_HISTORY, history);
        self.load(path, flags, observer, raw_settings)
    }

    pub fn load_all(&mut self, path: impl AsRef<Path>) -> bool {
        self.load(path, LoadFlags::ALL, None, RawDecodingSettings::default())
    }

    /// Write the image to `path` as `format` ("PNG", "JPG", "TIF", ...).
    /// False for a null image, an empty format, or a failed encode; the
    /// file at `path` is untouched on failure.
    pub fn save(
        &mut self,
        path: impl AsRef<Path>,
        format: &str,
        observer: Option<&dyn DImgLoaderObserver>,
    ) -> bool {
        let path = path.as_ref();
        match self.try_save(path, format, observer) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("cannot save {} as {format}: {e}", path.display());
                false
            }
        }
    }

    /// [`Self::save`] reporting why it failed.
    pub fn try_save(
        &mut self,
        path: &Path,
        format: &str,
        observer: Option<&dyn DImgLoaderObserver>,
    ) -> Result<()> {
        if self.is_null() {
            return Err(DImgError::NullImage);
        }
        if format.is_empty() {
            return Err(DImgError::Unsupported("empty save format".into()));
        }

        self.set_attribute(keys::SAVED_FILE_PATH, path);
        let _lock = FileWriteLocker::new(path);

        let target = FileFormat::from_format_name(format);
        let mut loader: Box<dyn DImgLoader> = match target {
            FileFormat::None | FileFormat::QImage => Box::new(GenericLoader::for_format(format)),
            other => loader_for(other),
        };

        let flattened;
        let source = if target == FileFormat::Jpeg && self.has_transparent_pixels() {
            tracing::debug!("JPEG has no alpha; flattening onto white");
            let mut copy = self.copy();
            copy.remove_alpha_channel();
            flattened = copy;
            &flattened
        } else {
            &*self
        };

        let ctx = SaveContext::for_image(source, observer);
        loader.save(path, source, &ctx)?;

        self.set_attribute(keys::SAVED_FORMAT, format.to_uppercase());
        self.set_attribute(keys::SAVED_FORMAT_IS_READ_ONLY, loader.is_read_only());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::DColor;
    use crate::observer::CancellationToken;

    fn sample(sixteen_bit: bool, alpha: bool) -> DImg {
        let mut image = DImg::from_data(5, 3, sixteen_bit, alpha, None);
        image.fill(DColor::new(200, 100, 50, 255, false));
        image.set_pixel_color(1, 1, DColor::new(1, 2, 3, 255, false).converted_to_depth(sixteen_bit));
        image
    }

    #[test]
    fn test_png_save_and_load_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.png");
        let mut image = sample(false, false);
        assert!(image.save(&path, "PNG", None));
        assert_eq!(image.saved_format(), "PNG");
        assert!(!image.attribute(keys::SAVED_FORMAT_IS_READ_ONLY).and_then(|v| v.as_bool()).unwrap());

        let loaded = DImg::from_path(&path);
        assert!(!loaded.is_null());
        assert_eq!(loaded.bits(), image.bits());
        assert_eq!(loaded.format(), "PNG");
        assert_eq!(loaded.detected_format(), FileFormat::Png);
        assert_eq!(loaded.original_file_path().as_deref(), Some(path.as_path()));
        assert!(!loaded.is_read_only());
        assert!(loaded.has_attribute(keys::UNIQUE_HASH));
        assert!(loaded.has_attribute(keys::UNIQUE_HASH_V2));
    }

    #[test]
    fn test_info_only_load_has_geometry_without_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.png");
        assert!(sample(true, true).save(&path, "PNG", None));

        let mut info = DImg::new();
        assert!(info.load_image_info(&path, true, true, false, true));
        assert!(info.is_null());
        assert_eq!(info.size(), (5, 3));
        assert!(info.sixteen_bit());
        assert!(info.has_alpha());
        assert!(!info.has_attribute(keys::UNIQUE_HASH));
    }

    #[test]
    fn test_cancelled_load_leaves_image_null() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.png");
        assert!(sample(false, false).save(&path, "PNG", None));

        let token = CancellationToken::new();
        token.cancel();
        let mut image = sample(false, false);
        assert!(!image.load(&path, LoadFlags::ALL, Some(&token), RawDecodingSettings::default()));
        assert!(image.is_null());
    }

    #[test]
    #[serial_test::serial]
    fn test_load_sniffs_format_only_after_writer_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged.png");
        assert!(sample(false, false).save(&staged, "PNG", None));
        let bytes = std::fs::read(&staged).unwrap();
        // No extension: the format comes from the magic bytes alone.
        let target = dir.path().join("incoming");

        let writer = FileWriteLocker::new(&target);
        let reader_path = target.clone();
        let reader = std::thread::spawn(move || {
            let mut image = DImg::new();
            let loaded = image.load_all(&reader_path);
            (loaded, image.detected_format())
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        std::fs::write(&target, &bytes).unwrap();
        drop(writer);

        let (loaded, format) = reader.join().unwrap();
        assert!(loaded);
        assert_eq!(format, FileFormat::Png);
    }

    #[test]
    fn test_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut image = DImg::new();
        assert!(!image.load_all(dir.path().join("absent.png")));
        assert!(image.is_null());
    }

    #[test]
    fn test_misnamed_file_falls_back_to_generic_loader() {
        let dir = tempfile::tempdir().unwrap();
        let bmp = dir.path().join("real.bmp");
        assert!(sample(false, false).save(&bmp, "BMP", None));
        let disguised = dir.path().join("disguised.png");
        std::fs::copy(&bmp, &disguised).unwrap();

        let loaded = DImg::from_path(&disguised);
        assert!(!loaded.is_null());
        assert_eq!(loaded.detected_format(), FileFormat::Png);
        assert_eq!(loaded.format(), "BMP");
    }

    #[test]
    fn test_null_image_and_empty_format_do_not_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("n.png");
        assert!(!DImg::new().save(&path, "PNG", None));
        assert!(!sample(false, false).save(&path, "", None));
        assert!(!path.exists());
    }

    #[test]
    fn test_jpeg_save_flattens_transparency() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jpg");
        let mut image = DImg::from_data(8, 8, false, true, None);
        image.fill(DColor::new(0, 0, 0, 0, false));
        assert!(image.save(&path, "JPG", None));
        // The source keeps its alpha.
        assert!(image.has_alpha());

        let loaded = DImg::from_path(&path);
        assert!(!loaded.has_alpha());
        let c = loaded.get_pixel_color(4, 4);
        assert!(c.red > 240 && c.green > 240 && c.blue > 240, "{c:?}");
    }

    #[test]
    fn test_unknown_save_format_uses_generic_encoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.bmp");
        let mut image = sample(false, false);
        assert!(image.save(&path, "bmp", None));
        assert_eq!(image.saved_format(), "BMP");
        assert_eq!(file_format(&path), FileFormat::QImage);
    }
}
