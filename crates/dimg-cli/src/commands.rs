//! Subcommand implementations. Each returns a [`CliError`] describing the
//! first failure; `main` turns it into a non-zero exit status.

use std::path::{Path, PathBuf};

use dimg_core::image::attributes::keys;
use dimg_core::{
    Angle, DImg, DImgError, FilterAction, Flip, HistoryImageIdType, LoadFlags, RawDecodingSettings,
};
use serde_json::json;

use crate::args::{Command, CropArg, FlipArg, RotateArg, SizeArg};

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("cannot load {}: {source}", path.display())]
    Load { path: PathBuf, source: DImgError },
    #[error("cannot save {}: {source}", path.display())]
    Save { path: PathBuf, source: DImgError },
    #[error("cannot fingerprint {}", .0.display())]
    Hash(PathBuf),
    #[error("{} has no image history", .0.display())]
    NoHistory(PathBuf),
    #[error("cannot serialize history: {0}")]
    History(DImgError),
    #[error("no output format given and {} has no extension", .0.display())]
    NoFormat(PathBuf),
    #[error("crop {0:?} lies outside the image")]
    Crop(CropArg),
    #[error("cannot encode JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;

pub fn run(command: Command) -> Result<()> {
    match command {
        Command::Info { path, json } => info(&path, json),
        Command::Convert {
            input,
            output,
            format,
            quality,
            compress,
        } => convert(&input, &output, format.as_deref(), quality, compress),
        Command::Hash { path, legacy } => hash(&path, legacy),
        Command::Transform {
            input,
            output,
            crop,
            rotate,
            flip,
            scale,
            format,
        } => {
            let steps = Steps {
                crop,
                rotate,
                flip,
                scale,
            };
            transform(&input, &output, format.as_deref(), &steps)
        }
        Command::History { path } => history(&path),
    }
}

fn load(path: &Path, flags: LoadFlags) -> Result<DImg> {
    let mut image = DImg::new();
    image
        .try_load(path, flags, None, RawDecodingSettings::default())
        .map_err(|source| CliError::Load {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(image)
}

/// Format name from an explicit flag or the output extension.
fn output_format(output: &Path, format: Option<&str>) -> Result<String> {
    format
        .map(str::to_string)
        .or_else(|| {
            output
                .extension()
                .map(|e| e.to_string_lossy().to_ascii_uppercase())
        })
        .filter(|f| !f.is_empty())
        .ok_or_else(|| CliError::NoFormat(output.to_path_buf()))
}

fn save(image: &mut DImg, output: &Path, format: &str) -> Result<()> {
    image
        .try_save(output, format, None)
        .map_err(|source| CliError::Save {
            path: output.to_path_buf(),
            source,
        })?;
    image.image_saved_as(output);
    tracing::info!("wrote {} ({})", output.display(), image.saved_format());
    Ok(())
}

fn info(path: &Path, as_json: bool) -> Result<()> {
    let image = load(path, LoadFlags::INFO_ONLY | LoadFlags::UNIQUE_HASH_V2)?;
    let (width, height) = image.original_size();
    let summary = json!({
        "path": path.display().to_string(),
        "format": image.format(),
        "detectedFormat": image.detected_format().to_string(),
        "width": width,
        "height": height,
        "bitDepth": image.original_bit_depth(),
        "alpha": image.has_alpha(),
        "colorModel": image.original_color_model().to_string(),
        "readOnly": image.is_read_only(),
        "iccProfile": !image.icc_profile().is_null(),
        "orientation": image.exif_orientation(),
        "historySteps": image.image_history().len(),
        "uniqueHashV2": image.unique_hash_v2(),
    });

    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }
    println!("{}", path.display());
    println!("  format:      {}", image.format());
    println!("  size:        {width}x{height}");
    println!("  depth:       {} bits", image.original_bit_depth());
    println!("  alpha:       {}", image.has_alpha());
    println!("  color model: {}", image.original_color_model());
    println!("  read-only:   {}", image.is_read_only());
    println!("  history:     {} steps", image.image_history().len());
    println!("  hash (v2):   {}", image.unique_hash_v2());
    Ok(())
}

fn convert(
    input: &Path,
    output: &Path,
    format: Option<&str>,
    quality: Option<u8>,
    compress: bool,
) -> Result<()> {
    let format = output_format(output, format)?;
    let mut image = load(input, LoadFlags::ALL)?;
    if let Some(q) = quality {
        image.set_attribute(keys::QUALITY, u32::from(q));
    }
    if compress {
        image.set_attribute(keys::COMPRESS, true);
    }
    image.prepare_metadata_to_save(output, &format, false);
    save(&mut image, output, &format)
}

fn hash(path: &Path, legacy: bool) -> Result<()> {
    let hash = if legacy {
        DImg::unique_hash_for_path(path)
    } else {
        DImg::unique_hash_v2_for_path(path)
    };
    if hash.is_empty() {
        return Err(CliError::Hash(path.to_path_buf()));
    }
    println!("{hash}  {}", path.display());
    Ok(())
}

/// Geometry steps of `transform`, applied crop, rotate, flip, scale.
#[derive(Debug, Default)]
pub struct Steps {
    pub crop: Option<CropArg>,
    pub rotate: Option<RotateArg>,
    pub flip: Option<FlipArg>,
    pub scale: Option<SizeArg>,
}

fn apply_steps(image: &mut DImg, steps: &Steps) -> Result<()> {
    if let Some(c) = steps.crop {
        image.crop(c.x, c.y, c.w, c.h);
        if image.is_null() {
            return Err(CliError::Crop(c));
        }
        let mut action = FilterAction::new("transform:crop", 1);
        action.add_parameter("x", c.x);
        action.add_parameter("y", c.y);
        action.add_parameter("width", c.w);
        action.add_parameter("height", c.h);
        image.add_filter_action(action);
    }
    if let Some(r) = steps.rotate {
        let (angle, degrees) = match r {
            RotateArg::Rot90 => (Angle::Rot90, 90),
            RotateArg::Rot180 => (Angle::Rot180, 180),
            RotateArg::Rot270 => (Angle::Rot270, 270),
        };
        image.rotate(angle);
        let mut action = FilterAction::new("transform:rotate", 1);
        action.add_parameter("angle", degrees);
        image.add_filter_action(action);
    }
    if let Some(f) = steps.flip {
        let (direction, name) = match f {
            FlipArg::Horizontal => (Flip::Horizontal, "horizontal"),
            FlipArg::Vertical => (Flip::Vertical, "vertical"),
        };
        image.flip(direction);
        let mut action = FilterAction::new("transform:flip", 1);
        action.add_parameter("direction", name);
        image.add_filter_action(action);
    }
    if let Some(s) = steps.scale {
        image.resize(s.width, s.height);
        let mut action = FilterAction::new("transform:resize", 1);
        action.add_parameter("width", s.width);
        action.add_parameter("height", s.height);
        image.add_filter_action(action);
    }
    Ok(())
}

fn transform(input: &Path, output: &Path, format: Option<&str>, steps: &Steps) -> Result<()> {
    let format = output_format(output, format)?;
    let mut image = load(input, LoadFlags::ALL)?;

    let kind = if image.image_history().has_original_referred_image() {
        HistoryImageIdType::Intermediate
    } else {
        HistoryImageIdType::Original
    };
    image.add_as_referred_image_path(input, kind);
    // Pixels are upright from here on.
    image.apply_exif_orientation();
    apply_steps(&mut image, steps)?;

    image.prepare_metadata_to_save(output, &format, true);
    save(&mut image, output, &format)
}

fn history(path: &Path) -> Result<()> {
    let image = load(path, LoadFlags::IMAGE_INFO | LoadFlags::METADATA | LoadFlags::IMAGE_HISTORY)?;
    if !image.has_image_history() {
        return Err(CliError::NoHistory(path.to_path_buf()));
    }
    let xml = image.image_history().to_xml().map_err(CliError::History)?;
    println!("{xml}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dimg_core::DColor;

    fn sample(dir: &Path) -> PathBuf {
        let path = dir.join("sample.png");
        let mut image = DImg::from_data(6, 4, false, false, None);
        image.fill(DColor::rgb(30, 60, 90));
        image.set_pixel_color(0, 0, DColor::rgb(255, 0, 0));
        assert!(image.save(&path, "PNG", None));
        path
    }

    #[test]
    fn test_output_format_from_extension_or_flag() {
        assert_eq!(output_format(Path::new("a/b.tif"), None).unwrap(), "TIF");
        assert_eq!(output_format(Path::new("b.tif"), Some("PNG")).unwrap(), "PNG");
        assert!(matches!(
            output_format(Path::new("noext"), None),
            Err(CliError::NoFormat(_))
        ));
    }

    #[test]
    fn test_convert_png_to_tiff() {
        let dir = tempfile::tempdir().unwrap();
        let input = sample(dir.path());
        let output = dir.path().join("out.tif");
        convert(&input, &output, None, None, true).unwrap();

        let loaded = DImg::from_path(&output);
        assert_eq!(loaded.format(), "TIFF");
        assert_eq!(loaded.get_pixel_color(0, 0), DColor::rgb(255, 0, 0));
    }

    #[test]
    fn test_transform_records_steps_and_source() {
        let dir = tempfile::tempdir().unwrap();
        let input = sample(dir.path());
        let output = dir.path().join("turned.png");
        let steps = Steps {
            crop: Some(CropArg { x: 0, y: 0, w: 4, h: 4 }),
            rotate: Some(RotateArg::Rot90),
            flip: Some(FlipArg::Vertical),
            scale: Some(SizeArg { width: 2, height: 2 }),
        };
        transform(&input, &output, None, &steps).unwrap();

        let loaded = DImg::from_path(&output);
        assert_eq!(loaded.size(), (2, 2));
        let steps_done = loaded.image_history();
        let ids: Vec<_> = steps_done.actions().map(|a| a.identifier.as_str()).collect();
        assert_eq!(
            ids,
            ["transform:crop", "transform:rotate", "transform:flip", "transform:resize"]
        );
        let original = steps_done.original_referred_image().unwrap();
        assert_eq!(original.file_name, "sample.png");
        history(&output).unwrap();
    }

    #[test]
    fn test_failures_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.png");
        assert!(matches!(info(&missing, false), Err(CliError::Load { .. })));
        assert!(matches!(hash(&missing, false), Err(CliError::Hash(_))));

        let input = sample(dir.path());
        assert!(matches!(history(&input), Err(CliError::NoHistory(_))));
        let steps = Steps {
            crop: Some(CropArg { x: 50, y: 50, w: 4, h: 4 }),
            ..Steps::default()
        };
        let out = dir.path().join("never.png");
        assert!(matches!(
            transform(&input, &out, None, &steps),
            Err(CliError::Crop(_))
        ));
        assert!(!out.exists());
    }
}
