use std::path::{Path, PathBuf};

use dimg_core::image::attributes::keys;
use dimg_core::{CancellationToken, DColor, DImg, FileFormat, LoadFlags, RawDecodingSettings};

/// 16-bit gradient with an alpha ramp.
fn gradient(width: u32, height: u32, sixteen_bit: bool, alpha: bool) -> DImg {
    let mut image = DImg::from_data(width, height, sixteen_bit, alpha, None);
    let max = if sixteen_bit { 65535 } else { 255 };
    for y in 0..height {
        for x in 0..width {
            let r = max * x as i32 / (width as i32 - 1).max(1);
            let g = max * y as i32 / (height as i32 - 1).max(1);
            let a = if alpha { max - r / 2 } else { max };
            image.set_pixel_color(x, y, DColor::new(r, g, max - r, a, sixteen_bit));
        }
    }
    image
}

fn saved(dir: &Path, name: &str, image: &mut DImg, format: &str) -> PathBuf {
    let path = dir.join(name);
    assert!(image.save(&path, format, None), "saving {name} as {format}");
    path
}

#[test]
fn test_sixteen_bit_png_and_tiff_roundtrip_exactly() {
    let dir = tempfile::tempdir().unwrap();
    for (name, format) in [("deep.png", "PNG"), ("deep.tif", "TIFF")] {
        let mut image = gradient(17, 9, true, true);
        let path = saved(dir.path(), name, &mut image, format);

        let loaded = DImg::from_path(&path);
        assert!(loaded.sixteen_bit(), "{name}");
        assert!(loaded.has_alpha(), "{name}");
        assert_eq!(loaded.original_bit_depth(), 16, "{name}");
        assert_eq!(loaded.bits(), image.bits(), "{name}");
    }
}

#[test]
fn test_png_embedded_text_survives_except_software() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = gradient(4, 4, false, false);
    image.set_embedded_text("Title", "sunset");
    image.set_embedded_text("Author", "nobody");
    image.set_embedded_text("Software", "another editor");
    let path = saved(dir.path(), "text.png", &mut image, "PNG");

    let loaded = DImg::from_path(&path);
    assert_eq!(loaded.embedded_text("Title"), Some("sunset"));
    assert_eq!(loaded.embedded_text("Author"), Some("nobody"));
    let software = loaded.embedded_text("Software").unwrap_or_default();
    assert!(software.starts_with("dimg "), "{software}");
}

#[test]
fn test_sixteen_bit_ppm_detected_without_extension() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = gradient(5, 4, true, false);
    let ppm = saved(dir.path(), "deep.ppm", &mut image, "PPM");
    let bare = dir.path().join("no_extension");
    std::fs::copy(&ppm, &bare).unwrap();

    let loaded = DImg::from_path(&bare);
    assert_eq!(loaded.detected_format(), FileFormat::Ppm);
    assert_eq!(loaded.format(), "PPM");
    assert_eq!(loaded.bits(), image.bits());
}

#[test]
fn test_extension_decides_before_magic() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = gradient(8, 8, false, false);
    let jpeg = saved(dir.path(), "photo.jpg", &mut image, "JPG");

    let misnamed = dir.path().join("photo.tif");
    std::fs::copy(&jpeg, &misnamed).unwrap();
    let loaded = DImg::from_path(&misnamed);
    assert_eq!(loaded.detected_format(), FileFormat::Tiff);
    // The TIFF decoder rejects it; the generic decoder reads it anyway.
    assert!(!loaded.is_null());

    let bare = dir.path().join("photo");
    std::fs::copy(&jpeg, &bare).unwrap();
    let loaded = DImg::from_path(&bare);
    assert_eq!(loaded.detected_format(), FileFormat::Jpeg);
    assert_eq!(loaded.format(), "JPG");
}

#[test]
fn test_progress_is_reported_up_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = gradient(64, 64, false, false);
    let path = saved(dir.path(), "progress.png", &mut image, "PNG");

    let token = CancellationToken::new();
    let mut loaded = DImg::new();
    assert!(loaded.load(&path, LoadFlags::ALL, Some(&token), RawDecodingSettings::default()));
    let reported = token.reported();
    assert!(!reported.is_empty());
    assert!(reported.windows(2).all(|w| w[0] <= w[1]), "{reported:?}");
    assert_eq!(reported.last().copied(), Some(1.0));
}

#[test]
fn test_cancelled_load_returns_false_and_null() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = gradient(32, 32, true, false);
    let path = saved(dir.path(), "cancel.tif", &mut image, "TIF");

    let token = CancellationToken::new();
    token.cancel();
    let mut loaded = DImg::new();
    assert!(!loaded.load(&path, LoadFlags::ALL, Some(&token), RawDecodingSettings::default()));
    assert!(loaded.is_null());
}

#[test]
fn test_metadata_probe_skips_pixels_and_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = gradient(12, 7, false, true);
    let path = saved(dir.path(), "probe.png", &mut image, "PNG");

    let mut probe = DImg::new();
    assert!(probe.load_image_info(&path, true, true, false, true));
    assert!(probe.is_null());
    assert_eq!(probe.size(), (12, 7));
    assert_eq!(probe.original_size(), (12, 7));
    assert!(!probe.has_attribute(keys::UNIQUE_HASH_V2));
}

#[test]
fn test_failed_save_keeps_existing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keep.xyz");
    std::fs::write(&path, b"original").unwrap();

    let mut image = gradient(3, 3, false, false);
    assert!(!image.save(&path, "XYZ", None));
    assert_eq!(std::fs::read(&path).unwrap(), b"original");
    assert!(image.saved_format().is_empty());
}

#[test]
fn test_save_records_read_only_flag_and_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut image = gradient(3, 3, false, false);
    let path = saved(dir.path(), "flags.tif", &mut image, "tif");
    assert_eq!(image.saved_format(), "TIF");
    assert_eq!(image.last_saved_file_path().as_deref(), Some(path.as_path()));
    assert_eq!(
        image
            .attribute(keys::SAVED_FORMAT_IS_READ_ONLY)
            .and_then(|v| v.as_bool()),
        Some(false)
    );
}
