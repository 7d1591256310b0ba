use std::path::Path;

use dimg_core::image::attributes::keys;
use dimg_core::{DColor, DImg, FilterAction, HistoryImageIdType};

fn write_png(path: &Path, shade: u8) -> DImg {
    let mut image = DImg::from_data(8, 6, false, false, None);
    image.fill(DColor::rgb(shade, 255 - shade, 40));
    assert!(image.save(path, "PNG", None));
    image
}

#[test]
fn test_history_survives_save_and_load() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.png");
    let target = dir.path().join("edited.png");
    write_png(&source, 10);

    let mut image = DImg::from_path(&source);
    image.add_as_referred_image_path(&source, HistoryImageIdType::Original);
    let mut action = FilterAction::new("transform:rotate", 1);
    action.add_parameter("angle", 90);
    image.add_filter_action(action);
    image.prepare_metadata_to_save(&target, "PNG", true);
    assert!(image.save(&target, "PNG", None));

    let loaded = DImg::from_path(&target);
    assert!(loaded.has_image_history());
    let history = loaded.image_history();
    let actions: Vec<_> = history.actions().collect();
    assert_eq!(actions.len(), 1);
    assert_eq!(actions[0].identifier, "transform:rotate");
    assert_eq!(actions[0].parameter("angle"), Some("90"));

    let original = history.original_referred_image().expect("original reference");
    assert_eq!(original.file_name, "source.png");
    assert_eq!(original.unique_hash, DImg::unique_hash_v2_for_path(&source));

    assert_eq!(loaded.original_image_history().len(), history.len());
}

#[test]
fn test_cached_hashes_match_path_hashes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hash.png");
    write_png(&path, 99);

    let loaded = DImg::from_path(&path);
    assert!(loaded.has_attribute(keys::UNIQUE_HASH));
    assert_eq!(loaded.unique_hash(), DImg::unique_hash_for_path(&path));
    assert_eq!(loaded.unique_hash_v2(), DImg::unique_hash_v2_for_path(&path));
}

#[test]
fn test_v2_hash_follows_content_not_name() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.png");
    let b = dir.path().join("b.png");
    let c = dir.path().join("c.png");
    write_png(&a, 1);
    std::fs::copy(&a, &b).unwrap();
    write_png(&c, 2);

    let hash_a = DImg::unique_hash_v2_for_path(&a);
    assert!(!hash_a.is_empty());
    assert_eq!(hash_a, DImg::unique_hash_v2_for_path(&b));
    assert_ne!(hash_a, DImg::unique_hash_v2_for_path(&c));
    assert!(DImg::unique_hash_v2_for_path(&dir.path().join("missing.png")).is_empty());
}

#[test]
fn test_unique_id_is_random_prefix_plus_hash() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("id.png");
    write_png(&path, 50);
    let image = DImg::from_path(&path);

    let hash = image.unique_hash_v2();
    let first = image.create_image_unique_id();
    let second = image.create_image_unique_id();
    assert_eq!(first.len(), 32 + hash.len());
    assert!(first[..32].chars().all(|c| c.is_ascii_hexdigit()));
    assert!(first.ends_with(&hash));
    assert_ne!(first, second);
}

#[test]
fn test_switch_origin_to_last_saved() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("in.png");
    let target = dir.path().join("out.tif");
    write_png(&source, 200);

    let mut image = DImg::from_path(&source);
    image.add_filter_action(FilterAction::new("color:invert", 1));
    assert!(image.save(&target, "TIFF", None));
    image.image_saved_as(&target);

    let origin = image.last_saved_file_origin_data();
    assert_eq!(
        origin.get(keys::FORMAT).and_then(|v| v.as_str()),
        Some("TIFF")
    );
    let history = origin
        .get(keys::ORIGINAL_IMAGE_HISTORY)
        .and_then(|v| v.as_history())
        .expect("history in origin data");
    let last = history.entries().last().unwrap();
    assert_eq!(last.referred_images.last().unwrap().kind, HistoryImageIdType::Current);

    image.switch_origin_to_last_saved();
    assert_eq!(image.format(), "TIFF");
    assert_eq!(image.original_file_path().as_deref(), Some(target.as_path()));
    assert!(!image.has_attribute(keys::UNIQUE_HASH_V2));
}
