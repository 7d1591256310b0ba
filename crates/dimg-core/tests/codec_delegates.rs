use std::path::Path;
use std::sync::Arc;

use serial_test::serial;

use dimg_core::error::Result;
use dimg_core::image::attributes::keys;
use dimg_core::loaders::pgf::{clear_pgf_codec, mode};
use dimg_core::raw::{RawDecoderSettings, RawImage, RawInfo, clear_raw_decoder};
use dimg_core::{
    CodecPixels, DColor, DImg, DImgError, DImgLoaderObserver, FileFormat, PgfCodec, RawDecoder,
    RawDecodingSettings, set_pgf_codec, set_raw_decoder,
};

const FAKE_RAW_MAGIC: &[u8] = b"FAKERAW";

/// Decodes `FAKERAW` files into a 2x2 RGB ramp. Post-processing paints
/// the first pixel magenta.
struct FakeRawDecoder;

impl RawDecoder for FakeRawDecoder {
    fn identify(&self, path: &Path) -> Option<RawInfo> {
        let data = std::fs::read(path).ok()?;
        data.starts_with(FAKE_RAW_MAGIC).then(|| RawInfo {
            width: 2,
            height: 2,
            make: "Fake".into(),
            model: "Ramp".into(),
        })
    }

    fn decode(
        &self,
        _path: &Path,
        settings: &RawDecoderSettings,
        _observer: Option<&dyn DImgLoaderObserver>,
    ) -> Result<RawImage> {
        let levels = [0u16, 80, 160, 240];
        let mut rgb = Vec::new();
        for v in levels {
            for _ in 0..3 {
                if settings.sixteen_bits_image {
                    rgb.extend_from_slice(&(v * 257).to_ne_bytes());
                } else {
                    rgb.push(v as u8);
                }
            }
        }
        Ok(RawImage {
            width: 2,
            height: 2,
            sixteen_bit: settings.sixteen_bits_image,
            rgb,
            icc_profile: None,
        })
    }

    fn post_process(&self, image: &mut DImg, settings: &RawDecodingSettings) -> Result<()> {
        if settings.post_processing_is_dirty() {
            let max = DColor::max_for(image.sixteen_bit());
            image.set_pixel_color(0, 0, DColor::new(max, 0, max, max, image.sixteen_bit()));
        }
        Ok(())
    }
}

/// Decodes like [`FakeRawDecoder`] but rejects every post-processing request.
struct BrokenPostProcessRaw;

impl RawDecoder for BrokenPostProcessRaw {
    fn identify(&self, path: &Path) -> Option<RawInfo> {
        FakeRawDecoder.identify(path)
    }

    fn decode(
        &self,
        path: &Path,
        settings: &RawDecoderSettings,
        observer: Option<&dyn DImgLoaderObserver>,
    ) -> Result<RawImage> {
        FakeRawDecoder.decode(path, settings, observer)
    }

    fn post_process(&self, _image: &mut DImg, _settings: &RawDecodingSettings) -> Result<()> {
        Err(DImgError::decode("RAW", "post-processing unavailable"))
    }
}

/// Stores samples verbatim after a valid PGF pre-header and header.
struct PassThroughPgf;

impl PgfCodec for PassThroughPgf {
    fn decode(&self, data: &[u8], _observer: Option<&dyn DImgLoaderObserver>) -> Result<CodecPixels> {
        let header = data
            .get(8..24)
            .ok_or_else(|| DImgError::decode("PGF", "short test stream"))?;
        let le = |at: usize| u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]]);
        let channels = usize::from(header[11]);
        let bits = u32::from(header[10]) / header[11] as u32;
        let samples = data[24..]
            .chunks_exact(2)
            .map(|s| u16::from_le_bytes([s[0], s[1]]))
            .collect();
        Ok(CodecPixels {
            width: le(0),
            height: le(4),
            channels,
            bits,
            samples,
        })
    }

    fn encode(&self, pixels: &CodecPixels, quality: u8) -> Result<Vec<u8>> {
        let mut out = b"PGF".to_vec();
        out.push(0x36);
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&pixels.width.to_le_bytes());
        out.extend_from_slice(&pixels.height.to_le_bytes());
        let pgf_mode = match (pixels.channels, pixels.bits > 8) {
            (4, _) => mode::RGBA,
            (_, true) => mode::RGB48,
            _ => mode::RGB,
        };
        out.extend_from_slice(&[
            1,
            quality,
            (pixels.bits * pixels.channels as u32) as u8,
            pixels.channels as u8,
            pgf_mode,
            0,
            0,
            0,
        ]);
        for s in &pixels.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        Ok(out)
    }
}

fn fake_raw_file(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("shot.nef");
    let mut data = FAKE_RAW_MAGIC.to_vec();
    data.extend_from_slice(&[0; 64]);
    std::fs::write(&path, data).unwrap();
    path
}

#[test]
#[serial]
fn test_raw_without_decoder_fails_to_load() {
    clear_raw_decoder();
    let dir = tempfile::tempdir().unwrap();
    let path = fake_raw_file(dir.path());
    let image = DImg::from_path(&path);
    assert!(image.is_null());
    assert_eq!(image.detected_format(), FileFormat::Raw);
}

#[test]
#[serial]
fn test_raw_decoder_output_is_installed() {
    set_raw_decoder(Arc::new(FakeRawDecoder));
    let dir = tempfile::tempdir().unwrap();
    let path = fake_raw_file(dir.path());

    let image = DImg::from_path(&path);
    clear_raw_decoder();

    assert_eq!(image.size(), (2, 2));
    assert_eq!(image.format(), "RAW");
    assert!(image.is_read_only());
    assert_eq!(image.get_pixel_color(1, 1), DColor::rgb(240, 240, 240));
    assert_eq!(image.get_pixel_color(0, 0), DColor::rgb(0, 0, 0));
    assert!(image.has_attribute(keys::RAW_DECODING_FILTER_ACTION));
    assert_eq!(image.raw_decoding_settings(), RawDecodingSettings::default());
}

#[test]
#[serial]
fn test_raw_post_processing_runs_for_dirty_settings() {
    set_raw_decoder(Arc::new(FakeRawDecoder));
    let dir = tempfile::tempdir().unwrap();
    let path = fake_raw_file(dir.path());

    let mut settings = RawDecodingSettings::default();
    settings.decoder.sixteen_bits_image = true;
    settings.bcg.brightness = 0.25;
    let mut image = DImg::new();
    let loaded = image.load_with(&path, true, true, false, false, None, settings.clone());
    clear_raw_decoder();

    assert!(loaded);
    assert!(image.sixteen_bit());
    assert_eq!(image.get_pixel_color(0, 0), DColor::new(65535, 0, 65535, 65535, true));
    assert_eq!(image.raw_decoding_settings(), settings);

    // RAW files are never written back.
    let out = dir.path().join("back.nef");
    assert!(!image.save(&out, "NEF", None));
    assert!(!out.exists());
}

#[test]
#[serial]
fn test_failed_raw_post_processing_leaves_null_image() {
    set_raw_decoder(Arc::new(BrokenPostProcessRaw));
    let dir = tempfile::tempdir().unwrap();
    let path = fake_raw_file(dir.path());

    let mut settings = RawDecodingSettings::default();
    settings.bcg.contrast = 1.5;
    let mut image = DImg::new();
    let loaded = image.load_with(&path, true, true, false, false, None, settings.clone());
    let mut again = DImg::new();
    let err = again.try_load(&path, dimg_core::LoadFlags::ALL, None, settings);
    clear_raw_decoder();

    assert!(!loaded);
    assert!(image.is_null());
    assert_eq!(image.size(), (0, 0));
    assert!(!image.has_attribute(keys::FORMAT));
    assert_eq!(image.detected_format(), FileFormat::Raw);
    assert!(matches!(err, Err(DImgError::Decode { .. })));
    assert!(again.is_null());

    // Clean settings skip post-processing and load normally.
    set_raw_decoder(Arc::new(BrokenPostProcessRaw));
    let clean = DImg::from_path(&path);
    clear_raw_decoder();
    assert_eq!(clean.size(), (2, 2));
}

#[test]
#[serial]
fn test_pgf_round_trip_through_registered_codec() {
    set_pgf_codec(Arc::new(PassThroughPgf));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wavelet.pgf");

    let mut image = DImg::from_data(3, 2, true, true, None);
    image.fill(DColor::new(1000, 20000, 40000, 30000, true));
    image.set_pixel_color(2, 1, DColor::new(65535, 0, 0, 65535, true));
    let saved = image.save(&path, "PGF", None);
    let loaded = DImg::from_path(&path);
    clear_pgf_codec();

    assert!(saved);
    assert_eq!(loaded.detected_format(), FileFormat::Pgf);
    assert_eq!(loaded.format(), "PGF");
    assert!(loaded.sixteen_bit());
    assert!(loaded.has_alpha());
    assert_eq!(loaded.bits(), image.bits());
}

#[test]
#[serial]
fn test_pgf_info_load_needs_no_codec() {
    set_pgf_codec(Arc::new(PassThroughPgf));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("info.pgf");
    let mut image = DImg::from_data(5, 4, false, false, None);
    assert!(image.save(&path, "PGF", None));
    clear_pgf_codec();

    let mut probe = DImg::new();
    assert!(probe.load_image_info(&path, false, false, false, false));
    assert_eq!(probe.size(), (5, 4));
    assert!(DImg::from_path(&path).is_null());
}
