//! RAW decoding settings and the pluggable RAW decoder seam.
//!
//! The engine does not demosaic camera files itself. A [`RawDecoder`]
//! registered with [`set_raw_decoder`] identifies and decodes them; without
//! one, RAW files fall through to the generic loader like any unknown file.
//! Settings travel with the image as the `rawDecodingSettings` attribute
//! and are recorded in the image history as [`FilterAction`] parameters.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::history::{FilterAction, FilterCategory};
use crate::image::DImg;
use crate::observer::DImgLoaderObserver;

/// Identifier of the history action recording a RAW conversion.
pub const RAW_FILTER_IDENTIFIER: &str = "digikam:RawConverter";
pub const RAW_FILTER_VERSION: u32 = 1;

/// File extensions treated as camera RAW.
pub const RAW_EXTENSIONS: &[&str] = &[
    "3FR", "ARW", "CR2", "CR3", "CRW", "DCR", "DNG", "ERF", "IIQ", "KDC", "MOS", "MRW", "NEF",
    "NRW", "ORF", "PEF", "RAF", "RW2", "RWL", "SR2", "SRF", "SRW", "X3F",
];

pub fn is_raw_extension(ext: &str) -> bool {
    RAW_EXTENSIONS.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum WhiteBalance {
    None = 0,
    #[default]
    Camera = 1,
    Auto = 2,
    Custom = 3,
    Area = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum DecodingQuality {
    #[default]
    Bilinear = 0,
    Vng = 1,
    Ppg = 2,
    Ahd = 3,
    Dcb = 4,
    Dht = 11,
    Aahd = 12,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum NoiseReduction {
    #[default]
    None = 0,
    Wavelets = 1,
    Fbdd = 2,
    LinearFbdd = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum InputColorSpace {
    #[default]
    None = 0,
    Embedded = 1,
    Custom = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum OutputColorSpace {
    Raw = 0,
    #[default]
    Srgb = 1,
    AdobeRgb = 2,
    WideGamut = 3,
    ProPhoto = 4,
    Custom = 5,
}

macro_rules! int_enum {
    ($ty:ty { $($variant:ident),+ $(,)? }) => {
        impl $ty {
            fn from_i32(v: i32) -> Option<Self> {
                [$(Self::$variant),+].into_iter().find(|x| *x as i32 == v)
            }
        }
    };
}

int_enum!(WhiteBalance { None, Camera, Auto, Custom, Area });
int_enum!(DecodingQuality { Bilinear, Vng, Ppg, Ahd, Dcb, Dht, Aahd });
int_enum!(NoiseReduction { None, Wavelets, Fbdd, LinearFbdd });
int_enum!(InputColorSpace { None, Embedded, Custom });
int_enum!(OutputColorSpace { Raw, Srgb, AdobeRgb, WideGamut, ProPhoto, Custom });

/// Rectangle used for area white balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Area {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Parameters for the demosaicing backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDecoderSettings {
    pub sixteen_bits_image: bool,
    pub half_size_color_image: bool,
    pub fix_colors_highlights: bool,
    pub auto_brightness: bool,
    pub white_balance: WhiteBalance,
    pub custom_white_balance: i32,
    pub custom_white_balance_green: f64,
    pub white_balance_area: Option<Area>,
    pub rgb_interpolate_4_colors: bool,
    pub dont_stretch_pixels: bool,
    pub unclip_colors: i32,
    pub quality: DecodingQuality,
    pub median_filter_passes: i32,
    pub noise_reduction: NoiseReduction,
    pub noise_reduction_threshold: i32,
    pub enable_ca_correction: bool,
    pub ca_multiplier: [f64; 2],
    pub brightness: f64,
    pub black_point: Option<i32>,
    pub white_point: Option<i32>,
    pub input_color_space: InputColorSpace,
    pub input_profile: String,
    pub output_color_space: OutputColorSpace,
    pub output_profile: String,
    pub dead_pixel_map: String,
    pub dcb_iterations: i32,
    pub dcb_enhance_fl: bool,
    pub exposure_correction: bool,
    pub exposure_correction_shift: f64,
    pub exposure_correction_highlight: f64,
}

impl Default for RawDecoderSettings {
    fn default() -> Self {
        Self {
            sixteen_bits_image: false,
            half_size_color_image: false,
            fix_colors_highlights: false,
            auto_brightness: true,
            white_balance: WhiteBalance::Camera,
            custom_white_balance: 6500,
            custom_white_balance_green: 1.0,
            white_balance_area: None,
            rgb_interpolate_4_colors: false,
            dont_stretch_pixels: false,
            unclip_colors: 0,
            quality: DecodingQuality::Bilinear,
            median_filter_passes: 0,
            noise_reduction: NoiseReduction::None,
            noise_reduction_threshold: 0,
            enable_ca_correction: false,
            ca_multiplier: [0.0, 0.0],
            brightness: 1.0,
            black_point: None,
            white_point: None,
            input_color_space: InputColorSpace::None,
            input_profile: String::new(),
            output_color_space: OutputColorSpace::Srgb,
            output_profile: String::new(),
            dead_pixel_map: String::new(),
            dcb_iterations: -1,
            dcb_enhance_fl: false,
            exposure_correction: false,
            exposure_correction_shift: 1.0,
            exposure_correction_highlight: 0.0,
        }
    }
}

impl RawDecoderSettings {
    /// Fastest usable preview: half size, bilinear interpolation.
    pub fn optimize_time_loading(&mut self) {
        self.half_size_color_image = true;
        self.quality = DecodingQuality::Bilinear;
    }

    fn time_optimized() -> Self {
        let mut s = Self::default();
        s.optimize_time_loading();
        s
    }
}

/// Brightness / contrast / gamma applied after demosaicing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BcgSettings {
    pub brightness: f64,
    pub contrast: f64,
    pub gamma: f64,
}

impl Default for BcgSettings {
    fn default() -> Self {
        Self {
            brightness: 0.0,
            contrast: 1.0,
            gamma: 1.0,
        }
    }
}

/// White balance correction applied after demosaicing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WbSettings {
    pub temperature: f64,
    pub green: f64,
    pub exposition: f64,
    pub saturation: f64,
}

impl Default for WbSettings {
    fn default() -> Self {
        Self {
            temperature: 6500.0,
            green: 1.0,
            exposition: 0.0,
            saturation: 1.0,
        }
    }
}

/// Full RAW conversion recipe: decoder parameters plus post-processing.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawDecodingSettings {
    pub decoder: RawDecoderSettings,
    pub bcg: BcgSettings,
    pub wb: WbSettings,
}

impl RawDecodingSettings {
    pub fn new(decoder: RawDecoderSettings) -> Self {
        Self {
            decoder,
            ..Self::default()
        }
    }

    pub fn optimize_time_loading(&mut self) {
        self.decoder.optimize_time_loading();
        self.reset_post_processing_settings();
    }

    pub fn reset_post_processing_settings(&mut self) {
        self.bcg = BcgSettings::default();
        self.wb = WbSettings::default();
    }

    pub fn post_processing_is_dirty(&self) -> bool {
        self.bcg != BcgSettings::default() || self.wb != WbSettings::default()
    }

    /// History action recording these settings.
    pub fn to_filter_action(&self) -> FilterAction {
        let mut action = FilterAction::new(RAW_FILTER_IDENTIFIER, RAW_FILTER_VERSION)
            .with_category(FilterCategory::Reproducible);
        action.display_name = "Raw Conversion".to_string();
        self.write_to_filter_action(&mut action, "");
        action
    }

    pub fn write_to_filter_action(&self, action: &mut FilterAction, prefix: &str) {
        action.add_parameter("RawDecoder", env!("CARGO_PKG_VERSION"));
        let s = &self.decoder;
        let defaults = RawDecoderSettings::default();

        if *s == defaults {
            action.add_parameter("RawDefaultSettings", true);
        } else if *s == RawDecoderSettings::time_optimized() {
            action.add_parameter("RawTimeOptimizedSettings", true);
        } else {
            let mut put = |key: &str, value: String| {
                action.parameters.insert(format!("{prefix}{key}"), value);
            };
            put("sixteenBitsImage", s.sixteen_bits_image.to_string());
            put("halfSizeColorImage", s.half_size_color_image.to_string());
            put("fixColorsHighlights", s.fix_colors_highlights.to_string());
            put("autoBrightness", s.auto_brightness.to_string());
            put("whiteBalance", (s.white_balance as i32).to_string());
            if s.white_balance == WhiteBalance::Custom {
                put("customWhiteBalance", s.custom_white_balance.to_string());
                put("customWhiteBalanceGreen", s.custom_white_balance_green.to_string());
            }
            if let (WhiteBalance::Area, Some(area)) = (s.white_balance, s.white_balance_area) {
                put("whiteBalanceAreaX", area.x.to_string());
                put("whiteBalanceAreaY", area.y.to_string());
                put("whiteBalanceAreaWidth", area.width.to_string());
                put("whiteBalanceAreaHeight", area.height.to_string());
            }
            if s.rgb_interpolate_4_colors != defaults.rgb_interpolate_4_colors {
                put("RGBInterpolate4Colors", s.rgb_interpolate_4_colors.to_string());
            }
            if s.dont_stretch_pixels != defaults.dont_stretch_pixels {
                put("DontStretchPixels", s.dont_stretch_pixels.to_string());
            }
            if s.unclip_colors != defaults.unclip_colors {
                put("unclipColors", s.unclip_colors.to_string());
            }
            put("RAWQuality", (s.quality as i32).to_string());
            if s.median_filter_passes != defaults.median_filter_passes {
                put("medianFilterPasses", s.median_filter_passes.to_string());
            }
            if s.noise_reduction != defaults.noise_reduction {
                put("noiseReductionType", (s.noise_reduction as i32).to_string());
            }
            if s.noise_reduction_threshold != defaults.noise_reduction_threshold {
                put("noiseReductionThreshold", s.noise_reduction_threshold.to_string());
            }
            if s.enable_ca_correction {
                put("enableChromaticAberrationCorrection", "true".to_string());
                put("redChromaticAberrationMultiplier", s.ca_multiplier[0].to_string());
                put("blueChromaticAberrationMultiplier", s.ca_multiplier[1].to_string());
            }
            if s.brightness != defaults.brightness {
                put("brightness", s.brightness.to_string());
            }
            put("enableBlackPoint", s.black_point.is_some().to_string());
            if let Some(v) = s.black_point {
                put("blackPoint", v.to_string());
            }
            put("enableWhitePoint", s.white_point.is_some().to_string());
            if let Some(v) = s.white_point {
                put("whitePoint", v.to_string());
            }
            put("inputColorSpace", (s.input_color_space as i32).to_string());
            if s.input_color_space == InputColorSpace::Custom {
                put("inputProfile", s.input_profile.clone());
            }
            put("outputColorSpace", (s.output_color_space as i32).to_string());
            if s.output_color_space == OutputColorSpace::Custom {
                put("outputProfile", s.output_profile.clone());
            }
            if !s.dead_pixel_map.is_empty() {
                put("deadPixelMap", s.dead_pixel_map.clone());
            }
            if s.dcb_iterations != defaults.dcb_iterations {
                put("dcbIterations", s.dcb_iterations.to_string());
            }
            if s.dcb_enhance_fl {
                put("dcbEnhanceFl", "true".to_string());
            }
            if s.exposure_correction {
                put("expoCorrection", "true".to_string());
                put("exposureCorrectionShift", s.exposure_correction_shift.to_string());
                put("exposureCorrectionHighlight", s.exposure_correction_highlight.to_string());
            }
        }

        if self.bcg != BcgSettings::default() {
            action.add_parameter(format!("{prefix}bcg:brightness"), self.bcg.brightness);
            action.add_parameter(format!("{prefix}bcg:contrast"), self.bcg.contrast);
            action.add_parameter(format!("{prefix}bcg:gamma"), self.bcg.gamma);
        }
        if self.wb != WbSettings::default() {
            action.add_parameter(format!("{prefix}wb:temperature"), self.wb.temperature);
            action.add_parameter(format!("{prefix}wb:green"), self.wb.green);
            action.add_parameter(format!("{prefix}wb:exposition"), self.wb.exposition);
            action.add_parameter(format!("{prefix}wb:saturation"), self.wb.saturation);
        }
    }

    /// Rebuild settings from a recorded action. Missing parameters keep
    /// their defaults.
    pub fn from_filter_action(action: &FilterAction, prefix: &str) -> Self {
        let mut settings = Self::default();
        let key = |k: &str| format!("{prefix}{k}");
        let get_bool = |k: &str, d: bool| action.parameter_or(&key(k), d);

        if action.parameter_or("RawDefaultSettings", false) {
            // Defaults already in place.
        } else if action.parameter_or("RawTimeOptimizedSettings", false) {
            settings.decoder.optimize_time_loading();
        } else {
            let d = &mut settings.decoder;
            d.sixteen_bits_image = get_bool("sixteenBitsImage", d.sixteen_bits_image);
            d.half_size_color_image = get_bool("halfSizeColorImage", d.half_size_color_image);
            d.fix_colors_highlights = get_bool("fixColorsHighlights", d.fix_colors_highlights);
            d.auto_brightness = get_bool("autoBrightness", d.auto_brightness);
            d.white_balance = WhiteBalance::from_i32(action.parameter_or(&key("whiteBalance"), 1))
                .unwrap_or_default();
            if d.white_balance == WhiteBalance::Custom {
                d.custom_white_balance =
                    action.parameter_or(&key("customWhiteBalance"), d.custom_white_balance);
                d.custom_white_balance_green = action
                    .parameter_or(&key("customWhiteBalanceGreen"), d.custom_white_balance_green);
            }
            if action.has_parameter(&key("whiteBalanceAreaX")) {
                let area = Area {
                    x: action.parameter_or(&key("whiteBalanceAreaX"), 0),
                    y: action.parameter_or(&key("whiteBalanceAreaY"), 0),
                    width: action.parameter_or(&key("whiteBalanceAreaWidth"), 0),
                    height: action.parameter_or(&key("whiteBalanceAreaHeight"), 0),
                };
                if area.width > 0 && area.height > 0 {
                    d.white_balance_area = Some(area);
                }
            }
            d.rgb_interpolate_4_colors =
                get_bool("RGBInterpolate4Colors", d.rgb_interpolate_4_colors);
            d.dont_stretch_pixels = get_bool("DontStretchPixels", d.dont_stretch_pixels);
            d.unclip_colors = action.parameter_or(&key("unclipColors"), d.unclip_colors);
            d.quality = DecodingQuality::from_i32(action.parameter_or(&key("RAWQuality"), 0))
                .unwrap_or_default();
            d.median_filter_passes =
                action.parameter_or(&key("medianFilterPasses"), d.median_filter_passes);
            d.noise_reduction =
                NoiseReduction::from_i32(action.parameter_or(&key("noiseReductionType"), 0))
                    .unwrap_or_default();
            d.noise_reduction_threshold =
                action.parameter_or(&key("noiseReductionThreshold"), d.noise_reduction_threshold);
            d.enable_ca_correction = get_bool("enableChromaticAberrationCorrection", false);
            d.ca_multiplier = [
                action.parameter_or(&key("redChromaticAberrationMultiplier"), 0.0),
                action.parameter_or(&key("blueChromaticAberrationMultiplier"), 0.0),
            ];
            d.brightness = action.parameter_or(&key("brightness"), d.brightness);
            if get_bool("enableBlackPoint", false) {
                d.black_point = Some(action.parameter_or(&key("blackPoint"), 0));
            }
            if get_bool("enableWhitePoint", false) {
                d.white_point = Some(action.parameter_or(&key("whitePoint"), 0));
            }
            d.input_color_space =
                InputColorSpace::from_i32(action.parameter_or(&key("inputColorSpace"), 0))
                    .unwrap_or_default();
            if let Some(p) = action.parameter(&key("inputProfile")) {
                d.input_profile = p.to_string();
            }
            d.output_color_space =
                OutputColorSpace::from_i32(action.parameter_or(&key("outputColorSpace"), 1))
                    .unwrap_or_default();
            if let Some(p) = action.parameter(&key("outputProfile")) {
                d.output_profile = p.to_string();
            }
            if let Some(p) = action.parameter(&key("deadPixelMap")) {
                d.dead_pixel_map = p.to_string();
            }
            d.dcb_iterations = action.parameter_or(&key("dcbIterations"), d.dcb_iterations);
            d.dcb_enhance_fl = get_bool("dcbEnhanceFl", false);
            d.exposure_correction = get_bool("expoCorrection", false);
            d.exposure_correction_shift = action
                .parameter_or(&key("exposureCorrectionShift"), d.exposure_correction_shift);
            d.exposure_correction_highlight = action.parameter_or(
                &key("exposureCorrectionHighlight"),
                d.exposure_correction_highlight,
            );
        }

        let bcg = BcgSettings::default();
        settings.bcg = BcgSettings {
            brightness: action.parameter_or(&key("bcg:brightness"), bcg.brightness),
            contrast: action.parameter_or(&key("bcg:contrast"), bcg.contrast),
            gamma: action.parameter_or(&key("bcg:gamma"), bcg.gamma),
        };
        let wb = WbSettings::default();
        settings.wb = WbSettings {
            temperature: action.parameter_or(&key("wb:temperature"), wb.temperature),
            green: action.parameter_or(&key("wb:green"), wb.green),
            exposition: action.parameter_or(&key("wb:exposition"), wb.exposition),
            saturation: action.parameter_or(&key("wb:saturation"), wb.saturation),
        };
        settings
    }
}

/// Header-level facts about a RAW file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawInfo {
    pub width: u32,
    pub height: u32,
    pub make: String,
    pub model: String,
}

/// Demosaiced output of a [`RawDecoder`]: interleaved RGB, 8 or 16 bits
/// per channel, 16-bit samples in native byte order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawImage {
    pub width: u32,
    pub height: u32,
    pub sixteen_bit: bool,
    pub rgb: Vec<u8>,
    pub icc_profile: Option<Vec<u8>>,
}

/// External RAW decoding backend.
pub trait RawDecoder: Send + Sync {
    /// Cheap probe: `Some` when the file is a RAW this backend can decode.
    fn identify(&self, path: &Path) -> Option<RawInfo>;

    /// Demosaic the file. Implementations should poll `observer` and
    /// return [`crate::DImgError::Cancelled`] when asked to stop.
    fn decode(
        &self,
        path: &Path,
        settings: &RawDecoderSettings,
        observer: Option<&dyn DImgLoaderObserver>,
    ) -> Result<RawImage>;

    /// Apply the post-processing part of `settings` to a decoded image.
    fn post_process(&self, _image: &mut DImg, _settings: &RawDecodingSettings) -> Result<()> {
        Ok(())
    }
}

static RAW_DECODER: OnceLock<RwLock<Option<Arc<dyn RawDecoder>>>> = OnceLock::new();

fn slot() -> &'static RwLock<Option<Arc<dyn RawDecoder>>> {
    RAW_DECODER.get_or_init(|| RwLock::new(None))
}

/// Install the process-wide RAW backend.
pub fn set_raw_decoder(decoder: Arc<dyn RawDecoder>) {
    *slot().write() = Some(decoder);
}

pub fn clear_raw_decoder() {
    *slot().write() = None;
}

pub fn raw_decoder() -> Option<Arc<dyn RawDecoder>> {
    slot().read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_collapse_to_marker() {
        let action = RawDecodingSettings::default().to_filter_action();
        assert_eq!(action.parameter("RawDefaultSettings"), Some("true"));
        assert!(action.has_parameter("RawDecoder"));
        assert!(!action.has_parameter("sixteenBitsImage"));
        assert_eq!(
            RawDecodingSettings::from_filter_action(&action, ""),
            RawDecodingSettings::default()
        );
    }

    #[test]
    fn test_time_optimized_marker() {
        let mut settings = RawDecodingSettings::default();
        settings.optimize_time_loading();
        let action = settings.to_filter_action();
        assert_eq!(action.parameter("RawTimeOptimizedSettings"), Some("true"));
        assert_eq!(RawDecodingSettings::from_filter_action(&action, ""), settings);
    }

    #[test]
    fn test_custom_settings_roundtrip_through_action() {
        let mut settings = RawDecodingSettings::default();
        settings.decoder.sixteen_bits_image = true;
        settings.decoder.white_balance = WhiteBalance::Custom;
        settings.decoder.custom_white_balance = 5200;
        settings.decoder.custom_white_balance_green = 1.25;
        settings.decoder.quality = DecodingQuality::Ahd;
        settings.decoder.black_point = Some(12);
        settings.decoder.output_color_space = OutputColorSpace::AdobeRgb;
        settings.bcg.gamma = 1.8;

        let action = settings.to_filter_action();
        assert_eq!(action.parameter("RAWQuality"), Some("3"));
        let parsed = RawDecodingSettings::from_filter_action(&action, "");
        assert_eq!(parsed, settings);
        assert!(parsed.post_processing_is_dirty());
    }

    #[test]
    fn test_raw_extension_lookup_is_case_insensitive() {
        assert!(is_raw_extension("nef"));
        assert!(is_raw_extension("CR2"));
        assert!(!is_raw_extension("jpg"));
    }
}
