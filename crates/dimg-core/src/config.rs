//! Engine and save-side configuration.
//!
//! Both structs read optional `DIMG_*` environment overrides in their
//! `Default` impls. Per-image attributes (`quality`, `compress`) take
//! precedence over these values when saving.

use std::sync::OnceLock;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default JPEG quality (0-100).
const DEFAULT_JPEG_QUALITY: u8 = 90;
/// Default PNG quality; mapped to a zlib level of `9 - quality / 10`.
const DEFAULT_PNG_QUALITY: u8 = 90;
/// Default JPEG 2000 quality, 100 meaning lossless.
const DEFAULT_JP2K_QUALITY: u8 = 100;
/// Default PGF quality level, 0 meaning lossless.
const DEFAULT_PGF_QUALITY: u8 = 3;
/// Largest pixel buffer a single image may allocate (2 GiB).
const DEFAULT_MAX_ALLOCATION: u64 = 2 * 1024 * 1024 * 1024;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Save-side defaults used when an image carries no override attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveSettings {
    /// JPEG quality, 1-100.
    pub jpeg_quality: u8,
    /// PNG quality, 1-100. Higher means less compression effort.
    pub png_quality: u8,
    /// Whether TIFF files are written with deflate compression.
    pub tiff_compress: bool,
    /// JPEG 2000 quality; 100 selects lossless coding.
    pub jp2k_quality: u8,
    /// PGF quality level.
    pub pgf_quality: u8,
}

impl Default for SaveSettings {
    fn default() -> Self {
        Self {
            jpeg_quality: env_or("DIMG_JPEG_QUALITY", DEFAULT_JPEG_QUALITY).clamp(1, 100),
            png_quality: env_or("DIMG_PNG_QUALITY", DEFAULT_PNG_QUALITY).clamp(1, 100),
            tiff_compress: std::env::var("DIMG_TIFF_COMPRESS").is_ok(),
            jp2k_quality: DEFAULT_JP2K_QUALITY,
            pgf_quality: DEFAULT_PGF_QUALITY,
        }
    }
}

impl SaveSettings {
    /// zlib level for a PNG quality value.
    pub fn png_compression_level(quality: u8) -> u8 {
        9u8.saturating_sub(quality.min(100) / 10)
    }
}

/// Process-wide engine limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on `width * height * bytes_per_pixel` for one buffer.
    pub max_allocation_bytes: u64,
    /// Value written to the reserved "Software" text key on save.
    pub software_stamp: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_allocation_bytes: env_or("DIMG_MAX_ALLOCATION", DEFAULT_MAX_ALLOCATION),
            software_stamp: format!("dimg {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

static ENGINE_CONFIG: OnceLock<RwLock<EngineConfig>> = OnceLock::new();
static SAVE_SETTINGS: OnceLock<RwLock<SaveSettings>> = OnceLock::new();

/// Current process-wide engine configuration.
pub fn engine_config() -> EngineConfig {
    ENGINE_CONFIG
        .get_or_init(|| RwLock::new(EngineConfig::default()))
        .read()
        .clone()
}

/// Replace the process-wide engine configuration.
pub fn set_engine_config(config: EngineConfig) {
    *ENGINE_CONFIG
        .get_or_init(|| RwLock::new(EngineConfig::default()))
        .write() = config;
}

/// Current process-wide save defaults.
pub fn save_settings() -> SaveSettings {
    SAVE_SETTINGS
        .get_or_init(|| RwLock::new(SaveSettings::default()))
        .read()
        .clone()
}

/// Replace the process-wide save defaults.
pub fn set_save_settings(settings: SaveSettings) {
    *SAVE_SETTINGS
        .get_or_init(|| RwLock::new(SaveSettings::default()))
        .write() = settings;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_png_compression_level() {
        assert_eq!(SaveSettings::png_compression_level(90), 0);
        assert_eq!(SaveSettings::png_compression_level(0), 9);
        assert_eq!(SaveSettings::png_compression_level(55), 4);
        assert_eq!(SaveSettings::png_compression_level(200), 0);
    }

    #[test]
    fn test_engine_config_stamp_names_engine() {
        let config = EngineConfig::default();
        assert!(config.software_stamp.starts_with("dimg "));
        assert!(config.max_allocation_bytes > 0);
    }
}
