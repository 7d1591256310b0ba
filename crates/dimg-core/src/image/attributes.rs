//! Open-ended attribute bag attached to every image.
//!
//! Loaders and callers store arbitrary typed values under string keys.
//! The keys in [`keys`] are the ones the engine itself reads and writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ColorModel, DImg};
use crate::format::FileFormat;
use crate::history::{DImageHistory, FilterAction, HistoryImageIdType};
use crate::raw::RawDecodingSettings;

pub mod keys {
    pub const FORMAT: &str = "format";
    pub const DETECTED_FILE_FORMAT: &str = "detectedFileFormat";
    pub const ORIGINAL_FILE_PATH: &str = "originalFilePath";
    pub const IS_READ_ONLY: &str = "isreadonly";
    pub const ORIGINAL_COLOR_MODEL: &str = "originalColorModel";
    pub const ORIGINAL_BIT_DEPTH: &str = "originalBitDepth";
    pub const ORIGINAL_SIZE: &str = "originalSize";
    pub const UNIQUE_HASH: &str = "uniqueHash";
    pub const UNIQUE_HASH_V2: &str = "uniqueHashV2";
    pub const RAW_DECODING_SETTINGS: &str = "rawDecodingSettings";
    pub const RAW_DECODING_FILTER_ACTION: &str = "rawDecodingFilterAction";
    pub const ORIGINAL_IMAGE_HISTORY: &str = "originalImageHistory";
    pub const SAVED_FILE_PATH: &str = "savedFilePath";
    pub const SAVED_FORMAT: &str = "savedformat";
    pub const SAVED_FORMAT_IS_READ_ONLY: &str = "savedformat-isreadonly";
    pub const QUALITY: &str = "quality";
    pub const COMPRESS: &str = "compress";
    /// JPEG chroma ratio request; see `loaders::jpeg::chroma_ratio`.
    pub const SUBSAMPLING: &str = "subsampling";
}

/// Keys that describe where the pixels came from. They travel together
/// through save / load-as / switch-origin cycles.
pub const FILE_ORIGIN_KEYS: [&str; 9] = [
    keys::FORMAT,
    keys::IS_READ_ONLY,
    keys::ORIGINAL_FILE_PATH,
    keys::ORIGINAL_SIZE,
    keys::ORIGINAL_IMAGE_HISTORY,
    keys::RAW_DECODING_SETTINGS,
    keys::RAW_DECODING_FILTER_ACTION,
    keys::UNIQUE_HASH,
    keys::UNIQUE_HASH_V2,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Size(u32, u32),
    History(DImageHistory),
    RawSettings(RawDecodingSettings),
    FilterAction(FilterAction),
}

impl AttributeValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::Float(f) => Some(*f as i64),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_size(&self) -> Option<(u32, u32)> {
        match self {
            Self::Size(w, h) => Some((*w, *h)),
            _ => None,
        }
    }

    pub fn as_history(&self) -> Option<&DImageHistory> {
        match self {
            Self::History(h) => Some(h),
            _ => None,
        }
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for AttributeValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for AttributeValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&Path> for AttributeValue {
    fn from(v: &Path) -> Self {
        Self::String(v.to_string_lossy().into_owned())
    }
}

impl From<(u32, u32)> for AttributeValue {
    fn from((w, h): (u32, u32)) -> Self {
        Self::Size(w, h)
    }
}

impl From<DImageHistory> for AttributeValue {
    fn from(v: DImageHistory) -> Self {
        Self::History(v)
    }
}

impl From<RawDecodingSettings> for AttributeValue {
    fn from(v: RawDecodingSettings) -> Self {
        Self::RawSettings(v)
    }
}

impl From<FilterAction> for AttributeValue {
    fn from(v: FilterAction) -> Self {
        Self::FilterAction(v)
    }
}

pub type AttributeMap = BTreeMap<String, AttributeValue>;

impl DImg {
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.d.attributes.get(key)
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.d.attributes.contains_key(key)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.d_mut().attributes.insert(key.into(), value.into());
    }

    pub fn remove_attribute(&mut self, key: &str) {
        if self.has_attribute(key) {
            self.d_mut().attributes.remove(key);
        }
    }

    pub fn attributes(&self) -> &AttributeMap {
        &self.d.attributes
    }

    fn string_attribute(&self, key: &str) -> Option<String> {
        self.attribute(key).and_then(AttributeValue::as_str).map(str::to_string)
    }

    /// Format name set by the loader that produced the pixels ("PNG", ...).
    pub fn format(&self) -> String {
        self.string_attribute(keys::FORMAT).unwrap_or_default().to_uppercase()
    }

    /// Format name set by the last successful save.
    pub fn saved_format(&self) -> String {
        self.string_attribute(keys::SAVED_FORMAT).unwrap_or_default().to_uppercase()
    }

    pub fn is_read_only(&self) -> bool {
        self.attribute(keys::IS_READ_ONLY)
            .and_then(AttributeValue::as_bool)
            .unwrap_or(false)
    }

    pub fn original_color_model(&self) -> ColorModel {
        self.attribute(keys::ORIGINAL_COLOR_MODEL)
            .and_then(AttributeValue::as_int)
            .map(ColorModel::from_code)
            .unwrap_or_default()
    }

    /// Bits per channel of the source file, 0 when unknown.
    pub fn original_bit_depth(&self) -> u32 {
        self.attribute(keys::ORIGINAL_BIT_DEPTH)
            .and_then(AttributeValue::as_int)
            .and_then(|v| u32::try_from(v).ok())
            .unwrap_or(0)
    }

    /// Dimensions of the source file, falling back to the current size.
    pub fn original_size(&self) -> (u32, u32) {
        self.attribute(keys::ORIGINAL_SIZE)
            .and_then(AttributeValue::as_size)
            .filter(|&(w, h)| w > 0 && h > 0)
            .unwrap_or_else(|| self.size())
    }

    pub fn detected_format(&self) -> FileFormat {
        self.attribute(keys::DETECTED_FILE_FORMAT)
            .and_then(AttributeValue::as_int)
            .map(FileFormat::from_code)
            .unwrap_or_default()
    }

    pub fn original_file_path(&self) -> Option<PathBuf> {
        self.string_attribute(keys::ORIGINAL_FILE_PATH).map(PathBuf::from)
    }

    pub fn last_saved_file_path(&self) -> Option<PathBuf> {
        self.string_attribute(keys::SAVED_FILE_PATH).map(PathBuf::from)
    }

    pub fn raw_decoding_settings(&self) -> RawDecodingSettings {
        match self.attribute(keys::RAW_DECODING_SETTINGS) {
            Some(AttributeValue::RawSettings(s)) => s.clone(),
            Some(AttributeValue::String(json)) => serde_json::from_str(json).unwrap_or_default(),
            _ => RawDecodingSettings::default(),
        }
    }

    /// The file-origin keys currently set.
    pub fn file_origin_data(&self) -> AttributeMap {
        FILE_ORIGIN_KEYS
            .iter()
            .filter_map(|&key| self.attribute(key).map(|v| (key.to_string(), v.clone())))
            .collect()
    }

    /// File-origin data describing the file written by the last save, as it
    /// would look after loading that file back.
    pub fn last_saved_file_origin_data(&self) -> AttributeMap {
        let mut map = AttributeMap::new();
        if let Some(v) = self.attribute(keys::SAVED_FORMAT) {
            map.insert(keys::FORMAT.to_string(), v.clone());
        }
        if let Some(v) = self.attribute(keys::SAVED_FORMAT_IS_READ_ONLY) {
            map.insert(keys::IS_READ_ONLY.to_string(), v.clone());
        }
        if let Some(v) = self.attribute(keys::SAVED_FILE_PATH) {
            map.insert(keys::ORIGINAL_FILE_PATH.to_string(), v.clone());
        }

        let mut history = self.image_history().clone();
        if !history.is_empty() {
            history.adjust_referred_images();
            if let Some(id) = history
                .entries_mut()
                .last_mut()
                .and_then(|entry| entry.referred_images.last_mut())
            {
                id.kind = HistoryImageIdType::Current;
            }
            map.insert(keys::ORIGINAL_IMAGE_HISTORY.to_string(), history.into());
        }
        map
    }

    /// Replace every file-origin key with the ones present in `data`.
    pub fn set_file_origin_data(&mut self, data: &AttributeMap) {
        let d = self.d_mut();
        for key in FILE_ORIGIN_KEYS {
            d.attributes.remove(key);
        }
        for (key, value) in data {
            if FILE_ORIGIN_KEYS.contains(&key.as_str()) {
                d.attributes.insert(key.clone(), value.clone());
            }
        }
    }

    /// Make the last saved file the origin of this image.
    pub fn switch_origin_to_last_saved(&mut self) {
        let data = self.last_saved_file_origin_data();
        self.set_file_origin_data(&data);
    }

    /// Record that the image was written to `path`.
    pub fn image_saved_as(&mut self, path: &Path) {
        self.set_attribute(keys::SAVED_FILE_PATH, path);
        self.add_as_referred_image_path(path, HistoryImageIdType::Current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryImageId;

    #[test]
    fn test_original_size_falls_back_to_size() {
        let mut image = DImg::from_data(6, 4, false, false, None);
        assert_eq!(image.original_size(), (6, 4));
        image.set_attribute(keys::ORIGINAL_SIZE, (60u32, 40u32));
        assert_eq!(image.original_size(), (60, 40));
    }

    #[test]
    fn test_file_origin_replaces_keys() {
        let mut image = DImg::new();
        image.set_attribute(keys::FORMAT, "PNG");
        image.set_attribute(keys::UNIQUE_HASH, "abc");
        image.set_attribute(keys::QUALITY, 80);

        let mut data = AttributeMap::new();
        data.insert(keys::FORMAT.to_string(), "TIFF".into());
        image.set_file_origin_data(&data);

        assert_eq!(image.format(), "TIFF");
        assert!(!image.has_attribute(keys::UNIQUE_HASH));
        assert!(image.has_attribute(keys::QUALITY));
        assert_eq!(image.file_origin_data().len(), 1);
    }

    #[test]
    fn test_last_saved_origin_maps_keys_and_marks_current() {
        let mut image = DImg::new();
        image.set_attribute(keys::SAVED_FORMAT, "JPG");
        image.set_attribute(keys::SAVED_FORMAT_IS_READ_ONLY, false);
        image.set_attribute(keys::SAVED_FILE_PATH, "/tmp/out.jpg");
        let mut first = HistoryImageId::with_uuid("a");
        first.kind = HistoryImageIdType::Current;
        image.add_as_referred_image(first);
        let mut second = HistoryImageId::with_uuid("b");
        second.kind = HistoryImageIdType::Intermediate;
        image.add_as_referred_image(second);

        let data = image.last_saved_file_origin_data();
        assert_eq!(data.get(keys::FORMAT).and_then(AttributeValue::as_str), Some("JPG"));
        assert_eq!(
            data.get(keys::ORIGINAL_FILE_PATH).and_then(AttributeValue::as_str),
            Some("/tmp/out.jpg")
        );
        let history = data
            .get(keys::ORIGINAL_IMAGE_HISTORY)
            .and_then(AttributeValue::as_history)
            .unwrap();
        let ids = &history.entries()[0].referred_images;
        assert_eq!(ids[0].kind, HistoryImageIdType::Original);
        assert_eq!(ids[1].kind, HistoryImageIdType::Current);

        image.switch_origin_to_last_saved();
        assert_eq!(image.format(), "JPG");
        assert_eq!(image.original_file_path(), Some(PathBuf::from("/tmp/out.jpg")));
    }

    #[test]
    fn test_raw_settings_accept_json() {
        let mut image = DImg::new();
        let mut settings = RawDecodingSettings::default();
        settings.decoder.half_size_color_image = true;
        let json = serde_json::to_string(&settings).unwrap();
        image.set_attribute(keys::RAW_DECODING_SETTINGS, json);
        assert_eq!(image.raw_decoding_settings(), settings);
    }
}
