//! Image history: an append-only provenance log.
//!
//! A history is a list of steps. Each step carries an optional filter
//! action (the operation applied) and the referred images relevant at
//! that point (the file the edit started from, intermediate saves, the
//! current file). The log is serialized to XML and stored in the XMP
//! packet of saved files so lineage survives across sessions.
//!
//! XML layout:
//! ```text
//! <history>
//!   <entry>
//!     <action type="reproducible" name="..." version="1" display="..." branch="true">
//!       <description>...</description>
//!       <params><param name="k" value="v"/></params>
//!     </action>
//!     <file type="original" fileUUID="..." fileName="..." filePath="..." .../>
//!   </entry>
//! </history>
//! ```

use std::collections::BTreeMap;
use std::io::Cursor;

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

use crate::error::{DImgError, Result};

/// Role of a referred image within a history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum HistoryImageIdType {
    /// Not yet assigned.
    #[default]
    Invalid,
    /// The unedited file the history started from.
    Original,
    /// A file used as input at some step.
    Source,
    /// A file saved along the way.
    Intermediate,
    /// The file this history belongs to.
    Current,
}

impl HistoryImageIdType {
    fn as_xml(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Original => "original",
            Self::Source => "source",
            Self::Intermediate => "intermediate",
            Self::Current => "current",
        }
    }

    fn from_xml(s: &str) -> Self {
        match s {
            "original" => Self::Original,
            "source" => Self::Source,
            "intermediate" => Self::Intermediate,
            "current" => Self::Current,
            _ => Self::Invalid,
        }
    }
}

/// Identity of a file referenced from a history.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryImageId {
    pub kind: HistoryImageIdType,
    pub uuid: String,
    pub file_name: String,
    /// Directory of the file, with a trailing separator.
    pub file_path: String,
    pub creation_date: Option<DateTime<Utc>>,
    pub unique_hash: String,
    pub file_size: u64,
    pub original_uuid: String,
}

impl HistoryImageId {
    pub fn with_uuid(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            ..Self::default()
        }
    }

    /// A typed id that can be resolved by uuid, hash or file name.
    pub fn is_valid(&self) -> bool {
        self.kind != HistoryImageIdType::Invalid
            && (!self.uuid.is_empty() || !self.unique_hash.is_empty() || !self.file_name.is_empty())
    }

    pub fn set_path(&mut self, dir: &str) {
        self.file_path = if dir.is_empty() || dir.ends_with('/') {
            dir.to_string()
        } else {
            format!("{dir}/")
        };
    }

    pub fn full_path(&self) -> String {
        format!("{}{}", self.file_path, self.file_name)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FilterActionFlags: u8 {
        /// Saving after this step starts a new version branch.
        const EXPLICIT_BRANCH = 1;
    }
}

/// How well an action can be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FilterCategory {
    /// Replays exactly from its parameters.
    #[default]
    Reproducible,
    /// Replays only with the same filter implementation.
    Complex,
    /// Recorded for documentation, cannot be replayed.
    Documentation,
    Custom,
}

impl FilterCategory {
    fn as_xml(self) -> &'static str {
        match self {
            Self::Reproducible => "reproducible",
            Self::Complex => "complex",
            Self::Documentation => "documentedHistory",
            Self::Custom => "custom",
        }
    }

    fn from_xml(s: &str) -> Self {
        match s {
            "complex" => Self::Complex,
            "documentedHistory" => Self::Documentation,
            "custom" => Self::Custom,
            _ => Self::Reproducible,
        }
    }
}

/// A recorded operation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FilterAction {
    pub identifier: String,
    pub version: u32,
    pub category: FilterCategory,
    pub description: String,
    pub display_name: String,
    pub flags: FilterActionFlags,
    pub parameters: BTreeMap<String, String>,
}

impl FilterAction {
    pub fn new(identifier: impl Into<String>, version: u32) -> Self {
        Self {
            identifier: identifier.into(),
            version,
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: FilterCategory) -> Self {
        self.category = category;
        self
    }

    pub fn is_null(&self) -> bool {
        self.identifier.is_empty()
    }

    pub fn add_parameter(&mut self, key: impl Into<String>, value: impl ToString) {
        self.parameters.insert(key.into(), value.to_string());
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Parse a parameter, falling back to `default` when missing or malformed.
    pub fn parameter_or<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.parameter(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn has_parameter(&self, key: &str) -> bool {
        self.parameters.contains_key(key)
    }

    pub fn is_branch(&self) -> bool {
        self.flags.contains(FilterActionFlags::EXPLICIT_BRANCH)
    }
}

/// One step of a history.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: Option<FilterAction>,
    pub referred_images: Vec<HistoryImageId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DImageHistory {
    entries: Vec<HistoryEntry>,
}

impl DImageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut [HistoryEntry] {
        &mut self.entries
    }

    /// Append a referred image to the last step, creating an empty step
    /// when the history has none.
    pub fn push_image_id(&mut self, id: HistoryImageId) {
        if self.entries.is_empty() {
            self.entries.push(HistoryEntry::default());
        }
        if let Some(last) = self.entries.last_mut() {
            last.referred_images.push(id);
        }
    }

    /// Append a new step carrying `action`.
    pub fn push_action(&mut self, action: FilterAction) {
        self.entries.push(HistoryEntry {
            action: Some(action),
            referred_images: Vec::new(),
        });
    }

    /// Add a referred image to step `step`, clamped to the last step.
    pub fn insert_referred_image(&mut self, step: usize, id: HistoryImageId) {
        if self.entries.is_empty() {
            self.push_image_id(id);
            return;
        }
        let step = step.min(self.entries.len() - 1);
        self.entries[step].referred_images.push(id);
    }

    /// Remove referred images pointing at `dir` + `file_name`.
    pub fn purge_path_from_referred_images(&mut self, dir: &str, file_name: &str) {
        let mut probe = HistoryImageId::default();
        probe.set_path(dir);
        for entry in &mut self.entries {
            entry
                .referred_images
                .retain(|id| !(id.file_path == probe.file_path && id.file_name == file_name));
        }
    }

    /// Demote `Current` ids: the very first becomes `Original`, the rest
    /// `Intermediate`. Used before the history is stored in a new file.
    pub fn adjust_referred_images(&mut self) {
        for (i, entry) in self.entries.iter_mut().enumerate() {
            for (x, id) in entry.referred_images.iter_mut().enumerate() {
                if id.kind == HistoryImageIdType::Current {
                    id.kind = if i == 0 && x == 0 {
                        HistoryImageIdType::Original
                    } else {
                        HistoryImageIdType::Intermediate
                    };
                }
            }
        }
    }

    /// Fill in `uuid` on `Current` ids that have none.
    pub fn adjust_current_uuid(&mut self, uuid: &str) {
        for entry in &mut self.entries {
            for id in &mut entry.referred_images {
                if id.kind == HistoryImageIdType::Current && id.uuid.is_empty() {
                    id.uuid = uuid.to_string();
                }
            }
        }
    }

    pub fn all_referred_images(&self) -> impl Iterator<Item = &HistoryImageId> {
        self.entries.iter().flat_map(|e| e.referred_images.iter())
    }

    pub fn referred_images_of_type(&self, kind: HistoryImageIdType) -> Vec<HistoryImageId> {
        self.all_referred_images()
            .filter(|id| id.kind == kind)
            .cloned()
            .collect()
    }

    pub fn has_referred_image_of_type(&self, kind: HistoryImageIdType) -> bool {
        self.all_referred_images().any(|id| id.kind == kind)
    }

    pub fn has_original_referred_image(&self) -> bool {
        self.has_referred_image_of_type(HistoryImageIdType::Original)
    }

    pub fn original_referred_image(&self) -> Option<&HistoryImageId> {
        self.all_referred_images()
            .find(|id| id.kind == HistoryImageIdType::Original)
    }

    /// Whether any step carries an action.
    pub fn has_actions(&self) -> bool {
        self.entries.iter().any(|e| e.action.is_some())
    }

    pub fn actions(&self) -> impl Iterator<Item = &FilterAction> {
        self.entries.iter().filter_map(|e| e.action.as_ref())
    }

    /// Serialize to the XML form stored in XMP. Empty history yields an
    /// empty string.
    pub fn to_xml(&self) -> Result<String> {
        if self.entries.is_empty() {
            return Ok(String::new());
        }

        let mut writer = Writer::new(Cursor::new(Vec::new()));
        writer.write_event(Event::Start(BytesStart::new("history")))?;

        for entry in &self.entries {
            writer.write_event(Event::Start(BytesStart::new("entry")))?;
            if let Some(action) = &entry.action {
                write_action(&mut writer, action)?;
            }
            for id in &entry.referred_images {
                write_image_id(&mut writer, id)?;
            }
            writer.write_event(Event::End(BytesEnd::new("entry")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("history")))?;
        String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| DImgError::History(e.to_string()))
    }

    /// Parse the XML form. Empty input yields an empty history.
    pub fn from_xml(xml: &str) -> Result<Self> {
        let mut history = Self::default();
        if xml.trim().is_empty() {
            return Ok(history);
        }

        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut entry: Option<HistoryEntry> = None;
        let mut action: Option<FilterAction> = None;
        let mut in_description = false;

        loop {
            let event = reader.read_event()?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let is_empty = matches!(event, Event::Empty(_));
                    match e.local_name().as_ref() {
                        b"entry" => {
                            entry = Some(HistoryEntry::default());
                            if is_empty {
                                history.entries.extend(entry.take());
                            }
                        }
                        b"action" => {
                            let parsed = read_action(e)?;
                            if is_empty {
                                if let Some(entry) = entry.as_mut() {
                                    entry.action = Some(parsed);
                                }
                            } else {
                                action = Some(parsed);
                            }
                        }
                        b"description" => in_description = !is_empty,
                        b"param" => {
                            if let Some(action) = action.as_mut() {
                                let attrs = attributes(e)?;
                                if let Some(name) = attrs.get("name") {
                                    let value = attrs.get("value").cloned().unwrap_or_default();
                                    action.parameters.insert(name.clone(), value);
                                }
                            }
                        }
                        b"file" => {
                            let id = read_image_id(e)?;
                            if let Some(entry) = entry.as_mut() {
                                entry.referred_images.push(id);
                            }
                        }
                        _ => {}
                    }
                }
                Event::Text(ref t) if in_description => {
                    if let Some(action) = action.as_mut() {
                        action.description = t.unescape()?.into_owned();
                    }
                }
                Event::End(ref e) => match e.local_name().as_ref() {
                    b"description" => in_description = false,
                    b"action" => {
                        if let (Some(entry), Some(action)) = (entry.as_mut(), action.take()) {
                            entry.action = Some(action);
                        }
                    }
                    b"entry" => history.entries.extend(entry.take()),
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(history)
    }
}

fn write_action(writer: &mut Writer<Cursor<Vec<u8>>>, action: &FilterAction) -> Result<()> {
    let version = action.version.to_string();
    let mut start = BytesStart::new("action");
    start.push_attribute(("type", action.category.as_xml()));
    start.push_attribute(("name", action.identifier.as_str()));
    start.push_attribute(("version", version.as_str()));
    if !action.display_name.is_empty() {
        start.push_attribute(("display", action.display_name.as_str()));
    }
    if action.is_branch() {
        start.push_attribute(("branch", "true"));
    }
    writer.write_event(Event::Start(start))?;

    if !action.description.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("description")))?;
        writer.write_event(Event::Text(BytesText::new(&action.description)))?;
        writer.write_event(Event::End(BytesEnd::new("description")))?;
    }

    if !action.parameters.is_empty() {
        writer.write_event(Event::Start(BytesStart::new("params")))?;
        for (name, value) in &action.parameters {
            let mut param = BytesStart::new("param");
            param.push_attribute(("name", name.as_str()));
            param.push_attribute(("value", value.as_str()));
            writer.write_event(Event::Empty(param))?;
        }
        writer.write_event(Event::End(BytesEnd::new("params")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("action")))?;
    Ok(())
}

fn write_image_id(writer: &mut Writer<Cursor<Vec<u8>>>, id: &HistoryImageId) -> Result<()> {
    let mut file = BytesStart::new("file");
    file.push_attribute(("type", id.kind.as_xml()));
    let optional = [
        ("fileUUID", id.uuid.as_str()),
        ("fileName", id.file_name.as_str()),
        ("filePath", id.file_path.as_str()),
        ("fileHash", id.unique_hash.as_str()),
        ("originalUUID", id.original_uuid.as_str()),
    ];
    for (key, value) in optional {
        if !value.is_empty() {
            file.push_attribute((key, value));
        }
    }
    let date = id.creation_date.map(|d| d.to_rfc3339());
    if let Some(date) = date.as_deref() {
        file.push_attribute(("creationDate", date));
    }
    let size = id.file_size.to_string();
    if id.file_size > 0 {
        file.push_attribute(("fileSize", size.as_str()));
    }
    writer.write_event(Event::Empty(file))?;
    Ok(())
}

fn attributes(e: &BytesStart<'_>) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        map.insert(key, attr.unescape_value()?.into_owned());
    }
    Ok(map)
}

fn read_action(e: &BytesStart<'_>) -> Result<FilterAction> {
    let attrs = attributes(e)?;
    let mut action = FilterAction::new(
        attrs.get("name").cloned().unwrap_or_default(),
        attrs.get("version").and_then(|v| v.parse().ok()).unwrap_or(1),
    );
    action.category = attrs
        .get("type")
        .map(|t| FilterCategory::from_xml(t))
        .unwrap_or_default();
    action.display_name = attrs.get("display").cloned().unwrap_or_default();
    if attrs.get("branch").is_some_and(|b| b == "true") {
        action.flags |= FilterActionFlags::EXPLICIT_BRANCH;
    }
    Ok(action)
}

fn read_image_id(e: &BytesStart<'_>) -> Result<HistoryImageId> {
    let mut attrs = attributes(e)?;
    let mut take = |key: &str| attrs.remove(key).unwrap_or_default();
    let kind = HistoryImageIdType::from_xml(&take("type"));
    let uuid = take("fileUUID");
    let file_name = take("fileName");
    let file_path = take("filePath");
    let unique_hash = take("fileHash");
    let original_uuid = take("originalUUID");
    let creation_date = DateTime::parse_from_rfc3339(&take("creationDate"))
        .ok()
        .map(|d| d.with_timezone(&Utc));
    let file_size = take("fileSize").parse().unwrap_or(0);
    Ok(HistoryImageId {
        kind,
        uuid,
        file_name,
        file_path,
        creation_date,
        unique_hash,
        file_size,
        original_uuid,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_id(name: &str, kind: HistoryImageIdType) -> HistoryImageId {
        let mut id = HistoryImageId {
            kind,
            file_name: name.to_string(),
            unique_hash: format!("hash-{name}"),
            file_size: 1234,
            ..HistoryImageId::default()
        };
        id.set_path("/photos");
        id
    }

    #[test]
    fn test_push_image_id_creates_first_step() {
        let mut history = DImageHistory::new();
        history.push_image_id(image_id("a.jpg", HistoryImageIdType::Original));
        assert_eq!(history.len(), 1);
        assert!(history.entries()[0].action.is_none());
        assert_eq!(history.entries()[0].referred_images.len(), 1);
    }

    #[test]
    fn test_push_action_then_id_attaches_to_action_step() {
        let mut history = DImageHistory::new();
        history.push_image_id(image_id("a.jpg", HistoryImageIdType::Original));
        history.push_action(FilterAction::new("transform:rotate", 1));
        history.push_image_id(image_id("b.jpg", HistoryImageIdType::Current));
        assert_eq!(history.len(), 2);
        assert_eq!(history.entries()[1].referred_images[0].file_name, "b.jpg");
    }

    #[test]
    fn test_purge_path_removes_matching_ids() {
        let mut history = DImageHistory::new();
        history.push_image_id(image_id("a.jpg", HistoryImageIdType::Original));
        history.push_image_id(image_id("b.jpg", HistoryImageIdType::Current));
        history.purge_path_from_referred_images("/photos/", "b.jpg");
        let names: Vec<_> = history.all_referred_images().map(|i| i.file_name.clone()).collect();
        assert_eq!(names, vec!["a.jpg"]);
    }

    #[test]
    fn test_adjust_referred_images_demotes_current() {
        let mut history = DImageHistory::new();
        history.push_image_id(image_id("a.jpg", HistoryImageIdType::Current));
        history.push_action(FilterAction::new("x", 1));
        history.push_image_id(image_id("b.jpg", HistoryImageIdType::Current));
        history.adjust_referred_images();
        assert_eq!(history.entries()[0].referred_images[0].kind, HistoryImageIdType::Original);
        assert_eq!(history.entries()[1].referred_images[0].kind, HistoryImageIdType::Intermediate);
    }

    #[test]
    fn test_xml_roundtrip_preserves_fields() {
        let mut history = DImageHistory::new();
        let mut original = image_id("a & b.jpg", HistoryImageIdType::Original);
        original.uuid = "0123abcd".to_string();
        original.creation_date = DateTime::parse_from_rfc3339("2024-05-01T10:20:30+00:00")
            .ok()
            .map(|d| d.with_timezone(&Utc));
        history.push_image_id(original);

        let mut action = FilterAction::new("transform:crop", 2).with_category(FilterCategory::Complex);
        action.description = "Crop <region>".to_string();
        action.display_name = "Crop".to_string();
        action.flags |= FilterActionFlags::EXPLICIT_BRANCH;
        action.add_parameter("x", 10);
        action.add_parameter("quote", "\"q\"");
        history.push_action(action);
        history.push_image_id(image_id("c.png", HistoryImageIdType::Current));

        let xml = history.to_xml().unwrap();
        assert!(xml.starts_with("<history>"));
        let parsed = DImageHistory::from_xml(&xml).unwrap();
        assert_eq!(parsed, history);
    }

    #[test]
    fn test_empty_history_xml_is_empty() {
        assert_eq!(DImageHistory::new().to_xml().unwrap(), "");
        assert!(DImageHistory::from_xml("   ").unwrap().is_empty());
    }

    #[test]
    fn test_is_valid_requires_type_and_identity() {
        let mut id = HistoryImageId::with_uuid("abc");
        assert!(!id.is_valid());
        id.kind = HistoryImageIdType::Source;
        assert!(id.is_valid());
        let untitled = HistoryImageId {
            kind: HistoryImageIdType::Source,
            ..HistoryImageId::default()
        };
        assert!(!untitled.is_valid());
    }
}
