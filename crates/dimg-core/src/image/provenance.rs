//! Image history, content fingerprints and metadata preparation on `DImg`.

use std::fmt::Write as _;
use std::path::Path;

use chrono::{DateTime, Utc};

use super::DImg;
use super::attributes::{AttributeValue, keys};
use crate::filelock::FileReadLocker;
use crate::hash;
use crate::history::{DImageHistory, FilterAction, FilterActionFlags, HistoryImageId, HistoryImageIdType};
use crate::metadata::orientation;

/// Split a path into the directory string (with trailing separator) and
/// file name used by history ids.
pub(crate) fn split_history_path(path: &Path) -> (String, String) {
    let dir = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = if dir.is_empty() || dir.ends_with('/') {
        dir
    } else {
        format!("{dir}/")
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, name)
}

impl DImg {
    pub fn image_history(&self) -> &DImageHistory {
        &self.d.history
    }

    pub fn image_history_mut(&mut self) -> &mut DImageHistory {
        &mut self.d_mut().history
    }

    pub fn set_image_history(&mut self, history: DImageHistory) {
        self.d_mut().history = history;
    }

    pub fn has_image_history(&self) -> bool {
        !self.d.history.is_empty()
    }

    /// History as it was when the file was loaded.
    pub fn original_image_history(&self) -> DImageHistory {
        self.attribute(keys::ORIGINAL_IMAGE_HISTORY)
            .and_then(AttributeValue::as_history)
            .cloned()
            .unwrap_or_default()
    }

    /// Identity of the file at `path`, typed `kind`. Invalid when the
    /// file does not exist.
    pub fn create_history_image_id(&self, path: &Path, kind: HistoryImageIdType) -> HistoryImageId {
        let Ok(info) = std::fs::metadata(path) else {
            return HistoryImageId::default();
        };

        let (dir, name) = split_history_path(path);
        let mut id = HistoryImageId {
            kind,
            uuid: self.metadata().unique_id().unwrap_or_default().to_string(),
            file_name: name,
            file_size: info.len(),
            creation_date: info.modified().ok().map(DateTime::<Utc>::from),
            ..HistoryImageId::default()
        };
        id.set_path(&dir);

        let own_file = self.original_file_path().is_some_and(|p| p == path);
        id.unique_hash = match self.attribute(keys::UNIQUE_HASH_V2).and_then(AttributeValue::as_str) {
            Some(cached) if own_file => cached.to_string(),
            _ => Self::unique_hash_v2_for_path(path),
        };
        id
    }

    /// Append the file at `path` as a referred image, replacing earlier
    /// references to the same path.
    pub fn add_as_referred_image_path(&mut self, path: &Path, kind: HistoryImageIdType) -> HistoryImageId {
        let id = self.create_history_image_id(path, kind);
        let history = self.image_history_mut();
        history.purge_path_from_referred_images(&id.file_path, &id.file_name);
        history.push_image_id(id.clone());
        id
    }

    pub fn add_as_referred_image(&mut self, id: HistoryImageId) {
        self.image_history_mut().push_image_id(id);
    }

    pub fn insert_as_referred_image(&mut self, after_step: usize, id: HistoryImageId) {
        self.image_history_mut().insert_referred_image(after_step, id);
    }

    /// Assign `uuid` to the `Current` referred images that lack one.
    pub fn add_current_unique_image_id(&mut self, uuid: &str) {
        self.image_history_mut().adjust_current_uuid(uuid);
    }

    pub fn add_filter_action(&mut self, action: FilterAction) {
        self.image_history_mut().push_action(action);
    }

    /// Flag the steps added since loading as a new branch.
    pub fn set_history_branch(&mut self, is_branch: bool) {
        let before = self.original_image_history();
        self.set_history_branch_after(&before, is_branch);
    }

    pub fn set_history_branch_after(&mut self, before: &DImageHistory, is_branch: bool) {
        let added = self.d.history.len().saturating_sub(before.len());
        self.set_history_branch_for_last_steps(added, is_branch);
    }

    /// Toggle the branch flag on the first of the last `steps` entries.
    pub fn set_history_branch_for_last_steps(&mut self, steps: usize, is_branch: bool) {
        let size = self.d.history.len();
        if steps == 0 || steps > size {
            return;
        }
        let first = size - steps;
        if let Some(action) = self.image_history_mut().entries_mut()[first].action.as_mut() {
            action.flags.set(FilterActionFlags::EXPLICIT_BRANCH, is_branch);
        }
    }

    /// Legacy fingerprint of the image's own file; cached value when the
    /// loader already computed it. Empty when no origin path is known.
    pub fn unique_hash(&self) -> String {
        if let Some(cached) = self.attribute(keys::UNIQUE_HASH).and_then(AttributeValue::as_str) {
            return cached.to_string();
        }
        let Some(path) = self.original_file_path().filter(|p| !p.as_os_str().is_empty()) else {
            tracing::warn!("unique_hash requested without originalFilePath");
            return String::new();
        };
        let _lock = FileReadLocker::new(&path);
        hash::unique_hash(&path, self.metadata().exif()).unwrap_or_else(|e| {
            tracing::warn!("cannot hash {}: {e}", path.display());
            String::new()
        })
    }

    /// V2 fingerprint of the image's own file; cached value when present.
    pub fn unique_hash_v2(&self) -> String {
        if let Some(cached) = self.attribute(keys::UNIQUE_HASH_V2).and_then(AttributeValue::as_str) {
            return cached.to_string();
        }
        let Some(path) = self.original_file_path().filter(|p| !p.as_os_str().is_empty()) else {
            tracing::warn!("unique_hash_v2 requested without originalFilePath");
            return String::new();
        };
        let _lock = FileReadLocker::new(&path);
        Self::unique_hash_v2_for_path(&path)
    }

    /// Legacy fingerprint of an arbitrary file, reading its Exif block
    /// through a metadata-only load.
    pub fn unique_hash_for_path(path: &Path) -> String {
        let mut probe = DImg::new();
        probe.load_image_info(path, true, false, false, false);
        hash::unique_hash(path, probe.metadata().exif()).unwrap_or_else(|e| {
            tracing::warn!("cannot hash {}: {e}", path.display());
            String::new()
        })
    }

    pub fn unique_hash_v2_for_path(path: &Path) -> String {
        hash::unique_hash_v2(path).unwrap_or_else(|e| {
            tracing::warn!("cannot hash {}: {e}", path.display());
            String::new()
        })
    }

    /// 16 random bytes in hex followed by the V2 fingerprint.
    pub fn create_image_unique_id(&self) -> String {
        let mut bytes = [0u8; 16];
        if let Err(e) = getrandom::fill(&mut bytes) {
            tracing::warn!("OS randomness unavailable, deriving image id from the clock: {e}");
            let now = Utc::now().timestamp_nanos_opt().unwrap_or_default();
            bytes.copy_from_slice(&blake3::hash(&now.to_le_bytes()).as_bytes()[..16]);
        }
        let mut id = bytes.iter().fold(String::with_capacity(32), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        });
        id.push_str(&self.unique_hash_v2());
        id
    }

    /// Refresh the metadata blob before writing to `dest_path`: image
    /// dimensions, document name, orientation, serialized history.
    pub fn prepare_metadata_to_save(&mut self, dest_path: &Path, dest_format: &str, reset_orientation: bool) {
        self.prepare_metadata_to_save_with(dest_path, dest_format, reset_orientation, false);
    }

    /// Like [`Self::prepare_metadata_to_save`]; `new_unique_id` also stamps
    /// a fresh image unique id.
    pub fn prepare_metadata_to_save_with(
        &mut self,
        dest_path: &Path,
        dest_format: &str,
        reset_orientation: bool,
        new_unique_id: bool,
    ) {
        if self.is_null() {
            return;
        }
        tracing::debug!("preparing metadata for {} ({dest_format})", dest_path.display());

        let original_name = self
            .original_file_path()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        let history_xml = if self.has_image_history() {
            let mut for_saving = self.image_history().clone();
            for_saving.adjust_referred_images();
            let (dir, name) = split_history_path(dest_path);
            if !dir.is_empty() && !name.is_empty() {
                for_saving.purge_path_from_referred_images(&dir, &name);
            }
            match for_saving.to_xml() {
                Ok(xml) => Some(xml),
                Err(e) => {
                    tracing::warn!("cannot serialize image history: {e}");
                    None
                }
            }
        } else {
            None
        };
        let unique_id = new_unique_id.then(|| self.create_image_unique_id());
        let (width, height) = self.size();

        let mut meta = self.metadata().clone();
        let mut result = meta.set_image_dimensions(width, height);
        if result.is_ok() && !original_name.is_empty() {
            result = meta.set_document_name(&original_name);
        }
        if result.is_ok() && reset_orientation {
            result = meta.set_orientation(orientation::NORMAL);
        }
        if let Err(e) = result {
            tracing::warn!("cannot update Exif before saving: {e}");
        }
        if let Some(xml) = history_xml {
            meta.set_image_history_xml(&xml);
        }
        if let Some(id) = unique_id {
            meta.set_unique_id(&id);
        }
        self.set_metadata(meta);
    }
}
