//! Exif / IPTC / XMP carried alongside the pixels.
//!
//! The engine treats metadata as opaque blobs owned by the image and
//! touches only the handful of fields it needs: orientation, dimensions,
//! document name, color space, the stored image history and the image
//! unique id. Exif is read and rewritten with `kamadak-exif`. XMP is kept
//! as a flat map of simple properties and regenerated on save; structured
//! XMP values are flattened to text.

use std::collections::BTreeMap;
use std::io::Cursor;

use exif::{Field, In, Tag, Value};
use quick_xml::Reader;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use serde::{Deserialize, Serialize};

use crate::error::{DImgError, Result};

/// Prefix of JPEG APP1 / PNG chunk Exif payloads.
pub const EXIF_HEADER: &[u8] = b"Exif\0\0";
/// XMP namespace of the properties written by this engine.
pub const DIMG_XMP_NS: &str = "http://ns.digikam.org/1.0/";
pub const DIMG_XMP_PREFIX: &str = "digiKam";
pub const XMP_HISTORY_KEY: &str = "digiKam:ImageHistory";
pub const XMP_UNIQUE_ID_KEY: &str = "digiKam:ImageUniqueID";

const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
const TAG_DOCUMENT_NAME: Tag = Tag(exif::Context::Tiff, 0x10d);

/// EXIF orientation values.
pub mod orientation {
    pub const UNSPECIFIED: u16 = 0;
    pub const NORMAL: u16 = 1;
    pub const HFLIP: u16 = 2;
    pub const ROT_180: u16 = 3;
    pub const VFLIP: u16 = 4;
    pub const ROT_90_HFLIP: u16 = 5;
    pub const ROT_90: u16 = 6;
    pub const ROT_90_VFLIP: u16 = 7;
    pub const ROT_270: u16 = 8;
}

/// Working color space named by the Exif ColorSpace tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExifColorSpace {
    Srgb,
    AdobeRgb,
    Unknown,
}

/// Metadata blobs of one image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// TIFF-structured Exif without the `Exif\0\0` header.
    exif: Vec<u8>,
    iptc: Vec<u8>,
    xmp: XmpProperties,
}

impl ImageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.exif.is_empty() && self.iptc.is_empty() && self.xmp.is_empty()
    }

    pub fn exif(&self) -> &[u8] {
        &self.exif
    }

    /// Store Exif bytes, stripping a leading `Exif\0\0` header if present.
    pub fn set_exif(&mut self, data: &[u8]) {
        let data = data.strip_prefix(EXIF_HEADER).unwrap_or(data);
        self.exif = data.to_vec();
    }

    pub fn iptc(&self) -> &[u8] {
        &self.iptc
    }

    pub fn set_iptc(&mut self, data: Vec<u8>) {
        self.iptc = data;
    }

    pub fn xmp(&self) -> &XmpProperties {
        &self.xmp
    }

    pub fn xmp_mut(&mut self) -> &mut XmpProperties {
        &mut self.xmp
    }

    /// Merge an XMP packet read from a file.
    pub fn load_xmp_packet(&mut self, packet: &[u8]) -> Result<()> {
        self.xmp.merge_packet(packet)
    }

    fn parsed_exif(&self) -> Option<exif::Exif> {
        if self.exif.is_empty() {
            return None;
        }
        match exif::Reader::new().read_raw(self.exif.clone()) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::debug!("unreadable Exif block: {e}");
                None
            }
        }
    }

    fn exif_uint(&self, tag: Tag) -> Option<u32> {
        self.parsed_exif()?
            .get_field(tag, In::PRIMARY)?
            .value
            .get_uint(0)
    }

    /// First ASCII value of a primary-IFD tag.
    pub fn exif_ascii(&self, tag: Tag) -> Option<String> {
        let parsed = self.parsed_exif()?;
        let field = parsed.get_field(tag, In::PRIMARY)?;
        match &field.value {
            Value::Ascii(values) => values
                .first()
                .map(|v| String::from_utf8_lossy(v).trim().to_string())
                .filter(|s| !s.is_empty()),
            _ => None,
        }
    }

    pub fn orientation(&self) -> u16 {
        self.exif_uint(Tag::Orientation)
            .and_then(|v| u16::try_from(v).ok())
            .filter(|v| (1..=8).contains(v))
            .unwrap_or(orientation::UNSPECIFIED)
    }

    pub fn color_space(&self) -> ExifColorSpace {
        match self.exif_uint(Tag::ColorSpace) {
            Some(1) => ExifColorSpace::Srgb,
            Some(2) => ExifColorSpace::AdobeRgb,
            // Uncalibrated with the Adobe RGB interop index.
            Some(0xffff) if self.interop_index().as_deref() == Some("R03") => {
                ExifColorSpace::AdobeRgb
            }
            _ => ExifColorSpace::Unknown,
        }
    }

    fn interop_index(&self) -> Option<String> {
        let parsed = self.parsed_exif()?;
        let field = parsed.get_field(Tag::InteroperabilityIndex, In::PRIMARY)?;
        match &field.value {
            Value::Ascii(v) => v.first().map(|s| String::from_utf8_lossy(s).into_owned()),
            _ => None,
        }
    }

    pub fn set_orientation(&mut self, value: u16) -> Result<()> {
        self.edit_exif(vec![Field {
            tag: Tag::Orientation,
            ifd_num: In::PRIMARY,
            value: Value::Short(vec![value]),
        }])
    }

    pub fn set_image_dimensions(&mut self, width: u32, height: u32) -> Result<()> {
        self.edit_exif(vec![
            Field {
                tag: Tag::PixelXDimension,
                ifd_num: In::PRIMARY,
                value: Value::Long(vec![width]),
            },
            Field {
                tag: Tag::PixelYDimension,
                ifd_num: In::PRIMARY,
                value: Value::Long(vec![height]),
            },
        ])
    }

    pub fn set_document_name(&mut self, name: &str) -> Result<()> {
        self.edit_exif(vec![Field {
            tag: TAG_DOCUMENT_NAME,
            ifd_num: In::PRIMARY,
            value: Value::Ascii(vec![name.as_bytes().to_vec()]),
        }])
    }

    pub fn document_name(&self) -> Option<String> {
        self.exif_ascii(TAG_DOCUMENT_NAME)
    }

    /// Replace or add primary-IFD fields and re-encode the Exif block.
    /// Thumbnail IFDs are dropped.
    fn edit_exif(&mut self, updates: Vec<Field>) -> Result<()> {
        let (mut fields, little_endian) = if self.exif.is_empty() {
            (Vec::new(), false)
        } else {
            exif::parse_exif(&self.exif)?
        };
        fields.retain(|f| f.ifd_num == In::PRIMARY);
        for update in updates {
            fields.retain(|f| f.tag != update.tag);
            fields.push(update);
        }
        self.set_exif_fields(&fields, little_endian)
    }

    /// Encode `fields` as a fresh Exif block. Strip and pointer tags are
    /// synthesized by the writer, so callers may pass a container's IFD0
    /// as is.
    pub(crate) fn set_exif_fields(&mut self, fields: &[Field], little_endian: bool) -> Result<()> {
        let mut writer = exif::experimental::Writer::new();
        for field in fields {
            writer.push_field(field);
        }
        let mut out = Cursor::new(Vec::new());
        writer.write(&mut out, little_endian)?;
        self.exif = out.into_inner();
        Ok(())
    }

    pub fn image_history_xml(&self) -> Option<&str> {
        self.xmp.get(XMP_HISTORY_KEY)
    }

    pub fn set_image_history_xml(&mut self, xml: &str) {
        if xml.is_empty() {
            self.xmp.remove(XMP_HISTORY_KEY);
        } else {
            self.xmp
                .set(DIMG_XMP_PREFIX, DIMG_XMP_NS, XMP_HISTORY_KEY, xml);
        }
    }

    pub fn unique_id(&self) -> Option<&str> {
        self.xmp.get(XMP_UNIQUE_ID_KEY)
    }

    pub fn set_unique_id(&mut self, id: &str) {
        self.xmp.set(DIMG_XMP_PREFIX, DIMG_XMP_NS, XMP_UNIQUE_ID_KEY, id);
    }
}

/// Flat view of an XMP packet: qualified property name to text value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XmpProperties {
    namespaces: BTreeMap<String, String>,
    properties: BTreeMap<String, String>,
}

impl XmpProperties {
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn set(&mut self, prefix: &str, namespace: &str, key: &str, value: &str) {
        self.namespaces
            .insert(prefix.to_string(), namespace.to_string());
        self.properties.insert(key.to_string(), value.to_string());
    }

    pub fn remove(&mut self, key: &str) {
        self.properties.remove(key);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.properties
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Read simple properties out of `rdf:Description` elements. Array
    /// values (`rdf:Bag`, `rdf:Seq`, `rdf:Alt`) are joined with `"; "`.
    pub fn merge_packet(&mut self, packet: &[u8]) -> Result<()> {
        let mut reader = Reader::from_reader(packet);
        reader.config_mut().trim_text(true);

        let mut buf = Vec::new();
        let mut depth_in_description: Option<usize> = None;
        let mut depth = 0usize;
        let mut current: Option<String> = None;
        let mut items: Vec<String> = Vec::new();

        loop {
            let event = reader
                .read_event_into(&mut buf)
                .map_err(|e| DImgError::Metadata(e.to_string()))?;
            match event {
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let is_start = matches!(event, Event::Start(_));
                    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if e.local_name().as_ref() == b"Description" {
                        self.read_description_attributes(e)?;
                        if is_start {
                            depth_in_description = Some(depth + 1);
                        }
                    } else if depth_in_description == Some(depth) && is_start {
                        current = Some(name);
                        items.clear();
                    }
                    if is_start {
                        depth += 1;
                    }
                }
                Event::Text(ref t) => {
                    if current.is_some() {
                        let text = t
                            .unescape()
                            .map_err(|e| DImgError::Metadata(e.to_string()))?;
                        items.push(text.into_owned());
                    }
                }
                Event::End(ref e) => {
                    depth = depth.saturating_sub(1);
                    if depth_in_description == Some(depth) {
                        if let Some(key) = current.take() {
                            if !items.is_empty() {
                                self.properties.insert(key, items.join("; "));
                            }
                        }
                    } else if depth_in_description == Some(depth + 1)
                        && e.local_name().as_ref() == b"Description"
                    {
                        depth_in_description = None;
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }
        Ok(())
    }

    fn read_description_attributes(&mut self, e: &BytesStart<'_>) -> Result<()> {
        for attr in e.attributes() {
            let attr = attr.map_err(|e| DImgError::Metadata(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| DImgError::Metadata(e.to_string()))?
                .into_owned();
            if let Some(prefix) = key.strip_prefix("xmlns:") {
                self.namespaces.insert(prefix.to_string(), value);
            } else if !key.starts_with("rdf:") && key.contains(':') {
                self.properties.insert(key, value);
            }
        }
        Ok(())
    }

    /// Serialize as a standalone XMP packet with one `rdf:Description`
    /// carrying every property as an attribute.
    pub fn to_packet(&self) -> Result<String> {
        let mut writer = quick_xml::Writer::new(Cursor::new(Vec::new()));

        let mut meta = BytesStart::new("x:xmpmeta");
        meta.push_attribute(("xmlns:x", "adobe:ns:meta/"));
        writer.write_event(Event::Start(meta))?;

        let mut rdf = BytesStart::new("rdf:RDF");
        rdf.push_attribute(("xmlns:rdf", RDF_NS));
        writer.write_event(Event::Start(rdf))?;

        let mut description = BytesStart::new("rdf:Description");
        description.push_attribute(("rdf:about", ""));
        for (prefix, uri) in &self.namespaces {
            if prefix == "rdf" || prefix == "x" {
                continue;
            }
            let used = self
                .properties
                .keys()
                .any(|k| k.split(':').next() == Some(prefix.as_str()));
            if used {
                let attr = format!("xmlns:{prefix}");
                description.push_attribute((attr.as_str(), uri.as_str()));
            }
        }
        for (key, value) in &self.properties {
            description.push_attribute((key.as_str(), value.as_str()));
        }
        writer.write_event(Event::Empty(description))?;

        writer.write_event(Event::End(BytesEnd::new("rdf:RDF")))?;
        writer.write_event(Event::End(BytesEnd::new("x:xmpmeta")))?;

        let body = String::from_utf8(writer.into_inner().into_inner())
            .map_err(|e| DImgError::Metadata(e.to_string()))?;
        Ok(format!(
            "<?xpacket begin=\"\u{feff}\" id=\"W5M0MpCehiHzreSzNTczkc9d\"?>{body}<?xpacket end=\"w\"?>"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orientation_written_and_read_back() {
        let mut meta = ImageMetadata::new();
        assert_eq!(meta.orientation(), orientation::UNSPECIFIED);
        meta.set_orientation(orientation::ROT_90).unwrap();
        assert_eq!(meta.orientation(), orientation::ROT_90);
        meta.set_orientation(orientation::NORMAL).unwrap();
        assert_eq!(meta.orientation(), orientation::NORMAL);
    }

    #[test]
    fn test_edit_keeps_other_fields() {
        let mut meta = ImageMetadata::new();
        meta.set_document_name("IMG_0001.JPG").unwrap();
        meta.set_image_dimensions(640, 480).unwrap();
        assert_eq!(meta.document_name().as_deref(), Some("IMG_0001.JPG"));
        assert_eq!(meta.exif_uint(Tag::PixelXDimension), Some(640));
    }

    #[test]
    fn test_set_exif_strips_header() {
        let mut meta = ImageMetadata::new();
        meta.set_orientation(orientation::ROT_180).unwrap();
        let mut with_header = EXIF_HEADER.to_vec();
        with_header.extend_from_slice(meta.exif());

        let mut other = ImageMetadata::new();
        other.set_exif(&with_header);
        assert_eq!(other.orientation(), orientation::ROT_180);
    }

    #[test]
    fn test_xmp_packet_roundtrip_keeps_history() {
        let mut meta = ImageMetadata::new();
        meta.set_image_history_xml("<history><entry/></history>");
        meta.set_unique_id("abc123");
        let packet = meta.xmp().to_packet().unwrap();

        let mut reloaded = ImageMetadata::new();
        reloaded.load_xmp_packet(packet.as_bytes()).unwrap();
        assert_eq!(
            reloaded.image_history_xml(),
            Some("<history><entry/></history>")
        );
        assert_eq!(reloaded.unique_id(), Some("abc123"));
    }

    #[test]
    fn test_xmp_element_properties_and_arrays() {
        let packet = br#"<x:xmpmeta xmlns:x="adobe:ns:meta/">
          <rdf:RDF xmlns:rdf="http://www.w3.org/1999/02/22-rdf-syntax-ns#">
            <rdf:Description rdf:about="" xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:xmp="http://ns.adobe.com/xap/1.0/" xmp:Rating="3">
              <dc:subject><rdf:Bag><rdf:li>cats</rdf:li><rdf:li>dogs</rdf:li></rdf:Bag></dc:subject>
              <dc:format>image/png</dc:format>
            </rdf:Description>
          </rdf:RDF>
        </x:xmpmeta>"#;
        let mut xmp = XmpProperties::default();
        xmp.merge_packet(packet).unwrap();
        assert_eq!(xmp.get("xmp:Rating"), Some("3"));
        assert_eq!(xmp.get("dc:subject"), Some("cats; dogs"));
        assert_eq!(xmp.get("dc:format"), Some("image/png"));
    }
}
