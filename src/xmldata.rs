//! Per-image property bag — the archive's XML-data region.
//!
//! The archive boundary treats this as opaque: bytes in, bytes out, byte
//! identical when untouched. Internally it is a JSON document holding one
//! record per image (name, description, counts, totals, creation time) plus
//! arbitrary extra properties that unknown producers may have written.
//!
//! Property harvesting is best-effort: a record that fails to parse is
//! replaced by defaults and the failure is *recorded*, not raised — the
//! archive remains fully usable without its properties. Setting the
//! `DEBUG_XML_INFO` environment variable enables warnings about unexpected
//! property contents; without it the harvest is silent.

use std::collections::BTreeMap;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WimError};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImageInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub dir_count: u64,
    #[serde(default)]
    pub file_count: u64,
    #[serde(default)]
    pub total_bytes: u64,
    /// FILETIME of capture.
    #[serde(default)]
    pub creation_time: u64,
    /// Properties this implementation does not interpret.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct XmlData {
    pub images: Vec<ImageInfo>,
    /// Failures recorded during best-effort harvesting, reported at the end
    /// of the open instead of aborting it.
    #[serde(skip)]
    pub harvest_errors: Vec<String>,
}

fn debug_xml_info() -> bool {
    std::env::var_os("DEBUG_XML_INFO").is_some()
}

impl XmlData {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| WimError::OutOfMemory {
            operation: format!("serializing image properties: {e}"),
        })
    }

    /// Best-effort parse. Structural failures degrade to an empty bag with
    /// the error recorded; per-image oddities degrade per image.
    pub fn from_bytes(data: &[u8], expected_images: usize) -> Self {
        let mut out = XmlData::default();
        if data.is_empty() {
            out.images = vec![ImageInfo::default(); expected_images];
            return out;
        }

        let value: serde_json::Value = match serde_json::from_slice(data) {
            Ok(v) => v,
            Err(e) => {
                out.harvest_errors
                    .push(format!("property region is not parseable: {e}"));
                out.images = vec![ImageInfo::default(); expected_images];
                return out;
            }
        };

        let records = value
            .get("images")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if debug_xml_info() {
            for key in value.as_object().map(|o| o.keys()).into_iter().flatten() {
                if key != "images" {
                    warn!("unexpected top-level property \"{key}\" in image properties");
                }
            }
        }

        for (i, rec) in records.iter().enumerate() {
            match serde_json::from_value::<ImageInfo>(rec.clone()) {
                Ok(info) => {
                    if debug_xml_info() {
                        for key in &info.extra {
                            warn!("image {}: uninterpreted property \"{}\"", i + 1, key.0);
                        }
                    }
                    out.images.push(info);
                }
                Err(e) => {
                    out.harvest_errors
                        .push(format!("image {}: unreadable properties: {e}", i + 1));
                    out.images.push(ImageInfo::default());
                }
            }
        }

        // The property bag must line up with the metadata resources; pad or
        // note the mismatch but never fail the open over it.
        if out.images.len() != expected_images {
            out.harvest_errors.push(format!(
                "property bag describes {} image(s), archive holds {}",
                out.images.len(),
                expected_images
            ));
            out.images.resize(expected_images, ImageInfo::default());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_is_byte_identical() {
        let mut xml = XmlData::default();
        xml.images.push(ImageInfo {
            name: "Base".into(),
            description: Some("golden image".into()),
            dir_count: 10,
            file_count: 100,
            total_bytes: 1 << 30,
            creation_time: 132_000_000_000_000_000,
            extra: BTreeMap::new(),
        });
        let bytes = xml.to_bytes().unwrap();
        let parsed = XmlData::from_bytes(&bytes, 1);
        assert!(parsed.harvest_errors.is_empty());
        assert_eq!(parsed.images, xml.images);
        // Untouched bag re-serializes identically.
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn garbage_degrades_to_defaults_with_recorded_errors() {
        let parsed = XmlData::from_bytes(b"not json at all", 2);
        assert_eq!(parsed.images.len(), 2);
        assert_eq!(parsed.images[0], ImageInfo::default());
        assert_eq!(parsed.harvest_errors.len(), 1);
    }

    #[test]
    fn count_mismatch_is_recorded_not_fatal() {
        let mut xml = XmlData::default();
        xml.images.push(ImageInfo::default());
        let bytes = xml.to_bytes().unwrap();
        let parsed = XmlData::from_bytes(&bytes, 3);
        assert_eq!(parsed.images.len(), 3);
        assert!(!parsed.harvest_errors.is_empty());
    }

    #[test]
    fn unknown_properties_survive_in_extra() {
        let raw = serde_json::json!({
            "images": [{ "name": "n", "vendor_tag": 7 }]
        });
        let parsed = XmlData::from_bytes(&serde_json::to_vec(&raw).unwrap(), 1);
        assert_eq!(parsed.images[0].name, "n");
        assert_eq!(
            parsed.images[0].extra.get("vendor_tag"),
            Some(&serde_json::json!(7))
        );
    }
}
