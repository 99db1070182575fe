//! Record types shared by the two image tiers.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

use crate::error::{StoreError, StoreResult};

/// Prefix that turns an original image id into its web-use id.
pub const OPTIMIZED_PREFIX: &str = "opt_";

/// Derive the web-use id for an original id.
pub fn optimized_id(original_id: &str) -> String {
    if original_id.starts_with(OPTIMIZED_PREFIX) {
        original_id.to_string()
    } else {
        format!("{}{}", OPTIMIZED_PREFIX, original_id)
    }
}

/// Strip the web-use prefix, if any.
pub fn original_id(id: &str) -> &str {
    id.strip_prefix(OPTIMIZED_PREFIX).unwrap_or(id)
}

/// One of the two primary stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Full fidelity copies.
    Original,
    /// Compressed display copies.
    WebUse,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Original => "original",
            Tier::WebUse => "webuse",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "original" => Some(Tier::Original),
            "webuse" => Some(Tier::WebUse),
            _ => None,
        }
    }

    pub(crate) fn table(&self) -> &'static str {
        match self {
            Tier::Original => "original_images",
            Tier::WebUse => "webuse_images",
        }
    }

    /// Table name used before the tiers were split into their own tables.
    pub(crate) fn legacy_table(&self) -> &'static str {
        match self {
            Tier::Original => "legacy_images",
            Tier::WebUse => "legacy_optimized_images",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Where an image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    #[default]
    Generated,
    Uploaded,
    Quoted,
    Migrated,
    Converted,
    Compressed,
}

impl ImageSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSource::Generated => "generated",
            ImageSource::Uploaded => "uploaded",
            ImageSource::Quoted => "quoted",
            ImageSource::Migrated => "migrated",
            ImageSource::Converted => "converted",
            ImageSource::Compressed => "compressed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "generated" => Some(ImageSource::Generated),
            "uploaded" => Some(ImageSource::Uploaded),
            "quoted" => Some(ImageSource::Quoted),
            "migrated" => Some(ImageSource::Migrated),
            "converted" => Some(ImageSource::Converted),
            "compressed" => Some(ImageSource::Compressed),
            _ => None,
        }
    }
}

/// How a web-use copy was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub preset: String,
    pub backend: String,
    pub quality: f32,
    pub original_size: u64,
    pub compression_time_ms: u64,
    pub savings_percent: f64,
}

/// Provider or caller specific details attached to an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum MetadataExtra {
    Generation {
        provider: String,
        model: String,
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<u64>,
    },
    Upload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Quote {
        source_message_id: String,
    },
    /// Anything else, kept verbatim.
    Opaque(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub source: ImageSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<CompressionInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<MetadataExtra>,
}

impl ImageMetadata {
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            compression: None,
            extra: None,
        }
    }

    pub fn with_compression(mut self, info: CompressionInfo) -> Self {
        self.compression = Some(info);
        self
    }

    pub fn with_extra(mut self, extra: MetadataExtra) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Caller-supplied attributes for [`crate::db::ImageStore::put`].
#[derive(Debug, Clone, Default)]
pub struct RecordMeta {
    /// Derived from the payload when absent.
    pub mime_type: Option<String>,
    pub metadata: ImageMetadata,
}

impl RecordMeta {
    pub fn new(metadata: ImageMetadata) -> Self {
        Self {
            mime_type: None,
            metadata,
        }
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }
}

/// Image bytes as handed over by collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum ImagePayload {
    Bytes(Vec<u8>),
    /// `data:<mime>;base64,<payload>`
    DataUri(String),
}

impl ImagePayload {
    /// Resolve to raw bytes plus the mime type declared by a data URI.
    pub fn into_bytes(self) -> StoreResult<(Vec<u8>, Option<String>)> {
        match self {
            ImagePayload::Bytes(bytes) => Ok((bytes, None)),
            ImagePayload::DataUri(uri) => decode_data_uri(&uri),
        }
    }
}

impl From<Vec<u8>> for ImagePayload {
    fn from(bytes: Vec<u8>) -> Self {
        ImagePayload::Bytes(bytes)
    }
}

impl From<&[u8]> for ImagePayload {
    fn from(bytes: &[u8]) -> Self {
        ImagePayload::Bytes(bytes.to_vec())
    }
}

fn decode_data_uri(uri: &str) -> StoreResult<(Vec<u8>, Option<String>)> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| StoreError::invalid_payload("data URI must start with 'data:'"))?;
    let (header, data) = rest
        .split_once(',')
        .ok_or_else(|| StoreError::invalid_payload("data URI has no payload separator"))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| StoreError::invalid_payload("only base64 data URIs are supported"))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| StoreError::invalid_payload(format!("bad base64: {}", e)))?;
    let mime = (!mime.is_empty()).then(|| mime.to_string());
    Ok((bytes, mime))
}

/// Sniff the mime type and pixel dimensions from an encoded image header.
/// Unknown content yields `application/octet-stream` and zero dimensions.
pub(crate) fn probe(bytes: &[u8]) -> (String, u32, u32) {
    let mime = image::guess_format(bytes)
        .map(|f| f.to_mime_type().to_string())
        .unwrap_or_else(|_| "application/octet-stream".to_string());

    let dims = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()
        .and_then(|reader| reader.into_dimensions().ok())
        .unwrap_or((0, 0));

    (mime, dims.0, dims.1)
}

/// A stored image in one tier.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub id: String,
    pub chat_id: String,
    pub message_id: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub width: u32,
    pub height: u32,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub metadata: ImageMetadata,
}

impl ImageRecord {
    /// Build a fresh record, computing size, mime type and dimensions from the bytes.
    pub fn new(
        id: impl Into<String>,
        chat_id: impl Into<String>,
        message_id: impl Into<String>,
        bytes: Vec<u8>,
        meta: RecordMeta,
    ) -> Self {
        let (sniffed_mime, width, height) = probe(&bytes);
        let now = Utc::now();
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            message_id: message_id.into(),
            size_bytes: bytes.len() as u64,
            bytes,
            mime_type: meta.mime_type.unwrap_or(sniffed_mime),
            width,
            height,
            created_at: now,
            last_accessed: now,
            metadata: meta.metadata,
        }
    }

    pub fn is_webp(&self) -> bool {
        self.mime_type.eq_ignore_ascii_case("image/webp")
    }

    pub fn to_data_uri(&self) -> String {
        format!(
            "data:{};base64,{}",
            self.mime_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }

    /// Same record under another id, used when a record changes tier.
    pub(crate) fn with_id(mut self, id: String) -> Self {
        self.id = id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optimized_id_is_prefixed_once() {
        assert_eq!(optimized_id("img1"), "opt_img1");
        assert_eq!(optimized_id("opt_img1"), "opt_img1");
        assert_eq!(original_id("opt_img1"), "img1");
        assert_eq!(original_id("img1"), "img1");
    }

    #[test]
    fn test_data_uri_payload_decodes() {
        let payload = ImagePayload::DataUri("data:image/png;base64,AQID".to_string());
        let (bytes, mime) = payload.into_bytes().unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(mime.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_data_uri_rejects_non_base64() {
        let payload = ImagePayload::DataUri("data:text/plain,hello".to_string());
        assert!(matches!(payload.into_bytes(), Err(StoreError::InvalidPayload(_))));
    }

    #[test]
    fn test_record_size_matches_bytes() {
        let record = ImageRecord::new("a", "c", "m", vec![0u8; 42], RecordMeta::default());
        assert_eq!(record.size_bytes, 42);
        assert_eq!(record.mime_type, "application/octet-stream");
        assert_eq!((record.width, record.height), (0, 0));
    }

    #[test]
    fn test_metadata_extra_roundtrips_through_json() {
        let meta = ImageMetadata::new(ImageSource::Generated).with_extra(MetadataExtra::Opaque(
            serde_json::json!({"steps": 30}),
        ));
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"kind\":\"opaque\""));
        let back: ImageMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }
}
