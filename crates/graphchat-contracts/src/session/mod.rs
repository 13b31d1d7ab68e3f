mod dedup;
mod error;
mod snapshot;
mod store;

use image::{DynamicImage, ImageFormat};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub use dedup::{content_fingerprint, is_duplicate, DuplicatePolicy};
pub use error::SessionError;
pub use snapshot::{
    decode, encode, load, save, ChatLogPersistence, LoadReport, SnapshotIssue, SnapshotOptions,
    SESSION_DATA_DIR, SESSION_DATA_FILE,
};
pub use store::SessionStore;

/// Upload extensions the session accepts, lowercase and without the dot.
pub const SUPPORTED_IMAGE_TYPES: &[&str] = &["png", "jpg", "jpeg", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<String>,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![text.into()],
        }
    }

    /// Only the first part is rendered.
    pub fn text(&self) -> &str {
        self.parts.first().map(String::as_str).unwrap_or("")
    }
}

/// One uploaded chart image.
///
/// `bytes` is authoritative. `decoded` is a cache rebuilt from it on demand
/// and is never written to the snapshot.
#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub bytes: Vec<u8>,
    pub decoded: Option<DynamicImage>,
    pub chat_log: Vec<ChatMessage>,
}

impl UploadedImage {
    pub fn has_payload(&self) -> bool {
        !self.bytes.is_empty()
    }

    /// Rebuilds the decoded handle if it is missing. Returns `None` when the
    /// payload is empty or cannot be decoded.
    pub fn ensure_decoded(&mut self) -> Option<&DynamicImage> {
        if self.decoded.is_none() && self.has_payload() {
            self.decoded = decode_payload(&self.bytes).ok().map(|(image, _)| image);
        }
        self.decoded.as_ref()
    }
}

impl PartialEq for UploadedImage {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.size == other.size
            && self.bytes == other.bytes
            && self.chat_log == other.chat_log
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub credential: Option<String>,
    pub images: IndexMap<String, UploadedImage>,
}

impl Session {
    pub fn is_empty(&self) -> bool {
        self.credential.is_none() && self.images.is_empty()
    }
}

/// Whether `name` carries one of the accepted upload extensions.
pub fn is_supported_upload(name: &str) -> bool {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    SUPPORTED_IMAGE_TYPES.iter().any(|value| *value == ext)
}

/// Mime type for a payload, sniffed from its magic bytes.
pub fn payload_mime_type(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes).ok()? {
        ImageFormat::Png => Some("image/png"),
        ImageFormat::Jpeg => Some("image/jpeg"),
        ImageFormat::WebP => Some("image/webp"),
        _ => None,
    }
}

pub(crate) fn decode_payload(bytes: &[u8]) -> Result<(DynamicImage, ImageFormat), String> {
    let format = image::guess_format(bytes).map_err(|err| err.to_string())?;
    if !matches!(
        format,
        ImageFormat::Png | ImageFormat::Jpeg | ImageFormat::WebP
    ) {
        return Err(format!("unsupported image format {format:?}"));
    }
    let decoded =
        image::load_from_memory_with_format(bytes, format).map_err(|err| err.to_string())?;
    Ok((decoded, format))
}
