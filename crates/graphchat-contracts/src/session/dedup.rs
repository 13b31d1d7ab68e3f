use sha2::{Digest, Sha256};

use super::UploadedImage;

/// How an upload is matched against images already in the session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Same file name and same byte length.
    #[default]
    NameAndSize,
    /// Same SHA-256 of the payload, regardless of name.
    ContentHash,
}

impl DuplicatePolicy {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "name-size" | "name_size" | "name" => Some(Self::NameAndSize),
            "content-hash" | "content_hash" | "hash" | "sha256" => Some(Self::ContentHash),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::NameAndSize => "name-size",
            Self::ContentHash => "content-hash",
        }
    }

    pub fn matches<'a>(
        &self,
        existing: impl IntoIterator<Item = &'a UploadedImage>,
        name: &str,
        size: u64,
        payload: &[u8],
    ) -> bool {
        match self {
            Self::NameAndSize => is_duplicate(existing, name, size),
            Self::ContentHash => {
                let fingerprint = content_fingerprint(payload);
                existing
                    .into_iter()
                    .any(|image| content_fingerprint(&image.bytes) == fingerprint)
            }
        }
    }
}

/// True iff an existing image has both the same name and the same size.
/// A name match alone is not a duplicate.
pub fn is_duplicate<'a>(
    existing: impl IntoIterator<Item = &'a UploadedImage>,
    name: &str,
    size: u64,
) -> bool {
    existing
        .into_iter()
        .any(|image| image.name == name && image.size == size)
}

pub fn content_fingerprint(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}
