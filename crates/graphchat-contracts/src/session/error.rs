use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("'{name}' ({size} bytes) is already uploaded")]
    DuplicateUpload { name: String, size: u64 },

    #[error("'{name}' is not a valid image: {reason}")]
    InvalidImage { name: String, reason: String },

    #[error("no image with id {0}")]
    UnknownImage(String),
}
