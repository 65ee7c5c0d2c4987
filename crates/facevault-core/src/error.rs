use crate::types::FaceId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the matching engine.
///
/// Serializable so that per-image failures can be carried inside reports.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FaceError {
    /// Malformed image, undecodable bytes, bad tolerance or mismatched embedding dimensionality.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Persistence layer unavailable or write failed. Safe to retry.
    #[error("storage error: {0}")]
    Storage(String),
    #[error("no face with identity {0}")]
    NotFound(FaceId),
    /// The face encoder failed on an otherwise valid image.
    #[error("detection failed: {0}")]
    Detection(String),
}

impl FaceError {
    pub fn is_storage(&self) -> bool {
        matches!(self, FaceError::Storage(_))
    }
}

impl From<image::ImageError> for FaceError {
    fn from(e: image::ImageError) -> Self {
        FaceError::InvalidInput(e.to_string())
    }
}
