//! facevault-core: Face gallery matching engine.
//!
//! Decides, for each face found in an image, whether it belongs to an
//! identity already in the gallery or must be registered as a new one, and
//! answers recognition queries against the gallery without modifying it.
//! Face detection and embedding sit behind [`FaceEncoder`]; an ONNX Runtime
//! implementation lives in [`onnx`].

pub mod comparator;
pub mod encoder;
pub mod error;
pub mod gallery;
pub mod imaging;
pub mod onnx;
pub mod pipeline;
pub mod types;

pub use comparator::{EuclideanMatcher, Matcher, DEFAULT_TOLERANCE};
pub use encoder::FaceEncoder;
pub use error::FaceError;
pub use gallery::{GalleryBackend, GallerySnapshot, GalleryStore, MemoryBackend};
pub use pipeline::{
    FacePipeline, FaceRecognition, FaceRegistration, ImageRecognition, ImageRegistration,
    PipelineOptions,
};
pub use types::{BoundingBox, DetectedFace, Embedding, EntrySummary, FaceId, FaceMatch, GalleryEntry};

use std::path::PathBuf;

/// Default location of the ONNX model files.
///
/// `$XDG_DATA_HOME/facevault/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facevault/models")
}
