//! ONNX Runtime face encoder: SCRFD detection followed by embedding extraction.

mod detector;
mod embedder;

pub use detector::FaceDetector;
pub use embedder::FaceEmbedder;

use crate::encoder::FaceEncoder;
use crate::error::FaceError;
use crate::types::DetectedFace;
use image::RgbImage;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("model file not found: {0}; download it from insightface into the model directory")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("face box is empty after clamping to the image")]
    EmptyFace,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

impl From<OnnxError> for FaceError {
    fn from(e: OnnxError) -> Self {
        FaceError::Detection(e.to_string())
    }
}

/// [`FaceEncoder`] backed by two ONNX models.
pub struct OnnxEncoder {
    detector: FaceDetector,
    embedder: FaceEmbedder,
}

impl OnnxEncoder {
    pub fn load(detector_path: &Path, embedder_path: &Path) -> Result<Self, OnnxError> {
        Ok(Self {
            detector: FaceDetector::load(detector_path)?,
            embedder: FaceEmbedder::load(embedder_path)?,
        })
    }
}

impl FaceEncoder for OnnxEncoder {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, FaceError> {
        let (width, height) = image.dimensions();
        let candidates = self.detector.detect(image)?;
        tracing::debug!(faces = candidates.len(), width, height, "faces detected");

        let mut faces = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let bounding_box = candidate.to_bounding_box(width, height);
            match self.embedder.embed(image, &bounding_box) {
                Ok(embedding) => faces.push(DetectedFace {
                    bounding_box,
                    embedding,
                }),
                // A box that collapses at the image edge is not a usable face.
                Err(OnnxError::EmptyFace) => {
                    tracing::debug!(?bounding_box, "skipping empty face box");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(faces)
    }
}
