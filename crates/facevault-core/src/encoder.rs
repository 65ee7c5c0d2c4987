use crate::error::FaceError;
use crate::types::DetectedFace;
use image::RgbImage;

/// Face detection + embedding extraction.
///
/// Implementations may return faces in any order; pipelines impose
/// left-to-right ordering themselves. Every returned embedding must have the
/// same dimensionality.
pub trait FaceEncoder: Send {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, FaceError>;
}

impl<E: FaceEncoder + ?Sized> FaceEncoder for Box<E> {
    fn detect_and_encode(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, FaceError> {
        (**self).detect_and_encode(image)
    }
}
