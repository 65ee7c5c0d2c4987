//! ArcFace-style face embedder.

use super::OnnxError;
use crate::types::{BoundingBox, Embedding};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 112;
const MEAN: f32 = 127.5;
const STD: f32 = 127.5; // symmetric, unlike SCRFD

pub struct FaceEmbedder {
    session: Session,
}

impl FaceEmbedder {
    pub fn load(model_path: &Path) -> Result<Self, OnnxError> {
        if !model_path.exists() {
            return Err(OnnxError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = %model_path.display(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "embedding model loaded"
        );
        Ok(Self { session })
    }

    /// Embed the face inside `face`. The result is L2-normalized.
    pub fn embed(&mut self, image: &RgbImage, face: &BoundingBox) -> Result<Embedding, OnnxError> {
        let input = preprocess(image, face)?;
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| OnnxError::Inference(format!("embedding extraction: {e}")))?;
        if raw.is_empty() {
            return Err(OnnxError::Inference("model produced an empty embedding".into()));
        }
        Ok(Embedding::new(l2_normalize(raw)))
    }
}

/// Crop the face box, resize to the network input and normalize to NCHW RGB.
fn preprocess(image: &RgbImage, face: &BoundingBox) -> Result<Array4<f32>, OnnxError> {
    let right = face.right.min(image.width());
    let bottom = face.bottom.min(image.height());
    if right <= face.left || bottom <= face.top {
        return Err(OnnxError::EmptyFace);
    }
    let crop = image::imageops::crop_imm(image, face.left, face.top, right - face.left, bottom - face.top)
        .to_image();
    let resized = image::imageops::resize(&crop, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - MEAN) / STD;
        }
    }
    Ok(tensor)
}

fn l2_normalize(raw: &[f32]) -> Vec<f32> {
    let norm = raw.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        raw.iter().map(|v| v / norm).collect()
    } else {
        raw.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_shape_and_range() {
        let image = RgbImage::from_pixel(300, 200, Rgb([255, 0, 128]));
        let t = preprocess(&image, &BoundingBox::new(20, 120, 140, 40)).unwrap();
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        assert!(t.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_preprocess_rejects_degenerate_box() {
        let image = RgbImage::from_pixel(50, 50, Rgb([0, 0, 0]));
        let err = preprocess(&image, &BoundingBox::new(10, 10, 20, 10)).unwrap_err();
        assert!(matches!(err, OnnxError::EmptyFace));
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
