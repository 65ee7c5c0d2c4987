use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Unique, permanently assigned key of a gallery entry.
pub type FaceId = i64;

/// Face location in pixel coordinates of the decoded image.
///
/// Field order mirrors the `(top, right, bottom, left)` convention used by
/// face detectors that report CSS-style boxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    pub fn new(top: u32, right: u32, bottom: u32, left: u32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Face embedding vector. Dimensionality is fixed by the encoder that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// True when no component is NaN or infinite.
    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Returns `None` when the dimensionalities differ.
    pub fn euclidean_distance(&self, other: &Embedding) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>();
        Some(sum.sqrt())
    }

    /// Raw little-endian `f32` bytes, the persisted form of an embedding.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Returns `None` if the
    /// length is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// One face found by the encoder in one image.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFace {
    pub bounding_box: BoundingBox,
    pub embedding: Embedding,
}

/// A registered identity in the gallery.
#[derive(Debug, Clone)]
pub struct GalleryEntry {
    pub identity: FaceId,
    pub display_name: String,
    pub embedding: Embedding,
    /// JPEG-encoded face crop.
    pub representative_image: Arc<[u8]>,
    pub created_at: DateTime<Utc>,
}

/// Display name given to a freshly registered identity.
pub fn default_display_name(identity: FaceId) -> String {
    format!("Person_{identity}")
}

/// One gallery identity within tolerance of a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceMatch {
    pub identity: FaceId,
    pub display_name: String,
    pub distance: f32,
}

/// Gallery listing row, without the embedding and image payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub identity: FaceId,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl From<&GalleryEntry> for EntrySummary {
    fn from(entry: &GalleryEntry) -> Self {
        Self {
            identity: entry.identity,
            display_name: entry.display_name.clone(),
            created_at: entry.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_identical() {
        let a = Embedding::new(vec![0.1, 0.2, 0.3]);
        assert_eq!(a.euclidean_distance(&a), Some(0.0));
    }

    #[test]
    fn test_euclidean_distance_known_value() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        let d = a.euclidean_distance(&b).unwrap();
        assert!((d - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.euclidean_distance(&b), None);
    }

    #[test]
    fn test_embedding_bytes_rejects_truncated_blob() {
        let bytes = Embedding::new(vec![1.5, -2.25]).to_le_bytes();
        assert_eq!(bytes.len(), 8);
        assert!(Embedding::from_le_bytes(&bytes[..7]).is_none());
        assert_eq!(
            Embedding::from_le_bytes(&bytes).unwrap().values,
            vec![1.5, -2.25]
        );
    }

    #[test]
    fn test_default_display_name() {
        assert_eq!(default_display_name(7), "Person_7");
    }

    #[test]
    fn test_bounding_box_dimensions_saturate() {
        let b = BoundingBox::new(10, 50, 40, 20);
        assert_eq!(b.width(), 30);
        assert_eq!(b.height(), 30);
        let inverted = BoundingBox::new(40, 10, 10, 20);
        assert_eq!(inverted.width(), 0);
        assert_eq!(inverted.height(), 0);
    }
}
