//! Registration and recognition pipelines.
//!
//! Both pipelines decode an image, run the face encoder, order the faces
//! left to right and consult the gallery through a [`Matcher`].
//! Registration takes a fresh snapshot per face so that a face registered
//! earlier in the same image is visible to the faces after it. Recognition
//! takes one snapshot per image and never writes.

use crate::comparator::{validate_tolerance, EuclideanMatcher, Matcher};
use crate::encoder::FaceEncoder;
use crate::error::FaceError;
use crate::gallery::GalleryStore;
use crate::imaging::{self, DEFAULT_CROP_PADDING, DEFAULT_JPEG_QUALITY};
use crate::types::{BoundingBox, DetectedFace, EntrySummary, FaceId, FaceMatch};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome for one face of a registration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FaceRegistration {
    /// Within tolerance of an existing identity; the gallery was not changed.
    Existing {
        bounding_box: BoundingBox,
        identity: FaceId,
        display_name: String,
        distance: f32,
    },
    /// No identity within tolerance; a new entry was created.
    Registered {
        bounding_box: BoundingBox,
        identity: FaceId,
        display_name: String,
    },
    /// This face could not be processed. Sibling faces were.
    Rejected {
        bounding_box: BoundingBox,
        error: FaceError,
    },
}

/// Outcome for one image of a registration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImageRegistration {
    NoFaces,
    /// Per-face results, left to right. `error` is set when a storage failure
    /// stopped processing; faces listed before it remain committed.
    Faces {
        faces: Vec<FaceRegistration>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FaceError>,
    },
    /// The image could not be decoded or the encoder failed on it.
    Failed { error: FaceError },
}

impl ImageRegistration {
    pub fn faces(&self) -> &[FaceRegistration] {
        match self {
            ImageRegistration::Faces { faces, .. } => faces,
            _ => &[],
        }
    }

    pub fn error(&self) -> Option<&FaceError> {
        match self {
            ImageRegistration::Faces { error, .. } => error.as_ref(),
            ImageRegistration::Failed { error } => Some(error),
            ImageRegistration::NoFaces => None,
        }
    }
}

/// Outcome for one face of a recognition call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FaceRecognition {
    /// All identities within tolerance, closest first. May be empty.
    Recognized {
        bounding_box: BoundingBox,
        matches: Vec<FaceMatch>,
    },
    Rejected {
        bounding_box: BoundingBox,
        error: FaceError,
    },
}

/// Outcome for one image of a recognition call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ImageRecognition {
    NoFaces,
    Faces { faces: Vec<FaceRecognition> },
    Failed { error: FaceError },
}

impl ImageRecognition {
    pub fn faces(&self) -> &[FaceRecognition] {
        match self {
            ImageRecognition::Faces { faces } => faces,
            _ => &[],
        }
    }
}

/// Tunables for representative crops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOptions {
    /// Pixels added on each side of the face box, clamped to the image.
    pub crop_padding: u32,
    pub jpeg_quality: u8,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            crop_padding: DEFAULT_CROP_PADDING,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Caller-facing operations over a shared gallery.
///
/// Cheap to clone. The encoder is passed per call because encoders hold
/// mutable inference state and are owned by the worker running the call.
#[derive(Clone)]
pub struct FacePipeline {
    store: Arc<GalleryStore>,
    matcher: Arc<dyn Matcher>,
    options: PipelineOptions,
}

impl FacePipeline {
    pub fn new(store: Arc<GalleryStore>, options: PipelineOptions) -> Self {
        Self {
            store,
            matcher: Arc::new(EuclideanMatcher),
            options,
        }
    }

    /// Replace the exhaustive matcher, e.g. with an indexed one.
    pub fn with_matcher(mut self, matcher: Arc<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn store(&self) -> &Arc<GalleryStore> {
        &self.store
    }

    /// Register every face of every image. Images are independent: a failure
    /// in one never prevents processing of the next.
    pub fn register_faces<E, B>(
        &self,
        encoder: &mut E,
        images: &[B],
        tolerance: f32,
    ) -> Vec<ImageRegistration>
    where
        E: FaceEncoder + ?Sized,
        B: AsRef<[u8]>,
    {
        images
            .iter()
            .map(|img| self.register_image(&mut *encoder, img.as_ref(), tolerance))
            .collect()
    }

    pub fn register_image<E>(
        &self,
        encoder: &mut E,
        image_bytes: &[u8],
        tolerance: f32,
    ) -> ImageRegistration
    where
        E: FaceEncoder + ?Sized,
    {
        if let Err(error) = validate_tolerance(tolerance) {
            return ImageRegistration::Failed { error };
        }
        let (image, faces) = match decode_and_detect(encoder, image_bytes) {
            Ok(found) => found,
            Err(error) => {
                tracing::warn!(error = %error, "register: image rejected");
                return ImageRegistration::Failed { error };
            }
        };
        if faces.is_empty() {
            tracing::debug!("register: no faces detected");
            return ImageRegistration::NoFaces;
        }

        let mut results = Vec::with_capacity(faces.len());
        for face in faces {
            match self.register_face(&image, face, tolerance) {
                Ok(result) => results.push(result),
                Err((bounding_box, error)) if error.is_storage() => {
                    tracing::error!(
                        left = bounding_box.left,
                        registered = results.len(),
                        error = %error,
                        "register: storage failure, abandoning remaining faces"
                    );
                    return ImageRegistration::Faces {
                        faces: results,
                        error: Some(error),
                    };
                }
                Err((bounding_box, error)) => {
                    tracing::warn!(left = bounding_box.left, error = %error, "register: face rejected");
                    results.push(FaceRegistration::Rejected {
                        bounding_box,
                        error,
                    });
                }
            }
        }

        ImageRegistration::Faces {
            faces: results,
            error: None,
        }
    }

    fn register_face(
        &self,
        image: &RgbImage,
        face: DetectedFace,
        tolerance: f32,
    ) -> Result<FaceRegistration, (BoundingBox, FaceError)> {
        let bounding_box = face.bounding_box;
        // The snapshot is released before any append below.
        let matches = self
            .matcher
            .compare(&face.embedding, &self.store.snapshot(), tolerance)
            .map_err(|e| (bounding_box, e))?;

        if let Some(closest) = matches.into_iter().next() {
            tracing::info!(
                identity = closest.identity,
                distance = closest.distance,
                "register: face already in gallery"
            );
            return Ok(FaceRegistration::Existing {
                bounding_box,
                identity: closest.identity,
                display_name: closest.display_name,
                distance: closest.distance,
            });
        }

        let crop = imaging::crop_face_jpeg(
            image,
            &bounding_box,
            self.options.crop_padding,
            self.options.jpeg_quality,
        )
        .map_err(|e| (bounding_box, e))?;

        let entry = self
            .store
            .append(face.embedding, crop)
            .map_err(|e| (bounding_box, e))?;

        tracing::info!(
            identity = entry.identity,
            name = %entry.display_name,
            "register: new face registered"
        );
        Ok(FaceRegistration::Registered {
            bounding_box,
            identity: entry.identity,
            display_name: entry.display_name.clone(),
        })
    }

    /// Recognize every face of every image without touching the gallery.
    pub fn recognize_faces<E, B>(
        &self,
        encoder: &mut E,
        images: &[B],
        tolerance: f32,
    ) -> Vec<ImageRecognition>
    where
        E: FaceEncoder + ?Sized,
        B: AsRef<[u8]>,
    {
        images
            .iter()
            .map(|img| self.recognize_image(&mut *encoder, img.as_ref(), tolerance))
            .collect()
    }

    pub fn recognize_image<E>(
        &self,
        encoder: &mut E,
        image_bytes: &[u8],
        tolerance: f32,
    ) -> ImageRecognition
    where
        E: FaceEncoder + ?Sized,
    {
        if let Err(error) = validate_tolerance(tolerance) {
            return ImageRecognition::Failed { error };
        }
        let faces = match decode_and_detect(encoder, image_bytes) {
            Ok((_, faces)) => faces,
            Err(error) => {
                tracing::warn!(error = %error, "recognize: image rejected");
                return ImageRecognition::Failed { error };
            }
        };
        if faces.is_empty() {
            return ImageRecognition::NoFaces;
        }

        let snapshot = self.store.snapshot();
        let faces = faces
            .into_iter()
            .map(|face| {
                match self
                    .matcher
                    .compare(&face.embedding, &snapshot, tolerance)
                {
                    Ok(matches) => {
                        tracing::debug!(
                            left = face.bounding_box.left,
                            matches = matches.len(),
                            "recognize: face compared"
                        );
                        FaceRecognition::Recognized {
                            bounding_box: face.bounding_box,
                            matches,
                        }
                    }
                    Err(error) => FaceRecognition::Rejected {
                        bounding_box: face.bounding_box,
                        error,
                    },
                }
            })
            .collect();

        ImageRecognition::Faces { faces }
    }

    /// JPEG crop stored for `identity` at registration time.
    pub fn fetch_representative_image(&self, identity: FaceId) -> Result<Arc<[u8]>, FaceError> {
        self.store
            .get(identity)
            .map(|entry| Arc::clone(&entry.representative_image))
    }

    /// Every registered identity, in creation order.
    pub fn list_entries(&self) -> Vec<EntrySummary> {
        self.store.list()
    }
}

/// Decode, detect, then order faces by their left edge. The sort is stable,
/// so faces sharing a left edge keep the encoder's order.
fn decode_and_detect<E>(
    encoder: &mut E,
    image_bytes: &[u8],
) -> Result<(RgbImage, Vec<DetectedFace>), FaceError>
where
    E: FaceEncoder + ?Sized,
{
    let image = imaging::decode_rgb(image_bytes)?;
    let mut faces = encoder.detect_and_encode(&image)?;
    faces.sort_by_key(|f| f.bounding_box.left);
    Ok((image, faces))
}
