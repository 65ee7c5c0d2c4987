//! SCRFD face detector.
//!
//! Anchor-free decoding over three strides followed by NMS. The input image
//! is scaled to fit the 640×640 network input and anchored at the top-left
//! corner, so mapping back to image space is a single division.

use super::OnnxError;
use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
const CONFIDENCE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Tensor positions of (scores, boxes) for one stride.
type StrideOutputs = (usize, usize);

/// Face box in image coordinates, before rounding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Candidate {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }

    /// Round to pixels and clamp to a `width`×`height` image.
    pub fn to_bounding_box(self, width: u32, height: u32) -> BoundingBox {
        let clamp = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        BoundingBox {
            top: clamp(self.y1, height),
            right: clamp(self.x2, width),
            bottom: clamp(self.y2, height),
            left: clamp(self.x1, width),
        }
    }
}

pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(model_path: &Path) -> Result<Self, OnnxError> {
        if !model_path.exists() {
            return Err(OnnxError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(OnnxError::Inference(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let outputs = output_layout(&names);
        tracing::info!(path = %model_path.display(), ?outputs, "SCRFD detector loaded");

        Ok(Self { session, outputs })
    }

    /// Detect faces, returning boxes in image coordinates sorted by score.
    pub(crate) fn detect(&mut self, image: &RgbImage) -> Result<Vec<Candidate>, OnnxError> {
        let (input, scale) = preprocess(image);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.outputs[pos];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Inference(format!("scores stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| OnnxError::Inference(format!("boxes stride {stride}: {e}")))?;
            candidates.extend(decode_stride(scores, boxes, stride, scale));
        }

        Ok(nms(candidates, NMS_THRESHOLD))
    }
}

/// Map stride slots to output tensors.
///
/// Exports that name tensors `score_8`, `bbox_8`, ... are matched by name;
/// anything else is assumed to follow the reference ordering
/// `[scores 8/16/32, boxes 8/16/32, keypoints 8/16/32]`.
fn output_layout(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let wanted = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<StrideOutputs>> = STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();

    match by_name {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

/// Scale into the network input with top-left placement and normalize to NCHW RGB.
fn preprocess(image: &RgbImage) -> (Array4<f32>, f32) {
    let (w, h) = image.dimensions();
    let scale = (INPUT_SIZE as f32 / w.max(1) as f32).min(INPUT_SIZE as f32 / h.max(1) as f32);
    let new_w = ((w as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let new_h = ((h as f32 * scale).round() as u32).clamp(1, INPUT_SIZE);
    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let size = INPUT_SIZE as usize;
    // Padding is zero after normalization, i.e. the mean color.
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, px) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (px[c] as f32 - MEAN) / STD;
        }
    }
    (tensor, scale)
}

/// Decode one stride's score and distance outputs into image-space boxes.
fn decode_stride(scores: &[f32], boxes: &[f32], stride: usize, scale: f32) -> Vec<Candidate> {
    let cells = INPUT_SIZE as usize / stride;
    let anchors = cells * cells * ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors.min(scores.len()))
        .filter(|&i| scores[i] > CONFIDENCE_THRESHOLD)
        .filter_map(|i| {
            let d = boxes.get(i * 4..i * 4 + 4)?;
            let cell = i / ANCHORS_PER_CELL;
            let ax = (cell % cells) as f32 * s;
            let ay = (cell / cells) as f32 * s;
            Some(Candidate {
                x1: (ax - d[0] * s) / scale,
                y1: (ay - d[1] * s) / scale,
                x2: (ax + d[2] * s) / scale,
                y2: (ay + d[3] * s) / scale,
                score: scores[i],
            })
        })
        .collect()
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let overlap = Candidate {
        x1: a.x1.max(b.x1),
        y1: a.y1.max(b.y1),
        x2: a.x2.min(b.x2),
        y2: a.y2.min(b.y2),
        score: 0.0,
    };
    let inter = overlap.area();
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Greedy non-maximum suppression. Output is sorted by descending score.
fn nms(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut kept: Vec<Candidate> = Vec::new();
    for c in candidates {
        if kept.iter().all(|k| iou(k, &c) <= threshold) {
            kept.push(c);
        }
    }
    kept
}
