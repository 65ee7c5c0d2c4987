//! Image decoding and representative face crops.

use crate::error::FaceError;
use crate::types::BoundingBox;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

/// Margin added around a detected face when cropping its representative image.
pub const DEFAULT_CROP_PADDING: u32 = 20;
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Decode any supported image format into RGB8.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, FaceError> {
    if bytes.is_empty() {
        return Err(FaceError::InvalidInput("empty image".into()));
    }
    let img = image::load_from_memory(bytes)?;
    Ok(img.to_rgb8())
}

/// Expand `face` by `padding` on every side, clamped to the image bounds.
pub fn padded_region(face: &BoundingBox, padding: u32, width: u32, height: u32) -> BoundingBox {
    BoundingBox {
        top: face.top.saturating_sub(padding).min(height),
        right: face.right.saturating_add(padding).min(width),
        bottom: face.bottom.saturating_add(padding).min(height),
        left: face.left.saturating_sub(padding).min(width),
    }
}

/// Crop a face with padding and encode it as JPEG.
pub fn crop_face_jpeg(
    image: &RgbImage,
    face: &BoundingBox,
    padding: u32,
    quality: u8,
) -> Result<Vec<u8>, FaceError> {
    let region = padded_region(face, padding, image.width(), image.height());
    if region.width() == 0 || region.height() == 0 {
        return Err(FaceError::InvalidInput(format!(
            "face box {face:?} lies outside the {}x{} image",
            image.width(),
            image.height()
        )));
    }

    let crop = image::imageops::crop_imm(
        image,
        region.left,
        region.top,
        region.width(),
        region.height(),
    )
    .to_image();

    let mut buf = Vec::new();
    crop.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality))
        .map_err(|e| FaceError::InvalidInput(format!("encode face crop: {e}")))?;
    Ok(buf)
}
