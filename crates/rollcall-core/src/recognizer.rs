//! ArcFace face recognizer via ONNX Runtime.
//!
//! Crops a square region around a detected face, resizes it to 112x112 and
//! extracts an L2-normalized 512-dimensional encoding.

use crate::types::{BoundingBox, Embedding};
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const ARCFACE_INPUT_SIZE: u32 = 112;
const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;
const ARCFACE_EMBEDDING_DIM: usize = 512;
/// Context kept around the detector box before resizing.
const CROP_MARGIN: f32 = 0.15;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("face box lies outside the frame")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ArcFace-based face recognizer.
pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    /// Load the ArcFace ONNX model from the given path.
    pub fn load(model_path: &Path) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(path = %model_path.display(), "loaded ArcFace model");
        Ok(Self { session })
    }

    /// Extract the encoding of one detected face.
    pub fn extract(
        &mut self,
        image: &GrayImage,
        face: &BoundingBox,
    ) -> Result<Embedding, RecognizerError> {
        let (x, y, side) = square_crop(face, image.width(), image.height())
            .ok_or(RecognizerError::EmptyCrop)?;
        let crop = imageops::crop_imm(image, x, y, side, side).to_image();
        let aligned = imageops::resize(&crop, ARCFACE_INPUT_SIZE, ARCFACE_INPUT_SIZE, FilterType::Triangle);
        let input = preprocess(&aligned);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != ARCFACE_EMBEDDING_DIM {
            return Err(RecognizerError::InferenceFailed(format!(
                "expected {ARCFACE_EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        Ok(Embedding::new(l2_normalize(raw)))
    }
}

/// Square crop `(x, y, side)` centred on the box, grown by the margin and
/// clamped to the frame. `None` if nothing of the box is inside the frame.
fn square_crop(face: &BoundingBox, width: u32, height: u32) -> Option<(u32, u32, u32)> {
    let side = face.width.max(face.height) * (1.0 + 2.0 * CROP_MARGIN);
    let cx = face.x + face.width / 2.0;
    let cy = face.y + face.height / 2.0;

    let x0 = (cx - side / 2.0).max(0.0);
    let y0 = (cy - side / 2.0).max(0.0);
    let x1 = (cx + side / 2.0).min(width as f32);
    let y1 = (cy + side / 2.0).min(height as f32);

    let side = (x1 - x0).min(y1 - y0).floor();
    if side < 1.0 {
        return None;
    }
    Some((x0 as u32, y0 as u32, side as u32))
}

fn preprocess(aligned: &GrayImage) -> Array4<f32> {
    let size = ARCFACE_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for (x, y, pixel) in aligned.enumerate_pixels() {
        let value = (pixel.0[0] as f32 - ARCFACE_MEAN) / ARCFACE_STD;
        for channel in 0..3 {
            tensor[[0, channel, y as usize, x as usize]] = value;
        }
    }

    tensor
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

    #[test]
    fn test_square_crop_inside_frame() {
        let face = BoundingBox { x: 100.0, y: 100.0, width: 40.0, height: 50.0, confidence: 0.9 };
        let (x, y, side) = square_crop(&face, 640, 480).unwrap();
        // side ~ 50 * 1.3, centred on (120, 125)
        assert!((64..=65).contains(&side));
        assert_eq!(x, 87);
        assert_eq!(y, 92);
    }

    #[test]
    fn test_square_crop_clamped_to_edge() {
        let face = BoundingBox { x: -20.0, y: 10.0, width: 60.0, height: 60.0, confidence: 0.9 };
        let (x, _, side) = square_crop(&face, 640, 480).unwrap();
        assert_eq!(x, 0);
        assert!(side < 78);
    }

    #[test]
    fn test_square_crop_outside_frame() {
        let face = BoundingBox { x: 900.0, y: 900.0, width: 30.0, height: 30.0, confidence: 0.9 };
        assert!(square_crop(&face, 640, 480).is_none());
    }

    #[test]
    fn test_preprocess_replicates_channels() {
        let aligned = GrayImage::from_pixel(112, 112, image::Luma([100]));
        let tensor = preprocess(&aligned);
        assert_eq!(tensor.shape(), &[1, 3, 112, 112]);
        let expected = (100.0 - ARCFACE_MEAN) / ARCFACE_STD;
        for channel in 0..3 {
            assert!((tensor[[0, channel, 7, 9]] - expected).abs() < 1e-6);
        }
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }
}
