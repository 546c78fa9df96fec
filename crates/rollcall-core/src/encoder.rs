//! Face encoding oracle and per-frame classification.
//!
//! The rest of the crate only sees [`FaceEncoder`]: an image goes in, one
//! bounding box plus encoding per detected face comes out. [`OnnxEncoder`]
//! is the production implementation (SCRFD + ArcFace).

use crate::detector::{DetectorError, FaceDetector};
use crate::matcher::Matcher;
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{BoundingBox, Embedding, FaceRecord, Identity};
use image::imageops::{self, FilterType};
use image::GrayImage;
use std::borrow::Cow;
use std::path::Path;
use thiserror::Error;

/// Scale applied to live frames before classification.
pub const DEFAULT_CLASSIFY_SCALE: f32 = 0.25;

pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// A face found in an image together with its encoding.
#[derive(Debug, Clone)]
pub struct EncodedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Maps an image to one encoding per detected face, most confident first.
pub trait FaceEncoder {
    fn encode(&mut self, image: &GrayImage) -> Result<Vec<EncodedFace>, EncoderError>;
}

impl<E: FaceEncoder + ?Sized> FaceEncoder for Box<E> {
    fn encode(&mut self, image: &GrayImage) -> Result<Vec<EncodedFace>, EncoderError> {
        (**self).encode(image)
    }
}

/// SCRFD detection followed by ArcFace encoding of every detected face.
pub struct OnnxEncoder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEncoder {
    /// Load both models from `model_dir`.
    pub fn load(model_dir: &Path) -> Result<Self, EncoderError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceEncoder for OnnxEncoder {
    fn encode(&mut self, image: &GrayImage) -> Result<Vec<EncodedFace>, EncoderError> {
        let boxes = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            match self.recognizer.extract(image, &bbox) {
                Ok(embedding) => faces.push(EncodedFace { bbox, embedding }),
                // Boxes hanging off the frame edge have nothing to encode.
                Err(RecognizerError::EmptyCrop) => {
                    tracing::debug!(?bbox, "skipping face outside frame");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(faces)
    }
}

/// Identity and face boxes for one live frame.
#[derive(Debug, Clone, Default)]
pub struct FrameClassification {
    pub identity: Identity,
    /// Best gallery distance of the face that produced `identity`, or of the
    /// last face seen when nobody was recognized.
    pub distance: Option<f32>,
    /// Face boxes in full-resolution frame coordinates.
    pub boxes: Vec<BoundingBox>,
}

/// Classify every face in a frame, working on a copy downscaled by `scale`.
///
/// The frame is attributed to the last face whose nearest gallery entry
/// passes the threshold. Boxes are mapped back by `1 / scale`.
pub fn classify_frame<E, M>(
    encoder: &mut E,
    matcher: &M,
    image: &GrayImage,
    gallery: &[FaceRecord],
    scale: f32,
) -> Result<FrameClassification, EncoderError>
where
    E: FaceEncoder + ?Sized,
    M: Matcher + ?Sized,
{
    let (small, applied) = downscale(image, scale);
    let faces = encoder.encode(&small)?;

    let mut result = FrameClassification::default();
    for face in &faces {
        let outcome = matcher.classify(&face.embedding, gallery);
        if outcome.identity.is_known() || !result.identity.is_known() {
            result.distance = outcome.distance;
        }
        if outcome.identity.is_known() {
            result.identity = outcome.identity;
        }
    }
    result.boxes = faces.iter().map(|f| f.bbox.scaled(1.0 / applied)).collect();

    Ok(result)
}

/// Downscale by `scale`, returning the image and the factor actually applied.
///
/// Factors outside `(0, 1)` leave the image untouched.
pub fn downscale(image: &GrayImage, scale: f32) -> (Cow<'_, GrayImage>, f32) {
    if !(scale > 0.0 && scale < 1.0) {
        return (Cow::Borrowed(image), 1.0);
    }
    let width = ((image.width() as f32 * scale).round() as u32).max(1);
    let height = ((image.height() as f32 * scale).round() as u32).max(1);
    let resized = imageops::resize(image, width, height, FilterType::Triangle);
    (Cow::Owned(resized), scale)
}
