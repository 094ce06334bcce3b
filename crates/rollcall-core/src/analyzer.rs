//! The face-analysis capability: image in, detections with embeddings out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::Detection;
use image::RgbImage;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Detect every face in a frame and embed it.
///
/// Implementations may hold inference sessions, hence `&mut self`.
pub trait FaceAnalyzer: Send {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<Detection>, AnalyzerError>;
}

/// SCRFD detection followed by ArcFace embedding of each face.
pub struct InsightFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl InsightFaceAnalyzer {
    pub fn load(detector_path: &str, recognizer_path: &str, detection_size: usize) -> Result<Self, AnalyzerError> {
        Ok(Self {
            detector: FaceDetector::load(detector_path, detection_size)?,
            recognizer: FaceRecognizer::load(recognizer_path)?,
        })
    }
}

impl FaceAnalyzer for InsightFaceAnalyzer {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<Detection>, AnalyzerError> {
        let boxes = self.detector.detect(image)?;
        let mut detections = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            match self.recognizer.extract(image, &bbox) {
                Ok(embedding) => detections.push(Detection { bbox, embedding }),
                // A face without landmarks cannot be aligned; drop it, keep the rest.
                Err(RecognizerError::NoLandmarks) => {
                    tracing::debug!(confidence = bbox.confidence, "face without landmarks skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(detections)
    }
}
