//! Capture-quality heuristic for enrollment photos.
//!
//! Half of the score comes from how much of the frame the face fills
//! (ideal band 5%–40%), half from the detector's confidence.

use crate::types::{BoundingBox, Detection};

const MIN_FACE_RATIO: f32 = 0.05;
const FACE_RATIO_SPAN: f32 = 0.35;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityBand {
    Good,
    Ok,
    Poor,
}

impl QualityBand {
    pub fn from_score(score: f32) -> Self {
        if score > 0.7 {
            QualityBand::Good
        } else if score > 0.5 {
            QualityBand::Ok
        } else {
            QualityBand::Poor
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            QualityBand::Good => "GOOD",
            QualityBand::Ok => "OK",
            QualityBand::Poor => "POOR",
        }
    }
}

/// Quality score in [0, 1] for a face inside a `frame_width` × `frame_height` frame.
pub fn capture_quality(face: &BoundingBox, frame_width: u32, frame_height: u32) -> f32 {
    let frame_area = frame_width as f32 * frame_height as f32;
    if frame_area <= 0.0 {
        return 0.0;
    }
    let size_ratio = face.area() / frame_area;
    let size_quality = ((size_ratio - MIN_FACE_RATIO) / FACE_RATIO_SPAN).clamp(0.0, 1.0);
    size_quality * 0.5 + face.confidence.clamp(0.0, 1.0) * 0.5
}

/// The detection with the largest box; first one wins on equal area.
pub fn largest_face(detections: &[Detection]) -> Option<&Detection> {
    detections.iter().fold(None, |best: Option<&Detection>, d| match best {
        Some(b) if b.bbox.area() >= d.bbox.area() => Some(b),
        _ => Some(d),
    })
}
