//! Enrollment preview stage and single-shot enrollment capture.
//!
//! The preview analyses every frame and grades each face by capture
//! quality. While it runs it also serves capture requests, so an
//! enrollment photo is taken from the frame the user is looking at.

use crate::annotate::{self, Overlay};
use crate::pipeline::FramePipeline;
use crate::session::{FrameFailure, FrameStage, SessionKind};
use image::ImageError;
use rollcall_core::quality::{capture_quality, largest_face};
use rollcall_core::{AnalyzerError, BoundingBox, Detection, Embedding};
use rollcall_hw::Frame;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Frames tried by a standalone capture before giving up on finding a face.
pub const CAPTURE_ATTEMPTS: usize = 10;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no face detected")]
    NoFace,
    #[error("camera unavailable: {0}")]
    Camera(String),
    #[error("camera held by the {0} session")]
    Busy(SessionKind),
    #[error("preview ended before the capture was taken")]
    PreviewEnded,
    #[error("face analysis failed: {0}")]
    Analysis(#[from] AnalyzerError),
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] ImageError),
}

/// One enrollment sample: the largest face in a frame.
#[derive(Debug, Clone)]
pub struct EnrollmentCapture {
    pub embedding: Embedding,
    pub quality: f32,
    pub bbox: BoundingBox,
    /// The frame with the chosen face boxed and graded.
    pub jpeg: Vec<u8>,
}

pub type CaptureReply = oneshot::Sender<Result<EnrollmentCapture, CaptureError>>;

/// Build a capture from an analysed frame, picking the largest face.
pub fn capture_from(
    frame: &Frame,
    detections: &[Detection],
    overlay: &Overlay,
    jpeg_quality: u8,
) -> Result<EnrollmentCapture, CaptureError> {
    let face = largest_face(detections).ok_or(CaptureError::NoFace)?;
    let quality = capture_quality(&face.bbox, frame.width(), frame.height());

    let mut image = frame.image.clone();
    overlay.quality_box(&mut image, &face.bbox, quality);
    let jpeg = annotate::encode_jpeg(&image, jpeg_quality)?;

    tracing::info!(
        quality,
        confidence = face.confidence(),
        faces = detections.len(),
        "enrollment frame captured"
    );

    Ok(EnrollmentCapture {
        embedding: face.embedding.clone(),
        quality,
        bbox: face.bbox.clone(),
        jpeg,
    })
}

/// Capture without a running preview: start the camera, try up to
/// `attempts` frames until one has a face.
pub fn capture_standalone(
    pipeline: &mut FramePipeline,
    overlay: &Overlay,
    jpeg_quality: u8,
    attempts: usize,
) -> Result<EnrollmentCapture, CaptureError> {
    pipeline
        .start()
        .map_err(|e| CaptureError::Camera(e.to_string()))?;

    let mut last_error = CaptureError::NoFace;
    for _ in 0..attempts {
        let Some(frame) = pipeline.next_frame() else {
            continue;
        };
        match pipeline
            .analyze_now(&frame)
            .map_err(CaptureError::from)
            .and_then(|detections| capture_from(&frame, &detections, overlay, jpeg_quality))
        {
            Ok(capture) => return Ok(capture),
            Err(e) => last_error = e,
        }
    }
    Err(last_error)
}

pub struct PreviewStage {
    overlay: Arc<Overlay>,
    jpeg_quality: u8,
    requests: mpsc::UnboundedReceiver<CaptureReply>,
}

impl PreviewStage {
    pub fn new(overlay: Arc<Overlay>, jpeg_quality: u8, requests: mpsc::UnboundedReceiver<CaptureReply>) -> Self {
        Self {
            overlay,
            jpeg_quality,
            requests,
        }
    }
}

impl FrameStage for PreviewStage {
    fn on_start(&mut self) {
        tracing::info!("enrollment preview running");
    }

    fn process(&mut self, pipeline: &mut FramePipeline, frame: &mut Frame) -> Result<(), FrameFailure> {
        let detections = pipeline.analyze_now(frame)?;

        // Serve pending captures from the clean frame, before drawing.
        while let Ok(reply) = self.requests.try_recv() {
            let _ = reply.send(capture_from(frame, &detections, &self.overlay, self.jpeg_quality));
        }

        let (width, height) = (frame.width(), frame.height());
        for detection in &detections {
            let quality = capture_quality(&detection.bbox, width, height);
            self.overlay.quality_box(&mut frame.image, &detection.bbox, quality);
        }
        self.overlay.preview_header(&mut frame.image, detections.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{face, face_with, ScriptedAnalyzer, ScriptedSource, FRAME_HEIGHT, FRAME_WIDTH};
    use image::{Rgb, RgbImage};

    fn pipeline(analyzer: ScriptedAnalyzer) -> FramePipeline {
        FramePipeline::new(Box::new(ScriptedSource::healthy()), Box::new(analyzer), 4)
    }

    fn frame() -> Frame {
        Frame::new(RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Rgb([90, 90, 90])), 1)
    }

    #[test]
    fn test_capture_picks_largest_face() {
        let mut big = face_with(30.0, vec![2.0; 4]);
        big.bbox.width = 30.0;
        big.bbox.height = 30.0;
        let detections = vec![face(2.0), big];

        let capture = capture_from(&frame(), &detections, &Overlay::boxes_only(), 85).unwrap();
        assert_eq!(capture.embedding.values, vec![2.0; 4]);
        assert_eq!(capture.bbox.x, 30.0);
        assert_eq!(&capture.jpeg[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_capture_quality_score() {
        // 20x24 face in a 64x48 frame: ratio 0.156, size quality 0.304
        let capture = capture_from(&frame(), &[face(0.0)], &Overlay::boxes_only(), 85).unwrap();
        let expected = ((480.0 / 3072.0 - 0.05) / 0.35) * 0.5 + 0.9 * 0.5;
        assert!((capture.quality - expected).abs() < 1e-5);
    }

    #[test]
    fn test_capture_without_face_is_error() {
        let result = capture_from(&frame(), &[], &Overlay::boxes_only(), 85);
        assert!(matches!(result, Err(CaptureError::NoFace)));
    }

    #[test]
    fn test_standalone_capture_retries_until_face() {
        let analyzer = ScriptedAnalyzer::sequence(vec![vec![], vec![], vec![face(5.0)]]);
        let mut pipeline = pipeline(analyzer);
        let capture = capture_standalone(&mut pipeline, &Overlay::boxes_only(), 85, CAPTURE_ATTEMPTS).unwrap();
        assert_eq!(capture.bbox.x, 5.0);
    }

    #[test]
    fn test_standalone_capture_gives_up() {
        let mut pipeline = pipeline(ScriptedAnalyzer::empty());
        let result = capture_standalone(&mut pipeline, &Overlay::boxes_only(), 85, 3);
        assert!(matches!(result, Err(CaptureError::NoFace)));
    }

    #[test]
    fn test_standalone_capture_camera_failure() {
        let mut pipeline = FramePipeline::new(
            Box::new(ScriptedSource::unplugged()),
            Box::new(ScriptedAnalyzer::empty()),
            1,
        );
        let result = capture_standalone(&mut pipeline, &Overlay::boxes_only(), 85, 3);
        assert!(matches!(result, Err(CaptureError::Camera(_))));
    }

    #[test]
    fn test_preview_analyses_every_frame() {
        let analyzer = ScriptedAnalyzer::always(vec![face(4.0)]);
        let calls = analyzer.calls();
        let mut pipeline = pipeline(analyzer);
        pipeline.start().unwrap();
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut stage = PreviewStage::new(Arc::new(Overlay::boxes_only()), 85, rx);

        for _ in 0..3 {
            let mut frame = pipeline.next_frame().unwrap();
            stage.process(&mut pipeline, &mut frame).unwrap();
        }
        // stride of 4 does not apply to the preview
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_preview_draws_quality_color() {
        // confidence 0.9 alone gives 0.45 + size term > 0.5: OK band
        let mut pipeline = pipeline(ScriptedAnalyzer::always(vec![face(4.0)]));
        pipeline.start().unwrap();
        let (_tx, rx) = mpsc::unbounded_channel();
        let mut stage = PreviewStage::new(Arc::new(Overlay::boxes_only()), 85, rx);

        let mut frame = pipeline.next_frame().unwrap();
        stage.process(&mut pipeline, &mut frame).unwrap();
        assert_eq!(*frame.image.get_pixel(4, 10), Rgb([255, 165, 0]));
    }

    #[test]
    fn test_preview_serves_capture_request_from_clean_frame() {
        let mut pipeline = pipeline(ScriptedAnalyzer::always(vec![face(4.0)]));
        pipeline.start().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut stage = PreviewStage::new(Arc::new(Overlay::boxes_only()), 85, rx);

        let (reply, mut answer) = oneshot::channel();
        tx.send(reply).unwrap();
        let mut frame = pipeline.next_frame().unwrap();
        stage.process(&mut pipeline, &mut frame).unwrap();

        let capture = answer.try_recv().unwrap().unwrap();
        assert_eq!(capture.embedding.values, vec![4.0; 4]);
    }

    #[test]
    fn test_dropped_stage_fails_pending_request() {
        let (tx, rx) = mpsc::unbounded_channel();
        let stage = PreviewStage::new(Arc::new(Overlay::boxes_only()), 85, rx);
        let (reply, mut answer) = oneshot::channel();
        tx.send(reply).unwrap();
        drop(stage);
        assert!(answer.try_recv().is_err());
    }
}
