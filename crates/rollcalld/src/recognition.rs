//! Recognition stage: match every detected face, mark attendance, draw.

use crate::annotate::{FpsMeter, Overlay};
use crate::pipeline::FramePipeline;
use crate::session::{FrameFailure, FrameStage};
use rollcall_core::{AttendanceGate, EmbeddingStore, Matcher, SessionId};
use rollcall_hw::Frame;
use std::sync::Arc;

pub struct RecognitionStage {
    store: Arc<EmbeddingStore>,
    matcher: Arc<dyn Matcher>,
    threshold: f32,
    gate: AttendanceGate,
    /// Attendance is offered only when auto-marking and a session is set.
    attendance_session: Option<SessionId>,
    overlay: Arc<Overlay>,
    fps: FpsMeter,
}

impl RecognitionStage {
    pub fn new(
        store: Arc<EmbeddingStore>,
        matcher: Arc<dyn Matcher>,
        threshold: f32,
        gate: AttendanceGate,
        attendance_session: Option<SessionId>,
        overlay: Arc<Overlay>,
    ) -> Self {
        Self {
            store,
            matcher,
            threshold,
            gate,
            attendance_session,
            overlay,
            fps: FpsMeter::new(),
        }
    }
}

impl FrameStage for RecognitionStage {
    fn on_start(&mut self) {
        self.gate.reset();
        self.fps.reset();
        tracing::info!(
            known = self.store.len(),
            threshold = self.threshold,
            attendance_session = ?self.attendance_session,
            "recognition running"
        );
    }

    fn process(&mut self, pipeline: &mut FramePipeline, frame: &mut Frame) -> Result<(), FrameFailure> {
        let detections = pipeline.detect(frame)?;
        let known = self.store.snapshot();

        for detection in &detections {
            let result = match self.matcher.best_match(&detection.embedding, &known, self.threshold) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(error = %e, "face skipped: cannot match");
                    continue;
                }
            };

            if let (Some(identity_id), Some(session_id)) = (result.identity_id, self.attendance_session) {
                self.gate.offer(identity_id, result.distance, session_id);
            }

            self.overlay.match_box(
                &mut frame.image,
                &detection.bbox,
                &result.display_name,
                result.distance,
                result.is_known(),
            );
        }

        let fps = self.fps.tick();
        self.overlay.recognition_header(&mut frame.image, self.threshold, fps);
        Ok(())
    }
}
