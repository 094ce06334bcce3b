//! Frame pipeline: one camera plus one face analyzer, shared by both
//! streaming session kinds through an exclusive slot.

use crate::session::SessionKind;
use image::RgbImage;
use rollcall_core::{AnalyzerError, Detection, FaceAnalyzer};
use rollcall_hw::{CameraError, Frame, FrameSource};
use std::sync::{Arc, Mutex};

pub struct FramePipeline {
    source: Box<dyn FrameSource>,
    analyzer: Box<dyn FaceAnalyzer>,
    process_every: u64,
    /// Frames offered to `detect`; never reset, not even across restarts.
    frame_counter: u64,
    last_detections: Vec<Detection>,
}

impl FramePipeline {
    pub fn new(source: Box<dyn FrameSource>, analyzer: Box<dyn FaceAnalyzer>, process_every: u64) -> Self {
        Self {
            source,
            analyzer,
            process_every: process_every.max(1),
            frame_counter: 0,
            last_detections: Vec::new(),
        }
    }

    /// Start the device. No-op when already streaming.
    pub fn start(&mut self) -> Result<(), CameraError> {
        if self.source.is_started() {
            return Ok(());
        }
        self.source.start()?;
        tracing::info!("camera started");
        Ok(())
    }

    /// Stop the device. No-op when already stopped.
    pub fn stop(&mut self) {
        if self.source.is_started() {
            self.source.stop();
            tracing::info!("camera stopped");
        }
    }

    pub fn is_started(&self) -> bool {
        self.source.is_started()
    }

    /// Grab the next frame. Capture failures and empty buffers come back as `None`.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if !self.source.is_started() {
            tracing::debug!("frame requested from stopped camera");
            return None;
        }
        match self.source.capture() {
            Ok(frame) if frame.is_empty() => {
                tracing::warn!(sequence = frame.sequence, "camera returned an empty frame");
                None
            }
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!(error = %e, "frame capture failed");
                None
            }
        }
    }

    /// Strided detection for recognition.
    ///
    /// Every `process_every`th frame is analysed and its detections cached;
    /// other frames get the cached detections from the last analysed frame.
    /// A failed analysis leaves the counter and cache untouched, so the
    /// next frame retries.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, AnalyzerError> {
        if self.frame_counter % self.process_every == 0 {
            self.last_detections = self.analyzer.analyze(&frame.image)?;
        }
        self.frame_counter += 1;
        Ok(self.last_detections.clone())
    }

    /// Analyse this frame regardless of stride. Used by the enrollment preview.
    pub fn analyze_now(&mut self, frame: &Frame) -> Result<Vec<Detection>, AnalyzerError> {
        self.analyze_image(&frame.image)
    }

    /// Analyse an image that did not come from the camera.
    pub fn analyze_image(&mut self, image: &RgbImage) -> Result<Vec<Detection>, AnalyzerError> {
        self.analyzer.analyze(image)
    }

    #[cfg(test)]
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("camera held by the {held_by} session")]
pub struct SlotBusy {
    pub held_by: SessionKind,
}

struct SlotState {
    pipeline: Option<FramePipeline>,
    holder: Option<SessionKind>,
}

/// Owner of the single pipeline. At most one session holds it at a time.
pub struct PipelineSlot {
    state: Mutex<SlotState>,
}

impl PipelineSlot {
    pub fn new(pipeline: FramePipeline) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SlotState {
                pipeline: Some(pipeline),
                holder: None,
            }),
        })
    }

    /// Take the pipeline for `kind`, failing fast if another session has it.
    pub fn acquire(self: &Arc<Self>, kind: SessionKind) -> Result<PipelineLease, SlotBusy> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.pipeline.take() {
            Some(pipeline) => {
                state.holder = Some(kind);
                Ok(PipelineLease {
                    pipeline: Some(pipeline),
                    slot: Arc::clone(self),
                })
            }
            None => Err(SlotBusy {
                // holder is always set while the pipeline is out
                held_by: state.holder.unwrap_or(kind),
            }),
        }
    }

    /// The session kind currently holding the pipeline.
    pub fn holder(&self) -> Option<SessionKind> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).holder
    }

    /// Whether the camera is streaming. `None` while a session holds the pipeline.
    pub fn camera_started(&self) -> Option<bool> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pipeline.as_ref().map(FramePipeline::is_started)
    }

    fn put_back(&self, mut pipeline: FramePipeline) {
        pipeline.stop();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.pipeline = Some(pipeline);
        state.holder = None;
    }
}

/// Exclusive use of the pipeline. Dropping it stops the camera and
/// returns the pipeline to its slot.
pub struct PipelineLease {
    pipeline: Option<FramePipeline>,
    slot: Arc<PipelineSlot>,
}

impl std::ops::Deref for PipelineLease {
    type Target = FramePipeline;

    fn deref(&self) -> &FramePipeline {
        self.pipeline.as_ref().expect("pipeline present until drop")
    }
}

impl std::ops::DerefMut for PipelineLease {
    fn deref_mut(&mut self) -> &mut FramePipeline {
        self.pipeline.as_mut().expect("pipeline present until drop")
    }
}

impl Drop for PipelineLease {
    fn drop(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            self.slot.put_back(pipeline);
        }
    }
}
