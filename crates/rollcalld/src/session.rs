//! Streaming session state machine.
//!
//! A session runs on its own OS thread: it pulls frames from the leased
//! pipeline, lets a [`FrameStage`] analyse and draw on them, and pushes
//! JPEG multipart units into an [`OutputSink`]. Stop requests are checked
//! before capture, before hand-off and after hand-off, and interrupt any
//! pacing or back-off sleep.

use crate::annotate;
use crate::mjpeg;
use crate::pipeline::{FramePipeline, PipelineLease};
use crate::stream::OutputSink;
use rollcall_core::AnalyzerError;
use rollcall_hw::{CameraError, Frame};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Consecutive failed iterations after which a session gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Target gap between units, roughly 30 fps.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Sleep after a failed iteration.
pub const ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    Recognition,
    EnrollmentPreview,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Recognition => "recognition",
            SessionKind::EnrollmentPreview => "preview",
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Running,
    Stopping,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("stopped after {0} consecutive frame failures")]
    TooManyFailures(u32),
}

/// Why one loop iteration produced no unit.
#[derive(Error, Debug)]
pub enum FrameFailure {
    #[error("camera unavailable: {0}")]
    Camera(#[from] CameraError),
    #[error("no frame from camera")]
    NoFrame,
    #[error("face analysis failed: {0}")]
    Analysis(#[from] AnalyzerError),
    #[error("jpeg encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Timing and output knobs for the session loop.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub frame_interval: Duration,
    pub error_backoff: Duration,
    pub max_failures: u32,
    pub jpeg_quality: u8,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            frame_interval: FRAME_INTERVAL,
            error_backoff: ERROR_BACKOFF,
            max_failures: MAX_CONSECUTIVE_FAILURES,
            jpeg_quality: 85,
        }
    }
}

/// Per-kind work done on each captured frame.
pub trait FrameStage: Send {
    /// Called once on the session thread before the first frame.
    fn on_start(&mut self) {}

    /// Analyse `frame` and draw the overlay into its image.
    fn process(&mut self, pipeline: &mut FramePipeline, frame: &mut Frame) -> Result<(), FrameFailure>;
}

struct Shared {
    phase: Mutex<SessionPhase>,
    changed: Condvar,
}

/// Control handle for one session. Clones share the same state.
#[derive(Clone)]
pub struct SessionHandle {
    kind: SessionKind,
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub(crate) fn new(kind: SessionKind) -> Self {
        Self {
            kind,
            shared: Arc::new(Shared {
                phase: Mutex::new(SessionPhase::Running),
                changed: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionPhase> {
        self.shared.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn phase(&self) -> SessionPhase {
        *self.lock()
    }

    pub fn is_running(&self) -> bool {
        self.phase() == SessionPhase::Running
    }

    /// Ask the loop to exit. Idempotent; never blocks.
    pub fn stop(&self) {
        let mut phase = self.lock();
        if *phase == SessionPhase::Running {
            *phase = SessionPhase::Stopping;
            self.shared.changed.notify_all();
        }
    }

    /// Wait until the session is idle and the camera released. Returns
    /// `false` if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut phase = self.lock();
        while *phase != SessionPhase::Idle {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            phase = self
                .shared
                .changed
                .wait_timeout(phase, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }

    /// Sleep up to `duration`, waking early if the session stops running.
    fn pause(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut phase = self.lock();
        while *phase == SessionPhase::Running {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            phase = self
                .shared
                .changed
                .wait_timeout(phase, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn mark_idle(&self) {
        *self.lock() = SessionPhase::Idle;
        self.shared.changed.notify_all();
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Run a session for `handle` on a dedicated thread.
///
/// The lease is released (camera stopped) before the handle turns idle,
/// so `wait_idle` returning `true` means the device is free.
pub fn spawn(
    handle: SessionHandle,
    mut lease: PipelineLease,
    mut stage: Box<dyn FrameStage>,
    mut sink: Box<dyn OutputSink>,
    settings: SessionSettings,
) -> std::io::Result<()> {
    let thread_handle = handle.clone();
    let spawned = std::thread::Builder::new()
        .name(format!("rollcall-{}", handle.kind()))
        .spawn(move || {
            let handle = thread_handle;
            tracing::info!(kind = %handle.kind(), "session started");

            let result = run_loop(&handle, &mut lease, stage.as_mut(), sink.as_mut(), &settings);
            drop(lease);

            match &result {
                Ok(()) => tracing::info!(kind = %handle.kind(), "session stopped"),
                Err(e) => tracing::error!(kind = %handle.kind(), error = %e, "session ended with error"),
            }
            sink.finish(result.err());
            handle.mark_idle();
        });

    if let Err(e) = spawned {
        handle.mark_idle();
        return Err(e);
    }
    Ok(())
}

fn run_loop(
    handle: &SessionHandle,
    pipeline: &mut FramePipeline,
    stage: &mut dyn FrameStage,
    sink: &mut dyn OutputSink,
    settings: &SessionSettings,
) -> Result<(), SessionError> {
    stage.on_start();

    let mut failures = 0u32;
    while handle.is_running() {
        match produce_unit(pipeline, stage, settings.jpeg_quality) {
            Ok(unit) => {
                failures = 0;
                if !handle.is_running() {
                    break;
                }
                if sink.send(unit).is_err() {
                    tracing::info!(kind = %handle.kind(), "consumer disconnected");
                    handle.stop();
                    break;
                }
                if !handle.is_running() {
                    break;
                }
                handle.pause(settings.frame_interval);
            }
            Err(failure) => {
                failures += 1;
                tracing::warn!(
                    kind = %handle.kind(),
                    failures,
                    error = %failure,
                    "frame iteration failed"
                );
                if failures >= settings.max_failures {
                    handle.stop();
                    return Err(SessionError::TooManyFailures(failures));
                }
                handle.pause(settings.error_backoff);
            }
        }
    }
    Ok(())
}

fn produce_unit(
    pipeline: &mut FramePipeline,
    stage: &mut dyn FrameStage,
    jpeg_quality: u8,
) -> Result<Vec<u8>, FrameFailure> {
    // No-op while streaming; retries a device that failed to open.
    pipeline.start()?;
    let mut frame = pipeline.next_frame().ok_or(FrameFailure::NoFrame)?;
    stage.process(pipeline, &mut frame)?;
    let jpeg = annotate::encode_jpeg(&frame.image, jpeg_quality)?;
    Ok(mjpeg::frame_unit(&jpeg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineSlot;
    use crate::stream::{self, FrameStream};
    use crate::testing::{face, ScriptedAnalyzer, ScriptedSource, SourceMonitor};
    use std::sync::Arc;

    /// Runs strided detection and draws nothing.
    struct DetectOnly;

    impl FrameStage for DetectOnly {
        fn process(&mut self, pipeline: &mut FramePipeline, frame: &mut Frame) -> Result<(), FrameFailure> {
            pipeline.detect(frame)?;
            Ok(())
        }
    }

    fn fast() -> SessionSettings {
        SessionSettings {
            frame_interval: Duration::from_millis(2),
            error_backoff: Duration::from_millis(2),
            ..SessionSettings::default()
        }
    }

    fn start(
        source: ScriptedSource,
        analyzer: ScriptedAnalyzer,
        settings: SessionSettings,
    ) -> (Arc<PipelineSlot>, SourceMonitor, FrameStream) {
        let camera = source.monitor();
        let slot = PipelineSlot::new(FramePipeline::new(Box::new(source), Box::new(analyzer), 1));
        let lease = slot.acquire(SessionKind::Recognition).unwrap();
        let handle = SessionHandle::new(SessionKind::Recognition);
        let (sink, stream) = stream::channel(handle.clone());
        spawn(handle, lease, Box::new(DetectOnly), Box::new(sink), settings).unwrap();
        (slot, camera, stream)
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_units_are_multipart_jpeg() {
        let (_slot, _camera, mut stream) = start(ScriptedSource::healthy(), ScriptedAnalyzer::empty(), fast());
        let unit = stream.blocking_next_unit().unwrap();

        let head = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";
        assert!(unit.starts_with(head));
        assert_eq!(&unit[head.len()..head.len() + 2], &[0xFF, 0xD8]);
        assert!(unit.ends_with(&[0xFF, 0xD9, b'\r', b'\n']));
    }

    #[test]
    fn test_stop_releases_camera_with_unread_consumer() {
        let (slot, camera, stream) = start(ScriptedSource::healthy(), ScriptedAnalyzer::empty(), fast());
        wait_for(|| camera.captures() > 5);

        // The consumer never reads; its two-slot buffer is long full.
        let handle = stream.handle().clone();
        handle.stop();
        assert!(handle.wait_idle(Duration::from_millis(500)));
        assert!(!camera.is_started());
        assert_eq!(slot.holder(), None);
        drop(stream);
    }

    #[test]
    fn test_stop_interrupts_backoff() {
        let settings = SessionSettings {
            error_backoff: Duration::from_secs(30),
            ..fast()
        };
        let (_slot, camera, stream) = start(ScriptedSource::always_failing(), ScriptedAnalyzer::empty(), settings);
        wait_for(|| camera.captures() == 1);

        let handle = stream.handle().clone();
        handle.stop();
        assert!(handle.wait_idle(Duration::from_millis(500)));
        assert!(stream.take_error().is_none());
    }

    #[test]
    fn test_five_consecutive_failures_end_session_once() {
        let (slot, camera, mut stream) = start(ScriptedSource::always_failing(), ScriptedAnalyzer::empty(), fast());

        assert!(stream.blocking_next_unit().is_none());
        assert!(matches!(stream.take_error(), Some(SessionError::TooManyFailures(5))));
        assert!(stream.take_error().is_none());

        let handle = stream.handle().clone();
        assert!(handle.wait_idle(Duration::from_millis(500)));
        assert_eq!(camera.captures(), 5);
        assert!(!camera.is_started());
        assert_eq!(slot.holder(), None);
    }

    #[test]
    fn test_four_failures_then_recovery() {
        let (_slot, _camera, mut stream) = start(ScriptedSource::failing_first(4), ScriptedAnalyzer::empty(), fast());
        assert!(stream.blocking_next_unit().is_some());
        assert!(stream.take_error().is_none());
    }

    #[test]
    fn test_success_resets_failure_count() {
        // Four failures, one frame, four more failures: never five in a row.
        let source = ScriptedSource::failing_at(&[0, 1, 2, 3, 5, 6, 7, 8]);
        let (_slot, _camera, mut stream) = start(source, ScriptedAnalyzer::empty(), fast());
        assert!(stream.blocking_next_unit().is_some());
        assert!(stream.blocking_next_unit().is_some());
        assert!(stream.take_error().is_none());
    }

    #[test]
    fn test_analysis_failure_counts_as_iteration_failure() {
        let analyzer = ScriptedAnalyzer::failing_first(2, vec![vec![face(5.0)]]);
        let (_slot, _camera, mut stream) = start(ScriptedSource::healthy(), analyzer, fast());
        assert!(stream.blocking_next_unit().is_some());
        assert!(stream.take_error().is_none());
    }

    #[test]
    fn test_empty_frames_are_failures() {
        let (_slot, _camera, mut stream) = start(ScriptedSource::empty_frames(), ScriptedAnalyzer::empty(), fast());
        assert!(stream.blocking_next_unit().is_none());
        assert!(matches!(stream.take_error(), Some(SessionError::TooManyFailures(_))));
    }

    #[test]
    fn test_consumer_disconnect_stops_session() {
        let (slot, camera, mut stream) = start(ScriptedSource::healthy(), ScriptedAnalyzer::empty(), fast());
        stream.blocking_next_unit().unwrap();
        let handle = stream.handle().clone();

        drop(stream);
        assert!(handle.wait_idle(Duration::from_millis(500)));
        assert!(!camera.is_started());
        assert_eq!(slot.holder(), None);
    }

    #[test]
    fn test_busy_camera_is_retried() {
        let (_slot, camera, mut stream) = start(ScriptedSource::busy_first(1), ScriptedAnalyzer::empty(), fast());
        assert!(stream.blocking_next_unit().is_some());
        assert!(stream.take_error().is_none());
        assert_eq!(camera.starts(), 1);
    }

    #[test]
    fn test_four_busy_starts_then_recovery() {
        let (_slot, _camera, mut stream) = start(ScriptedSource::busy_first(4), ScriptedAnalyzer::empty(), fast());
        assert!(stream.blocking_next_unit().is_some());
        assert!(stream.take_error().is_none());
    }

    #[test]
    fn test_unavailable_camera_hits_failure_ceiling() {
        let (slot, camera, mut stream) = start(ScriptedSource::unplugged(), ScriptedAnalyzer::empty(), fast());
        assert!(stream.blocking_next_unit().is_none());
        assert!(matches!(stream.take_error(), Some(SessionError::TooManyFailures(5))));
        assert!(stream.handle().wait_idle(Duration::from_millis(500)));
        assert_eq!(camera.captures(), 0);
        assert_eq!(slot.holder(), None);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let handle = SessionHandle::new(SessionKind::Recognition);
        handle.stop();
        handle.stop();
        assert_eq!(handle.phase(), SessionPhase::Stopping);
        handle.mark_idle();
        handle.stop();
        assert_eq!(handle.phase(), SessionPhase::Idle);
    }

    #[test]
    fn test_wait_idle_times_out_while_running() {
        let handle = SessionHandle::new(SessionKind::EnrollmentPreview);
        assert!(!handle.wait_idle(Duration::from_millis(10)));
    }
}
