//! Service facade: owns the shared pipeline slot and the two session kinds.
//!
//! Starting a kind that is already running is refused as a no-op; starting
//! while the other kind holds the camera fails fast.

use crate::annotate::Overlay;
use crate::pipeline::{FramePipeline, PipelineSlot};
use crate::preview::{self, CaptureError, CaptureReply, EnrollmentCapture, PreviewStage};
use crate::recognition::RecognitionStage;
use crate::session::{self, FrameStage, SessionHandle, SessionKind, SessionPhase, SessionSettings};
use crate::stream::{self, FrameStream};
use rollcall_core::{AttendanceGate, AttendanceSink, Clock, EmbeddingStore, Matcher, SessionId, StoreError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// How long a start waits for a stopping session of the same kind to wind down.
const STOPPING_GRACE: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0} stream already running")]
    AlreadyRunning(SessionKind),
    #[error("camera held by the {held_by} session")]
    DeviceBusy { held_by: SessionKind },
    #[error("could not spawn session thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("embedding reload failed: {0}")]
    Store(#[from] StoreError),
    #[error("enrollment capture failed: {0}")]
    Capture(#[from] CaptureError),
}

/// Tunables fixed at daemon start.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub threshold: f32,
    pub cooldown_minutes: u32,
    pub auto_mark: bool,
    pub session: SessionSettings,
}

pub struct ServiceParts {
    pub slot: Arc<PipelineSlot>,
    pub store: Arc<EmbeddingStore>,
    pub matcher: Arc<dyn Matcher>,
    pub sink: Arc<dyn AttendanceSink>,
    pub clock: Arc<dyn Clock>,
    pub overlay: Arc<Overlay>,
    pub settings: ServiceSettings,
}

struct ActivePreview {
    handle: SessionHandle,
    captures: mpsc::UnboundedSender<CaptureReply>,
}

pub struct RollcallService {
    slot: Arc<PipelineSlot>,
    store: Arc<EmbeddingStore>,
    matcher: Arc<dyn Matcher>,
    sink: Arc<dyn AttendanceSink>,
    clock: Arc<dyn Clock>,
    overlay: Arc<Overlay>,
    settings: ServiceSettings,
    attendance_session: Mutex<Option<SessionId>>,
    recognition: Mutex<Option<SessionHandle>>,
    preview: Mutex<Option<ActivePreview>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Refuse a start while `current` has not wound down. Never waits.
fn ensure_idle(kind: SessionKind, current: Option<&SessionHandle>) -> Result<(), ServiceError> {
    match current.map(SessionHandle::phase) {
        Some(SessionPhase::Running) => Err(ServiceError::AlreadyRunning(kind)),
        Some(SessionPhase::Stopping) => Err(ServiceError::DeviceBusy { held_by: kind }),
        Some(SessionPhase::Idle) | None => Ok(()),
    }
}

impl RollcallService {
    pub fn new(parts: ServiceParts) -> Self {
        Self {
            slot: parts.slot,
            store: parts.store,
            matcher: parts.matcher,
            sink: parts.sink,
            clock: parts.clock,
            overlay: parts.overlay,
            settings: parts.settings,
            attendance_session: Mutex::new(None),
            recognition: Mutex::new(None),
            preview: Mutex::new(None),
        }
    }

    fn launch(&self, kind: SessionKind, stage: Box<dyn FrameStage>) -> Result<(SessionHandle, FrameStream), ServiceError> {
        let lease = self
            .slot
            .acquire(kind)
            .map_err(|busy| ServiceError::DeviceBusy { held_by: busy.held_by })?;
        let handle = SessionHandle::new(kind);
        let (sink, stream) = stream::channel(handle.clone());
        session::spawn(handle.clone(), lease, stage, Box::new(sink), self.settings.session.clone())?;
        Ok((handle, stream))
    }

    /// Start the recognition stream. May block briefly if a previous
    /// recognition session is still stopping.
    pub fn start_recognition(&self) -> Result<FrameStream, ServiceError> {
        self.settle(SessionKind::Recognition)?;
        let mut current = lock(&self.recognition);
        ensure_idle(SessionKind::Recognition, current.as_ref())?;

        let attendance_session = if self.settings.auto_mark {
            *lock(&self.attendance_session)
        } else {
            None
        };
        let gate = AttendanceGate::new(
            Arc::clone(&self.sink),
            Arc::clone(&self.clock),
            self.settings.cooldown_minutes,
        );
        let stage = RecognitionStage::new(
            Arc::clone(&self.store),
            Arc::clone(&self.matcher),
            self.settings.threshold,
            gate,
            attendance_session,
            Arc::clone(&self.overlay),
        );

        let (handle, stream) = self.launch(SessionKind::Recognition, Box::new(stage))?;
        *current = Some(handle);
        Ok(stream)
    }

    /// Start the enrollment preview stream.
    pub fn start_preview(&self) -> Result<FrameStream, ServiceError> {
        self.settle(SessionKind::EnrollmentPreview)?;
        let mut current = lock(&self.preview);
        ensure_idle(SessionKind::EnrollmentPreview, current.as_ref().map(|p| &p.handle))?;

        let (captures, requests) = mpsc::unbounded_channel();
        let stage = PreviewStage::new(Arc::clone(&self.overlay), self.settings.session.jpeg_quality, requests);

        let (handle, stream) = self.launch(SessionKind::EnrollmentPreview, Box::new(stage))?;
        *current = Some(ActivePreview { handle, captures });
        Ok(stream)
    }

    pub fn start(&self, kind: SessionKind) -> Result<FrameStream, ServiceError> {
        match kind {
            SessionKind::Recognition => self.start_recognition(),
            SessionKind::EnrollmentPreview => self.start_preview(),
        }
    }

    fn current_handle(&self, kind: SessionKind) -> Option<SessionHandle> {
        match kind {
            SessionKind::Recognition => lock(&self.recognition).clone(),
            SessionKind::EnrollmentPreview => lock(&self.preview).as_ref().map(|p| p.handle.clone()),
        }
    }

    /// Refuse a running session of `kind`; wait out one that is stopping.
    /// The session locks are not held while waiting.
    fn settle(&self, kind: SessionKind) -> Result<(), ServiceError> {
        let Some(handle) = self.current_handle(kind) else {
            return Ok(());
        };
        match handle.phase() {
            SessionPhase::Running => Err(ServiceError::AlreadyRunning(kind)),
            SessionPhase::Stopping if !handle.wait_idle(STOPPING_GRACE) => {
                Err(ServiceError::DeviceBusy { held_by: kind })
            }
            _ => Ok(()),
        }
    }

    /// Request stop. Returns whether a session of that kind was running.
    pub fn stop(&self, kind: SessionKind) -> bool {
        match self.current_handle(kind) {
            Some(handle) if handle.is_running() => {
                handle.stop();
                tracing::info!(kind = %kind, "stop requested");
                true
            }
            _ => false,
        }
    }

    pub fn phase(&self, kind: SessionKind) -> SessionPhase {
        self.current_handle(kind).map_or(SessionPhase::Idle, |h| h.phase())
    }

    /// Stop both kinds and wait for the camera to be released.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let handles: Vec<SessionHandle> = lock(&self.recognition)
            .iter()
            .cloned()
            .chain(lock(&self.preview).as_ref().map(|p| p.handle.clone()))
            .collect();
        for handle in &handles {
            handle.stop();
        }
        handles.iter().all(|h| h.wait_idle(timeout))
    }

    /// Re-read enrolled embeddings. Running sessions see the new set on their next frame.
    pub fn reload_embeddings(&self) -> Result<usize, ServiceError> {
        Ok(self.store.load()?)
    }

    /// Attendance session used by recognition streams started from now on.
    pub fn set_attendance_session(&self, session_id: Option<SessionId>) {
        *lock(&self.attendance_session) = session_id;
        tracing::info!(?session_id, "attendance session set");
    }

    pub fn attendance_session(&self) -> Option<SessionId> {
        *lock(&self.attendance_session)
    }

    /// Capture one enrollment sample. Served by the preview when it runs,
    /// otherwise the camera is used directly.
    pub async fn capture_enrollment(self: Arc<Self>) -> Result<EnrollmentCapture, ServiceError> {
        let preview_requests = lock(&self.preview)
            .as_ref()
            .filter(|p| p.handle.is_running())
            .map(|p| p.captures.clone());

        if let Some(requests) = preview_requests {
            let (reply, answer) = oneshot::channel();
            requests.send(reply).map_err(|_| CaptureError::PreviewEnded)?;
            return Ok(answer.await.map_err(|_| CaptureError::PreviewEnded)??);
        }

        let mut lease = self
            .slot
            .acquire(SessionKind::EnrollmentPreview)
            .map_err(|busy| CaptureError::Busy(busy.held_by))?;
        let service = Arc::clone(&self);
        tokio::task::spawn_blocking(move || {
            preview::capture_standalone(
                &mut lease,
                &service.overlay,
                service.settings.session.jpeg_quality,
                preview::CAPTURE_ATTEMPTS,
            )
        })
        .await
        .map_err(|e| ServiceError::Spawn(std::io::Error::other(e)))?
        .map_err(ServiceError::from)
    }

    /// Run `f` with exclusive use of the pipeline, outside any stream.
    /// Refused while a session holds the camera.
    pub fn with_pipeline<T>(&self, f: impl FnOnce(&mut FramePipeline) -> T) -> Result<T, ServiceError> {
        let mut lease = self
            .slot
            .acquire(SessionKind::EnrollmentPreview)
            .map_err(|busy| ServiceError::DeviceBusy { held_by: busy.held_by })?;
        Ok(f(&mut *lease))
    }

    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "recognition": phase_name(self.phase(SessionKind::Recognition)),
            "preview": phase_name(self.phase(SessionKind::EnrollmentPreview)),
            "camera_holder": self.slot.holder().map(SessionKind::as_str),
            "camera_streaming": self.slot.camera_started(),
            "known_embeddings": self.store.len(),
            "attendance_session": self.attendance_session(),
            "auto_mark": self.settings.auto_mark,
            "threshold": self.settings.threshold,
            "overlay_text": self.overlay.has_text(),
        })
    }
}

fn phase_name(phase: SessionPhase) -> &'static str {
    match phase {
        SessionPhase::Idle => "idle",
        SessionPhase::Running => "running",
        SessionPhase::Stopping => "stopping",
    }
}
