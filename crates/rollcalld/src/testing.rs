//! Scripted camera, analyzer and attendance fakes shared by the unit tests.

use chrono::{TimeDelta, Utc};
use image::{Rgb, RgbImage};
use rollcall_core::detector::DetectorError;
use rollcall_core::{
    AnalyzerError, AttendanceRecord, AttendanceSink, BoundingBox, Clock, Detection, Embedding, FaceAnalyzer,
    IdentityId, ManualClock, SessionId, SinkError,
};
use rollcall_hw::{CameraError, Frame, FrameSource};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const FRAME_WIDTH: u32 = 64;
pub const FRAME_HEIGHT: u32 = 48;

/// Observes a [`ScriptedSource`] after it has been boxed into a pipeline.
#[derive(Clone, Default)]
pub struct SourceMonitor {
    started: Arc<AtomicBool>,
    starts: Arc<AtomicUsize>,
    stops: Arc<AtomicUsize>,
    captures: Arc<AtomicUsize>,
}

impl SourceMonitor {
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy)]
enum Capture {
    Ok,
    Fail,
    Empty,
}

pub struct ScriptedSource {
    monitor: SourceMonitor,
    script: VecDeque<Capture>,
    after_script: Capture,
    start_failures: usize,
    sequence: u32,
}

impl ScriptedSource {
    fn with(script: Vec<Capture>, after_script: Capture) -> Self {
        Self {
            monitor: SourceMonitor::default(),
            script: script.into(),
            after_script,
            start_failures: 0,
            sequence: 0,
        }
    }

    pub fn healthy() -> Self {
        Self::with(Vec::new(), Capture::Ok)
    }

    /// `n` failed captures, then healthy frames.
    pub fn failing_first(n: usize) -> Self {
        Self::with(vec![Capture::Fail; n], Capture::Ok)
    }

    pub fn always_failing() -> Self {
        Self::with(Vec::new(), Capture::Fail)
    }

    pub fn empty_frames() -> Self {
        Self::with(Vec::new(), Capture::Empty)
    }

    /// Failures at the given zero-based capture indices, healthy otherwise.
    pub fn failing_at(indices: &[usize]) -> Self {
        let len = indices.iter().max().map_or(0, |m| m + 1);
        let script = (0..len)
            .map(|i| if indices.contains(&i) { Capture::Fail } else { Capture::Ok })
            .collect();
        Self::with(script, Capture::Ok)
    }

    pub fn unplugged() -> Self {
        let mut source = Self::healthy();
        source.start_failures = usize::MAX;
        source
    }

    /// Device reports busy on the first `n` starts, then streams normally.
    pub fn busy_first(n: usize) -> Self {
        let mut source = Self::healthy();
        source.start_failures = n;
        source
    }

    pub fn monitor(&self) -> SourceMonitor {
        self.monitor.clone()
    }
}

impl FrameSource for ScriptedSource {
    fn start(&mut self) -> Result<(), CameraError> {
        if self.start_failures == usize::MAX {
            return Err(CameraError::DeviceNotFound("/dev/video9".into()));
        }
        if self.start_failures > 0 {
            self.start_failures -= 1;
            return Err(CameraError::DeviceBusy);
        }
        self.monitor.started.store(true, Ordering::SeqCst);
        self.monitor.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) {
        self.monitor.started.store(false, Ordering::SeqCst);
        self.monitor.stops.fetch_add(1, Ordering::SeqCst);
    }

    fn is_started(&self) -> bool {
        self.monitor.is_started()
    }

    fn capture(&mut self) -> Result<Frame, CameraError> {
        self.monitor.captures.fetch_add(1, Ordering::SeqCst);
        self.sequence += 1;
        match self.script.pop_front().unwrap_or(self.after_script) {
            Capture::Ok => Ok(Frame::new(
                RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, Rgb([90, 90, 90])),
                self.sequence,
            )),
            Capture::Empty => Ok(Frame::new(RgbImage::new(0, 0), self.sequence)),
            Capture::Fail => Err(CameraError::CaptureFailed("dequeue timed out".into())),
        }
    }
}

/// Shared call counter for a boxed [`ScriptedAnalyzer`].
#[derive(Clone, Default)]
pub struct CallCount(Arc<AtomicUsize>);

impl CallCount {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Analyzer that replays canned results; the last one repeats forever.
pub struct ScriptedAnalyzer {
    script: VecDeque<Result<Vec<Detection>, String>>,
    last: Vec<Detection>,
    calls: CallCount,
    delay: Option<Duration>,
}

impl ScriptedAnalyzer {
    fn with(script: Vec<Result<Vec<Detection>, String>>) -> Self {
        Self {
            script: script.into(),
            last: Vec::new(),
            calls: CallCount::default(),
            delay: None,
        }
    }

    pub fn empty() -> Self {
        Self::with(Vec::new())
    }

    pub fn always(detections: Vec<Detection>) -> Self {
        Self::with(vec![Ok(detections)])
    }

    pub fn sequence(results: Vec<Vec<Detection>>) -> Self {
        Self::with(results.into_iter().map(Ok).collect())
    }

    pub fn failing_first(n: usize, then: Vec<Vec<Detection>>) -> Self {
        let mut script: Vec<_> = (0..n).map(|_| Err("inference failed".to_string())).collect();
        script.extend(then.into_iter().map(Ok));
        Self::with(script)
    }

    /// Every analysis takes at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> CallCount {
        self.calls.clone()
    }
}

impl FaceAnalyzer for ScriptedAnalyzer {
    fn analyze(&mut self, _image: &RgbImage) -> Result<Vec<Detection>, AnalyzerError> {
        self.calls.0.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match self.script.pop_front() {
            Some(Ok(detections)) => {
                self.last = detections.clone();
                Ok(detections)
            }
            Some(Err(message)) => Err(DetectorError::InferenceFailed(message).into()),
            None => Ok(self.last.clone()),
        }
    }
}

/// A face at horizontal offset `x` whose embedding is `[x; 4]`.
pub fn face(x: f32) -> Detection {
    face_with(x, vec![x; 4])
}

pub fn face_with(x: f32, embedding: Vec<f32>) -> Detection {
    Detection {
        bbox: BoundingBox {
            x,
            y: 4.0,
            width: 20.0,
            height: 24.0,
            confidence: 0.9,
            landmarks: None,
        },
        embedding: Embedding::new(embedding),
    }
}

/// Attendance sink that keeps every record in memory with a durable cooldown.
pub struct RecordingSink {
    clock: Arc<ManualClock>,
    records: Mutex<Vec<AttendanceRecord>>,
}

impl RecordingSink {
    pub fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            records: Mutex::new(Vec::new()),
        })
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl AttendanceSink for RecordingSink {
    fn mark(
        &self,
        session_id: SessionId,
        identity_id: IdentityId,
        confidence: f32,
        cooldown_minutes: u32,
    ) -> Result<Option<AttendanceRecord>, SinkError> {
        let now = self.clock.now();
        let window_start = now - TimeDelta::minutes(cooldown_minutes as i64);
        let mut records = self.records.lock().unwrap();
        if records
            .iter()
            .any(|r| r.session_id == session_id && r.identity_id == identity_id && r.marked_at >= window_start)
        {
            return Ok(None);
        }
        let record = AttendanceRecord {
            id: records.len() as i64 + 1,
            session_id,
            identity_id,
            confidence,
            marked_at: now,
        };
        records.push(record.clone());
        Ok(Some(record))
    }
}

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc::now()))
}
