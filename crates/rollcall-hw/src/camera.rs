//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("device not started")]
    NotStarted,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Anything that can hand out camera frames.
///
/// `start`/`stop` are idempotent; `capture` must return within a bounded
/// time even when the device stalls.
pub trait FrameSource: Send {
    fn start(&mut self) -> Result<(), CameraError>;
    fn stop(&mut self);
    fn is_started(&self) -> bool;
    fn capture(&mut self) -> Result<Frame, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Packed 24-bit RGB.
    Rgb24,
    /// 8-bit grayscale.
    Grey,
}

/// Requested capture parameters.
#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    /// Settle delay after streaming starts, before the first frame counts.
    pub warmup: Duration,
    /// Upper bound on a single buffer dequeue.
    pub capture_timeout: Duration,
}

/// Streaming state that only exists between `start` and `stop`.
struct ActiveStream {
    // Declared before `device` so streaming is switched off before the handle closes.
    stream: MmapStream<'static>,
    _device: Device,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

/// V4L2 camera device handle. The device node is opened on `start`
/// and released on `stop`.
pub struct V4l2Camera {
    settings: CameraSettings,
    active: Option<ActiveStream>,
}

impl V4l2Camera {
    pub fn new(settings: CameraSettings) -> Self {
        Self {
            settings,
            active: None,
        }
    }

    pub fn device_path(&self) -> &str {
        &self.settings.device_path
    }

    fn open(&self) -> Result<ActiveStream, CameraError> {
        let device_path = self.settings.device_path.as_str();
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            "opened camera"
        );

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        // Ask for YUYV at the configured size; drivers that only speak RGB3
        // or GREY negotiate down to those.
        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = self.settings.width;
        fmt.height = self.settings.height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"RGB3") {
            PixelFormat::Rgb24
        } else if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, RGB3, or GREY)"
            )));
        };

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "negotiated format"
        );

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, 4).map_err(|e| {
            CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
        })?;
        stream.set_timeout(self.settings.capture_timeout);

        Ok(ActiveStream {
            stream,
            _device: device,
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for V4l2Camera {
    fn start(&mut self) -> Result<(), CameraError> {
        if self.active.is_some() {
            return Ok(());
        }
        let mut active = self.open()?;

        // Dequeue once so the driver actually starts streaming, then let
        // exposure settle before anything downstream sees a frame.
        if let Err(e) = active.stream.next() {
            tracing::debug!(error = %e, "first dequeue after stream-on failed");
        }
        std::thread::sleep(self.settings.warmup);

        tracing::info!(
            device = %self.settings.device_path,
            warmup_ms = self.settings.warmup.as_millis() as u64,
            "camera started"
        );
        self.active = Some(active);
        Ok(())
    }

    fn stop(&mut self) {
        if self.active.take().is_some() {
            tracing::info!(device = %self.settings.device_path, "camera stopped");
        }
    }

    fn is_started(&self) -> bool {
        self.active.is_some()
    }

    fn capture(&mut self) -> Result<Frame, CameraError> {
        let active = self.active.as_mut().ok_or(CameraError::NotStarted)?;
        let (width, height, pixel_format) = (active.width, active.height, active.pixel_format);

        let (buf, meta) = active
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        if buf.is_empty() {
            return Err(CameraError::CaptureFailed("driver returned an empty buffer".into()));
        }

        let image = match pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            PixelFormat::Rgb24 => frame::rgb24_to_rgb(buf, width, height),
            PixelFormat::Grey => frame::grey_to_rgb(buf, width, height),
        }
        .map_err(|e| CameraError::CaptureFailed(format!("{pixel_format:?} conversion failed: {e}")))?;

        Ok(Frame::new(image, meta.sequence))
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        self.stop();
    }
}
