//! rollcall-hw — Hardware abstraction for camera capture.
//!
//! Provides the `FrameSource` seam the streaming pipeline drives, a
//! V4L2 implementation of it, and pixel-format conversion to RGB.

pub mod camera;
pub mod frame;

pub use camera::{CameraError, CameraSettings, DeviceInfo, FrameSource, PixelFormat, V4l2Camera};
pub use frame::Frame;
