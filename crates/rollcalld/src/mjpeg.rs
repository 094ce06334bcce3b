//! multipart/x-mixed-replace framing for MJPEG streams.

pub const CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";

const PART_HEAD: &[u8] = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n";

/// Wrap one JPEG image as a multipart unit:
/// `--frame\r\nContent-Type: image/jpeg\r\n\r\n<jpeg>\r\n`.
pub fn frame_unit(jpeg: &[u8]) -> Vec<u8> {
    let mut unit = Vec::with_capacity(PART_HEAD.len() + jpeg.len() + 2);
    unit.extend_from_slice(PART_HEAD);
    unit.extend_from_slice(jpeg);
    unit.extend_from_slice(b"\r\n");
    unit
}
