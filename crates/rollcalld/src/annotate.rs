//! Overlay drawing and JPEG encoding for streamed frames.

use ab_glyph::{FontVec, PxScale};
use image::codecs::jpeg::JpegEncoder;
use image::{ImageError, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use rollcall_core::quality::QualityBand;
use rollcall_core::BoundingBox;
use std::path::Path;
use std::time::{Duration, Instant};

pub const KNOWN: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNKNOWN: Rgb<u8> = Rgb([255, 0, 0]);
const FAIR: Rgb<u8> = Rgb([255, 165, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

const BOX_THICKNESS: i32 = 2;
const LABEL_BAR_HEIGHT: i32 = 35;
const LABEL_SCALE: f32 = 20.0;
const HEADER_SCALE: f32 = 22.0;

pub fn quality_color(band: QualityBand) -> Rgb<u8> {
    match band {
        QualityBand::Good => KNOWN,
        QualityBand::Ok => FAIR,
        QualityBand::Poor => UNKNOWN,
    }
}

/// Draws boxes and labels. Text is skipped when no font is loaded.
pub struct Overlay {
    font: Option<FontVec>,
}

impl Overlay {
    /// Load the label font. A missing or unreadable font disables text only.
    pub fn load(font_path: &Path) -> Self {
        let font = std::fs::read(font_path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| FontVec::try_from_vec(bytes).map_err(|e| e.to_string()));
        match font {
            Ok(font) => {
                tracing::info!(path = %font_path.display(), "overlay font loaded");
                Self { font: Some(font) }
            }
            Err(e) => {
                tracing::warn!(
                    path = %font_path.display(),
                    error = %e,
                    "overlay font unavailable; drawing boxes without text"
                );
                Self::boxes_only()
            }
        }
    }

    pub fn boxes_only() -> Self {
        Self { font: None }
    }

    pub fn has_text(&self) -> bool {
        self.font.is_some()
    }

    /// Face box with a filled label bar sitting on its top edge.
    pub fn labelled_box(&self, image: &mut RgbImage, bbox: &BoundingBox, label: &str, color: Rgb<u8>) {
        let Some(rect) = clip(image, bbox.x, bbox.y, bbox.width, bbox.height) else {
            return;
        };
        for inset in 0..BOX_THICKNESS {
            if let Some(inner) = shrink(rect, inset) {
                draw_hollow_rect_mut(image, inner, color);
            }
        }

        let bar_top = (rect.top() - LABEL_BAR_HEIGHT).max(0);
        let bar_height = (rect.top() - bar_top) as u32;
        if bar_height > 0 {
            draw_filled_rect_mut(image, Rect::at(rect.left(), bar_top).of_size(rect.width(), bar_height), color);
        }
        self.text(image, rect.left() + 6, bar_top + 8, LABEL_SCALE, WHITE, label);
    }

    /// Recognition overlay for one matched face.
    pub fn match_box(&self, image: &mut RgbImage, bbox: &BoundingBox, name: &str, distance: f32, known: bool) {
        let color = if known { KNOWN } else { UNKNOWN };
        self.labelled_box(image, bbox, &format!("{name} (d:{distance:.2})"), color);
    }

    /// Preview overlay for one face graded by capture quality.
    pub fn quality_box(&self, image: &mut RgbImage, bbox: &BoundingBox, score: f32) {
        let band = QualityBand::from_score(score);
        self.labelled_box(image, bbox, &format!("{} ({score:.2})", band.label()), quality_color(band));
    }

    /// Recognition header: threshold top-left, FPS top-right.
    pub fn recognition_header(&self, image: &mut RgbImage, threshold: f32, fps: f32) {
        self.text(image, 10, 10, HEADER_SCALE, WHITE, &format!("Threshold: {threshold}"));
        let fps_x = image.width() as i32 - 150;
        self.text(image, fps_x.max(0), 10, HEADER_SCALE, KNOWN, &format!("FPS: {fps:.1}"));
    }

    /// Preview header: face count top-left, instruction at the bottom.
    pub fn preview_header(&self, image: &mut RgbImage, faces: usize) {
        self.text(image, 10, 10, HEADER_SCALE, WHITE, &format!("Faces detected: {faces}"));
        let bottom = image.height() as i32 - 40;
        self.text(image, 10, bottom.max(0), HEADER_SCALE, WHITE, "Position your face in the frame");
    }

    fn text(&self, image: &mut RgbImage, x: i32, y: i32, scale: f32, color: Rgb<u8>, text: &str) {
        if let Some(font) = &self.font {
            draw_text_mut(image, color, x, y, PxScale::from(scale), font, text);
        }
    }
}

/// Pixel rectangle for a float box, clipped to the image. `None` if nothing is visible.
fn clip(image: &RgbImage, x: f32, y: f32, width: f32, height: f32) -> Option<Rect> {
    let (w, h) = (image.width() as i32, image.height() as i32);
    let left = (x.round() as i32).clamp(0, w);
    let top = (y.round() as i32).clamp(0, h);
    let right = ((x + width).round() as i32).clamp(0, w);
    let bottom = ((y + height).round() as i32).clamp(0, h);
    if right <= left || bottom <= top {
        return None;
    }
    Some(Rect::at(left, top).of_size((right - left) as u32, (bottom - top) as u32))
}

fn shrink(rect: Rect, by: i32) -> Option<Rect> {
    let width = rect.width() as i32 - 2 * by;
    let height = rect.height() as i32 - 2 * by;
    if width <= 0 || height <= 0 {
        return None;
    }
    Some(Rect::at(rect.left() + by, rect.top() + by).of_size(width as u32, height as u32))
}

/// Encode an RGB image as baseline JPEG at `quality` (1-100).
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, ImageError> {
    let mut buf = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut buf, quality).encode_image(image)?;
    Ok(buf)
}

/// Frames-per-second over rolling windows of at least one second.
#[derive(Debug)]
pub struct FpsMeter {
    window_start: Instant,
    frames: u32,
    fps: f32,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            frames: 0,
            fps: 0.0,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Count one frame and return the current estimate.
    pub fn tick(&mut self) -> f32 {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> f32 {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed > Duration::from_secs(1) {
            self.fps = self.frames as f32 / elapsed.as_secs_f32();
            self.frames = 0;
            self.window_start = now;
        }
        self.fps
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}
