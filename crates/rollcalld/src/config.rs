use rollcall_hw::CameraSettings;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Settle delay after the camera starts streaming.
    pub camera_warmup: Duration,
    /// Square SCRFD input size; must be a multiple of 32.
    pub detection_size: usize,
    /// Raw L2 distance below which a face counts as recognised.
    pub recognition_threshold: f32,
    /// Run detection on every Nth frame.
    pub process_every: u64,
    /// Durable attendance cooldown enforced by the database.
    pub attendance_cooldown_minutes: u32,
    /// Offer recognised faces to the attendance gate.
    pub auto_mark: bool,
    pub jpeg_quality: u8,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Where enrollment photos are written.
    pub photo_dir: PathBuf,
    /// TrueType font for overlay text.
    pub font_path: PathBuf,
    pub recognition_addr: SocketAddr,
    pub preview_addr: SocketAddr,
    /// Register on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("ROLLCALL_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| rollcall_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            camera_width: env_parse("ROLLCALL_CAMERA_WIDTH", 640),
            camera_height: env_parse("ROLLCALL_CAMERA_HEIGHT", 480),
            camera_warmup: Duration::from_millis(env_parse("ROLLCALL_CAMERA_WARMUP_MS", 2000)),
            detection_size: env_parse("ROLLCALL_DETECTION_SIZE", 320),
            recognition_threshold: env_parse(
                "ROLLCALL_RECOGNITION_THRESHOLD",
                rollcall_core::matcher::DEFAULT_THRESHOLD,
            ),
            process_every: env_parse::<u64>("ROLLCALL_PROCESS_EVERY", 2).max(1),
            attendance_cooldown_minutes: env_parse(
                "ROLLCALL_ATTENDANCE_COOLDOWN_MINUTES",
                rollcall_core::attendance::DEFAULT_COOLDOWN_MINUTES,
            ),
            auto_mark: std::env::var("ROLLCALL_AUTO_MARK")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            jpeg_quality: env_parse::<u8>("ROLLCALL_JPEG_QUALITY", 85).clamp(1, 100),
            model_dir,
            photo_dir: data_dir.join("photos"),
            db_path,
            font_path: std::env::var("ROLLCALL_FONT_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf")),
            recognition_addr: env_parse("ROLLCALL_RECOGNITION_ADDR", SocketAddr::from(([127, 0, 0, 1], 8554))),
            preview_addr: env_parse("ROLLCALL_PREVIEW_ADDR", SocketAddr::from(([127, 0, 0, 1], 8555))),
            session_bus: std::env::var("ROLLCALL_SESSION_BUS")
                .map(|v| v == "1")
                .unwrap_or(false),
        }
    }

    pub fn camera_settings(&self) -> CameraSettings {
        CameraSettings {
            device_path: self.camera_device.clone(),
            width: self.camera_width,
            height: self.camera_height,
            warmup: self.camera_warmup,
            capture_timeout: Duration::from_secs(1),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
