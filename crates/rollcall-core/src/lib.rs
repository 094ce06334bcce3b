//! rollcall-core — Face matching and attendance bookkeeping.
//!
//! Holds the known-face cache, the L2 matcher, the attendance dedup gate,
//! and the face-analysis capability (SCRFD + ArcFace via ONNX Runtime).

pub mod alignment;
pub mod analyzer;
pub mod attendance;
pub mod clock;
pub mod detector;
pub mod matcher;
pub mod quality;
pub mod recognizer;
pub mod store;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, InsightFaceAnalyzer};
pub use attendance::{AttendanceGate, AttendanceRecord, AttendanceSink, Offer, SessionId, SinkError, Suppression};
pub use clock::{Clock, ManualClock, SystemClock};
pub use matcher::{L2Matcher, MatchError, Matcher};
pub use store::{EmbeddingRepository, EmbeddingStore, Snapshot, StoreError};
pub use types::{BoundingBox, Detection, Embedding, IdentityId, KnownIdentity, MatchResult};

use std::path::PathBuf;

/// Default model directory (`$XDG_DATA_HOME/rollcall/models`).
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall/models")
}
