use serde::{Deserialize, Serialize};

/// Database id of an enrolled person. Several embeddings may share one id.
pub type IdentityId = i64;

/// Label used for faces that did not match any known identity.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    /// Detector score in [0, 1].
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box; 0.0 for degenerate unions.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union > 0.0 {
            inter / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for the ArcFace w600k_r50 model).
///
/// Values are the raw model output, not L2-normalised: recognition
/// thresholds are tuned against unnormalised distances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean (L2) distance. Callers must check dimensions first.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// One enrolled embedding and the person it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownIdentity {
    pub identity_id: IdentityId,
    pub display_name: String,
    pub embedding: Embedding,
}

/// A face found in one processed frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

impl Detection {
    pub fn confidence(&self) -> f32 {
        self.bbox.confidence
    }
}

/// Outcome of matching one detection against the known set.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// `None` means the face is unknown.
    pub identity_id: Option<IdentityId>,
    pub display_name: String,
    /// Raw L2 distance to the closest known embedding, or the empty-set sentinel.
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self {
            identity_id: None,
            display_name: UNKNOWN_NAME.to_string(),
            distance,
        }
    }

    pub fn is_known(&self) -> bool {
        self.identity_id.is_some()
    }
}
