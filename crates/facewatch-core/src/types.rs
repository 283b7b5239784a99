use serde::{Deserialize, Serialize};

/// Label rendered for faces that did not clear the match threshold.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Face bounding box in pixel coordinates, ordered `(top, right, bottom, left)`
/// as produced by the external extractor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl FaceBox {
    pub fn new(top: f32, right: f32, bottom: f32, left: f32) -> Self {
        Self { top, right, bottom, left }
    }

    /// Multiply all four coordinates by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        self.scaled_xy(factor, factor)
    }

    /// Multiply horizontal coordinates by `fx` and vertical ones by `fy`.
    pub fn scaled_xy(&self, fx: f32, fy: f32) -> Self {
        Self {
            top: self.top * fy,
            right: self.right * fx,
            bottom: self.bottom * fy,
            left: self.left * fx,
        }
    }

    pub fn width(&self) -> f32 {
        self.right - self.left
    }

    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }
}

/// Face embedding vector (dimensionality fixed by the extractor, typically 128).
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

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}

/// A registered (label, embedding) pair. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownFace {
    pub label: String,
    pub embedding: Embedding,
}

/// Result of matching a query embedding against the known faces.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Label of the matched entry, `None` when nothing cleared the threshold.
    pub label: Option<String>,
    /// L2 distance to the nearest entry (`f32::INFINITY` for an empty gallery).
    pub distance: f32,
}

impl MatchResult {
    pub fn unknown(distance: f32) -> Self {
        Self { label: None, distance }
    }

    pub fn is_match(&self) -> bool {
        self.label.is_some()
    }

    /// Label as shown to the operator: the matched name or `"Unknown"`.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Raw extractor output for one face, in the coordinates of the image it saw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFace {
    pub face_box: FaceBox,
    pub embedding: Embedding,
}

/// One located face within a frame, with its resolved label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub face_box: FaceBox,
    pub embedding: Embedding,
    /// Matched label; `None` means "Unknown".
    pub label: Option<String>,
    pub distance: f32,
}

impl Detection {
    pub fn is_unknown(&self) -> bool {
        self.label.is_none()
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or(UNKNOWN_LABEL)
    }
}

/// Returns true if `label` is usable as a registered identity name.
pub(crate) fn is_registrable_label(label: &str) -> bool {
    let label = label.trim();
    !label.is_empty() && label != UNKNOWN_LABEL
}
